//! Moderated linear model for normalized, dense expression values.
//!
//! All genes share one design `[intercept, group, batch...]`, so the normal
//! equations are factorized once per split. Residual variances are moderated
//! across genes before computing t statistics and confidence intervals.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{ContrastError, Result};
use crate::dataset::ExpressionDataset;
use crate::testing::GeneContrast;
use crate::testing::inference::ContrastInput;
use crate::testing::inference::glm::{GROUP_COLUMN, LeastSquares, group_design};
use crate::testing::inference::moderation::squeeze_variances;
use crate::testing::utils::{t_quantile, t_test_p_value};

#[derive(Debug, Clone, PartialEq)]
pub struct LinearContrast {
    /// Per-cell metadata column holding a batch label, if any
    pub batch_column: Option<String>,
    pub confidence: f64,
}

impl LinearContrast {
    pub fn new(batch_column: Option<String>, confidence: f64) -> Self {
        LinearContrast {
            batch_column,
            confidence,
        }
    }

    pub(crate) fn check_inputs(&self, dataset: &ExpressionDataset) -> Result<()> {
        self.batch_labels(dataset).map(|_| ())
    }

    fn batch_labels<'d>(&self, dataset: &'d ExpressionDataset) -> Result<Option<&'d [String]>> {
        match &self.batch_column {
            None => Ok(None),
            Some(column) => dataset
                .cell_metadata(column)
                .map(Some)
                .ok_or_else(|| ContrastError::MissingColumn {
                    column: column.clone(),
                    context: "batch covariate of the linear contrast".to_string(),
                }),
        }
    }

    pub fn fit(&self, input: &ContrastInput<'_>) -> Result<Vec<GeneContrast>> {
        let dataset = input.dataset;
        let group_name = input.group_name();
        let values = dataset.counts()?;
        let codes = dataset.groups().codes();

        let membership: Vec<f64> = input
            .cells
            .iter()
            .map(|&c| if codes[c] == input.group { 1.0 } else { 0.0 })
            .collect();
        let n_in = membership.iter().filter(|&&m| m > 0.0).count();
        if n_in == 0 || n_in == membership.len() {
            return Err(ContrastError::model_fit(
                group_name,
                format!(
                    "need cells both in and outside the group, got {} of {}",
                    n_in,
                    membership.len()
                ),
            ));
        }

        let batch = match self.batch_labels(dataset)? {
            Some(labels) => batch_indicators(labels, input.cells),
            None => Vec::new(),
        };
        let batch_refs: Vec<&[f64]> = batch.iter().map(|c| c.as_slice()).collect();
        let design = group_design(&membership, &batch_refs)
            .ok_or_else(|| ContrastError::model_fit(group_name, "group indicator is constant"))?;
        let ls = LeastSquares::new(design).ok_or_else(|| {
            ContrastError::model_fit(
                group_name,
                "design is rank deficient; the batch covariate is confounded with the group",
            )
        })?;
        if ls.n_obs() <= ls.n_coef() {
            return Err(ContrastError::model_fit(
                group_name,
                format!(
                    "no residual degrees of freedom ({} cells, {} coefficients)",
                    ls.n_obs(),
                    ls.n_coef()
                ),
            ));
        }
        let df = (ls.n_obs() - ls.n_coef()) as f64;
        let stdev_unscaled = ls.stdev_unscaled(GROUP_COLUMN);

        let mut coefficients = Vec::with_capacity(dataset.n_genes());
        let mut variances = Vec::with_capacity(dataset.n_genes());
        for gene in 0..dataset.n_genes() {
            let y = values.gene_values(gene, input.cells);
            if y.iter().any(|v| !v.is_finite()) {
                return Err(ContrastError::model_fit(
                    group_name,
                    format!("gene '{}' has non-finite values", dataset.gene_ids()[gene]),
                ));
            }
            let fit = ls.fit(&y);
            coefficients.push(fit.coefficients[GROUP_COLUMN]);
            variances.push(fit.rss / df);
        }

        let moderated = squeeze_variances(&variances, &vec![df; variances.len()]);
        if let Some(prior) = moderated.prior {
            debug!(
                group = group_name,
                df_prior = prior.df_prior,
                var_prior = prior.var_prior,
                "moderated residual variances"
            );
        }

        let quantile = (1.0 + self.confidence) / 2.0;
        Ok(dataset
            .gene_ids()
            .iter()
            .zip(coefficients)
            .zip(moderated.var_post.iter().zip(&moderated.df_total))
            .map(|((gene_id, beta), (&var, &df_total))| {
                let se = var.sqrt() * stdev_unscaled;
                let p_value = if se > 0.0 {
                    t_test_p_value(beta / se, df_total)
                } else if beta == 0.0 {
                    1.0
                } else {
                    0.0
                };
                let margin = t_quantile(quantile, df_total).map_or(0.0, |q| q * se);
                GeneContrast::estimated(gene_id, p_value, beta, margin)
            })
            .collect())
    }
}

/// One-hot indicators of every batch level but the first, over the kept cells.
fn batch_indicators(labels: &[String], cells: &[usize]) -> Vec<Vec<f64>> {
    let levels: BTreeSet<&str> = cells.iter().map(|&c| labels[c].as_str()).collect();
    levels
        .into_iter()
        .skip(1)
        .map(|level| {
            cells
                .iter()
                .map(|&c| if labels[c] == level { 1.0 } else { 0.0 })
                .collect()
        })
        .collect()
}
