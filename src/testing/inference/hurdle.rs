//! Two-part hurdle contrast for sparse single-cell counts.
//!
//! Every gene is modelled as a discrete "is it expressed" component (penalized
//! logistic regression) and a continuous "how much, given expressed" component
//! (least squares on log2 values of the expressed cells). Both use the group
//! indicator and the detection-rate covariate as predictors. Significance comes
//! from a likelihood-ratio test of the group term in the discrete component,
//! the fold change and its interval from the continuous component.

use tracing::{debug, warn};

use crate::config::HurdleSettings;
use crate::error::{ContrastError, Result};
use crate::testing::GeneContrast;
use crate::testing::inference::ContrastInput;
use crate::testing::inference::glm::{
    GROUP_COLUMN, LeastSquares, aliased_with_group, group_design, penalized_logistic,
};
use crate::testing::inference::moderation::squeeze_variances;
use crate::testing::utils::{chi_squared_p_value, t_quantile};

// Gaussian prior scales of the discrete component: weak on the intercept,
// moderate on the slopes.
const INTERCEPT_PRIOR_SCALE: f64 = 10.0;
const SLOPE_PRIOR_SCALE: f64 = 2.5;

#[derive(Debug, Clone, PartialEq)]
pub struct HurdleContrast {
    pub settings: HurdleSettings,
    pub confidence: f64,
}

struct ContinuousFit {
    coefficient: f64,
    stdev_unscaled: f64,
    variance: f64,
    df: f64,
}

impl HurdleContrast {
    pub fn new(settings: HurdleSettings, confidence: f64) -> Self {
        HurdleContrast {
            settings,
            confidence,
        }
    }

    pub fn fit(&self, input: &ContrastInput<'_>) -> Result<Vec<GeneContrast>> {
        let dataset = input.dataset;
        let group_name = input.group_name();
        let counts = dataset.counts()?;
        let cdr_full = dataset
            .detection_rate()
            .ok_or_else(|| ContrastError::MissingColumn {
                column: "detection_rate".to_string(),
                context: "the hurdle contrast needs the detection-rate covariate computed on the full dataset"
                    .to_string(),
            })?;

        let (membership, cdr) = self.observation_covariates(input, cdr_full)?;
        let offset = self.settings.offset;
        let n_real = input.cells.len();

        let full = group_design(&membership, &[cdr.as_slice()])
            .ok_or_else(|| ContrastError::model_fit(group_name, "group indicator is constant"))?;
        let reduced = full.clone().remove_column(GROUP_COLUMN);
        let precision_full = prior_precision(full.ncols());
        let mut precision_reduced = precision_full.clone();
        precision_reduced.remove(GROUP_COLUMN);

        let mut p_values = Vec::with_capacity(dataset.n_genes());
        let mut continuous = Vec::with_capacity(dataset.n_genes());
        let mut not_converged = 0usize;

        for gene in 0..dataset.n_genes() {
            let raw = counts.gene_values(gene, input.cells);
            if raw.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(ContrastError::model_fit(
                    group_name,
                    format!(
                        "gene '{}' has negative or non-finite counts",
                        dataset.gene_ids()[gene]
                    ),
                ));
            }

            // real cells, then the two all-expressed pseudo-cells
            let mut expressed: Vec<f64> = raw.iter().map(|&v| if v > 0.0 { 1.0 } else { 0.0 }).collect();
            expressed.extend([1.0, 1.0]);
            let mut level = counts.log2_gene_values(gene, input.cells, offset);
            level.extend([offset, offset]);

            let fit_full = penalized_logistic(
                &full,
                &expressed,
                &precision_full,
                self.settings.max_iter,
                self.settings.tolerance,
            );
            let fit_reduced = penalized_logistic(
                &reduced,
                &expressed,
                &precision_reduced,
                self.settings.max_iter,
                self.settings.tolerance,
            );
            let (fit_full, fit_reduced) = match (fit_full, fit_reduced) {
                (Some(f), Some(r)) => (f, r),
                _ => {
                    return Err(ContrastError::model_fit(
                        group_name,
                        "discrete component has a singular penalized system",
                    ));
                }
            };
            if !fit_full.converged || !fit_reduced.converged {
                not_converged += 1;
            }
            let lrt = (fit_reduced.deviance - fit_full.deviance).max(0.0);
            p_values.push(chi_squared_p_value(lrt, 1.0));

            let keep: Vec<usize> = (0..n_real + 2).filter(|&i| expressed[i] > 0.0).collect();
            continuous.push(fit_continuous(&keep, &level, &membership, &cdr));
        }

        if not_converged > 0 {
            warn!(
                group = group_name,
                genes = not_converged,
                "discrete component did not converge for some genes, keeping last iterate"
            );
        }

        let (variances, dfs): (Vec<f64>, Vec<f64>) = continuous
            .iter()
            .flatten()
            .map(|fit| (fit.variance, fit.df))
            .unzip();
        let (var_post, df_total) = if self.settings.moderate_variance {
            let squeezed = squeeze_variances(&variances, &dfs);
            if let Some(prior) = squeezed.prior {
                debug!(
                    group = group_name,
                    df_prior = prior.df_prior,
                    var_prior = prior.var_prior,
                    "moderated continuous-component variances"
                );
            }
            (squeezed.var_post, squeezed.df_total)
        } else {
            (variances, dfs)
        };

        let quantile = (1.0 + self.confidence) / 2.0;
        let mut moderated = var_post.into_iter().zip(df_total);
        let results = dataset
            .gene_ids()
            .iter()
            .zip(p_values)
            .zip(continuous)
            .map(|((gene_id, p_value), fit)| match fit {
                Some(fit) => {
                    let (var, df) = moderated.next().unwrap_or((fit.variance, fit.df));
                    match t_quantile(quantile, df) {
                        Some(q) => GeneContrast::estimated(
                            gene_id,
                            p_value,
                            fit.coefficient,
                            q * var.sqrt() * fit.stdev_unscaled,
                        ),
                        None => GeneContrast::undefined(gene_id, p_value),
                    }
                }
                None => GeneContrast::undefined(gene_id, p_value),
            })
            .collect();

        debug!(
            group = group_name,
            cells = n_real,
            genes = dataset.n_genes(),
            "fitted hurdle contrast"
        );
        Ok(results)
    }

    /// Group membership and detection-rate covariate of every observation,
    /// including the two pseudo-cells.
    fn observation_covariates(
        &self,
        input: &ContrastInput<'_>,
        cdr_full: &[f64],
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let codes = input.dataset.groups().codes();
        let mut membership: Vec<f64> = input
            .cells
            .iter()
            .map(|&c| if codes[c] == input.group { 1.0 } else { 0.0 })
            .collect();
        let n_in = membership.iter().filter(|&&m| m > 0.0).count();
        if n_in == 0 || n_in == membership.len() {
            return Err(ContrastError::model_fit(
                input.group_name(),
                format!(
                    "need cells both in and outside the group, got {} of {}",
                    n_in,
                    membership.len()
                ),
            ));
        }
        let mut cdr: Vec<f64> = input.cells.iter().map(|&c| cdr_full[c]).collect();
        // each pseudo-cell sits at the mean covariate of its own arm
        let arm_mean = |arm: f64| {
            let (sum, n) = membership
                .iter()
                .zip(&cdr)
                .filter(|&(&m, _)| m == arm)
                .fold((0.0, 0usize), |(s, n), (_, &c)| (s + c, n + 1));
            sum / n as f64
        };
        let pseudo = [arm_mean(1.0), arm_mean(0.0)];
        membership.extend([1.0, 0.0]);
        cdr.extend(pseudo);
        Ok((membership, cdr))
    }
}

fn prior_precision(n_coef: usize) -> Vec<f64> {
    (0..n_coef)
        .map(|j| {
            let scale = if j == 0 {
                INTERCEPT_PRIOR_SCALE
            } else {
                SLOPE_PRIOR_SCALE
            };
            1.0 / (scale * scale)
        })
        .collect()
}

fn fit_continuous(
    keep: &[usize],
    level: &[f64],
    membership: &[f64],
    cdr: &[f64],
) -> Option<ContinuousFit> {
    let y: Vec<f64> = keep.iter().map(|&i| level[i]).collect();
    let group: Vec<f64> = keep.iter().map(|&i| membership[i]).collect();
    let covariate: Vec<f64> = keep.iter().map(|&i| cdr[i]).collect();
    let with_covariate = [covariate.as_slice()];
    let covariates: &[&[f64]] = if aliased_with_group(&group, &covariate) {
        &[]
    } else {
        &with_covariate
    };

    let ls = LeastSquares::new(group_design(&group, covariates)?)?;
    let fit = ls.fit(&y);
    if fit.df_residual == 0 {
        return None;
    }
    let df = fit.df_residual as f64;
    Some(ContinuousFit {
        coefficient: fit.coefficients[GROUP_COLUMN],
        stdev_unscaled: ls.stdev_unscaled(GROUP_COLUMN),
        variance: fit.rss / df,
        df,
    })
}
