//! Group-vs-rest differential expression tables.
//!
//! [`GroupContrastEngine`] runs the full pipeline for a single group:
//! subsampling, model fit, annotation join, confidence-interval orientation,
//! ordering, FDR correction and ranking. The [`orchestrator`] runs it over
//! every group of a dataset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ContrastParams;
use crate::dataset::subsample::CellSubsampler;
use crate::dataset::{DatasetKind, ExpressionDataset};
use crate::error::{ContrastError, Result};
use crate::testing::correction::benjamini_hochberg_correction;
use crate::testing::effect::orient_interval;
use crate::testing::inference::{ContrastInput, ContrastModel};

pub mod orchestrator;

pub use orchestrator::{Capabilities, DatasetContrastOrchestrator};

/// One gene's result for one group of one dataset.
///
/// The serialized field names are the stable table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeRow {
    pub gene_id: String,
    pub pval: f64,
    /// 0 when the model could not estimate a fold change
    #[serde(rename = "log2FC")]
    pub log2_fc: f64,
    pub ci_inner: f64,
    pub ci_outer: f64,
    pub fdr: f64,
    pub group: String,
    pub sig: bool,
    pub sig_up: bool,
    /// Number of genes tested for this group
    pub gene_count: usize,
    /// 1-based position after ordering by `ci_inner`, descending
    pub rank: usize,
    /// `rank / gene_count`
    pub rescaled_rank: f64,
    pub dataset: String,
    /// Pass-through gene annotation columns
    #[serde(flatten)]
    pub annotations: BTreeMap<String, String>,
}

/// Differential expression results of every contrasted group of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeTable {
    pub dataset: String,
    /// Every group level of the dataset, in level order, whether contrasted or not
    pub group_levels: Vec<String>,
    pub annotation_columns: Vec<String>,
    pub rows: Vec<DeRow>,
}

impl DeTable {
    pub fn new(dataset: &str, group_levels: Vec<String>, annotation_columns: Vec<String>) -> Self {
        DeTable {
            dataset: dataset.to_string(),
            group_levels,
            annotation_columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows_for_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a DeRow> + 'a {
        self.rows.iter().filter(move |row| row.group == group)
    }

    /// Groups that have rows, in level order.
    pub fn groups(&self) -> Vec<&str> {
        self.group_levels
            .iter()
            .map(|g| g.as_str())
            .filter(|g| self.rows.iter().any(|row| row.group == *g))
            .collect()
    }
}

/// Runs the contrast of one group against all other cells of a dataset.
#[derive(Debug)]
pub struct GroupContrastEngine<'a> {
    dataset: &'a ExpressionDataset,
    dataset_name: &'a str,
    params: &'a ContrastParams,
    model: ContrastModel,
    subsampler: CellSubsampler,
}

impl<'a> GroupContrastEngine<'a> {
    /// Check parameters and dataset inputs; no model is fitted here.
    ///
    /// Single-cell datasets must already carry the detection-rate covariate,
    /// computed on the complete dataset.
    pub fn new(
        dataset: &'a ExpressionDataset,
        dataset_name: &'a str,
        params: &'a ContrastParams,
    ) -> Result<Self> {
        params.validate()?;
        let model = ContrastModel::for_kind(dataset.kind(), params);
        model.check_inputs(dataset)?;
        if dataset.kind() == DatasetKind::SingleCell && dataset.detection_rate().is_none() {
            return Err(ContrastError::MissingColumn {
                column: "detection_rate".to_string(),
                context: "compute it on the full dataset before contrasting groups".to_string(),
            });
        }
        Ok(GroupContrastEngine {
            dataset,
            dataset_name,
            params,
            model,
            subsampler: CellSubsampler::new(params.seed),
        })
    }

    pub fn model(&self) -> &ContrastModel {
        &self.model
    }

    /// Contrast the group with the given label.
    pub fn contrast_group(&self, group: &str) -> Result<Vec<DeRow>> {
        let groups = self.dataset.groups();
        let level = groups
            .level_index(group)
            .ok_or_else(|| ContrastError::UnknownGroup {
                groups: vec![group.to_string()],
                available: groups.levels().to_vec(),
            })?;
        self.contrast_level(level)
    }

    /// Contrast the group with the given level index.
    pub fn contrast_level(&self, level: usize) -> Result<Vec<DeRow>> {
        let groups = self.dataset.groups();
        let group = groups.levels().get(level).ok_or_else(|| ContrastError::UnknownGroup {
            groups: vec![format!("#{}", level)],
            available: groups.levels().to_vec(),
        })?;

        let cells = self.subsampler.group_vs_rest(
            groups,
            level,
            self.params.n_group,
            self.params.other_cap(),
        );
        let contrasts = self
            .model
            .fit(&ContrastInput::new(self.dataset, level, &cells))?;
        debug!(
            group = group.as_str(),
            model = self.model.name(),
            cells = cells.len(),
            "model fitted"
        );

        let gene_index = self.dataset.gene_index();
        let annotations = self.dataset.gene_annotations();
        let mut rows = contrasts
            .into_iter()
            .map(|contrast| {
                let gene = *gene_index.get(contrast.gene_id.as_str()).ok_or_else(|| {
                    ContrastError::InvalidInput(format!(
                        "model returned unknown gene '{}'",
                        contrast.gene_id
                    ))
                })?;
                let interval =
                    orient_interval(contrast.log2_fold_change, contrast.ci_hi, contrast.ci_lo);
                Ok(DeRow {
                    gene_id: contrast.gene_id,
                    pval: contrast.p_value,
                    log2_fc: contrast.log2_fold_change.unwrap_or(0.0),
                    ci_inner: interval.inner,
                    ci_outer: interval.outer,
                    fdr: 1.0,
                    group: group.clone(),
                    sig: false,
                    sig_up: false,
                    gene_count: 0,
                    rank: 0,
                    rescaled_rank: 0.0,
                    dataset: self.dataset_name.to_string(),
                    annotations: annotations
                        .iter()
                        .map(|(column, values)| (column.clone(), values[gene].clone()))
                        .collect(),
                })
            })
            .collect::<Result<Vec<DeRow>>>()?;

        rows.sort_by(|a, b| b.ci_inner.total_cmp(&a.ci_inner));
        let p_values: Vec<f64> = rows.iter().map(|row| row.pval).collect();
        let fdr = benjamini_hochberg_correction(&p_values)?;

        let gene_count = rows.len();
        let threshold = self.params.sig_threshold;
        for (i, (row, q)) in rows.iter_mut().zip(fdr).enumerate() {
            row.fdr = q;
            row.gene_count = gene_count;
            row.rank = i + 1;
            row.rescaled_rank = (i + 1) as f64 / gene_count as f64;
            row.sig = q <= threshold;
            row.sig_up = row.sig && row.log2_fc > 0.0;
        }

        info!(
            dataset = self.dataset_name,
            group = group.as_str(),
            genes = gene_count,
            significant = rows.iter().filter(|r| r.sig).count(),
            up = rows.iter().filter(|r| r.sig_up).count(),
            "contrasted group against rest"
        );
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CountsLayer, GroupLabels};
    use ndarray::Array2;
    use std::sync::Arc;

    fn microarray() -> ExpressionDataset {
        // g0 up in a, g1 down in a, g2 and g3 noise
        let values = Array2::from_shape_vec(
            (4, 8),
            vec![
                9.0, 9.2, 8.8, 9.1, 5.0, 5.2, 4.9, 5.1, //
                2.0, 2.1, 1.9, 2.2, 6.0, 6.1, 5.8, 6.2, //
                4.0, 4.3, 3.9, 4.1, 4.2, 3.8, 4.0, 4.1, //
                7.1, 6.9, 7.0, 7.2, 7.0, 6.8, 7.1, 7.0,
            ],
        )
        .unwrap();
        ExpressionDataset::new(
            DatasetKind::Microarray,
            vec![CountsLayer::named("counts", Arc::new(values))],
            &["g0", "g1", "g2", "g3"],
            GroupLabels::from_labels(&["a", "a", "a", "a", "b", "b", "b", "b"]),
        )
        .unwrap()
        .with_gene_annotation("symbol", &["S0", "S1", "S2", "S3"])
        .unwrap()
    }

    #[test]
    fn rows_are_ranked_by_inner_interval() {
        let ds = microarray();
        let params = ContrastParams::default();
        let engine = GroupContrastEngine::new(&ds, "arrays", &params).unwrap();
        let rows = engine.contrast_group("a").unwrap();

        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].gene_id, "g0");
        assert_eq!(rows[3].gene_id, "g1");
        assert!(rows.windows(2).all(|w| w[0].ci_inner >= w[1].ci_inner));
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.rank, i + 1);
            assert_eq!(row.gene_count, 4);
            assert_eq!(row.rescaled_rank, (i + 1) as f64 / 4.0);
            assert_eq!(row.group, "a");
            assert_eq!(row.dataset, "arrays");
        }
        assert!(rows[0].sig_up);
        assert!(rows[3].sig && !rows[3].sig_up);
        assert_eq!(rows[0].annotations["symbol"], "S0");
        // down-regulated gene: inner bound is the upper one
        assert!(rows[3].ci_inner > rows[3].ci_outer);
    }

    #[test]
    fn unknown_group_is_rejected() {
        let ds = microarray();
        let params = ContrastParams::default();
        let engine = GroupContrastEngine::new(&ds, "arrays", &params).unwrap();
        match engine.contrast_group("z").unwrap_err() {
            ContrastError::UnknownGroup { groups, available } => {
                assert_eq!(groups, vec!["z".to_string()]);
                assert_eq!(available, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn single_cell_needs_detection_rate() {
        let counts = Array2::from_elem((2, 4), 1.0);
        let ds = ExpressionDataset::new(
            DatasetKind::SingleCell,
            vec![CountsLayer::named("counts", Arc::new(counts))],
            &["g0", "g1"],
            GroupLabels::from_labels(&["a", "a", "b", "b"]),
        )
        .unwrap();
        let params = ContrastParams::default();
        let err = GroupContrastEngine::new(&ds, "cells", &params).unwrap_err();
        assert!(matches!(err, ContrastError::MissingColumn { .. }));
    }

    #[test]
    fn serialized_columns_use_table_names() {
        let ds = microarray();
        let params = ContrastParams::default();
        let rows = GroupContrastEngine::new(&ds, "arrays", &params)
            .unwrap()
            .contrast_group("b")
            .unwrap();
        let json = serde_json::to_value(&rows[0]).unwrap();
        for column in [
            "gene_id",
            "pval",
            "log2FC",
            "ci_inner",
            "ci_outer",
            "fdr",
            "group",
            "sig",
            "sig_up",
            "gene_count",
            "rank",
            "rescaled_rank",
            "dataset",
            "symbol",
        ] {
            assert!(json.get(column).is_some(), "missing column {column}");
        }
    }
}
