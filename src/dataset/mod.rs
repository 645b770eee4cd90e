//! Expression datasets: counts layers, per-cell group labels and per-gene annotation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ContrastError, Result};

pub mod counts;
pub mod subsample;

pub use counts::CountsView;
pub use subsample::CellSubsampler;

/// Name of the layer picked when a dataset carries more than one.
pub const COUNTS_LAYER: &str = "counts";

/// Result-table column names that gene annotations may not use.
pub const RESERVED_ANNOTATION_NAMES: &[&str] = &[
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
    "test_group",
    "test_dataset",
];

/// Which statistical back-end a dataset is analysed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Sparse, non-negative counts from single cells (hurdle model).
    SingleCell,
    /// Dense, already log-transformed values from purified samples (moderated linear model).
    Microarray,
}

/// Categorical group assignment of every cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLabels {
    levels: Vec<String>,
    codes: Vec<usize>,
}

impl GroupLabels {
    /// Build labels whose levels are the sorted, unique label values.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut levels: Vec<String> = labels.iter().map(|l| l.as_ref().to_string()).collect();
        levels.sort();
        levels.dedup();
        let lookup: HashMap<&str, usize> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();
        let codes = labels.iter().map(|l| lookup[l.as_ref()]).collect();
        GroupLabels { levels, codes }
    }

    /// Build labels against a fixed level set. Levels may have no cells.
    pub fn with_levels<S: AsRef<str>, L: AsRef<str>>(labels: &[S], levels: &[L]) -> Result<Self> {
        let levels: Vec<String> = levels.iter().map(|l| l.as_ref().to_string()).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        if let Some(dup) = levels.iter().find(|l| !seen.insert(l.as_str())) {
            return Err(ContrastError::InvalidInput(format!(
                "duplicate group level '{}'",
                dup
            )));
        }
        let lookup: HashMap<&str, usize> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();

        let mut unknown: Vec<String> = Vec::new();
        let mut codes = Vec::with_capacity(labels.len());
        for label in labels {
            let label: &str = label.as_ref();
            match lookup.get(label) {
                Some(&code) => codes.push(code),
                None => {
                    if !unknown.iter().any(|u| u == label) {
                        unknown.push(label.to_string());
                    }
                }
            }
        }
        if !unknown.is_empty() {
            return Err(ContrastError::UnknownGroup {
                groups: unknown,
                available: levels,
            });
        }
        Ok(GroupLabels { levels, codes })
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn level_index(&self, name: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == name)
    }

    pub fn label(&self, cell: usize) -> &str {
        &self.levels[self.codes[cell]]
    }

    /// Indices of the cells in `level`, in cell order.
    pub fn cells_in(&self, level: usize) -> Vec<usize> {
        self.codes
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| if c == level { Some(i) } else { None })
            .collect()
    }

    /// Number of cells per level, indexed like [`levels`](Self::levels).
    pub fn level_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.levels.len()];
        for &c in &self.codes {
            sizes[c] += 1;
        }
        sizes
    }

    /// Levels that have at least one cell.
    pub fn present_levels(&self) -> Vec<usize> {
        self.level_sizes()
            .iter()
            .enumerate()
            .filter_map(|(i, &n)| if n > 0 { Some(i) } else { None })
            .collect()
    }

    /// Resolve level names to indices, reporting every name that does not match.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>> {
        let mut indices = Vec::with_capacity(names.len());
        let mut unknown = Vec::new();
        for name in names {
            match self.level_index(name.as_ref()) {
                Some(i) => indices.push(i),
                None => unknown.push(name.as_ref().to_string()),
            }
        }
        if !unknown.is_empty() {
            return Err(ContrastError::UnknownGroup {
                groups: unknown,
                available: self.levels.clone(),
            });
        }
        Ok(indices)
    }

    /// Labels of the given cells; the level set is kept unchanged.
    pub fn select(&self, cells: &[usize]) -> GroupLabels {
        GroupLabels {
            levels: self.levels.clone(),
            codes: cells.iter().map(|&c| self.codes[c]).collect(),
        }
    }
}

/// One expression matrix of a dataset, optionally named.
#[derive(Clone)]
pub struct CountsLayer {
    pub name: Option<String>,
    pub matrix: Arc<dyn CountsView>,
}

impl CountsLayer {
    pub fn named(name: &str, matrix: Arc<dyn CountsView>) -> Self {
        CountsLayer {
            name: Some(name.to_string()),
            matrix,
        }
    }

    pub fn unnamed(matrix: Arc<dyn CountsView>) -> Self {
        CountsLayer { name: None, matrix }
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "<unnamed>".to_string())
    }
}

impl fmt::Debug for CountsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountsLayer")
            .field("name", &self.name)
            .field("n_genes", &self.matrix.n_genes())
            .field("n_cells", &self.matrix.n_cells())
            .finish()
    }
}

/// Immutable gene × cell dataset with group labels and gene annotation.
#[derive(Debug, Clone)]
pub struct ExpressionDataset {
    kind: DatasetKind,
    layers: Vec<CountsLayer>,
    gene_ids: Vec<String>,
    gene_annotations: BTreeMap<String, Vec<String>>,
    groups: GroupLabels,
    cell_metadata: BTreeMap<String, Vec<String>>,
    detection_rate: Option<Vec<f64>>,
}

impl ExpressionDataset {
    /// Validate and assemble a dataset. All layers must share one shape,
    /// gene ids must be unique and there must be one label per cell.
    pub fn new<S: AsRef<str>>(
        kind: DatasetKind,
        layers: Vec<CountsLayer>,
        gene_ids: &[S],
        groups: GroupLabels,
    ) -> Result<Self> {
        let first = layers.first().ok_or_else(|| ContrastError::NoCountsLayer {
            layers: Vec::new(),
        })?;
        let (n_genes, n_cells) = (first.matrix.n_genes(), first.matrix.n_cells());

        for layer in &layers {
            if layer.matrix.n_genes() != n_genes || layer.matrix.n_cells() != n_cells {
                return Err(ContrastError::InvalidInput(format!(
                    "layer '{}' is {}x{}, expected {}x{}",
                    layer.display_name(),
                    layer.matrix.n_genes(),
                    layer.matrix.n_cells(),
                    n_genes,
                    n_cells
                )));
            }
        }
        if n_genes == 0 || n_cells == 0 {
            return Err(ContrastError::InvalidInput(
                "dataset needs at least one gene and one cell".to_string(),
            ));
        }
        if gene_ids.len() != n_genes {
            return Err(ContrastError::InvalidInput(format!(
                "{} gene ids for {} genes",
                gene_ids.len(),
                n_genes
            )));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        if let Some(dup) = gene_ids.iter().map(|g| g.as_ref()).find(|g| !seen.insert(*g)) {
            return Err(ContrastError::InvalidInput(format!(
                "duplicate gene id '{}'",
                dup
            )));
        }
        if groups.len() != n_cells {
            return Err(ContrastError::InvalidInput(format!(
                "{} group labels for {} cells",
                groups.len(),
                n_cells
            )));
        }

        if let [only] = layers.as_slice() {
            if only.name.is_none() {
                warn!("dataset has a single unnamed layer, using it as counts");
            }
        }

        Ok(ExpressionDataset {
            kind,
            layers,
            gene_ids: gene_ids.iter().map(|g| g.as_ref().to_string()).collect(),
            gene_annotations: BTreeMap::new(),
            groups,
            cell_metadata: BTreeMap::new(),
            detection_rate: None,
        })
    }

    /// Attach a per-gene annotation column passed through to result tables.
    pub fn with_gene_annotation<S: AsRef<str>>(mut self, name: &str, values: &[S]) -> Result<Self> {
        if RESERVED_ANNOTATION_NAMES.contains(&name) {
            return Err(ContrastError::InvalidInput(format!(
                "annotation name '{}' is a result column",
                name
            )));
        }
        if values.len() != self.n_genes() {
            return Err(ContrastError::InvalidInput(format!(
                "annotation '{}' has {} values for {} genes",
                name,
                values.len(),
                self.n_genes()
            )));
        }
        self.gene_annotations.insert(
            name.to_string(),
            values.iter().map(|v| v.as_ref().to_string()).collect(),
        );
        Ok(self)
    }

    /// Attach a per-cell metadata column, e.g. a batch or donor covariate.
    pub fn with_cell_metadata<S: AsRef<str>>(mut self, name: &str, values: &[S]) -> Result<Self> {
        if values.len() != self.n_cells() {
            return Err(ContrastError::InvalidInput(format!(
                "cell metadata '{}' has {} values for {} cells",
                name,
                values.len(),
                self.n_cells()
            )));
        }
        self.cell_metadata.insert(
            name.to_string(),
            values.iter().map(|v| v.as_ref().to_string()).collect(),
        );
        Ok(self)
    }

    /// Compute the detection-rate covariate from the canonical counts layer.
    ///
    /// This must run on the complete dataset, before any subsampling, so that
    /// the centering and scaling reflect the whole population.
    pub fn with_detection_rate(mut self) -> Result<Self> {
        let rate = detection_rate_covariate(self.counts()?);
        self.detection_rate = Some(rate);
        Ok(self)
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    pub fn n_cells(&self) -> usize {
        self.groups.len()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn gene_annotations(&self) -> &BTreeMap<String, Vec<String>> {
        &self.gene_annotations
    }

    pub fn groups(&self) -> &GroupLabels {
        &self.groups
    }

    pub fn cell_metadata(&self, name: &str) -> Option<&[String]> {
        self.cell_metadata.get(name).map(|v| v.as_slice())
    }

    pub fn detection_rate(&self) -> Option<&[f64]> {
        self.detection_rate.as_deref()
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.display_name()).collect()
    }

    /// The canonical counts view.
    ///
    /// A single layer is used as is; otherwise the layer named `counts` is
    /// required.
    pub fn counts(&self) -> Result<&dyn CountsView> {
        if let [only] = self.layers.as_slice() {
            return Ok(only.matrix.as_ref());
        }
        self.layers
            .iter()
            .find(|l| l.name.as_deref() == Some(COUNTS_LAYER))
            .map(|l| l.matrix.as_ref())
            .ok_or_else(|| ContrastError::NoCountsLayer {
                layers: self.layer_names(),
            })
    }

    /// Map from gene id to row index.
    pub fn gene_index(&self) -> HashMap<&str, usize> {
        self.gene_ids
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect()
    }

    /// A new dataset holding only `cells`, in the given order.
    ///
    /// Every layer, the labels (with the full level set), the cell metadata and
    /// an already computed detection-rate covariate are subset alike.
    pub fn subset_cells(&self, cells: &[usize]) -> Result<ExpressionDataset> {
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                Ok(CountsLayer {
                    name: layer.name.clone(),
                    matrix: layer.matrix.select_cells(cells)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let cell_metadata = self
            .cell_metadata
            .iter()
            .map(|(k, v)| (k.clone(), cells.iter().map(|&c| v[c].clone()).collect()))
            .collect();
        let detection_rate = self
            .detection_rate
            .as_ref()
            .map(|rate| cells.iter().map(|&c| rate[c]).collect());

        debug!(kept = cells.len(), total = self.n_cells(), "subset dataset cells");
        Ok(ExpressionDataset {
            kind: self.kind,
            layers,
            gene_ids: self.gene_ids.clone(),
            gene_annotations: self.gene_annotations.clone(),
            groups: self.groups.select(cells),
            cell_metadata,
            detection_rate,
        })
    }
}

/// Fraction of detected genes per cell, centered and scaled to unit variance.
///
/// Cells with identical detection rates all get 0. Rates are compared with a
/// tolerance relative to their mean so that rounding in the variance cannot
/// turn a constant rate into a covariate.
pub fn detection_rate_covariate(counts: &dyn CountsView) -> Vec<f64> {
    let n_genes = counts.n_genes().max(1) as f64;
    let rate: Vec<f64> = counts
        .detected_per_cell()
        .into_iter()
        .map(|d| d as f64 / n_genes)
        .collect();
    let n = rate.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mean = rate.iter().sum::<f64>() / n as f64;
    let tolerance = 1e-12 * mean.abs().max(1.0);
    if rate.iter().all(|r| (r - mean).abs() <= tolerance) {
        return vec![0.0; n];
    }
    let var = rate.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let sd = var.sqrt();
    rate.iter().map(|r| (r - mean) / sd).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    fn layer() -> Arc<dyn CountsView> {
        let m: Array2<f64> = array![[1.0, 0.0, 2.0], [0.0, 0.0, 1.0]];
        Arc::new(m)
    }

    fn dataset(layers: Vec<CountsLayer>) -> Result<ExpressionDataset> {
        ExpressionDataset::new(
            DatasetKind::SingleCell,
            layers,
            &["g1", "g2"],
            GroupLabels::from_labels(&["b", "a", "b"]),
        )
    }

    #[test]
    fn labels_are_sorted_levels() {
        let labels = GroupLabels::from_labels(&["b", "a", "b"]);
        assert_eq!(labels.levels(), &["a".to_string(), "b".to_string()]);
        assert_eq!(labels.codes(), &[1, 0, 1]);
        assert_eq!(labels.cells_in(1), vec![0, 2]);
        assert_eq!(labels.level_sizes(), vec![1, 2]);
    }

    #[test]
    fn fixed_levels_reject_unknown_labels() {
        let err = GroupLabels::with_levels(&["a", "z", "q"], &["a", "b"]).unwrap_err();
        match err {
            ContrastError::UnknownGroup { groups, .. } => {
                assert_eq!(groups, vec!["z".to_string(), "q".to_string()])
            }
            other => panic!("unexpected error {other:?}"),
        }
        let labels = GroupLabels::with_levels(&["a", "a"], &["a", "b"]).unwrap();
        assert_eq!(labels.present_levels(), vec![0]);
    }

    #[test]
    fn resolve_lists_every_unknown_name() {
        let labels = GroupLabels::from_labels(&["a", "b"]);
        let err = labels.resolve(&["a", "x", "y"]).unwrap_err();
        assert!(err.to_string().contains("\"x\""));
        assert!(err.to_string().contains("\"y\""));
    }

    #[test]
    fn counts_layer_selection() {
        let single = dataset(vec![CountsLayer::unnamed(layer())]).unwrap();
        assert!(single.counts().is_ok());

        let named = dataset(vec![
            CountsLayer::named("logcounts", layer()),
            CountsLayer::named("counts", layer()),
        ])
        .unwrap();
        assert!(named.counts().is_ok());

        let missing = dataset(vec![
            CountsLayer::named("logcounts", layer()),
            CountsLayer::named("scaled", layer()),
        ])
        .unwrap();
        match missing.counts() {
            Err(ContrastError::NoCountsLayer { layers }) => {
                assert_eq!(layers, vec!["logcounts".to_string(), "scaled".to_string()])
            }
            _ => panic!("expected NoCountsLayer"),
        }
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let err = ExpressionDataset::new(
            DatasetKind::SingleCell,
            vec![CountsLayer::unnamed(layer())],
            &["g1"],
            GroupLabels::from_labels(&["a", "a", "b"]),
        );
        assert!(err.is_err());

        let err = ExpressionDataset::new(
            DatasetKind::SingleCell,
            vec![CountsLayer::unnamed(layer())],
            &["g1", "g1"],
            GroupLabels::from_labels(&["a", "a", "b"]),
        );
        assert!(err.is_err());
    }

    #[test]
    fn detection_rate_is_standardized() {
        let ds = dataset(vec![CountsLayer::unnamed(layer())])
            .unwrap()
            .with_detection_rate()
            .unwrap();
        let rate = ds.detection_rate().unwrap();
        // detected per cell: 1, 0, 2
        assert_relative_eq!(rate[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(rate[1], -1.0, epsilon = 1e-12);
        assert_relative_eq!(rate[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn equal_detection_rates_give_a_zero_covariate() {
        // 50 genes, 30 cells, each cell detects exactly 5 genes
        let m: Array2<f64> =
            Array2::from_shape_fn((50, 30), |(g, c)| if g / 5 == c / 10 { 7.0 } else { 0.0 });
        let detected: Vec<usize> = (0..30)
            .map(|c| (0..50).filter(|&g| m[[g, c]] > 0.0).count())
            .collect();
        assert!(detected.windows(2).all(|w| w[0] == w[1]));

        let rate = detection_rate_covariate(&m);
        assert_eq!(rate.len(), 30);
        assert!(rate.iter().all(|&r| r == 0.0));
    }

    #[test]
    fn reserved_annotation_names_are_rejected() {
        let ds = dataset(vec![CountsLayer::unnamed(layer())]).unwrap();
        for name in ["rank", "group", "gene_id", "log2FC"] {
            let err = ds.clone().with_gene_annotation(name, &["x", "y"]).unwrap_err();
            assert!(matches!(err, ContrastError::InvalidInput(_)), "{name}");
        }
        let ok = ds.with_gene_annotation("symbol", &["x", "y"]).unwrap();
        assert_eq!(ok.gene_annotations().len(), 1);
    }

    #[test]
    fn subset_keeps_levels_and_covariate() {
        let ds = dataset(vec![CountsLayer::unnamed(layer())])
            .unwrap()
            .with_cell_metadata("batch", &["x", "y", "z"])
            .unwrap()
            .with_detection_rate()
            .unwrap();
        let sub = ds.subset_cells(&[0, 2]).unwrap();
        assert_eq!(sub.n_cells(), 2);
        assert_eq!(sub.groups().levels().len(), 2);
        assert_eq!(sub.cell_metadata("batch").unwrap(), &["x".to_string(), "z".to_string()]);
        assert_eq!(sub.detection_rate().unwrap().len(), 2);
        assert_eq!(sub.counts().unwrap().gene_values(0, &[0, 1]), vec![1.0, 2.0]);
    }
}
