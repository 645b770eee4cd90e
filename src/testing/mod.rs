pub mod correction;
pub mod effect;
pub mod inference;

pub mod utils;

/// Per-gene output of a contrast model for one group-vs-rest split.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneContrast {
    /// Gene identifier, the join key across tables and datasets
    pub gene_id: String,
    /// P-value of the group coefficient
    pub p_value: f64,
    /// Estimated log2 fold change of the group versus all other cells;
    /// `None` when the model could not estimate it
    pub log2_fold_change: Option<f64>,
    /// Upper confidence bound of the fold change
    pub ci_hi: f64,
    /// Lower confidence bound of the fold change
    pub ci_lo: f64,
}

impl GeneContrast {
    /// A gene whose fold change could not be estimated.
    pub fn undefined(gene_id: &str, p_value: f64) -> Self {
        GeneContrast {
            gene_id: gene_id.to_string(),
            p_value,
            log2_fold_change: None,
            ci_hi: 0.0,
            ci_lo: 0.0,
        }
    }

    /// A gene with an estimated fold change and symmetric half-width `margin`.
    pub fn estimated(gene_id: &str, p_value: f64, log2_fold_change: f64, margin: f64) -> Self {
        GeneContrast {
            gene_id: gene_id.to_string(),
            p_value,
            log2_fold_change: Some(log2_fold_change),
            ci_hi: log2_fold_change + margin,
            ci_lo: log2_fold_change - margin,
        }
    }
}
