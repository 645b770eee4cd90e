//! Contrast models: per-gene significance and fold change of one group versus
//! all other kept cells.

use crate::config::ContrastParams;
use crate::dataset::{DatasetKind, ExpressionDataset};
use crate::error::Result;
use crate::testing::GeneContrast;

pub mod glm;

pub mod hurdle;

pub mod linear;

pub mod moderation;

pub use hurdle::HurdleContrast;
pub use linear::LinearContrast;

/// One group-vs-rest split handed to a contrast model.
#[derive(Debug, Clone, Copy)]
pub struct ContrastInput<'a> {
    pub dataset: &'a ExpressionDataset,
    /// Level index of the target group
    pub group: usize,
    /// Kept cells, in original order
    pub cells: &'a [usize],
}

impl<'a> ContrastInput<'a> {
    pub fn new(dataset: &'a ExpressionDataset, group: usize, cells: &'a [usize]) -> Self {
        ContrastInput {
            dataset,
            group,
            cells,
        }
    }

    pub fn group_name(&self) -> &'a str {
        self.dataset.groups().levels()[self.group].as_str()
    }
}

/// The statistical back-end used for a dataset, chosen from its declared kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ContrastModel {
    /// Hurdle model for sparse single-cell counts
    Hurdle(HurdleContrast),
    /// Moderated linear model for normalized microarray values
    Linear(LinearContrast),
}

impl ContrastModel {
    pub fn for_kind(kind: DatasetKind, params: &ContrastParams) -> Self {
        match kind {
            DatasetKind::SingleCell => {
                ContrastModel::Hurdle(HurdleContrast::new(params.hurdle.clone(), params.confidence))
            }
            DatasetKind::Microarray => ContrastModel::Linear(LinearContrast::new(
                params.batch_column.clone(),
                params.confidence,
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContrastModel::Hurdle(_) => "hurdle",
            ContrastModel::Linear(_) => "moderated-linear",
        }
    }

    /// Check that the dataset carries everything the model reads, before any fitting.
    pub fn check_inputs(&self, dataset: &ExpressionDataset) -> Result<()> {
        dataset.counts()?;
        match self {
            ContrastModel::Hurdle(_) => Ok(()),
            ContrastModel::Linear(model) => model.check_inputs(dataset),
        }
    }

    /// Per-gene results in the dataset's gene order.
    pub fn fit(&self, input: &ContrastInput<'_>) -> Result<Vec<GeneContrast>> {
        match self {
            ContrastModel::Hurdle(model) => model.fit(input),
            ContrastModel::Linear(model) => model.fit(input),
        }
    }
}
