//! # single-contrast
//!
//! Group-vs-rest differential expression for clustered single-cell (and purified
//! population) data, part of the single-rust ecosystem, and rank-based matching of
//! clusters against a labelled reference dataset.
//!
//! Every group of a dataset is contrasted against all other cells. Genes are
//! ordered by the inner bound of their fold-change confidence interval, which
//! favours genes that are both strongly and confidently changed. Marker genes of a
//! query group are then looked up in a reference dataset's tables: reference groups
//! that rank those markers near the top are the most similar.
//!
//! ## Core Features
//!
//! - **Hurdle contrasts** for sparse counts: a penalized logistic component for
//!   detection and a moderated linear component for level, with a detection-rate
//!   covariate
//! - **Moderated linear contrasts** for normalized microarray values, with an
//!   optional batch covariate
//! - **Benjamini-Hochberg FDR** and ranking per group
//! - **Seeded subsampling** of cells, independent of scheduling
//! - **Dense and sparse storage** through `ndarray::Array2` or `CsrMatrix`
//!
//! ## Quick Start
//!
//! Build an [`ExpressionDataset`], run a [`DatasetContrastOrchestrator`] over it
//! to get a [`DeTable`], do the same for a reference dataset, and call
//! [`markers::mark_reference_all`] to find which reference groups each query group
//! resembles.
//!
//! ## Module Organization
//!
//! - **[`dataset`]**: Expression layers, group labels, subsampling
//! - **[`testing`]**: Contrast models, multiple testing correction, interval orientation
//! - **[`contrast`]**: Per-group pipeline and dataset orchestration
//! - **[`markers`]**: Marker selection and cross-dataset matching
//! - **[`config`]**: Parameters and TOML configuration

pub mod config;
pub mod contrast;
pub mod dataset;
pub mod error;
pub mod markers;
pub mod testing;

pub use config::{ContrastParams, HurdleSettings, MarkerParams, PipelineConfig, RunOptions};
pub use contrast::{Capabilities, DatasetContrastOrchestrator, DeRow, DeTable, GroupContrastEngine};
pub use dataset::{CountsLayer, DatasetKind, ExpressionDataset, GroupLabels};
pub use error::{ContrastError, Result};
pub use markers::{MarkedRow, MarkedTable, MarkerPolicy};
