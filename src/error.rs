//! Structured error types shared by every stage of the contrast pipeline.

use thiserror::Error;

/// Errors raised by dataset validation, model fitting and marker selection.
///
/// Configuration problems (unknown groups, missing columns, missing counts
/// layer, unknown marker policy) are raised before any model is fitted.
/// Conditions that are recoverable, such as a group without marker genes,
/// are not errors and are reported through `tracing` instead.
#[derive(Debug, Error)]
pub enum ContrastError {
    #[error("unknown group(s) {groups:?}; available levels: {available:?}")]
    UnknownGroup {
        groups: Vec<String>,
        available: Vec<String>,
    },

    #[error("missing required column '{column}' ({context})")]
    MissingColumn { column: String, context: String },

    #[error("no counts layer found; expected a single layer or one named 'counts', got {layers:?}")]
    NoCountsLayer { layers: Vec<String> },

    #[error("unknown marker selection policy '{0}'; expected one of top-N-by-inner-CI, top-N-significant, bottom-N-by-inner-CI")]
    UnknownPolicy(String),

    #[error("model fit failed for group '{group}': {reason}")]
    ModelFit { group: String, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ContrastError {
    pub(crate) fn model_fit(group: &str, reason: impl Into<String>) -> Self {
        ContrastError::ModelFit {
            group: group.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that are raised before any statistical work starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ContrastError::UnknownGroup { .. }
                | ContrastError::MissingColumn { .. }
                | ContrastError::NoCountsLayer { .. }
                | ContrastError::UnknownPolicy(_)
                | ContrastError::InvalidInput(_)
                | ContrastError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ContrastError>;
