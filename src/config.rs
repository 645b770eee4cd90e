//! Tunable parameters of the contrast pipeline and marker selection.
//!
//! Every struct deserializes with defaults for missing fields, so a TOML file
//! only needs to name the values it changes:
//!
//! ```toml
//! [contrast]
//! n_group = 200
//! seed = 7
//!
//! [markers]
//! policy = "top-N-significant"
//! n = 50
//!
//! [run]
//! workers = 4
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ContrastError, Result};
use crate::markers::MarkerPolicy;

pub const DEFAULT_SIG_THRESHOLD: f64 = 0.01;
pub const DEFAULT_CONFIDENCE: f64 = 0.95;
pub const DEFAULT_MARKER_COUNT: usize = 100;
pub const DEFAULT_SEED: u64 = 42;

/// Settings of the count hurdle model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HurdleSettings {
    /// Pseudo-count added before the log2 transform
    pub offset: f64,
    /// Empirical-Bayes moderation of the continuous-component variances
    pub moderate_variance: bool,
    /// IRLS iteration cap of the discrete component
    pub max_iter: usize,
    /// IRLS convergence tolerance on the coefficients
    pub tolerance: f64,
}

impl Default for HurdleSettings {
    fn default() -> Self {
        HurdleSettings {
            offset: 1.0,
            moderate_variance: true,
            max_iter: 50,
            tolerance: 1e-8,
        }
    }
}

/// Parameters of one dataset's group-vs-rest contrasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastParams {
    /// Cap on target-group cells; `None` keeps all
    pub n_group: Option<usize>,
    /// Cap on other cells; defaults to five times `n_group`
    pub n_other: Option<usize>,
    pub sig_threshold: f64,
    pub confidence: f64,
    /// Seed of the cell subsampler
    pub seed: u64,
    /// Per-cell metadata column used as batch covariate by the linear model
    pub batch_column: Option<String>,
    pub hurdle: HurdleSettings,
}

impl Default for ContrastParams {
    fn default() -> Self {
        ContrastParams {
            n_group: None,
            n_other: None,
            sig_threshold: DEFAULT_SIG_THRESHOLD,
            confidence: DEFAULT_CONFIDENCE,
            seed: DEFAULT_SEED,
            batch_column: None,
            hurdle: HurdleSettings::default(),
        }
    }
}

impl ContrastParams {
    /// Effective cap on other cells.
    pub fn other_cap(&self) -> Option<usize> {
        self.n_other.or(self.n_group.map(|n| n.saturating_mul(5)))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sig_threshold > 0.0 && self.sig_threshold <= 1.0) {
            return Err(ContrastError::InvalidInput(format!(
                "significance threshold must be in (0, 1], got {}",
                self.sig_threshold
            )));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(ContrastError::InvalidInput(format!(
                "confidence level must be in (0, 1), got {}",
                self.confidence
            )));
        }
        if self.n_group == Some(0) || self.n_other == Some(0) {
            return Err(ContrastError::InvalidInput(
                "cell caps must be positive".to_string(),
            ));
        }
        if !(self.hurdle.offset > 0.0 && self.hurdle.offset.is_finite()) {
            return Err(ContrastError::InvalidInput(format!(
                "pseudo-count offset must be positive, got {}",
                self.hurdle.offset
            )));
        }
        if self.hurdle.max_iter == 0 {
            return Err(ContrastError::InvalidInput(
                "hurdle max_iter must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Marker selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerParams {
    pub policy: MarkerPolicy,
    pub n: usize,
}

impl Default for MarkerParams {
    fn default() -> Self {
        MarkerParams {
            policy: MarkerPolicy::default(),
            n: DEFAULT_MARKER_COUNT,
        }
    }
}

impl MarkerParams {
    pub fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(ContrastError::InvalidInput(
                "marker count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the orchestrator runs one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Restrict the run to these group levels; all non-empty levels otherwise
    pub groups: Option<Vec<String>>,
    /// Number of worker threads; 1 runs sequentially
    pub workers: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            groups: None,
            workers: 1,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ContrastError::InvalidInput(
                "worker count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub contrast: ContrastParams,
    pub markers: MarkerParams,
    pub run: RunOptions,
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.contrast.validate()?;
        self.markers.validate()?;
        self.run.validate()
    }
}
