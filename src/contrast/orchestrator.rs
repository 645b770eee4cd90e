//! Runs the group contrast over many groups of one dataset.

use std::borrow::Cow;
use std::thread;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{info, warn};

use crate::config::{ContrastParams, RunOptions};
use crate::contrast::{DeRow, DeTable, GroupContrastEngine};
use crate::dataset::{DatasetKind, ExpressionDataset};
use crate::error::Result;

/// What the host can do, resolved once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Hardware threads reported by the OS
    pub parallelism: usize,
}

impl Capabilities {
    pub fn detect() -> Self {
        Capabilities {
            parallelism: thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }

    /// Host without usable parallelism.
    pub fn sequential() -> Self {
        Capabilities { parallelism: 1 }
    }

    pub fn supports_parallel(&self) -> bool {
        self.parallelism > 1
    }
}

/// Per-group outcome of [`DatasetContrastOrchestrator::contrast_groups`].
#[derive(Debug)]
pub struct GroupOutcome {
    pub group: String,
    pub result: Result<Vec<DeRow>>,
}

#[derive(Debug, Clone)]
pub struct DatasetContrastOrchestrator {
    params: ContrastParams,
    run: RunOptions,
    capabilities: Capabilities,
}

impl DatasetContrastOrchestrator {
    pub fn new(params: ContrastParams, run: RunOptions) -> Self {
        DatasetContrastOrchestrator {
            params,
            run,
            capabilities: Capabilities::detect(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn params(&self) -> &ContrastParams {
        &self.params
    }

    /// Contrast every selected group and keep each group's outcome separately.
    ///
    /// Configuration problems (unknown groups, missing inputs, bad parameters)
    /// fail the whole call before any fitting; model failures only fail their
    /// own group.
    pub fn contrast_groups(
        &self,
        dataset: &ExpressionDataset,
        dataset_name: &str,
    ) -> Result<Vec<GroupOutcome>> {
        self.run.validate()?;
        let dataset = prepare(dataset)?;
        let engine = GroupContrastEngine::new(&dataset, dataset_name, &self.params)?;

        let groups = dataset.groups();
        let levels = match &self.run.groups {
            Some(names) => groups.resolve(names)?,
            None => groups.present_levels(),
        };
        info!(
            dataset = dataset_name,
            model = engine.model().name(),
            groups = levels.len(),
            cells = dataset.n_cells(),
            genes = dataset.n_genes(),
            "contrasting groups"
        );

        let run_level = |&level: &usize| GroupOutcome {
            group: groups.levels()[level].clone(),
            result: engine.contrast_level(level),
        };

        let outcomes: Vec<GroupOutcome> = match self.worker_pool() {
            Some(pool) => pool.install(|| levels.par_iter().map(run_level).collect()),
            None => levels.iter().map(run_level).collect(),
        };
        Ok(outcomes)
    }

    /// Contrast every selected group and assemble one table, failing on the
    /// first group whose model cannot be fitted.
    pub fn contrast_dataset(&self, dataset: &ExpressionDataset, dataset_name: &str) -> Result<DeTable> {
        let outcomes = self.contrast_groups(dataset, dataset_name)?;
        let mut table = DeTable::new(
            dataset_name,
            dataset.groups().levels().to_vec(),
            dataset.gene_annotations().keys().cloned().collect(),
        );
        for outcome in outcomes {
            table.rows.extend(outcome.result?);
        }
        Ok(table)
    }

    fn worker_pool(&self) -> Option<rayon::ThreadPool> {
        if self.run.workers <= 1 {
            return None;
        }
        if !self.capabilities.supports_parallel() {
            warn!(
                workers = self.run.workers,
                "parallel execution requested but the host reports a single core, running sequentially"
            );
            return None;
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.run.workers)
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(error = %err, "could not start worker pool, running sequentially");
                None
            }
        }
    }
}

/// The dataset with the detection-rate covariate computed on all of its cells.
fn prepare(dataset: &ExpressionDataset) -> Result<Cow<'_, ExpressionDataset>> {
    if dataset.kind() == DatasetKind::SingleCell && dataset.detection_rate().is_none() {
        Ok(Cow::Owned(dataset.clone().with_detection_rate()?))
    } else {
        Ok(Cow::Borrowed(dataset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CountsLayer, GroupLabels};
    use crate::error::ContrastError;
    use ndarray::Array2;
    use std::sync::Arc;

    fn microarray() -> ExpressionDataset {
        let values = Array2::from_shape_fn((5, 9), |(g, c)| {
            let group = c / 3;
            let bump = if g == group { 3.0 } else { 0.0 };
            5.0 + bump + ((g * 7 + c * 3) % 5) as f64 * 0.1
        });
        let ids: Vec<String> = (0..5).map(|g| format!("g{}", g)).collect();
        ExpressionDataset::new(
            DatasetKind::Microarray,
            vec![CountsLayer::unnamed(Arc::new(values))],
            &ids,
            GroupLabels::with_levels(
                &["x", "x", "x", "y", "y", "y", "z", "z", "z"],
                &["x", "y", "z", "empty"],
            )
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn default_groups_skip_empty_levels() {
        let orchestrator =
            DatasetContrastOrchestrator::new(ContrastParams::default(), RunOptions::default());
        let table = orchestrator.contrast_dataset(&microarray(), "arrays").unwrap();
        assert_eq!(table.groups(), vec!["x", "y", "z"]);
        assert_eq!(table.group_levels.len(), 4);
        assert_eq!(table.len(), 15);
        assert!(table.rows.iter().all(|r| r.dataset == "arrays"));
        assert_eq!(table.rows_for_group("y").next().unwrap().gene_id, "g1");
    }

    #[test]
    fn unknown_groups_are_all_reported() {
        let run = RunOptions {
            groups: Some(vec!["x".to_string(), "q".to_string(), "r".to_string()]),
            workers: 1,
        };
        let orchestrator = DatasetContrastOrchestrator::new(ContrastParams::default(), run);
        match orchestrator.contrast_dataset(&microarray(), "arrays").unwrap_err() {
            ContrastError::UnknownGroup { groups, .. } => {
                assert_eq!(groups, vec!["q".to_string(), "r".to_string()])
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn single_core_host_falls_back_to_sequential() {
        let run = RunOptions {
            groups: None,
            workers: 4,
        };
        let sequential =
            DatasetContrastOrchestrator::new(ContrastParams::default(), RunOptions::default())
                .contrast_dataset(&microarray(), "arrays")
                .unwrap();
        let degraded = DatasetContrastOrchestrator::new(ContrastParams::default(), run)
            .with_capabilities(Capabilities::sequential())
            .contrast_dataset(&microarray(), "arrays")
            .unwrap();
        assert_eq!(sequential, degraded);
    }

    #[test]
    fn empty_group_fails_only_itself() {
        let run = RunOptions {
            groups: Some(vec!["x".to_string(), "empty".to_string()]),
            workers: 1,
        };
        let outcomes = DatasetContrastOrchestrator::new(ContrastParams::default(), run)
            .contrast_groups(&microarray(), "arrays")
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(ContrastError::ModelFit { .. })
        ));
    }
}
