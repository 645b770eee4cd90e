//! Cross-dataset marker matching.
//!
//! Marker genes of a query group are picked from the query dataset's table
//! and looked up in every group of a reference dataset's table. Where the
//! reference ranks those markers says how much each reference group resembles
//! the query group.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MarkerParams;
use crate::contrast::{DeRow, DeTable};
use crate::error::{ContrastError, Result};

/// Rule for picking marker genes out of one group's rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MarkerPolicy {
    /// `rank ≤ N` and `ci_inner ≥ 1`
    #[default]
    TopByInnerCi,
    /// `rank ≤ N`, significant and `ci_inner ≥ 0`
    TopSignificant,
    /// `rank > gene_count - N` and `ci_inner ≤ -1`. Experimental.
    BottomByInnerCi,
}

impl MarkerPolicy {
    pub const ALL: [MarkerPolicy; 3] = [
        MarkerPolicy::TopByInnerCi,
        MarkerPolicy::TopSignificant,
        MarkerPolicy::BottomByInnerCi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerPolicy::TopByInnerCi => "top-N-by-inner-CI",
            MarkerPolicy::TopSignificant => "top-N-significant",
            MarkerPolicy::BottomByInnerCi => "bottom-N-by-inner-CI",
        }
    }

    /// Whether `row` is a marker of its group when keeping `n` genes.
    pub fn selects(&self, row: &DeRow, n: usize) -> bool {
        match self {
            MarkerPolicy::TopByInnerCi => row.rank <= n && row.ci_inner >= 1.0,
            MarkerPolicy::TopSignificant => row.rank <= n && row.sig && row.ci_inner >= 0.0,
            MarkerPolicy::BottomByInnerCi => {
                row.rank > row.gene_count.saturating_sub(n) && row.ci_inner <= -1.0
            }
        }
    }
}

impl fmt::Display for MarkerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarkerPolicy {
    type Err = ContrastError;

    fn from_str(s: &str) -> Result<Self> {
        MarkerPolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ContrastError::UnknownPolicy(s.to_string()))
    }
}

impl TryFrom<String> for MarkerPolicy {
    type Error = ContrastError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MarkerPolicy> for String {
    fn from(policy: MarkerPolicy) -> Self {
        policy.as_str().to_string()
    }
}

/// A reference row annotated with the query group whose markers selected it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkedRow {
    #[serde(flatten)]
    pub row: DeRow,
    pub test_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_dataset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkedTable {
    pub reference_dataset: String,
    pub rows: Vec<MarkedRow>,
}

impl MarkedTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Marker gene ids of `group`, in rank order.
pub fn select_markers(table: &DeTable, group: &str, params: &MarkerParams) -> Vec<String> {
    let mut rows: Vec<&DeRow> = table
        .rows_for_group(group)
        .filter(|row| params.policy.selects(row, params.n))
        .collect();
    rows.sort_by_key(|row| row.rank);
    rows.into_iter().map(|row| row.gene_id.clone()).collect()
}

/// Rows of `reference` for the marker genes of `group` in `query`.
///
/// Returns `None`, with a warning, when the group has no markers under the
/// policy or none of them exist in the reference.
pub fn mark_reference(
    query: &DeTable,
    group: &str,
    reference: &DeTable,
    params: &MarkerParams,
) -> Result<Option<MarkedTable>> {
    params.validate()?;
    if !query.group_levels.iter().any(|g| g == group) {
        return Err(ContrastError::UnknownGroup {
            groups: vec![group.to_string()],
            available: query.group_levels.clone(),
        });
    }

    let markers = select_markers(query, group, params);
    if markers.is_empty() {
        warn!(
            dataset = query.dataset.as_str(),
            group,
            policy = params.policy.as_str(),
            n = params.n,
            "no marker genes selected"
        );
        return Ok(None);
    }

    let marker_set: HashSet<&str> = markers.iter().map(|g| g.as_str()).collect();
    let rows: Vec<MarkedRow> = reference
        .rows
        .iter()
        .filter(|row| marker_set.contains(row.gene_id.as_str()))
        .map(|row| MarkedRow {
            row: row.clone(),
            test_group: group.to_string(),
            test_dataset: None,
        })
        .collect();
    if rows.is_empty() {
        warn!(
            dataset = query.dataset.as_str(),
            reference = reference.dataset.as_str(),
            group,
            markers = markers.len(),
            "none of the marker genes occur in the reference"
        );
        return Ok(None);
    }

    debug!(
        group,
        markers = markers.len(),
        rows = rows.len(),
        "marked reference rows"
    );
    Ok(Some(MarkedTable {
        reference_dataset: reference.dataset.clone(),
        rows,
    }))
}

/// [`mark_reference`] for every group level of `query`, concatenated and
/// stamped with the query dataset name.
///
/// Groups without markers are skipped. If no group has any, the result is an
/// empty table and a warning is logged.
pub fn mark_reference_all(
    query: &DeTable,
    reference: &DeTable,
    params: &MarkerParams,
) -> Result<MarkedTable> {
    params.validate()?;
    let mut marked = MarkedTable {
        reference_dataset: reference.dataset.clone(),
        rows: Vec::new(),
    };
    for group in &query.group_levels {
        if let Some(table) = mark_reference(query, group, reference, params)? {
            marked.rows.extend(table.rows.into_iter().map(|mut row| {
                row.test_dataset = Some(query.dataset.clone());
                row
            }));
        }
    }
    if marked.is_empty() {
        warn!(
            dataset = query.dataset.as_str(),
            reference = reference.dataset.as_str(),
            "no group of the query dataset has marker genes in the reference"
        );
    }
    Ok(marked)
}

/// Similarity of one query group to one reference group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerRankSummary {
    pub test_dataset: Option<String>,
    pub test_group: String,
    pub reference_group: String,
    pub n_markers: usize,
    /// Lower means the reference group ranks the markers higher
    pub mean_rescaled_rank: f64,
    pub median_rescaled_rank: f64,
}

/// One summary per (test dataset, test group, reference group).
pub fn marker_rank_summary(marked: &MarkedTable) -> Vec<MarkerRankSummary> {
    let mut ranks: BTreeMap<(Option<&str>, &str, &str), Vec<f64>> = BTreeMap::new();
    for row in &marked.rows {
        ranks
            .entry((
                row.test_dataset.as_deref(),
                row.test_group.as_str(),
                row.row.group.as_str(),
            ))
            .or_default()
            .push(row.row.rescaled_rank);
    }

    ranks
        .into_iter()
        .map(|((test_dataset, test_group, reference_group), mut values)| {
            values.sort_by(|a, b| a.total_cmp(b));
            let n = values.len();
            let median = if n % 2 == 1 {
                values[n / 2]
            } else {
                (values[n / 2 - 1] + values[n / 2]) / 2.0
            };
            MarkerRankSummary {
                test_dataset: test_dataset.map(str::to_string),
                test_group: test_group.to_string(),
                reference_group: reference_group.to_string(),
                n_markers: n,
                mean_rescaled_rank: values.iter().sum::<f64>() / n as f64,
                median_rescaled_rank: median,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(gene: &str, group: &str, rank: usize, ci_inner: f64, sig: bool) -> DeRow {
        DeRow {
            gene_id: gene.to_string(),
            pval: if sig { 1e-6 } else { 0.5 },
            log2_fc: ci_inner,
            ci_inner,
            ci_outer: ci_inner,
            fdr: if sig { 1e-5 } else { 0.6 },
            group: group.to_string(),
            sig,
            sig_up: sig && ci_inner > 0.0,
            gene_count: 4,
            rank,
            rescaled_rank: rank as f64 / 4.0,
            dataset: "q".to_string(),
            annotations: BTreeMap::new(),
        }
    }

    fn table(name: &str, rows: Vec<DeRow>) -> DeTable {
        let mut table = DeTable::new(name, vec!["A".to_string(), "B".to_string()], Vec::new());
        table.rows = rows;
        table
    }

    fn query() -> DeTable {
        table(
            "q",
            vec![
                row("g1", "A", 1, 2.5, true),
                row("g2", "A", 2, 1.2, true),
                row("g3", "A", 3, 0.4, true),
                row("g4", "A", 4, -1.5, true),
                row("g4", "B", 1, 0.5, false),
                row("g3", "B", 2, 0.2, false),
                row("g2", "B", 3, -0.1, false),
                row("g1", "B", 4, -0.3, false),
            ],
        )
    }

    fn params(policy: MarkerPolicy, n: usize) -> MarkerParams {
        MarkerParams { policy, n }
    }

    #[test]
    fn policy_identifiers_round_trip() {
        for policy in MarkerPolicy::ALL {
            assert_eq!(policy.as_str().parse::<MarkerPolicy>().unwrap(), policy);
        }
        let err = "top-N".parse::<MarkerPolicy>().unwrap_err();
        assert!(matches!(err, ContrastError::UnknownPolicy(ref p) if p == "top-N"));
    }

    #[test]
    fn policies_select_expected_genes() {
        let q = query();
        assert_eq!(
            select_markers(&q, "A", &params(MarkerPolicy::TopByInnerCi, 100)),
            vec!["g1", "g2"]
        );
        assert_eq!(
            select_markers(&q, "A", &params(MarkerPolicy::TopByInnerCi, 1)),
            vec!["g1"]
        );
        assert_eq!(
            select_markers(&q, "A", &params(MarkerPolicy::TopSignificant, 3)),
            vec!["g1", "g2", "g3"]
        );
        assert_eq!(
            select_markers(&q, "A", &params(MarkerPolicy::BottomByInnerCi, 1)),
            vec!["g4"]
        );
        assert!(select_markers(&q, "B", &params(MarkerPolicy::TopByInnerCi, 100)).is_empty());
    }

    #[test]
    fn marks_every_reference_group() {
        let reference = table(
            "r",
            vec![
                row("g1", "A", 1, 3.0, true),
                row("g5", "A", 2, 1.0, true),
                row("g2", "B", 3, 0.1, false),
                row("g1", "B", 4, -2.0, true),
            ],
        );
        let marked = mark_reference(&query(), "A", &reference, &MarkerParams::default())
            .unwrap()
            .unwrap();
        assert_eq!(marked.len(), 3);
        assert!(marked.rows.iter().all(|r| r.test_group == "A"));
        assert!(marked.rows.iter().all(|r| r.test_dataset.is_none()));
        assert_eq!(reference.len(), 4, "reference is left untouched");

        let summary = marker_rank_summary(&marked);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].reference_group, "A");
        assert_eq!(summary[0].n_markers, 1);
        assert_eq!(summary[0].mean_rescaled_rank, 0.25);
        assert_eq!(summary[1].reference_group, "B");
        assert_eq!(summary[1].n_markers, 2);
        assert_eq!(summary[1].median_rescaled_rank, 0.875);
    }

    #[test]
    fn no_markers_is_none_not_empty() {
        let reference = table("r", vec![row("g1", "A", 1, 3.0, true)]);
        let q = query();
        assert!(
            mark_reference(&q, "B", &reference, &MarkerParams::default())
                .unwrap()
                .is_none()
        );
        let disjoint = table("r", vec![row("g9", "A", 1, 3.0, true)]);
        assert!(
            mark_reference(&q, "A", &disjoint, &MarkerParams::default())
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            mark_reference(&q, "C", &reference, &MarkerParams::default()),
            Err(ContrastError::UnknownGroup { .. })
        ));
    }

    #[test]
    fn zero_marker_count_is_rejected() {
        let reference = table("r", vec![row("g1", "A", 1, 3.0, true)]);
        let zero = params(MarkerPolicy::TopByInnerCi, 0);
        let single = mark_reference(&query(), "A", &reference, &zero).unwrap_err();
        assert!(matches!(single, ContrastError::InvalidInput(_)));
        assert!(single.is_configuration());
        let batch = mark_reference_all(&query(), &reference, &zero).unwrap_err();
        assert!(batch.is_configuration());
    }

    #[test]
    fn batch_marking_stamps_query_dataset() {
        let reference = table("r", vec![row("g1", "B", 1, 3.0, true)]);
        let marked = mark_reference_all(&query(), &reference, &MarkerParams::default()).unwrap();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked.rows[0].test_dataset.as_deref(), Some("q"));
        assert_eq!(marked.rows[0].test_group, "A");

        let nothing = table("r", vec![row("g9", "B", 1, 3.0, true)]);
        let empty = mark_reference_all(&query(), &nothing, &MarkerParams::default()).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.reference_dataset, "r");
    }
}
