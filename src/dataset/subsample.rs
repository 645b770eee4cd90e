//! Seeded random down-sampling of cells.
//!
//! Every call builds its own `StdRng` from the seed held by the
//! [`CellSubsampler`], so the result depends only on the seed and the labels,
//! never on which thread runs it or in which order groups are processed.
//! Kept cells are always returned in their original order.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use tracing::debug;

use crate::dataset::GroupLabels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSubsampler {
    seed: u64,
}

impl CellSubsampler {
    pub fn new(seed: u64) -> Self {
        CellSubsampler { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Keep up to `n_group` cells of `group` and up to `n_other` of all other cells.
    ///
    /// `None` means no cap. Other groups are sampled as one pool, so their
    /// relative proportions are preserved in expectation. When both sides
    /// already fit under their caps every cell is returned.
    pub fn group_vs_rest(
        &self,
        groups: &GroupLabels,
        group: usize,
        n_group: Option<usize>,
        n_other: Option<usize>,
    ) -> Vec<usize> {
        let (target, other): (Vec<usize>, Vec<usize>) =
            (0..groups.len()).partition(|&cell| groups.codes()[cell] == group);

        let fits = |pool: &[usize], cap: Option<usize>| cap.is_none_or(|cap| pool.len() <= cap);
        if fits(&target, n_group) && fits(&other, n_other) {
            return (0..groups.len()).collect();
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut kept = sample_pool(&mut rng, &target, n_group);
        kept.extend(sample_pool(&mut rng, &other, n_other));
        kept.sort_unstable();

        debug!(
            group = groups.levels()[group].as_str(),
            target = target.len(),
            other = other.len(),
            kept = kept.len(),
            "subsampled cells for group contrast"
        );
        kept
    }

    /// Keep up to `n_group` cells of every group independently.
    ///
    /// Group proportions are not preserved; this is meant for shrinking a
    /// dataset up front rather than for a single contrast.
    pub fn per_group(&self, groups: &GroupLabels, n_group: usize) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut kept: Vec<usize> = (0..groups.levels().len())
            .flat_map(|level| sample_pool(&mut rng, &groups.cells_in(level), Some(n_group)))
            .collect();
        kept.sort_unstable();
        debug!(kept = kept.len(), total = groups.len(), "subsampled cells per group");
        kept
    }
}

fn sample_pool(rng: &mut StdRng, pool: &[usize], cap: Option<usize>) -> Vec<usize> {
    match cap {
        Some(cap) if pool.len() > cap => {
            let mut picked = index::sample(rng, pool.len(), cap).into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|i| pool[i]).collect()
        }
        _ => pool.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> GroupLabels {
        let raw: Vec<&str> = (0..60)
            .map(|i| match i % 6 {
                0 => "a",
                1 | 2 => "b",
                _ => "c",
            })
            .collect();
        GroupLabels::from_labels(&raw)
    }

    #[test]
    fn unlimited_caps_are_a_no_op() {
        let groups = labels();
        let kept = CellSubsampler::new(1).group_vs_rest(&groups, 0, None, None);
        assert_eq!(kept, (0..60).collect::<Vec<_>>());
    }

    #[test]
    fn caps_that_already_fit_are_a_no_op() {
        let groups = labels();
        let kept = CellSubsampler::new(1).group_vs_rest(&groups, 0, Some(10), Some(50));
        assert_eq!(kept.len(), 60);
    }

    #[test]
    fn group_vs_rest_respects_caps_and_order() {
        let groups = labels();
        let kept = CellSubsampler::new(42).group_vs_rest(&groups, 0, Some(4), Some(12));
        assert_eq!(kept.len(), 16);
        assert!(kept.windows(2).all(|w| w[0] < w[1]));
        let in_group = kept.iter().filter(|&&c| groups.codes()[c] == 0).count();
        assert_eq!(in_group, 4);
    }

    #[test]
    fn same_seed_same_cells() {
        let groups = labels();
        let a = CellSubsampler::new(7).group_vs_rest(&groups, 1, Some(5), Some(8));
        let b = CellSubsampler::new(7).group_vs_rest(&groups, 1, Some(5), Some(8));
        assert_eq!(a, b);

        let c = CellSubsampler::new(7).per_group(&groups, 3);
        let d = CellSubsampler::new(7).per_group(&groups, 3);
        assert_eq!(c, d);
    }

    #[test]
    fn per_group_caps_every_group() {
        let groups = labels();
        let kept = CellSubsampler::new(3).per_group(&groups, 8);
        let sub = groups.select(&kept);
        // a has 10 cells, b 20 and c 30
        assert_eq!(sub.level_sizes(), vec![8, 8, 8]);
        assert!(kept.windows(2).all(|w| w[0] < w[1]));

        let all = CellSubsampler::new(3).per_group(&groups, 100);
        assert_eq!(all, (0..60).collect::<Vec<_>>());
    }
}
