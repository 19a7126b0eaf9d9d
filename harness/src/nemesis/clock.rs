//! Random clock offsets.

use crate::identity::Node;
use rand::{seq::SliceRandom, Rng};
use std::collections::BTreeMap;

/// Largest offset applied to a clock, in milliseconds (about 4.4 minutes).
pub const MAX_SKEW_MS: i64 = 262_144;

/// Offset applied to each skewed node, in milliseconds.
pub type Offsets = BTreeMap<Node, i64>;

/// Pick a random non-empty subset of `nodes` and an independent offset for each, uniform in
/// `[-MAX_SKEW_MS, MAX_SKEW_MS]`.
pub fn skew<R: Rng + ?Sized>(nodes: &[Node], rng: &mut R) -> Offsets {
    if nodes.is_empty() {
        return Offsets::new();
    }
    let count = rng.gen_range(1..=nodes.len());
    let chosen: Vec<Node> = nodes.choose_multiple(rng, count).cloned().collect();
    chosen
        .into_iter()
        .map(|node| (node, rng.gen_range(-MAX_SKEW_MS..=MAX_SKEW_MS)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::cluster;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::BTreeSet;

    #[test]
    fn test_skew_subset() {
        let cluster = cluster(5);
        let mut rng = StdRng::seed_from_u64(0);
        let mut sizes = BTreeSet::new();
        let mut signs = BTreeSet::new();
        for _ in 0..500 {
            let offsets = skew(cluster.nodes(), &mut rng);
            assert!(!offsets.is_empty());
            assert!(offsets.keys().all(|node| cluster.contains(node)));
            for offset in offsets.values() {
                assert!(offset.abs() <= MAX_SKEW_MS);
                signs.insert(offset.signum());
            }
            sizes.insert(offsets.len());
        }
        assert_eq!(sizes, (1..=5).collect());
        assert!(signs.contains(&1) && signs.contains(&-1));
        assert!(skew(&[], &mut rng).is_empty());
    }
}
