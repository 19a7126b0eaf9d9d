//! Random partitions independent of identity assignment.

use crate::{grudge::Grudge, identity::Node};
use rand::{seq::SliceRandom, Rng};
use std::collections::{BTreeMap, BTreeSet};

/// Split `nodes` into two random halves (the first holding `floor(n / 2)` nodes).
pub fn half_split<R: Rng + ?Sized>(nodes: &[Node], rng: &mut R) -> Grudge {
    let mut shuffled = nodes.to_vec();
    shuffled.shuffle(rng);
    let (a, b) = shuffled.split_at(shuffled.len() / 2);
    Grudge::from_components(&[a.to_vec(), b.to_vec()])
}

/// Cut a single random node off from the rest.
pub fn isolate_one<R: Rng + ?Sized>(nodes: &[Node], rng: &mut R) -> Grudge {
    let Some(isolated) = nodes.choose(rng) else {
        return Grudge::default();
    };
    let rest: Vec<Node> = nodes.iter().filter(|n| *n != isolated).cloned().collect();
    Grudge::from_components(&[vec![isolated.clone()], rest])
}

/// Arrange `nodes` in a random ring and let each node reach only the nodes within ring distance
/// `ceil((m - 1) / 2)` of itself, where `m` is a majority of the cluster.
///
/// Every node sees a contiguous arc of at least `m` nodes centered on itself. Ring distance is
/// symmetric, so the grudge is too.
pub fn majority_ring<R: Rng + ?Sized>(nodes: &[Node], rng: &mut R) -> Grudge {
    let mut ring = nodes.to_vec();
    ring.shuffle(rng);
    let n = ring.len();
    let majority = n / 2 + 1;
    let radius = (majority - 1).div_ceil(2);

    let mut drops = BTreeMap::new();
    for (i, node) in ring.iter().enumerate() {
        let dropped: BTreeSet<Node> = ring
            .iter()
            .enumerate()
            .filter(|(j, _)| {
                let d = i.abs_diff(*j);
                d.min(n - d) > radius
            })
            .map(|(_, other)| other.clone())
            .collect();
        drops.insert(node.clone(), dropped);
    }
    Grudge::from_drops(drops)
}
