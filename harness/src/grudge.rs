//! Build network partitions that exploit a duplicated identity.
//!
//! A [Grudge] records, for every node, the set of nodes it must drop traffic from. Partitions
//! expressed as disjoint components (see [Grudge::from_components]) are symmetric by
//! construction.
//!
//! [Builder] turns the identity assignment into a partition that keeps exactly one member of the
//! duplicated identity reachable (alongside every other identity) and isolates each remaining
//! member on its own. The reachable member is drawn afresh on every call, so successive
//! activations of the nemesis hand the identity's full weight to different physical nodes.

use crate::{
    identity::{Assignment, Cluster, Node},
    Error,
};
use rand::{seq::SliceRandom, Rng};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A partition plan: which nodes each node refuses to hear from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Grudge {
    drops: BTreeMap<Node, BTreeSet<Node>>,
}

impl Grudge {
    /// Build a grudge in which nodes communicate only within their own component.
    pub fn from_components(components: &[Vec<Node>]) -> Self {
        let mut drops = BTreeMap::new();
        for (i, component) in components.iter().enumerate() {
            let others: BTreeSet<Node> = components
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .flat_map(|(_, other)| other.iter().cloned())
                .collect();
            for node in component {
                drops.insert(node.clone(), others.clone());
            }
        }
        Self { drops }
    }

    /// Build a grudge from explicit per-node drop sets.
    pub fn from_drops(drops: BTreeMap<Node, BTreeSet<Node>>) -> Self {
        Self { drops }
    }

    /// Nodes covered by this grudge.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.drops.keys()
    }

    /// Nodes `node` drops traffic from.
    pub fn drops(&self, node: &Node) -> Option<&BTreeSet<Node>> {
        self.drops.get(node)
    }

    /// Iterate over `(node, dropped)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Node, &BTreeSet<Node>)> {
        self.drops.iter()
    }

    /// Returns true if `to` accepts traffic from `from`.
    pub fn reachable(&self, from: &Node, to: &Node) -> bool {
        self.drops
            .get(to)
            .map(|dropped| !dropped.contains(from))
            .unwrap_or(true)
    }

    /// Returns true if no node drops any traffic.
    pub fn is_healed(&self) -> bool {
        self.drops.values().all(|dropped| dropped.is_empty())
    }

    /// Recover the components of a grudge built with [Grudge::from_components].
    ///
    /// Returns `None` if the grudge does not describe a partition into disjoint components (for
    /// example, a ring of overlapping arcs).
    pub fn components(&self) -> Option<Vec<Vec<Node>>> {
        let mut components: Vec<Vec<Node>> = Vec::new();
        let mut seen = BTreeSet::new();
        for (node, dropped) in &self.drops {
            if seen.contains(node) {
                continue;
            }
            let component: Vec<Node> = self
                .drops
                .keys()
                .filter(|other| !dropped.contains(*other))
                .cloned()
                .collect();
            for member in &component {
                if !seen.insert(member.clone()) {
                    return None;
                }
                if self.drops.get(member) != Some(dropped) {
                    return None;
                }
            }
            components.push(component);
        }
        Some(components)
    }

    /// Returns true if every drop is mirrored by the dropped node.
    pub fn is_symmetric(&self) -> bool {
        self.drops.iter().all(|(node, dropped)| {
            dropped
                .iter()
                .all(|other| self.drops.get(other).is_some_and(|d| d.contains(node)))
        })
    }
}

/// The two sides of a duplicated-identity partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    /// One member of every identity, including the chosen representative of the duplicated one.
    pub main: Vec<Node>,
    /// Remaining members of the duplicated identity, each unreachable from everyone.
    pub isolated: Vec<Node>,
}

impl Split {
    /// Convert into a [Grudge] with `main` as one component and each isolated node alone.
    pub fn grudge(&self) -> Grudge {
        let mut components = Vec::with_capacity(1 + self.isolated.len());
        if !self.main.is_empty() {
            components.push(self.main.clone());
        }
        components.extend(self.isolated.iter().map(|node| vec![node.clone()]));
        Grudge::from_components(&components)
    }
}

/// Builds partitions around the duplicated identity.
#[derive(Clone, Debug)]
pub struct Builder {
    cluster: Cluster,
    assignment: Assignment,
}

impl Builder {
    /// Create a builder, rejecting assignments that duplicate more than one identity.
    pub fn new(cluster: Cluster, assignment: Assignment) -> Result<Self, Error> {
        let duplicated = assignment
            .groups(cluster.iter())
            .iter()
            .filter(|g| g.is_duplicated())
            .count();
        if duplicated > 1 {
            return Err(Error::MultipleDuplicatedIdentities(duplicated));
        }
        Ok(Self {
            cluster,
            assignment,
        })
    }

    /// Returns true if some identity is duplicated.
    pub fn is_active(&self) -> bool {
        !self.assignment.is_empty()
    }

    /// Split `live` into a main component and isolated clones.
    ///
    /// `live` is normalized to cluster order (unknown nodes are kept, after the known ones) so the
    /// result depends only on the set of live nodes and the supplied randomness.
    pub fn split<R: Rng + ?Sized>(&self, live: &[Node], rng: &mut R) -> Split {
        let mut live: Vec<&Node> = live.iter().collect();
        live.sort_by_key(|node| self.cluster.position(node).unwrap_or(usize::MAX));
        live.dedup();

        let mut main = Vec::with_capacity(live.len());
        let mut isolated = Vec::new();
        for group in self.assignment.groups(live) {
            if !group.is_duplicated() {
                main.extend_from_slice(group.members());
                continue;
            }
            let representative = group
                .members()
                .choose(rng)
                .cloned()
                .unwrap_or_else(|| group.identity().clone());
            for member in group.members() {
                if *member == representative {
                    main.push(member.clone());
                } else {
                    isolated.push(member.clone());
                }
            }
        }
        main.sort_by_key(|node| self.cluster.position(node).unwrap_or(usize::MAX));
        Split { main, isolated }
    }

    /// Build a fresh grudge over `live`.
    pub fn build<R: Rng + ?Sized>(&self, live: &[Node], rng: &mut R) -> Grudge {
        self.split(live, rng).grudge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::cluster;
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::HashMap;

    fn builder(n: usize) -> Builder {
        let cluster = cluster(n);
        let assignment = Assignment::assign(&cluster, true).unwrap();
        Builder::new(cluster, assignment).unwrap()
    }

    /// Asserts that `grudge` covers `live` exactly once and is symmetric.
    fn assert_well_formed(grudge: &Grudge, live: &[Node]) {
        let covered: BTreeSet<&Node> = grudge.nodes().collect();
        let expected: BTreeSet<&Node> = live.iter().collect();
        assert_eq!(covered, expected);
        assert!(grudge.is_symmetric());
    }

    #[test_traced]
    fn test_split_ten_nodes() {
        let builder = builder(10);
        let cluster = cluster(10);
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let split = builder.split(cluster.nodes(), &mut rng);
            let grudge = split.grudge();
            assert_well_formed(&grudge, cluster.nodes());

            // One representative of {n1, n2, n3, n4} plus six singles
            assert_eq!(split.main.len(), 7);
            assert_eq!(split.isolated.len(), 3);
            let duplicated: Vec<Node> = ["n1", "n2", "n3", "n4"].map(Node::from).into();
            let representatives: Vec<_> = split
                .main
                .iter()
                .filter(|n| duplicated.contains(*n))
                .collect();
            assert_eq!(representatives.len(), 1);

            // Isolated nodes reach nobody and nobody reaches them
            for node in &split.isolated {
                for other in cluster.iter().filter(|o| *o != node) {
                    assert!(!grudge.reachable(node, other));
                    assert!(!grudge.reachable(other, node));
                }
            }

            // Main is fully connected
            for a in &split.main {
                for b in &split.main {
                    assert!(grudge.reachable(a, b));
                }
            }
        }
    }

    #[test]
    fn test_representative_distribution() {
        let builder = builder(10);
        let cluster = cluster(10);
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts: HashMap<Node, usize> = HashMap::new();
        for _ in 0..4_000 {
            let split = builder.split(cluster.nodes(), &mut rng);
            let representative = split
                .main
                .iter()
                .find(|n| ["n1", "n2", "n3", "n4"].contains(&n.as_str()))
                .unwrap()
                .clone();
            *counts.entry(representative).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!(*count > 700, "{counts:?}");
        }
    }

    #[test]
    fn test_deterministic_given_rng() {
        let builder = builder(7);
        let cluster = cluster(7);
        let a = builder.build(cluster.nodes(), &mut StdRng::seed_from_u64(7));
        let b = builder.build(cluster.nodes(), &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_live_subset() {
        let builder = builder(10);
        let live: Vec<Node> = ["n8", "n2", "n3", "n9"].map(Node::from).into();
        let mut rng = StdRng::seed_from_u64(3);
        let split = builder.split(&live, &mut rng);
        assert_well_formed(&split.grudge(), &live);
        assert_eq!(split.main.len(), 3);
        assert_eq!(split.isolated.len(), 1);

        // A single live clone is not isolated
        let live: Vec<Node> = ["n3", "n9"].map(Node::from).into();
        let split = builder.split(&live, &mut rng);
        assert_eq!(split.main, live);
        assert!(split.isolated.is_empty());
        assert!(split.grudge().is_healed());
    }

    #[test]
    fn test_no_duplication() {
        let cluster = cluster(5);
        let builder = Builder::new(cluster.clone(), Assignment::none()).unwrap();
        assert!(!builder.is_active());
        let grudge = builder.build(cluster.nodes(), &mut StdRng::seed_from_u64(0));
        assert_well_formed(&grudge, cluster.nodes());
        assert!(grudge.is_healed());
    }

    #[test]
    fn test_from_components() {
        let a: Vec<Node> = ["n1", "n2"].map(Node::from).into();
        let b: Vec<Node> = ["n3"].map(Node::from).into();
        let grudge = Grudge::from_components(&[a, b]);
        assert!(grudge.is_symmetric());
        assert!(grudge.reachable(&"n1".into(), &"n2".into()));
        assert!(!grudge.reachable(&"n1".into(), &"n3".into()));
        assert!(!grudge.reachable(&"n3".into(), &"n2".into()));
        assert_eq!(grudge.drops(&"n3".into()).unwrap().len(), 2);

        let components = grudge.components().unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec![Node::from("n1"), Node::from("n2")]);
        assert_eq!(components[1], vec![Node::from("n3")]);
    }

    #[test]
    fn test_asymmetric_drops() {
        let mut drops = BTreeMap::new();
        drops.insert(Node::from("n1"), BTreeSet::from([Node::from("n2")]));
        drops.insert(Node::from("n2"), BTreeSet::new());
        assert!(!Grudge::from_drops(drops).is_symmetric());
    }
}
