//! Allocate per-node voting power.
//!
//! Without duplication every node gets weight [UNIFORM_WEIGHT]. With a duplicated identity among
//! `n` identity groups, every singleton member gets [SINGLE_WEIGHT] and every member of the
//! duplicated group gets `4 * (n - 1) - 1` (see [duplicated_weight]).
//!
//! The duplicated weight is assigned to each member rather than divided among them. Genesis keeps
//! a single record per public key, so whichever clone's record survives deduplication carries the
//! same weight. The identity-level totals are then:
//!
//! ```text
//! non-duplicated bloc = 2 * (n - 1)
//! duplicated identity = 4 * (n - 1) - 1
//! total               = 6 * (n - 1) - 1
//! ```
//!
//! which keeps the duplicated identity strictly below 2/3 of the total (and the rest strictly
//! above 1/3) for every `n`.

use crate::{
    identity::{Assignment, Cluster, Node},
    Error,
};
use std::collections::BTreeMap;
use tracing::info;

/// Weight of every node when no identity is duplicated.
pub const UNIFORM_WEIGHT: u64 = 1;

/// Weight of every node holding a non-duplicated identity.
pub const SINGLE_WEIGHT: u64 = 2;

/// Weight of each member of the duplicated identity when there are `groups` identity groups.
///
/// Returns `None` if there are fewer than two groups.
pub fn duplicated_weight(groups: usize) -> Option<u64> {
    let others = (groups as u64).checked_sub(1)?;
    (4 * others).checked_sub(1)
}

/// Voting weight of every node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Weights {
    weights: BTreeMap<Node, u64>,
    identities: BTreeMap<Node, u64>,
    duplicated: Option<Node>,
}

impl Weights {
    /// Compute weights for `cluster` given `assignment`.
    pub fn allocate(cluster: &Cluster, assignment: &Assignment) -> Result<Self, Error> {
        let groups = assignment.groups(cluster.iter());
        let mut weights = BTreeMap::new();
        let mut identities = BTreeMap::new();
        if assignment.is_empty() {
            for node in cluster.iter() {
                weights.insert(node.clone(), UNIFORM_WEIGHT);
                identities.insert(node.clone(), UNIFORM_WEIGHT);
            }
            return Ok(Self {
                weights,
                identities,
                duplicated: None,
            });
        }

        // Exactly one identity may be held by more than one node
        let duplicated: Vec<_> = groups.iter().filter(|g| g.is_duplicated()).collect();
        if duplicated.len() != 1 {
            return Err(Error::MultipleDuplicatedIdentities(duplicated.len()));
        }
        let duplicated = duplicated[0].identity().clone();
        let heavy =
            duplicated_weight(groups.len()).ok_or(Error::DuplicationInfeasible(cluster.len()))?;

        // Assign the same weight to every member of a group
        for group in &groups {
            let weight = if group.is_duplicated() {
                heavy
            } else {
                SINGLE_WEIGHT
            };
            for member in group.members() {
                weights.insert(member.clone(), weight);
            }
            identities.insert(group.identity().clone(), weight);
        }
        let total: u64 = identities.values().sum();
        info!(
            groups = groups.len(),
            single = SINGLE_WEIGHT,
            duplicated = heavy,
            total,
            "allocated weights"
        );
        Ok(Self {
            weights,
            identities,
            duplicated: Some(duplicated),
        })
    }

    /// Weight of `node`.
    pub fn get(&self, node: &Node) -> Option<u64> {
        self.weights.get(node).copied()
    }

    /// Iterate over `(node, weight)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Node, u64)> {
        self.weights.iter().map(|(node, weight)| (node, *weight))
    }

    /// Voting power of each identity after deduplication.
    pub fn identities(&self) -> impl Iterator<Item = (&Node, u64)> {
        self.identities.iter().map(|(node, weight)| (node, *weight))
    }

    /// Total voting power after deduplication.
    pub fn total_power(&self) -> u64 {
        self.identities.values().sum()
    }

    /// The identity held by more than one node, if any.
    pub fn duplicated(&self) -> Option<&Node> {
        self.duplicated.as_ref()
    }

    /// Voting power of the duplicated identity and the total, as a fraction.
    pub fn duplicated_share(&self) -> Option<(u64, u64)> {
        let identity = self.duplicated.as_ref()?;
        let power = *self.identities.get(identity)?;
        Some((power, self.total_power()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::cluster;
    use commonware_macros::test_traced;

    /// Returns true if `a / b < c / d`.
    fn less(a: u64, b: u64, c: u64, d: u64) -> bool {
        (a as u128) * (d as u128) < (c as u128) * (b as u128)
    }

    #[test]
    fn test_uniform_without_duplication() {
        let cluster = cluster(4);
        let weights = Weights::allocate(&cluster, &Assignment::none()).unwrap();
        assert!(weights.iter().all(|(_, w)| w == UNIFORM_WEIGHT));
        assert_eq!(weights.total_power(), 4);
        assert_eq!(weights.duplicated_share(), None);
    }

    #[test_traced]
    fn test_five_nodes() {
        let cluster = cluster(5);
        let assignment = Assignment::assign(&cluster, true).unwrap();
        let weights = Weights::allocate(&cluster, &assignment).unwrap();

        assert_eq!(weights.get(&"n1".into()), Some(11));
        assert_eq!(weights.get(&"n2".into()), Some(11));
        for single in ["n3", "n4", "n5"] {
            assert_eq!(weights.get(&single.into()), Some(2));
        }
        assert_eq!(weights.duplicated(), Some(&Node::from("n2")));
        assert_eq!(weights.total_power(), 17);
        assert_eq!(weights.duplicated_share(), Some((11, 17)));
        assert!(less(11, 17, 2, 3));
    }

    #[test]
    fn test_identical_weight_within_group() {
        for n in 4..=40 {
            let cluster = cluster(n);
            let assignment = Assignment::assign(&cluster, true).unwrap();
            let weights = Weights::allocate(&cluster, &assignment).unwrap();
            for group in assignment.groups(cluster.iter()) {
                let first = weights.get(&group.members()[0]).unwrap();
                assert!(group.members().iter().all(|m| weights.get(m) == Some(first)));
            }
        }
    }

    #[test]
    fn test_share_bounds() {
        let mut previous = (0u64, 1u64);
        for groups in 2..=10_000usize {
            let heavy = duplicated_weight(groups).unwrap();
            let bloc = SINGLE_WEIGHT * (groups as u64 - 1);
            let total = heavy + bloc;
            assert_eq!(total, 6 * (groups as u64 - 1) - 1);

            // Duplicated identity strictly below 2/3, remainder strictly above 1/3
            assert!(less(heavy, total, 2, 3), "groups={groups}");
            assert!(less(1, 3, bloc, total), "groups={groups}");

            // Share grows toward 2/3
            assert!(less(previous.0, previous.1, heavy, total), "groups={groups}");
            previous = (heavy, total);
        }
    }

    #[test]
    fn test_duplicated_weight_small() {
        assert_eq!(duplicated_weight(0), None);
        assert_eq!(duplicated_weight(1), None);
        assert_eq!(duplicated_weight(2), Some(3));
        assert_eq!(duplicated_weight(4), Some(11));
    }

    #[test]
    fn test_rejects_multiple_duplicated_identities() {
        let cluster = cluster(7);
        let origins = [("n1", "n3"), ("n2", "n4")]
            .into_iter()
            .map(|(c, o)| (Node::from(c), Node::from(o)))
            .collect();
        let assignment = Assignment::new(&cluster, origins).unwrap();
        let result = Weights::allocate(&cluster, &assignment);
        assert!(matches!(result, Err(Error::MultipleDuplicatedIdentities(2))));
    }
}
