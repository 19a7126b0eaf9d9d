//! Decide which physical nodes impersonate which validator identity.
//!
//! A [Cluster] is an ordered list of distinct [Node]s. An [Assignment] maps some nodes (the
//! clones) to another node (the origin) whose validator key they will run with. Nodes absent from
//! the assignment are their own identity. Grouping nodes by identity yields [Group]s, which
//! partition the cluster.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};
use tracing::info;

/// Numerator and denominator of `1 / 3.01`, the fraction of the cluster made into clones.
///
/// `floor(n * 100 / 301)` is strictly below `n / 3` for every `n`.
const CLONE_FRACTION: (usize, usize) = (100, 301);

/// Opaque identifier of a physical node (address or hostname).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Node(String);

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Node {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Node {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// An ordered sequence of distinct nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// Create a cluster, rejecting empty or duplicated membership.
    pub fn new(nodes: Vec<Node>) -> Result<Self, Error> {
        if nodes.is_empty() {
            return Err(Error::EmptyCluster);
        }
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node) {
                return Err(Error::DuplicateNode(node.clone()));
            }
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.contains(node)
    }

    /// Position of a node in cluster order.
    pub fn position(&self, node: &Node) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }
}

/// The set of nodes sharing one validator identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    identity: Node,
    members: Vec<Node>,
}

impl Group {
    /// The node whose key every member runs with.
    pub fn identity(&self) -> &Node {
        &self.identity
    }

    /// Members in the order they were supplied.
    pub fn members(&self) -> &[Node] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns true if more than one node holds this identity.
    pub fn is_duplicated(&self) -> bool {
        self.members.len() > 1
    }
}

/// Mapping from clone to the origin it impersonates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignment {
    origins: BTreeMap<Node, Node>,
}

impl Assignment {
    /// An assignment in which every node is its own identity.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create an assignment from explicit `clone -> origin` pairs.
    ///
    /// Every node must belong to `cluster`, origins may not be clones themselves, and the number
    /// of clones must be strictly less than a third of the cluster.
    pub fn new(cluster: &Cluster, origins: BTreeMap<Node, Node>) -> Result<Self, Error> {
        for (clone, origin) in &origins {
            if !cluster.contains(clone) {
                return Err(Error::UnknownNode(clone.clone()));
            }
            if !cluster.contains(origin) {
                return Err(Error::UnknownNode(origin.clone()));
            }
            if clone == origin {
                return Err(Error::SelfImpersonation(clone.clone()));
            }
            if origins.contains_key(origin) {
                return Err(Error::ChainedImpersonation {
                    clone: clone.clone(),
                    origin: origin.clone(),
                });
            }
        }
        if 3 * origins.len() >= cluster.len() && !origins.is_empty() {
            return Err(Error::TooManyClones {
                clones: origins.len(),
                nodes: cluster.len(),
            });
        }
        Ok(Self { origins })
    }

    /// Decide which nodes impersonate which identity.
    ///
    /// When enabled, the first `floor(n / 3.01)` nodes of the cluster become clones of the node
    /// that immediately follows them.
    pub fn assign(cluster: &Cluster, enabled: bool) -> Result<Self, Error> {
        if !enabled {
            return Ok(Self::none());
        }
        let n = cluster.len();
        let clones = n * CLONE_FRACTION.0 / CLONE_FRACTION.1;
        if clones == 0 || clones >= n {
            return Err(Error::DuplicationInfeasible(n));
        }
        let origin = &cluster.nodes()[clones];
        let origins = cluster.nodes()[..clones]
            .iter()
            .map(|clone| (clone.clone(), origin.clone()))
            .collect();
        let assignment = Self::new(cluster, origins)?;
        info!(clones, %origin, "assigned duplicated identity");
        Ok(assignment)
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// Number of clones.
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    /// Iterate over `(clone, origin)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Node, &Node)> {
        self.origins.iter()
    }

    /// The origin impersonated by `node`, if `node` is a clone.
    pub fn origin(&self, node: &Node) -> Option<&Node> {
        self.origins.get(node)
    }

    /// The identity `node` votes with (its origin, or itself).
    pub fn identity<'a>(&'a self, node: &'a Node) -> &'a Node {
        self.origins.get(node).unwrap_or(node)
    }

    /// Group `nodes` by identity.
    ///
    /// Groups are returned in order of their first member's appearance in `nodes`, and members
    /// keep the order in which they appear. Only the supplied nodes are considered, so grouping
    /// a subset of the cluster yields groups restricted to that subset.
    pub fn groups<'a>(&self, nodes: impl IntoIterator<Item = &'a Node>) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        let mut index: BTreeMap<&Node, usize> = BTreeMap::new();
        for node in nodes {
            let identity = self.identity(node);
            match index.get(identity) {
                Some(&i) => {
                    if !groups[i].members.contains(node) {
                        groups[i].members.push(node.clone());
                    }
                }
                None => {
                    index.insert(identity, groups.len());
                    groups.push(Group {
                        identity: identity.clone(),
                        members: vec![node.clone()],
                    });
                }
            }
        }
        groups
    }
}
