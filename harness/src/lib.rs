//! Inject duplicated validator identities and network faults into a BFT cluster and record a
//! checkable register history.
//!
//! # Overview
//!
//! A run proceeds in four stages:
//!
//! 1. [identity] decides which physical nodes secretly share one validator identity (the
//!    "clones" of an "origin") and [weights] allocates voting power so that the duplicated
//!    identity never controls 2/3 of the total, no matter which clone's record survives
//!    deduplication in genesis.
//! 2. [setup] provisions every node through an external [setup::Provisioner], handing clones the
//!    key of their origin through a one-shot [keys::Registry] and installing a deduplicated
//!    [genesis::Genesis].
//! 3. [runner] drives concurrent per-key register operations ([generator], [client]) while a
//!    [nemesis] injects faults on a schedule. The `duplicate-identity-partition` profile uses
//!    [grudge] to keep exactly one clone reachable at a time, handing it the full weight of the
//!    shared identity.
//! 4. The resulting [history::History] is handed to an external [checker::Checker] that judges
//!    linearizability per key.
//!
//! # Status
//!
//! `bft-harness` is **ALPHA** software. Expect breaking changes.

use std::path::PathBuf;
use thiserror::Error;

pub mod checker;
pub mod client;
pub mod config;
pub mod generator;
pub mod genesis;
pub mod grudge;
pub mod history;
pub mod identity;
pub mod keys;
pub mod mocks;
pub mod nemesis;
pub mod runner;
pub mod setup;
pub mod ssh;
pub mod weights;

/// Errors that abort a run.
///
/// Failures of individual register operations are never surfaced here: they are classified
/// into [history::ErrorKind] and recorded in the history instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cluster is empty")]
    EmptyCluster,
    #[error("duplicate node in cluster: {0}")]
    DuplicateNode(identity::Node),
    #[error("unknown node: {0}")]
    UnknownNode(identity::Node),
    #[error("node cannot impersonate itself: {0}")]
    SelfImpersonation(identity::Node),
    #[error("clone {clone} impersonates {origin}, which is itself a clone")]
    ChainedImpersonation {
        clone: identity::Node,
        origin: identity::Node,
    },
    #[error("too many clones for cluster of {nodes}: {clones} (must be < n/3)")]
    TooManyClones { clones: usize, nodes: usize },
    #[error("duplicated identity not applicable to a cluster of {0} nodes")]
    DuplicationInfeasible(usize),
    #[error("unsupported: more than one duplicated identity ({0})")]
    MultipleDuplicatedIdentities(usize),
    #[error("unknown nemesis profile: {0}")]
    UnknownProfile(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("validator key already published for {0}")]
    KeyAlreadyPublished(identity::Node),
    #[error("invalid validator key for {node}: {reason}")]
    InvalidKey { node: identity::Node, reason: String },
    #[error("public key shared by nodes with different weights: {0} and {1}")]
    InconsistentWeight(identity::Node, identity::Node),
    #[error("missing weight for {0}")]
    MissingWeight(identity::Node),
    #[error("ssh to {host} failed after {attempts} attempts: {command}")]
    Ssh {
        host: String,
        command: String,
        attempts: usize,
    },
    #[error("scp of {local} to {host} failed after {attempts} attempts")]
    Scp {
        host: String,
        local: PathBuf,
        attempts: usize,
    },
    #[error("checker failed to start: {0}")]
    Checker(String),
    #[error("task failed: {0}")]
    Task(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
