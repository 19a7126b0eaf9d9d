//! Assemble the genesis document shared by every node.
//!
//! Clones install their origin's key, so several nodes contribute the same public key. Genesis
//! keeps exactly one validator record per public key (the first in cluster order). Weights are
//! identical within an identity group, so the surviving record always carries the right power.

use crate::{
    identity::{Cluster, Node},
    keys::{PublicKey, ValidatorKey},
    weights::Weights,
    Error,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Default chain identifier.
pub const DEFAULT_CHAIN_ID: &str = "bft-harness";

/// A validator entry in genesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub pub_key: PublicKey,
    pub power: u64,
    pub name: String,
}

/// Genesis document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub genesis_time: DateTime<Utc>,
    pub chain_id: String,
    pub validators: Vec<Validator>,
    pub app_hash: String,
}

impl Genesis {
    /// Build genesis from the key installed on each node and the weight table.
    pub fn assemble(
        chain_id: &str,
        genesis_time: DateTime<Utc>,
        cluster: &Cluster,
        weights: &Weights,
        keys: &BTreeMap<Node, ValidatorKey>,
    ) -> Result<Self, Error> {
        let mut validators = Vec::with_capacity(cluster.len());
        let mut seen: HashMap<&PublicKey, (&Node, u64)> = HashMap::new();
        for node in cluster.iter() {
            let key = keys.get(node).ok_or_else(|| Error::InvalidKey {
                node: node.clone(),
                reason: "no key installed".into(),
            })?;
            let power = weights
                .get(node)
                .ok_or_else(|| Error::MissingWeight(node.clone()))?;
            if let Some((first, existing)) = seen.get(key.public_key()) {
                if *existing != power {
                    return Err(Error::InconsistentWeight((*first).clone(), node.clone()));
                }
                debug!(%node, first = %first, "skipping duplicated validator record");
                continue;
            }
            seen.insert(key.public_key(), (node, power));
            validators.push(Validator {
                pub_key: key.public_key().clone(),
                power,
                name: node.to_string(),
            });
        }
        Ok(Self {
            genesis_time,
            chain_id: chain_id.to_string(),
            validators,
            app_hash: String::new(),
        })
    }

    /// Sum of validator power.
    pub fn total_power(&self) -> u64 {
        self.validators.iter().map(|v| v.power).sum()
    }
}
