//! Provision every node with its validator key and a shared genesis.

use crate::{
    genesis::Genesis,
    identity::{Assignment, Cluster, Node},
    keys::{Registry, ValidatorKey},
    weights::Weights,
    Error,
};
use chrono::Utc;
use futures::future::try_join_all;
use std::{collections::BTreeMap, future::Future, path::PathBuf};
use tracing::{debug, info, warn};

/// Cluster lifecycle operations performed on behalf of the harness.
pub trait Provisioner: Send + Sync {
    /// Generate a fresh validator key on `node`.
    fn generate_key(&self, node: &Node)
        -> impl Future<Output = Result<ValidatorKey, Error>> + Send;

    /// Install `key` and `genesis` on `node` and start it.
    fn install(
        &self,
        node: &Node,
        key: &ValidatorKey,
        genesis: &Genesis,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Stop `node` and remove its state.
    fn teardown(&self, node: &Node) -> impl Future<Output = Result<(), Error>> + Send;

    /// Log files worth collecting from `node`.
    fn log_files(&self, node: &Node) -> Vec<PathBuf>;
}

/// Obtain the key `node` runs with: its own, or the one published by its origin.
async fn obtain<P: Provisioner>(
    provisioner: &P,
    registry: &Registry,
    assignment: &Assignment,
    node: &Node,
) -> Result<(Node, ValidatorKey), Error> {
    let key = match assignment.origin(node) {
        Some(origin) => {
            debug!(%node, %origin, "waiting for origin key");
            registry.wait(origin).await
        }
        None => {
            let key = provisioner.generate_key(node).await?;
            registry.publish(node, key.clone())?;
            debug!(%node, "published key");
            key
        }
    };
    Ok((node.clone(), key))
}

/// Provision the cluster, returning the installed genesis.
pub async fn setup<P: Provisioner>(
    provisioner: &P,
    registry: &Registry,
    cluster: &Cluster,
    assignment: &Assignment,
    weights: &Weights,
    chain_id: &str,
) -> Result<Genesis, Error> {
    // Generate keys (clones wait for their origin)
    let keys = try_join_all(
        cluster
            .iter()
            .map(|node| obtain(provisioner, registry, assignment, node)),
    )
    .await?;
    let keys: BTreeMap<Node, ValidatorKey> = keys.into_iter().collect();
    info!(nodes = cluster.len(), "collected validator keys");

    // Assemble genesis
    let genesis = Genesis::assemble(chain_id, Utc::now(), cluster, weights, &keys)?;
    info!(
        validators = genesis.validators.len(),
        total_power = genesis.total_power(),
        "assembled genesis"
    );

    // Install on every node
    try_join_all(cluster.iter().map(|node| {
        let key = &keys[node];
        let genesis = &genesis;
        async move {
            provisioner.install(node, key, genesis).await?;
            debug!(%node, "installed node");
            Ok::<_, Error>(())
        }
    }))
    .await?;
    info!("cluster provisioned");
    Ok(genesis)
}

/// Tear down every node and forget distributed keys.
///
/// Every node is attempted; the first failure is returned.
pub async fn teardown<P: Provisioner>(
    provisioner: &P,
    registry: &Registry,
    cluster: &Cluster,
) -> Result<(), Error> {
    let results = futures::future::join_all(cluster.iter().map(|node| async move {
        let result = provisioner.teardown(node).await;
        if let Err(e) = &result {
            warn!(%node, error = ?e, "teardown failed");
        }
        result
    }))
    .await;
    registry.clear();
    for node in cluster.iter() {
        for path in provisioner.log_files(node) {
            info!(%node, path = %path.display(), "log file");
        }
    }
    results.into_iter().collect()
}
