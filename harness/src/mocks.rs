//! In-memory implementations of every external collaborator.
//!
//! Useful for exercising a full run without a real cluster.

use crate::{
    client::{RpcError, Transport},
    genesis::Genesis,
    grudge::Grudge,
    identity::{Cluster, Node},
    keys::{PublicKey, ValidatorKey},
    nemesis::{Clocks, Net},
    setup::Provisioner,
    Error,
};
use serde_json::json;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// A cluster of `n` nodes named `n1` through `n{n}`.
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn cluster(n: usize) -> Cluster {
    Cluster::new((1..=n).map(|i| Node::from(format!("n{i}"))).collect())
        .expect("cluster must not be empty")
}

/// A key whose public value is `value`.
pub fn key(value: &str) -> ValidatorKey {
    let document = json!({
        "pub_key": { "type": "ed25519", "value": value },
        "priv_key": { "type": "ed25519", "value": format!("{value}-secret") },
    });
    ValidatorKey::from_document(&Node::from(value), document).expect("mock key is well-formed")
}

/// A linearizable register store shared by every node.
#[derive(Clone, Debug, Default)]
pub struct Register {
    values: Arc<Mutex<HashMap<u64, u64>>>,
}

impl Register {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        self.values.lock().unwrap().get(&key).copied()
    }
}

/// A failure to inject into the next transport call.
#[derive(Clone, Debug)]
pub enum MockFault {
    /// Never respond.
    Hang,
    /// Respond with an error without touching the register.
    Error(RpcError),
    /// Apply the operation, then respond with an error.
    Lost(RpcError),
}

/// A [Transport] backed by a [Register].
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    register: Register,
    faults: Arc<Mutex<VecDeque<MockFault>>>,
}

impl MockTransport {
    pub fn new(register: Register) -> Self {
        Self {
            register,
            faults: Arc::default(),
        }
    }

    /// Queue a fault; faults are consumed in order, one per call.
    pub fn inject(&self, fault: MockFault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    async fn apply<T>(
        &self,
        op: impl FnOnce(&mut HashMap<u64, u64>) -> Result<T, RpcError>,
    ) -> Result<T, RpcError> {
        let fault = self.faults.lock().unwrap().pop_front();
        match fault {
            None => op(&mut self.register.values.lock().unwrap()),
            Some(MockFault::Hang) => std::future::pending().await,
            Some(MockFault::Error(err)) => Err(err),
            Some(MockFault::Lost(err)) => {
                let _ = op(&mut self.register.values.lock().unwrap());
                Err(err)
            }
        }
    }
}

impl Transport for MockTransport {
    async fn read(&self, key: u64) -> Result<Option<u64>, RpcError> {
        self.apply(|values| Ok(values.get(&key).copied())).await
    }

    async fn write(&self, key: u64, value: u64) -> Result<(), RpcError> {
        self.apply(|values| {
            values.insert(key, value);
            Ok(())
        })
        .await
    }

    async fn cas(&self, key: u64, from: u64, to: u64) -> Result<(), RpcError> {
        self.apply(|values| match values.get_mut(&key) {
            None => Err(RpcError::UnknownAddress),
            Some(current) if *current != from => Err(RpcError::Unauthorized),
            Some(current) => {
                *current = to;
                Ok(())
            }
        })
        .await
    }
}

/// A network change observed by [MockNet].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetEvent {
    Partition(Grudge),
    Heal,
}

/// A [Net] that records every change.
#[derive(Clone, Debug, Default)]
pub struct MockNet {
    events: Arc<Mutex<Vec<NetEvent>>>,
    failing: Arc<Mutex<bool>>,
    partial: Arc<Mutex<bool>>,
}

impl MockNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent call.
    pub fn fail(&self) {
        *self.failing.lock().unwrap() = true;
    }

    /// Apply every subsequent partition, then report a failure.
    pub fn fail_partition(&self) {
        *self.partial.lock().unwrap() = true;
    }

    pub fn events(&self) -> Vec<NetEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: NetEvent) -> Result<(), Error> {
        if *self.failing.lock().unwrap() {
            return Err(Error::Task("injected network failure".into()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl Net for MockNet {
    async fn partition(&self, grudge: &Grudge) -> Result<(), Error> {
        self.push(NetEvent::Partition(grudge.clone()))?;
        if *self.partial.lock().unwrap() {
            return Err(Error::Task("partition applied on some nodes only".into()));
        }
        Ok(())
    }

    async fn heal(&self) -> Result<(), Error> {
        self.push(NetEvent::Heal)
    }
}

/// A [Clocks] that records every change.
#[derive(Clone, Debug, Default)]
pub struct MockClocks {
    bumps: Arc<Mutex<Vec<(Node, i64)>>>,
    resets: Arc<Mutex<Vec<Node>>>,
}

impl MockClocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bumps(&self) -> Vec<(Node, i64)> {
        self.bumps.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<Node> {
        self.resets.lock().unwrap().clone()
    }
}

impl Clocks for MockClocks {
    async fn bump(&self, node: &Node, offset_ms: i64) -> Result<(), Error> {
        self.bumps.lock().unwrap().push((node.clone(), offset_ms));
        Ok(())
    }

    async fn reset(&self, node: &Node) -> Result<(), Error> {
        self.resets.lock().unwrap().push(node.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Provisioned {
    generated: Vec<Node>,
    installs: BTreeMap<Node, PublicKey>,
    genesis: Option<Genesis>,
    torn_down: Vec<Node>,
    failing: BTreeSet<Node>,
    failing_teardown: BTreeSet<Node>,
}

/// A [Provisioner] that generates a key named after each node and records installs.
#[derive(Clone, Debug, Default)]
pub struct MockProvisioner {
    state: Arc<Mutex<Provisioned>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make key generation on `node` fail.
    pub fn fail_keygen(&self, node: &Node) {
        self.state.lock().unwrap().failing.insert(node.clone());
    }

    /// Make teardown on `node` fail (after recording the attempt).
    pub fn fail_teardown(&self, node: &Node) {
        self.state.lock().unwrap().failing_teardown.insert(node.clone());
    }

    /// Nodes that generated a key, in completion order.
    pub fn generated(&self) -> Vec<Node> {
        self.state.lock().unwrap().generated.clone()
    }

    /// Public key installed on each node.
    pub fn installs(&self) -> BTreeMap<Node, PublicKey> {
        self.state.lock().unwrap().installs.clone()
    }

    /// Last installed genesis.
    pub fn genesis(&self) -> Option<Genesis> {
        self.state.lock().unwrap().genesis.clone()
    }

    pub fn torn_down(&self) -> Vec<Node> {
        self.state.lock().unwrap().torn_down.clone()
    }
}

impl Provisioner for MockProvisioner {
    async fn generate_key(&self, node: &Node) -> Result<ValidatorKey, Error> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(node) {
            return Err(Error::InvalidKey {
                node: node.clone(),
                reason: "keygen failed".into(),
            });
        }
        state.generated.push(node.clone());
        Ok(key(node.as_str()))
    }

    async fn install(
        &self,
        node: &Node,
        key: &ValidatorKey,
        genesis: &Genesis,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .installs
            .insert(node.clone(), key.public_key().clone());
        state.genesis = Some(genesis.clone());
        Ok(())
    }

    async fn teardown(&self, node: &Node) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.torn_down.push(node.clone());
        if state.failing_teardown.contains(node) {
            return Err(Error::Ssh {
                host: node.to_string(),
                command: "teardown".into(),
                attempts: 1,
            });
        }
        Ok(())
    }

    fn log_files(&self, node: &Node) -> Vec<PathBuf> {
        vec![PathBuf::from(format!("/var/log/{node}.log"))]
    }
}
