//! Distribute validator keys from origins to their clones.
//!
//! Every origin (and every node with its own identity) generates a key and publishes it into a
//! [KeyCell]. A clone never generates a key of its own: it waits on its origin's cell and installs
//! whatever key the origin published. Cells are write-once, so a clone can never observe two
//! different keys for the same identity.

use crate::{identity::Node, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};
use tokio::sync::Notify;

/// Public half of a validator key, as it appears in genesis.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// A validator key file produced by a node's keygen.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatorKey {
    public: PublicKey,
    document: Json,
}

impl ValidatorKey {
    /// Parse a key document, which must carry a `pub_key` object.
    pub fn from_document(node: &Node, document: Json) -> Result<Self, Error> {
        let public = document
            .get("pub_key")
            .cloned()
            .ok_or_else(|| Error::InvalidKey {
                node: node.clone(),
                reason: "missing pub_key".into(),
            })?;
        let public = serde_json::from_value(public).map_err(|e| Error::InvalidKey {
            node: node.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { public, document })
    }

    /// Parse a key document from its JSON text.
    pub fn parse(node: &Node, text: &str) -> Result<Self, Error> {
        let document = serde_json::from_str(text).map_err(|e| Error::InvalidKey {
            node: node.clone(),
            reason: e.to_string(),
        })?;
        Self::from_document(node, document)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The full key document, to be installed verbatim.
    pub fn document(&self) -> &Json {
        &self.document
    }
}

/// A write-once cell that can be awaited until written.
#[derive(Debug, Default)]
pub struct KeyCell {
    value: OnceLock<ValidatorKey>,
    notify: Notify,
}

impl KeyCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `key`, failing if a key was already published.
    pub fn publish(&self, node: &Node, key: ValidatorKey) -> Result<(), Error> {
        self.value
            .set(key)
            .map_err(|_| Error::KeyAlreadyPublished(node.clone()))?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// The published key, if any.
    pub fn get(&self) -> Option<&ValidatorKey> {
        self.value.get()
    }

    /// Wait until a key is published.
    pub async fn wait(&self) -> ValidatorKey {
        loop {
            // Register interest before checking to avoid missing a concurrent publish
            let notified = self.notify.notified();
            if let Some(key) = self.value.get() {
                return key.clone();
            }
            notified.await;
        }
    }
}

/// Key cells of every node in the run.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    cells: Arc<Mutex<HashMap<Node, Arc<KeyCell>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cell of `node`, created on first use.
    pub fn cell(&self, node: &Node) -> Arc<KeyCell> {
        self.cells
            .lock()
            .unwrap()
            .entry(node.clone())
            .or_default()
            .clone()
    }

    pub fn publish(&self, node: &Node, key: ValidatorKey) -> Result<(), Error> {
        self.cell(node).publish(node, key)
    }

    pub async fn wait(&self, node: &Node) -> ValidatorKey {
        let cell = self.cell(node);
        cell.wait().await
    }

    /// Drop every cell.
    pub fn clear(&self) {
        self.cells.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.cells.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::key;
    use std::time::Duration;

    #[test]
    fn test_parse_key() {
        let node = Node::from("n1");
        let key = ValidatorKey::parse(
            &node,
            r#"{"address":"AB","pub_key":{"type":"ed25519","value":"abc"},"priv_key":{"type":"ed25519","value":"secret"}}"#,
        )
        .unwrap();
        assert_eq!(key.public_key().kind, "ed25519");
        assert_eq!(key.public_key().value, "abc");
        assert_eq!(key.document()["address"], "AB");

        let missing = ValidatorKey::parse(&node, r#"{"address":"AB"}"#);
        assert!(matches!(missing, Err(Error::InvalidKey { .. })));
        let malformed = ValidatorKey::parse(&node, "not json");
        assert!(matches!(malformed, Err(Error::InvalidKey { .. })));
    }

    #[test]
    fn test_publish_once() {
        let node = Node::from("n1");
        let cell = KeyCell::new();
        assert!(cell.get().is_none());
        cell.publish(&node, key("a")).unwrap();
        assert!(matches!(
            cell.publish(&node, key("b")),
            Err(Error::KeyAlreadyPublished(_))
        ));
        assert_eq!(cell.get().unwrap().public_key().value, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_published() {
        let registry = Registry::new();
        let origin = Node::from("n2");

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let registry = registry.clone();
                let origin = origin.clone();
                tokio::spawn(async move { registry.wait(&origin).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        registry.publish(&origin, key("n2")).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().public_key().value, "n2");
        }

        // Late waiters return immediately
        assert_eq!(registry.wait(&origin).await.public_key().value, "n2");
    }

    #[test]
    fn test_clear() {
        let registry = Registry::new();
        let node = Node::from("n1");
        registry.publish(&node, key("a")).unwrap();
        assert_eq!(registry.len(), 1);
        registry.clear();
        assert!(registry.is_empty());
        registry.publish(&node, key("b")).unwrap();
    }
}
