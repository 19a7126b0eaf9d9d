//! Issue register operations against one node and classify their outcomes.
//!
//! Every error is recovered locally and turned into an [Outcome]. Errors that prove the operation
//! had no effect (the server rejected it, or the connection was never established) are `fail`.
//! Ambiguous errors (timeouts and anything unrecognized) are `fail` for reads, which cannot have
//! side effects, and `info` for writes and compare-and-sets, which may have been applied before
//! the response was lost. Reporting such a write as `fail` would let the checker reject valid
//! histories in which the write actually took effect.

use crate::{
    generator::Invocation,
    history::{ErrorKind, Phase, Value, Verb},
    identity::Node,
};
use std::{future::Future, time::Duration};
use thiserror::Error;
use tracing::debug;

pub mod http;

/// Default bound on a single operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors reported by a [Transport].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("unknown address")]
    UnknownAddress,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("timeout")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl RpcError {
    /// Returns true if the error proves the operation was not applied.
    pub fn is_definite(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::UnknownAddress | Self::ConnectionRefused
        )
    }

    /// Classified kind, if the error is one the checker distinguishes.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Unauthorized => Some(ErrorKind::PreconditionFailed),
            Self::UnknownAddress => Some(ErrorKind::NotFound),
            Self::ConnectionRefused => Some(ErrorKind::ConnectionRefused),
            Self::Timeout => Some(ErrorKind::Timeout),
            Self::Other(_) => None,
        }
    }
}

/// Remote register interface of a single node.
pub trait Transport: Send + Sync + 'static {
    /// Read `key`, returning `None` if it holds no value.
    fn read(&self, key: u64) -> impl Future<Output = Result<Option<u64>, RpcError>> + Send;

    /// Set `key` to `value`.
    fn write(&self, key: u64, value: u64) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Set `key` to `to` if it currently holds `from`.
    fn cas(
        &self,
        key: u64,
        from: u64,
        to: u64,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;
}

/// Result of invoking an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub phase: Phase,
    pub value: Value,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
}

impl Outcome {
    fn ok(value: Value) -> Self {
        Self {
            phase: Phase::Ok,
            value,
            error: None,
            message: None,
        }
    }

    /// Classify a failed invocation.
    ///
    /// The determinacy of ambiguous errors depends only on the verb.
    pub fn classify(invocation: &Invocation, err: RpcError) -> Self {
        let phase = if err.is_definite() {
            Phase::Fail
        } else {
            match invocation.verb {
                Verb::Read => Phase::Fail,
                Verb::Write | Verb::Cas => Phase::Info,
            }
        };
        let message = match &err {
            RpcError::Other(message) => Some(message.clone()),
            _ => None,
        };
        Self {
            phase,
            value: invocation.value,
            error: err.kind(),
            message,
        }
    }
}

/// Issues operations against one node, one at a time.
pub struct Client<T: Transport> {
    node: Node,
    transport: T,
    timeout: Duration,
}

impl<T: Transport> Client<T> {
    pub fn new(node: Node, transport: T, timeout: Duration) -> Self {
        Self {
            node,
            transport,
            timeout,
        }
    }

    /// Node targeted by this client.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Invoke an operation and wait for its outcome (bounded by the client timeout).
    pub async fn invoke(&self, invocation: &Invocation) -> Outcome {
        let result = tokio::time::timeout(self.timeout, self.call(invocation))
            .await
            .unwrap_or(Err(RpcError::Timeout));
        match result {
            Ok(value) => Outcome::ok(value),
            Err(err) => {
                debug!(node = %self.node, key = invocation.key, verb = ?invocation.verb, %err, "operation failed");
                Outcome::classify(invocation, err)
            }
        }
    }

    async fn call(&self, invocation: &Invocation) -> Result<Value, RpcError> {
        let key = invocation.key;
        match (invocation.verb, invocation.value) {
            (Verb::Read, _) => {
                let value = self.transport.read(key).await?;
                Ok(value.map(Value::Int).unwrap_or(Value::None))
            }
            (Verb::Write, Value::Int(value)) => {
                self.transport.write(key, value).await?;
                Ok(invocation.value)
            }
            (Verb::Cas, Value::Pair(from, to)) => {
                self.transport.cas(key, from, to).await?;
                Ok(invocation.value)
            }
            (verb, value) => Err(RpcError::Other(format!(
                "malformed {verb:?} argument: {value:?}"
            ))),
        }
    }
}
