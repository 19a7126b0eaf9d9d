//! Register transport over the Tendermint JSON-RPC interface of a merkleeyes node.
//!
//! Every operation (including reads, so they are ordered by consensus) is submitted through
//! `broadcast_tx_commit`. A transaction is a random 12-byte nonce, a type byte, and length-prefixed
//! arguments. Keys and values are 8-byte big-endian integers.

use super::{RpcError, Transport};
use crate::identity::Node;
use commonware_utils::{from_hex, hex};
use rand::RngCore;
use serde_json::Value as Json;
use std::time::Duration;
use tracing::trace;

/// Default Tendermint RPC port.
pub const DEFAULT_RPC_PORT: u16 = 26657;

const NONCE_LEN: usize = 12;

const TX_SET: u8 = 0x01;
const TX_GET: u8 = 0x03;
const TX_CAS: u8 = 0x04;

/// ABCI code returned when a compare-and-set precondition does not hold.
const CODE_UNAUTHORIZED: u64 = 4;

/// ABCI code returned when a key does not exist.
const CODE_UNKNOWN_ADDRESS: u64 = 111;

/// Append a byte slice prefixed by its length (one byte holding the width of the big-endian
/// length, followed by the length itself).
fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    let len = (bytes.len() as u64).to_be_bytes();
    let skip = len.iter().take_while(|b| **b == 0).count();
    buf.push((len.len() - skip) as u8);
    buf.extend_from_slice(&len[skip..]);
    buf.extend_from_slice(bytes);
}

/// Encode a transaction with a caller-provided nonce.
pub fn encode(nonce: [u8; NONCE_LEN], kind: u8, args: &[u64]) -> Vec<u8> {
    let mut tx = Vec::with_capacity(NONCE_LEN + 1 + args.len() * 10);
    tx.extend_from_slice(&nonce);
    tx.push(kind);
    for arg in args {
        put_bytes(&mut tx, &arg.to_be_bytes());
    }
    tx
}

/// Decode a register value returned in `deliver_tx.data`.
fn decode_value(data: &str) -> Result<Option<u64>, RpcError> {
    if data.is_empty() {
        return Ok(None);
    }
    let bytes = from_hex(data).ok_or_else(|| RpcError::Other(format!("invalid hex: {data}")))?;
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| RpcError::Other(format!("invalid value: {data}")))?;
    Ok(Some(u64::from_be_bytes(bytes)))
}

/// Map the result of a `broadcast_tx_commit` call to the `deliver_tx.data` field.
fn parse_commit(body: &str) -> Result<String, RpcError> {
    let response: Json =
        serde_json::from_str(body).map_err(|e| RpcError::Other(format!("invalid response: {e}")))?;
    if let Some(error) = response.get("error").filter(|e| !e.is_null() && *e != "") {
        return Err(RpcError::Other(error.to_string()));
    }
    let result = response
        .get("result")
        .ok_or_else(|| RpcError::Other("missing result".into()))?;
    for stage in ["check_tx", "deliver_tx"] {
        let Some(stage) = result.get(stage) else {
            continue;
        };
        let code = stage.get("code").and_then(Json::as_u64).unwrap_or(0);
        match code {
            0 => {}
            CODE_UNAUTHORIZED => return Err(RpcError::Unauthorized),
            CODE_UNKNOWN_ADDRESS => return Err(RpcError::UnknownAddress),
            code => {
                let log = stage.get("log").and_then(Json::as_str).unwrap_or_default();
                return Err(RpcError::Other(format!("code {code}: {log}")));
            }
        }
    }
    Ok(result
        .get("deliver_tx")
        .and_then(|d| d.get("data"))
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string())
}

/// Map a transport-level failure.
fn classify(err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout
    } else if err.is_connect() {
        RpcError::ConnectionRefused
    } else {
        RpcError::Other(err.to_string())
    }
}

/// JSON-RPC transport to one node.
pub struct HttpTransport {
    base: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(node: &Node, port: u16, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(classify)?;
        Ok(Self {
            base: format!("http://{node}:{port}"),
            client,
        })
    }

    async fn submit(&self, kind: u8, args: &[u64]) -> Result<String, RpcError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let tx = encode(nonce, kind, args);
        let url = format!("{}/broadcast_tx_commit?tx=0x{}", self.base, hex(&tx));
        trace!(%url, "submitting transaction");
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(classify)?
            .text()
            .await
            .map_err(classify)?;
        parse_commit(&body)
    }
}

impl Transport for HttpTransport {
    async fn read(&self, key: u64) -> Result<Option<u64>, RpcError> {
        let data = self.submit(TX_GET, &[key]).await?;
        decode_value(&data)
    }

    async fn write(&self, key: u64, value: u64) -> Result<(), RpcError> {
        self.submit(TX_SET, &[key, value]).await.map(|_| ())
    }

    async fn cas(&self, key: u64, from: u64, to: u64) -> Result<(), RpcError> {
        self.submit(TX_CAS, &[key, from, to]).await.map(|_| ())
    }
}
