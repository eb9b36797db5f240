//! Ethereum JSON-RPC client for the chain node backing the bank.
//!
//! Only the handful of `eth_*` methods needed to confirm a deposit and submit
//! a withdrawal are wrapped. Errors are never retried here: a transport
//! failure or a JSON-RPC `error` object is returned to the caller as is.

use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::address::Address;
use crate::errors::{EscrowError, Result};
use crate::fil::Fil;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_hash: Option<String>,
    /// `0x1` on success, `0x0` when the transaction reverted.
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub block_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcBlock {
    pub hash: Option<String>,
    /// Unix seconds as a hex quantity.
    pub timestamp: String,
}

impl RpcBlock {
    pub fn timestamp_secs(&self) -> Result<i64> {
        let digits = self.timestamp.trim_start_matches("0x");
        i64::from_str_radix(digits, 16)
            .map_err(|_| EscrowError::Validation(format!("bad block timestamp {}", self.timestamp)))
    }
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct RpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Issue one call. A `null` result comes back as `None`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = body.error {
            return Err(EscrowError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        debug!("{method} answered (id={id})");
        Ok(body.result)
    }

    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<TransactionReceipt>> {
        self.call("eth_getTransactionReceipt", json!([hash])).await
    }

    pub async fn transaction_by_hash(&self, hash: &str) -> Result<Option<RpcTransaction>> {
        self.call("eth_getTransactionByHash", json!([hash])).await
    }

    pub async fn block_by_hash(&self, hash: &str) -> Result<Option<RpcBlock>> {
        self.call("eth_getBlockByHash", json!([hash, false])).await
    }

    /// Accounts whose keys the node manages.
    pub async fn accounts(&self) -> Result<Vec<Address>> {
        let raw: Vec<String> = self.call("eth_accounts", json!([])).await?.unwrap_or_default();
        raw.iter().map(|a| a.parse()).collect()
    }

    /// Submit a plain value transfer signed by the node. Returns the transaction hash.
    pub async fn send_transaction(&self, from: &Address, to: &Address, value: &Fil) -> Result<String> {
        self.call(
            "eth_sendTransaction",
            json!([{
                "from": from.to_string(),
                "to": to.to_string(),
                "value": value.to_hex_quantity(),
            }]),
        )
        .await?
        .ok_or_else(|| EscrowError::Rpc {
            code: 0,
            message: "eth_sendTransaction returned no hash".to_string(),
        })
    }
}
