//! Chain verifier: confirms deposits and submits withdrawals.
//!
//! A deposit is only credited once its receipt is in, the transfer succeeded,
//! and the transaction moved exactly the claimed value from the claimed sender
//! to one of the bank's receiving accounts in a recent block.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::clock::Clock;
use crate::errors::{EscrowError, Result};
use crate::fil::Fil;
use crate::rpc::{RpcClient, TransactionReceipt};

#[async_trait]
pub trait ChainVerifier: Send + Sync {
    /// Wait for `hash` to confirm and check it against the claimed transfer.
    async fn verify_transaction(&self, hash: &str, from: Option<&Address>, value: &Fil)
        -> Result<()>;

    /// Send `amount` from the bank wallet to `to`. Returns the transaction hash.
    async fn transfer(&self, to: &Address, amount: &Fil) -> Result<String>;
}

/// Where a receipt poll stands.
///
/// ```text
/// Pending ──receipt, status 0x1──► Confirmed
///    │    ──receipt, status 0x0──► Failed
///    └────deadline──────────────► TimedOut
/// ```
#[derive(Debug)]
pub enum ReceiptState {
    Pending,
    Confirmed(TransactionReceipt),
    Failed,
    TimedOut,
}

impl ReceiptState {
    fn from_receipt(receipt: Option<TransactionReceipt>) -> Self {
        match receipt {
            None => Self::Pending,
            Some(r) if r.status.as_deref() == Some("0x1") => Self::Confirmed(r),
            Some(_) => Self::Failed,
        }
    }
}

fn rejected(reason: impl Into<String>) -> EscrowError {
    EscrowError::ChainVerificationFailed(reason.into())
}

pub struct EthChain {
    rpc: RpcClient,
    clock: Arc<dyn Clock>,
    bank_wallet: Address,
    /// Bounds both the receipt wait and the age of the confirming block.
    timeout: Duration,
    interval: Duration,
}

impl EthChain {
    pub fn new(
        rpc: RpcClient,
        clock: Arc<dyn Clock>,
        bank_wallet: Address,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            rpc,
            clock,
            bank_wallet,
            timeout,
            interval,
        }
    }

    /// Poll for the receipt every `interval` until it settles or `timeout` passes.
    pub async fn await_receipt(&self, hash: &str) -> Result<ReceiptState> {
        let polling = async {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let state = ReceiptState::from_receipt(self.rpc.transaction_receipt(hash).await?);
                if !matches!(state, ReceiptState::Pending) {
                    return Ok::<_, EscrowError>(state);
                }
                debug!("Receipt for {hash} still pending");
            }
        };

        match timeout(self.timeout, polling).await {
            Ok(state) => state,
            Err(_) => Ok(ReceiptState::TimedOut),
        }
    }

    async fn check_transfer(
        &self,
        receipt: &TransactionReceipt,
        from: Option<&Address>,
        value: &Fil,
    ) -> Result<()> {
        let tx = self
            .rpc
            .transaction_by_hash(&receipt.transaction_hash)
            .await?
            .ok_or_else(|| rejected("transaction not found"))?;

        if &Fil::from_hex_quantity(&tx.value)? != value {
            return Err(rejected("value does not match"));
        }

        if let Some(claimed) = from {
            let sender: Address = tx.from.parse()?;
            if &sender != claimed {
                return Err(rejected("sender does not match"));
            }
        }

        let recipient: Address = tx
            .to
            .as_deref()
            .ok_or_else(|| rejected("transaction has no recipient"))?
            .parse()?;
        if !self.rpc.accounts().await?.contains(&recipient) {
            return Err(rejected("recipient is not a bank account"));
        }

        let block_hash = receipt
            .block_hash
            .as_deref()
            .or(tx.block_hash.as_deref())
            .ok_or_else(|| rejected("transaction is not in a block"))?;
        let block = self
            .rpc
            .block_by_hash(block_hash)
            .await?
            .ok_or_else(|| rejected("block not found"))?;
        let age = self.clock.now().timestamp() - block.timestamp_secs()?;
        if age > self.timeout.as_secs() as i64 {
            return Err(rejected("transaction is too old"));
        }

        Ok(())
    }
}

#[async_trait]
impl ChainVerifier for EthChain {
    async fn verify_transaction(
        &self,
        hash: &str,
        from: Option<&Address>,
        value: &Fil,
    ) -> Result<()> {
        match self.await_receipt(hash).await? {
            ReceiptState::Confirmed(receipt) => {
                self.check_transfer(&receipt, from, value).await?;
                info!("Chain transaction {hash} confirmed ({value})");
                Ok(())
            }
            ReceiptState::Failed => Err(rejected("transaction failed")),
            ReceiptState::TimedOut => {
                warn!("Gave up waiting for receipt of {hash}");
                Err(rejected("timed out waiting for receipt"))
            }
            ReceiptState::Pending => Err(rejected("transaction pending")),
        }
    }

    async fn transfer(&self, to: &Address, amount: &Fil) -> Result<String> {
        let hash = self.rpc.send_transaction(&self.bank_wallet, to, amount).await?;
        info!("Submitted transfer of {amount} to {to}: {hash}");
        Ok(hash)
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
    const BLOCK: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";
    const NOW: i64 = 1_704_067_200;

    fn addr(n: u8) -> Address {
        Address::from_bytes([n; 20])
    }

    #[derive(Default)]
    struct StubState {
        results: HashMap<String, Value>,
        errors: HashMap<String, (i64, String)>,
        pending_polls: usize,
        calls: Vec<(String, Value)>,
    }

    #[derive(Clone, Default)]
    struct Stub(Arc<Mutex<StubState>>);

    async fn handle(State(stub): State<Stub>, Json(req): Json<Value>) -> Json<Value> {
        let method = req["method"].as_str().unwrap_or_default().to_string();
        let mut s = stub.0.lock().unwrap();
        s.calls.push((method.clone(), req["params"].clone()));

        if let Some((code, message)) = s.errors.get(&method) {
            return Json(json!({"jsonrpc":"2.0","id":req["id"],"error":{"code":code,"message":message}}));
        }
        if method == "eth_getTransactionReceipt" && s.pending_polls > 0 {
            s.pending_polls -= 1;
            return Json(json!({"jsonrpc":"2.0","id":req["id"],"result":null}));
        }
        let result = s.results.get(&method).cloned().unwrap_or(Value::Null);
        Json(json!({"jsonrpc":"2.0","id":req["id"],"result":result}))
    }

    impl Stub {
        /// A node holding a confirmed 1 FIL transfer from 0x01.. to 0xb0.. mined `age` seconds ago.
        fn confirmed(age: i64) -> Self {
            let stub = Stub::default();
            {
                let mut s = stub.0.lock().unwrap();
                s.results.insert(
                    "eth_getTransactionReceipt".into(),
                    json!({"transactionHash": HASH, "blockHash": BLOCK, "status": "0x1"}),
                );
                s.results.insert(
                    "eth_getTransactionByHash".into(),
                    json!({
                        "hash": HASH,
                        "from": addr(1).to_string(),
                        "to": addr(0xb0).to_string(),
                        "value": Fil::from_whole(1).to_hex_quantity(),
                        "blockHash": BLOCK
                    }),
                );
                let mined = NOW - age;
                s.results.insert(
                    "eth_getBlockByHash".into(),
                    json!({"hash": BLOCK, "timestamp": format!("0x{mined:x}")}),
                );
                s.results.insert(
                    "eth_accounts".into(),
                    json!([addr(0xb0).to_string().to_uppercase().replacen("0X", "0x", 1)]),
                );
                s.results.insert("eth_sendTransaction".into(), json!(HASH));
            }
            stub
        }

        fn set(&self, method: &str, value: Value) {
            self.0.lock().unwrap().results.insert(method.into(), value);
        }

        fn patch_transaction(&self, field: &str, value: Value) {
            let mut s = self.0.lock().unwrap();
            if let Some(tx) = s.results.get_mut("eth_getTransactionByHash") {
                tx[field] = value;
            }
        }

        async fn serve(self) -> String {
            let app = Router::new().route("/", post(handle)).with_state(self);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
            url
        }
    }

    /// Polls every 10ms for at most 300ms. Blocks must be from the current second.
    async fn chain(stub: &Stub) -> EthChain {
        let url = stub.clone().serve().await;
        EthChain::new(
            RpcClient::new(reqwest::Client::new(), url),
            Arc::new(ManualClock::new(chrono::Utc.timestamp_opt(NOW, 0).unwrap())),
            addr(0xb0),
            Duration::from_millis(300),
            Duration::from_millis(10),
        )
    }

    fn assert_rejected(result: Result<()>) {
        assert!(
            matches!(result, Err(EscrowError::ChainVerificationFailed(_))),
            "unexpected {result:?}"
        );
    }

    #[tokio::test]
    async fn accepts_a_matching_recent_transfer() {
        let stub = Stub::confirmed(0);
        let chain = chain(&stub).await;
        chain
            .verify_transaction(HASH, Some(&addr(1)), &Fil::from_whole(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn waits_through_pending_polls() {
        let stub = Stub::confirmed(0);
        stub.0.lock().unwrap().pending_polls = 3;
        let chain = chain(&stub).await;
        chain
            .verify_transaction(HASH, None, &Fil::from_whole(1))
            .await
            .unwrap();
        let polls = stub
            .0
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, _)| m == "eth_getTransactionReceipt")
            .count();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn rejects_mismatched_value_and_sender() {
        let stub = Stub::confirmed(0);
        let chain = chain(&stub).await;
        assert_rejected(
            chain
                .verify_transaction(HASH, Some(&addr(1)), &Fil::from_whole(2))
                .await,
        );
        assert_rejected(
            chain
                .verify_transaction(HASH, Some(&addr(9)), &Fil::from_whole(1))
                .await,
        );
    }

    #[tokio::test]
    async fn rejects_transfers_to_foreign_accounts() {
        let stub = Stub::confirmed(0);
        stub.patch_transaction("to", json!(addr(0xcc).to_string()));
        let chain = chain(&stub).await;
        assert_rejected(chain.verify_transaction(HASH, None, &Fil::from_whole(1)).await);
    }

    #[tokio::test]
    async fn rejects_stale_blocks() {
        let stub = Stub::confirmed(3600);
        let chain = chain(&stub).await;
        assert_rejected(chain.verify_transaction(HASH, None, &Fil::from_whole(1)).await);
    }

    #[tokio::test]
    async fn rejects_reverted_transactions() {
        let stub = Stub::confirmed(0);
        stub.set(
            "eth_getTransactionReceipt",
            json!({"transactionHash": HASH, "blockHash": BLOCK, "status": "0x0"}),
        );
        let chain = chain(&stub).await;
        assert_rejected(chain.verify_transaction(HASH, None, &Fil::from_whole(1)).await);
    }

    #[tokio::test]
    async fn times_out_when_no_receipt_arrives() {
        let stub = Stub::confirmed(0);
        stub.set("eth_getTransactionReceipt", Value::Null);
        let chain = chain(&stub).await;
        assert!(matches!(
            chain.await_receipt(HASH).await.unwrap(),
            ReceiptState::TimedOut
        ));
        assert_rejected(chain.verify_transaction(HASH, None, &Fil::from_whole(1)).await);
    }

    #[tokio::test]
    async fn rpc_errors_fail_fast() {
        let stub = Stub::confirmed(0);
        stub.0
            .lock()
            .unwrap()
            .errors
            .insert("eth_getTransactionReceipt".into(), (-32000, "boom".into()));
        let chain = chain(&stub).await;
        assert!(matches!(
            chain.verify_transaction(HASH, None, &Fil::from_whole(1)).await,
            Err(EscrowError::Rpc { code: -32000, .. })
        ));
    }

    #[tokio::test]
    async fn transfer_sends_from_the_bank_wallet() {
        let stub = Stub::confirmed(0);
        let chain = chain(&stub).await;
        let hash = chain.transfer(&addr(7), &Fil::from_whole(1)).await.unwrap();
        assert_eq!(hash, HASH);

        let s = stub.0.lock().unwrap();
        let (_, params) = s
            .calls
            .iter()
            .find(|(m, _)| m == "eth_sendTransaction")
            .unwrap();
        assert_eq!(params[0]["from"], json!(addr(0xb0).to_string()));
        assert_eq!(params[0]["to"], json!(addr(7).to_string()));
        assert_eq!(params[0]["value"], json!("0xde0b6b3a7640000"));
    }
}
