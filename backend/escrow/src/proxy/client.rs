//! Banks the proxy bills against.
//!
//! [`RemoteBank`] talks to a bank over signed HTTP; [`LocalBank`] calls an
//! in-process [`BankService`] directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::address::Address;
use crate::api::{RegisterRequest, SettlementRequest};
use crate::bank::BankService;
use crate::clock::Clock;
use crate::config::TrustedBank;
use crate::errors::{EscrowError, Result};
use crate::fil::Fil;
use crate::jsend::Payload;
use crate::models::RedeemOutcome;
use crate::signature::{Signer, HEADER_MSG, HEADER_PUB, HEADER_SIG};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait EscrowBank: Send + Sync {
    /// Register this proxy as a storage provider charging `price`.
    async fn register(&self, sp_id: &str, price: &Fil) -> Result<()>;

    /// Lock authorization `id` for this proxy, provided it escrows at least `amount`.
    async fn verify(&self, id: Uuid, amount: &Fil) -> Result<()>;

    /// Settle authorization `id` at `cost`.
    async fn redeem(&self, id: Uuid, cost: &Fil) -> Result<RedeemOutcome>;
}

// ─────────────────────────────────────────────────────────
// Remote
// ─────────────────────────────────────────────────────────

pub struct RemoteBank {
    client: Client,
    url: String,
    signer: Arc<Signer>,
    clock: Arc<dyn Clock>,
}

impl RemoteBank {
    pub fn new(client: Client, url: impl Into<String>, signer: Arc<Signer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            url: url.into(),
            signer,
            clock,
        }
    }

    /// POST a signed JSON body and unwrap the `success` envelope.
    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<Value> {
        let body = serde_json::to_vec(body)?;
        let signed = self.signer.sign(self.clock.now().timestamp(), &body);

        let resp = self
            .client
            .post(format!("{}{path}", self.url))
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_SIG, signed.sig)
            .header(HEADER_PUB, signed.public)
            .header(HEADER_MSG, signed.msg)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let payload: Payload = resp.json().await?;
        if status.is_success() && payload.status == "success" {
            return Ok(payload.data.unwrap_or(Value::Null));
        }
        Err(EscrowError::Remote {
            status: status.as_u16(),
            message: payload.reason(),
        })
    }
}

#[async_trait]
impl EscrowBank for RemoteBank {
    async fn register(&self, sp_id: &str, price: &Fil) -> Result<()> {
        let body = RegisterRequest {
            id: sp_id.to_string(),
            price: price.clone(),
        };
        tokio::time::timeout(REGISTER_TIMEOUT, self.post("/register", &body))
            .await
            .map_err(|_| EscrowError::UpstreamTimeout)??;
        Ok(())
    }

    async fn verify(&self, id: Uuid, amount: &Fil) -> Result<()> {
        let body = SettlementRequest {
            id,
            amount: amount.clone(),
        };
        self.post("/verify", &body).await?;
        Ok(())
    }

    async fn redeem(&self, id: Uuid, cost: &Fil) -> Result<RedeemOutcome> {
        let body = SettlementRequest {
            id,
            amount: cost.clone(),
        };
        let data = self.post("/redeem", &body).await?;
        Ok(serde_json::from_value(data)?)
    }
}

// ─────────────────────────────────────────────────────────
// Local
// ─────────────────────────────────────────────────────────

/// A bank in the same process, acting as `address`.
pub struct LocalBank {
    service: BankService,
    address: Address,
}

impl LocalBank {
    pub fn new(service: BankService, address: Address) -> Self {
        Self { service, address }
    }
}

#[async_trait]
impl EscrowBank for LocalBank {
    async fn register(&self, sp_id: &str, price: &Fil) -> Result<()> {
        self.service.register_proxy(&self.address, sp_id, price).await
    }

    async fn verify(&self, id: Uuid, amount: &Fil) -> Result<()> {
        self.service.verify(&self.address, id, amount).await
    }

    async fn redeem(&self, id: Uuid, cost: &Fil) -> Result<RedeemOutcome> {
        self.service.redeem(&self.address, id, cost).await
    }
}

// ─────────────────────────────────────────────────────────
// Start-up registration
// ─────────────────────────────────────────────────────────

/// Register with every bank in the background, logging each outcome.
pub fn spawn_registrations(
    banks: &[(TrustedBank, Arc<dyn EscrowBank>)],
    sp_id: &str,
    price: &Fil,
) -> Vec<tokio::task::JoinHandle<()>> {
    banks
        .iter()
        .map(|(trusted, bank)| {
            let (name, bank) = (trusted.name.clone(), bank.clone());
            let (sp_id, price) = (sp_id.to_string(), price.clone());
            tokio::spawn(async move {
                match bank.register(&sp_id, &price).await {
                    Ok(()) => info!("Registered with bank {name} as {sp_id} ({price})"),
                    Err(EscrowError::AccountExists) => {
                        info!("Already registered with bank {name}")
                    }
                    Err(EscrowError::Remote { status: 409, .. }) => {
                        info!("Already registered with bank {name}")
                    }
                    Err(e) => error!("Failed to register with bank {name}: {e}"),
                }
            })
        })
        .collect()
}

/// `[{"url": …, "cost": …}]` for the `/banks` listing.
pub fn bank_listing(banks: &[(TrustedBank, Arc<dyn EscrowBank>)], cost: &Fil) -> Value {
    Value::Array(
        banks
            .iter()
            .map(|(trusted, _)| json!({ "url": trusted.url, "cost": cost }))
            .collect(),
    )
}

// ─────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────
