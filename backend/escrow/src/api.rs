//! Axum REST API of the bank.

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::{FromRef, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{BoxError, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::timeout::error::Elapsed;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use uuid::Uuid;

use crate::address::Address;
use crate::auth::{Caller, Signed};
use crate::bank::BankService;
use crate::errors::{EscrowError, Result};
use crate::fil::Fil;
use crate::jsend;
use crate::signature::SignatureAuth;

#[derive(Clone)]
pub struct ApiState {
    pub bank: BankService,
    pub auth: SignatureAuth,
}

impl FromRef<Arc<ApiState>> for SignatureAuth {
    fn from_ref(state: &Arc<ApiState>) -> Self {
        state.auth.clone()
    }
}

/// Every bank route. `/deposit` waits on the chain and gets its own timeout.
pub fn router(state: Arc<ApiState>, request_timeout: Duration, deposit_timeout: Duration) -> Router {
    let standard = Router::new()
        .route("/register", post(register))
        .route("/withdraw", post(withdraw))
        .route("/balance", get(balance))
        .route("/authorize", post(authorize))
        .route("/refund", get(refund))
        .route("/verify", post(verify))
        .route("/redeem", post(redeem))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(timed_out))
                .layer(TimeoutLayer::new(request_timeout)),
        );

    let chain_bound = Router::new().route("/deposit", post(deposit)).layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(timed_out))
            .layer(TimeoutLayer::new(deposit_timeout)),
    );

    standard
        .merge(chain_bound)
        .route("/health", get(health))
        .with_state(state)
}

/// Render a timed-out request as an [`EscrowError`] so it keeps the envelope.
async fn timed_out(err: BoxError) -> EscrowError {
    if err.is::<Elapsed>() {
        EscrowError::Timeout
    } else {
        EscrowError::Internal(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub price: Fil,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DepositRequest {
    pub amount: Fil,
    pub hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub amount: Fil,
    pub dst: Address,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    pub proxy: Address,
}

/// Body of both `/verify` and `/redeem`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub id: Uuid,
    pub amount: Fil,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /register`
///
/// Registers the caller as a storage provider charging `price` per authorization.
pub async fn register(
    State(state): State<Arc<ApiState>>,
    Signed { caller, body }: Signed<RegisterRequest>,
) -> Result<Response> {
    state
        .bank
        .register_proxy(&caller, &body.id, &body.price)
        .await?;
    Ok(jsend::success(json!({
        "id": body.id.trim(),
        "address": caller,
        "price": body.price,
    })))
}

/// `POST /deposit`
pub async fn deposit(
    State(state): State<Arc<ApiState>>,
    Signed { caller, body }: Signed<DepositRequest>,
) -> Result<Response> {
    let fil = state.bank.deposit(&caller, &body.amount, &body.hash).await?;
    Ok(jsend::success(json!({ "fil": fil })))
}

/// `POST /withdraw`
pub async fn withdraw(
    State(state): State<Arc<ApiState>>,
    Signed { caller, body }: Signed<WithdrawRequest>,
) -> Result<Response> {
    let out = state.bank.withdraw(&caller, &body.dst, &body.amount).await?;
    Ok(jsend::success(json!({ "fil": out.available, "hash": out.hash })))
}

/// `GET /balance`
pub async fn balance(State(state): State<Arc<ApiState>>, caller: Caller) -> Result<Response> {
    let b = state.bank.balance(&caller.address).await?;
    Ok(jsend::success(json!({ "fil": b.available, "escrow": b.escrow })))
}

/// `POST /authorize`
pub async fn authorize(
    State(state): State<Arc<ApiState>>,
    Signed { caller, body }: Signed<AuthorizeRequest>,
) -> Result<Response> {
    let out = state.bank.authorize(&caller, &body.proxy).await?;
    Ok(jsend::success(json!({
        "fil": out.available,
        "escrow": out.escrow,
        "id": out.id,
    })))
}

/// `GET /refund`
pub async fn refund(State(state): State<Arc<ApiState>>, caller: Caller) -> Result<Response> {
    let out = state.bank.refund(&caller.address).await?;
    Ok(jsend::success(json!({
        "fil": out.available,
        "escrow": out.escrow,
        "expired": out.expired,
    })))
}

/// `POST /verify`
pub async fn verify(
    State(state): State<Arc<ApiState>>,
    Signed { caller, body }: Signed<SettlementRequest>,
) -> Result<Response> {
    state.bank.verify(&caller, body.id, &body.amount).await?;
    Ok(jsend::success(json!({ "authorization": "valid" })))
}

/// `POST /redeem`
pub async fn redeem(
    State(state): State<Arc<ApiState>>,
    Signed { caller, body }: Signed<SettlementRequest>,
) -> Result<Response> {
    let out = state.bank.redeem(&caller, body.id, &body.amount).await?;
    Ok(jsend::success(out))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
