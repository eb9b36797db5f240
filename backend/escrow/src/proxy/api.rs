//! Axum REST API of the metering proxy.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::health;
use crate::config::{trim_url, TrustedBank};
use crate::errors::{EscrowError, Result};
use crate::fil::Fil;
use crate::jsend;

use super::client::{bank_listing, EscrowBank};
use super::metering::{spawn_settlement, MeteredBody, Settlement};

pub struct ProxyState {
    pub client: Client,
    pub upstream_url: String,
    /// Price per `sector_size` bytes, also the amount each authorization is verified for.
    pub provider_cost: Fil,
    pub sector_size: u64,
    pub banks: Vec<(TrustedBank, Arc<dyn EscrowBank>)>,
    pub header_timeout: Duration,
    pub billing_timeout: Duration,
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/fetch/:piece", get(fetch))
        .route("/banks", get(banks))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct FetchParams {
    pub authorization: Uuid,
    pub bank: String,
}

/// `GET /banks`
pub async fn banks(State(state): State<Arc<ProxyState>>) -> Response {
    jsend::success(bank_listing(&state.banks, &state.provider_cost))
}

/// `GET /fetch/:piece?authorization=<uuid>&bank=<url>`
///
/// Locks the authorization at the named bank, then streams the piece from
/// upstream. Billing happens after the body is done and never affects the
/// response.
///
/// When upstream cannot serve the piece (transport error, header timeout or a
/// non-2xx answer) the locked authorization is redeemed at zero cost in the
/// background, so the whole amount goes back to the client's balance. A 2xx
/// body that delivers no bytes is not redeemed at all.
pub async fn fetch(
    State(state): State<Arc<ProxyState>>,
    Path(piece): Path<String>,
    params: std::result::Result<Query<FetchParams>, QueryRejection>,
) -> Result<Response> {
    let Query(params) = params.map_err(|e| EscrowError::Validation(e.body_text()))?;
    if piece.is_empty() || !piece.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EscrowError::Validation(format!("invalid piece: {piece}")));
    }

    let wanted = trim_url(&params.bank);
    let (trusted, bank) = state
        .banks
        .iter()
        .find(|(trusted, _)| trim_url(&trusted.url) == wanted)
        .ok_or(EscrowError::UntrustedBank)?;

    let id = params.authorization;
    bank.verify(id, &state.provider_cost).await?;
    info!("Authorization {id} locked at {} for piece {piece}", trusted.name);

    let settlement = Settlement {
        bank: bank.clone(),
        bank_name: trusted.name.clone(),
        authorization: id,
        verified: state.provider_cost.clone(),
        provider_cost: state.provider_cost.clone(),
        sector_size: state.sector_size,
        timeout: state.billing_timeout,
    };

    let upstream = tokio::time::timeout(
        state.header_timeout,
        state
            .client
            .get(format!("{}/piece/{piece}", state.upstream_url))
            .send(),
    )
    .await
    .map_err(|_| EscrowError::UpstreamTimeout)
    .and_then(|sent| sent.map_err(|e| EscrowError::Upstream(e.to_string())));
    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Upstream unreachable for piece {piece}, releasing {id}: {e}");
            tokio::spawn(settlement.release());
            return Err(e);
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        let text = upstream.text().await.unwrap_or_default();
        warn!("Upstream answered {status} for piece {piece}, releasing {id}");
        tokio::spawn(settlement.release());
        return Ok(if status.is_server_error() {
            jsend::error(status, text)
        } else {
            jsend::fail(status, text)
        });
    }

    let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
    let (body, delivered) = MeteredBody::new(Box::pin(upstream.bytes_stream()));
    spawn_settlement(settlement, delivered);
    debug!("Streaming piece {piece} for authorization {id}");

    let mut resp = Body::from_stream(body).into_response();
    if let Some(content_type) = content_type {
        resp.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    Ok(resp)
}
