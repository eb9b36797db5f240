//! Escrow bank: entry point.
//!
//! Serves the signed REST API over the SQLite ledger. Deposits and
//! withdrawals are checked against and submitted to the chain node at
//! `RPC_URL`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use retrieval_escrow::api::{self, ApiState};
use retrieval_escrow::bank::BankService;
use retrieval_escrow::chain::EthChain;
use retrieval_escrow::clock::{Clock, SystemClock};
use retrieval_escrow::config::BankConfig;
use retrieval_escrow::db;
use retrieval_escrow::ledger::Ledger;
use retrieval_escrow::rpc::RpcClient;
use retrieval_escrow::signature::SignatureAuth;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = BankConfig::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

    // ─── Chain ────────────────────────────────────────────
    let chain = EthChain::new(
        RpcClient::new(client, &config.rpc_url),
        clock.clone(),
        config.escrow.bank_wallet,
        config.verify_timeout(),
        config.verify_interval(),
    );

    // ─── REST API ─────────────────────────────────────────
    let ledger = Ledger::new(pool, clock.clone(), config.escrow.clone());
    let state = Arc::new(ApiState {
        bank: BankService::new(ledger, Arc::new(chain)),
        auth: SignatureAuth::new(clock, config.signature_max_age()),
    });

    let app = api::router(
        state,
        Duration::from_secs(config.request_timeout_secs),
        Duration::from_secs(config.deposit_timeout_secs),
    )
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!(
        "Bank listening on http://{addr} (wallet {}, escrow {})",
        config.escrow.bank_wallet, config.escrow.escrow_wallet
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
