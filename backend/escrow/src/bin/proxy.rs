//! Metering proxy: entry point.
//!
//! Registers with every trusted bank, then serves `/fetch` in front of the
//! storage provider's retrieval endpoint and bills each retrieval by the byte.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use retrieval_escrow::clock::{Clock, SystemClock};
use retrieval_escrow::config::{trim_url, ProxyConfig};
use retrieval_escrow::proxy::client::spawn_registrations;
use retrieval_escrow::proxy::{self, EscrowBank, ProxyState, RemoteBank};
use retrieval_escrow::signature::Signer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = ProxyConfig::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    let signer = Arc::new(Signer::from_hex(&config.secret_key).map_err(|e| anyhow::anyhow!("{e}"))?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Bank calls are bounded per call; upstream bodies may stream for a long time.
    let bank_client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    let upstream_client = Client::builder()
        .connect_timeout(config.header_timeout())
        .build()?;

    let banks: Vec<_> = config
        .trusted_banks
        .iter()
        .map(|trusted| {
            let bank: Arc<dyn EscrowBank> = Arc::new(RemoteBank::new(
                bank_client.clone(),
                trim_url(&trusted.url),
                signer.clone(),
                clock.clone(),
            ));
            (trusted.clone(), bank)
        })
        .collect();

    // ─── Registration ─────────────────────────────────────
    info!(
        "Proxy {} ({}) charging {} per {} bytes",
        config.provider_id,
        signer.address(),
        config.provider_cost,
        config.sector_size
    );
    spawn_registrations(&banks, &config.provider_id, &config.provider_cost);

    // ─── REST API ─────────────────────────────────────────
    let state = Arc::new(ProxyState {
        client: upstream_client,
        upstream_url: trim_url(&config.upstream_url),
        provider_cost: config.provider_cost.clone(),
        sector_size: config.sector_size,
        banks,
        header_timeout: config.header_timeout(),
        billing_timeout: config.billing_timeout(),
    });

    let app = proxy::router(state)
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

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Proxy listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
