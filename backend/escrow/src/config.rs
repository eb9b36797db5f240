//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::address::Address;
use crate::errors::{EscrowError, Result};
use crate::fil::Fil;

/// Ledger-wide constants shared by every bank operation.
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Age after which an unverified authorization becomes refundable.
    pub deadline: chrono::Duration,
    /// Book-keeping endpoint for deposits and withdrawals.
    pub bank_wallet: Address,
    /// Book-keeping endpoint for escrowed value.
    pub escrow_wallet: Address,
}

#[derive(Debug, Clone)]
pub struct BankConfig {
    /// Path to the SQLite database file
    pub database_url: String,
    pub db_max_connections: u32,
    /// Port for the REST API server
    pub api_port: u16,
    /// Ethereum JSON-RPC endpoint of the chain node holding the bank's keys
    pub rpc_url: String,
    pub escrow: EscrowConfig,
    /// Overall bound on waiting for a deposit's receipt
    pub verify_timeout_secs: u64,
    /// Receipt poll period
    pub verify_interval_secs: u64,
    /// Maximum clock skew accepted on a signed request
    pub signature_max_age_secs: u64,
    pub request_timeout_secs: u64,
    pub deposit_timeout_secs: u64,
}

impl BankConfig {
    pub fn from_env() -> Result<Self> {
        let escrow_deadline_secs: i64 = parse_var("ESCROW_DEADLINE_SECS", "3600")?;
        let verify_timeout_secs: u64 = parse_var("VERIFY_TIMEOUT_SECS", "300")?;
        let default_deposit_timeout = (verify_timeout_secs + 30).to_string();

        Ok(BankConfig {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./escrow_bank.db".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "5")?,
            api_port: parse_var("API_PORT", "3002")?,
            rpc_url: env_var("RPC_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:1234/rpc/v1".to_string()),
            escrow: EscrowConfig {
                deadline: chrono::Duration::seconds(escrow_deadline_secs),
                bank_wallet: required("BANK_WALLET_ADDRESS")?.parse().map_err(|_| {
                    EscrowError::Config("Invalid BANK_WALLET_ADDRESS".to_string())
                })?,
                escrow_wallet: required("ESCROW_WALLET_ADDRESS")?.parse().map_err(|_| {
                    EscrowError::Config("Invalid ESCROW_WALLET_ADDRESS".to_string())
                })?,
            },
            verify_timeout_secs,
            verify_interval_secs: parse_var("VERIFY_INTERVAL_SECS", "5")?,
            signature_max_age_secs: parse_var("SIGNATURE_MAX_AGE_SECS", "300")?,
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", "30")?,
            deposit_timeout_secs: parse_var("DEPOSIT_TIMEOUT_SECS", &default_deposit_timeout)?,
        })
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_secs)
    }

    pub fn signature_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.signature_max_age_secs as i64)
    }
}

/// A bank the proxy is willing to bill against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedBank {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    /// Storage backend serving `/piece/{piece}`
    pub upstream_url: String,
    /// Identifier the provider registers under
    pub provider_id: String,
    /// Price of one authorization, and the cost of one full sector
    pub provider_cost: Fil,
    /// Bytes per sector
    pub sector_size: u64,
    /// Hex secp256k1 key signing requests to banks
    pub secret_key: String,
    pub trusted_banks: Vec<TrustedBank>,
    pub header_timeout_secs: u64,
    pub billing_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let sector_size: u64 = parse_var("SECTOR_SIZE", "34359738368")?;
        if sector_size == 0 {
            return Err(EscrowError::Config("SECTOR_SIZE must be positive".to_string()));
        }

        Ok(ProxyConfig {
            port: parse_var("PROXY_PORT", "3003")?,
            upstream_url: trim_url(&required("UPSTREAM_URL")?),
            provider_id: required("PROVIDER_ID")?,
            provider_cost: required("PROVIDER_COST")?
                .parse()
                .map_err(|_| EscrowError::Config("Invalid PROVIDER_COST".to_string()))?,
            sector_size,
            secret_key: required("PROXY_SECRET_KEY")?,
            trusted_banks: parse_trusted_banks(&required("TRUSTED_BANKS")?)?,
            header_timeout_secs: parse_var("HEADER_TIMEOUT_SECS", "30")?,
            billing_timeout_secs: parse_var("BILLING_TIMEOUT_SECS", "30")?,
        })
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }

    pub fn billing_timeout(&self) -> Duration {
        Duration::from_secs(self.billing_timeout_secs)
    }
}

/// Parse `name=url,name=url`.
pub fn parse_trusted_banks(raw: &str) -> Result<Vec<TrustedBank>> {
    let banks = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, url) = entry.split_once('=').ok_or_else(|| {
                EscrowError::Config(format!("TRUSTED_BANKS entry {entry:?} is not name=url"))
            })?;
            let (name, url) = (name.trim(), trim_url(url));
            if name.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(EscrowError::Config(format!(
                    "TRUSTED_BANKS entry {entry:?} is not name=url"
                )));
            }
            Ok(TrustedBank {
                name: name.to_string(),
                url,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if banks.is_empty() {
        return Err(EscrowError::Config("TRUSTED_BANKS is empty".to_string()));
    }
    Ok(banks)
}

/// URLs are compared without a trailing slash.
pub fn trim_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EscrowError::Config(format!("Missing env var: {key}")))
}

fn required(key: &str) -> Result<String> {
    env_var(key)
        .map_err(|_| EscrowError::Config(format!("{key} environment variable is required")))
}

fn parse_var<T: FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| EscrowError::Config(format!("Invalid {key}")))
}
