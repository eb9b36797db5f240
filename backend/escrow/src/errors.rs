//! Application-wide error types and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error};

use crate::jsend;

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("operation not allowed")]
    OperationNotAllowed,

    #[error("no valid authorization")]
    AuthorizationNotFound,

    #[error("nothing to refund")]
    NothingToRefund,

    #[error("account not found")]
    AccountNotFound,

    #[error("account already registered")]
    AccountExists,

    #[error("storage provider not registered")]
    UnknownProxy,

    #[error("bank is not trusted by this proxy")]
    UntrustedBank,

    #[error("transaction already registered")]
    DuplicateChainTransaction,

    #[error("invalid chain transaction: {0}")]
    ChainVerificationFailed(String),

    #[error("invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("bank responded with {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("request timed out")]
    Timeout,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EscrowError>;

impl EscrowError {
    /// The fixed HTTP status each error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InsufficientFunds => StatusCode::FORBIDDEN,
            Self::OperationNotAllowed | Self::SignatureInvalid(_) => StatusCode::UNAUTHORIZED,
            Self::AuthorizationNotFound | Self::AccountNotFound | Self::UnknownProxy => {
                StatusCode::NOT_FOUND
            }
            Self::AccountExists
            | Self::DuplicateChainTransaction
            | Self::ChainVerificationFailed(_) => StatusCode::CONFLICT,
            Self::NothingToRefund | Self::Validation(_) | Self::UntrustedBank => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Remote { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout | Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Server-side failures stay in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::Remote { message, .. } => message.clone(),
            e if e.status().is_server_error()
                && !matches!(e, Self::Upstream(_) | Self::UpstreamTimeout | Self::Timeout) =>
            {
                "internal server error".to_string()
            }
            e => e.to_string(),
        }
    }
}

impl IntoResponse for EscrowError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
            jsend::error(status, self.public_message())
        } else {
            debug!("request rejected: {self}");
            jsend::fail(status, self.public_message())
        }
    }
}
