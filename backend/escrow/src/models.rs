//! Ledger records and operation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::fil::Fil;

/// Kind of participant behind an account. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    StorageProvider,
    Client,
}

impl AccountKind {
    pub fn as_db(self) -> i64 {
        match self {
            Self::StorageProvider => 1,
            Self::Client => 2,
        }
    }

    pub fn from_db(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Self::StorageProvider),
            2 => Some(Self::Client),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub address: Address,
    pub kind: AccountKind,
}

/// Lifecycle of an escrow authorization.
///
/// ```text
/// Open ──verify──► Locked ──redeem──► (deleted)
///   └──refund (after deadline)──────► (deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Open,
    Locked,
}

impl AuthorizationStatus {
    pub fn as_db(self) -> i64 {
        match self {
            Self::Open => 1,
            Self::Locked => 2,
        }
    }

    pub fn from_db(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Self::Open),
            2 => Some(Self::Locked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub id: Uuid,
    pub owner_id: i64,
    pub proxy: Address,
    pub amount: Fil,
    pub status: AuthorizationStatus,
    pub created_at: DateTime<Utc>,
}

/// Spendable and locked funds of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub available: Fil,
    pub escrow: Fil,
}

/// What a value movement in the transaction log represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Authorize,
    Redeem,
    Excess,
    Refund,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Authorize => "authorize",
            Self::Redeem => "redeem",
            Self::Excess => "excess",
            Self::Refund => "refund",
        }
    }
}

pub const TRANSACTION_COMPLETED: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizeOutcome {
    pub id: Uuid,
    pub available: Fil,
    pub escrow: Fil,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemOutcome {
    /// Escrowed value returned to the client.
    pub excess: Fil,
    /// Storage provider's available balance after settlement.
    pub sp: Fil,
    /// Client's available balance after settlement.
    pub cli: Fil,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundOutcome {
    pub expired: Fil,
    pub available: Fil,
    pub escrow: Fil,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithdrawOutcome {
    pub available: Fil,
    pub hash: String,
}
