//! Ledger store: accounts, balances, escrow authorizations and the
//! append-only transaction log.
//!
//! Every operation runs inside one database transaction. Balances are moved
//! with a compare-and-set update so that two writers racing on the same row
//! can never both succeed from the same starting point, and an authorization
//! changes state only through a single conditional statement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::address::Address;
use crate::clock::Clock;
use crate::config::EscrowConfig;
use crate::errors::{EscrowError, Result};
use crate::fil::Fil;
use crate::models::{
    Account, AccountKind, Authorization, AuthorizationStatus, AuthorizeOutcome, Balance, RedeemOutcome,
    RefundOutcome, TransactionKind, TRANSACTION_COMPLETED,
};

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: EscrowConfig,
}

impl Ledger {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, config: EscrowConfig) -> Self {
        Self {
            pool,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// A transaction holding SQLite's write lock from its first statement.
    /// Concurrent writers queue on the busy timeout instead of failing halfway.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Authorizations created at or before this instant are past the deadline.
    fn cutoff_ms(&self) -> i64 {
        self.now_ms() - self.config.deadline.num_milliseconds()
    }

    // ─────────────────────────────────────────────────────────
    // Accounts
    // ─────────────────────────────────────────────────────────

    pub async fn account(&self, address: &Address) -> Result<Option<Account>> {
        let mut conn = self.pool.acquire().await?;
        account_by_address(&mut conn, address).await
    }

    /// Create a storage provider account with a zero balance and its price.
    pub async fn register_proxy(&self, address: &Address, sp_id: &str, price: &Fil) -> Result<()> {
        if price.is_zero() {
            return Err(EscrowError::Validation("price must be positive".to_string()));
        }
        let now = self.now_ms();
        let mut tx = self.begin_write().await?;

        let account_id = insert_account(&mut tx, address, AccountKind::StorageProvider, now)
            .await
            .map_err(|e| match e {
                EscrowError::Database(ref db) if is_unique_violation(db) => {
                    EscrowError::AccountExists
                }
                other => other,
            })?;

        sqlx::query("INSERT INTO storage_providers (account_id, sp_id, price) VALUES (?1, ?2, ?3)")
            .bind(account_id)
            .bind(sp_id)
            .bind(price.to_db()?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("Registered storage provider {sp_id} at {address} (price {price})");
        Ok(())
    }

    /// Current price of a registered storage provider.
    pub async fn proxy_price(&self, proxy: &Address) -> Result<Fil> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT sp.price
            FROM   storage_providers sp
            JOIN   accounts a ON a.id = sp.account_id
            WHERE  a.wallet_address = ?1
            "#,
        )
        .bind(proxy.to_string())
        .fetch_optional(&self.pool)
        .await?;
        let (price,) = row.ok_or(EscrowError::UnknownProxy)?;
        Fil::from_db(&price)
    }

    pub async fn balance(&self, address: &Address) -> Result<Balance> {
        let mut conn = self.pool.acquire().await?;
        let account = account_by_address(&mut conn, address)
            .await?
            .ok_or(EscrowError::AccountNotFound)?;
        load_balance(&mut conn, account.id).await
    }

    /// Look up an authorization by id, whatever its state.
    pub async fn authorization(&self, id: Uuid) -> Result<Option<Authorization>> {
        let row: Option<(i64, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT owner_id, proxy, amount, status_id, created_at
            FROM   escrow
            WHERE  uuid = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some((owner_id, proxy, amount, status, created_at)) = row else {
            return Ok(None);
        };
        let status = AuthorizationStatus::from_db(status)
            .ok_or_else(|| EscrowError::Validation(format!("corrupt escrow status: {status}")))?;
        let created_at = DateTime::<Utc>::from_timestamp_millis(created_at)
            .ok_or_else(|| EscrowError::Validation(format!("corrupt escrow timestamp: {created_at}")))?;
        Ok(Some(Authorization {
            id,
            owner_id,
            proxy: proxy.parse()?,
            amount: Fil::from_db(&amount)?,
            status,
            created_at,
        }))
    }

    // ─────────────────────────────────────────────────────────
    // Deposits and withdrawals
    // ─────────────────────────────────────────────────────────

    pub async fn is_transaction_registered(&self, hash: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM transactions WHERE transaction_hash = ?1")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Credit a confirmed chain deposit, opening a client account on first use.
    pub async fn deposit(&self, address: &Address, amount: &Fil, hash: &str) -> Result<Balance> {
        require_positive(amount)?;
        let now = self.now_ms();
        let mut tx = self.begin_write().await?;

        let account = ensure_client(&mut tx, address, now).await?;
        let balance = adjust_balance(&mut tx, account.id, now, |b| {
            Some(Balance {
                available: &b.available + amount,
                escrow: b.escrow,
            })
        })
        .await?;

        log_transaction(
            &mut tx,
            address,
            &self.config.bank_wallet,
            amount,
            TransactionKind::Deposit,
            Some(hash),
            now,
        )
        .await
        .map_err(|e| match e {
            EscrowError::Database(ref db) if is_unique_violation(db) => {
                EscrowError::DuplicateChainTransaction
            }
            other => other,
        })?;

        tx.commit().await?;
        info!("Deposit of {amount} to {address} ({hash})");
        Ok(balance)
    }

    /// Debit `amount` ahead of an outbound chain transfer.
    ///
    /// Must be followed by [`Ledger::record_withdrawal`] once the transfer is
    /// submitted or by [`Ledger::release_withdrawal`] if it fails.
    pub async fn reserve_withdrawal(&self, address: &Address, amount: &Fil) -> Result<Balance> {
        require_positive(amount)?;
        let now = self.now_ms();
        let mut tx = self.begin_write().await?;

        let account = account_by_address(&mut tx, address)
            .await?
            .ok_or(EscrowError::InsufficientFunds)?;
        let balance = adjust_balance(&mut tx, account.id, now, |b| {
            Some(Balance {
                available: b.available.checked_sub(amount)?,
                escrow: b.escrow,
            })
        })
        .await?;

        tx.commit().await?;
        Ok(balance)
    }

    /// Log a submitted withdrawal and drop the client's rows if nothing is left.
    pub async fn record_withdrawal(
        &self,
        address: &Address,
        destination: &Address,
        amount: &Fil,
        hash: &str,
    ) -> Result<Balance> {
        let now = self.now_ms();
        let mut tx = self.begin_write().await?;

        log_transaction(
            &mut tx,
            &self.config.bank_wallet,
            destination,
            amount,
            TransactionKind::Withdraw,
            Some(hash),
            now,
        )
        .await?;

        let balance = match account_by_address(&mut tx, address).await? {
            Some(account) => {
                let balance = load_balance(&mut tx, account.id).await?;
                drop_if_empty(&mut tx, &account, &balance).await?;
                balance
            }
            None => Balance::default(),
        };

        tx.commit().await?;
        info!("Withdrawal of {amount} from {address} to {destination} ({hash})");
        Ok(balance)
    }

    /// Give back a reservation whose chain transfer never happened.
    pub async fn release_withdrawal(&self, address: &Address, amount: &Fil) -> Result<Balance> {
        let now = self.now_ms();
        let mut tx = self.begin_write().await?;

        let account = match account_by_address(&mut tx, address).await? {
            Some(account) => account,
            None => ensure_client(&mut tx, address, now).await?,
        };
        let balance = adjust_balance(&mut tx, account.id, now, |b| {
            Some(Balance {
                available: &b.available + amount,
                escrow: b.escrow,
            })
        })
        .await?;

        tx.commit().await?;
        info!("Released withdrawal reservation of {amount} for {address}");
        Ok(balance)
    }

    // ─────────────────────────────────────────────────────────
    // Escrow
    // ─────────────────────────────────────────────────────────

    /// Lock the proxy's current price into a new open authorization.
    pub async fn authorize(&self, address: &Address, proxy: &Address) -> Result<AuthorizeOutcome> {
        let price = self.proxy_price(proxy).await?;
        let now = self.now_ms();
        let mut tx = self.begin_write().await?;

        let account = account_by_address(&mut tx, address)
            .await?
            .ok_or(EscrowError::InsufficientFunds)?;
        if account.kind != AccountKind::Client {
            return Err(EscrowError::OperationNotAllowed);
        }

        let balance = adjust_balance(&mut tx, account.id, now, |b| {
            Some(Balance {
                available: b.available.checked_sub(&price)?,
                escrow: &b.escrow + &price,
            })
        })
        .await?;

        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO escrow (uuid, owner_id, proxy, amount, status_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
        )
        .bind(id.to_string())
        .bind(account.id)
        .bind(proxy.to_string())
        .bind(price.to_db()?)
        .bind(AuthorizationStatus::Open.as_db())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        log_transaction(
            &mut tx,
            address,
            &self.config.escrow_wallet,
            &price,
            TransactionKind::Authorize,
            None,
            now,
        )
        .await?;

        tx.commit().await?;
        debug!("Authorization {id}: {price} from {address} for {proxy}");
        Ok(AuthorizeOutcome {
            id,
            available: balance.available,
            escrow: balance.escrow,
        })
    }

    /// Lock an open, unexpired authorization for exclusive use by `proxy`.
    pub async fn verify(&self, proxy: &Address, id: Uuid, amount: &Fil) -> Result<()> {
        let now = self.now_ms();
        let mut conn = self.pool.acquire().await?;
        require_storage_provider(&mut conn, proxy).await?;

        let locked = sqlx::query(
            r#"
            UPDATE escrow
               SET status_id = ?1, updated_at = ?2
             WHERE uuid = ?3
               AND proxy = ?4
               AND amount >= ?5
               AND created_at > ?6
               AND status_id = ?7
            "#,
        )
        .bind(AuthorizationStatus::Locked.as_db())
        .bind(now)
        .bind(id.to_string())
        .bind(proxy.to_string())
        .bind(amount.to_db()?)
        .bind(self.cutoff_ms())
        .bind(AuthorizationStatus::Open.as_db())
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if locked == 0 {
            return Err(EscrowError::AuthorizationNotFound);
        }
        debug!("Authorization {id} locked by {proxy}");
        Ok(())
    }

    /// Settle a locked authorization: pay `cost` to the proxy and hand the
    /// rest back to the owner.
    pub async fn redeem(&self, proxy: &Address, id: Uuid, cost: &Fil) -> Result<RedeemOutcome> {
        let now = self.now_ms();
        let mut tx = self.begin_write().await?;
        let sp = require_storage_provider(&mut tx, proxy).await?;

        let row: Option<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT e.owner_id, e.amount, a.wallet_address
            FROM   escrow e
            JOIN   accounts a ON a.id = e.owner_id
            WHERE  e.uuid = ?1 AND e.proxy = ?2 AND e.status_id = ?3
            "#,
        )
        .bind(id.to_string())
        .bind(proxy.to_string())
        .bind(AuthorizationStatus::Locked.as_db())
        .fetch_optional(&mut *tx)
        .await?;
        let (owner_id, amount, owner_address) = row.ok_or(EscrowError::AuthorizationNotFound)?;
        let amount = Fil::from_db(&amount)?;
        let owner_address: Address = owner_address.parse()?;
        let excess = amount
            .checked_sub(cost)
            .ok_or(EscrowError::AuthorizationNotFound)?;

        let deleted = sqlx::query("DELETE FROM escrow WHERE uuid = ?1 AND status_id = ?2")
            .bind(id.to_string())
            .bind(AuthorizationStatus::Locked.as_db())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(EscrowError::AuthorizationNotFound);
        }

        let sp_balance = adjust_balance(&mut tx, sp.id, now, |b| {
            Some(Balance {
                available: &b.available + cost,
                escrow: b.escrow,
            })
        })
        .await?;
        let owner_balance = adjust_balance(&mut tx, owner_id, now, |b| {
            Some(Balance {
                available: &b.available + &excess,
                escrow: b.escrow.checked_sub(&amount)?,
            })
        })
        .await?;

        let escrow_wallet = self.config.escrow_wallet;
        if !cost.is_zero() {
            log_transaction(
                &mut tx,
                &escrow_wallet,
                proxy,
                cost,
                TransactionKind::Redeem,
                None,
                now,
            )
            .await?;
        }
        if !excess.is_zero() {
            log_transaction(
                &mut tx,
                &escrow_wallet,
                &owner_address,
                &excess,
                TransactionKind::Excess,
                None,
                now,
            )
            .await?;
        }

        let owner = Account {
            id: owner_id,
            address: owner_address,
            kind: AccountKind::Client,
        };
        drop_if_empty(&mut tx, &owner, &owner_balance).await?;

        tx.commit().await?;
        info!("Authorization {id} redeemed by {proxy}: cost {cost}, excess {excess}");
        Ok(RedeemOutcome {
            excess,
            sp: sp_balance.available,
            cli: owner_balance.available,
        })
    }

    /// Return every expired, never-verified authorization of `address` to its
    /// available balance.
    pub async fn refund(&self, address: &Address) -> Result<RefundOutcome> {
        let now = self.now_ms();
        let mut tx = self.begin_write().await?;

        let account = account_by_address(&mut tx, address)
            .await?
            .ok_or(EscrowError::AccountNotFound)?;

        let expired: Vec<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM escrow
             WHERE owner_id = ?1 AND status_id = ?2 AND created_at <= ?3
            RETURNING amount
            "#,
        )
        .bind(account.id)
        .bind(AuthorizationStatus::Open.as_db())
        .bind(self.cutoff_ms())
        .fetch_all(&mut *tx)
        .await?;

        let mut total = Fil::zero();
        for (amount,) in &expired {
            total = total + Fil::from_db(amount)?;
        }
        if total.is_zero() {
            return Err(EscrowError::NothingToRefund);
        }

        let balance = adjust_balance(&mut tx, account.id, now, |b| {
            Some(Balance {
                available: &b.available + &total,
                escrow: b.escrow.checked_sub(&total)?,
            })
        })
        .await?;

        log_transaction(
            &mut tx,
            &self.config.escrow_wallet,
            address,
            &total,
            TransactionKind::Refund,
            None,
            now,
        )
        .await?;

        tx.commit().await?;
        info!(
            "Refunded {total} to {address} from {} expired authorizations",
            expired.len()
        );
        Ok(RefundOutcome {
            expired: total,
            available: balance.available,
            escrow: balance.escrow,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn require_positive(amount: &Fil) -> Result<()> {
    if amount.is_zero() {
        return Err(EscrowError::Validation("amount must be positive".to_string()));
    }
    Ok(())
}

async fn account_by_address(
    conn: &mut SqliteConnection,
    address: &Address,
) -> Result<Option<Account>> {
    let row: Option<(i64, i64)> =
        sqlx::query_as("SELECT id, account_type FROM accounts WHERE wallet_address = ?1")
            .bind(address.to_string())
            .fetch_optional(&mut *conn)
            .await?;

    row.map(|(id, kind)| {
        let kind = AccountKind::from_db(kind)
            .ok_or_else(|| EscrowError::Validation(format!("corrupt account type {kind}")))?;
        Ok(Account {
            id,
            address: *address,
            kind,
        })
    })
    .transpose()
}

async fn require_storage_provider(
    conn: &mut SqliteConnection,
    address: &Address,
) -> Result<Account> {
    match account_by_address(conn, address).await? {
        Some(account) if account.kind == AccountKind::StorageProvider => Ok(account),
        _ => Err(EscrowError::OperationNotAllowed),
    }
}

async fn insert_account(
    conn: &mut SqliteConnection,
    address: &Address,
    kind: AccountKind,
    now: i64,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO accounts (wallet_address, account_type, created_at) VALUES (?1, ?2, ?3) RETURNING id",
    )
    .bind(address.to_string())
    .bind(kind.as_db())
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    let zero = Fil::zero().to_db()?;
    sqlx::query(
        "INSERT INTO balances (account_id, available, escrow, updated_at) VALUES (?1, ?2, ?2, ?3)",
    )
    .bind(id)
    .bind(zero)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

/// The client account at `address`, created on first use.
async fn ensure_client(conn: &mut SqliteConnection, address: &Address, now: i64) -> Result<Account> {
    if let Some(account) = account_by_address(conn, address).await? {
        if account.kind != AccountKind::Client {
            return Err(EscrowError::OperationNotAllowed);
        }
        return Ok(account);
    }
    let id = insert_account(conn, address, AccountKind::Client, now).await?;
    Ok(Account {
        id,
        address: *address,
        kind: AccountKind::Client,
    })
}

async fn load_balance(conn: &mut SqliteConnection, account_id: i64) -> Result<Balance> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT available, escrow FROM balances WHERE account_id = ?1")
            .bind(account_id)
            .fetch_optional(&mut *conn)
            .await?;
    let (available, escrow) = row.ok_or(EscrowError::AccountNotFound)?;
    Ok(Balance {
        available: Fil::from_db(&available)?,
        escrow: Fil::from_db(&escrow)?,
    })
}

/// Read-modify-write of one balance row.
///
/// `adjust` returns `None` when the change would take a field below zero. The
/// write only lands if the row still holds the values that were read.
async fn adjust_balance(
    conn: &mut SqliteConnection,
    account_id: i64,
    now: i64,
    adjust: impl FnOnce(Balance) -> Option<Balance>,
) -> Result<Balance> {
    let current = load_balance(conn, account_id).await?;
    let (seen_available, seen_escrow) = (current.available.to_db()?, current.escrow.to_db()?);
    let next = adjust(current).ok_or(EscrowError::InsufficientFunds)?;

    let row: Option<(String, String)> = sqlx::query_as(
        r#"
        UPDATE balances
           SET available = ?1, escrow = ?2, updated_at = ?3
         WHERE account_id = ?4 AND available = ?5 AND escrow = ?6
        RETURNING available, escrow
        "#,
    )
    .bind(next.available.to_db()?)
    .bind(next.escrow.to_db()?)
    .bind(now)
    .bind(account_id)
    .bind(seen_available)
    .bind(seen_escrow)
    .fetch_optional(&mut *conn)
    .await?;

    let (available, escrow) = row.ok_or(EscrowError::InsufficientFunds)?;
    Ok(Balance {
        available: Fil::from_db(&available)?,
        escrow: Fil::from_db(&escrow)?,
    })
}

/// Clients with nothing left are removed to keep the ledger compact.
async fn drop_if_empty(conn: &mut SqliteConnection, account: &Account, balance: &Balance) -> Result<()> {
    if account.kind != AccountKind::Client || !balance.available.is_zero() || !balance.escrow.is_zero() {
        return Ok(());
    }
    sqlx::query("DELETE FROM accounts WHERE id = ?1")
        .bind(account.id)
        .execute(&mut *conn)
        .await?;
    debug!("Dropped empty account {}", account.address);
    Ok(())
}

async fn log_transaction(
    conn: &mut SqliteConnection,
    source: &Address,
    destination: &Address,
    value: &Fil,
    kind: TransactionKind,
    hash: Option<&str>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions
            (source, destination, value, kind, status_id, transaction_hash, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(source.to_string())
    .bind(destination.to_string())
    .bind(value.to_db()?)
    .bind(kind.as_str())
    .bind(TRANSACTION_COMPLETED)
    .bind(hash)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
