//! Coin Ledger
//!
//! Owns per-user coin balances. Coins are non-transferable in-app credits;
//! the only mutations are an atomic conditional debit (never below zero) and
//! an atomic credit. Every other component pairs its row writes with these
//! mutations through the `*_in` transaction-scoped variants — nothing else
//! in the codebase writes `coin_balances` directly.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::db::SharedConn;
use crate::forecast::error::{ForecastError, ForecastResult};

/// Coin balance store. Balances are created lazily at zero on first touch.
pub struct CoinLedger {
    conn: SharedConn,
}

impl CoinLedger {
    /// Create the store and initialize tables. Constructed at startup,
    /// before any worker holds the connection.
    pub fn new(conn: SharedConn) -> ForecastResult<Self> {
        {
            let guard = conn
                .try_lock()
                .expect("coin ledger constructed while connection is in use");
            Self::init_schema(&guard)?;
        }
        Ok(Self { conn })
    }

    /// Current balance for a user, creating the zero row if absent.
    pub async fn balance(&self, user_id: &str) -> ForecastResult<i64> {
        let conn = self.conn.lock().await;
        Self::ensure_row(&conn, user_id)?;
        let balance = conn.query_row(
            "SELECT balance FROM coin_balances WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    /// Atomically add `amount` coins to a user's balance.
    pub async fn credit(&self, user_id: &str, amount: i64) -> ForecastResult<i64> {
        let conn = self.conn.lock().await;
        Self::credit_in(&conn, user_id, amount)
    }

    /// Atomically remove `amount` coins, failing with `InsufficientBalance`
    /// when the balance would go negative.
    pub async fn debit(&self, user_id: &str, amount: i64) -> ForecastResult<i64> {
        let conn = self.conn.lock().await;
        Self::debit_in(&conn, user_id, amount)
    }

    /// One-time starter grant so a new user can place bets. Idempotent: a
    /// user who already received the grant gets nothing.
    pub async fn grant_signup_coins(&self, user_id: &str, amount: i64) -> ForecastResult<bool> {
        let conn = self.conn.lock().await;
        Self::ensure_row(&conn, user_id)?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE coin_balances SET balance = balance + ?2, signup_granted = 1, updated_at = ?3
             WHERE user_id = ?1 AND signup_granted = 0",
            params![user_id, amount, now],
        )?;
        Ok(changed == 1)
    }

    /// Credit inside a caller-owned transaction or connection.
    pub fn credit_in(conn: &Connection, user_id: &str, amount: i64) -> ForecastResult<i64> {
        if amount < 0 {
            return Err(ForecastError::InvalidInput(
                "credit amount must be non-negative".into(),
            ));
        }
        Self::ensure_row(conn, user_id)?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE coin_balances SET balance = balance + ?2, updated_at = ?3 WHERE user_id = ?1",
            params![user_id, amount, now],
        )?;
        Self::read_balance(conn, user_id)
    }

    /// Debit inside a caller-owned transaction or connection. The affordability
    /// check and the decrement are a single conditional UPDATE.
    pub fn debit_in(conn: &Connection, user_id: &str, amount: i64) -> ForecastResult<i64> {
        if amount < 0 {
            return Err(ForecastError::InvalidInput(
                "debit amount must be non-negative".into(),
            ));
        }
        Self::ensure_row(conn, user_id)?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE coin_balances SET balance = balance - ?2, updated_at = ?3
             WHERE user_id = ?1 AND balance >= ?2",
            params![user_id, amount, now],
        )?;
        if changed == 0 {
            return Err(ForecastError::InsufficientBalance);
        }
        Self::read_balance(conn, user_id)
    }

    fn ensure_row(conn: &Connection, user_id: &str) -> ForecastResult<()> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO coin_balances (user_id, balance, signup_granted, updated_at)
             VALUES (?1, 0, 0, ?2)
             ON CONFLICT(user_id) DO NOTHING",
            params![user_id, now],
        )?;
        Ok(())
    }

    fn read_balance(conn: &Connection, user_id: &str) -> ForecastResult<i64> {
        let balance = conn.query_row(
            "SELECT balance FROM coin_balances WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    fn init_schema(conn: &Connection) -> ForecastResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS coin_balances (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                signup_granted INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn ledger() -> CoinLedger {
        CoinLedger::new(db::open_in_memory()).unwrap()
    }

    #[tokio::test]
    async fn balance_starts_at_zero() {
        let ledger = ledger();
        assert_eq!(ledger.balance("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn credit_then_debit() {
        let ledger = ledger();
        assert_eq!(ledger.credit("alice", 100).await.unwrap(), 100);
        assert_eq!(ledger.debit("alice", 40).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn debit_never_goes_negative() {
        let ledger = ledger();
        ledger.credit("alice", 30).await.unwrap();

        let err = ledger.debit("alice", 31).await.unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientBalance));

        // Balance unchanged after the failed debit
        assert_eq!(ledger.balance("alice").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn debit_exact_balance_is_allowed() {
        let ledger = ledger();
        ledger.credit("alice", 50).await.unwrap();
        assert_eq!(ledger.debit("alice", 50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn signup_grant_is_idempotent() {
        let ledger = ledger();
        assert!(ledger.grant_signup_coins("bob", 500).await.unwrap());
        assert!(!ledger.grant_signup_coins("bob", 500).await.unwrap());
        assert_eq!(ledger.balance("bob").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn negative_amounts_rejected() {
        let ledger = ledger();
        assert!(ledger.credit("alice", -1).await.is_err());
        assert!(ledger.debit("alice", -1).await.is_err());
    }
}
