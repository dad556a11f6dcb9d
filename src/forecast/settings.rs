//! Forecasting Settings Registry
//!
//! Per-target configuration: active flag, stake bounds, revenue-connection
//! status, and the latest externally verified MRR reading. The external
//! revenue-verification collaborator is the sole writer of the MRR cache;
//! every push is last-write-wins.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::SharedConn;
use crate::forecast::error::{ForecastError, ForecastResult};

pub const DEFAULT_MIN_STAKE: i64 = 10;
pub const DEFAULT_MAX_STAKE: i64 = 1000;

/// What kind of entity the forecast target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Company,
    User,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "COMPANY",
            Self::User => "USER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "COMPANY" => Some(Self::Company),
            "USER" => Some(Self::User),
            _ => None,
        }
    }
}

/// Revenue-data connection status for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connected => "CONNECTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DISCONNECTED" => Some(Self::Disconnected),
            "CONNECTED" => Some(Self::Connected),
            _ => None,
        }
    }
}

/// Forecasting configuration for one target (company or builder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastSettings {
    pub target_id: String,
    pub target_kind: TargetKind,
    pub is_active: bool,
    pub min_stake: i64,
    pub max_stake: i64,
    pub connection_status: ConnectionStatus,
    /// Latest verified MRR in cents, absent until the first push.
    pub cached_mrr_cents: Option<i64>,
    pub cached_mrr_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ForecastSettings {
    /// Bets may be placed only when active and the revenue source is live.
    pub fn accepts_bets(&self) -> bool {
        self.is_active && self.connection_status == ConnectionStatus::Connected
    }
}

/// Settings store, one row per target.
pub struct SettingsRegistry {
    conn: SharedConn,
}

impl SettingsRegistry {
    pub fn new(conn: SharedConn) -> ForecastResult<Self> {
        {
            let guard = conn
                .try_lock()
                .expect("settings registry constructed while connection is in use");
            Self::init_schema(&guard)?;
        }
        Ok(Self { conn })
    }

    /// Enable forecasting for a target, creating its settings row. Re-enabling
    /// an existing target just flips it active again.
    pub async fn enable(&self, target_id: &str, kind: TargetKind) -> ForecastResult<ForecastSettings> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO forecast_settings
                (target_id, target_kind, is_active, min_stake, max_stake,
                 connection_status, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, 'DISCONNECTED', ?5, ?5)
             ON CONFLICT(target_id) DO UPDATE SET is_active = 1, updated_at = ?5",
            params![target_id, kind.as_str(), DEFAULT_MIN_STAKE, DEFAULT_MAX_STAKE, now],
        )?;
        Self::get_in(&conn, target_id)?.ok_or(ForecastError::NotConfigured)
    }

    pub async fn get(&self, target_id: &str) -> ForecastResult<ForecastSettings> {
        let conn = self.conn.lock().await;
        Self::get_in(&conn, target_id)?.ok_or(ForecastError::NotConfigured)
    }

    /// Toggle the active flag. Deactivating does not void already-placed bets.
    pub async fn set_active(&self, target_id: &str, is_active: bool) -> ForecastResult<ForecastSettings> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE forecast_settings SET is_active = ?2, updated_at = ?3 WHERE target_id = ?1",
            params![target_id, is_active as i64, now],
        )?;
        if changed == 0 {
            return Err(ForecastError::NotConfigured);
        }
        Self::get_in(&conn, target_id)?.ok_or(ForecastError::NotConfigured)
    }

    pub async fn set_stake_bounds(
        &self,
        target_id: &str,
        min_stake: i64,
        max_stake: i64,
    ) -> ForecastResult<ForecastSettings> {
        if min_stake < 1 || min_stake > max_stake {
            return Err(ForecastError::InvalidBounds);
        }
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE forecast_settings SET min_stake = ?2, max_stake = ?3, updated_at = ?4
             WHERE target_id = ?1",
            params![target_id, min_stake, max_stake, now],
        )?;
        if changed == 0 {
            return Err(ForecastError::NotConfigured);
        }
        Self::get_in(&conn, target_id)?.ok_or(ForecastError::NotConfigured)
    }

    /// Push from the revenue-verification collaborator. Always overwrites the
    /// cache (the collaborator delivers monotonically increasing timestamps)
    /// and flips the connection live.
    pub async fn update_verified_mrr(
        &self,
        target_id: &str,
        mrr_cents: i64,
        observed_at: DateTime<Utc>,
    ) -> ForecastResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE forecast_settings
             SET cached_mrr_cents = ?2, cached_mrr_at = ?3,
                 connection_status = 'CONNECTED', updated_at = ?4
             WHERE target_id = ?1",
            params![target_id, mrr_cents, observed_at.to_rfc3339(), now],
        )?;
        if changed == 0 {
            return Err(ForecastError::NotConfigured);
        }
        Ok(())
    }

    /// Connection dropped. Periods and bets are untouched; the settlement
    /// engine's VOID path handles the consequence.
    pub async fn on_disconnect(&self, target_id: &str) -> ForecastResult<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE forecast_settings SET connection_status = 'DISCONNECTED', updated_at = ?2
             WHERE target_id = ?1",
            params![target_id, now],
        )?;
        if changed == 0 {
            return Err(ForecastError::NotConfigured);
        }
        Ok(())
    }

    pub(crate) fn get_in(conn: &Connection, target_id: &str) -> ForecastResult<Option<ForecastSettings>> {
        let settings = conn
            .query_row(
                "SELECT target_id, target_kind, is_active, min_stake, max_stake,
                        connection_status, cached_mrr_cents, cached_mrr_at,
                        created_at, updated_at
                 FROM forecast_settings WHERE target_id = ?1",
                [target_id],
                Self::map_row,
            )
            .optional()?;
        Ok(settings)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ForecastSettings> {
        let kind: String = row.get(1)?;
        let status: String = row.get(5)?;
        let cached_at: Option<String> = row.get(7)?;
        Ok(ForecastSettings {
            target_id: row.get(0)?,
            target_kind: TargetKind::from_str(&kind).unwrap_or(TargetKind::Company),
            is_active: row.get::<_, i64>(2)? == 1,
            min_stake: row.get(3)?,
            max_stake: row.get(4)?,
            connection_status: ConnectionStatus::from_str(&status)
                .unwrap_or(ConnectionStatus::Disconnected),
            cached_mrr_cents: row.get(6)?,
            cached_mrr_at: cached_at.map(|s| parse_utc(&s)),
            created_at: parse_utc(&row.get::<_, String>(8)?),
            updated_at: parse_utc(&row.get::<_, String>(9)?),
        })
    }

    fn init_schema(conn: &Connection) -> ForecastResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS forecast_settings (
                target_id TEXT PRIMARY KEY,
                target_kind TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                min_stake INTEGER NOT NULL,
                max_stake INTEGER NOT NULL,
                connection_status TEXT NOT NULL DEFAULT 'DISCONNECTED',
                cached_mrr_cents INTEGER,
                cached_mrr_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}

pub(crate) fn parse_utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::error!(value = s, error = %e, "Malformed stored timestamp");
            Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn registry() -> SettingsRegistry {
        SettingsRegistry::new(db::open_in_memory()).unwrap()
    }

    #[tokio::test]
    async fn enable_creates_defaults() {
        let reg = registry();
        let s = reg.enable("acme", TargetKind::Company).await.unwrap();
        assert!(s.is_active);
        assert_eq!(s.min_stake, DEFAULT_MIN_STAKE);
        assert_eq!(s.max_stake, DEFAULT_MAX_STAKE);
        assert_eq!(s.connection_status, ConnectionStatus::Disconnected);
        assert!(s.cached_mrr_cents.is_none());
        assert!(!s.accepts_bets());
    }

    #[tokio::test]
    async fn unknown_target_is_not_configured() {
        let reg = registry();
        assert!(matches!(
            reg.get("nobody").await.unwrap_err(),
            ForecastError::NotConfigured
        ));
    }

    #[tokio::test]
    async fn mrr_push_connects_and_caches() {
        let reg = registry();
        reg.enable("acme", TargetKind::Company).await.unwrap();
        reg.update_verified_mrr("acme", 100_000, Utc::now()).await.unwrap();

        let s = reg.get("acme").await.unwrap();
        assert_eq!(s.connection_status, ConnectionStatus::Connected);
        assert_eq!(s.cached_mrr_cents, Some(100_000));
        assert!(s.accepts_bets());
    }

    #[tokio::test]
    async fn last_write_wins_on_mrr_cache() {
        let reg = registry();
        reg.enable("acme", TargetKind::Company).await.unwrap();
        reg.update_verified_mrr("acme", 100_000, Utc::now()).await.unwrap();
        reg.update_verified_mrr("acme", 90_000, Utc::now()).await.unwrap();
        assert_eq!(reg.get("acme").await.unwrap().cached_mrr_cents, Some(90_000));
    }

    #[tokio::test]
    async fn disconnect_keeps_cache() {
        let reg = registry();
        reg.enable("acme", TargetKind::Company).await.unwrap();
        reg.update_verified_mrr("acme", 100_000, Utc::now()).await.unwrap();
        reg.on_disconnect("acme").await.unwrap();

        let s = reg.get("acme").await.unwrap();
        assert_eq!(s.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(s.cached_mrr_cents, Some(100_000));
        assert!(!s.accepts_bets());
    }

    #[tokio::test]
    async fn bounds_validation() {
        let reg = registry();
        reg.enable("acme", TargetKind::Company).await.unwrap();

        assert!(matches!(
            reg.set_stake_bounds("acme", 50, 20).await.unwrap_err(),
            ForecastError::InvalidBounds
        ));
        assert!(matches!(
            reg.set_stake_bounds("acme", 0, 20).await.unwrap_err(),
            ForecastError::InvalidBounds
        ));

        let s = reg.set_stake_bounds("acme", 5, 500).await.unwrap();
        assert_eq!((s.min_stake, s.max_stake), (5, 500));
    }
}
