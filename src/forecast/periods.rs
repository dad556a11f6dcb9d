//! Forecasting Period Manager
//!
//! One live (OPEN or LOCKED) period per target at a time, aligned to calendar
//! quarters. State transitions are monotonic:
//!
//!   OPEN -> LOCKED -> RESOLVING -> RESOLVED
//!
//! OPEN periods accept bets; the background tick locks them at `ends_at`;
//! `claim_for_resolution` is the compare-and-swap that hands a LOCKED period
//! to exactly one settlement worker.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::SharedConn;
use crate::forecast::error::{ForecastError, ForecastResult};
use crate::forecast::settings::{parse_utc, SettingsRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodState {
    Open,
    Locked,
    Resolving,
    Resolved,
}

impl PeriodState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Locked => "LOCKED",
            Self::Resolving => "RESOLVING",
            Self::Resolved => "RESOLVED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "LOCKED" => Some(Self::Locked),
            "RESOLVING" => Some(Self::Resolving),
            "RESOLVED" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// A forecasting window for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Period {
    pub id: String,
    pub target_id: String,
    /// Calendar-quarter label, e.g. "2026-Q3".
    pub label: String,
    pub state: PeriodState,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub baseline_mrr_cents: i64,
    /// Observed at settlement; stays NULL when the period resolved VOID.
    pub ending_mrr_cents: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Quarter label for an instant, e.g. "2026-Q3".
pub fn quarter_label(at: DateTime<Utc>) -> String {
    format!("{}-Q{}", at.year(), at.month0() / 3 + 1)
}

/// Start of the next calendar quarter after `at` (UTC).
pub fn next_quarter_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let quarter = at.month0() / 3;
    let (year, month) = if quarter == 3 {
        (at.year() + 1, 1)
    } else {
        (at.year(), 3 * (quarter + 1) + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}

/// Period store and state machine.
pub struct PeriodManager {
    conn: SharedConn,
}

impl PeriodManager {
    pub fn new(conn: SharedConn) -> ForecastResult<Self> {
        {
            let guard = conn
                .try_lock()
                .expect("period manager constructed while connection is in use");
            Self::init_schema(&guard)?;
        }
        Ok(Self { conn })
    }

    /// Open a new period for a target, using the latest verified MRR as the
    /// baseline. Fails `AlreadyOpen` when a live period exists and
    /// `NoBaseline` when no MRR reading has ever arrived.
    pub async fn open_period(&self, target_id: &str, now: DateTime<Utc>) -> ForecastResult<Period> {
        let conn = self.conn.lock().await;
        let settings =
            SettingsRegistry::get_in(&conn, target_id)?.ok_or(ForecastError::NotConfigured)?;
        let baseline = settings.cached_mrr_cents.ok_or(ForecastError::NoBaseline)?;
        Self::open_period_in(&conn, target_id, baseline, now)
    }

    /// Transaction-scoped open, used by the settlement engine to roll a
    /// resolved period over with an explicit baseline.
    pub(crate) fn open_period_in(
        conn: &Connection,
        target_id: &str,
        baseline_mrr_cents: i64,
        now: DateTime<Utc>,
    ) -> ForecastResult<Period> {
        let period = Period {
            id: Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            label: quarter_label(now),
            state: PeriodState::Open,
            starts_at: now,
            ends_at: next_quarter_start(now),
            baseline_mrr_cents,
            ending_mrr_cents: None,
            resolved_at: None,
        };

        let result = conn.execute(
            "INSERT INTO forecast_periods
                (id, target_id, label, state, starts_at, ends_at, baseline_mrr_cents)
             VALUES (?1, ?2, ?3, 'OPEN', ?4, ?5, ?6)",
            params![
                period.id,
                period.target_id,
                period.label,
                period.starts_at.to_rfc3339(),
                period.ends_at.to_rfc3339(),
                period.baseline_mrr_cents,
            ],
        );

        match result {
            Ok(_) => Ok(period),
            // Partial unique index on live periods: a second OPEN/LOCKED
            // period for the target hits the constraint.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ForecastError::AlreadyOpen)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Background tick: close the betting window of every OPEN period whose
    /// end has passed. Idempotent; returns how many periods were locked.
    pub async fn lock_due_periods(&self, now: DateTime<Utc>) -> ForecastResult<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE forecast_periods SET state = 'LOCKED'
             WHERE state = 'OPEN' AND ends_at <= ?1",
            [now.to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Compare-and-swap LOCKED -> RESOLVING. Exactly one caller wins; all
    /// others get `AlreadyClaimed`. This is the sole guard against two
    /// settlement workers processing the same period.
    pub async fn claim_for_resolution(&self, period_id: &str) -> ForecastResult<Period> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE forecast_periods SET state = 'RESOLVING'
             WHERE id = ?1 AND state = 'LOCKED'",
            [period_id],
        )?;
        if changed == 0 {
            return match Self::get_in(&conn, period_id)? {
                Some(_) => Err(ForecastError::AlreadyClaimed),
                None => Err(ForecastError::PeriodNotFound),
            };
        }
        Self::get_in(&conn, period_id)?.ok_or(ForecastError::PeriodNotFound)
    }

    /// Terminate a RESOLVING period. Guarded by "no bet is still PENDING",
    /// recomputed here on every attempt so a crashed run can safely retry.
    pub async fn mark_resolved(
        &self,
        period_id: &str,
        ending_mrr_cents: Option<i64>,
        now: DateTime<Utc>,
    ) -> ForecastResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE forecast_periods SET state = 'RESOLVED', ending_mrr_cents = ?2, resolved_at = ?3
             WHERE id = ?1 AND state = 'RESOLVING'
               AND NOT EXISTS (SELECT 1 FROM bets WHERE period_id = ?1 AND status = 'PENDING')",
            params![period_id, ending_mrr_cents, now.to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    pub async fn get(&self, period_id: &str) -> ForecastResult<Period> {
        let conn = self.conn.lock().await;
        Self::get_in(&conn, period_id)?.ok_or(ForecastError::PeriodNotFound)
    }

    /// The target's live period (OPEN or LOCKED), if any.
    pub async fn live_period(&self, target_id: &str) -> ForecastResult<Option<Period>> {
        let conn = self.conn.lock().await;
        Self::live_period_in(&conn, target_id)
    }

    pub(crate) fn live_period_in(conn: &Connection, target_id: &str) -> ForecastResult<Option<Period>> {
        let period = conn
            .query_row(
                &format!("{SELECT_PERIOD} WHERE target_id = ?1 AND state IN ('OPEN','LOCKED')"),
                [target_id],
                Self::map_row,
            )
            .optional()?;
        Ok(period)
    }

    /// Periods awaiting settlement work: LOCKED ones to claim, plus RESOLVING
    /// leftovers from a crashed run.
    pub async fn settlement_backlog(&self) -> ForecastResult<Vec<Period>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_PERIOD} WHERE state IN ('LOCKED','RESOLVING') ORDER BY ends_at ASC"
        ))?;
        let periods = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(periods)
    }

    /// Past periods for a target, newest first.
    pub async fn history(&self, target_id: &str, limit: u32) -> ForecastResult<Vec<Period>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_PERIOD} WHERE target_id = ?1 ORDER BY starts_at DESC LIMIT ?2"
        ))?;
        let periods = stmt
            .query_map(params![target_id, limit], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(periods)
    }

    pub(crate) fn get_in(conn: &Connection, period_id: &str) -> ForecastResult<Option<Period>> {
        let period = conn
            .query_row(
                &format!("{SELECT_PERIOD} WHERE id = ?1"),
                [period_id],
                Self::map_row,
            )
            .optional()?;
        Ok(period)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Period> {
        let state: String = row.get(3)?;
        let resolved_at: Option<String> = row.get(8)?;
        Ok(Period {
            id: row.get(0)?,
            target_id: row.get(1)?,
            label: row.get(2)?,
            state: PeriodState::from_str(&state).unwrap_or(PeriodState::Resolved),
            starts_at: parse_utc(&row.get::<_, String>(4)?),
            ends_at: parse_utc(&row.get::<_, String>(5)?),
            baseline_mrr_cents: row.get(6)?,
            ending_mrr_cents: row.get(7)?,
            resolved_at: resolved_at.map(|s| parse_utc(&s)),
        })
    }

    fn init_schema(conn: &Connection) -> ForecastResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS forecast_periods (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                label TEXT NOT NULL,
                state TEXT NOT NULL,
                starts_at TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                baseline_mrr_cents INTEGER NOT NULL,
                ending_mrr_cents INTEGER,
                resolved_at TEXT
            )",
            [],
        )?;
        // At most one live period per target, enforced at the storage layer
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_periods_live
             ON forecast_periods(target_id) WHERE state IN ('OPEN','LOCKED')",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_periods_state ON forecast_periods(state, ends_at)",
            [],
        )?;
        Ok(())
    }
}

const SELECT_PERIOD: &str = "SELECT id, target_id, label, state, starts_at, ends_at,
        baseline_mrr_cents, ending_mrr_cents, resolved_at
 FROM forecast_periods";
