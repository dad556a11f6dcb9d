//! Bet Ledger
//!
//! Records each wager and escrows its stake: placement debits the full stake
//! from the bettor's coin balance in the same transaction as the PENDING
//! insert, so both commit or neither does. A partial unique index enforces
//! "one pending bet per (bettor, target, period)" at the storage layer.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coins::CoinLedger;
use crate::db::SharedConn;
use crate::forecast::error::{ForecastError, ForecastResult};
use crate::forecast::periods::{PeriodManager, PeriodState};
use crate::forecast::settings::{parse_utc, SettingsRegistry, TargetKind};
use crate::forecast::PayoutPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// MRR rises past the threshold.
    Long,
    /// MRR falls past the threshold.
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Pending,
    Won,
    Lost,
    Cancelled,
    Void,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Won => "WON",
            Self::Lost => "LOST",
            Self::Cancelled => "CANCELLED",
            Self::Void => "VOID",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "WON" => Some(Self::Won),
            "LOST" => Some(Self::Lost),
            "CANCELLED" => Some(Self::Cancelled),
            "VOID" => Some(Self::Void),
            _ => None,
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A single wager. `net_stake + house_fee = stake` always holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub bettor_id: String,
    pub target_id: String,
    pub target_kind: TargetKind,
    pub period_id: String,
    pub direction: Direction,
    /// Bettor-chosen threshold in percent, signed (e.g. 10.0 or -5.0).
    pub target_pct: f64,
    pub stake_coins: i64,
    pub house_fee_coins: i64,
    pub net_stake_coins: i64,
    pub status: BetStatus,
    pub actual_pct: Option<f64>,
    pub winnings_coins: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Aggregate wagering stats for one bettor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BettorStats {
    pub total_bets: i64,
    pub won: i64,
    pub lost: i64,
    pub win_rate: f64,
    pub total_staked_coins: i64,
    pub total_winnings_coins: i64,
}

pub struct BetLedger {
    conn: SharedConn,
    policy: PayoutPolicy,
}

impl BetLedger {
    pub fn new(conn: SharedConn) -> ForecastResult<Self> {
        Self::with_policy(conn, PayoutPolicy::default())
    }

    pub fn with_policy(conn: SharedConn, policy: PayoutPolicy) -> ForecastResult<Self> {
        {
            let guard = conn
                .try_lock()
                .expect("bet ledger constructed while connection is in use");
            Self::init_schema(&guard)?;
        }
        Ok(Self { conn, policy })
    }

    /// Place a wager against the target's OPEN period, escrowing the stake.
    ///
    /// A matching `idempotency_key` returns the already-placed bet with no
    /// new effect, so clients can retry on network failure without risking a
    /// double debit.
    pub async fn place_bet(
        &self,
        bettor_id: &str,
        target_id: &str,
        direction: Direction,
        target_pct: f64,
        stake_coins: i64,
        idempotency_key: Option<&str>,
    ) -> ForecastResult<Bet> {
        if !target_pct.is_finite() {
            return Err(ForecastError::InvalidInput(
                "target percentage must be a finite number".into(),
            ));
        }

        let mut conn = self.conn.lock().await;

        if let Some(key) = idempotency_key {
            // Keys are scoped to the caller: a replay returns only the
            // caller's own bet, never another bettor's
            if let Some(existing) = Self::by_idempotency_key(&conn, bettor_id, key)? {
                return Ok(existing);
            }
        }

        let settings =
            SettingsRegistry::get_in(&conn, target_id)?.ok_or(ForecastError::NotConfigured)?;
        if !settings.accepts_bets() {
            return Err(ForecastError::ForecastingUnavailable);
        }
        if stake_coins < settings.min_stake || stake_coins > settings.max_stake {
            return Err(ForecastError::StakeOutOfRange {
                min: settings.min_stake,
                max: settings.max_stake,
            });
        }

        let period = PeriodManager::live_period_in(&conn, target_id)?
            .filter(|p| p.state == PeriodState::Open)
            .ok_or(ForecastError::NoOpenPeriod)?;

        let house_fee = self.policy.house_fee(stake_coins);
        let bet = Bet {
            id: Uuid::new_v4().to_string(),
            bettor_id: bettor_id.to_string(),
            target_id: target_id.to_string(),
            target_kind: settings.target_kind,
            period_id: period.id.clone(),
            direction,
            target_pct,
            stake_coins,
            house_fee_coins: house_fee,
            net_stake_coins: stake_coins - house_fee,
            status: BetStatus::Pending,
            actual_pct: None,
            winnings_coins: None,
            created_at: Utc::now(),
            resolved_at: None,
        };

        // Escrow debit + PENDING insert commit together or not at all
        let tx = conn.transaction()?;
        CoinLedger::debit_in(&tx, bettor_id, stake_coins)?;
        let inserted = tx.execute(
            "INSERT INTO bets
                (id, bettor_id, target_id, target_kind, period_id, direction, target_pct,
                 stake_coins, house_fee_coins, net_stake_coins, status, idempotency_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'PENDING', ?11, ?12)",
            params![
                bet.id,
                bet.bettor_id,
                bet.target_id,
                bet.target_kind.as_str(),
                bet.period_id,
                bet.direction.as_str(),
                bet.target_pct,
                bet.stake_coins,
                bet.house_fee_coins,
                bet.net_stake_coins,
                idempotency_key,
                bet.created_at.to_rfc3339(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                // Pending-bet uniqueness; the tx drop rolls the debit back
                return Err(ForecastError::DuplicateBet);
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        Ok(bet)
    }

    /// Cancel a still-pending bet while its period is OPEN, refunding the
    /// full stake (fee included).
    pub async fn cancel_bet(&self, bet_id: &str, requester_id: &str) -> ForecastResult<Bet> {
        let mut conn = self.conn.lock().await;

        let bet = Self::get_in(&conn, bet_id)?.ok_or(ForecastError::BetNotFound)?;
        if bet.bettor_id != requester_id {
            return Err(ForecastError::NotBettor);
        }
        if bet.status.is_terminal() {
            return Err(ForecastError::PeriodLocked);
        }
        let period = PeriodManager::get_in(&conn, &bet.period_id)?
            .ok_or(ForecastError::PeriodNotFound)?;
        if period.state != PeriodState::Open {
            return Err(ForecastError::PeriodLocked);
        }

        let now = Utc::now();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE bets SET status = 'CANCELLED', resolved_at = ?2
             WHERE id = ?1 AND status = 'PENDING'",
            params![bet_id, now.to_rfc3339()],
        )?;
        if changed == 0 {
            // Lost the race to settlement or another cancel
            return Err(ForecastError::PeriodLocked);
        }
        CoinLedger::credit_in(&tx, requester_id, bet.stake_coins)?;
        tx.commit()?;

        Ok(Bet {
            status: BetStatus::Cancelled,
            resolved_at: Some(now),
            ..bet
        })
    }

    pub async fn get(&self, bet_id: &str) -> ForecastResult<Bet> {
        let conn = self.conn.lock().await;
        Self::get_in(&conn, bet_id)?.ok_or(ForecastError::BetNotFound)
    }

    /// A bettor's history, newest first, optionally filtered by status.
    pub async fn history(
        &self,
        bettor_id: &str,
        status: Option<BetStatus>,
        limit: u32,
        offset: u32,
    ) -> ForecastResult<Vec<Bet>> {
        let conn = self.conn.lock().await;
        let limit = limit.min(500);

        let bets = if let Some(status) = status {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_BET} WHERE bettor_id = ?1 AND status = ?2
                 ORDER BY created_at DESC LIMIT ?3 OFFSET ?4"
            ))?;
            let bets = stmt
                .query_map(
                    params![bettor_id, status.as_str(), limit, offset],
                    Self::map_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            bets
        } else {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_BET} WHERE bettor_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let bets = stmt
                .query_map(params![bettor_id, limit, offset], Self::map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            bets
        };
        Ok(bets)
    }

    /// Aggregate stats. Cancelled bets never counted; win rate is over
    /// resolved WON/LOST bets only.
    pub async fn stats(&self, bettor_id: &str) -> ForecastResult<BettorStats> {
        let conn = self.conn.lock().await;
        let (total, won, lost, staked, winnings): (i64, i64, i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'WON'), 0),
                    COALESCE(SUM(status = 'LOST'), 0),
                    COALESCE(SUM(stake_coins), 0),
                    COALESCE(SUM(CASE WHEN status = 'WON' THEN winnings_coins END), 0)
             FROM bets WHERE bettor_id = ?1 AND status != 'CANCELLED'",
            [bettor_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;
        let resolved = won + lost;
        Ok(BettorStats {
            total_bets: total,
            won,
            lost,
            win_rate: if resolved > 0 {
                won as f64 / resolved as f64
            } else {
                0.0
            },
            total_staked_coins: staked,
            total_winnings_coins: winnings,
        })
    }

    /// Still-pending bets for a period, used by the settlement engine. Bets
    /// that already carry a terminal status are excluded so re-running a
    /// crashed settlement touches only the remainder.
    pub(crate) fn pending_for_period_in(
        conn: &Connection,
        period_id: &str,
    ) -> ForecastResult<Vec<Bet>> {
        let mut stmt = conn.prepare(&format!(
            "{SELECT_BET} WHERE period_id = ?1 AND status = 'PENDING' ORDER BY created_at ASC"
        ))?;
        let bets = stmt
            .query_map([period_id], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bets)
    }

    /// Move a PENDING bet to a terminal status. Returns false when the bet
    /// was already terminal (resolution is per-bet idempotent).
    pub(crate) fn mark_terminal_in(
        conn: &Connection,
        bet_id: &str,
        status: BetStatus,
        actual_pct: Option<f64>,
        winnings_coins: Option<i64>,
        now: DateTime<Utc>,
    ) -> ForecastResult<bool> {
        let changed = conn.execute(
            "UPDATE bets SET status = ?2, actual_pct = ?3, winnings_coins = ?4, resolved_at = ?5
             WHERE id = ?1 AND status = 'PENDING'",
            params![
                bet_id,
                status.as_str(),
                actual_pct,
                winnings_coins,
                now.to_rfc3339()
            ],
        )?;
        Ok(changed == 1)
    }

    fn by_idempotency_key(
        conn: &Connection,
        bettor_id: &str,
        key: &str,
    ) -> ForecastResult<Option<Bet>> {
        let bet = conn
            .query_row(
                &format!("{SELECT_BET} WHERE idempotency_key = ?1 AND bettor_id = ?2"),
                params![key, bettor_id],
                Self::map_row,
            )
            .optional()?;
        Ok(bet)
    }

    pub(crate) fn get_in(conn: &Connection, bet_id: &str) -> ForecastResult<Option<Bet>> {
        let bet = conn
            .query_row(&format!("{SELECT_BET} WHERE id = ?1"), [bet_id], Self::map_row)
            .optional()?;
        Ok(bet)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bet> {
        let kind: String = row.get(3)?;
        let direction: String = row.get(5)?;
        let status: String = row.get(10)?;
        let resolved_at: Option<String> = row.get(14)?;
        Ok(Bet {
            id: row.get(0)?,
            bettor_id: row.get(1)?,
            target_id: row.get(2)?,
            target_kind: TargetKind::from_str(&kind).unwrap_or(TargetKind::Company),
            period_id: row.get(4)?,
            direction: Direction::from_str(&direction).unwrap_or(Direction::Long),
            target_pct: row.get(6)?,
            stake_coins: row.get(7)?,
            house_fee_coins: row.get(8)?,
            net_stake_coins: row.get(9)?,
            status: BetStatus::from_str(&status).unwrap_or(BetStatus::Void),
            actual_pct: row.get(11)?,
            winnings_coins: row.get(12)?,
            created_at: parse_utc(&row.get::<_, String>(13)?),
            resolved_at: resolved_at.map(|s| parse_utc(&s)),
        })
    }

    fn init_schema(conn: &Connection) -> ForecastResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS bets (
                id TEXT PRIMARY KEY,
                bettor_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                target_kind TEXT NOT NULL,
                period_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                target_pct REAL NOT NULL,
                stake_coins INTEGER NOT NULL,
                house_fee_coins INTEGER NOT NULL,
                net_stake_coins INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                actual_pct REAL,
                winnings_coins INTEGER,
                idempotency_key TEXT UNIQUE,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )",
            [],
        )?;
        // One pending bet per (bettor, target, period), enforced by the store
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_bets_pending
             ON bets(bettor_id, target_id, period_id) WHERE status = 'PENDING'",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bets_period ON bets(period_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bets_bettor ON bets(bettor_id, created_at)",
            [],
        )?;
        Ok(())
    }
}

const SELECT_BET: &str = "SELECT id, bettor_id, target_id, target_kind, period_id, direction,
        target_pct, stake_coins, house_fee_coins, net_stake_coins, status,
        actual_pct, winnings_coins, created_at, resolved_at
 FROM bets";
