//! Settlement Engine
//!
//! Batch process that resolves ended forecasting periods: fetch the verified
//! ending MRR, compute the realized percentage change, judge every pending
//! bet, pay winners through the coin ledger, and roll the target over into
//! its next period.
//!
//! Resolution itself is a pure function (`resolve`) over a period, its
//! pending bets, and an optional ending MRR; the engine is the thin atomic
//! shell around it. When the revenue source is disconnected or has never
//! reported, the period is unresolvable and every pending bet resolves VOID
//! with a full refund — the bettor bears no cost when the market cannot be
//! judged.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::coins::CoinLedger;
use crate::db::SharedConn;
use crate::forecast::bets::{Bet, BetLedger, BetStatus, Direction};
use crate::forecast::error::ForecastResult;
use crate::forecast::periods::{Period, PeriodManager, PeriodState};
use crate::forecast::settings::{ConnectionStatus, SettingsRegistry};
use crate::forecast::{ForecastError, PayoutPolicy};

/// Terminal outcome for one bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetOutcome {
    Won { winnings_coins: i64 },
    Lost,
    /// Market could not be judged; full stake (fee included) comes back.
    Void { refund_coins: i64 },
}

impl BetOutcome {
    pub fn status(&self) -> BetStatus {
        match self {
            Self::Won { .. } => BetStatus::Won,
            Self::Lost => BetStatus::Lost,
            Self::Void { .. } => BetStatus::Void,
        }
    }

    /// Coins to credit back to the bettor, zero on a loss.
    pub fn credit_coins(&self) -> i64 {
        match self {
            Self::Won { winnings_coins } => *winnings_coins,
            Self::Lost => 0,
            Self::Void { refund_coins } => *refund_coins,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BetResolution {
    pub bet_id: String,
    pub bettor_id: String,
    pub outcome: BetOutcome,
}

/// Output of the pure resolution function for one period.
#[derive(Debug, Clone)]
pub struct PeriodResolution {
    pub period_id: String,
    /// None when the period was unresolvable (VOID path).
    pub ending_mrr_cents: Option<i64>,
    pub actual_pct: Option<f64>,
    pub bets: Vec<BetResolution>,
}

/// Realized MRR change in percent. None when the baseline is zero, which
/// makes the period unresolvable.
pub fn actual_change_pct(baseline_cents: i64, ending_cents: i64) -> Option<f64> {
    if baseline_cents == 0 {
        return None;
    }
    Some((ending_cents - baseline_cents) as f64 / baseline_cents as f64 * 100.0)
}

/// Does `actual` satisfy the bet's threshold? Equality wins in both
/// directions.
pub fn direction_hits(direction: Direction, actual_pct: f64, target_pct: f64) -> bool {
    match direction {
        Direction::Long => actual_pct >= target_pct,
        Direction::Short => actual_pct <= target_pct,
    }
}

/// Judge every pending bet of a period against the observed ending MRR.
/// Pure: no storage, no clock. `ending_mrr_cents = None` means the market
/// cannot be judged and everything voids.
pub fn resolve(
    period: &Period,
    bets: &[Bet],
    ending_mrr_cents: Option<i64>,
    policy: PayoutPolicy,
) -> PeriodResolution {
    let actual_pct =
        ending_mrr_cents.and_then(|ending| actual_change_pct(period.baseline_mrr_cents, ending));

    let bets = bets
        .iter()
        .map(|bet| {
            let outcome = match actual_pct {
                Some(actual) => {
                    if direction_hits(bet.direction, actual, bet.target_pct) {
                        BetOutcome::Won {
                            winnings_coins: bet.net_stake_coins * policy.payout_multiplier,
                        }
                    } else {
                        BetOutcome::Lost
                    }
                }
                None => BetOutcome::Void {
                    refund_coins: bet.stake_coins,
                },
            };
            BetResolution {
                bet_id: bet.id.clone(),
                bettor_id: bet.bettor_id.clone(),
                outcome,
            }
        })
        .collect();

    PeriodResolution {
        period_id: period.id.clone(),
        // A zero baseline voids the period; its ending stays unrecorded
        ending_mrr_cents: if actual_pct.is_some() { ending_mrr_cents } else { None },
        actual_pct,
        bets,
    }
}

/// Counters for one settlement run.
#[derive(Debug, Clone, Default)]
pub struct SettlementReport {
    pub periods_locked: usize,
    pub periods_resolved: usize,
    pub periods_voided: usize,
    pub periods_deferred: usize,
    pub bets_won: usize,
    pub bets_lost: usize,
    pub bets_voided: usize,
    pub bet_failures: usize,
}

/// The batch worker. One active worker per deployment is assumed; with more,
/// `claim_for_resolution`'s compare-and-swap is the sole coordination point.
pub struct SettlementEngine {
    conn: SharedConn,
    periods: std::sync::Arc<PeriodManager>,
    policy: PayoutPolicy,
}

impl SettlementEngine {
    pub fn new(conn: SharedConn, periods: std::sync::Arc<PeriodManager>, policy: PayoutPolicy) -> Self {
        Self { conn, periods, policy }
    }

    /// One settlement pass: lock due periods, claim and resolve each, roll
    /// targets over. Per-entity failures are logged and isolated so one
    /// corrupted record cannot block the batch.
    pub async fn run_once(&self, now: DateTime<Utc>) -> ForecastResult<SettlementReport> {
        let mut report = SettlementReport::default();

        report.periods_locked = self.periods.lock_due_periods(now).await?;
        if report.periods_locked > 0 {
            info!(locked = report.periods_locked, "🔒 Betting windows closed");
        }

        let backlog = self.periods.settlement_backlog().await?;
        for period in backlog {
            let claimed = match period.state {
                PeriodState::Locked => match self.periods.claim_for_resolution(&period.id).await {
                    Ok(p) => p,
                    Err(ForecastError::AlreadyClaimed) => continue,
                    Err(e) => {
                        error!(period = %period.id, error = %e, "Failed to claim period");
                        continue;
                    }
                },
                // RESOLVING leftover from a crashed run; adopt and retry
                PeriodState::Resolving => {
                    warn!(period = %period.id, "Re-adopting period stuck in RESOLVING");
                    period
                }
                _ => continue,
            };

            if let Err(e) = self.settle_period(&claimed, now, &mut report).await {
                error!(period = %claimed.id, error = %e, "Settlement failed; period left for retry");
                report.periods_deferred += 1;
            }
        }

        Ok(report)
    }

    async fn settle_period(
        &self,
        period: &Period,
        now: DateTime<Utc>,
        report: &mut SettlementReport,
    ) -> ForecastResult<()> {
        let (ending_mrr, pending) = {
            let conn = self.conn.lock().await;
            let settings = SettingsRegistry::get_in(&conn, &period.target_id)?;
            // Ending MRR is usable only from a live connection; a missing or
            // disconnected source makes the period unresolvable
            let ending = settings.as_ref().and_then(|s| {
                if s.connection_status == ConnectionStatus::Connected {
                    s.cached_mrr_cents
                } else {
                    None
                }
            });
            (ending, BetLedger::pending_for_period_in(&conn, &period.id)?)
        };

        let resolution = resolve(period, &pending, ending_mrr, self.policy);

        for bet in &resolution.bets {
            if let Err(e) = self.apply_bet_resolution(bet, resolution.actual_pct, now).await {
                error!(bet = %bet.bet_id, error = %e, "Failed to resolve bet; skipping");
                report.bet_failures += 1;
                continue;
            }
            match bet.outcome {
                BetOutcome::Won { .. } => report.bets_won += 1,
                BetOutcome::Lost => report.bets_lost += 1,
                BetOutcome::Void { .. } => report.bets_voided += 1,
            }
        }

        // RESOLVED only once every bet is terminal, recomputed freshly here;
        // otherwise the period stays RESOLVING for the next run
        if !self
            .periods
            .mark_resolved(&period.id, resolution.ending_mrr_cents, now)
            .await?
        {
            warn!(period = %period.id, "Bets still pending; period left in RESOLVING");
            report.periods_deferred += 1;
            return Ok(());
        }

        match resolution.actual_pct {
            Some(actual) => {
                report.periods_resolved += 1;
                info!(
                    period = %period.id,
                    target = %period.target_id,
                    actual_pct = format!("{:+.2}%", actual),
                    "🏁 Period resolved"
                );
            }
            None => {
                report.periods_voided += 1;
                info!(
                    period = %period.id,
                    target = %period.target_id,
                    "🏁 Period voided (no verified revenue data)"
                );
            }
        }

        // Roll over: the observed ending becomes the next baseline; a voided
        // period keeps the previous one
        let next_baseline = resolution
            .ending_mrr_cents
            .unwrap_or(period.baseline_mrr_cents);
        {
            let conn = self.conn.lock().await;
            match PeriodManager::open_period_in(&conn, &period.target_id, next_baseline, now) {
                Ok(next) => info!(period = %next.id, target = %period.target_id, label = %next.label, "Next period opened"),
                Err(ForecastError::AlreadyOpen) => {}
                Err(e) => {
                    error!(target = %period.target_id, error = %e, "Failed to open next period")
                }
            }
        }

        Ok(())
    }

    /// Terminal status write and payout credit in one transaction. Touches
    /// only bets still PENDING, so re-running after a crash is safe.
    async fn apply_bet_resolution(
        &self,
        bet: &BetResolution,
        actual_pct: Option<f64>,
        now: DateTime<Utc>,
    ) -> ForecastResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let transitioned = BetLedger::mark_terminal_in(
            &tx,
            &bet.bet_id,
            bet.outcome.status(),
            actual_pct,
            match bet.outcome {
                BetOutcome::Won { winnings_coins } => Some(winnings_coins),
                _ => None,
            },
            now,
        )?;
        if !transitioned {
            // Already terminal (earlier run got here); nothing to pay
            return Ok(());
        }

        let credit = bet.outcome.credit_coins();
        if credit > 0 {
            CoinLedger::credit_in(&tx, &bet.bettor_id, credit)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, SharedConn};
    use crate::forecast::settings::TargetKind;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn period_fixture(baseline: i64) -> Period {
        Period {
            id: "p1".into(),
            target_id: "acme".into(),
            label: "2026-Q3".into(),
            state: PeriodState::Resolving,
            starts_at: Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap(),
            ends_at: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap(),
            baseline_mrr_cents: baseline,
            ending_mrr_cents: None,
            resolved_at: None,
        }
    }

    fn bet_fixture(id: &str, direction: Direction, target_pct: f64, stake: i64) -> Bet {
        let policy = PayoutPolicy::default();
        let fee = policy.house_fee(stake);
        Bet {
            id: id.into(),
            bettor_id: format!("bettor-{id}"),
            target_id: "acme".into(),
            target_kind: TargetKind::Company,
            period_id: "p1".into(),
            direction,
            target_pct,
            stake_coins: stake,
            house_fee_coins: fee,
            net_stake_coins: stake - fee,
            status: BetStatus::Pending,
            actual_pct: None,
            winnings_coins: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn long_bet_wins_past_threshold() {
        // Scenario A: 1000 -> 1150 (+15%), LONG at +10, stake 100, fee 10
        let period = period_fixture(1000);
        let bets = vec![bet_fixture("a", Direction::Long, 10.0, 100)];
        let res = resolve(&period, &bets, Some(1150), PayoutPolicy::default());

        assert_eq!(res.actual_pct, Some(15.0));
        assert_eq!(res.ending_mrr_cents, Some(1150));
        assert_eq!(
            res.bets[0].outcome,
            BetOutcome::Won { winnings_coins: 180 }
        );
    }

    #[test]
    fn short_bet_loses_when_mrr_rises() {
        // Scenario B: same period, SHORT at -5 does not hold at +15%
        let period = period_fixture(1000);
        let bets = vec![bet_fixture("b", Direction::Short, -5.0, 50)];
        let res = resolve(&period, &bets, Some(1150), PayoutPolicy::default());

        assert_eq!(res.bets[0].outcome, BetOutcome::Lost);
        assert_eq!(res.bets[0].outcome.credit_coins(), 0);
    }

    #[test]
    fn equality_at_threshold_wins_both_directions() {
        let period = period_fixture(1000);
        let bets = vec![
            bet_fixture("long", Direction::Long, 10.0, 100),
            bet_fixture("short", Direction::Short, 10.0, 100),
        ];
        // Exactly +10%
        let res = resolve(&period, &bets, Some(1100), PayoutPolicy::default());
        assert!(matches!(res.bets[0].outcome, BetOutcome::Won { .. }));
        assert!(matches!(res.bets[1].outcome, BetOutcome::Won { .. }));
    }

    #[test]
    fn missing_data_voids_with_full_refund() {
        // Scenario C: no verified ending value
        let period = period_fixture(1000);
        let bets = vec![
            bet_fixture("a", Direction::Long, 10.0, 100),
            bet_fixture("b", Direction::Short, -5.0, 50),
        ];
        let res = resolve(&period, &bets, None, PayoutPolicy::default());

        assert_eq!(res.actual_pct, None);
        assert_eq!(res.ending_mrr_cents, None);
        assert_eq!(res.bets[0].outcome, BetOutcome::Void { refund_coins: 100 });
        assert_eq!(res.bets[1].outcome, BetOutcome::Void { refund_coins: 50 });
    }

    #[test]
    fn zero_baseline_is_unresolvable() {
        let period = period_fixture(0);
        let bets = vec![bet_fixture("a", Direction::Long, 10.0, 100)];
        let res = resolve(&period, &bets, Some(1150), PayoutPolicy::default());

        assert_eq!(res.actual_pct, None);
        assert_eq!(res.ending_mrr_cents, None);
        assert!(matches!(res.bets[0].outcome, BetOutcome::Void { .. }));
    }

    // ===== Engine tests against a live store =====

    struct World {
        coins: CoinLedger,
        settings: SettingsRegistry,
        periods: Arc<PeriodManager>,
        bets: BetLedger,
        engine: SettlementEngine,
    }

    async fn world(conn: &SharedConn) -> World {
        let periods = Arc::new(PeriodManager::new(conn.clone()).unwrap());
        let w = World {
            coins: CoinLedger::new(conn.clone()).unwrap(),
            settings: SettingsRegistry::new(conn.clone()).unwrap(),
            periods: periods.clone(),
            bets: BetLedger::new(conn.clone()).unwrap(),
            engine: SettlementEngine::new(conn.clone(), periods, PayoutPolicy::default()),
        };
        w.settings.enable("acme", TargetKind::Company).await.unwrap();
        w.settings
            .update_verified_mrr("acme", 1000, Utc::now())
            .await
            .unwrap();
        w.periods
            .open_period("acme", Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        w
    }

    async fn total_coins(w: &World, users: &[&str]) -> i64 {
        let mut sum = 0;
        for u in users {
            sum += w.coins.balance(u).await.unwrap();
        }
        sum
    }

    #[tokio::test]
    async fn full_settlement_pays_winner_and_forfeits_loser() {
        let conn = db::open_in_memory();
        let w = world(&conn).await;
        w.coins.credit("alice", 1000).await.unwrap();
        w.coins.credit("bob", 1000).await.unwrap();

        w.bets
            .place_bet("alice", "acme", Direction::Long, 10.0, 100, None)
            .await
            .unwrap();
        w.bets
            .place_bet("bob", "acme", Direction::Short, -5.0, 50, None)
            .await
            .unwrap();

        w.settings
            .update_verified_mrr("acme", 1150, Utc::now())
            .await
            .unwrap();

        let after_end = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 1).unwrap();
        let report = w.engine.run_once(after_end).await.unwrap();

        assert_eq!(report.periods_resolved, 1);
        assert_eq!(report.bets_won, 1);
        assert_eq!(report.bets_lost, 1);

        // Alice: 1000 - 100 stake + 180 winnings (net 90 * 2)
        assert_eq!(w.coins.balance("alice").await.unwrap(), 1080);
        // Bob forfeits his escrowed 50
        assert_eq!(w.coins.balance("bob").await.unwrap(), 950);

        // Next quarter opened with the observed ending as baseline
        let next = w.periods.live_period("acme").await.unwrap().unwrap();
        assert_eq!(next.state, PeriodState::Open);
        assert_eq!(next.baseline_mrr_cents, 1150);
    }

    #[tokio::test]
    async fn disconnected_source_voids_and_refunds() {
        let conn = db::open_in_memory();
        let w = world(&conn).await;
        w.coins.credit("alice", 1000).await.unwrap();

        w.bets
            .place_bet("alice", "acme", Direction::Long, 10.0, 100, None)
            .await
            .unwrap();
        w.settings.on_disconnect("acme").await.unwrap();

        let after_end = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 1).unwrap();
        let report = w.engine.run_once(after_end).await.unwrap();

        assert_eq!(report.periods_voided, 1);
        assert_eq!(report.bets_voided, 1);
        // Full refund, house fee included
        assert_eq!(w.coins.balance("alice").await.unwrap(), 1000);

        let bet = w.bets.history("alice", None, 10, 0).await.unwrap().remove(0);
        assert_eq!(bet.status, BetStatus::Void);

        // Void keeps the previous baseline and leaves ending unrecorded
        let resolved = w.periods.get(&bet.period_id).await.unwrap();
        assert_eq!(resolved.ending_mrr_cents, None);
        let next = w.periods.live_period("acme").await.unwrap().unwrap();
        assert_eq!(next.baseline_mrr_cents, 1000);
    }

    #[tokio::test]
    async fn settlement_is_idempotent() {
        let conn = db::open_in_memory();
        let w = world(&conn).await;
        w.coins.credit("alice", 1000).await.unwrap();
        w.bets
            .place_bet("alice", "acme", Direction::Long, 10.0, 100, None)
            .await
            .unwrap();
        w.settings
            .update_verified_mrr("acme", 1150, Utc::now())
            .await
            .unwrap();

        let after_end = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 1).unwrap();
        w.engine.run_once(after_end).await.unwrap();
        let balance_after_first = w.coins.balance("alice").await.unwrap();

        // Second pass finds nothing to do and moves no coins
        let report = w.engine.run_once(after_end).await.unwrap();
        assert_eq!(report.bets_won + report.bets_lost + report.bets_voided, 0);
        assert_eq!(w.coins.balance("alice").await.unwrap(), balance_after_first);
    }

    #[tokio::test]
    async fn crash_recovery_resolves_remaining_bets() {
        let conn = db::open_in_memory();
        let w = world(&conn).await;
        w.coins.credit("alice", 1000).await.unwrap();
        w.coins.credit("bob", 1000).await.unwrap();
        w.bets
            .place_bet("alice", "acme", Direction::Long, 10.0, 100, None)
            .await
            .unwrap();
        let bob_bet = w.bets
            .place_bet("bob", "acme", Direction::Long, 10.0, 100, None)
            .await
            .unwrap();
        w.settings
            .update_verified_mrr("acme", 1150, Utc::now())
            .await
            .unwrap();

        let after_end = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 1).unwrap();

        // Simulate a crash mid-loop: period claimed, one bet already paid
        let period = w.periods.live_period("acme").await.unwrap().unwrap();
        w.periods.lock_due_periods(after_end).await.unwrap();
        w.periods.claim_for_resolution(&period.id).await.unwrap();
        {
            let mut guard = conn.lock().await;
            let tx = guard.transaction().unwrap();
            BetLedger::mark_terminal_in(&tx, &bob_bet.id, BetStatus::Won, Some(15.0), Some(180), after_end)
                .unwrap();
            CoinLedger::credit_in(&tx, "bob", 180).unwrap();
            tx.commit().unwrap();
        }

        // Restarted engine re-adopts the RESOLVING period and finishes
        let report = w.engine.run_once(after_end).await.unwrap();
        assert_eq!(report.bets_won, 1); // only alice's remained pending
        assert_eq!(w.coins.balance("alice").await.unwrap(), 1080);
        // Bob not paid twice
        assert_eq!(w.coins.balance("bob").await.unwrap(), 1080);

        let resolved = w.periods.get(&period.id).await.unwrap();
        assert_eq!(resolved.state, PeriodState::Resolved);
    }

    #[tokio::test]
    async fn coin_conservation_across_lifecycle() {
        let conn = db::open_in_memory();
        let w = world(&conn).await;
        let users = ["alice", "bob", "carol"];
        for u in users {
            w.coins.credit(u, 1000).await.unwrap();
        }
        let initial = total_coins(&w, &users).await;
        assert_eq!(initial, 3000);

        let a = w.bets
            .place_bet("alice", "acme", Direction::Long, 10.0, 100, None)
            .await
            .unwrap();
        w.bets
            .place_bet("bob", "acme", Direction::Short, -5.0, 50, None)
            .await
            .unwrap();
        w.bets
            .place_bet("carol", "acme", Direction::Long, 50.0, 200, None)
            .await
            .unwrap();
        // While escrowed: balances + escrow == initial
        assert_eq!(total_coins(&w, &users).await + 350, initial);

        // A cancellation restores its stake exactly
        w.bets.cancel_bet(&a.id, "alice").await.unwrap();
        assert_eq!(total_coins(&w, &users).await + 250, initial);

        w.settings
            .update_verified_mrr("acme", 1150, Utc::now())
            .await
            .unwrap();
        let after_end = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 1).unwrap();
        w.engine.run_once(after_end).await.unwrap();

        // bob: SHORT -5 at +15% loses his 50; carol: LONG 50 at +15% loses 200.
        // No winners, so the house keeps all 250 escrowed coins.
        assert_eq!(total_coins(&w, &users).await, initial - 250);
    }
}
