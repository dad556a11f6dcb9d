//! MRR Forecasting Market Core
//!
//! Staking ledger, period lifecycle, and settlement engine for the
//! fixed-payout MRR wager: users stake coins on whether a target's Monthly
//! Recurring Revenue moves past a chosen threshold over a calendar quarter.

pub mod bets;
pub mod error;
pub mod periods;
pub mod settings;
pub mod settlement;

pub use error::{ForecastError, ForecastResult};

/// Numeric policy for stakes and payouts. The fee is retained by the house on
/// WON/LOST resolutions and refunded on VOID.
#[derive(Debug, Clone, Copy)]
pub struct PayoutPolicy {
    /// House fee as a percentage of the stake, integer floor.
    pub house_fee_pct: i64,
    /// Multiplier applied to the net stake on a win.
    pub payout_multiplier: i64,
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self {
            house_fee_pct: 10,
            payout_multiplier: 2,
        }
    }
}

impl PayoutPolicy {
    pub fn house_fee(&self, stake_coins: i64) -> i64 {
        stake_coins * self.house_fee_pct / 100
    }
}
