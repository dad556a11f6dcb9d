//! Coin balances and the atomic debit/credit ledger.

pub mod ledger;

pub use ledger::CoinLedger;
