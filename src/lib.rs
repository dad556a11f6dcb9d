//! MRR Forecasting Market Backend Library
//!
//! Exposes the forecasting core, coin ledger, and API for the binary and
//! integration tests.

pub mod api;
pub mod coins;
pub mod config;
pub mod db;
pub mod forecast;
