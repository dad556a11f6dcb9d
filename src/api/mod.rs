//! HTTP surface for the forecasting core.

pub mod routes;

pub use routes::{create_router, AppState};
