//! MRR Forecasting Market Backend
//!
//! Serves the forecasting API and runs the settlement worker: a recurring
//! batch job that locks ended periods, resolves their bets against verified
//! revenue data, and pays out through the coin ledger.

use anyhow::{Context, Result};
use chrono::Utc;
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, time::interval};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mrr_forecast_backend::{
    api::{create_router, AppState},
    coins::CoinLedger,
    config::Config,
    db,
    forecast::{
        bets::BetLedger, periods::PeriodManager, settings::SettingsRegistry,
        settlement::SettlementEngine,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        db = %config.db_path,
        tick_secs = config.tick_secs,
        fee_pct = config.policy.house_fee_pct,
        "🚀 Starting MRR forecasting backend"
    );

    let conn = db::open_shared(&config.db_path).context("Failed to open database")?;
    let coins = Arc::new(CoinLedger::new(conn.clone())?);
    let settings = Arc::new(SettingsRegistry::new(conn.clone())?);
    let periods = Arc::new(PeriodManager::new(conn.clone())?);
    let bets = Arc::new(BetLedger::with_policy(conn.clone(), config.policy)?);

    // Settlement worker: single active worker per deployment; the period
    // claim CAS is the coordination point if more exist
    let engine = SettlementEngine::new(conn.clone(), periods.clone(), config.policy);
    let tick_secs = config.tick_secs;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(tick_secs));
        loop {
            ticker.tick().await;
            match engine.run_once(Utc::now()).await {
                Ok(report) => {
                    if report.periods_resolved + report.periods_voided > 0 {
                        info!(
                            resolved = report.periods_resolved,
                            voided = report.periods_voided,
                            won = report.bets_won,
                            lost = report.bets_lost,
                            "💰 Settlement pass complete"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Settlement pass failed"),
            }
        }
    });

    let state = AppState {
        coins,
        settings,
        periods,
        bets,
        signup_grant_coins: config.signup_grant_coins,
    };
    let app = create_router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "🌐 API listening");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
