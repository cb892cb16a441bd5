use tokio_util::sync::CancellationToken;

mod admin;
mod app;
mod auth;
mod config;
mod error;
mod ledger;
mod notify;
mod reconcile;
mod state;
mod store;
#[cfg(test)]
mod testing;

use crate::{
    notify::{sweep, tasks},
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "paydue=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let (app_state, task_rx) = AppState::init().await?;

    let cancel = CancellationToken::new();
    let worker = tasks::start(app_state.clone(), task_rx, cancel.clone());
    let sweeper = sweep::start(app_state.clone(), cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        shutdown.cancel();
    });

    let result = app::serve(app::build_app(app_state), cancel.clone()).await;

    cancel.cancel();
    let _ = tokio::join!(worker, sweeper);
    result
}
