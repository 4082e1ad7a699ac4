mod app;
mod auth;
mod config;
mod error;
mod state;
mod storage;
mod store;
mod uploads;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "vittcott=debug,axum=info,tower_http=info".to_string());
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

    let app_state = AppState::init().await?;
    tracing::info!(
        environment = %app_state.config.environment,
        region = %app_state.config.store.region,
        table = %app_state.config.store.users_table,
        bucket = %app_state.config.storage.bucket,
        "configuration loaded"
    );

    let listen = app_state.config.listen_addr();
    let app = app::build_app(app_state);
    app::serve(app, &listen).await
}
