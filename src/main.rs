use dotenvy::dotenv;
use log::{info, warn};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use queueserver::queue;
use queueserver::queue::audit::LogAuditSink;
use queueserver::shared::config::AppConfig;
use queueserver::shared::state::AppState;
use queueserver::shared::utils::{create_conn, run_migrations, seed_default_service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env()?;
    let pool = create_conn(&config.database)?;

    if let Err(e) = run_migrations(&pool) {
        return Err(anyhow::anyhow!("Failed to run migrations: {e}"));
    }
    if let Err(e) = seed_default_service(&pool) {
        warn!("Could not seed default service: {}", e);
    }

    let app_state = Arc::new(AppState {
        config: Some(config.clone()),
        conn: pool,
        audit: Arc::new(LogAuditSink),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = queue::configure_queue_routes()
        .layer(cors)
        .with_state(app_state);

    info!(
        "Starting HTTP server on {}:{}",
        config.server.host, config.server.port
    );
    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
