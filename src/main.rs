use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use converse_server::config::{generate_config_template, Config};
use converse_server::routes;
use converse_server::state::AppState;
use converse_server::store::SharedRedis;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "converse_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "converse_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("Converse server v{} starting", env!("CARGO_PKG_VERSION"));

    if config.jwt_secret.is_empty() {
        return Err("jwt_secret must be set (CONVERSE_JWT_SECRET or config file)".into());
    }
    if config.allowed_origins.is_empty() {
        return Err("allowed_origins must not be empty".into());
    }

    // Connects degraded rather than failing when Redis is unreachable;
    // the health loop promotes it once Redis comes back.
    let redis = SharedRedis::connect(&config.redis_url).await?;
    redis.spawn_health_loop(Duration::from_secs(config.health_check_interval_secs));

    let config = Arc::new(config);
    let state = AppState::new(config.clone(), redis);
    tracing::info!(node_id = %state.node_id, degraded = state.redis.is_degraded(), "state initialized");

    let app = routes::build_router(state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
