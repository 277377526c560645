//! AU State Keeper - Main Entry Point

use au_state_keeper::services::rest_store::RestClientConfig;
use au_state_keeper::services::state_manager::StateManager;
use au_state_keeper::{db, telemetry, Config, Result, StateError};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    telemetry::init_tracing(&config.log_level);
    tracing::info!("Starting AU State Keeper");

    let manager = match config.state_backend.as_str() {
        "postgres" => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| StateError::Config("DATABASE_URL not set".into()))?;
            let pool = db::create_pool(database_url).await?;
            tracing::info!("Connected to database");
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("Database migrations complete");
            StateManager::postgres(pool, config.bus_capacity)
        }
        "rest" => {
            let base_url = config
                .rest_base_url
                .clone()
                .ok_or_else(|| StateError::Config("STATE_SERVICE_URL not set".into()))?;
            StateManager::rest(
                RestClientConfig {
                    base_url,
                    auth_token: config.rest_auth_token.clone(),
                    timeout_secs: config.rest_timeout_secs,
                },
                config.bus_capacity,
            )?
        }
        _ => StateManager::in_memory(config.bus_capacity),
    };

    let router = manager.spawn_router();
    tracing::info!(backend = %config.state_backend, "State manager ready");

    // Run until interrupted; collaborators call in through the library API.
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    router.abort();

    Ok(())
}
