// Main entry point for the scheduler core service

use anyhow::{Context, Result};
use scheduler_core::domains::scheduling::adapter::TimerAdapter;
use scheduler_core::domains::scheduling::adapters::beat::{BeatTimerAdapter, PgBeatStore};
use scheduler_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scheduler_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Brain scheduler core");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Probe the reference timer adapter
    let adapter = BeatTimerAdapter::new(
        PgBeatStore::new(pool.clone()),
        config.beat_queue_name.clone(),
    );
    let health = adapter.health().await;
    tracing::info!(?health, "timer adapter probed");

    // The agent runtime and subject resolver are external collaborators;
    // the embedding deployment wires them into SchedulerDeps and starts the
    // callback worker. This binary owns storage, migrations, and the timer
    // adapter surface.
    tracing::info!("Scheduler core ready; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    Ok(())
}
