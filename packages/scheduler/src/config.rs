use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Retry policy defaults applied to new executions.
    pub max_attempts: i32,
    pub backoff_strategy: String,
    pub backoff_base_seconds: i64,
    /// Optional override for the read-only capability allowlist (comma-separated).
    pub capability_allowlist: Option<Vec<String>>,
    /// Queue name the reference timer adapter tags callbacks with.
    pub beat_queue_name: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_attempts: env::var("SCHEDULER_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("SCHEDULER_MAX_ATTEMPTS must be a valid number")?,
            backoff_strategy: env::var("SCHEDULER_BACKOFF_STRATEGY")
                .unwrap_or_else(|_| "fixed".to_string()),
            backoff_base_seconds: env::var("SCHEDULER_BACKOFF_BASE_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("SCHEDULER_BACKOFF_BASE_SECONDS must be a valid number")?,
            capability_allowlist: env::var("SCHEDULER_CAPABILITY_ALLOWLIST")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .map(|item| item.trim().to_string())
                        .filter(|item| !item.is_empty())
                        .collect()
                }),
            beat_queue_name: env::var("SCHEDULER_BEAT_QUEUE").ok(),
        })
    }
}
