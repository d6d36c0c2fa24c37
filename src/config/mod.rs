//! Configuration module for the estimation room client.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::VotingSystem;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hosted backend base URL; local SQLite mode when unset
    pub backend_url: Option<String>,
    /// Anonymous API key for the hosted backend
    pub api_key: Option<String>,
    /// Path to the SQLite database file used in local mode
    pub db_path: PathBuf,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Realtime heartbeat period
    pub heartbeat_interval: Duration,
    /// Label set for newly created rooms
    pub voting_system: VotingSystem,
    /// Drop roster entries when their presence leaves
    pub prune_on_presence_leave: bool,
    /// Base URL put in front of shareable room links
    pub share_base_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let backend_url = env::var("POKER_BACKEND_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let api_key = env::var("POKER_API_KEY").ok();

        let db_path = env::var("POKER_DB_PATH")
            .unwrap_or_else(|_| "./data/poker.sqlite".to_string())
            .into();

        let log_level = env::var("POKER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let heartbeat_secs = env::var("POKER_HEARTBEAT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(25);

        let voting_system = env::var("POKER_VOTING_SYSTEM")
            .ok()
            .and_then(|v| VotingSystem::parse(&v.to_lowercase()))
            .unwrap_or_default();

        let prune_on_presence_leave = env::var("POKER_PRUNE_ON_PRESENCE_LEAVE")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let share_base_url = env::var("POKER_SHARE_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:5173".to_string());

        Self {
            backend_url,
            api_key,
            db_path,
            log_level,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            voting_system,
            prune_on_presence_leave,
            share_base_url,
        }
    }
}
