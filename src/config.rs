//! Process configuration from environment variables.

use crate::application::engine::EngineConfig;
use crate::domain::matching::DEFAULT_FEE_RATE;
use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Authoritative store, e.g. `sqlite://data/futrade.db`.
    pub database_url: String,
    /// Optional cache mirror, e.g. `redis://127.0.0.1:6379`.
    pub redis_url: Option<String>,
    pub redis_enabled: bool,

    // Exchange accounts. Env credentials only seed the store on first
    // boot; the accounts table is authoritative afterwards.
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_testnet: bool,
    /// Secret the credential-encryption key is derived from.
    pub credentials_secret: String,

    // Engine
    pub max_concurrent_strategies: usize,
    pub fee_rate: f64,
    pub partial_fill_threshold: f64,
    pub trade_history_limit: usize,
    pub dead_task_cleanup_interval_seconds: u64,
    pub breaker_watch_interval_seconds: u64,
    pub db_health_check_interval_seconds: u64,

    // Notifications
    pub pnl_profit_notify_threshold: f64,
    pub pnl_loss_notify_threshold: f64,

    // Risk windows
    pub risk_timezone: String,

    // Tenant this process runs for.
    pub user_id: uuid::Uuid,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let redis_enabled = Self::parse_bool("REDIS_ENABLED", false);
        let redis_url = env::var("REDIS_URL").ok();

        let user_id = match env::var("ENGINE_USER_ID") {
            Ok(raw) => raw.parse().context("Failed to parse ENGINE_USER_ID")?,
            // Single-tenant deployments get a stable nil-derived id.
            Err(_) => uuid::Uuid::nil(),
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/futrade.db".to_string()),
            redis_url,
            redis_enabled,
            binance_api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
            binance_api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
            binance_testnet: Self::parse_bool("BINANCE_TESTNET", true),
            credentials_secret: env::var("CREDENTIALS_SECRET").unwrap_or_default(),
            max_concurrent_strategies: Self::parse_usize("MAX_CONCURRENT_STRATEGIES", 10)?,
            fee_rate: Self::parse_f64("FEE_RATE", DEFAULT_FEE_RATE)?,
            partial_fill_threshold: Self::parse_f64("PARTIAL_FILL_THRESHOLD", 0.95)?,
            trade_history_limit: Self::parse_usize("TRADE_HISTORY_LIMIT", 1000)?,
            dead_task_cleanup_interval_seconds: Self::parse_u64(
                "DEAD_TASK_CLEANUP_INTERVAL_SECONDS",
                300,
            )?,
            breaker_watch_interval_seconds: Self::parse_u64(
                "BREAKER_WATCH_INTERVAL_SECONDS",
                60,
            )?,
            db_health_check_interval_seconds: Self::parse_u64(
                "DB_HEALTH_CHECK_INTERVAL_SECONDS",
                60,
            )?,
            pnl_profit_notify_threshold: Self::parse_f64("PNL_PROFIT_NOTIFY_THRESHOLD", 50.0)?,
            pnl_loss_notify_threshold: Self::parse_f64("PNL_LOSS_NOTIFY_THRESHOLD", 50.0)?,
            risk_timezone: env::var("RISK_TIMEZONE").unwrap_or_else(|_| "UTC".to_string()),
            user_id,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_concurrent: self.max_concurrent_strategies,
            fee_rate: self.fee_rate,
            partial_fill_threshold: self.partial_fill_threshold,
            trade_history_limit: self.trade_history_limit,
            pnl_profit_threshold: self.pnl_profit_notify_threshold,
            pnl_loss_threshold: self.pnl_loss_notify_threshold,
        }
    }

    fn parse_usize(key: &str, default: usize) -> Result<usize> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<usize>()
            .context(format!("Failed to parse {}", key))
    }

    fn parse_f64(key: &str, default: f64) -> Result<f64> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<f64>()
            .context(format!("Failed to parse {}", key))
    }

    fn parse_u64(key: &str, default: u64) -> Result<u64> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<u64>()
            .context(format!("Failed to parse {}", key))
    }

    fn parse_bool(key: &str, default: bool) -> bool {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<bool>()
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_environment() {
        let config = Config::from_env().expect("defaults should parse");
        assert_eq!(config.max_concurrent_strategies, 10);
        assert_eq!(config.partial_fill_threshold, 0.95);
        assert_eq!(config.fee_rate, DEFAULT_FEE_RATE);
        assert!(config.binance_testnet);
    }
}
