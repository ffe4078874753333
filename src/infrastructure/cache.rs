//! Redis mirror of the in-memory strategy state.
//!
//! Strictly a warm-start accelerator: written only after the authoritative
//! store succeeded, read only to pre-fill memory before the store load
//! completes. All writes are best-effort; a failed mirror write is logged
//! and dropped.

use crate::domain::strategy::StrategySummary;
use crate::domain::types::OrderFill;
use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

fn strategy_key(strategy_id: &str) -> String {
    format!("strategy:{}", strategy_id)
}

fn trades_key(strategy_id: &str) -> String {
    format!("trades:{}", strategy_id)
}

pub struct CacheMirror {
    conn: MultiplexedConnection,
    /// Trailing number of raw trades mirrored per strategy.
    trailing_trades: usize,
}

impl CacheMirror {
    pub async fn connect(redis_url: &str, trailing_trades: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid redis URL")?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .context("Failed to connect to redis")?;
        info!("Connected to cache: {}", redis_url);
        Ok(Self {
            conn,
            trailing_trades,
        })
    }

    pub async fn save_strategy(&self, summary: &StrategySummary) {
        let payload = match serde_json::to_string(summary) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize strategy {} for cache: {}", summary.id, e);
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set::<_, _, ()>(strategy_key(&summary.id), payload)
            .await
        {
            warn!("Failed to mirror strategy {} to cache: {}", summary.id, e);
        }
    }

    pub async fn delete_strategy(&self, strategy_id: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .del::<_, ()>(&[strategy_key(strategy_id), trades_key(strategy_id)])
            .await
        {
            warn!("Failed to drop strategy {} from cache: {}", strategy_id, e);
        }
    }

    pub async fn load_strategies(&self) -> Vec<StrategySummary> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = match conn.keys("strategy:*").await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list cached strategies: {}", e);
                return Vec::new();
            }
        };

        let mut summaries = Vec::new();
        for key in keys {
            let payload: Option<String> = match conn.get(&key).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to read {} from cache: {}", key, e);
                    continue;
                }
            };
            if let Some(payload) = payload {
                match serde_json::from_str::<StrategySummary>(&payload) {
                    Ok(summary) => summaries.push(summary),
                    Err(e) => warn!("Unparseable cached strategy at {}: {}", key, e),
                }
            }
        }
        summaries
    }

    /// Mirror the trailing window of raw trades for one strategy.
    pub async fn save_trades(&self, strategy_id: &str, trades: &[OrderFill]) {
        let start = trades.len().saturating_sub(self.trailing_trades);
        let payload = match serde_json::to_string(&trades[start..]) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize trades for {}: {}", strategy_id, e);
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.set::<_, _, ()>(trades_key(strategy_id), payload).await {
            warn!("Failed to mirror trades for {} to cache: {}", strategy_id, e);
        }
    }

    pub async fn load_trades(&self, strategy_id: &str) -> Vec<OrderFill> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = match conn.get(trades_key(strategy_id)).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to read trades for {} from cache: {}", strategy_id, e);
                return Vec::new();
            }
        };
        payload
            .and_then(|p| match serde_json::from_str(&p) {
                Ok(trades) => Some(trades),
                Err(e) => {
                    warn!("Unparseable cached trades for {}: {}", strategy_id, e);
                    None
                }
            })
            .unwrap_or_default()
    }
}
