use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Append-only audit trail of engine-level events (restarts, restores,
/// degraded-mode transitions).
pub struct SystemEventRepository {
    pool: SqlitePool,
}

impl SystemEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        user_id: Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("INSERT INTO system_events (user_id, event_type, payload) VALUES (?, ?, ?)")
            .bind(user_id.to_string())
            .bind(event_type)
            .bind(payload.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to record system event")?;
        Ok(())
    }
}
