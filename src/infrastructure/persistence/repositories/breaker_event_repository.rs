use crate::domain::breaker::{BreakerState, BreakerStatus, BreakerType};
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

pub struct BreakerEventRepository {
    pool: SqlitePool,
}

impl BreakerEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, user_id: Uuid, state: &BreakerState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breaker_events
                (user_id, account_id, strategy_id, breaker_type, breaker_scope,
                 trigger_value, threshold_value, triggered_at, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id.to_string())
        .bind(&state.account_id)
        .bind(&state.strategy_id)
        .bind(state.breaker_type.to_string())
        .bind(state.scope.to_string())
        .bind(state.trigger_value)
        .bind(state.threshold_value)
        .bind(state.triggered_at)
        .bind(state.status.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to insert circuit breaker event")?;
        Ok(())
    }

    /// Close out the most recent active event of this breaker type.
    pub async fn resolve_latest(
        &self,
        user_id: Uuid,
        breaker_type: BreakerType,
        status: BreakerStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE circuit_breaker_events
            SET status = ?, resolved_at = datetime('now')
            WHERE id = (
                SELECT id FROM circuit_breaker_events
                WHERE user_id = ? AND breaker_type = ? AND status = 'active'
                ORDER BY triggered_at DESC
                LIMIT 1
            )
            "#,
        )
        .bind(status.to_string())
        .bind(user_id.to_string())
        .bind(breaker_type.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to resolve circuit breaker event")?;
        Ok(())
    }
}
