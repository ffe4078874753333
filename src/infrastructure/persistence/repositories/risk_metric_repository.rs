use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

const PEAK_BALANCE_METRIC: &str = "peak_balance";

/// Durable scalar risk metrics per account. Currently only the peak
/// balance used for drawdown.
pub struct RiskMetricRepository {
    pool: SqlitePool,
}

impl RiskMetricRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn peak_balance(&self, user_id: Uuid, account_id: &str) -> Result<Option<f64>> {
        let row = sqlx::query(
            "SELECT value FROM risk_metrics WHERE user_id = ? AND account_id = ? AND metric = ?",
        )
        .bind(user_id.to_string())
        .bind(account_id)
        .bind(PEAK_BALANCE_METRIC)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load peak balance")?;

        row.map(|row| row.try_get::<f64, _>("value").map_err(Into::into))
            .transpose()
    }

    pub async fn set_peak_balance(&self, user_id: Uuid, account_id: &str, value: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_metrics (user_id, account_id, metric, value, updated_at)
            VALUES (?, ?, ?, ?, datetime('now'))
            ON CONFLICT(user_id, account_id, metric) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id.to_string())
        .bind(account_id)
        .bind(PEAK_BALANCE_METRIC)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to persist peak balance")?;
        Ok(())
    }
}
