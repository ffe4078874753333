use crate::domain::strategy::StrategyParams;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Audit of strategy parameter changes (manual edits and future tuning
/// runs).
pub struct ParameterHistoryRepository {
    pool: SqlitePool,
}

impl ParameterHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        user_id: Uuid,
        strategy_id: &str,
        old_params: &StrategyParams,
        new_params: &StrategyParams,
        reason: &str,
        status: &str,
        performance_before: Option<f64>,
        performance_after: Option<f64>,
    ) -> Result<()> {
        let changed = changed_fields(old_params, new_params)?;
        sqlx::query(
            r#"
            INSERT INTO strategy_parameter_history
                (user_id, strategy_id, old_params, new_params, changed_params,
                 reason, status, performance_before, performance_after)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id.to_string())
        .bind(strategy_id)
        .bind(serde_json::to_string(old_params)?)
        .bind(serde_json::to_string(new_params)?)
        .bind(changed.to_string())
        .bind(reason)
        .bind(status)
        .bind(performance_before)
        .bind(performance_after)
        .execute(&self.pool)
        .await
        .context("Failed to record parameter change")?;
        Ok(())
    }
}

/// JSON object holding only the keys whose values differ.
fn changed_fields(old: &StrategyParams, new: &StrategyParams) -> Result<serde_json::Value> {
    let old = serde_json::to_value(old)?;
    let new_value = serde_json::to_value(new)?;

    let mut changed = serde_json::Map::new();
    if let (Some(old_map), Some(new_map)) = (old.as_object(), new_value.as_object()) {
        for (key, new_field) in new_map {
            if old_map.get(key) != Some(new_field) {
                changed.insert(key.clone(), new_field.clone());
            }
        }
    }
    Ok(serde_json::Value::Object(changed))
}
