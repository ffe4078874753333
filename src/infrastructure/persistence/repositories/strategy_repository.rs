use crate::domain::strategy::{StrategyStatus, StrategySummary, SummaryMeta};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

pub struct StrategyRepository {
    pool: SqlitePool,
}

impl StrategyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update the persisted form of a strategy. Position fields
    /// are runtime-only; what survives is configuration, status and meta.
    pub async fn upsert(&self, user_id: Uuid, summary: &StrategySummary) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // The composite FK needs an account row; engine-registered accounts
        // may never have been persisted (e.g. env-configured ones).
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO accounts (user_id, account_id, name)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(user_id.to_string())
        .bind(&summary.account_id)
        .bind(&summary.account_id)
        .execute(&mut *tx)
        .await
        .context("Failed to ensure account row")?;

        sqlx::query(
            r#"
            INSERT INTO strategies
                (id, user_id, account_id, name, symbol, strategy_type, leverage,
                 risk_per_trade, fixed_amount, params, status, meta, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                symbol = excluded.symbol,
                strategy_type = excluded.strategy_type,
                leverage = excluded.leverage,
                risk_per_trade = excluded.risk_per_trade,
                fixed_amount = excluded.fixed_amount,
                params = excluded.params,
                status = excluded.status,
                meta = excluded.meta
            "#,
        )
        .bind(&summary.id)
        .bind(user_id.to_string())
        .bind(&summary.account_id)
        .bind(&summary.name)
        .bind(&summary.symbol)
        .bind(summary.strategy_type.to_string())
        .bind(i64::from(summary.leverage))
        .bind(summary.risk_per_trade)
        .bind(summary.fixed_amount)
        .bind(serde_json::to_string(&summary.params)?)
        .bind(summary.status.to_string())
        .bind(serde_json::to_string(&summary.meta)?)
        .bind(summary.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert strategy")?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        user_id: Uuid,
        strategy_id: &str,
        status: StrategyStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE strategies SET status = ? WHERE id = ? AND user_id = ?",
        )
        .bind(status.to_string())
        .bind(strategy_id)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update strategy status")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Strategy {} not found for status update", strategy_id);
        }
        Ok(())
    }

    pub async fn update_meta(
        &self,
        user_id: Uuid,
        strategy_id: &str,
        meta: &SummaryMeta,
    ) -> Result<()> {
        sqlx::query("UPDATE strategies SET meta = ? WHERE id = ? AND user_id = ?")
            .bind(serde_json::to_string(meta)?)
            .bind(strategy_id)
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update strategy meta")?;
        Ok(())
    }

    pub async fn delete(&self, user_id: Uuid, strategy_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM strategies WHERE id = ? AND user_id = ?")
            .bind(strategy_id)
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete strategy")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_all(&self, user_id: Uuid) -> Result<Vec<StrategySummary>> {
        let rows = sqlx::query("SELECT * FROM strategies WHERE user_id = ? ORDER BY created_at")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to load strategies")?;

        rows.iter().map(Self::row_to_summary).collect()
    }

    pub async fn find(&self, user_id: Uuid, strategy_id: &str) -> Result<Option<StrategySummary>> {
        let row = sqlx::query("SELECT * FROM strategies WHERE id = ? AND user_id = ?")
            .bind(strategy_id)
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load strategy")?;

        row.as_ref().map(Self::row_to_summary).transpose()
    }

    fn row_to_summary(row: &sqlx::sqlite::SqliteRow) -> Result<StrategySummary> {
        let status_str: String = row.try_get("status")?;
        let type_str: String = row.try_get("strategy_type")?;
        let params_json: String = row.try_get("params")?;
        let meta_json: Option<String> = row.try_get("meta")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let leverage: i64 = row.try_get("leverage")?;

        Ok(StrategySummary {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            symbol: row.try_get("symbol")?,
            strategy_type: FromStr::from_str(&type_str)?,
            status: FromStr::from_str(&status_str)?,
            leverage: u32::try_from(leverage).context("leverage out of range")?,
            risk_per_trade: row.try_get("risk_per_trade")?,
            fixed_amount: row.try_get("fixed_amount")?,
            params: serde_json::from_str(&params_json).context("Unparseable strategy params")?,
            account_id: row.try_get("account_id")?,
            created_at,
            last_signal: None,
            entry_price: None,
            current_price: None,
            position_size: 0.0,
            unrealized_pnl: 0.0,
            position_side: None,
            meta: meta_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Unparseable strategy meta")?
                .unwrap_or_default(),
        })
    }
}
