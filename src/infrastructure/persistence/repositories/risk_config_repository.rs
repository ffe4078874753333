use crate::domain::risk_config::RiskConfig;
use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct RiskConfigRepository {
    pool: SqlitePool,
}

impl RiskConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store the account-scoped config (`strategy_id = None`) or a
    /// strategy-scoped override. Delete-then-insert in one transaction:
    /// SQLite treats NULLs as distinct in unique constraints, so an
    /// ON CONFLICT upsert would duplicate the account-scoped row.
    pub async fn upsert(
        &self,
        user_id: Uuid,
        account_id: &str,
        strategy_id: Option<&str>,
        config: &RiskConfig,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        match strategy_id {
            Some(strategy_id) => {
                sqlx::query(
                    "DELETE FROM strategy_risk_config WHERE user_id = ? AND account_id = ? AND strategy_id = ?",
                )
                .bind(user_id.to_string())
                .bind(account_id)
                .bind(strategy_id)
                .execute(&mut *tx)
                .await
            }
            None => {
                sqlx::query(
                    "DELETE FROM strategy_risk_config WHERE user_id = ? AND account_id = ? AND strategy_id IS NULL",
                )
                .bind(user_id.to_string())
                .bind(account_id)
                .execute(&mut *tx)
                .await
            }
        }
        .context("Failed to clear previous risk config")?;

        sqlx::query(
            r#"
            INSERT INTO strategy_risk_config (user_id, account_id, strategy_id, config, updated_at)
            VALUES (?, ?, ?, ?, datetime('now'))
            "#,
        )
        .bind(user_id.to_string())
        .bind(account_id)
        .bind(strategy_id)
        .bind(serde_json::to_string(config)?)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert risk config")?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn find(
        &self,
        user_id: Uuid,
        account_id: &str,
        strategy_id: Option<&str>,
    ) -> Result<Option<RiskConfig>> {
        let row = match strategy_id {
            Some(strategy_id) => {
                sqlx::query(
                    "SELECT config FROM strategy_risk_config WHERE user_id = ? AND account_id = ? AND strategy_id = ?",
                )
                .bind(user_id.to_string())
                .bind(account_id)
                .bind(strategy_id)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT config FROM strategy_risk_config WHERE user_id = ? AND account_id = ? AND strategy_id IS NULL",
                )
                .bind(user_id.to_string())
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .context("Failed to load risk config")?;

        row.map(|row| {
            let json: String = row.try_get("config")?;
            serde_json::from_str(&json).context("Unparseable risk config")
        })
        .transpose()
    }
}
