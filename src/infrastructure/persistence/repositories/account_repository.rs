use crate::domain::account::Account;
use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update an account. When `is_default` is set, every other
    /// account of the user loses the flag in the same transaction, keeping
    /// at most one default per user.
    pub async fn upsert(&self, user_id: Uuid, account: &Account) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if account.is_default {
            sqlx::query(
                "UPDATE accounts SET is_default = 0 WHERE user_id = ? AND account_id != ?",
            )
            .bind(user_id.to_string())
            .bind(&account.account_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear previous default account")?;
        }

        sqlx::query(
            r#"
            INSERT INTO accounts
                (user_id, account_id, name, api_key_encrypted, api_secret_encrypted,
                 exchange_platform, testnet, is_default, is_active, paper_trading,
                 paper_balance)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, account_id) DO UPDATE SET
                name = excluded.name,
                api_key_encrypted = excluded.api_key_encrypted,
                api_secret_encrypted = excluded.api_secret_encrypted,
                exchange_platform = excluded.exchange_platform,
                testnet = excluded.testnet,
                is_default = excluded.is_default,
                is_active = excluded.is_active,
                paper_trading = excluded.paper_trading,
                paper_balance = excluded.paper_balance
            "#,
        )
        .bind(user_id.to_string())
        .bind(&account.account_id)
        .bind(&account.name)
        .bind(&account.api_key_encrypted)
        .bind(&account.api_secret_encrypted)
        .bind(&account.exchange_platform)
        .bind(account.testnet)
        .bind(account.is_default)
        .bind(account.is_active)
        .bind(account.paper_trading)
        .bind(account.paper_balance)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert account")?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn find_all(&self, user_id: Uuid) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE user_id = ? ORDER BY account_id")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to load accounts")?;

        rows.iter().map(Self::row_to_account).collect()
    }

    pub async fn find(&self, user_id: Uuid, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE user_id = ? AND account_id = ?")
            .bind(user_id.to_string())
            .bind(account_id.to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    pub async fn find_default(&self, user_id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT * FROM accounts WHERE user_id = ? AND is_default = 1 AND is_active = 1",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load default account")?;

        row.as_ref().map(Self::row_to_account).transpose()
    }

    pub async fn set_active(&self, user_id: Uuid, account_id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE accounts SET is_active = ? WHERE user_id = ? AND account_id = ?",
        )
        .bind(active)
        .bind(user_id.to_string())
        .bind(account_id.to_lowercase())
        .execute(&self.pool)
        .await
        .context("Failed to update account active flag")?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of strategies still referencing the account; a non-zero
    /// count blocks deletion (RESTRICT).
    pub async fn strategy_count(&self, user_id: Uuid, account_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM strategies WHERE user_id = ? AND account_id = ?",
        )
        .bind(user_id.to_string())
        .bind(account_id.to_lowercase())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count strategies for account")?;
        Ok(row.try_get("n")?)
    }

    /// Hard delete. The foreign key from strategies is the backstop; the
    /// caller is expected to have checked [`Self::strategy_count`] first so
    /// the user gets a clear message instead of a constraint error.
    pub async fn delete(&self, user_id: Uuid, account_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE user_id = ? AND account_id = ?")
            .bind(user_id.to_string())
            .bind(account_id.to_lowercase())
            .execute(&self.pool)
            .await
            .context("Failed to delete account")?;
        Ok(result.rows_affected() > 0)
    }

    fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> Result<Account> {
        let user_id: String = row.try_get("user_id")?;
        Ok(Account {
            id: Some(row.try_get("id")?),
            user_id: user_id.parse().context("Unparseable account user_id")?,
            account_id: row.try_get("account_id")?,
            name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
            api_key_encrypted: row
                .try_get::<Option<String>, _>("api_key_encrypted")?
                .unwrap_or_default(),
            api_secret_encrypted: row
                .try_get::<Option<String>, _>("api_secret_encrypted")?
                .unwrap_or_default(),
            exchange_platform: row
                .try_get::<Option<String>, _>("exchange_platform")?
                .unwrap_or_else(|| "binance_futures".to_string()),
            testnet: row.try_get("testnet")?,
            is_default: row.try_get("is_default")?,
            is_active: row.try_get("is_active")?,
            paper_trading: row.try_get("paper_trading")?,
            paper_balance: row.try_get("paper_balance")?,
        })
    }
}
