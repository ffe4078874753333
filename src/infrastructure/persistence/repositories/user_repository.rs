use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

const DEFAULT_ROLES: &[&str] = &["admin", "user"];

/// Tenant provisioning: the engine runs for one user; its row, the default
/// roles and the role link are ensured at boot. Authentication itself
/// lives outside the engine.
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn provision(&self, user_id: Uuid, role: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO users (id) VALUES (?)")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to ensure user row")?;

        for name in DEFAULT_ROLES {
            sqlx::query("INSERT OR IGNORE INTO roles (name) VALUES (?)")
                .bind(name)
                .execute(&mut *tx)
                .await
                .context("Failed to seed role")?;
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO user_roles (user_id, role_id)
            SELECT ?, id FROM roles WHERE name = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(role)
        .execute(&mut *tx)
        .await
        .context("Failed to link user role")?;

        tx.commit().await?;
        Ok(())
    }
}
