use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Owner of the SQLite pool. Constructed once at boot; everything else
/// reaches the database through the [`StateStore`](super::store::StateStore)
/// façade.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE,
                created_at TEXT DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS roles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_roles (
                user_id TEXT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
                role_id INTEGER NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
                PRIMARY KEY (user_id, role_id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create user tables")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                name TEXT,
                api_key_encrypted TEXT,
                api_secret_encrypted TEXT,
                exchange_platform TEXT DEFAULT 'binance_futures',
                testnet BOOLEAN DEFAULT 0,
                is_default BOOLEAN DEFAULT 0,
                is_active BOOLEAN DEFAULT 1,
                paper_trading BOOLEAN DEFAULT 0,
                paper_balance REAL,
                UNIQUE (user_id, account_id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create accounts table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                strategy_type TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                risk_per_trade REAL NOT NULL,
                fixed_amount REAL,
                params TEXT NOT NULL,
                max_positions INTEGER DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'stopped',
                meta TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id, account_id)
                    REFERENCES accounts (user_id, account_id) ON DELETE RESTRICT
            );
            CREATE INDEX IF NOT EXISTS idx_strategies_user_status
            ON strategies (user_id, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategies table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL REFERENCES strategies (id) ON DELETE CASCADE,
                order_id BIGINT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT DEFAULT 'MARKET',
                executed_qty REAL NOT NULL,
                price REAL NOT NULL,
                avg_price REAL,
                status TEXT NOT NULL,
                commission REAL,
                commission_asset TEXT,
                leverage INTEGER,
                position_side TEXT,
                timestamp TEXT NOT NULL,
                exit_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_user_strategy
            ON trades (user_id, strategy_id, order_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS completed_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL REFERENCES strategies (id) ON DELETE CASCADE,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                gross_pnl REAL NOT NULL,
                fee_paid REAL NOT NULL,
                net_pnl REAL NOT NULL,
                exit_reason TEXT NOT NULL,
                entry_time TEXT,
                exit_time TEXT
            );
            CREATE TABLE IF NOT EXISTS completed_trade_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                completed_trade_id INTEGER NOT NULL
                    REFERENCES completed_trades (id) ON DELETE CASCADE,
                order_id BIGINT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('entry', 'exit'))
            );
            CREATE INDEX IF NOT EXISTS idx_completed_trades_user_strategy
            ON completed_trades (user_id, strategy_id, exit_time);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create completed trade tables")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_risk_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                strategy_id TEXT,
                config TEXT NOT NULL,
                updated_at TEXT DEFAULT (datetime('now')),
                UNIQUE (user_id, account_id, strategy_id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategy_risk_config table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS circuit_breaker_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                strategy_id TEXT,
                breaker_type TEXT NOT NULL,
                breaker_scope TEXT NOT NULL,
                trigger_value REAL NOT NULL,
                threshold_value REAL NOT NULL,
                triggered_at TEXT NOT NULL,
                status TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_breaker_events_user_status
            ON circuit_breaker_events (user_id, breaker_type, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create circuit_breaker_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_parameter_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL REFERENCES strategies (id) ON DELETE CASCADE,
                old_params TEXT NOT NULL,
                new_params TEXT NOT NULL,
                changed_params TEXT NOT NULL,
                reason TEXT NOT NULL CHECK (reason IN ('auto_tuning', 'manual')),
                status TEXT NOT NULL
                    CHECK (status IN ('applied', 'rolled_back', 'aborted', 'failed')),
                performance_before REAL,
                performance_after REAL,
                created_at TEXT DEFAULT (datetime('now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategy_parameter_history table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT,
                created_at TEXT DEFAULT (datetime('now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create system_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_metrics (
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL,
                updated_at TEXT DEFAULT (datetime('now')),
                PRIMARY KEY (user_id, account_id, metric)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create risk_metrics table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
