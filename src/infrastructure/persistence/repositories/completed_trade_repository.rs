use crate::domain::matching::CompletedTrade;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Materialized matcher output, so history pages don't recompute matching
/// over the full fill list. Rebuilt wholesale per strategy after each
/// trade-history change; the matcher stays the source of truth.
pub struct CompletedTradeRepository {
    pool: SqlitePool,
}

impl CompletedTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn replace_for_strategy(
        &self,
        user_id: Uuid,
        strategy_id: &str,
        completed: &[CompletedTrade],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM completed_trades WHERE user_id = ? AND strategy_id = ?")
            .bind(user_id.to_string())
            .bind(strategy_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear completed trades")?;

        for trade in completed {
            let row = sqlx::query(
                r#"
                INSERT INTO completed_trades
                    (user_id, strategy_id, side, quantity, entry_price, exit_price,
                     gross_pnl, fee_paid, net_pnl, exit_reason, entry_time, exit_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(user_id.to_string())
            .bind(strategy_id)
            .bind(trade.side.to_string())
            .bind(trade.quantity)
            .bind(trade.entry_price)
            .bind(trade.exit_price)
            .bind(trade.gross_pnl)
            .bind(trade.fee_paid)
            .bind(trade.net_pnl)
            .bind(trade.exit_reason.to_string())
            .bind(trade.entry_time)
            .bind(trade.exit_time)
            .execute(&mut *tx)
            .await
            .context("Failed to insert completed trade")?;

            let completed_id = row.last_insert_rowid();
            if let Some(entry_order_id) = trade.entry_order_id {
                sqlx::query(
                    "INSERT INTO completed_trade_orders (completed_trade_id, order_id, role) VALUES (?, ?, 'entry')",
                )
                .bind(completed_id)
                .bind(entry_order_id)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(
                "INSERT INTO completed_trade_orders (completed_trade_id, order_id, role) VALUES (?, ?, 'exit')",
            )
            .bind(completed_id)
            .bind(trade.exit_order_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
