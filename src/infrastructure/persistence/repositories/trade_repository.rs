use crate::domain::types::{ExitReason, OrderFill, OrderSide, PositionSide};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct TradeRepository {
    pool: SqlitePool,
}

impl TradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one raw fill. Trades are append-only; the engine never
    /// updates or deletes individual rows.
    pub async fn insert(&self, user_id: Uuid, strategy_id: &str, fill: &OrderFill) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades
                (user_id, strategy_id, order_id, symbol, side, executed_qty, price,
                 avg_price, status, commission, commission_asset, leverage,
                 position_side, timestamp, exit_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id.to_string())
        .bind(strategy_id)
        .bind(fill.order_id)
        .bind(&fill.symbol)
        .bind(fill.side.to_string())
        .bind(fill.executed_qty)
        .bind(fill.price)
        .bind(fill.avg_price)
        .bind(&fill.status)
        .bind(fill.commission)
        .bind(&fill.commission_asset)
        .bind(fill.leverage.map(i64::from))
        .bind(fill.position_side.map(|s| s.to_string()))
        .bind(fill.timestamp)
        .bind(fill.exit_reason.map(|r| r.to_string()))
        .execute(&self.pool)
        .await
        .context("Failed to insert trade")?;
        Ok(())
    }

    /// Fills of one strategy, ordered by exchange order id ascending
    /// (matcher input order).
    pub async fn find_by_strategy(
        &self,
        user_id: Uuid,
        strategy_id: &str,
        limit: usize,
    ) -> Result<Vec<OrderFill>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM trades
            WHERE user_id = ? AND strategy_id = ?
            ORDER BY order_id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(strategy_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load trades")?;

        let mut fills: Vec<OrderFill> = rows
            .iter()
            .map(Self::row_to_fill)
            .collect::<Result<Vec<_>>>()?;
        fills.reverse();
        Ok(fills)
    }

    fn row_to_fill(row: &sqlx::sqlite::SqliteRow) -> Result<OrderFill> {
        let side_str: String = row.try_get("side")?;
        let side = match side_str.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => anyhow::bail!("Unknown trade side: {}", other),
        };

        let position_side: Option<String> = row.try_get("position_side")?;
        let position_side = match position_side.as_deref() {
            Some("LONG") => Some(PositionSide::Long),
            Some("SHORT") => Some(PositionSide::Short),
            _ => None,
        };

        let exit_reason: Option<String> = row.try_get("exit_reason")?;
        let exit_reason = exit_reason.as_deref().map(parse_exit_reason);

        let leverage: Option<i64> = row.try_get("leverage")?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp")?;

        Ok(OrderFill {
            symbol: row.try_get("symbol")?,
            order_id: row.try_get("order_id")?,
            status: row.try_get("status")?,
            side,
            price: row.try_get("price")?,
            avg_price: row.try_get("avg_price")?,
            executed_qty: row.try_get("executed_qty")?,
            commission: row.try_get("commission")?,
            commission_asset: row.try_get("commission_asset")?,
            timestamp,
            leverage: leverage.and_then(|l| u32::try_from(l).ok()),
            position_side,
            exit_reason,
        })
    }
}

fn parse_exit_reason(s: &str) -> ExitReason {
    match s {
        "TP" => ExitReason::TakeProfit,
        "SL" => ExitReason::StopLoss,
        "TP_TRAILING" => ExitReason::TrailingTakeProfit,
        "EMA_DEATH_CROSS" => ExitReason::EmaDeathCross,
        "MANUAL" => ExitReason::Manual,
        _ => ExitReason::Unknown,
    }
}
