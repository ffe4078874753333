//! FIFO matching of raw fills into completed positions.
//!
//! The matcher is the single source of truth for realized PnL: stats,
//! loss limits and breakers all consume its output. It is a pure function
//! over the fill list the caller passes in.

use crate::domain::types::{ExitReason, OrderFill, OrderSide, PositionSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default taker fee per side (0.04 %).
pub const DEFAULT_FEE_RATE: f64 = 0.0004;

/// An entry-exit pair (or lot portion) produced by FIFO matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTrade {
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub side: PositionSide,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    pub entry_order_id: Option<i64>,
    pub exit_order_id: i64,
    pub gross_pnl: f64,
    pub fee_paid: f64,
    pub net_pnl: f64,
    pub exit_reason: ExitReason,
}

/// An open lot waiting for the opposite side.
#[derive(Debug, Clone)]
struct OpenLot {
    quantity: f64,
    original_quantity: f64,
    entry_price: f64,
    entry_time: Option<DateTime<Utc>>,
    entry_order_id: Option<i64>,
    side: PositionSide,
    exit_reason: Option<ExitReason>,
}

/// Match raw fills into completed positions using FIFO pairing.
///
/// Fills are sorted by exchange order id (monotonic per account) before
/// matching. A fill on the same side as the head lot opens or adds; a fill
/// on the opposite side consumes lots from the head, emitting one
/// [`CompletedTrade`] per consumed portion. Residual quantity flips the
/// direction and opens a new lot.
pub fn match_completed_trades(trades: &[OrderFill], fee_rate: f64) -> Vec<CompletedTrade> {
    if trades.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<&OrderFill> = trades.iter().collect();
    sorted.sort_by_key(|t| t.order_id);

    let mut completed = Vec::new();
    let mut queue: VecDeque<OpenLot> = VecDeque::new();

    for trade in sorted {
        let price = trade.effective_price();
        let quantity = trade.executed_qty;
        if quantity <= 0.0 {
            continue;
        }

        let opens = match trade.side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };
        let closes = match trade.side {
            OrderSide::Buy => PositionSide::Short,
            OrderSide::Sell => PositionSide::Long,
        };

        if queue.front().map(|lot| lot.side) != Some(closes) {
            // Same side as head lot, or flat: open / add.
            queue.push_back(OpenLot {
                quantity,
                original_quantity: quantity,
                entry_price: price,
                entry_time: Some(trade.timestamp),
                entry_order_id: Some(trade.order_id),
                side: opens,
                exit_reason: trade.exit_reason,
            });
            continue;
        }

        // Opposite side: consume lots from the head until exhausted.
        let mut remaining = quantity;
        while remaining > 0.0 {
            let Some(lot) = queue.front_mut() else { break };
            if lot.side != closes {
                break;
            }

            let (close_qty, close_fee_ratio) = if lot.quantity <= remaining {
                (lot.quantity, lot.quantity / lot.original_quantity)
            } else {
                (remaining, remaining / lot.original_quantity)
            };

            let gross_pnl = match closes {
                PositionSide::Long => (price - lot.entry_price) * close_qty,
                PositionSide::Short => (lot.entry_price - price) * close_qty,
            };
            let fee_paid = (lot.entry_price + price) * close_qty * fee_rate * close_fee_ratio;
            let net_pnl = gross_pnl - fee_paid;

            completed.push(CompletedTrade {
                entry_price: lot.entry_price,
                exit_price: price,
                quantity: close_qty,
                side: closes,
                entry_time: lot.entry_time,
                exit_time: Some(trade.timestamp),
                entry_order_id: lot.entry_order_id,
                exit_order_id: trade.order_id,
                gross_pnl,
                fee_paid,
                net_pnl,
                exit_reason: trade
                    .exit_reason
                    .or(lot.exit_reason)
                    .unwrap_or(ExitReason::Manual),
            });

            remaining -= close_qty;
            if lot.quantity <= close_qty {
                queue.pop_front();
            } else {
                lot.quantity -= close_qty;
            }
        }

        // Residual quantity flips direction.
        if remaining > 0.0 {
            queue.push_back(OpenLot {
                quantity: remaining,
                original_quantity: remaining,
                entry_price: price,
                entry_time: Some(trade.timestamp),
                entry_order_id: Some(trade.order_id),
                side: opens,
                exit_reason: trade.exit_reason,
            });
        }
    }

    completed
}

/// Sum of `net_pnl` over completed trades whose exit falls inside
/// `[start, end]` (`end = None` means unbounded).
pub fn realized_pnl_in_window(
    completed: &[CompletedTrade],
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> f64 {
    completed
        .iter()
        .filter(|t| match t.exit_time {
            Some(exit) => exit >= start && end.is_none_or(|e| exit <= e),
            None => false,
        })
        .map(|t| t.net_pnl)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fill(order_id: i64, side: OrderSide, qty: f64, price: f64) -> OrderFill {
        OrderFill {
            symbol: "BTCUSDT".into(),
            order_id,
            status: "FILLED".into(),
            side,
            price,
            avg_price: Some(price),
            executed_qty: qty,
            commission: None,
            commission_asset: None,
            timestamp: Utc.timestamp_opt(1_700_000_000 + order_id, 0).unwrap(),
            leverage: Some(5),
            position_side: None,
            exit_reason: None,
        }
    }

    #[test]
    fn long_round_trip_produces_one_completed_trade() {
        let trades = vec![
            fill(1, OrderSide::Buy, 0.5, 40000.0),
            fill(2, OrderSide::Sell, 0.5, 40200.0),
        ];
        let completed = match_completed_trades(&trades, DEFAULT_FEE_RATE);

        assert_eq!(completed.len(), 1);
        let t = &completed[0];
        assert_eq!(t.side, PositionSide::Long);
        assert!((t.gross_pnl - 100.0).abs() < 1e-9);
        let expected_fee = (40000.0 + 40200.0) * 0.5 * DEFAULT_FEE_RATE;
        assert!((t.fee_paid - expected_fee).abs() < 1e-9);
        assert!((t.net_pnl - (t.gross_pnl - t.fee_paid)).abs() < 1e-12);
        assert_eq!(t.exit_reason, ExitReason::Manual);
    }

    #[test]
    fn short_pnl_is_entry_minus_exit() {
        let trades = vec![
            fill(10, OrderSide::Sell, 1.0, 3000.0),
            fill(11, OrderSide::Buy, 1.0, 2950.0),
        ];
        let completed = match_completed_trades(&trades, 0.0);

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].side, PositionSide::Short);
        assert!((completed[0].gross_pnl - 50.0).abs() < 1e-9);
        assert_eq!(completed[0].net_pnl, completed[0].gross_pnl);
    }

    #[test]
    fn partial_close_scales_fee_by_closed_ratio() {
        let trades = vec![
            fill(1, OrderSide::Buy, 1.0, 100.0),
            fill(2, OrderSide::Sell, 0.4, 110.0),
        ];
        let completed = match_completed_trades(&trades, DEFAULT_FEE_RATE);

        assert_eq!(completed.len(), 1);
        let t = &completed[0];
        assert!((t.quantity - 0.4).abs() < 1e-12);
        // closed_fee_ratio = 0.4 / 1.0
        let expected_fee = (100.0 + 110.0) * 0.4 * DEFAULT_FEE_RATE * 0.4;
        assert!((t.fee_paid - expected_fee).abs() < 1e-12);
    }

    #[test]
    fn oversized_close_flips_direction() {
        let trades = vec![
            fill(1, OrderSide::Buy, 0.5, 100.0),
            fill(2, OrderSide::Sell, 0.8, 105.0),
            fill(3, OrderSide::Buy, 0.3, 103.0),
        ];
        let completed = match_completed_trades(&trades, 0.0);

        // Close of the 0.5 LONG, then the 0.3 residual SHORT closed by #3.
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].side, PositionSide::Long);
        assert!((completed[0].quantity - 0.5).abs() < 1e-12);
        assert_eq!(completed[1].side, PositionSide::Short);
        assert!((completed[1].quantity - 0.3).abs() < 1e-12);
        assert!((completed[1].gross_pnl - (105.0 - 103.0) * 0.3).abs() < 1e-12);
    }

    #[test]
    fn one_close_consumes_multiple_lots_fifo() {
        let trades = vec![
            fill(1, OrderSide::Buy, 0.2, 100.0),
            fill(2, OrderSide::Buy, 0.3, 102.0),
            fill(3, OrderSide::Sell, 0.5, 104.0),
        ];
        let completed = match_completed_trades(&trades, 0.0);

        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].entry_order_id, Some(1));
        assert!((completed[0].gross_pnl - 4.0 * 0.2).abs() < 1e-12);
        assert_eq!(completed[1].entry_order_id, Some(2));
        assert!((completed[1].gross_pnl - 2.0 * 0.3).abs() < 1e-12);
    }

    #[test]
    fn exit_reason_comes_from_closing_fill_first() {
        let mut close = fill(2, OrderSide::Sell, 0.5, 99.0);
        close.exit_reason = Some(ExitReason::StopLoss);
        let trades = vec![fill(1, OrderSide::Buy, 0.5, 100.0), close];
        let completed = match_completed_trades(&trades, 0.0);

        assert_eq!(completed[0].exit_reason, ExitReason::StopLoss);
    }

    #[test]
    fn unsorted_input_is_matched_in_order_id_order() {
        let trades = vec![
            fill(5, OrderSide::Sell, 0.5, 110.0),
            fill(4, OrderSide::Buy, 0.5, 100.0),
        ];
        let completed = match_completed_trades(&trades, 0.0);

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].side, PositionSide::Long);
        assert!((completed[0].gross_pnl - 5.0).abs() < 1e-12);
    }

    #[test]
    fn matching_is_prefix_stable_under_concatenation() {
        let l1 = vec![
            fill(1, OrderSide::Buy, 0.5, 100.0),
            fill(2, OrderSide::Sell, 0.5, 105.0),
        ];
        let l2 = vec![
            fill(3, OrderSide::Sell, 0.2, 104.0),
            fill(4, OrderSide::Buy, 0.2, 101.0),
        ];
        let first = match_completed_trades(&l1, 0.0);

        let mut all = l1.clone();
        all.extend(l2);
        let both = match_completed_trades(&all, 0.0);

        assert_eq!(both.len(), first.len() + 1);
        for (a, b) in first.iter().zip(both.iter()) {
            assert_eq!(a.exit_order_id, b.exit_order_id);
            assert!((a.net_pnl - b.net_pnl).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_input_yields_no_trades() {
        assert!(match_completed_trades(&[], DEFAULT_FEE_RATE).is_empty());
    }

    #[test]
    fn window_filter_sums_only_contained_exits() {
        let trades = vec![
            fill(1, OrderSide::Buy, 1.0, 100.0),
            fill(2, OrderSide::Sell, 1.0, 110.0),
        ];
        let completed = match_completed_trades(&trades, 0.0);
        let before = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let after = Utc.timestamp_opt(1_800_000_000, 0).unwrap();

        assert!((realized_pnl_in_window(&completed, before, None) - 10.0).abs() < 1e-9);
        assert_eq!(realized_pnl_in_window(&completed, after, None), 0.0);
    }
}
