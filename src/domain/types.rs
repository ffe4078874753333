use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of a held position. One-way mode: LONG when positionAmt > 0,
/// SHORT when < 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl PositionSide {
    /// The order side that closes a position in this direction.
    pub fn closing_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalAction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "HOLD")]
    Hold,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Buy => write!(f, "BUY"),
            SignalAction::Sell => write!(f, "SELL"),
            SignalAction::Hold => write!(f, "HOLD"),
        }
    }
}

/// Why a position was (or is about to be) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TP_TRAILING")]
    TrailingTakeProfit,
    #[serde(rename = "EMA_DEATH_CROSS")]
    EmaDeathCross,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::TakeProfit => "TP",
            ExitReason::StopLoss => "SL",
            ExitReason::TrailingTakeProfit => "TP_TRAILING",
            ExitReason::EmaDeathCross => "EMA_DEATH_CROSS",
            ExitReason::Manual => "MANUAL",
            ExitReason::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Output of one evaluator tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub symbol: String,
    pub price: Option<f64>,
    pub confidence: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    /// Position direction the evaluator believes it holds, if any.
    pub position_side: Option<PositionSide>,
    /// Close time of the bar that produced this signal, milliseconds.
    /// Used for in-process order dedup within one bar.
    pub bar_close_time: Option<i64>,
}

impl Signal {
    pub fn hold(symbol: &str) -> Self {
        Self {
            action: SignalAction::Hold,
            symbol: symbol.to_string(),
            price: None,
            confidence: None,
            exit_reason: None,
            position_side: None,
            bar_close_time: None,
        }
    }
}

/// Fixed-schema candle as returned by the futures klines endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Live position snapshot from the exchange. `position_amt` keeps the
/// exchange sign convention: positive LONG, negative SHORT.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionInfo {
    pub position_amt: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub mark_price: Option<f64>,
}

impl PositionInfo {
    pub fn side(&self) -> Option<PositionSide> {
        if self.position_amt > 0.0 {
            Some(PositionSide::Long)
        } else if self.position_amt < 0.0 {
            Some(PositionSide::Short)
        } else {
            None
        }
    }

    pub fn size(&self) -> f64 {
        self.position_amt.abs()
    }
}

/// An open order as listed by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: i64,
    pub symbol: String,
    pub order_type: String,
    pub side: OrderSide,
    pub stop_price: Option<f64>,
}

/// A raw fill returned from order placement. Append-only once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub symbol: String,
    pub order_id: i64,
    pub status: String,
    pub side: OrderSide,
    pub price: f64,
    pub avg_price: Option<f64>,
    pub executed_qty: f64,
    pub commission: Option<f64>,
    pub commission_asset: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub leverage: Option<u32>,
    pub position_side: Option<PositionSide>,
    pub exit_reason: Option<ExitReason>,
}

impl OrderFill {
    /// Fill price to use for accounting: average fill price when the
    /// exchange reports one, limit/last price otherwise.
    pub fn effective_price(&self) -> f64 {
        match self.avg_price {
            Some(p) if p > 0.0 => p,
            _ => self.price,
        }
    }

    /// Orders acknowledged but not executed carry no position change and
    /// must not enter trade history.
    pub fn is_tracked(&self) -> bool {
        !(self.status == "NEW" && self.executed_qty == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_info_side_follows_sign() {
        let long = PositionInfo {
            position_amt: 0.5,
            entry_price: 100.0,
            unrealized_pnl: 0.0,
            mark_price: None,
        };
        assert_eq!(long.side(), Some(PositionSide::Long));

        let short = PositionInfo {
            position_amt: -0.5,
            ..long
        };
        assert_eq!(short.side(), Some(PositionSide::Short));
        assert_eq!(short.size(), 0.5);

        let flat = PositionInfo {
            position_amt: 0.0,
            ..long
        };
        assert_eq!(flat.side(), None);
    }

    #[test]
    fn untracked_fill_is_new_with_zero_qty() {
        let fill = OrderFill {
            symbol: "BTCUSDT".into(),
            order_id: 1,
            status: "NEW".into(),
            side: OrderSide::Buy,
            price: 100.0,
            avg_price: None,
            executed_qty: 0.0,
            commission: None,
            commission_asset: None,
            timestamp: Utc::now(),
            leverage: None,
            position_side: None,
            exit_reason: None,
        };
        assert!(!fill.is_tracked());

        let filled = OrderFill {
            status: "FILLED".into(),
            executed_qty: 0.1,
            avg_price: Some(101.0),
            ..fill
        };
        assert!(filled.is_tracked());
        assert_eq!(filled.effective_price(), 101.0);
    }

    #[test]
    fn closing_side_is_opposite_direction() {
        assert_eq!(PositionSide::Long.closing_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_side(), OrderSide::Buy);
    }
}
