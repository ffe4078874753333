use crate::domain::types::{PositionSide, SignalAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tag selecting the evaluator implementation for a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyType {
    #[serde(rename = "ema_scalping")]
    EmaScalping,
    /// Alias for scalping with 5/20 EMAs.
    #[serde(rename = "ema_crossover")]
    EmaCrossover,
    #[serde(rename = "range_mean_reversion")]
    RangeMeanReversion,
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyType::EmaScalping => "ema_scalping",
            StrategyType::EmaCrossover => "ema_crossover",
            StrategyType::RangeMeanReversion => "range_mean_reversion",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for StrategyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ema_scalping" => Ok(StrategyType::EmaScalping),
            "ema_crossover" => Ok(StrategyType::EmaCrossover),
            "range_mean_reversion" => Ok(StrategyType::RangeMeanReversion),
            other => Err(anyhow::anyhow!("Unknown strategy type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "running")]
    Running,
    /// Stopped by a risk limit or circuit breaker. Requires a manual reset
    /// to `Stopped` before the strategy may start again.
    #[serde(rename = "stopped_by_risk")]
    StoppedByRisk,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyStatus::Stopped => "stopped",
            StrategyStatus::Running => "running",
            StrategyStatus::StoppedByRisk => "stopped_by_risk",
            StrategyStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for StrategyStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(StrategyStatus::Stopped),
            "running" => Ok(StrategyStatus::Running),
            "stopped_by_risk" => Ok(StrategyStatus::StoppedByRisk),
            "error" => Ok(StrategyStatus::Error),
            other => Err(anyhow::anyhow!("Unknown strategy status: {}", other)),
        }
    }
}

/// Per-strategy parameters. Serialized as one JSON blob; evaluator-specific
/// knobs carry defaults so older rows keep deserializing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyParams {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default)]
    pub trailing_stop_enabled: bool,
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
    #[serde(default = "default_kline_limit")]
    pub kline_limit: usize,
    // EMA scalping
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    // Range mean reversion
    #[serde(default = "default_range_window")]
    pub range_window: usize,
    #[serde(default = "default_range_entry_pct")]
    pub range_entry_pct: f64,
}

fn default_interval_seconds() -> u64 {
    60
}
fn default_take_profit_pct() -> f64 {
    0.005
}
fn default_stop_loss_pct() -> f64 {
    0.003
}
fn default_kline_interval() -> String {
    "1m".to_string()
}
fn default_kline_limit() -> usize {
    100
}
fn default_ema_fast() -> usize {
    8
}
fn default_ema_slow() -> usize {
    21
}
fn default_range_window() -> usize {
    48
}
fn default_range_entry_pct() -> f64 {
    0.25
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            trailing_stop_enabled: false,
            kline_interval: default_kline_interval(),
            kline_limit: default_kline_limit(),
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            range_window: default_range_window(),
            range_entry_pct: default_range_entry_pct(),
        }
    }
}

impl StrategyParams {
    /// The ema_crossover alias historically meant 5/20 EMAs. Applied at
    /// evaluator construction so stored params stay untouched.
    pub fn with_crossover_defaults(mut self) -> Self {
        if self.ema_fast == default_ema_fast() {
            self.ema_fast = 5;
        }
        if self.ema_slow == default_ema_slow() {
            self.ema_slow = 20;
        }
        self
    }
}

/// Ids (and stop prices) of the native TP/SL orders resting on the
/// exchange for the current position, if any. Stop prices are kept so an
/// exchange-side fill between ticks can be booked at its trigger price.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TpSlOrders {
    pub tp_order_id: Option<i64>,
    pub sl_order_id: Option<i64>,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
}

impl TpSlOrders {
    pub fn is_empty(&self) -> bool {
        self.tp_order_id.is_none() && self.sl_order_id.is_none()
    }

    pub fn clear(&mut self) {
        *self = TpSlOrders::default();
    }
}

/// Free-form live metadata attached to a strategy summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryMeta {
    #[serde(default)]
    pub tp_sl_orders: TpSlOrders,
    #[serde(default)]
    pub pause_reason: Option<String>,
}

/// In-memory mirror of a live strategy. Invariant maintained by
/// [`StrategySummary::apply_position`] and [`StrategySummary::clear_position`]:
/// `position_size == 0  ⇔  position_side == None  ⇔  entry_price == None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySummary {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub strategy_type: StrategyType,
    pub status: StrategyStatus,
    pub leverage: u32,
    pub risk_per_trade: f64,
    pub fixed_amount: Option<f64>,
    pub params: StrategyParams,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
    pub last_signal: Option<SignalAction>,
    pub entry_price: Option<f64>,
    pub current_price: Option<f64>,
    pub position_size: f64,
    pub unrealized_pnl: f64,
    pub position_side: Option<PositionSide>,
    #[serde(default)]
    pub meta: SummaryMeta,
}

impl StrategySummary {
    pub fn has_position(&self) -> bool {
        self.position_size > 0.0
    }

    /// Overwrite the position view with exchange reality.
    pub fn apply_position(
        &mut self,
        side: PositionSide,
        size: f64,
        entry_price: f64,
        unrealized_pnl: f64,
    ) {
        self.position_side = Some(side);
        self.position_size = size;
        self.entry_price = Some(entry_price);
        self.unrealized_pnl = unrealized_pnl;
    }

    /// Flat on the exchange: zero out the position fields together so the
    /// size/side/entry invariant cannot be half-updated.
    pub fn clear_position(&mut self) {
        self.position_side = None;
        self.position_size = 0.0;
        self.entry_price = None;
        self.unrealized_pnl = 0.0;
    }
}

/// Registration payload. `leverage` is an `Option` only so the missing case
/// can be rejected with a dedicated error instead of a parse failure; the
/// engine never substitutes a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStrategyRequest {
    pub name: String,
    pub symbol: String,
    pub strategy_type: StrategyType,
    pub account_id: Option<String>,
    pub leverage: Option<u32>,
    pub risk_per_trade: f64,
    pub fixed_amount: Option<f64>,
    #[serde(default)]
    pub params: StrategyParams,
}
