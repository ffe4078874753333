use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Performance summary of a single strategy, derived from matched trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStats {
    pub strategy_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub total_trades: usize,
    pub completed_trades: usize,
    pub total_pnl: f64,
    /// Percentage in [0, 100].
    pub win_rate: f64,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_profit_per_trade: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub created_at: DateTime<Utc>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

/// Aggregate across all strategies of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallStats {
    pub total_strategies: usize,
    pub active_strategies: usize,
    pub total_trades: usize,
    pub completed_trades: usize,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_profit_per_trade: f64,
    pub best_performing_strategy: Option<String>,
    pub worst_performing_strategy: Option<String>,
}
