use crate::domain::errors::ExchangeError;
use crate::domain::strategy::StrategySummary;
use crate::domain::types::{
    Kline, OpenOrder, OrderFill, OrderSide, PositionInfo, PositionSide, Signal,
};
use async_trait::async_trait;

/// Typed surface over the exchange futures REST API. One implementation per
/// venue plus the in-crate mock used by tests.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError>;

    async fn get_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn get_open_position(&self, symbol: &str)
    -> Result<Option<PositionInfo>, ExchangeError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Current leverage for the symbol, `None` when the exchange has no
    /// position bracket yet.
    async fn get_current_leverage(&self, symbol: &str) -> Result<Option<u32>, ExchangeError>;

    async fn adjust_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderFill, ExchangeError>;

    /// Returns the exchange order id of the resting TP order.
    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<i64, ExchangeError>;

    /// Returns the exchange order id of the resting SL order.
    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<i64, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError>;

    /// Determine side and size from the live position and submit a
    /// reduce-only market close. `None` when already flat.
    async fn close_position(&self, symbol: &str) -> Result<Option<OrderFill>, ExchangeError>;

    /// Account balance in the quote currency (USDT).
    async fn futures_account_balance(&self) -> Result<f64, ExchangeError>;
}

/// One evaluator instance per running strategy task. Evaluators fetch their
/// own market data through the exchange handle they were constructed with.
#[async_trait]
pub trait SignalEvaluator: Send {
    async fn evaluate(&mut self) -> anyhow::Result<Signal>;

    /// Push exchange reality into the evaluator before each evaluation so
    /// it cannot act on a position it no longer holds.
    fn sync_position_state(&mut self, position_side: Option<PositionSide>, entry_price: Option<f64>);

    async fn teardown(&mut self);
}

/// Fire-and-forget notification sink. Implementations may be no-ops; the
/// engine never awaits delivery guarantees.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_strategy_started(&self, summary: &StrategySummary, reason: &str);

    async fn notify_strategy_stopped(
        &self,
        summary: &StrategySummary,
        reason: &str,
        final_pnl: Option<f64>,
    );

    async fn notify_strategy_error(&self, summary: &StrategySummary, error: &str);

    async fn notify_pnl_threshold(&self, summary: &StrategySummary, pnl: f64, threshold: f64);

    async fn notify_database_connection_failed(&self, error: &str);

    async fn notify_database_connection_restored(&self);

    async fn notify_server_restart(&self, restored_strategies: usize, errors: &[String]);
}

/// The one operation the circuit breaker needs from the scheduler: stop a
/// running strategy and mark it stopped-by-risk. Narrow on purpose so the
/// breaker never owns the scheduler.
#[async_trait]
pub trait StrategyStopper: Send + Sync {
    async fn stop_for_risk(&self, strategy_id: &str, reason: &str) -> anyhow::Result<()>;

    /// Return a `stopped_by_risk` strategy to `stopped` so the user can
    /// start it again manually. Never restarts anything.
    async fn reset_to_stopped(&self, strategy_id: &str) -> anyhow::Result<()>;
}

/// Durable scalar metrics the risk gate needs across restarts (peak balance
/// per account for drawdown).
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn load_peak_balance(&self, account_id: &str) -> anyhow::Result<Option<f64>>;

    async fn save_peak_balance(&self, account_id: &str, value: f64) -> anyhow::Result<()>;
}

/// Audit sink for circuit-breaker transitions.
#[async_trait]
pub trait BreakerEventSink: Send + Sync {
    async fn record_breaker_event(
        &self,
        state: &crate::domain::breaker::BreakerState,
    ) -> anyhow::Result<()>;

    /// Mark the most recent active event of this type as resolved.
    async fn resolve_breaker_event(
        &self,
        breaker_type: crate::domain::breaker::BreakerType,
        status: crate::domain::breaker::BreakerStatus,
    ) -> anyhow::Result<()>;
}
