//! Order submission with the leverage invariant enforced first.
//!
//! Leverage on the exchange is per symbol, not per strategy, and the venue
//! applies its own default when none was ever set. Every order therefore
//! verifies the bracket before submission; a failure here aborts the order
//! rather than risking a fill at the wrong leverage.

use crate::domain::errors::{EngineError, ExchangeError};
use crate::domain::ports::ExchangeApi;
use crate::domain::types::{OrderFill, OrderSide, Signal, SignalAction};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct OrderExecutor {
    client: Arc<dyn ExchangeApi>,
}

impl OrderExecutor {
    pub fn new(client: Arc<dyn ExchangeApi>) -> Self {
        Self { client }
    }

    /// Verify the symbol's leverage matches the strategy's, adjusting when
    /// it differs and proactively when the exchange has none set yet.
    pub async fn ensure_leverage(
        &self,
        strategy_id: &str,
        symbol: &str,
        leverage: u32,
    ) -> Result<(), EngineError> {
        if !(1..=50).contains(&leverage) {
            return Err(EngineError::InvalidLeverage {
                leverage,
                reason: format!(
                    "must be explicitly set between 1 and 50 to avoid the exchange default for {}",
                    symbol
                ),
            });
        }

        match self.client.get_current_leverage(symbol).await? {
            Some(current) if current == leverage => {
                debug!(
                    "[{}] Leverage already correct: {}x for {}",
                    strategy_id, current, symbol
                );
            }
            Some(current) => {
                warn!(
                    "[{}] Leverage mismatch for {}: current={}x target={}x, resetting",
                    strategy_id, symbol, current, leverage
                );
                self.client.adjust_leverage(symbol, leverage).await?;
            }
            None => {
                // No bracket yet: set it before the first order so the
                // exchange default never applies.
                info!(
                    "[{}] Setting leverage {}x for {} (no existing position)",
                    strategy_id, leverage, symbol
                );
                self.client.adjust_leverage(symbol, leverage).await?;
            }
        }
        Ok(())
    }

    /// Submit a market order for the signal. Transient failures were
    /// already retried inside the client; what surfaces here is final.
    pub async fn execute(
        &self,
        signal: &Signal,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderFill, EngineError> {
        let side = match signal.action {
            SignalAction::Buy => OrderSide::Buy,
            SignalAction::Sell => OrderSide::Sell,
            SignalAction::Hold => {
                return Err(EngineError::PositionSizing {
                    symbol: signal.symbol.clone(),
                    reason: "cannot execute a HOLD signal".to_string(),
                });
            }
        };

        if quantity <= 0.0 {
            return Err(EngineError::PositionSizing {
                symbol: signal.symbol.clone(),
                reason: format!("non-positive order quantity {}", quantity),
            });
        }

        let fill = self
            .client
            .place_order(&signal.symbol, side, quantity, reduce_only)
            .await
            .map_err(|e| match e {
                ExchangeError::Auth { .. } => {
                    warn!("Authentication failure placing order for {}", signal.symbol);
                    EngineError::Exchange(e)
                }
                other => EngineError::Exchange(other),
            })?;

        debug!(
            "Order executed: {} {} qty={} reduce_only={} orderId={}",
            side, signal.symbol, fill.executed_qty, reduce_only, fill.order_id
        );
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockExchange;

    fn buy_signal(symbol: &str) -> Signal {
        Signal {
            action: SignalAction::Buy,
            symbol: symbol.to_string(),
            price: Some(100.0),
            confidence: None,
            exit_reason: None,
            position_side: None,
            bar_close_time: None,
        }
    }

    #[tokio::test]
    async fn sets_leverage_proactively_when_unset() {
        let mock = Arc::new(MockExchange::new());
        let executor = OrderExecutor::new(mock.clone());

        executor
            .ensure_leverage("s-1", "BTCUSDT", 5)
            .await
            .unwrap();
        assert_eq!(mock.leverage_adjustments(), vec![("BTCUSDT".to_string(), 5)]);
    }

    #[tokio::test]
    async fn corrects_mismatched_leverage() {
        let mock = Arc::new(MockExchange::new());
        mock.set_leverage("BTCUSDT", 20);
        let executor = OrderExecutor::new(mock.clone());

        executor
            .ensure_leverage("s-1", "BTCUSDT", 5)
            .await
            .unwrap();
        assert_eq!(mock.leverage_adjustments(), vec![("BTCUSDT".to_string(), 5)]);
    }

    #[tokio::test]
    async fn matching_leverage_is_left_alone() {
        let mock = Arc::new(MockExchange::new());
        mock.set_leverage("BTCUSDT", 5);
        let executor = OrderExecutor::new(mock.clone());

        executor
            .ensure_leverage("s-1", "BTCUSDT", 5)
            .await
            .unwrap();
        assert!(mock.leverage_adjustments().is_empty());
    }

    #[tokio::test]
    async fn hold_signals_are_never_executed() {
        let mock = Arc::new(MockExchange::new());
        let executor = OrderExecutor::new(mock.clone());

        let mut signal = buy_signal("BTCUSDT");
        signal.action = SignalAction::Hold;
        let err = executor.execute(&signal, 1.0, false).await.unwrap_err();
        assert!(matches!(err, EngineError::PositionSizing { .. }));
        assert!(mock.placed_orders().is_empty());
    }
}
