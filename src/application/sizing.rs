use crate::domain::errors::EngineError;
use crate::domain::ports::ExchangeApi;
use std::sync::Arc;
use tracing::debug;

/// Result of sizing one order.
#[derive(Debug, Clone, Copy)]
pub struct PositionSizing {
    pub quantity: f64,
    /// Unleveraged notional at the sizing price.
    pub notional: f64,
}

/// Sizes orders for one account: a fixed quote amount when configured,
/// otherwise a fraction of the live account balance.
pub struct RiskSizer {
    client: Arc<dyn ExchangeApi>,
}

impl RiskSizer {
    pub fn new(client: Arc<dyn ExchangeApi>) -> Self {
        Self { client }
    }

    pub async fn size_position(
        &self,
        symbol: &str,
        risk_per_trade: f64,
        price: f64,
        fixed_amount: Option<f64>,
    ) -> Result<PositionSizing, EngineError> {
        if price <= 0.0 {
            return Err(EngineError::PositionSizing {
                symbol: symbol.to_string(),
                reason: format!("non-positive price {}", price),
            });
        }

        let quantity = match fixed_amount {
            Some(amount) if amount > 0.0 => amount / price,
            Some(amount) => {
                return Err(EngineError::PositionSizing {
                    symbol: symbol.to_string(),
                    reason: format!("non-positive fixed_amount {}", amount),
                });
            }
            None => {
                if !(0.0..=1.0).contains(&risk_per_trade) || risk_per_trade == 0.0 {
                    return Err(EngineError::PositionSizing {
                        symbol: symbol.to_string(),
                        reason: format!("risk_per_trade {} outside (0, 1]", risk_per_trade),
                    });
                }
                let balance = self.client.futures_account_balance().await?;
                if balance <= 0.0 {
                    return Err(EngineError::PositionSizing {
                        symbol: symbol.to_string(),
                        reason: format!("account balance {} too small to size order", balance),
                    });
                }
                risk_per_trade * balance / price
            }
        };

        if quantity <= 0.0 {
            return Err(EngineError::PositionSizing {
                symbol: symbol.to_string(),
                reason: "sized quantity is zero".to_string(),
            });
        }

        let sizing = PositionSizing {
            quantity,
            notional: quantity * price,
        };
        debug!(
            "Sized {}: qty={:.8} notional={:.2} USDT (fixed_amount={:?})",
            symbol, sizing.quantity, sizing.notional, fixed_amount
        );
        Ok(sizing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockExchange;

    #[tokio::test]
    async fn fixed_amount_divides_by_price() {
        let client = Arc::new(MockExchange::new());
        let sizer = RiskSizer::new(client);

        let sizing = sizer
            .size_position("BTCUSDT", 0.01, 40000.0, Some(100.0))
            .await
            .unwrap();
        assert!((sizing.quantity - 0.0025).abs() < 1e-12);
        assert!((sizing.notional - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn risk_fraction_uses_live_balance() {
        let client = Arc::new(MockExchange::new());
        client.set_balance(10_000.0);
        let sizer = RiskSizer::new(client);

        let sizing = sizer
            .size_position("BTCUSDT", 0.02, 50_000.0, None)
            .await
            .unwrap();
        // 2% of 10k = 200 USDT at 50k → 0.004
        assert!((sizing.quantity - 0.004).abs() < 1e-12);
    }

    #[tokio::test]
    async fn zero_price_is_rejected() {
        let client = Arc::new(MockExchange::new());
        let sizer = RiskSizer::new(client);

        let err = sizer
            .size_position("BTCUSDT", 0.01, 0.0, Some(100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PositionSizing { .. }));
    }
}
