use crate::domain::ports::{ExchangeApi, SignalEvaluator};
use crate::domain::strategy::StrategyParams;
use crate::domain::types::{ExitReason, PositionSide, Signal, SignalAction};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Range trader: enters near the edges of the recent high/low band and
/// exits when price reverts to the midpoint.
pub struct RangeMeanReversionEvaluator {
    symbol: String,
    params: StrategyParams,
    client: Arc<dyn ExchangeApi>,
    position_side: Option<PositionSide>,
    #[allow(dead_code)]
    entry_price: Option<f64>,
}

impl RangeMeanReversionEvaluator {
    pub fn new(symbol: &str, params: StrategyParams, client: Arc<dyn ExchangeApi>) -> Self {
        Self {
            symbol: symbol.to_string(),
            params,
            client,
            position_side: None,
            entry_price: None,
        }
    }
}

#[async_trait]
impl SignalEvaluator for RangeMeanReversionEvaluator {
    async fn evaluate(&mut self) -> anyhow::Result<Signal> {
        let limit = self.params.kline_limit.max(self.params.range_window + 1);
        let klines = self
            .client
            .get_klines(&self.symbol, &self.params.kline_interval, limit)
            .await?;

        if klines.len() < self.params.range_window + 1 {
            debug!(
                "{}: {} klines < {} needed for range, holding",
                self.symbol,
                klines.len(),
                self.params.range_window + 1
            );
            return Ok(Signal::hold(&self.symbol));
        }

        // Band over the window preceding the current bar.
        let window = &klines[klines.len() - 1 - self.params.range_window..klines.len() - 1];
        let range_high = window.iter().map(|k| k.high).fold(f64::MIN, f64::max);
        let range_low = window.iter().map(|k| k.low).fold(f64::MAX, f64::min);
        let range_mid = (range_high + range_low) / 2.0;
        let band = (range_high - range_low) * self.params.range_entry_pct;

        let last = klines[klines.len() - 1];
        let price = last.close;

        let mut signal = Signal {
            action: SignalAction::Hold,
            symbol: self.symbol.clone(),
            price: Some(price),
            confidence: None,
            exit_reason: None,
            position_side: self.position_side,
            bar_close_time: Some(last.close_time),
        };

        if range_high <= range_low {
            return Ok(signal);
        }

        match self.position_side {
            None => {
                if price <= range_low + band {
                    signal.action = SignalAction::Buy;
                } else if price >= range_high - band {
                    signal.action = SignalAction::Sell;
                }
            }
            Some(PositionSide::Long) => {
                if price >= range_mid {
                    signal.action = SignalAction::Sell;
                    signal.exit_reason = Some(ExitReason::TakeProfit);
                }
            }
            Some(PositionSide::Short) => {
                if price <= range_mid {
                    signal.action = SignalAction::Buy;
                    signal.exit_reason = Some(ExitReason::TakeProfit);
                }
            }
        }

        Ok(signal)
    }

    fn sync_position_state(
        &mut self,
        position_side: Option<PositionSide>,
        entry_price: Option<f64>,
    ) {
        self.position_side = position_side;
        self.entry_price = entry_price;
    }

    async fn teardown(&mut self) {
        debug!("Range mean reversion evaluator for {} torn down", self.symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Kline;
    use crate::infrastructure::mock::MockExchange;

    fn kline(i: i64, low: f64, high: f64, close: f64) -> Kline {
        Kline {
            open_time: i * 60_000,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            close_time: (i + 1) * 60_000 - 1,
        }
    }

    fn ranging_klines(count: i64) -> Vec<Kline> {
        (0..count).map(|i| kline(i, 95.0, 105.0, 100.0)).collect()
    }

    #[tokio::test]
    async fn buys_at_the_bottom_of_the_band() {
        let client = Arc::new(MockExchange::new());
        let mut klines = ranging_klines(20);
        klines.push(kline(20, 95.0, 96.5, 95.5));
        client.set_klines("ETHUSDT", klines);

        let mut params = StrategyParams::default();
        params.range_window = 10;
        params.range_entry_pct = 0.25;
        let mut evaluator = RangeMeanReversionEvaluator::new("ETHUSDT", params, client);

        let signal = evaluator.evaluate().await.unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
    }

    #[tokio::test]
    async fn long_exits_at_the_midpoint() {
        let client = Arc::new(MockExchange::new());
        let mut klines = ranging_klines(20);
        klines.push(kline(20, 99.0, 101.0, 100.5));
        client.set_klines("ETHUSDT", klines);

        let mut params = StrategyParams::default();
        params.range_window = 10;
        let mut evaluator = RangeMeanReversionEvaluator::new("ETHUSDT", params, client);
        evaluator.sync_position_state(Some(PositionSide::Long), Some(95.5));

        let signal = evaluator.evaluate().await.unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
        assert_eq!(signal.exit_reason, Some(ExitReason::TakeProfit));
    }

    #[tokio::test]
    async fn holds_in_the_middle_when_flat() {
        let client = Arc::new(MockExchange::new());
        let mut klines = ranging_klines(20);
        klines.push(kline(20, 99.5, 100.5, 100.0));
        client.set_klines("ETHUSDT", klines);

        let mut params = StrategyParams::default();
        params.range_window = 10;
        let mut evaluator = RangeMeanReversionEvaluator::new("ETHUSDT", params, client);

        let signal = evaluator.evaluate().await.unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
    }
}
