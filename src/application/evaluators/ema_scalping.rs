use crate::domain::ports::{ExchangeApi, SignalEvaluator};
use crate::domain::strategy::StrategyParams;
use crate::domain::types::{ExitReason, PositionSide, Signal, SignalAction};
use async_trait::async_trait;
use std::sync::Arc;
use ta::Next;
use ta::indicators::ExponentialMovingAverage;
use tracing::debug;

/// EMA crossover scalper: golden cross opens LONG, death cross opens SHORT,
/// the opposite cross closes whatever is held.
pub struct EmaScalpingEvaluator {
    symbol: String,
    params: StrategyParams,
    client: Arc<dyn ExchangeApi>,
    position_side: Option<PositionSide>,
    #[allow(dead_code)]
    entry_price: Option<f64>,
}

impl EmaScalpingEvaluator {
    pub fn new(
        symbol: &str,
        params: StrategyParams,
        client: Arc<dyn ExchangeApi>,
    ) -> anyhow::Result<Self> {
        if params.ema_fast == 0 || params.ema_slow == 0 || params.ema_fast >= params.ema_slow {
            anyhow::bail!(
                "Invalid EMA periods: fast={} slow={}",
                params.ema_fast,
                params.ema_slow
            );
        }
        Ok(Self {
            symbol: symbol.to_string(),
            params,
            client,
            position_side: None,
            entry_price: None,
        })
    }
}

#[async_trait]
impl SignalEvaluator for EmaScalpingEvaluator {
    async fn evaluate(&mut self) -> anyhow::Result<Signal> {
        let klines = self
            .client
            .get_klines(
                &self.symbol,
                &self.params.kline_interval,
                self.params.kline_limit,
            )
            .await?;

        if klines.len() < self.params.ema_slow + 2 {
            debug!(
                "{}: {} klines < {} needed, holding",
                self.symbol,
                klines.len(),
                self.params.ema_slow + 2
            );
            return Ok(Signal::hold(&self.symbol));
        }

        let mut fast = ExponentialMovingAverage::new(self.params.ema_fast)
            .map_err(|e| anyhow::anyhow!("invalid fast EMA period: {}", e))?;
        let mut slow = ExponentialMovingAverage::new(self.params.ema_slow)
            .map_err(|e| anyhow::anyhow!("invalid slow EMA period: {}", e))?;

        let mut prev_diff = 0.0;
        let mut last_diff = 0.0;
        for kline in &klines {
            prev_diff = last_diff;
            last_diff = fast.next(kline.close) - slow.next(kline.close);
        }

        let last = klines[klines.len() - 1];
        let golden_cross = prev_diff <= 0.0 && last_diff > 0.0;
        let death_cross = prev_diff >= 0.0 && last_diff < 0.0;

        let mut signal = Signal {
            action: SignalAction::Hold,
            symbol: self.symbol.clone(),
            price: Some(last.close),
            confidence: Some((last_diff.abs() / last.close).min(1.0)),
            exit_reason: None,
            position_side: self.position_side,
            bar_close_time: Some(last.close_time),
        };

        match self.position_side {
            None => {
                if golden_cross {
                    signal.action = SignalAction::Buy;
                } else if death_cross {
                    signal.action = SignalAction::Sell;
                }
            }
            Some(PositionSide::Long) => {
                if death_cross {
                    signal.action = SignalAction::Sell;
                    signal.exit_reason = Some(ExitReason::EmaDeathCross);
                }
            }
            Some(PositionSide::Short) => {
                if golden_cross {
                    signal.action = SignalAction::Buy;
                    signal.exit_reason = Some(ExitReason::EmaDeathCross);
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
        debug!("EMA scalping evaluator for {} torn down", self.symbol);
    }
}
