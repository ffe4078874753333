//! Built-in signal evaluators and the type → constructor registry.
//!
//! Evaluators are deliberately thin adapters: indicator math is delegated
//! to the `ta` crate and all market data comes through the exchange handle
//! the evaluator was constructed with.

pub mod ema_scalping;
pub mod range_mean_reversion;

use crate::domain::ports::{ExchangeApi, SignalEvaluator};
use crate::domain::strategy::{StrategyParams, StrategyType};
use std::sync::Arc;

use ema_scalping::EmaScalpingEvaluator;
use range_mean_reversion::RangeMeanReversionEvaluator;

/// Maps a strategy type tag to an evaluator constructor.
pub struct EvaluatorRegistry;

impl EvaluatorRegistry {
    pub fn build(
        strategy_type: StrategyType,
        symbol: &str,
        params: &StrategyParams,
        client: Arc<dyn ExchangeApi>,
    ) -> anyhow::Result<Box<dyn SignalEvaluator>> {
        match strategy_type {
            StrategyType::EmaScalping => Ok(Box::new(EmaScalpingEvaluator::new(
                symbol,
                params.clone(),
                client,
            )?)),
            StrategyType::EmaCrossover => {
                let params = params.clone().with_crossover_defaults();
                Ok(Box::new(EmaScalpingEvaluator::new(symbol, params, client)?))
            }
            StrategyType::RangeMeanReversion => Ok(Box::new(RangeMeanReversionEvaluator::new(
                symbol,
                params.clone(),
                client,
            ))),
        }
    }
}
