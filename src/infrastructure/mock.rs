//! In-memory exchange double and scripted evaluator used by unit and
//! integration tests. The mock keeps a tiny position model so reconcile
//! paths see consistent state after fills.

use crate::domain::errors::ExchangeError;
use crate::domain::ports::{ExchangeApi, SignalEvaluator};
use crate::domain::types::{
    Kline, OpenOrder, OrderFill, OrderSide, PositionInfo, PositionSide, Signal,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    klines: HashMap<String, Vec<Kline>>,
    prices: HashMap<String, f64>,
    balance: f64,
    positions: HashMap<String, PositionInfo>,
    open_orders: HashMap<String, Vec<OpenOrder>>,
    leverage: HashMap<String, u32>,
    placed: Vec<OrderFill>,
    cancelled: Vec<(String, i64)>,
    leverage_adjustments: Vec<(String, u32)>,
    next_order_id: i64,
    fail_next_order: Option<ExchangeError>,
}

pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                balance: 10_000.0,
                next_order_id: 1,
                ..MockState::default()
            }),
        }
    }

    pub fn set_klines(&self, symbol: &str, klines: Vec<Kline>) {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = klines.last() {
            state.prices.insert(symbol.to_string(), last.close);
        }
        state.klines.insert(symbol.to_string(), klines);
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state
            .lock()
            .unwrap()
            .prices
            .insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, balance: f64) {
        self.state.lock().unwrap().balance = balance;
    }

    pub fn set_leverage(&self, symbol: &str, leverage: u32) {
        self.state
            .lock()
            .unwrap()
            .leverage
            .insert(symbol.to_string(), leverage);
    }

    pub fn set_position(&self, symbol: &str, position: Option<PositionInfo>) {
        let mut state = self.state.lock().unwrap();
        match position {
            Some(p) => state.positions.insert(symbol.to_string(), p),
            None => state.positions.remove(symbol),
        };
    }

    /// Queue an error for the next `place_order` call.
    pub fn fail_next_order(&self, error: ExchangeError) {
        self.state.lock().unwrap().fail_next_order = Some(error);
    }

    /// Pretend a resting native TP/SL order filled on the exchange: the
    /// order disappears from the book and the position goes flat.
    pub fn simulate_native_fill(&self, symbol: &str, order_id: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(orders) = state.open_orders.get_mut(symbol) {
            orders.retain(|o| o.order_id != order_id);
        }
        state.positions.remove(symbol);
    }

    pub fn placed_orders(&self) -> Vec<OrderFill> {
        self.state.lock().unwrap().placed.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn leverage_adjustments(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().leverage_adjustments.clone()
    }

    pub fn open_order_ids(&self, symbol: &str) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .open_orders
            .get(symbol)
            .map(|orders| orders.iter().map(|o| o.order_id).collect())
            .unwrap_or_default()
    }

    fn price_of(state: &MockState, symbol: &str) -> f64 {
        state.prices.get(symbol).copied().unwrap_or(100.0)
    }

    fn apply_fill(state: &mut MockState, symbol: &str, side: OrderSide, qty: f64, price: f64) {
        let signed = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let current = state.positions.get(symbol).copied();
        let new_amt = current.map(|p| p.position_amt).unwrap_or(0.0) + signed;

        if new_amt.abs() < 1e-12 {
            state.positions.remove(symbol);
        } else {
            let entry_price = match current {
                // Crossing through flat or opening: new entry at fill price.
                Some(p) if p.position_amt.signum() == new_amt.signum() => p.entry_price,
                _ => price,
            };
            state.positions.insert(
                symbol.to_string(),
                PositionInfo {
                    position_amt: new_amt,
                    entry_price,
                    unrealized_pnl: 0.0,
                    mark_price: Some(price),
                },
            );
        }
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn get_klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let state = self.state.lock().unwrap();
        let klines = state.klines.get(symbol).cloned().unwrap_or_default();
        let start = klines.len().saturating_sub(limit);
        Ok(klines[start..].to_vec())
    }

    async fn get_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let state = self.state.lock().unwrap();
        Ok(Self::price_of(&state, symbol))
    }

    async fn get_open_position(
        &self,
        symbol: &str,
    ) -> Result<Option<PositionInfo>, ExchangeError> {
        Ok(self.state.lock().unwrap().positions.get(symbol).copied())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .open_orders
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_current_leverage(&self, symbol: &str) -> Result<Option<u32>, ExchangeError> {
        Ok(self.state.lock().unwrap().leverage.get(symbol).copied())
    }

    async fn adjust_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        state.leverage.insert(symbol.to_string(), leverage);
        state
            .leverage_adjustments
            .push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderFill, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.fail_next_order.take() {
            return Err(error);
        }

        let price = Self::price_of(&state, symbol);
        let quantity = if reduce_only {
            let held = state
                .positions
                .get(symbol)
                .map(|p| p.position_amt.abs())
                .unwrap_or(0.0);
            quantity.min(held)
        } else {
            quantity
        };

        let order_id = state.next_order_id;
        state.next_order_id += 1;

        let leverage = state.leverage.get(symbol).copied();
        Self::apply_fill(&mut state, symbol, side, quantity, price);

        let fill = OrderFill {
            symbol: symbol.to_string(),
            order_id,
            status: "FILLED".to_string(),
            side,
            price,
            avg_price: Some(price),
            executed_qty: quantity,
            commission: None,
            commission_asset: None,
            timestamp: Utc::now(),
            leverage,
            position_side: state.positions.get(symbol).and_then(|p| p.side()),
            exit_reason: None,
        };
        state.placed.push(fill.clone());
        Ok(fill)
    }

    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        _quantity: f64,
        stop_price: f64,
        _close_position: bool,
    ) -> Result<i64, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        state
            .open_orders
            .entry(symbol.to_string())
            .or_default()
            .push(OpenOrder {
                order_id,
                symbol: symbol.to_string(),
                order_type: "TAKE_PROFIT_MARKET".to_string(),
                side,
                stop_price: Some(stop_price),
            });
        Ok(order_id)
    }

    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: OrderSide,
        _quantity: f64,
        stop_price: f64,
        _close_position: bool,
    ) -> Result<i64, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        state
            .open_orders
            .entry(symbol.to_string())
            .or_default()
            .push(OpenOrder {
                order_id,
                symbol: symbol.to_string(),
                order_type: "STOP_MARKET".to_string(),
                side,
                stop_price: Some(stop_price),
            });
        Ok(order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let existed = state
            .open_orders
            .get_mut(symbol)
            .map(|orders| {
                let before = orders.len();
                orders.retain(|o| o.order_id != order_id);
                orders.len() != before
            })
            .unwrap_or(false);
        state.cancelled.push((symbol.to_string(), order_id));
        if existed {
            Ok(())
        } else {
            // Matches the venue's "Unknown order sent" for filled/cancelled ids.
            Err(ExchangeError::Api {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            })
        }
    }

    async fn close_position(&self, symbol: &str) -> Result<Option<OrderFill>, ExchangeError> {
        let (side, qty) = {
            let state = self.state.lock().unwrap();
            match state.positions.get(symbol) {
                Some(p) if p.position_amt != 0.0 => {
                    let side = if p.position_amt > 0.0 {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    };
                    (side, p.position_amt.abs())
                }
                _ => return Ok(None),
            }
        };
        self.place_order(symbol, side, qty, true).await.map(Some)
    }

    async fn futures_account_balance(&self) -> Result<f64, ExchangeError> {
        Ok(self.state.lock().unwrap().balance)
    }
}

/// Evaluator returning a pre-programmed signal sequence; repeats HOLD once
/// the script is exhausted. Records every position sync it receives.
pub struct ScriptedEvaluator {
    symbol: String,
    script: Mutex<VecDeque<Signal>>,
    pub synced: Mutex<Vec<(Option<PositionSide>, Option<f64>)>>,
    pub torn_down: Mutex<bool>,
}

impl ScriptedEvaluator {
    pub fn new(symbol: &str, script: Vec<Signal>) -> Self {
        Self {
            symbol: symbol.to_string(),
            script: Mutex::new(script.into()),
            synced: Mutex::new(Vec::new()),
            torn_down: Mutex::new(false),
        }
    }
}

#[async_trait]
impl SignalEvaluator for ScriptedEvaluator {
    async fn evaluate(&mut self) -> anyhow::Result<Signal> {
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| Signal::hold(&self.symbol)))
    }

    fn sync_position_state(
        &mut self,
        position_side: Option<PositionSide>,
        entry_price: Option<f64>,
    ) {
        self.synced.lock().unwrap().push((position_side, entry_price));
    }

    async fn teardown(&mut self) {
        *self.torn_down.lock().unwrap() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fills_update_the_position_model() {
        let exchange = MockExchange::new();
        exchange.set_price("BTCUSDT", 40_000.0);

        exchange
            .place_order("BTCUSDT", OrderSide::Buy, 0.5, false)
            .await
            .unwrap();
        let position = exchange.get_open_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(position.side(), Some(PositionSide::Long));
        assert!((position.position_amt - 0.5).abs() < 1e-12);

        exchange
            .place_order("BTCUSDT", OrderSide::Sell, 0.5, true)
            .await
            .unwrap();
        assert!(exchange.get_open_position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reduce_only_cannot_exceed_held_size() {
        let exchange = MockExchange::new();
        exchange.set_price("BTCUSDT", 100.0);
        exchange
            .place_order("BTCUSDT", OrderSide::Buy, 0.2, false)
            .await
            .unwrap();

        let fill = exchange
            .place_order("BTCUSDT", OrderSide::Sell, 1.0, true)
            .await
            .unwrap();
        assert!((fill.executed_qty - 0.2).abs() < 1e-12);
        assert!(exchange.get_open_position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelling_a_filled_order_reports_unknown() {
        let exchange = MockExchange::new();
        let err = exchange.cancel_order("BTCUSDT", 42).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Api { code: -2011, .. }));
    }
}
