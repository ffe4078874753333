//! Circuit breaker detectors and their interaction with the scheduler.

use chrono::{Duration as ChronoDuration, Utc};
use futrade::application::risk::breaker::CircuitBreaker;
use futrade::application::risk::portfolio::PortfolioRiskManager;
use futrade::domain::breaker::{BreakerScope, BreakerStatus, BreakerType};
use futrade::domain::ports::StrategyStopper;
use futrade::domain::risk_config::RiskConfig;
use futrade::domain::strategy::{
    StrategyParams, StrategyStatus, StrategySummary, StrategyType, SummaryMeta,
};
use futrade::domain::types::{OrderFill, OrderSide};
use futrade::infrastructure::accounts::ClientManager;
use futrade::infrastructure::mock::MockExchange;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

type SummaryHandle = Arc<RwLock<StrategySummary>>;
type StrategyMap = Arc<RwLock<HashMap<String, SummaryHandle>>>;
type TradeMap = Arc<RwLock<HashMap<String, Vec<OrderFill>>>>;

/// Records which strategies were stopped, instead of driving a scheduler.
#[derive(Default)]
struct RecordingStopper {
    stopped: Mutex<Vec<(String, String)>>,
    reset: Mutex<Vec<String>>,
}

#[async_trait]
impl StrategyStopper for RecordingStopper {
    async fn stop_for_risk(&self, strategy_id: &str, reason: &str) -> anyhow::Result<()> {
        self.stopped
            .lock()
            .unwrap()
            .push((strategy_id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn reset_to_stopped(&self, strategy_id: &str) -> anyhow::Result<()> {
        self.reset.lock().unwrap().push(strategy_id.to_string());
        Ok(())
    }
}

fn summary(id: &str, symbol: &str) -> StrategySummary {
    StrategySummary {
        id: id.to_string(),
        name: id.to_string(),
        symbol: symbol.to_string(),
        strategy_type: StrategyType::EmaScalping,
        status: StrategyStatus::Running,
        leverage: 5,
        risk_per_trade: 0.01,
        fixed_amount: Some(100.0),
        params: StrategyParams::default(),
        account_id: "default".to_string(),
        created_at: Utc::now(),
        last_signal: None,
        entry_price: None,
        current_price: Some(100.0),
        position_size: 0.0,
        unrealized_pnl: 0.0,
        position_side: None,
        meta: SummaryMeta::default(),
    }
}

fn fill(order_id: i64, side: OrderSide, qty: f64, price: f64, minutes_ago: i64) -> OrderFill {
    OrderFill {
        symbol: "BTCUSDT".into(),
        order_id,
        status: "FILLED".into(),
        side,
        price,
        avg_price: Some(price),
        executed_qty: qty,
        commission: None,
        commission_asset: None,
        timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
        leverage: Some(5),
        position_side: None,
        exit_reason: None,
    }
}

/// A losing round trip: buy high, sell low.
fn losing_pair(first_order_id: i64, minutes_ago: i64) -> [OrderFill; 2] {
    [
        fill(first_order_id, OrderSide::Buy, 1.0, 110.0, minutes_ago + 1),
        fill(first_order_id + 1, OrderSide::Sell, 1.0, 100.0, minutes_ago),
    ]
}

struct BreakerRig {
    breaker: CircuitBreaker,
    stopper: Arc<RecordingStopper>,
    trades: TradeMap,
    #[allow(dead_code)]
    strategies: StrategyMap,
    #[allow(dead_code)]
    exchange: Arc<MockExchange>,
}

async fn breaker_rig(summaries: Vec<StrategySummary>, config: RiskConfig) -> BreakerRig {
    let strategies: StrategyMap = Arc::new(RwLock::new(HashMap::new()));
    for s in summaries {
        strategies
            .write()
            .await
            .insert(s.id.clone(), Arc::new(RwLock::new(s)));
    }
    let trades: TradeMap = Arc::new(RwLock::new(HashMap::new()));

    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(1_000.0);
    let clients = Arc::new(ClientManager::new());
    clients.inject_client("default", exchange.clone()).await;

    let risk = Arc::new(PortfolioRiskManager::new(
        strategies.clone(),
        trades.clone(),
        clients,
        None,
        0.0,
        0.95,
    ));
    risk.set_account_config("default", Some(config)).await;

    let stopper = Arc::new(RecordingStopper::default());
    let breaker = CircuitBreaker::new(
        strategies.clone(),
        trades.clone(),
        risk,
        stopper.clone(),
        None,
        0.0,
    );

    BreakerRig {
        breaker,
        stopper,
        trades,
        strategies,
        exchange,
    }
}

#[tokio::test]
async fn three_consecutive_losses_trip_the_strategy_breaker() {
    let config = RiskConfig {
        circuit_breaker_enabled: true,
        max_consecutive_losses: Some(3),
        ..RiskConfig::default()
    };
    let rig = breaker_rig(vec![summary("s-1", "BTCUSDT")], config).await;

    let mut fills = Vec::new();
    fills.extend(losing_pair(1, 30));
    fills.extend(losing_pair(3, 20));
    fills.extend(losing_pair(5, 10));
    rig.trades.write().await.insert("s-1".to_string(), fills);

    let state = rig
        .breaker
        .check_consecutive_losses("s-1", "default")
        .await
        .expect("breaker should trip");

    assert_eq!(state.breaker_type, BreakerType::ConsecutiveLosses);
    assert_eq!(state.scope, BreakerScope::Strategy);
    assert_eq!(state.trigger_value, 3.0);
    assert!(state.cooldown_until.is_some());

    assert!(rig.breaker.is_active("default", Some("s-1")).await);
    assert_eq!(
        rig.stopper.stopped.lock().unwrap().as_slice(),
        &[("s-1".to_string(), "consecutive_losses".to_string())]
    );
}

#[tokio::test]
async fn a_win_breaks_the_losing_streak() {
    let config = RiskConfig {
        circuit_breaker_enabled: true,
        max_consecutive_losses: Some(3),
        ..RiskConfig::default()
    };
    let rig = breaker_rig(vec![summary("s-1", "BTCUSDT")], config).await;

    let mut fills = Vec::new();
    fills.extend(losing_pair(1, 40));
    fills.extend(losing_pair(3, 30));
    // Winner, most recent but one: buy low sell high.
    fills.push(fill(5, OrderSide::Buy, 1.0, 100.0, 21));
    fills.push(fill(6, OrderSide::Sell, 1.0, 120.0, 20));
    fills.extend(losing_pair(7, 10));
    rig.trades.write().await.insert("s-1".to_string(), fills);

    // Streak from the head is 1, below the threshold of 3.
    assert!(
        rig.breaker
            .check_consecutive_losses("s-1", "default")
            .await
            .is_none()
    );
    assert!(!rig.breaker.is_active("default", Some("s-1")).await);
}

#[tokio::test]
async fn breaker_stays_quiet_when_disabled() {
    let config = RiskConfig {
        circuit_breaker_enabled: false,
        max_consecutive_losses: Some(1),
        ..RiskConfig::default()
    };
    let rig = breaker_rig(vec![summary("s-1", "BTCUSDT")], config).await;
    rig.trades
        .write()
        .await
        .insert("s-1".to_string(), losing_pair(1, 5).to_vec());

    assert!(
        rig.breaker
            .check_consecutive_losses("s-1", "default")
            .await
            .is_none()
    );
}

#[tokio::test]
async fn rapid_loss_trips_the_account_breaker_and_stops_everything() {
    let config = RiskConfig {
        circuit_breaker_enabled: true,
        rapid_loss_threshold_pct: Some(0.05),
        ..RiskConfig::default()
    };
    let rig = breaker_rig(
        vec![summary("s-1", "BTCUSDT"), summary("s-2", "ETHUSDT")],
        config,
    )
    .await;

    // A -60 USDT realized loss inside the rolling window against a
    // 1000 USDT balance: 6 % ≥ the 5 % threshold.
    let fills = vec![
        fill(1, OrderSide::Buy, 5.0, 110.0, 31),
        fill(2, OrderSide::Sell, 5.0, 98.0, 30),
    ];
    rig.trades.write().await.insert("s-1".to_string(), fills);

    let state = rig
        .breaker
        .check_rapid_loss("default")
        .await
        .expect("rapid loss breaker should trip");
    assert_eq!(state.breaker_type, BreakerType::RapidLoss);
    assert_eq!(state.scope, BreakerScope::Account);
    assert!(state.trigger_value >= 0.05);

    // Account scope stops every strategy on the account.
    let stopped = rig.stopper.stopped.lock().unwrap();
    let ids: Vec<&str> = stopped.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(stopped.len(), 2);
    assert!(ids.contains(&"s-1") && ids.contains(&"s-2"));
    drop(stopped);

    // Any strategy on the account now reports an active breaker.
    assert!(rig.breaker.is_active("default", None).await);
    assert!(rig.breaker.is_active("default", Some("s-2")).await);
}

#[tokio::test]
async fn profitable_windows_never_trip_rapid_loss() {
    let config = RiskConfig {
        circuit_breaker_enabled: true,
        rapid_loss_threshold_pct: Some(0.05),
        ..RiskConfig::default()
    };
    let rig = breaker_rig(vec![summary("s-1", "BTCUSDT")], config).await;

    let fills = vec![
        fill(1, OrderSide::Buy, 5.0, 100.0, 31),
        fill(2, OrderSide::Sell, 5.0, 130.0, 30),
    ];
    rig.trades.write().await.insert("s-1".to_string(), fills);

    assert!(rig.breaker.check_rapid_loss("default").await.is_none());
}

#[tokio::test]
async fn manual_resolve_resets_strategies_to_stopped() {
    let config = RiskConfig {
        circuit_breaker_enabled: true,
        max_consecutive_losses: Some(3),
        ..RiskConfig::default()
    };
    let rig = breaker_rig(vec![summary("s-1", "BTCUSDT")], config).await;

    let mut fills = Vec::new();
    fills.extend(losing_pair(1, 30));
    fills.extend(losing_pair(3, 20));
    fills.extend(losing_pair(5, 10));
    rig.trades.write().await.insert("s-1".to_string(), fills);
    rig.breaker
        .check_consecutive_losses("s-1", "default")
        .await
        .unwrap();

    let resolved = rig
        .breaker
        .resolve(BreakerType::ConsecutiveLosses, "default", Some("s-1"), true)
        .await;
    assert!(resolved);
    assert!(!rig.breaker.is_active("default", Some("s-1")).await);
    assert_eq!(rig.stopper.reset.lock().unwrap().as_slice(), &["s-1".to_string()]);
}

#[test]
fn expired_cooldowns_stop_holding() {
    use futrade::domain::breaker::BreakerState;

    let state = BreakerState {
        breaker_type: BreakerType::ConsecutiveLosses,
        scope: BreakerScope::Strategy,
        account_id: "default".to_string(),
        strategy_id: Some("s-1".to_string()),
        triggered_at: Utc::now() - ChronoDuration::hours(2),
        trigger_value: 3.0,
        threshold_value: 3.0,
        status: BreakerStatus::Active,
        cooldown_until: Some(Utc::now() - ChronoDuration::hours(1)),
    };
    assert!(!state.is_holding(Utc::now()));
    assert!(state.is_holding(Utc::now() - ChronoDuration::hours(1) - ChronoDuration::minutes(1)));
}
