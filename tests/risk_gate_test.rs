//! Risk gate behavior: exposure reservation under concurrency, loss caps,
//! reservation settlement.

use chrono::{Duration as ChronoDuration, Utc};
use futrade::application::risk::portfolio::{PortfolioRiskManager, ReservationStatus};
use futrade::domain::risk_config::RiskConfig;
use futrade::domain::strategy::{
    StrategyParams, StrategyStatus, StrategySummary, StrategyType, SummaryMeta,
};
use futrade::domain::types::{OrderFill, OrderSide, Signal, SignalAction};
use futrade::infrastructure::accounts::ClientManager;
use futrade::infrastructure::mock::MockExchange;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type SummaryHandle = Arc<RwLock<StrategySummary>>;
type StrategyMap = Arc<RwLock<HashMap<String, SummaryHandle>>>;
type TradeMap = Arc<RwLock<HashMap<String, Vec<OrderFill>>>>;

fn summary(id: &str, symbol: &str, fixed_amount: f64) -> StrategySummary {
    StrategySummary {
        id: id.to_string(),
        name: id.to_string(),
        symbol: symbol.to_string(),
        strategy_type: StrategyType::EmaScalping,
        status: StrategyStatus::Running,
        leverage: 5,
        risk_per_trade: 0.01,
        fixed_amount: Some(fixed_amount),
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

fn open_signal(symbol: &str) -> Signal {
    Signal {
        action: SignalAction::Buy,
        symbol: symbol.to_string(),
        price: Some(100.0),
        confidence: None,
        exit_reason: None,
        position_side: None,
        bar_close_time: Some(1),
    }
}

fn fill(order_id: i64, side: OrderSide, qty: f64, price: f64, leverage: u32) -> OrderFill {
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
        timestamp: Utc::now(),
        leverage: Some(leverage),
        position_side: None,
        exit_reason: None,
    }
}

async fn gate_with(
    summaries: Vec<StrategySummary>,
    config: RiskConfig,
) -> (Arc<PortfolioRiskManager>, StrategyMap, TradeMap, Arc<MockExchange>) {
    let strategies: StrategyMap = Arc::new(RwLock::new(HashMap::new()));
    for s in summaries {
        strategies
            .write()
            .await
            .insert(s.id.clone(), Arc::new(RwLock::new(s)));
    }
    let trades: TradeMap = Arc::new(RwLock::new(HashMap::new()));

    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(10_000.0);
    let clients = Arc::new(ClientManager::new());
    clients.inject_client("default", exchange.clone()).await;

    let gate = Arc::new(PortfolioRiskManager::new(
        strategies.clone(),
        trades.clone(),
        clients,
        None,
        0.0004,
        0.95,
    ));
    gate.set_account_config("default", Some(config)).await;
    (gate, strategies, trades, exchange)
}

#[tokio::test]
async fn simultaneous_orders_cannot_both_pass_the_exposure_cap() {
    // Two orders of 300 USDT exposure each against a 500 USDT cap: the
    // per-account mutex must let exactly one through.
    let config = RiskConfig {
        max_portfolio_exposure_usdt: Some(500.0),
        ..RiskConfig::default()
    };
    // fixed_amount 60 × leverage 5 = 300 USDT estimated exposure.
    let s1 = summary("s-1", "BTCUSDT", 60.0);
    let s2 = summary("s-2", "ETHUSDT", 60.0);
    let (gate, _, _, _) = gate_with(vec![s1.clone(), s2.clone()], config).await;

    let sig1 = open_signal("BTCUSDT");
    let sig2 = open_signal("ETHUSDT");
    let (d1, d2) = tokio::join!(
        gate.check_order_allowed(&sig1, &s1, "default", false),
        gate.check_order_allowed(&sig2, &s2, "default", false),
    );

    let allowed = [&d1, &d2].iter().filter(|d| d.allowed).count();
    assert_eq!(allowed, 1, "exactly one order may reserve: {:?} {:?}", d1, d2);
    let rejected = if d1.allowed { &d2 } else { &d1 };
    assert!(rejected.reason.contains("exposure"));

    assert!((gate.reserved_exposure("default").await - 300.0).abs() < 1e-9);
}

#[tokio::test]
async fn sequential_orders_respect_prior_reservations() {
    let config = RiskConfig {
        max_portfolio_exposure_usdt: Some(500.0),
        ..RiskConfig::default()
    };
    let s1 = summary("s-1", "BTCUSDT", 60.0);
    let s2 = summary("s-2", "ETHUSDT", 60.0);
    let (gate, _, _, _) = gate_with(vec![s1.clone(), s2.clone()], config).await;

    let d1 = gate
        .check_order_allowed(&open_signal("BTCUSDT"), &s1, "default", false)
        .await;
    assert!(d1.allowed);

    let d2 = gate
        .check_order_allowed(&open_signal("ETHUSDT"), &s2, "default", false)
        .await;
    assert!(!d2.allowed, "second 300 on top of reserved 300 exceeds 500");
}

#[tokio::test]
async fn release_frees_the_reserved_exposure() {
    let config = RiskConfig {
        max_portfolio_exposure_usdt: Some(500.0),
        ..RiskConfig::default()
    };
    let s1 = summary("s-1", "BTCUSDT", 60.0);
    let s2 = summary("s-2", "ETHUSDT", 60.0);
    let (gate, _, _, _) = gate_with(vec![s1.clone(), s2.clone()], config).await;

    assert!(
        gate.check_order_allowed(&open_signal("BTCUSDT"), &s1, "default", false)
            .await
            .allowed
    );
    gate.release_reservation("default", "s-1").await;
    assert_eq!(gate.reserved_exposure("default").await, 0.0);

    assert!(
        gate.check_order_allowed(&open_signal("ETHUSDT"), &s2, "default", false)
            .await
            .allowed
    );
}

#[tokio::test]
async fn confirm_replaces_estimate_with_executed_exposure() {
    let config = RiskConfig {
        max_portfolio_exposure_usdt: Some(500.0),
        ..RiskConfig::default()
    };
    let s1 = summary("s-1", "BTCUSDT", 60.0);
    let (gate, _, _, _) = gate_with(vec![s1.clone()], config).await;

    gate.check_order_allowed(&open_signal("BTCUSDT"), &s1, "default", false)
        .await;

    // Full fill: 0.55 × 100 × 5 = 275 actual.
    gate.confirm_exposure("default", "s-1", &fill(1, OrderSide::Buy, 0.55, 100.0, 5))
        .await;

    let reservations = gate.reservations_for("default").await;
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].status, ReservationStatus::Confirmed);
    assert!((reservations[0].reserved_exposure - 275.0).abs() < 1e-9);
    // Confirmed exposure is visible as the live position, not the ledger.
    assert_eq!(gate.reserved_exposure("default").await, 0.0);
}

#[tokio::test]
async fn partially_filled_orders_stay_in_the_ledger() {
    let config = RiskConfig {
        max_portfolio_exposure_usdt: Some(500.0),
        ..RiskConfig::default()
    };
    let s1 = summary("s-1", "BTCUSDT", 60.0);
    let (gate, _, _, _) = gate_with(vec![s1.clone()], config).await;

    gate.check_order_allowed(&open_signal("BTCUSDT"), &s1, "default", false)
        .await;

    // 0.1 × 100 × 5 = 50 executed of 300 reserved, status PARTIALLY_FILLED.
    let mut partial = fill(1, OrderSide::Buy, 0.1, 100.0, 5);
    partial.status = "PARTIALLY_FILLED".to_string();
    gate.confirm_exposure("default", "s-1", &partial).await;

    let reservations = gate.reservations_for("default").await;
    assert_eq!(reservations[0].status, ReservationStatus::Partial);
    assert!((gate.reserved_exposure("default").await - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn daily_loss_cap_blocks_entries_but_not_exits() {
    let config = RiskConfig {
        max_daily_loss_usdt: Some(100.0),
        ..RiskConfig::default()
    };
    let s1 = summary("s-1", "BTCUSDT", 60.0);
    let (gate, _, trades, _) = gate_with(vec![s1.clone()], config).await;

    // A realized -120 USDT day: buy 1.0 @ 220, sell 1.0 @ 100, no fees
    // needed for the sign.
    trades.write().await.insert(
        "s-1".to_string(),
        vec![
            fill(1, OrderSide::Buy, 1.0, 220.0, 5),
            fill(2, OrderSide::Sell, 1.0, 100.0, 5),
        ],
    );

    let entry = gate
        .check_order_allowed(&open_signal("BTCUSDT"), &s1, "default", false)
        .await;
    assert!(!entry.allowed);
    assert!(entry.reason.contains("Daily loss"));

    // Reduce-only exits stay allowed so positions can be flattened.
    let exit = gate
        .check_order_allowed(&open_signal("BTCUSDT"), &s1, "default", true)
        .await;
    assert!(exit.allowed);
}

#[tokio::test]
async fn old_losses_do_not_count_toward_today() {
    let config = RiskConfig {
        max_daily_loss_usdt: Some(100.0),
        ..RiskConfig::default()
    };
    let s1 = summary("s-1", "BTCUSDT", 60.0);
    let (gate, _, trades, _) = gate_with(vec![s1.clone()], config).await;

    let mut old_buy = fill(1, OrderSide::Buy, 1.0, 220.0, 5);
    let mut old_sell = fill(2, OrderSide::Sell, 1.0, 100.0, 5);
    old_buy.timestamp = Utc::now() - ChronoDuration::days(3);
    old_sell.timestamp = Utc::now() - ChronoDuration::days(3);
    trades
        .write()
        .await
        .insert("s-1".to_string(), vec![old_buy, old_sell]);

    let decision = gate
        .check_order_allowed(&open_signal("BTCUSDT"), &s1, "default", false)
        .await;
    assert!(decision.allowed, "stale losses must not trip the daily cap");
}

#[tokio::test]
async fn auto_reduce_returns_the_headroom_quantity() {
    let config = RiskConfig {
        max_portfolio_exposure_usdt: Some(500.0),
        auto_reduce_order_size: true,
        ..RiskConfig::default()
    };
    // 120 × 5 = 600 estimated, 100 over the cap.
    let s1 = summary("s-1", "BTCUSDT", 120.0);
    let (gate, _, _, _) = gate_with(vec![s1.clone()], config).await;

    let decision = gate
        .check_order_allowed(&open_signal("BTCUSDT"), &s1, "default", false)
        .await;
    assert!(decision.allowed);
    let adjusted = decision.adjusted_quantity.expect("auto-reduced quantity");
    // Headroom 500 / (100 × 5) = 1.0
    assert!((adjusted - 1.0).abs() < 1e-9);
    assert!((gate.reserved_exposure("default").await - 500.0).abs() < 1e-9);
}

#[tokio::test]
async fn real_exposure_counts_live_positions_with_leverage() {
    let config = RiskConfig {
        max_portfolio_exposure_usdt: Some(500.0),
        ..RiskConfig::default()
    };
    let mut holder = summary("s-1", "BTCUSDT", 60.0);
    holder.apply_position(futrade::domain::types::PositionSide::Long, 0.8, 100.0, 0.0);
    holder.current_price = Some(100.0);
    let s2 = summary("s-2", "ETHUSDT", 60.0);
    let (gate, _, _, _) = gate_with(vec![holder, s2.clone()], config).await;

    // 0.8 × 100 × 5 = 400 live; +300 estimated breaches 500.
    assert!((gate.current_exposure("default").await - 400.0).abs() < 1e-9);
    let decision = gate
        .check_order_allowed(&open_signal("ETHUSDT"), &s2, "default", false)
        .await;
    assert!(!decision.allowed);
}
