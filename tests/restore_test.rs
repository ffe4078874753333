//! Restart persistence: strategies persisted as running come back, stopped
//! ones stay stopped, and none are silently lost.

mod common;

use common::{request, signal, temp_db_url, wait_for, ScriptBook};
use futrade::application::engine::{Engine, EngineConfig};
use futrade::domain::ports::Notifier;
use futrade::domain::strategy::{StrategyStatus, StrategySummary};
use futrade::domain::types::SignalAction;
use futrade::infrastructure::accounts::ClientManager;
use futrade::infrastructure::mock::MockExchange;
use futrade::infrastructure::notify::LogNotifier;
use futrade::infrastructure::persistence::{Database, StateStore};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn store(db_url: &str, user_id: Uuid) -> Arc<StateStore> {
    let db = Database::new(db_url).await.expect("open test database");
    Arc::new(StateStore::new(db, user_id))
}

async fn engine_on(
    store: Arc<StateStore>,
    exchange: Arc<MockExchange>,
    scripts: &ScriptBook,
) -> Arc<Engine> {
    let clients = Arc::new(ClientManager::new());
    clients.inject_client("default", exchange).await;
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    Engine::with_evaluator_factory(
        EngineConfig::default(),
        clients,
        Some(store),
        None,
        notifier,
        scripts.factory(),
    )
}

fn seeded(summary: StrategySummary, status: StrategyStatus) -> StrategySummary {
    StrategySummary { status, ..summary }
}

#[tokio::test]
async fn running_strategies_are_relaunched_after_restart() {
    let db_url = temp_db_url("restore");
    let user_id = Uuid::new_v4();

    // Persist the pre-crash state directly: three running, one stopped.
    {
        let store = store(&db_url, user_id).await;
        let scripts = ScriptBook::new();
        let exchange = Arc::new(MockExchange::new());
        let engine = engine_on(store.clone(), exchange, &scripts).await;

        let mut ids = Vec::new();
        for symbol in ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"] {
            let summary = engine.register(request(symbol)).await.unwrap();
            ids.push(summary.id);
        }
        for id in &ids[..3] {
            let summary = engine.get_strategy(id).await.unwrap();
            store
                .upsert_strategy(&seeded(summary, StrategyStatus::Running))
                .await
                .unwrap();
        }
        // Process "crashes" here: tasks were never spawned, only the
        // persisted statuses survive.
    }

    // Fresh process: new engine over the same database.
    let store = store(&db_url, user_id).await;
    let scripts = ScriptBook::new();
    let exchange = Arc::new(MockExchange::new());
    for symbol in ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"] {
        exchange.set_price(symbol, 100.0);
    }
    let engine = engine_on(store, exchange, &scripts).await;

    engine.hydrate().await.unwrap();
    let (restored, errors) = engine.restore_running_strategies().await;
    assert_eq!(restored, 3);
    assert!(errors.is_empty(), "unexpected restore errors: {:?}", errors);

    let strategies = engine.list_strategies().await;
    assert_eq!(strategies.len(), 4);
    let running = strategies
        .iter()
        .filter(|s| s.status == StrategyStatus::Running)
        .count();
    let stopped = strategies
        .iter()
        .filter(|s| s.status == StrategyStatus::Stopped)
        .count();
    assert_eq!(running, 3);
    assert_eq!(stopped, 1);
    assert_eq!(engine.running_count().await, 3);

    // Parameters and symbols survived the restart unchanged.
    for summary in &strategies {
        assert_eq!(summary.leverage, 5);
        assert_eq!(summary.fixed_amount, Some(100.0));
    }

    for summary in strategies {
        if summary.status == StrategyStatus::Running {
            engine.stop(&summary.id).await.unwrap();
        }
    }
}

#[tokio::test]
async fn restores_beyond_the_cap_are_demoted_not_lost() {
    let db_url = temp_db_url("restore-cap");
    let user_id = Uuid::new_v4();

    {
        let store = store(&db_url, user_id).await;
        let scripts = ScriptBook::new();
        let engine = engine_on(store.clone(), Arc::new(MockExchange::new()), &scripts).await;
        for symbol in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            let summary = engine.register(request(symbol)).await.unwrap();
            let summary = engine.get_strategy(&summary.id).await.unwrap();
            store
                .upsert_strategy(&seeded(summary, StrategyStatus::Running))
                .await
                .unwrap();
        }
    }

    let store = store(&db_url, user_id).await;
    let scripts = ScriptBook::new();
    let exchange = Arc::new(MockExchange::new());
    let clients = Arc::new(ClientManager::new());
    clients.inject_client("default", exchange).await;
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let mut config = EngineConfig::default();
    config.max_concurrent = 2;
    let engine = Engine::with_evaluator_factory(
        config,
        clients,
        Some(store.clone()),
        None,
        notifier,
        scripts.factory(),
    );

    engine.hydrate().await.unwrap();
    let (restored, errors) = engine.restore_running_strategies().await;
    assert_eq!(restored, 2);
    assert_eq!(errors.len(), 1);

    // The overflow strategy was demoted to stopped and persisted that way.
    let persisted = store.load_strategies().await.unwrap();
    let stopped = persisted
        .iter()
        .filter(|s| s.status == StrategyStatus::Stopped)
        .count();
    assert_eq!(stopped, 1);

    for summary in engine.list_strategies().await {
        if summary.status == StrategyStatus::Running {
            engine.stop(&summary.id).await.unwrap();
        }
    }
}

#[tokio::test]
async fn stopped_by_risk_strategies_refuse_to_start_without_a_reset() {
    let db_url = temp_db_url("risk-stopped");
    let user_id = Uuid::new_v4();

    let store = store(&db_url, user_id).await;
    let scripts = ScriptBook::new();
    let engine = engine_on(store.clone(), Arc::new(MockExchange::new()), &scripts).await;

    let summary = engine.register(request("BTCUSDT")).await.unwrap();
    store
        .upsert_strategy(&seeded(
            engine.get_strategy(&summary.id).await.unwrap(),
            StrategyStatus::StoppedByRisk,
        ))
        .await
        .unwrap();

    // Fresh engine view over the persisted state.
    let engine = engine_on(store, Arc::new(MockExchange::new()), &scripts).await;
    engine.hydrate().await.unwrap();

    let err = engine.start(&summary.id).await.unwrap_err();
    assert!(matches!(
        err,
        futrade::domain::errors::EngineError::StoppedByRisk(_)
    ));

    // A stopped_by_risk strategy is also never auto-restored.
    let (restored, errors) = engine.restore_running_strategies().await;
    assert_eq!(restored, 0);
    assert!(errors.is_empty());
    assert_eq!(
        engine.get_strategy(&summary.id).await.unwrap().status,
        StrategyStatus::StoppedByRisk
    );
}

#[tokio::test]
async fn trades_survive_the_restart_through_the_store() {
    let db_url = temp_db_url("restore-trades");
    let user_id = Uuid::new_v4();
    let strategy_id;

    {
        let store = store(&db_url, user_id).await;
        let scripts = ScriptBook::new();
        scripts.set(
            "BTCUSDT",
            vec![signal("BTCUSDT", SignalAction::Buy, 40_000.0, 1)],
        );
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("BTCUSDT", 40_000.0);
        let engine = engine_on(store, exchange.clone(), &scripts).await;

        let summary = engine.register(request("BTCUSDT")).await.unwrap();
        strategy_id = summary.id.clone();
        engine.start(&summary.id).await.unwrap();

        let engine2 = engine.clone();
        let id = summary.id.clone();
        assert!(
            wait_for(
                || {
                    let engine = engine2.clone();
                    let id = id.clone();
                    async move {
                        engine
                            .get_trades(&id)
                            .await
                            .map(|t| !t.is_empty())
                            .unwrap_or(false)
                    }
                },
                Duration::from_secs(5),
            )
            .await
        );
        exchange.set_price("BTCUSDT", 40_400.0);
        engine.stop(&summary.id).await.unwrap();
    }

    let store = store(&db_url, user_id).await;
    let scripts = ScriptBook::new();
    let engine = engine_on(store, Arc::new(MockExchange::new()), &scripts).await;
    engine.hydrate().await.unwrap();

    let trades = engine.get_trades(&strategy_id).await.unwrap();
    assert_eq!(trades.len(), 2, "entry and manual close must be persisted");

    let stats = engine.calculate_strategy_stats(&strategy_id).await.unwrap();
    assert_eq!(stats.completed_trades, 1);
    assert!(stats.total_pnl > 0.0);
}
