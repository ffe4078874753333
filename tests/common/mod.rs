//! Shared fixtures for the integration tests: an engine wired to the mock
//! exchange and a symbol-keyed scripted evaluator factory.
#![allow(dead_code)]

use futrade::application::engine::{Engine, EngineConfig, EvaluatorFactory};
use futrade::domain::ports::{ExchangeApi, Notifier, SignalEvaluator};
use futrade::domain::strategy::{CreateStrategyRequest, StrategyParams, StrategyType};
use futrade::domain::types::{Signal, SignalAction};
use futrade::infrastructure::accounts::ClientManager;
use futrade::infrastructure::mock::{MockExchange, ScriptedEvaluator};
use futrade::infrastructure::notify::LogNotifier;
use futrade::infrastructure::persistence::StateStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Evaluator scripts keyed by symbol; each started strategy consumes its
/// symbol's script once.
#[derive(Clone, Default)]
pub struct ScriptBook {
    scripts: Arc<Mutex<HashMap<String, Vec<Signal>>>>,
}

impl ScriptBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: &str, script: Vec<Signal>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(symbol.to_string(), script);
    }

    pub fn factory(&self) -> EvaluatorFactory {
        let scripts = self.scripts.clone();
        Arc::new(
            move |_strategy_type: StrategyType,
                  symbol: &str,
                  _params: &StrategyParams,
                  _client: Arc<dyn ExchangeApi>|
                  -> anyhow::Result<Box<dyn SignalEvaluator>> {
                let script = scripts.lock().unwrap().remove(symbol).unwrap_or_default();
                Ok(Box::new(ScriptedEvaluator::new(symbol, script)))
            },
        )
    }
}

pub struct TestRig {
    pub engine: Arc<Engine>,
    pub exchange: Arc<MockExchange>,
    pub scripts: ScriptBook,
}

pub async fn rig_with(config: EngineConfig, store: Option<Arc<StateStore>>) -> TestRig {
    let exchange = Arc::new(MockExchange::new());
    let clients = Arc::new(ClientManager::new());
    clients.inject_client("default", exchange.clone()).await;

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let scripts = ScriptBook::new();
    let engine = Engine::with_evaluator_factory(
        config,
        clients,
        store,
        None,
        notifier,
        scripts.factory(),
    );

    TestRig {
        engine,
        exchange,
        scripts,
    }
}

pub async fn rig() -> TestRig {
    rig_with(EngineConfig::default(), None).await
}

pub fn request(symbol: &str) -> CreateStrategyRequest {
    let mut params = StrategyParams::default();
    params.interval_seconds = 1;
    CreateStrategyRequest {
        name: format!("test-{}", symbol),
        symbol: symbol.to_string(),
        strategy_type: StrategyType::EmaScalping,
        account_id: Some("default".to_string()),
        leverage: Some(5),
        risk_per_trade: 0.01,
        fixed_amount: Some(100.0),
        params,
    }
}

pub fn signal(symbol: &str, action: SignalAction, price: f64, bar: i64) -> Signal {
    Signal {
        action,
        symbol: symbol.to_string(),
        price: Some(price),
        confidence: Some(1.0),
        exit_reason: None,
        position_side: None,
        bar_close_time: Some(bar),
    }
}

/// Poll until the condition holds or the timeout elapses.
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Unique on-disk sqlite URL for store-backed tests.
pub fn temp_db_url(tag: &str) -> String {
    let path = std::env::temp_dir().join(format!(
        "futrade-test-{}-{}.db",
        tag,
        uuid::Uuid::new_v4()
    ));
    format!("sqlite://{}", path.display())
}
