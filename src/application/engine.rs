//! The strategy runtime: registration, lifecycle, the per-strategy tick
//! loop, dead-task reaping and restart restoration.
//!
//! One cooperative task per running strategy. Each tick follows a fixed
//! order: reconcile with the exchange, sync the evaluator, evaluate,
//! refresh the display price, check PnL thresholds, execute, sleep.
//! Reconcile-before-evaluate is what keeps an evaluator from opening a
//! position it already holds after a native TP/SL closed it between
//! ticks.

use crate::application::evaluators::EvaluatorRegistry;
use crate::application::executor::OrderExecutor;
use crate::application::risk::breaker::CircuitBreaker;
use crate::application::risk::portfolio::PortfolioRiskManager;
use crate::application::sizing::RiskSizer;
use crate::domain::errors::{EngineError, ExchangeError};
use crate::domain::matching::{CompletedTrade, match_completed_trades};
use crate::domain::ports::{
    BreakerEventSink, ExchangeApi, MetricStore, Notifier, SignalEvaluator, StrategyStopper,
};
use crate::domain::stats::{OverallStats, StrategyStats};
use crate::domain::strategy::{
    CreateStrategyRequest, StrategyParams, StrategyStatus, StrategySummary, StrategyType,
    SummaryMeta,
};
use crate::domain::types::{
    ExitReason, OrderFill, OrderSide, PositionSide, Signal, SignalAction,
};
use crate::infrastructure::accounts::ClientManager;
use crate::infrastructure::cache::CacheMirror;
use crate::infrastructure::notify::PnlAlerts;
use crate::infrastructure::persistence::StateStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type SummaryHandle = Arc<RwLock<StrategySummary>>;

/// Constructor map entry point; tests substitute scripted evaluators here.
pub type EvaluatorFactory = Arc<
    dyn Fn(
            StrategyType,
            &str,
            &StrategyParams,
            Arc<dyn ExchangeApi>,
        ) -> anyhow::Result<Box<dyn SignalEvaluator>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub fee_rate: f64,
    pub partial_fill_threshold: f64,
    /// Trailing raw trades loaded per strategy from the store.
    pub trade_history_limit: usize,
    pub pnl_profit_threshold: f64,
    pub pnl_loss_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            fee_rate: crate::domain::matching::DEFAULT_FEE_RATE,
            partial_fill_threshold: 0.95,
            trade_history_limit: 1000,
            pnl_profit_threshold: 50.0,
            pnl_loss_threshold: 50.0,
        }
    }
}

struct TaskEntry {
    handle: JoinHandle<()>,
    cancel: Arc<Notify>,
}

pub struct Engine {
    config: EngineConfig,
    clients: Arc<ClientManager>,
    store: Option<Arc<StateStore>>,
    cache: Option<Arc<CacheMirror>>,
    notifier: Arc<dyn Notifier>,
    strategies: Arc<RwLock<HashMap<String, SummaryHandle>>>,
    trades: Arc<RwLock<HashMap<String, Vec<OrderFill>>>>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    risk: Arc<PortfolioRiskManager>,
    breaker: Arc<CircuitBreaker>,
    pnl_alerts: PnlAlerts,
    evaluator_factory: EvaluatorFactory,
    /// Self-handle for spawning loop tasks from `&self` methods.
    self_ref: Weak<Engine>,
}

/// The narrow stopper handle given to the circuit breaker; keeps the
/// breaker free of any ownership of the scheduler.
struct EngineStopHandle {
    engine: Weak<Engine>,
}

#[async_trait]
impl StrategyStopper for EngineStopHandle {
    async fn stop_for_risk(&self, strategy_id: &str, reason: &str) -> anyhow::Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            anyhow::bail!("Engine is gone");
        };
        engine
            .shutdown_strategy(strategy_id, StrategyStatus::StoppedByRisk, reason, false)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("{}", e))
    }

    async fn reset_to_stopped(&self, strategy_id: &str) -> anyhow::Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            anyhow::bail!("Engine is gone");
        };
        let handle = engine.summary_handle(strategy_id).await?;
        {
            let mut summary = handle.write().await;
            if summary.status != StrategyStatus::StoppedByRisk {
                return Ok(());
            }
            summary.status = StrategyStatus::Stopped;
            summary.meta.pause_reason = None;
        }
        engine.persist_summary(&*handle.read().await).await;
        Ok(())
    }
}

fn default_evaluator_factory(
    strategy_type: StrategyType,
    symbol: &str,
    params: &StrategyParams,
    client: Arc<dyn ExchangeApi>,
) -> anyhow::Result<Box<dyn SignalEvaluator>> {
    EvaluatorRegistry::build(strategy_type, symbol, params, client)
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        clients: Arc<ClientManager>,
        store: Option<Arc<StateStore>>,
        cache: Option<Arc<CacheMirror>>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let factory: EvaluatorFactory = Arc::new(default_evaluator_factory);
        Self::with_evaluator_factory(config, clients, store, cache, notifier, factory)
    }

    pub fn with_evaluator_factory(
        config: EngineConfig,
        clients: Arc<ClientManager>,
        store: Option<Arc<StateStore>>,
        cache: Option<Arc<CacheMirror>>,
        notifier: Arc<dyn Notifier>,
        evaluator_factory: EvaluatorFactory,
    ) -> Arc<Self> {
        let strategies: Arc<RwLock<HashMap<String, SummaryHandle>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let trades: Arc<RwLock<HashMap<String, Vec<OrderFill>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let metrics: Option<Arc<dyn MetricStore>> = store
            .clone()
            .map(|s| s as Arc<dyn MetricStore>);
        let risk = Arc::new(PortfolioRiskManager::new(
            strategies.clone(),
            trades.clone(),
            clients.clone(),
            metrics,
            config.fee_rate,
            config.partial_fill_threshold,
        ));

        let events: Option<Arc<dyn BreakerEventSink>> = store
            .clone()
            .map(|s| s as Arc<dyn BreakerEventSink>);

        Arc::new_cyclic(|weak: &Weak<Engine>| {
            let stopper: Arc<dyn StrategyStopper> = Arc::new(EngineStopHandle {
                engine: weak.clone(),
            });
            let breaker = Arc::new(CircuitBreaker::new(
                strategies.clone(),
                trades.clone(),
                risk.clone(),
                stopper,
                events,
                config.fee_rate,
            ));

            Engine {
                pnl_alerts: PnlAlerts::new(config.pnl_profit_threshold, config.pnl_loss_threshold),
                config,
                clients,
                store,
                cache,
                notifier,
                strategies,
                trades,
                tasks: Mutex::new(HashMap::new()),
                risk,
                breaker,
                evaluator_factory,
                self_ref: weak.clone(),
            }
        })
    }

    pub fn risk(&self) -> &Arc<PortfolioRiskManager> {
        &self.risk
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    // --- Boot-time hydration ---

    /// Warm the in-memory view. The cache pre-fills quickly; the
    /// authoritative store then overwrites whatever it knows about.
    pub async fn hydrate(&self) -> anyhow::Result<()> {
        if let Some(cache) = &self.cache {
            let cached = cache.load_strategies().await;
            if !cached.is_empty() {
                info!("Warming {} strategies from cache", cached.len());
            }
            for summary in cached {
                let id = summary.id.clone();
                let trades = cache.load_trades(&id).await;
                self.strategies
                    .write()
                    .await
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(RwLock::new(summary)));
                if !trades.is_empty() {
                    self.trades.write().await.entry(id).or_insert(trades);
                }
            }
        }

        if let Some(store) = &self.store {
            let stored = store.load_strategies().await?;
            info!("Loaded {} strategies from the state store", stored.len());
            for summary in stored {
                let id = summary.id.clone();
                match store.load_trades(&id, self.config.trade_history_limit).await {
                    Ok(trades) if !trades.is_empty() => {
                        self.trades.write().await.insert(id.clone(), trades);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to load trades for {}: {}", id, e),
                }
                // Store wins over whatever the cache put here.
                self.strategies
                    .write()
                    .await
                    .insert(id, Arc::new(RwLock::new(summary)));
            }
        }
        Ok(())
    }

    /// Load account risk configs and strategy overrides into the gate.
    pub async fn load_risk_configs(&self) -> anyhow::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        for account_id in self.clients.list_accounts().await {
            match store.load_risk_config(&account_id, None).await {
                Ok(Some(config)) => {
                    self.risk
                        .set_account_config(&account_id, Some(config))
                        .await;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to load risk config for {}: {}", account_id, e),
            }
        }

        let ids: Vec<(String, String)> = {
            let strategies = self.strategies.read().await;
            let mut out = Vec::new();
            for handle in strategies.values() {
                let summary = handle.read().await;
                out.push((summary.id.clone(), summary.account_id.clone()));
            }
            out
        };
        for (strategy_id, account_id) in ids {
            if let Ok(Some(config)) = store.load_risk_config(&account_id, Some(&strategy_id)).await
            {
                self.risk
                    .set_strategy_config(&strategy_id, Some(config))
                    .await;
            }
        }
        Ok(())
    }

    /// Persist and install a risk config (account scope when
    /// `strategy_id` is `None`).
    pub async fn update_risk_config(
        &self,
        account_id: &str,
        strategy_id: Option<&str>,
        config: crate::domain::risk_config::RiskConfig,
    ) -> Result<(), EngineError> {
        if let Some(store) = &self.store {
            store
                .save_risk_config(account_id, strategy_id, &config)
                .await
                .map_err(|e| EngineError::Persistence {
                    reason: e.to_string(),
                })?;
        }
        match strategy_id {
            Some(id) => self.risk.set_strategy_config(id, Some(config)).await,
            None => self.risk.set_account_config(account_id, Some(config)).await,
        }
        Ok(())
    }

    // --- Registration / lifecycle ---

    pub async fn register(
        &self,
        payload: CreateStrategyRequest,
    ) -> Result<StrategySummary, EngineError> {
        let Some(leverage) = payload.leverage else {
            return Err(EngineError::InvalidLeverage {
                leverage: 0,
                reason: "leverage is required and must be explicitly provided to prevent the \
                         exchange default from applying"
                    .to_string(),
            });
        };
        if !(1..=50).contains(&leverage) {
            return Err(EngineError::InvalidLeverage {
                leverage,
                reason: "must be between 1 and 50".to_string(),
            });
        }
        if !(payload.risk_per_trade > 0.0 && payload.risk_per_trade <= 1.0) {
            return Err(EngineError::PositionSizing {
                symbol: payload.symbol.clone(),
                reason: format!(
                    "risk_per_trade {} outside (0, 1]",
                    payload.risk_per_trade
                ),
            });
        }
        if let Some(amount) = payload.fixed_amount
            && amount <= 0.0
        {
            return Err(EngineError::PositionSizing {
                symbol: payload.symbol.clone(),
                reason: format!("fixed_amount {} must be positive", amount),
            });
        }

        // No explicit account binds the strategy to the user's default one.
        let account_id = match payload.account_id.as_deref() {
            Some(account_id) => account_id.to_lowercase(),
            None => self.clients.default_account_id().await,
        };
        if !self.clients.account_exists(&account_id).await {
            let available = self.clients.list_accounts().await.join(", ");
            return Err(EngineError::UnknownAccount {
                account_id,
                available,
            });
        }

        let summary = StrategySummary {
            id: Uuid::new_v4().to_string(),
            name: payload.name,
            symbol: payload.symbol,
            strategy_type: payload.strategy_type,
            status: StrategyStatus::Stopped,
            leverage,
            risk_per_trade: payload.risk_per_trade,
            fixed_amount: payload.fixed_amount,
            params: payload.params,
            account_id,
            created_at: Utc::now(),
            last_signal: None,
            entry_price: None,
            current_price: None,
            position_size: 0.0,
            unrealized_pnl: 0.0,
            position_side: None,
            meta: SummaryMeta::default(),
        };

        if let Some(store) = &self.store {
            store
                .upsert_strategy(&summary)
                .await
                .map_err(|e| EngineError::Persistence {
                    reason: e.to_string(),
                })?;
        }
        if let Some(cache) = &self.cache {
            cache.save_strategy(&summary).await;
        }

        self.strategies
            .write()
            .await
            .insert(summary.id.clone(), Arc::new(RwLock::new(summary.clone())));

        info!(
            "Registered strategy {} ({}) with explicit leverage {}x for {} on account '{}'",
            summary.id, summary.strategy_type, summary.leverage, summary.symbol, summary.account_id
        );
        Ok(summary)
    }

    pub async fn start(&self, strategy_id: &str) -> Result<StrategySummary, EngineError> {
        self.start_internal(strategy_id, "Strategy started manually")
            .await
    }

    async fn start_internal(
        &self,
        strategy_id: &str,
        reason: &str,
    ) -> Result<StrategySummary, EngineError> {
        let handle = self.summary_handle(strategy_id).await?;
        let (account_id, symbol, status, strategy_type, params) = {
            let summary = handle.read().await;
            (
                summary.account_id.clone(),
                summary.symbol.clone(),
                summary.status,
                summary.strategy_type,
                summary.params.clone(),
            )
        };

        // A breaker inside its cooldown refuses the start outright; once
        // past cooldown the stopped_by_risk status still demands a manual
        // reset.
        if let Some(state) = self.breaker.active_state(&account_id, Some(strategy_id)).await {
            return Err(EngineError::CircuitBreakerActive {
                scope: state
                    .strategy_id
                    .clone()
                    .unwrap_or_else(|| state.account_id.clone()),
                cooldown_until: state
                    .cooldown_until
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            });
        }
        if status == StrategyStatus::StoppedByRisk {
            return Err(EngineError::StoppedByRisk(strategy_id.to_string()));
        }

        self.cleanup_dead_tasks().await;

        let mut tasks = self.tasks.lock().await;
        if tasks.len() >= self.config.max_concurrent {
            return Err(EngineError::MaxConcurrentStrategies {
                current: tasks.len(),
                max_allowed: self.config.max_concurrent,
            });
        }
        if let Some(entry) = tasks.get(strategy_id) {
            if !entry.handle.is_finished() {
                return Err(EngineError::StrategyAlreadyRunning(strategy_id.to_string()));
            }
            tasks.remove(strategy_id);
        }
        // Two live loops on one (account, symbol) would fight over the same
        // exchange position during reconcile.
        {
            let strategies = self.strategies.read().await;
            for (other_id, entry) in tasks.iter() {
                if entry.handle.is_finished() {
                    continue;
                }
                if let Some(other) = strategies.get(other_id) {
                    let other = other.read().await;
                    if other.account_id == account_id && other.symbol == symbol {
                        return Err(EngineError::SymbolConflict {
                            symbol,
                            strategy_id: other_id.clone(),
                        });
                    }
                }
            }
        }

        let client = self.clients.get_client(&account_id).await?;
        let evaluator = (self.evaluator_factory)(strategy_type, &symbol, &params, client.clone())
            .map_err(|e| EngineError::PositionSizing {
                symbol: symbol.clone(),
                reason: format!("evaluator construction failed: {}", e),
            })?;

        {
            let mut summary = handle.write().await;
            summary.status = StrategyStatus::Running;
        }
        // Store first (source of truth), cache only after it succeeded.
        if let Some(store) = &self.store {
            if let Err(e) = store
                .update_strategy_status(strategy_id, StrategyStatus::Running)
                .await
            {
                let mut summary = handle.write().await;
                summary.status = status;
                return Err(EngineError::Persistence {
                    reason: format!("failed to persist running status: {}", e),
                });
            }
        }
        if let Some(cache) = &self.cache {
            cache.save_strategy(&*handle.read().await).await;
        }

        let engine = self
            .self_ref
            .upgrade()
            .expect("engine methods are only reachable through the owning Arc");
        let cancel = Arc::new(Notify::new());
        let loop_handle = tokio::spawn(Self::run_loop(
            engine,
            handle.clone(),
            evaluator,
            client,
            cancel.clone(),
        ));
        tasks.insert(
            strategy_id.to_string(),
            TaskEntry {
                handle: loop_handle,
                cancel,
            },
        );
        drop(tasks);

        let summary = handle.read().await.clone();
        info!(
            "Strategy STARTED: {} ({}) | Symbol: {} | Type: {} | Leverage: {}x | Account: {}",
            summary.id,
            summary.name,
            summary.symbol,
            summary.strategy_type,
            summary.leverage,
            summary.account_id
        );
        self.notifier.notify_strategy_started(&summary, reason).await;
        Ok(summary)
    }

    pub async fn stop(&self, strategy_id: &str) -> Result<StrategySummary, EngineError> {
        self.shutdown_strategy(strategy_id, StrategyStatus::Stopped, "Manual stop", true)
            .await
    }

    /// Shared teardown for manual stops and breaker stops: cancel native
    /// TP/SL, flatten the position, record the closing fill, cancel the
    /// task, persist the final status.
    async fn shutdown_strategy(
        &self,
        strategy_id: &str,
        target_status: StrategyStatus,
        reason: &str,
        evaluate_breaker: bool,
    ) -> Result<StrategySummary, EngineError> {
        let handle = self.summary_handle(strategy_id).await?;
        let (account_id, symbol) = {
            let summary = handle.read().await;
            (summary.account_id.clone(), summary.symbol.clone())
        };
        let final_pnl = {
            let summary = handle.read().await;
            if summary.has_position() {
                Some(summary.unrealized_pnl)
            } else {
                None
            }
        };

        // Each cleanup step is individually guarded; a failed step never
        // prevents the stop itself.
        match self.clients.get_client(&account_id).await {
            Ok(client) => {
                if let Err(e) = self.cancel_tp_sl_orders(&handle, client.as_ref()).await {
                    warn!("[{}] Error cancelling TP/SL orders: {}", strategy_id, e);
                }

                match client.close_position(&symbol).await {
                    Ok(Some(mut fill)) => {
                        info!(
                            "[{}] Position CLOSED (reason: MANUAL/STOP): {} {} qty={} @ {:.8}",
                            strategy_id,
                            fill.side,
                            fill.symbol,
                            fill.executed_qty,
                            fill.effective_price()
                        );
                        fill.exit_reason = Some(ExitReason::Manual);
                        self.record_trade(strategy_id, &account_id, fill, evaluate_breaker)
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("[{}] Error closing position on stop: {}", strategy_id, e)
                    }
                }
            }
            Err(e) => warn!("[{}] No client available on stop: {}", strategy_id, e),
        }

        if let Some(entry) = self.tasks.lock().await.remove(strategy_id) {
            entry.cancel.notify_one();
        }

        {
            let mut summary = handle.write().await;
            summary.status = target_status;
            summary.clear_position();
            if target_status == StrategyStatus::StoppedByRisk {
                summary.meta.pause_reason = Some(reason.to_string());
            }
        }
        self.persist_summary(&*handle.read().await).await;

        self.risk.release_reservation(&account_id, strategy_id).await;
        self.pnl_alerts.forget(strategy_id).await;

        let summary = handle.read().await.clone();
        info!(
            "Strategy STOPPED: {} ({}) | Symbol: {} | Account: {} | Status: {} | Reason: {}",
            summary.id, summary.name, summary.symbol, summary.account_id, summary.status, reason
        );
        self.notifier
            .notify_strategy_stopped(&summary, reason, final_pnl)
            .await;
        Ok(summary)
    }

    pub async fn delete(&self, strategy_id: &str) -> Result<(), EngineError> {
        let handle = self.summary_handle(strategy_id).await?;
        let running = handle.read().await.status == StrategyStatus::Running;

        if running
            && let Err(e) = self.stop(strategy_id).await
        {
            warn!("Error stopping strategy {} before deletion: {}", strategy_id, e);
        }

        if let Some(store) = &self.store {
            store
                .delete_strategy(strategy_id)
                .await
                .map_err(|e| EngineError::Persistence {
                    reason: e.to_string(),
                })?;
        }
        if let Some(cache) = &self.cache {
            cache.delete_strategy(strategy_id).await;
        }

        self.strategies.write().await.remove(strategy_id);
        self.trades.write().await.remove(strategy_id);
        self.tasks.lock().await.remove(strategy_id);
        self.risk.set_strategy_config(strategy_id, None).await;

        info!("Strategy {} deleted", strategy_id);
        Ok(())
    }

    /// Replace a stopped strategy's parameters, recording the change in
    /// the parameter history. Running strategies must be stopped first so
    /// the live evaluator never sees a half-applied config.
    pub async fn update_strategy_params(
        &self,
        strategy_id: &str,
        new_params: StrategyParams,
    ) -> Result<StrategySummary, EngineError> {
        let handle = self.summary_handle(strategy_id).await?;
        let old_params = {
            let summary = handle.read().await;
            if summary.status == StrategyStatus::Running {
                return Err(EngineError::StrategyAlreadyRunning(strategy_id.to_string()));
            }
            summary.params.clone()
        };

        {
            let mut summary = handle.write().await;
            summary.params = new_params.clone();
        }
        self.persist_summary(&*handle.read().await).await;

        if let Some(store) = &self.store
            && let Err(e) = store
                .record_parameter_change(
                    strategy_id,
                    &old_params,
                    &new_params,
                    "manual",
                    "applied",
                    None,
                    None,
                )
                .await
        {
            warn!("Failed to record parameter change for {}: {}", strategy_id, e);
        }

        Ok(handle.read().await.clone())
    }

    // --- Queries ---

    pub async fn list_strategies(&self) -> Vec<StrategySummary> {
        let strategies = self.strategies.read().await;
        let mut out = Vec::with_capacity(strategies.len());
        for handle in strategies.values() {
            out.push(handle.read().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn get_strategy(&self, strategy_id: &str) -> Result<StrategySummary, EngineError> {
        let handle = self.summary_handle(strategy_id).await?;
        let summary = handle.read().await.clone();
        Ok(summary)
    }

    pub async fn get_trades(&self, strategy_id: &str) -> Result<Vec<OrderFill>, EngineError> {
        self.summary_handle(strategy_id).await?;

        if let Some(trades) = self.trades.read().await.get(strategy_id) {
            return Ok(trades.clone());
        }
        if let Some(store) = &self.store {
            match store
                .load_trades(strategy_id, self.config.trade_history_limit)
                .await
            {
                Ok(trades) => {
                    self.trades
                        .write()
                        .await
                        .insert(strategy_id.to_string(), trades.clone());
                    return Ok(trades);
                }
                Err(e) => warn!("Failed to load trades for {}: {}", strategy_id, e),
            }
        }
        Ok(Vec::new())
    }

    pub async fn completed_trades(
        &self,
        strategy_id: &str,
    ) -> Result<Vec<CompletedTrade>, EngineError> {
        let fills = self.get_trades(strategy_id).await?;
        Ok(match_completed_trades(&fills, self.config.fee_rate))
    }

    pub async fn calculate_strategy_stats(
        &self,
        strategy_id: &str,
    ) -> Result<StrategyStats, EngineError> {
        let summary = self.get_strategy(strategy_id).await?;
        let fills = self.get_trades(strategy_id).await?;
        let completed = match_completed_trades(&fills, self.config.fee_rate);

        let total_pnl: f64 = completed.iter().map(|t| t.net_pnl).sum();
        let winning = completed.iter().filter(|t| t.net_pnl > 0.0).count();
        let losing = completed.iter().filter(|t| t.net_pnl < 0.0).count();
        let win_rate = if completed.is_empty() {
            0.0
        } else {
            winning as f64 / completed.len() as f64 * 100.0
        };
        let avg_profit = if completed.is_empty() {
            0.0
        } else {
            total_pnl / completed.len() as f64
        };
        let largest_win = completed.iter().map(|t| t.net_pnl).fold(0.0, f64::max);
        let largest_loss = completed.iter().map(|t| t.net_pnl).fold(0.0, f64::min);
        let last_trade_at = fills.iter().map(|t| t.timestamp).max();

        Ok(StrategyStats {
            strategy_id: summary.id,
            strategy_name: summary.name,
            symbol: summary.symbol,
            total_trades: fills.len(),
            completed_trades: completed.len(),
            total_pnl,
            win_rate,
            winning_trades: winning,
            losing_trades: losing,
            avg_profit_per_trade: avg_profit,
            largest_win,
            largest_loss,
            created_at: summary.created_at,
            last_trade_at,
        })
    }

    pub async fn calculate_overall_stats(&self) -> OverallStats {
        let summaries = self.list_strategies().await;
        let mut all = Vec::new();
        for summary in &summaries {
            match self.calculate_strategy_stats(&summary.id).await {
                Ok(stats) => all.push(stats),
                Err(e) => warn!("Error calculating stats for {}: {}", summary.id, e),
            }
        }

        let active = summaries
            .iter()
            .filter(|s| s.status == StrategyStatus::Running)
            .count();
        let total_trades: usize = all.iter().map(|s| s.total_trades).sum();
        let completed: usize = all.iter().map(|s| s.completed_trades).sum();
        let total_pnl: f64 = all.iter().map(|s| s.total_pnl).sum();
        let winning: usize = all.iter().map(|s| s.winning_trades).sum();
        let losing: usize = all.iter().map(|s| s.losing_trades).sum();
        let win_rate = if winning + losing > 0 {
            winning as f64 / (winning + losing) as f64 * 100.0
        } else {
            0.0
        };

        let best = all
            .iter()
            .max_by(|a, b| a.total_pnl.total_cmp(&b.total_pnl))
            .map(|s| s.strategy_name.clone());
        let worst = all
            .iter()
            .min_by(|a, b| a.total_pnl.total_cmp(&b.total_pnl))
            .map(|s| s.strategy_name.clone());

        OverallStats {
            total_strategies: summaries.len(),
            active_strategies: active,
            total_trades,
            completed_trades: completed,
            total_pnl,
            win_rate,
            winning_trades: winning,
            losing_trades: losing,
            avg_profit_per_trade: if completed > 0 {
                total_pnl / completed as f64
            } else {
                0.0
            },
            best_performing_strategy: best,
            worst_performing_strategy: worst,
        }
    }

    // --- Supervision ---

    /// Restart every strategy persisted as running. Strategies that cannot
    /// be restarted are demoted to stopped with a logged reason; none are
    /// silently lost.
    pub async fn restore_running_strategies(&self) -> (usize, Vec<String>) {
        let candidates: Vec<String> = {
            let strategies = self.strategies.read().await;
            let tasks = self.tasks.lock().await;
            let mut out = Vec::new();
            for (id, handle) in strategies.iter() {
                if handle.read().await.status == StrategyStatus::Running && !tasks.contains_key(id)
                {
                    out.push(id.clone());
                }
            }
            out
        };

        if candidates.is_empty() {
            info!("No running strategies to restore");
        } else {
            info!("Restoring {} running strategies after restart", candidates.len());
        }

        let mut restored = 0usize;
        let mut errors = Vec::new();
        for strategy_id in candidates {
            match self
                .start_internal(&strategy_id, "Restored after server restart")
                .await
            {
                Ok(_) => restored += 1,
                Err(e) => {
                    warn!(
                        "Cannot restore strategy {}: {}. Demoting to stopped.",
                        strategy_id, e
                    );
                    errors.push(format!("{}: {}", strategy_id, e));
                    if let Ok(handle) = self.summary_handle(&strategy_id).await {
                        handle.write().await.status = StrategyStatus::Stopped;
                        self.persist_summary(&*handle.read().await).await;
                    }
                }
            }
        }

        if let Some(store) = &self.store {
            let payload = serde_json::json!({
                "restored": restored,
                "errors": errors,
            });
            if let Err(e) = store.record_system_event("server_restart", payload).await {
                warn!("Failed to record restart event: {}", e);
            }
        }
        self.notifier.notify_server_restart(restored, &errors).await;
        (restored, errors)
    }

    /// Remove finished tasks; a strategy still marked running whose task
    /// died is flipped to error and persisted.
    pub async fn cleanup_dead_tasks(&self) {
        let dead: Vec<String> = {
            let mut tasks = self.tasks.lock().await;
            let dead: Vec<String> = tasks
                .iter()
                .filter(|(_, entry)| entry.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &dead {
                tasks.remove(id);
            }
            dead
        };

        for strategy_id in dead {
            debug!("Cleaned up dead task for strategy {}", strategy_id);
            let Ok(handle) = self.summary_handle(&strategy_id).await else {
                continue;
            };
            let was_running = {
                let mut summary = handle.write().await;
                if summary.status == StrategyStatus::Running {
                    summary.status = StrategyStatus::Error;
                    true
                } else {
                    false
                }
            };
            if was_running {
                warn!(
                    "Strategy {} task completed unexpectedly; marking as error",
                    strategy_id
                );
                self.persist_summary(&*handle.read().await).await;
            }
        }
    }

    pub fn spawn_dead_task_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self
            .self_ref
            .upgrade()
            .expect("engine methods are only reachable through the owning Arc");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.cleanup_dead_tasks().await;
            }
        })
    }

    /// Periodic account-level watcher for the rapid-loss breaker, so it
    /// also fires while no strategy happens to complete trades.
    pub fn spawn_breaker_watcher(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self
            .self_ref
            .upgrade()
            .expect("engine methods are only reachable through the owning Arc");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for account_id in engine.clients.list_accounts().await {
                    engine.breaker.check_rapid_loss(&account_id).await;
                }
            }
        })
    }

    pub async fn running_count(&self) -> usize {
        let tasks = self.tasks.lock().await;
        tasks
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    // --- Internals ---

    async fn summary_handle(&self, strategy_id: &str) -> Result<SummaryHandle, EngineError> {
        {
            let strategies = self.strategies.read().await;
            if let Some(handle) = strategies.get(strategy_id) {
                return Ok(handle.clone());
            }
        }
        // Lazily pull from the store in case another process registered it.
        if let Some(store) = &self.store
            && let Ok(Some(summary)) = store.load_strategy(strategy_id).await
        {
            let handle = Arc::new(RwLock::new(summary));
            self.strategies
                .write()
                .await
                .insert(strategy_id.to_string(), handle.clone());
            return Ok(handle);
        }
        Err(EngineError::StrategyNotFound(strategy_id.to_string()))
    }

    /// Full summary persistence: store first, cache only after success.
    async fn persist_summary(&self, summary: &StrategySummary) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_strategy(summary).await {
                error!(
                    "Failed to persist strategy {}: {}. Cache not updated to prevent divergence.",
                    summary.id, e
                );
                return;
            }
        }
        if let Some(cache) = &self.cache {
            cache.save_strategy(summary).await;
        }
    }

    async fn persist_meta(&self, summary: &StrategySummary) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_strategy_meta(&summary.id, &summary.meta).await {
                warn!("Failed to persist meta for {}: {}", summary.id, e);
                return;
            }
        }
        if let Some(cache) = &self.cache {
            cache.save_strategy(summary).await;
        }
    }

    /// Append a fill to history, persist it, mirror it, rematerialize the
    /// completed-trade view and let the breaker look at the new history.
    async fn record_trade(
        &self,
        strategy_id: &str,
        account_id: &str,
        fill: OrderFill,
        evaluate_breaker: bool,
    ) {
        let all_fills = {
            let mut trades = self.trades.write().await;
            let list = trades.entry(strategy_id.to_string()).or_default();
            list.push(fill.clone());
            list.clone()
        };

        let mut store_ok = true;
        if let Some(store) = &self.store {
            if let Err(e) = store.save_trade(strategy_id, &fill).await {
                warn!("Failed to persist trade for {}: {}", strategy_id, e);
                store_ok = false;
            } else {
                let completed = match_completed_trades(&all_fills, self.config.fee_rate);
                if let Err(e) = store.replace_completed_trades(strategy_id, &completed).await {
                    warn!(
                        "Failed to materialize completed trades for {}: {}",
                        strategy_id, e
                    );
                }
            }
        }
        if store_ok && let Some(cache) = &self.cache {
            cache.save_trades(strategy_id, &all_fills).await;
        }

        info!(
            "[{}] Tracked trade: {} {} orderId={} status={} qty={} @ {:.8} (exit_reason: {})",
            strategy_id,
            fill.side,
            fill.symbol,
            fill.order_id,
            fill.status,
            fill.executed_qty,
            fill.effective_price(),
            fill.exit_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "N/A".to_string())
        );

        if evaluate_breaker {
            self.breaker.evaluate(strategy_id, account_id).await;
        }
    }

    // --- The per-strategy loop ---

    async fn run_loop(
        engine: Arc<Engine>,
        handle: SummaryHandle,
        mut evaluator: Box<dyn SignalEvaluator>,
        client: Arc<dyn ExchangeApi>,
        cancel: Arc<Notify>,
    ) {
        let (strategy_id, account_id) = {
            let summary = handle.read().await;
            (summary.id.clone(), summary.account_id.clone())
        };
        info!("Starting loop for {} (account: {})", strategy_id, account_id);

        let mut dedup: HashSet<(i64, SignalAction)> = HashSet::new();

        loop {
            // The tick future borrows the evaluator, so it lives in its own
            // scope: cancellation mid-tick drops it before teardown runs.
            let outcome = {
                let tick = engine.tick(&handle, &mut evaluator, &client, &mut dedup);
                tokio::select! {
                    _ = cancel.notified() => None,
                    result = tick => Some(result),
                }
            };

            let interval = match outcome {
                None => {
                    evaluator.teardown().await;
                    info!("Strategy CANCELLED: {} | Reason: task cancelled", strategy_id);
                    break;
                }
                Some(Ok(interval)) => interval,
                Some(Err(e)) => {
                    // Top-level catch: this task dies, others continue.
                    error!(
                        "Strategy FAILED: {} (account {}) | Error: {}",
                        strategy_id, account_id, e
                    );
                    {
                        let mut summary = handle.write().await;
                        summary.status = StrategyStatus::Error;
                    }
                    engine.persist_summary(&*handle.read().await).await;
                    let summary = handle.read().await.clone();
                    engine
                        .notifier
                        .notify_strategy_error(&summary, &e.to_string())
                        .await;
                    evaluator.teardown().await;
                    break;
                }
            };

            let cancelled = tokio::select! {
                _ = cancel.notified() => true,
                _ = tokio::time::sleep(interval) => false,
            };
            if cancelled {
                evaluator.teardown().await;
                info!("Strategy CANCELLED: {} | Reason: task cancelled", strategy_id);
                break;
            }
        }

        // Always drop the task entry so dead tasks never count toward the
        // concurrency cap.
        engine.tasks.lock().await.remove(&strategy_id);
        debug!("Removed strategy {} from active tasks", strategy_id);
    }

    /// One tick: reconcile → sync → evaluate → display price → PnL alert →
    /// execute. Returns the sleep interval for this strategy.
    async fn tick(
        &self,
        handle: &SummaryHandle,
        evaluator: &mut Box<dyn SignalEvaluator>,
        client: &Arc<dyn ExchangeApi>,
        dedup: &mut HashSet<(i64, SignalAction)>,
    ) -> anyhow::Result<Duration> {
        // 1) Sync the summary from exchange reality.
        self.reconcile_position(handle, client.as_ref()).await;

        let (strategy_id, account_id, symbol, interval_seconds) = {
            let summary = handle.read().await;
            (
                summary.id.clone(),
                summary.account_id.clone(),
                summary.symbol.clone(),
                summary.params.interval_seconds,
            )
        };
        self.risk
            .reconcile_reservations(&account_id, &strategy_id)
            .await;

        // 2) Push reconciled state into the evaluator before it decides.
        {
            let summary = handle.read().await;
            evaluator.sync_position_state(summary.position_side, summary.entry_price);
        }

        // 3) Evaluate on synced state.
        let signal = evaluator.evaluate().await?;
        {
            let mut summary = handle.write().await;
            summary.last_signal = Some(signal.action);
        }
        info!(
            "[{}] Signal: {} | Symbol: {} | Price: {:?} | Exit reason: {:?}",
            strategy_id, signal.action, signal.symbol, signal.price, signal.exit_reason
        );

        // 4) Display price refresh, never critical.
        if let Ok(price) = client.get_price(&symbol).await {
            handle.write().await.current_price = Some(price);
        }

        // 5) Unrealized-PnL threshold notification.
        {
            let summary = handle.read().await;
            if summary.has_position() {
                self.pnl_alerts
                    .check(&summary, summary.unrealized_pnl, &self.notifier)
                    .await;
            }
        }

        // 6) Execute the signal. Risk refusals skip this tick only.
        if signal.action != SignalAction::Hold {
            match self
                .execute_signal(handle, evaluator, client, &signal, dedup)
                .await
            {
                Ok(()) => {}
                Err(
                    e @ (EngineError::RiskLimitExceeded { .. }
                    | EngineError::CircuitBreakerActive { .. }
                    | EngineError::DrawdownLimitExceeded { .. }),
                ) => {
                    info!("[{}] Order skipped by risk gate: {}", strategy_id, e);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            debug!("[{}] HOLD signal, no execution", strategy_id);
        }

        Ok(Duration::from_secs(interval_seconds))
    }

    /// Overwrite the summary's position view with the exchange's. Detects
    /// exchange-side TP/SL exits between ticks, books the closing fill and
    /// clears the native-order metadata.
    async fn reconcile_position(&self, handle: &SummaryHandle, client: &dyn ExchangeApi) {
        let (strategy_id, account_id, symbol) = {
            let summary = handle.read().await;
            (
                summary.id.clone(),
                summary.account_id.clone(),
                summary.symbol.clone(),
            )
        };

        let position = match client.get_open_position(&symbol).await {
            Ok(position) => position,
            Err(e) => {
                debug!("[{}] Failed to fetch position: {}", strategy_id, e);
                // Fall back to marking PnL from the last known prices.
                let mut summary = handle.write().await;
                if let (Some(entry), Some(current)) =
                    (summary.entry_price, summary.current_price)
                    && summary.has_position()
                {
                    summary.unrealized_pnl = match summary.position_side {
                        Some(PositionSide::Short) => {
                            (entry - current) * summary.position_size
                        }
                        _ => (current - entry) * summary.position_size,
                    };
                }
                return;
            }
        };

        match position {
            Some(p) if p.size() > 0.0 => {
                let mut summary = handle.write().await;
                if let Some(side) = p.side() {
                    summary.apply_position(side, p.size(), p.entry_price, p.unrealized_pnl);
                }
                match p.mark_price {
                    Some(mark) => summary.current_price = Some(mark),
                    None => {
                        drop(summary);
                        if let Ok(price) = client.get_price(&symbol).await {
                            handle.write().await.current_price = Some(price);
                        }
                    }
                }
            }
            _ => {
                let (had_position, prior_side, prior_size, meta) = {
                    let summary = handle.read().await;
                    (
                        summary.has_position(),
                        summary.position_side,
                        summary.position_size,
                        summary.meta.tp_sl_orders,
                    )
                };
                if !had_position {
                    return;
                }

                // We thought we held a position and the exchange says flat:
                // a native TP/SL (or an external close) beat us to it.
                if !meta.is_empty() {
                    let open_ids: HashSet<i64> = match client.get_open_orders(&symbol).await {
                        Ok(orders) => orders.iter().map(|o| o.order_id).collect(),
                        Err(e) => {
                            info!(
                                "[{}] Position closed (unable to verify TP/SL fill): {}",
                                strategy_id, e
                            );
                            HashSet::new()
                        }
                    };
                    let tp_filled = meta
                        .tp_order_id
                        .map(|id| !open_ids.contains(&id))
                        .unwrap_or(false);
                    let sl_filled = meta
                        .sl_order_id
                        .map(|id| !open_ids.contains(&id))
                        .unwrap_or(false);

                    let (exit_reason, exit_order_id, exit_price) = if tp_filled && !sl_filled {
                        (ExitReason::TakeProfit, meta.tp_order_id, meta.tp_price)
                    } else if sl_filled && !tp_filled {
                        (ExitReason::StopLoss, meta.sl_order_id, meta.sl_price)
                    } else {
                        (ExitReason::Unknown, meta.tp_order_id.or(meta.sl_order_id), None)
                    };
                    info!(
                        "[{}] Position CLOSED via exchange-side {} order (TP filled: {}, SL filled: {})",
                        strategy_id, exit_reason, tp_filled, sl_filled
                    );

                    // The sibling order is still resting; cancel it.
                    for order_id in [meta.tp_order_id, meta.sl_order_id]
                        .into_iter()
                        .flatten()
                        .filter(|id| open_ids.contains(id))
                    {
                        if let Err(e) = client.cancel_order(&symbol, order_id).await {
                            debug!(
                                "[{}] Error cancelling sibling order {}: {}",
                                strategy_id, order_id, e
                            );
                        }
                    }

                    // Book the exchange-side close so realized PnL and the
                    // breakers see it.
                    if let (Some(side), Some(order_id)) = (prior_side, exit_order_id) {
                        let price = match exit_price {
                            Some(price) => price,
                            None => client.get_price(&symbol).await.unwrap_or(0.0),
                        };
                        if price > 0.0 && prior_size > 0.0 {
                            let leverage = handle.read().await.leverage;
                            let fill = OrderFill {
                                symbol: symbol.clone(),
                                order_id,
                                status: "FILLED".to_string(),
                                side: side.closing_side(),
                                price,
                                avg_price: Some(price),
                                executed_qty: prior_size,
                                commission: None,
                                commission_asset: None,
                                timestamp: Utc::now(),
                                leverage: Some(leverage),
                                position_side: None,
                                exit_reason: Some(exit_reason),
                            };
                            self.record_trade(&strategy_id, &account_id, fill, true).await;
                        }
                    }
                }

                {
                    let mut summary = handle.write().await;
                    summary.clear_position();
                    summary.meta.tp_sl_orders.clear();
                }
                self.persist_meta(&*handle.read().await).await;
            }
        }
    }

    /// Execute one non-HOLD signal end to end: intent resolution, risk
    /// gate, leverage, sizing, submission, reservation settlement, trade
    /// tracking, TP/SL management, immediate re-reconcile.
    async fn execute_signal(
        &self,
        handle: &SummaryHandle,
        evaluator: &mut Box<dyn SignalEvaluator>,
        client: &Arc<dyn ExchangeApi>,
        signal: &Signal,
        dedup: &mut HashSet<(i64, SignalAction)>,
    ) -> Result<(), EngineError> {
        let summary = handle.read().await.clone();
        let strategy_id = summary.id.clone();
        let account_id = summary.account_id.clone();
        let symbol = summary.symbol.clone();

        if let Some(bar) = signal.bar_close_time
            && dedup.contains(&(bar, signal.action))
        {
            debug!(
                "[{}] Duplicate {} signal for bar {}, skipping",
                strategy_id, signal.action, bar
            );
            return Ok(());
        }

        // Intent resolution against the live position, not our view.
        let live = client.get_open_position(&symbol).await?;
        let (current_side, current_size) = match live {
            Some(p) if p.size() > 0.0 => (p.side(), p.size()),
            _ => (summary.position_side, summary.position_size),
        };
        let is_closing = matches!(
            (current_side, signal.action),
            (Some(PositionSide::Long), SignalAction::Sell)
                | (Some(PositionSide::Short), SignalAction::Buy)
        ) && current_size > 0.0;

        // Risk gate: check and reserve under the account mutex.
        let decision = self
            .risk
            .check_order_allowed(signal, &summary, &account_id, is_closing)
            .await;
        if !decision.allowed {
            return Err(EngineError::RiskLimitExceeded {
                reason: decision.reason,
            });
        }

        let executor = OrderExecutor::new(client.clone());

        // Leverage invariant: failure aborts the order.
        if let Err(e) = executor
            .ensure_leverage(&strategy_id, &symbol, summary.leverage)
            .await
        {
            if !is_closing {
                self.risk.release_reservation(&account_id, &strategy_id).await;
            }
            return Err(e);
        }

        let (quantity, reduce_only) = if is_closing {
            info!(
                "[{}] Closing entire position: {:?} {} {} (reduce_only=true)",
                strategy_id, current_side, current_size, symbol
            );
            (current_size, true)
        } else {
            let price = match signal.price {
                Some(price) if price > 0.0 => price,
                _ => match client.get_price(&symbol).await {
                    Ok(price) => price,
                    Err(e) => {
                        self.risk.release_reservation(&account_id, &strategy_id).await;
                        return Err(e.into());
                    }
                },
            };
            let sizer = RiskSizer::new(client.clone());
            let sizing = match sizer
                .size_position(&symbol, summary.risk_per_trade, price, summary.fixed_amount)
                .await
            {
                Ok(sizing) => sizing,
                Err(e) => {
                    self.risk.release_reservation(&account_id, &strategy_id).await;
                    return Err(e);
                }
            };
            let quantity = match decision.adjusted_quantity {
                Some(adjusted) => sizing.quantity.min(adjusted),
                None => sizing.quantity,
            };
            info!(
                "[{}] Position sizing: qty={:.8} notional={:.2} USDT",
                strategy_id,
                quantity,
                quantity * price
            );
            (quantity, false)
        };

        let mut fill = match executor.execute(signal, quantity, reduce_only).await {
            Ok(fill) => fill,
            Err(e) => {
                if !is_closing {
                    self.risk.release_reservation(&account_id, &strategy_id).await;
                }
                error!("[{}] Order execution failed: {}", strategy_id, e);
                return Err(e);
            }
        };

        if !is_closing {
            self.risk
                .confirm_exposure(&account_id, &strategy_id, &fill)
                .await;
        }
        if let Some(bar) = signal.bar_close_time {
            dedup.insert((bar, signal.action));
        }

        fill.exit_reason = signal.exit_reason;
        fill.leverage = fill.leverage.or(Some(summary.leverage));

        if fill.is_tracked() {
            self.record_trade(&strategy_id, &account_id, fill.clone(), true)
                .await;
        } else {
            warn!(
                "[{}] Order {} status NEW with zero execution; not tracked",
                strategy_id, fill.order_id
            );
        }

        // Update the summary's position view from the fill; the re-reconcile
        // below corrects any drift against the exchange.
        {
            let mut summary = handle.write().await;
            let price = fill.effective_price();
            match (fill.side, summary.position_side) {
                (OrderSide::Buy, Some(PositionSide::Short))
                | (OrderSide::Sell, Some(PositionSide::Long)) => {
                    let remaining = (summary.position_size - fill.executed_qty).max(0.0);
                    if remaining == 0.0 {
                        summary.clear_position();
                    } else {
                        summary.position_size = remaining;
                    }
                }
                (OrderSide::Buy, _) => {
                    summary.apply_position(PositionSide::Long, fill.executed_qty, price, 0.0);
                }
                (OrderSide::Sell, _) => {
                    summary.apply_position(PositionSide::Short, fill.executed_qty, price, 0.0);
                }
            }
        }

        // Native TP/SL management.
        let snapshot = handle.read().await.clone();
        if snapshot.has_position()
            && snapshot.entry_price.is_some()
            && !reduce_only
            && !snapshot.params.trailing_stop_enabled
        {
            let meta = snapshot.meta.tp_sl_orders;
            let has_resting = if meta.is_empty() {
                false
            } else {
                // Stored ids may be stale if the orders already filled or
                // were cancelled externally.
                match client.get_open_orders(&symbol).await {
                    Ok(orders) => {
                        let open_ids: HashSet<i64> =
                            orders.iter().map(|o| o.order_id).collect();
                        let alive = meta.tp_order_id.is_some_and(|id| open_ids.contains(&id))
                            || meta.sl_order_id.is_some_and(|id| open_ids.contains(&id));
                        if !alive {
                            info!(
                                "[{}] Stale TP/SL order ids detected, clearing metadata",
                                strategy_id
                            );
                            handle.write().await.meta.tp_sl_orders.clear();
                            self.persist_meta(&*handle.read().await).await;
                        }
                        alive
                    }
                    Err(e) => {
                        warn!(
                            "[{}] Failed to verify TP/SL orders: {}. Assuming they exist.",
                            strategy_id, e
                        );
                        true
                    }
                }
            };
            if !has_resting
                && let Err(e) = self.place_tp_sl_orders(handle, client.as_ref()).await
            {
                warn!(
                    "[{}] Failed to place native TP/SL orders: {}. The evaluator remains the backstop.",
                    strategy_id, e
                );
            }
        }

        let position_closed = !handle.read().await.has_position();
        if position_closed && !snapshot.meta.tp_sl_orders.is_empty() {
            if let Err(e) = self.cancel_tp_sl_orders(handle, client.as_ref()).await {
                warn!("[{}] Failed to cancel TP/SL orders: {}", strategy_id, e);
            }
        }

        // Re-reconcile immediately so the evaluator's next decision sees
        // reality now, not one tick later.
        self.reconcile_position(handle, client.as_ref()).await;
        {
            let summary = handle.read().await;
            evaluator.sync_position_state(summary.position_side, summary.entry_price);
        }

        Ok(())
    }

    /// Place the two native close-position stop orders for the open
    /// position and remember their ids and trigger prices.
    async fn place_tp_sl_orders(
        &self,
        handle: &SummaryHandle,
        client: &dyn ExchangeApi,
    ) -> Result<(), EngineError> {
        let summary = handle.read().await.clone();
        let (Some(entry_price), Some(side)) = (summary.entry_price, summary.position_side) else {
            debug!("[{}] Cannot place TP/SL: no position info", summary.id);
            return Ok(());
        };

        let (tp_price, sl_price) = match side {
            PositionSide::Long => (
                entry_price * (1.0 + summary.params.take_profit_pct),
                entry_price * (1.0 - summary.params.stop_loss_pct),
            ),
            PositionSide::Short => (
                entry_price * (1.0 - summary.params.take_profit_pct),
                entry_price * (1.0 + summary.params.stop_loss_pct),
            ),
        };
        let close_side = side.closing_side();

        info!(
            "[{}] Placing native TP/SL orders: TP={:.8} SL={:.8} ({})",
            summary.id, tp_price, sl_price, close_side
        );

        let tp_order_id = match client
            .place_take_profit_order(
                &summary.symbol,
                close_side,
                summary.position_size,
                tp_price,
                true,
            )
            .await
        {
            Ok(order_id) => Some(order_id),
            Err(e) => {
                error!("[{}] Failed to place TP order: {}", summary.id, e);
                None
            }
        };
        let sl_order_id = match client
            .place_stop_loss_order(
                &summary.symbol,
                close_side,
                summary.position_size,
                sl_price,
                true,
            )
            .await
        {
            Ok(order_id) => Some(order_id),
            Err(e) => {
                error!("[{}] Failed to place SL order: {}", summary.id, e);
                None
            }
        };

        {
            let mut summary = handle.write().await;
            summary.meta.tp_sl_orders.tp_order_id = tp_order_id;
            summary.meta.tp_sl_orders.sl_order_id = sl_order_id;
            summary.meta.tp_sl_orders.tp_price = tp_order_id.map(|_| tp_price);
            summary.meta.tp_sl_orders.sl_price = sl_order_id.map(|_| sl_price);
        }
        self.persist_meta(&*handle.read().await).await;
        Ok(())
    }

    /// Cancel recorded TP/SL orders and clear the meta slot. Already-filled
    /// orders answer "unknown order" from the exchange and are ignored.
    async fn cancel_tp_sl_orders(
        &self,
        handle: &SummaryHandle,
        client: &dyn ExchangeApi,
    ) -> Result<(), EngineError> {
        let (strategy_id, symbol, meta) = {
            let summary = handle.read().await;
            (
                summary.id.clone(),
                summary.symbol.clone(),
                summary.meta.tp_sl_orders,
            )
        };
        if meta.is_empty() {
            return Ok(());
        }

        info!(
            "[{}] Cancelling TP/SL orders: TP={:?} SL={:?}",
            strategy_id, meta.tp_order_id, meta.sl_order_id
        );
        for order_id in [meta.tp_order_id, meta.sl_order_id].into_iter().flatten() {
            match client.cancel_order(&symbol, order_id).await {
                Ok(()) => info!("[{}] Cancelled order {}", strategy_id, order_id),
                Err(ExchangeError::Api { code: -2011, .. }) => {
                    debug!(
                        "[{}] Order {} already gone (filled or cancelled)",
                        strategy_id, order_id
                    );
                }
                Err(e) => warn!(
                    "[{}] Failed to cancel order {}: {}",
                    strategy_id, order_id, e
                ),
            }
        }

        handle.write().await.meta.tp_sl_orders.clear();
        self.persist_meta(&*handle.read().await).await;
        Ok(())
    }
}
