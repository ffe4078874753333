//! StateStore: the single façade in front of the authoritative store.
//!
//! Owns the database handle, scopes every call to one tenant, and tracks
//! connection health. While the store is unhealthy, writes are refused so
//! the cache mirror can never run ahead of the authoritative state.

use crate::domain::breaker::{BreakerState, BreakerStatus, BreakerType};
use crate::domain::matching::CompletedTrade;
use crate::domain::ports::{BreakerEventSink, MetricStore, Notifier};
use crate::domain::risk_config::RiskConfig;
use crate::domain::strategy::{StrategyStatus, StrategySummary, SummaryMeta};
use crate::domain::types::OrderFill;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::database::Database;
use super::repositories::{
    AccountRepository, BreakerEventRepository, CompletedTradeRepository,
    ParameterHistoryRepository, RiskConfigRepository, RiskMetricRepository, StrategyRepository,
    SystemEventRepository, TradeRepository, UserRepository,
};
use crate::domain::account::Account;

/// Bounded retry window for opening the store at boot.
pub const INIT_RETRY_TOTAL_SECS: u64 = 120;
const INIT_RETRY_BASE_DELAY_SECS: u64 = 2;

pub struct StateStore {
    db: Database,
    user_id: Uuid,
    healthy: AtomicBool,
    accounts: AccountRepository,
    users: UserRepository,
    strategies: StrategyRepository,
    trades: TradeRepository,
    completed: CompletedTradeRepository,
    risk_configs: RiskConfigRepository,
    breaker_events: BreakerEventRepository,
    system_events: SystemEventRepository,
    metrics: RiskMetricRepository,
    parameter_history: ParameterHistoryRepository,
}

impl StateStore {
    pub fn new(db: Database, user_id: Uuid) -> Self {
        let pool = db.pool.clone();
        Self {
            db,
            user_id,
            healthy: AtomicBool::new(true),
            accounts: AccountRepository::new(pool.clone()),
            users: UserRepository::new(pool.clone()),
            strategies: StrategyRepository::new(pool.clone()),
            trades: TradeRepository::new(pool.clone()),
            completed: CompletedTradeRepository::new(pool.clone()),
            risk_configs: RiskConfigRepository::new(pool.clone()),
            breaker_events: BreakerEventRepository::new(pool.clone()),
            system_events: SystemEventRepository::new(pool.clone()),
            metrics: RiskMetricRepository::new(pool.clone()),
            parameter_history: ParameterHistoryRepository::new(pool),
        }
    }

    /// Open the store with bounded retry and exponential backoff. Gives up
    /// after [`INIT_RETRY_TOTAL_SECS`]; the caller then runs degraded.
    pub async fn open_with_retry(db_url: &str, user_id: Uuid) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(INIT_RETRY_TOTAL_SECS);
        let mut delay = Duration::from_secs(INIT_RETRY_BASE_DELAY_SECS);
        let mut attempt = 1u32;

        loop {
            match Database::new(db_url).await {
                Ok(db) => return Ok(Self::new(db, user_id)),
                Err(e) if tokio::time::Instant::now() + delay < deadline => {
                    warn!(
                        "Database open attempt {} failed: {}. Retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).context("Database unavailable after bounded retries");
                }
            }
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn guard_write(&self) -> Result<()> {
        if !self.is_healthy() {
            anyhow::bail!("State store is unhealthy; writes are refused until it recovers");
        }
        Ok(())
    }

    /// Round-trip probe.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.db.pool).await.is_ok()
    }

    /// Periodic health monitor. Fires the failure notification once per
    /// outage and the restoration notification once on recovery.
    pub fn spawn_health_monitor(
        self: Arc<Self>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ok = store.health_check().await;
                let was_ok = store.healthy.swap(ok, Ordering::Relaxed);
                if was_ok && !ok {
                    error!("Database connection lost; entering degraded mode (writes refused)");
                    notifier
                        .notify_database_connection_failed("health probe failed")
                        .await;
                } else if !was_ok && ok {
                    info!("Database connection restored; writes re-enabled");
                    notifier.notify_database_connection_restored().await;
                }
            }
        })
    }

    // --- Tenant ---

    /// Ensure the tenant row, default roles and role link exist.
    pub async fn provision_user(&self) -> Result<()> {
        self.guard_write()?;
        self.users.provision(self.user_id, "admin").await
    }

    // --- Accounts ---

    pub async fn save_account(&self, account: &Account) -> Result<()> {
        self.guard_write()?;
        self.accounts.upsert(self.user_id, account).await
    }

    pub async fn load_accounts(&self) -> Result<Vec<Account>> {
        self.accounts.find_all(self.user_id).await
    }

    pub async fn load_account(&self, account_id: &str) -> Result<Option<Account>> {
        self.accounts.find(self.user_id, account_id).await
    }

    pub async fn load_default_account(&self) -> Result<Option<Account>> {
        self.accounts.find_default(self.user_id).await
    }

    pub async fn set_account_active(&self, account_id: &str, active: bool) -> Result<bool> {
        self.guard_write()?;
        self.accounts
            .set_active(self.user_id, account_id, active)
            .await
    }

    /// Strategies still bound to the account; deletion is refused while
    /// this is non-zero (RESTRICT).
    pub async fn account_strategy_count(&self, account_id: &str) -> Result<i64> {
        self.accounts.strategy_count(self.user_id, account_id).await
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<bool> {
        self.guard_write()?;
        self.accounts.delete(self.user_id, account_id).await
    }

    // --- Strategies ---

    pub async fn upsert_strategy(&self, summary: &StrategySummary) -> Result<()> {
        self.guard_write()?;
        self.strategies.upsert(self.user_id, summary).await
    }

    pub async fn update_strategy_status(
        &self,
        strategy_id: &str,
        status: StrategyStatus,
    ) -> Result<()> {
        self.guard_write()?;
        self.strategies
            .update_status(self.user_id, strategy_id, status)
            .await
    }

    pub async fn update_strategy_meta(&self, strategy_id: &str, meta: &SummaryMeta) -> Result<()> {
        self.guard_write()?;
        self.strategies
            .update_meta(self.user_id, strategy_id, meta)
            .await
    }

    pub async fn delete_strategy(&self, strategy_id: &str) -> Result<bool> {
        self.guard_write()?;
        self.strategies.delete(self.user_id, strategy_id).await
    }

    pub async fn load_strategies(&self) -> Result<Vec<StrategySummary>> {
        self.strategies.find_all(self.user_id).await
    }

    pub async fn load_strategy(&self, strategy_id: &str) -> Result<Option<StrategySummary>> {
        self.strategies.find(self.user_id, strategy_id).await
    }

    // --- Trades ---

    pub async fn save_trade(&self, strategy_id: &str, fill: &OrderFill) -> Result<()> {
        self.guard_write()?;
        self.trades.insert(self.user_id, strategy_id, fill).await
    }

    pub async fn load_trades(&self, strategy_id: &str, limit: usize) -> Result<Vec<OrderFill>> {
        self.trades
            .find_by_strategy(self.user_id, strategy_id, limit)
            .await
    }

    pub async fn replace_completed_trades(
        &self,
        strategy_id: &str,
        completed: &[CompletedTrade],
    ) -> Result<()> {
        self.guard_write()?;
        self.completed
            .replace_for_strategy(self.user_id, strategy_id, completed)
            .await
    }

    // --- Risk configuration ---

    pub async fn save_risk_config(
        &self,
        account_id: &str,
        strategy_id: Option<&str>,
        config: &RiskConfig,
    ) -> Result<()> {
        self.guard_write()?;
        self.risk_configs
            .upsert(self.user_id, account_id, strategy_id, config)
            .await
    }

    pub async fn load_risk_config(
        &self,
        account_id: &str,
        strategy_id: Option<&str>,
    ) -> Result<Option<RiskConfig>> {
        self.risk_configs
            .find(self.user_id, account_id, strategy_id)
            .await
    }

    // --- Audit ---

    pub async fn record_system_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.guard_write()?;
        self.system_events
            .record(self.user_id, event_type, &payload)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_parameter_change(
        &self,
        strategy_id: &str,
        old_params: &crate::domain::strategy::StrategyParams,
        new_params: &crate::domain::strategy::StrategyParams,
        reason: &str,
        status: &str,
        performance_before: Option<f64>,
        performance_after: Option<f64>,
    ) -> Result<()> {
        self.guard_write()?;
        self.parameter_history
            .record(
                self.user_id,
                strategy_id,
                old_params,
                new_params,
                reason,
                status,
                performance_before,
                performance_after,
            )
            .await
    }
}

#[async_trait]
impl MetricStore for StateStore {
    async fn load_peak_balance(&self, account_id: &str) -> Result<Option<f64>> {
        self.metrics.peak_balance(self.user_id, account_id).await
    }

    async fn save_peak_balance(&self, account_id: &str, value: f64) -> Result<()> {
        self.guard_write()?;
        self.metrics
            .set_peak_balance(self.user_id, account_id, value)
            .await
    }
}

#[async_trait]
impl BreakerEventSink for StateStore {
    async fn record_breaker_event(&self, state: &BreakerState) -> Result<()> {
        self.guard_write()?;
        self.breaker_events.insert(self.user_id, state).await
    }

    async fn resolve_breaker_event(
        &self,
        breaker_type: BreakerType,
        status: BreakerStatus,
    ) -> Result<()> {
        self.guard_write()?;
        self.breaker_events
            .resolve_latest(self.user_id, breaker_type, status)
            .await
    }
}
