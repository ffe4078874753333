//! Circuit breakers: automatic trading pause on adverse conditions.
//!
//! Two detectors run against matched completed trades: a strategy-scoped
//! consecutive-loss streak and an account-scoped rapid-loss window. A
//! tripped breaker STOPS the affected strategies (task cancelled, status
//! `stopped_by_risk`) rather than merely flagging them; resumption is
//! always a manual user action.

use crate::domain::breaker::{BreakerScope, BreakerState, BreakerStatus, BreakerType};
use crate::domain::matching::match_completed_trades;
use crate::domain::ports::{BreakerEventSink, StrategyStopper};
use crate::domain::strategy::StrategySummary;
use crate::domain::types::OrderFill;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::portfolio::PortfolioRiskManager;

/// Cooldown applied when a consecutive-loss breaker trips.
const CONSECUTIVE_LOSS_COOLDOWN_HOURS: i64 = 1;
/// Cooldown applied when a rapid-loss breaker trips.
const RAPID_LOSS_COOLDOWN_HOURS: i64 = 2;
/// Rolling window for the rapid-loss detector.
pub const RAPID_LOSS_WINDOW_MINUTES: i64 = 60;

const DEFAULT_MAX_CONSECUTIVE_LOSSES: u32 = 5;
const DEFAULT_RAPID_LOSS_THRESHOLD_PCT: f64 = 0.05;

type SummaryHandle = Arc<RwLock<StrategySummary>>;

pub struct CircuitBreaker {
    strategies: Arc<RwLock<HashMap<String, SummaryHandle>>>,
    trades: Arc<RwLock<HashMap<String, Vec<OrderFill>>>>,
    risk: Arc<PortfolioRiskManager>,
    stopper: Arc<dyn StrategyStopper>,
    events: Option<Arc<dyn BreakerEventSink>>,
    fee_rate: f64,
    /// scope key ("account:<id>" or the strategy id) → type → state.
    active: Mutex<HashMap<String, HashMap<BreakerType, BreakerState>>>,
}

fn account_key(account_id: &str) -> String {
    format!("account:{}", account_id)
}

impl CircuitBreaker {
    pub fn new(
        strategies: Arc<RwLock<HashMap<String, SummaryHandle>>>,
        trades: Arc<RwLock<HashMap<String, Vec<OrderFill>>>>,
        risk: Arc<PortfolioRiskManager>,
        stopper: Arc<dyn StrategyStopper>,
        events: Option<Arc<dyn BreakerEventSink>>,
        fee_rate: f64,
    ) -> Self {
        Self {
            strategies,
            trades,
            risk,
            stopper,
            events,
            fee_rate,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// True while any breaker covering the account (and optionally the
    /// strategy) is inside its cooldown. Expired breakers resolve lazily
    /// here, without restarting anything.
    pub async fn is_active(&self, account_id: &str, strategy_id: Option<&str>) -> bool {
        self.active_state(account_id, strategy_id).await.is_some()
    }

    /// The holding breaker state, if any. Used to surface cooldown details.
    pub async fn active_state(
        &self,
        account_id: &str,
        strategy_id: Option<&str>,
    ) -> Option<BreakerState> {
        let now = Utc::now();
        let mut active = self.active.lock().await;

        let mut keys = vec![account_key(account_id)];
        if let Some(id) = strategy_id {
            keys.push(id.to_string());
        }

        let mut holding = None;
        for key in keys {
            let Some(per_type) = active.get_mut(&key) else {
                continue;
            };
            for state in per_type.values_mut() {
                if state.status != BreakerStatus::Active {
                    continue;
                }
                if state.is_holding(now) {
                    holding.get_or_insert_with(|| state.clone());
                } else {
                    // Cooldown expired: resolve in place. The strategy
                    // stays stopped_by_risk until the user resets it.
                    state.status = BreakerStatus::Resolved;
                    if let Some(events) = &self.events
                        && let Err(e) = events
                            .resolve_breaker_event(state.breaker_type, BreakerStatus::Resolved)
                            .await
                    {
                        warn!("Failed to persist breaker resolution: {}", e);
                    }
                }
            }
        }
        holding
    }

    /// Run both detectors for a strategy after its trade history changed.
    pub async fn evaluate(&self, strategy_id: &str, account_id: &str) {
        if let Some(state) = self.check_consecutive_losses(strategy_id, account_id).await {
            info!(
                "Consecutive-loss breaker tripped for strategy {}: {} >= {}",
                strategy_id, state.trigger_value, state.threshold_value
            );
        }
        if let Some(state) = self.check_rapid_loss(account_id).await {
            info!(
                "Rapid-loss breaker tripped for account {}: {:.2}% >= {:.2}%",
                account_id,
                state.trigger_value * 100.0,
                state.threshold_value * 100.0
            );
        }
    }

    /// Consecutive-loss detector, strategy scope. Counts the losing streak
    /// from the most recent completed trade backwards; the first
    /// non-negative PnL breaks the streak.
    pub async fn check_consecutive_losses(
        &self,
        strategy_id: &str,
        account_id: &str,
    ) -> Option<BreakerState> {
        let config = self
            .risk
            .effective_config(account_id, Some(strategy_id))
            .await?;
        if !config.circuit_breaker_enabled {
            return None;
        }
        let threshold = config
            .max_consecutive_losses
            .unwrap_or(DEFAULT_MAX_CONSECUTIVE_LOSSES);

        let fills = {
            let trades = self.trades.read().await;
            trades.get(strategy_id).cloned().unwrap_or_default()
        };
        if fills.is_empty() {
            return None;
        }

        let mut completed = match_completed_trades(&fills, self.fee_rate);
        completed.sort_by_key(|t| std::cmp::Reverse(t.exit_time.unwrap_or(DateTime::<Utc>::MIN_UTC)));

        let mut streak = 0u32;
        for trade in &completed {
            if trade.net_pnl < 0.0 {
                streak += 1;
            } else {
                break;
            }
        }
        if streak < threshold {
            return None;
        }

        let state = BreakerState {
            breaker_type: BreakerType::ConsecutiveLosses,
            scope: BreakerScope::Strategy,
            account_id: account_id.to_string(),
            strategy_id: Some(strategy_id.to_string()),
            triggered_at: Utc::now(),
            trigger_value: f64::from(streak),
            threshold_value: f64::from(threshold),
            status: BreakerStatus::Active,
            cooldown_until: Some(Utc::now() + Duration::hours(CONSECUTIVE_LOSS_COOLDOWN_HOURS)),
        };
        self.trip(state.clone(), strategy_id.to_string()).await;

        warn!(
            "Circuit breaker triggered for {}: {} consecutive losses (threshold {})",
            strategy_id, streak, threshold
        );
        Some(state)
    }

    /// Rapid-loss detector, account scope, over a rolling window.
    pub async fn check_rapid_loss(&self, account_id: &str) -> Option<BreakerState> {
        let config = self.risk.effective_config(account_id, None).await?;
        if !config.circuit_breaker_enabled {
            return None;
        }
        let threshold = config
            .rapid_loss_threshold_pct
            .unwrap_or(DEFAULT_RAPID_LOSS_THRESHOLD_PCT);

        let window_start = Utc::now() - Duration::minutes(RAPID_LOSS_WINDOW_MINUTES);
        let realized = self.risk.realized_pnl_since(account_id, window_start).await;
        if realized >= 0.0 {
            return None;
        }

        let balance = self.risk.account_balance(account_id).await?;
        if balance <= 0.0 {
            return None;
        }

        let loss_pct = realized.abs() / balance;
        if loss_pct < threshold {
            return None;
        }

        let state = BreakerState {
            breaker_type: BreakerType::RapidLoss,
            scope: BreakerScope::Account,
            account_id: account_id.to_string(),
            strategy_id: None,
            triggered_at: Utc::now(),
            trigger_value: loss_pct,
            threshold_value: threshold,
            status: BreakerStatus::Active,
            cooldown_until: Some(Utc::now() + Duration::hours(RAPID_LOSS_COOLDOWN_HOURS)),
        };
        self.trip(state.clone(), account_key(account_id)).await;

        warn!(
            "Rapid-loss circuit breaker triggered for {}: {:.2}% loss in {} minutes (threshold {:.2}%)",
            account_id,
            loss_pct * 100.0,
            RAPID_LOSS_WINDOW_MINUTES,
            threshold * 100.0
        );
        Some(state)
    }

    /// Store the tripped state, stop the affected strategies, persist the
    /// audit event.
    async fn trip(&self, state: BreakerState, scope_key: String) {
        {
            let mut active = self.active.lock().await;
            active
                .entry(scope_key)
                .or_default()
                .insert(state.breaker_type, state.clone());
        }

        match state.scope {
            BreakerScope::Strategy => {
                if let Some(strategy_id) = &state.strategy_id
                    && let Err(e) = self
                        .stopper
                        .stop_for_risk(strategy_id, &state.breaker_type.to_string())
                        .await
                {
                    error!("Failed to stop strategy {}: {}", strategy_id, e);
                }
            }
            BreakerScope::Account => {
                for strategy_id in self.account_strategy_ids(&state.account_id).await {
                    if let Err(e) = self
                        .stopper
                        .stop_for_risk(&strategy_id, &state.breaker_type.to_string())
                        .await
                    {
                        error!("Failed to stop strategy {}: {}", strategy_id, e);
                    }
                }
            }
        }

        if let Some(events) = &self.events
            && let Err(e) = events.record_breaker_event(&state).await
        {
            error!("Failed to persist circuit breaker event: {}", e);
        }
    }

    /// Manually resolve a breaker. Affected strategies return to `stopped`;
    /// starting them again stays a manual action.
    pub async fn resolve(
        &self,
        breaker_type: BreakerType,
        account_id: &str,
        strategy_id: Option<&str>,
        manual: bool,
    ) -> bool {
        let scope_key = match strategy_id {
            Some(id) => id.to_string(),
            None => account_key(account_id),
        };

        let resolved = {
            let mut active = self.active.lock().await;
            match active.get_mut(&scope_key).and_then(|m| m.get_mut(&breaker_type)) {
                Some(state) => {
                    state.status = if manual {
                        BreakerStatus::ManualOverride
                    } else {
                        BreakerStatus::Resolved
                    };
                    state.cooldown_until = None;
                    Some(state.status)
                }
                None => None,
            }
        };
        let Some(status) = resolved else {
            return false;
        };

        match strategy_id {
            Some(id) => {
                if let Err(e) = self.stopper.reset_to_stopped(id).await {
                    warn!("Failed to reset strategy {} after breaker resolve: {}", id, e);
                }
            }
            None => {
                for id in self.account_strategy_ids(account_id).await {
                    if let Err(e) = self.stopper.reset_to_stopped(&id).await {
                        warn!("Failed to reset strategy {} after breaker resolve: {}", id, e);
                    }
                }
            }
        }

        if let Some(events) = &self.events
            && let Err(e) = events.resolve_breaker_event(breaker_type, status).await
        {
            warn!("Failed to persist breaker resolution: {}", e);
        }

        info!(
            "Circuit breaker resolved: {} for {} ({})",
            breaker_type,
            scope_key,
            if manual { "manual" } else { "auto" }
        );
        true
    }

    /// All currently holding breakers for status surfaces.
    pub async fn active_breakers(&self, account_id: &str) -> Vec<BreakerState> {
        let now = Utc::now();
        let active = self.active.lock().await;
        let mut out = Vec::new();
        for per_type in active.values() {
            for state in per_type.values() {
                if state.account_id == account_id && state.is_holding(now) {
                    out.push(state.clone());
                }
            }
        }
        out
    }

    async fn account_strategy_ids(&self, account_id: &str) -> Vec<String> {
        let strategies = self.strategies.read().await;
        let mut ids = Vec::new();
        for handle in strategies.values() {
            let summary = handle.read().await;
            if summary.account_id == account_id {
                ids.push(summary.id.clone());
            }
        }
        ids
    }
}
