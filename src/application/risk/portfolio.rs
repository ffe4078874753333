//! Portfolio-level risk gate with per-account locking and exposure
//! reservation.
//!
//! `check_order_allowed` runs the whole check-and-reserve section under one
//! async mutex per account, so two strategies on the same account cannot
//! race past an exposure limit between check and order placement. Failed or
//! rejected orders must release their reservation, otherwise the ghost
//! exposure would starve the account.

use crate::domain::matching::match_completed_trades;
use crate::domain::ports::MetricStore;
use crate::domain::risk_config::RiskConfig;
use crate::domain::strategy::StrategySummary;
use crate::domain::types::{OrderFill, Signal};
use crate::infrastructure::accounts::ClientManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::windows;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Reserved,
    Partial,
    Confirmed,
    Released,
}

/// One in-flight claim on exposure headroom. At most one active entry per
/// (account, strategy).
#[derive(Debug, Clone)]
pub struct ExposureReservation {
    pub account_id: String,
    pub strategy_id: String,
    pub reserved_exposure: f64,
    pub status: ReservationStatus,
    pub order_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the gate. When `allowed` is false and the account has
/// auto-reduce enabled, `adjusted_quantity` may carry the size that would
/// still fit; the caller decides whether to resubmit with it.
#[derive(Debug, Clone)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: String,
    pub adjusted_quantity: Option<f64>,
}

impl RiskDecision {
    fn allow(reason: &str) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
            adjusted_quantity: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            allowed: false,
            reason,
            adjusted_quantity: None,
        }
    }
}

type SummaryHandle = Arc<RwLock<StrategySummary>>;

pub struct PortfolioRiskManager {
    strategies: Arc<RwLock<HashMap<String, SummaryHandle>>>,
    trades: Arc<RwLock<HashMap<String, Vec<OrderFill>>>>,
    clients: Arc<ClientManager>,
    metrics: Option<Arc<dyn MetricStore>>,
    configs: RwLock<HashMap<String, RiskConfig>>,
    strategy_configs: RwLock<HashMap<String, RiskConfig>>,
    fee_rate: f64,
    partial_fill_threshold: f64,
    /// Per-account mutexes covering the check-and-reserve section. The map
    /// itself is guarded; held locks are only the inner per-account ones.
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    reservations: Mutex<HashMap<String, HashMap<String, ExposureReservation>>>,
    peak_balances: Mutex<HashMap<String, f64>>,
}

impl PortfolioRiskManager {
    pub fn new(
        strategies: Arc<RwLock<HashMap<String, SummaryHandle>>>,
        trades: Arc<RwLock<HashMap<String, Vec<OrderFill>>>>,
        clients: Arc<ClientManager>,
        metrics: Option<Arc<dyn MetricStore>>,
        fee_rate: f64,
        partial_fill_threshold: f64,
    ) -> Self {
        Self {
            strategies,
            trades,
            clients,
            metrics,
            configs: RwLock::new(HashMap::new()),
            strategy_configs: RwLock::new(HashMap::new()),
            fee_rate,
            partial_fill_threshold,
            account_locks: Mutex::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            peak_balances: Mutex::new(HashMap::new()),
        }
    }

    /// Install (or clear) the effective risk config for an account. The
    /// caller is responsible for merging any strategy-scoped override
    /// before installing.
    pub async fn set_account_config(&self, account_id: &str, config: Option<RiskConfig>) {
        let mut configs = self.configs.write().await;
        match config {
            Some(config) => {
                configs.insert(account_id.to_string(), config);
            }
            None => {
                configs.remove(account_id);
            }
        }
    }

    pub async fn account_config(&self, account_id: &str) -> Option<RiskConfig> {
        self.configs.read().await.get(account_id).cloned()
    }

    /// Install (or clear) a strategy-scoped override.
    pub async fn set_strategy_config(&self, strategy_id: &str, config: Option<RiskConfig>) {
        let mut configs = self.strategy_configs.write().await;
        match config {
            Some(config) => {
                configs.insert(strategy_id.to_string(), config);
            }
            None => {
                configs.remove(strategy_id);
            }
        }
    }

    /// Effective config for a check: account config merged
    /// most-restrictive-wins with the strategy override, when both exist.
    pub async fn effective_config(
        &self,
        account_id: &str,
        strategy_id: Option<&str>,
    ) -> Option<RiskConfig> {
        let account = self.account_config(account_id).await;
        let overlay = match strategy_id {
            Some(id) => self.strategy_configs.read().await.get(id).cloned(),
            None => None,
        };
        match (account, overlay) {
            (Some(account), Some(overlay)) => Some(account.merged_with(&overlay)),
            (Some(account), None) => Some(account),
            (None, overlay) => overlay,
        }
    }

    async fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Check whether an order may go out, reserving exposure when allowed.
    ///
    /// `is_close` marks reduce-only exits: they never increase exposure and
    /// are allowed even while loss limits are tripped, so positions can
    /// always be flattened.
    pub async fn check_order_allowed(
        &self,
        signal: &Signal,
        summary: &StrategySummary,
        account_id: &str,
        is_close: bool,
    ) -> RiskDecision {
        if is_close {
            return RiskDecision::allow("Reduce-only close, no exposure added");
        }

        let lock = self.account_lock(account_id).await;
        let _guard = lock.lock().await;

        let Some(config) = self.effective_config(account_id, Some(&summary.id)).await else {
            return RiskDecision::allow("Risk management not configured");
        };

        // 1. Portfolio exposure (includes in-flight reservations). An
        // auto-reduced quantity still has to clear the loss and drawdown
        // checks below before anything is reserved.
        let mut auto_reduced: Option<(f64, f64)> = None;
        if config.has_exposure_limit() {
            let decision = self
                .check_exposure_limit(signal, summary, account_id, &config)
                .await;
            if !decision.allowed {
                return decision;
            }
            if let Some(adjusted) = decision.adjusted_quantity {
                let price = self.reference_price(signal, summary);
                auto_reduced = Some((adjusted, adjusted * price * f64::from(summary.leverage)));
            }
        }

        // 2. Daily loss, realized only.
        if config.has_daily_loss_limit() {
            let start = windows::today_start(
                &config.timezone,
                config.daily_loss_reset_time.as_deref(),
                Utc::now(),
            );
            let realized = self.realized_pnl_since(account_id, start).await;
            if let Some(limit) = self.loss_limit_usdt(
                account_id,
                config.max_daily_loss_usdt,
                config.max_daily_loss_pct,
            )
            .await && realized < -limit.abs()
            {
                return RiskDecision::reject(format!(
                    "Daily loss limit exceeded: {:.2} < -{:.2} USDT",
                    realized, limit
                ));
            }
        }

        // 3. Weekly loss, realized only.
        if config.has_weekly_loss_limit() {
            let start = windows::week_start(&config.timezone, config.weekly_loss_reset_day, Utc::now());
            let realized = self.realized_pnl_since(account_id, start).await;
            if let Some(limit) = self.loss_limit_usdt(
                account_id,
                config.max_weekly_loss_usdt,
                config.max_weekly_loss_pct,
            )
            .await && realized < -limit.abs()
            {
                return RiskDecision::reject(format!(
                    "Weekly loss limit exceeded: {:.2} < -{:.2} USDT",
                    realized, limit
                ));
            }
        }

        // 4. Drawdown on total equity: unrealized losses count here.
        if let Some(max_drawdown) = config.max_drawdown_pct
            && let Some(balance) = self.account_balance(account_id).await
        {
            let peak = self.peak_balance(account_id, balance).await;
            if peak > 0.0 {
                let drawdown = (peak - balance) / peak;
                if drawdown > max_drawdown {
                    return RiskDecision::reject(format!(
                        "Drawdown limit exceeded: {:.2}% > {:.2}%",
                        drawdown * 100.0,
                        max_drawdown * 100.0
                    ));
                }
            }
        }

        // All checks passed: claim the exposure before the order goes out.
        match auto_reduced {
            Some((adjusted, exposure)) => {
                self.reserve(account_id, &summary.id, exposure).await;
                RiskDecision {
                    allowed: true,
                    reason: format!("Reduced to fit exposure headroom of {:.2} USDT", exposure),
                    adjusted_quantity: Some(adjusted),
                }
            }
            None => {
                let exposure = self.estimate_order_exposure(signal, summary, account_id).await;
                self.reserve(account_id, &summary.id, exposure).await;
                RiskDecision::allow("OK")
            }
        }
    }

    async fn check_exposure_limit(
        &self,
        signal: &Signal,
        summary: &StrategySummary,
        account_id: &str,
        config: &RiskConfig,
    ) -> RiskDecision {
        let Some(max_exposure) = self.max_exposure(account_id, config).await else {
            return RiskDecision::allow("No exposure limit set");
        };

        let current = self.current_exposure(account_id).await;
        let order_exposure = self.estimate_order_exposure(signal, summary, account_id).await;

        if current + order_exposure <= max_exposure {
            return RiskDecision::allow("OK");
        }

        if config.auto_reduce_order_size {
            let headroom = max_exposure - current;
            let price = self.reference_price(signal, summary);
            if headroom > 0.0 && price > 0.0 {
                let adjusted = headroom / (price * f64::from(summary.leverage));
                debug!(
                    "Auto-reducing order for {} on {}: headroom {:.2} USDT -> qty {:.8}",
                    summary.id, account_id, headroom, adjusted
                );
                return RiskDecision {
                    allowed: true,
                    reason: format!(
                        "Reduced to fit exposure headroom of {:.2} USDT",
                        headroom
                    ),
                    adjusted_quantity: Some(adjusted),
                };
            }
        }

        RiskDecision::reject(format!(
            "Would exceed exposure limit: {:.2} > {:.2} USDT",
            current + order_exposure,
            max_exposure
        ))
    }

    /// Real exposure plus in-flight reservations (reserved and partial; a
    /// confirmed reservation is already visible as a live position).
    pub async fn current_exposure(&self, account_id: &str) -> f64 {
        self.real_exposure(account_id).await + self.reserved_exposure(account_id).await
    }

    pub async fn reserved_exposure(&self, account_id: &str) -> f64 {
        let reservations = self.reservations.lock().await;
        reservations
            .get(account_id)
            .map(|per_strategy| {
                per_strategy
                    .values()
                    .filter(|r| {
                        matches!(
                            r.status,
                            ReservationStatus::Reserved | ReservationStatus::Partial
                        )
                    })
                    .map(|r| r.reserved_exposure)
                    .sum()
            })
            .unwrap_or(0.0)
    }

    /// Notional of live positions weighted by leverage, over all strategies
    /// bound to the account.
    async fn real_exposure(&self, account_id: &str) -> f64 {
        let strategies = self.strategies.read().await;
        let mut total = 0.0;
        for handle in strategies.values() {
            let summary = handle.read().await;
            if summary.account_id != account_id || !summary.has_position() {
                continue;
            }
            let Some(price) = summary.current_price.or(summary.entry_price) else {
                warn!(
                    "Cannot compute exposure for {}: no reference price",
                    summary.id
                );
                continue;
            };
            total += summary.position_size * price * f64::from(summary.leverage);
        }
        total
    }

    fn reference_price(&self, signal: &Signal, summary: &StrategySummary) -> f64 {
        signal
            .price
            .or(summary.current_price)
            .or(summary.entry_price)
            .unwrap_or(0.0)
    }

    /// Pre-order exposure estimate. Fixed-amount strategies are exact
    /// (`fixed_amount × leverage`); percentage sizing reserves the
    /// conservative upper bound `risk_per_trade × balance × leverage`
    /// rather than zero, so the reservation still protects the cap.
    async fn estimate_order_exposure(
        &self,
        signal: &Signal,
        summary: &StrategySummary,
        account_id: &str,
    ) -> f64 {
        let price = self.reference_price(signal, summary);
        if price <= 0.0 {
            warn!("Cannot estimate order exposure for {}: no price", summary.id);
            return 0.0;
        }

        let leverage = f64::from(summary.leverage);
        match summary.fixed_amount {
            Some(amount) => amount * leverage,
            None => {
                let balance = self.account_balance(account_id).await.unwrap_or(0.0);
                summary.risk_per_trade * balance * leverage
            }
        }
    }

    async fn max_exposure(&self, account_id: &str, config: &RiskConfig) -> Option<f64> {
        if let Some(usdt) = config.max_portfolio_exposure_usdt {
            return Some(usdt);
        }
        if let Some(pct) = config.max_portfolio_exposure_pct {
            return self.account_balance(account_id).await.map(|b| b * pct);
        }
        None
    }

    async fn loss_limit_usdt(
        &self,
        account_id: &str,
        usdt: Option<f64>,
        pct: Option<f64>,
    ) -> Option<f64> {
        if let Some(usdt) = usdt {
            return Some(usdt);
        }
        if let Some(pct) = pct {
            return self.account_balance(account_id).await.map(|b| b * pct);
        }
        None
    }

    pub async fn account_balance(&self, account_id: &str) -> Option<f64> {
        let client = self.clients.get_client(account_id).await.ok()?;
        match client.futures_account_balance().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!("Failed to fetch balance for {}: {}", account_id, e);
                None
            }
        }
    }

    /// Realized PnL of the account since `start`, from matched completed
    /// trades of raw fills in the window.
    pub async fn realized_pnl_since(&self, account_id: &str, start: DateTime<Utc>) -> f64 {
        let strategy_ids: Vec<String> = {
            let strategies = self.strategies.read().await;
            let mut ids = Vec::new();
            for handle in strategies.values() {
                let summary = handle.read().await;
                if summary.account_id == account_id {
                    ids.push(summary.id.clone());
                }
            }
            ids
        };

        let trades = self.trades.read().await;
        let mut total = 0.0;
        for id in strategy_ids {
            let Some(fills) = trades.get(&id) else { continue };
            let windowed: Vec<_> = fills
                .iter()
                .filter(|t| t.timestamp >= start)
                .cloned()
                .collect();
            if windowed.is_empty() {
                continue;
            }
            for completed in match_completed_trades(&windowed, self.fee_rate) {
                total += completed.net_pnl;
            }
        }
        total
    }

    /// Highest balance observed for the account. Seeded from the metric
    /// store when present; persisted whenever it advances.
    pub async fn peak_balance(&self, account_id: &str, current_balance: f64) -> f64 {
        let mut peaks = self.peak_balances.lock().await;

        let mut peak = match peaks.get(account_id) {
            Some(peak) => *peak,
            None => {
                let stored = match &self.metrics {
                    Some(metrics) => metrics
                        .load_peak_balance(account_id)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or(current_balance),
                    None => current_balance,
                };
                peaks.insert(account_id.to_string(), stored);
                stored
            }
        };

        if current_balance > peak {
            peak = current_balance;
            peaks.insert(account_id.to_string(), peak);
            if let Some(metrics) = &self.metrics
                && let Err(e) = metrics.save_peak_balance(account_id, peak).await
            {
                warn!("Failed to persist peak balance for {}: {}", account_id, e);
            }
        }

        peak
    }

    async fn reserve(&self, account_id: &str, strategy_id: &str, exposure: f64) {
        let mut reservations = self.reservations.lock().await;
        reservations
            .entry(account_id.to_string())
            .or_default()
            .insert(
                strategy_id.to_string(),
                ExposureReservation {
                    account_id: account_id.to_string(),
                    strategy_id: strategy_id.to_string(),
                    reserved_exposure: exposure,
                    status: ReservationStatus::Reserved,
                    order_id: None,
                    created_at: Utc::now(),
                },
            );
        debug!(
            "Reserved {:.2} USDT exposure for {} (account {})",
            exposure, strategy_id, account_id
        );
    }

    /// Convert a reservation into executed exposure after the fill comes
    /// back. Executed exposure below the configured threshold of the
    /// reservation marks it `Partial`; either way the estimate is replaced
    /// with the actual.
    pub async fn confirm_exposure(&self, account_id: &str, strategy_id: &str, fill: &OrderFill) {
        let mut reservations = self.reservations.lock().await;
        let Some(reservation) = reservations
            .get_mut(account_id)
            .and_then(|m| m.get_mut(strategy_id))
        else {
            return;
        };

        let leverage = fill.leverage.map(f64::from).unwrap_or(1.0);
        let actual = fill.executed_qty * fill.effective_price() * leverage;

        reservation.status = if fill.status == "FILLED" {
            ReservationStatus::Confirmed
        } else if actual < reservation.reserved_exposure * self.partial_fill_threshold {
            ReservationStatus::Partial
        } else {
            ReservationStatus::Confirmed
        };
        reservation.order_id = Some(fill.order_id);
        reservation.reserved_exposure = actual;

        debug!(
            "Confirmed {:.2} USDT exposure for {} (account {}, status {:?})",
            actual, strategy_id, account_id, reservation.status
        );
    }

    /// Drop a reservation after a failed or rejected order.
    pub async fn release_reservation(&self, account_id: &str, strategy_id: &str) {
        let mut reservations = self.reservations.lock().await;
        if let Some(reservation) = reservations
            .get_mut(account_id)
            .and_then(|m| m.remove(strategy_id))
        {
            debug!(
                "Released {:.2} USDT reservation for {} (account {})",
                reservation.reserved_exposure, strategy_id, account_id
            );
        }
    }

    /// Drop settled reservations whose strategy no longer holds a position.
    /// Called from the strategy tick after the summary has been reconciled
    /// against the exchange.
    pub async fn reconcile_reservations(&self, account_id: &str, strategy_id: &str) {
        let has_position = {
            let strategies = self.strategies.read().await;
            match strategies.get(strategy_id) {
                Some(handle) => handle.read().await.has_position(),
                None => false,
            }
        };
        if has_position {
            return;
        }

        let mut reservations = self.reservations.lock().await;
        if let Some(per_strategy) = reservations.get_mut(account_id) {
            let settled = per_strategy
                .get(strategy_id)
                .map(|r| {
                    matches!(
                        r.status,
                        ReservationStatus::Confirmed | ReservationStatus::Partial
                    )
                })
                .unwrap_or(false);
            if settled {
                per_strategy.remove(strategy_id);
                debug!(
                    "Reconciled away settled reservation for flat strategy {} (account {})",
                    strategy_id, account_id
                );
            }
        }
    }

    /// Snapshot of the ledger for one account, used by status surfaces and
    /// tests.
    pub async fn reservations_for(&self, account_id: &str) -> Vec<ExposureReservation> {
        let reservations = self.reservations.lock().await;
        reservations
            .get(account_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}
