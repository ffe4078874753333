//! Notification sink implementations.
//!
//! Transports (push, chat) live outside the engine; the default sink turns
//! every event into a structured log line so operators see the same
//! stream.

use crate::domain::ports::Notifier;
use crate::domain::strategy::StrategySummary;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_strategy_started(&self, summary: &StrategySummary, reason: &str) {
        info!(
            "Strategy STARTED: {} ({}) | Symbol: {} | Leverage: {}x | Account: {} | {}",
            summary.id, summary.name, summary.symbol, summary.leverage, summary.account_id, reason
        );
    }

    async fn notify_strategy_stopped(
        &self,
        summary: &StrategySummary,
        reason: &str,
        final_pnl: Option<f64>,
    ) {
        let pnl = final_pnl
            .map(|p| format!(" | Final PnL: {:.2} USDT", p))
            .unwrap_or_default();
        info!(
            "Strategy STOPPED: {} ({}) | Symbol: {} | Account: {}{} | {}",
            summary.id, summary.name, summary.symbol, summary.account_id, pnl, reason
        );
    }

    async fn notify_strategy_error(&self, summary: &StrategySummary, error: &str) {
        error!(
            "Strategy FAILED: {} ({}) | Symbol: {} | Account: {} | {}",
            summary.id, summary.name, summary.symbol, summary.account_id, error
        );
    }

    async fn notify_pnl_threshold(&self, summary: &StrategySummary, pnl: f64, threshold: f64) {
        info!(
            "PnL threshold crossed for {} ({}): {:.2} USDT (threshold {:.2})",
            summary.id, summary.name, pnl, threshold
        );
    }

    async fn notify_database_connection_failed(&self, error: &str) {
        error!("Database connection failed: {}", error);
    }

    async fn notify_database_connection_restored(&self) {
        info!("Database connection restored");
    }

    async fn notify_server_restart(&self, restored_strategies: usize, errors: &[String]) {
        if errors.is_empty() {
            info!(
                "Server restarted: {} strategies restored",
                restored_strategies
            );
        } else {
            warn!(
                "Server restarted: {} strategies restored, {} startup errors: {}",
                restored_strategies,
                errors.len(),
                errors.join("; ")
            );
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PnlZone {
    Normal,
    AboveProfit,
    BelowLoss,
}

/// Per-strategy edge detector for unrealized-PnL threshold notifications:
/// fires once when PnL enters the profit or loss zone, rearms when it
/// returns to normal.
pub struct PnlAlerts {
    profit_threshold: f64,
    loss_threshold: f64,
    zones: Mutex<HashMap<String, PnlZone>>,
}

impl PnlAlerts {
    pub fn new(profit_threshold: f64, loss_threshold: f64) -> Self {
        Self {
            profit_threshold,
            loss_threshold: -loss_threshold.abs(),
            zones: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, summary: &StrategySummary, pnl: f64, notifier: &Arc<dyn Notifier>) {
        let zone = if pnl >= self.profit_threshold {
            PnlZone::AboveProfit
        } else if pnl <= self.loss_threshold {
            PnlZone::BelowLoss
        } else {
            PnlZone::Normal
        };

        let mut zones = self.zones.lock().await;
        let previous = zones
            .insert(summary.id.clone(), zone)
            .unwrap_or(PnlZone::Normal);
        drop(zones);

        if zone != previous && zone != PnlZone::Normal {
            let threshold = match zone {
                PnlZone::AboveProfit => self.profit_threshold,
                _ => self.loss_threshold,
            };
            notifier.notify_pnl_threshold(summary, pnl, threshold).await;
        }
    }

    pub async fn forget(&self, strategy_id: &str) {
        self.zones.lock().await.remove(strategy_id);
    }
}
