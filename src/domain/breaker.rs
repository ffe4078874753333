use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerType {
    #[serde(rename = "consecutive_losses")]
    ConsecutiveLosses,
    #[serde(rename = "rapid_loss")]
    RapidLoss,
}

impl fmt::Display for BreakerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerType::ConsecutiveLosses => write!(f, "consecutive_losses"),
            BreakerType::RapidLoss => write!(f, "rapid_loss"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerScope {
    #[serde(rename = "account")]
    Account,
    #[serde(rename = "strategy")]
    Strategy,
}

impl fmt::Display for BreakerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerScope::Account => write!(f, "account"),
            BreakerScope::Strategy => write!(f, "strategy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "resolved")]
    Resolved,
    #[serde(rename = "manual_override")]
    ManualOverride,
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerStatus::Active => write!(f, "active"),
            BreakerStatus::Resolved => write!(f, "resolved"),
            BreakerStatus::ManualOverride => write!(f, "manual_override"),
        }
    }
}

/// State of one tripped (or resolved) circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    pub breaker_type: BreakerType,
    pub scope: BreakerScope,
    pub account_id: String,
    /// Set for strategy-scoped breakers.
    pub strategy_id: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub trigger_value: f64,
    pub threshold_value: f64,
    pub status: BreakerStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl BreakerState {
    /// Active only while the cooldown holds.
    pub fn is_holding(&self, now: DateTime<Utc>) -> bool {
        self.status == BreakerStatus::Active
            && self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }
}
