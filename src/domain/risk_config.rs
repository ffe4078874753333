use serde::{Deserialize, Serialize};

/// Account-scoped risk policy, optionally overridden per strategy.
///
/// All limits are optional: `None` disables the corresponding check.
/// Percentage fields are fractions (0.05 = 5 %).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskConfig {
    pub max_portfolio_exposure_usdt: Option<f64>,
    pub max_portfolio_exposure_pct: Option<f64>,
    pub max_daily_loss_usdt: Option<f64>,
    pub max_daily_loss_pct: Option<f64>,
    pub max_weekly_loss_usdt: Option<f64>,
    pub max_weekly_loss_pct: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
    pub circuit_breaker_enabled: bool,
    pub max_consecutive_losses: Option<u32>,
    pub rapid_loss_threshold_pct: Option<f64>,
    pub auto_reduce_order_size: bool,
    /// IANA timezone the daily/weekly windows are anchored in.
    pub timezone: String,
    /// "HH:MM" local time at which the daily window resets.
    pub daily_loss_reset_time: Option<String>,
    /// 1 = Monday … 7 = Sunday.
    pub weekly_loss_reset_day: u8,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_portfolio_exposure_usdt: None,
            max_portfolio_exposure_pct: None,
            max_daily_loss_usdt: None,
            max_daily_loss_pct: None,
            max_weekly_loss_usdt: None,
            max_weekly_loss_pct: None,
            max_drawdown_pct: None,
            circuit_breaker_enabled: false,
            max_consecutive_losses: None,
            rapid_loss_threshold_pct: None,
            auto_reduce_order_size: false,
            timezone: "UTC".to_string(),
            daily_loss_reset_time: None,
            weekly_loss_reset_day: 1,
        }
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

fn min_opt_u32(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

impl RiskConfig {
    /// Merge a strategy-scoped override onto the account config. Numeric
    /// limits combine most-restrictive-wins (smaller cap wins); booleans OR;
    /// window anchoring (timezone, reset time/day) always comes from the
    /// account config so all strategies of an account share one window.
    pub fn merged_with(&self, strategy: &RiskConfig) -> RiskConfig {
        RiskConfig {
            max_portfolio_exposure_usdt: min_opt(
                self.max_portfolio_exposure_usdt,
                strategy.max_portfolio_exposure_usdt,
            ),
            max_portfolio_exposure_pct: min_opt(
                self.max_portfolio_exposure_pct,
                strategy.max_portfolio_exposure_pct,
            ),
            max_daily_loss_usdt: min_opt(self.max_daily_loss_usdt, strategy.max_daily_loss_usdt),
            max_daily_loss_pct: min_opt(self.max_daily_loss_pct, strategy.max_daily_loss_pct),
            max_weekly_loss_usdt: min_opt(self.max_weekly_loss_usdt, strategy.max_weekly_loss_usdt),
            max_weekly_loss_pct: min_opt(self.max_weekly_loss_pct, strategy.max_weekly_loss_pct),
            max_drawdown_pct: min_opt(self.max_drawdown_pct, strategy.max_drawdown_pct),
            circuit_breaker_enabled: self.circuit_breaker_enabled
                || strategy.circuit_breaker_enabled,
            max_consecutive_losses: min_opt_u32(
                self.max_consecutive_losses,
                strategy.max_consecutive_losses,
            ),
            rapid_loss_threshold_pct: min_opt(
                self.rapid_loss_threshold_pct,
                strategy.rapid_loss_threshold_pct,
            ),
            auto_reduce_order_size: self.auto_reduce_order_size || strategy.auto_reduce_order_size,
            timezone: self.timezone.clone(),
            daily_loss_reset_time: self.daily_loss_reset_time.clone(),
            weekly_loss_reset_day: self.weekly_loss_reset_day,
        }
    }

    /// True when any portfolio exposure cap is configured.
    pub fn has_exposure_limit(&self) -> bool {
        self.max_portfolio_exposure_usdt.is_some() || self.max_portfolio_exposure_pct.is_some()
    }

    pub fn has_daily_loss_limit(&self) -> bool {
        self.max_daily_loss_usdt.is_some() || self.max_daily_loss_pct.is_some()
    }

    pub fn has_weekly_loss_limit(&self) -> bool {
        self.max_weekly_loss_usdt.is_some() || self.max_weekly_loss_pct.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_smaller_caps() {
        let account = RiskConfig {
            max_portfolio_exposure_usdt: Some(1000.0),
            max_daily_loss_usdt: Some(100.0),
            max_consecutive_losses: Some(5),
            ..RiskConfig::default()
        };
        let strategy = RiskConfig {
            max_portfolio_exposure_usdt: Some(400.0),
            max_daily_loss_usdt: None,
            max_consecutive_losses: Some(3),
            circuit_breaker_enabled: true,
            ..RiskConfig::default()
        };

        let merged = account.merged_with(&strategy);
        assert_eq!(merged.max_portfolio_exposure_usdt, Some(400.0));
        assert_eq!(merged.max_daily_loss_usdt, Some(100.0));
        assert_eq!(merged.max_consecutive_losses, Some(3));
        assert!(merged.circuit_breaker_enabled);
    }

    #[test]
    fn merge_keeps_account_window_anchoring() {
        let account = RiskConfig {
            timezone: "Europe/Berlin".to_string(),
            weekly_loss_reset_day: 7,
            ..RiskConfig::default()
        };
        let strategy = RiskConfig {
            timezone: "Asia/Tokyo".to_string(),
            weekly_loss_reset_day: 3,
            ..RiskConfig::default()
        };

        let merged = account.merged_with(&strategy);
        assert_eq!(merged.timezone, "Europe/Berlin");
        assert_eq!(merged.weekly_loss_reset_day, 7);
    }

    #[test]
    fn default_disables_every_check() {
        let config = RiskConfig::default();
        assert!(!config.has_exposure_limit());
        assert!(!config.has_daily_loss_limit());
        assert!(!config.has_weekly_loss_limit());
        assert!(config.max_drawdown_pct.is_none());
    }
}
