use thiserror::Error;

/// Errors surfaced by the exchange client, split by how callers must react:
/// rate limits wait, network errors retry, auth errors abort, api errors
/// surface with the exchange code.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Rate limit exceeded (retry after: {retry_after_secs:?}s)")]
    RateLimit { retry_after_secs: Option<u64> },

    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Exchange API error {code}: {message}")]
    Api { code: i64, message: String },
}

impl ExchangeError {
    /// Transient errors are worth a bounded retry; the rest fail fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network { .. } | ExchangeError::RateLimit { .. }
        )
    }
}

/// Engine error taxonomy. Expected rejections (risk refusals, lifecycle
/// conflicts) are values of this enum, never panics.
#[derive(Debug, Error)]
pub enum EngineError {
    // --- Validation: surfaced to the caller, never retried ---
    #[error("Invalid leverage {leverage}: {reason}")]
    InvalidLeverage { leverage: u32, reason: String },

    #[error("Position sizing failed for {symbol}: {reason}")]
    PositionSizing { symbol: String, reason: String },

    #[error("Symbol conflict: {symbol} already traded by strategy {strategy_id}")]
    SymbolConflict { symbol: String, strategy_id: String },

    #[error("Unknown account '{account_id}'. Available: {available}")]
    UnknownAccount { account_id: String, available: String },

    #[error(
        "Cannot delete account '{account_id}': {strategies} strategies still reference it. \
         Delete or reassign them first, or deactivate the account instead."
    )]
    AccountHasStrategies {
        account_id: String,
        strategies: usize,
    },

    // --- Lifecycle / state ---
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Strategy already running: {0}")]
    StrategyAlreadyRunning(String),

    #[error("Strategy not running: {0}")]
    StrategyNotRunning(String),

    #[error("Max concurrent strategies reached: {current}/{max_allowed}")]
    MaxConcurrentStrategies { current: usize, max_allowed: usize },

    #[error("Strategy {0} was stopped by risk management; reset it to stopped before starting")]
    StoppedByRisk(String),

    // --- Risk: the current tick skips execution, the loop continues ---
    #[error("Risk limit exceeded: {reason}")]
    RiskLimitExceeded { reason: String },

    #[error("Circuit breaker active for {scope} until {cooldown_until}")]
    CircuitBreakerActive {
        scope: String,
        cooldown_until: String,
    },

    #[error("Drawdown limit exceeded: {drawdown_pct:.2}% > {max_pct:.2}%")]
    DrawdownLimitExceeded { drawdown_pct: f64, max_pct: f64 },

    // --- Exchange ---
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    // --- Persistence ---
    #[error("Persistence unavailable: {reason}")]
    Persistence { reason: String },
}
