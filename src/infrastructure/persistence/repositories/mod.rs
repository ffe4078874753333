pub mod account_repository;
pub mod breaker_event_repository;
pub mod completed_trade_repository;
pub mod parameter_history_repository;
pub mod risk_config_repository;
pub mod risk_metric_repository;
pub mod strategy_repository;
pub mod system_event_repository;
pub mod trade_repository;
pub mod user_repository;

pub use account_repository::AccountRepository;
pub use breaker_event_repository::BreakerEventRepository;
pub use completed_trade_repository::CompletedTradeRepository;
pub use parameter_history_repository::ParameterHistoryRepository;
pub use risk_config_repository::RiskConfigRepository;
pub use risk_metric_repository::RiskMetricRepository;
pub use strategy_repository::StrategyRepository;
pub use system_event_repository::SystemEventRepository;
pub use trade_repository::TradeRepository;
pub use user_repository::UserRepository;
