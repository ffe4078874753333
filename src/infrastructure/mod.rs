pub mod accounts;
pub mod binance;
pub mod cache;
pub mod mock;
pub mod notify;
pub mod persistence;
pub mod secrets;
