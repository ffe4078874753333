use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted exchange account. Credentials are stored encrypted and stay
/// opaque to the engine; only the registry's cipher can turn a row back
/// into a usable [`AccountConfig`].
///
/// At most one account per user carries `is_default = true`; the
/// repository clears the flag on every sibling in the same transaction
/// that sets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Database row id, `None` until persisted.
    pub id: Option<i64>,
    pub user_id: Uuid,
    /// Lowercase short identifier, unique per user (e.g. "default", "main1").
    pub account_id: String,
    pub name: String,
    pub api_key_encrypted: String,
    pub api_secret_encrypted: String,
    pub exchange_platform: String,
    pub testnet: bool,
    pub is_default: bool,
    pub is_active: bool,
    pub paper_trading: bool,
    pub paper_balance: Option<f64>,
}

impl Account {
    /// Rows written only to satisfy the strategies foreign key carry no
    /// credentials; they are never loaded into the registry.
    pub fn has_credentials(&self) -> bool {
        !self.api_key_encrypted.is_empty() && !self.api_secret_encrypted.is_empty()
    }
}

/// Decrypted runtime view of one account, handed to the exchange client.
/// Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
}

impl AccountConfig {
    pub fn new(account_id: &str, name: &str, api_key: &str, api_secret: &str, testnet: bool) -> Self {
        Self {
            account_id: account_id.to_lowercase(),
            name: name.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            testnet,
        }
    }

    /// Placeholder credentials for injected mock clients.
    pub fn mock(account_id: &str) -> Self {
        Self::new(account_id, "Mock Account", "mock", "mock", true)
    }
}
