//! Account registry: lowercase short id → credentials + lazily built client.
//!
//! Accounts live in the authoritative store with encrypted credentials;
//! the registry decrypts them at load time into the runtime map and
//! encrypts on every write. Environment variables only seed the store on
//! first boot; after that the database is authoritative.

use crate::domain::account::{Account, AccountConfig};
use crate::domain::errors::EngineError;
use crate::domain::ports::ExchangeApi;
use crate::infrastructure::binance::BinanceFuturesClient;
use crate::infrastructure::persistence::StateStore;
use crate::infrastructure::secrets::CredentialCipher;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct ClientManager {
    /// Decrypted runtime view, keyed by the short account id.
    accounts: RwLock<HashMap<String, AccountConfig>>,
    clients: RwLock<HashMap<String, Arc<dyn ExchangeApi>>>,
    /// The account marked `is_default` in the store, when known.
    default_account: RwLock<Option<String>>,
    store: Option<Arc<StateStore>>,
    cipher: Option<CredentialCipher>,
}

impl ClientManager {
    /// Memory-only registry (tests, degraded mode without a store).
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            default_account: RwLock::new(None),
            store: None,
            cipher: None,
        }
    }

    /// Store-backed registry: accounts persist with encrypted credentials.
    pub fn with_store(store: Arc<StateStore>, cipher: CredentialCipher) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            default_account: RwLock::new(None),
            store: Some(store),
            cipher: Some(cipher),
        }
    }

    /// Load active accounts from the store, decrypting credentials into the
    /// runtime map. Placeholder rows (no credentials) and rows the cipher
    /// cannot open are skipped, not fatal. Returns how many were loaded.
    pub async fn load_from_store(&self) -> anyhow::Result<usize> {
        let (Some(store), Some(cipher)) = (&self.store, &self.cipher) else {
            return Ok(0);
        };

        let mut loaded = 0usize;
        for account in store.load_accounts().await? {
            if !account.is_active {
                debug!("Skipping inactive account '{}'", account.account_id);
                continue;
            }
            if !account.has_credentials() {
                debug!(
                    "Skipping account '{}' without stored credentials",
                    account.account_id
                );
                continue;
            }
            let (api_key, api_secret) = match (
                cipher.decrypt(&account.api_key_encrypted),
                cipher.decrypt(&account.api_secret_encrypted),
            ) {
                (Ok(key), Ok(secret)) => (key, secret),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(
                        "Cannot decrypt credentials for account '{}': {}. Skipping.",
                        account.account_id, e
                    );
                    continue;
                }
            };

            let config = AccountConfig {
                account_id: account.account_id.clone(),
                name: account.name.clone(),
                api_key,
                api_secret,
                testnet: account.testnet,
            };
            self.accounts
                .write()
                .await
                .insert(account.account_id.clone(), config);
            if account.is_default {
                *self.default_account.write().await = Some(account.account_id.clone());
            }
            loaded += 1;
        }

        info!("Loaded {} exchange accounts from the state store", loaded);
        Ok(loaded)
    }

    /// Register an account: persist it (encrypted) when a store is
    /// attached, then install the runtime view. `is_default` exclusivity is
    /// enforced by the repository in one transaction.
    pub async fn add_account(
        &self,
        config: AccountConfig,
        is_default: bool,
    ) -> anyhow::Result<()> {
        let account_id = config.account_id.clone();

        if let (Some(store), Some(cipher)) = (&self.store, &self.cipher) {
            let account = Account {
                id: None,
                user_id: store.user_id(),
                account_id: account_id.clone(),
                name: config.name.clone(),
                api_key_encrypted: cipher.encrypt(&config.api_key)?,
                api_secret_encrypted: cipher.encrypt(&config.api_secret)?,
                exchange_platform: "binance_futures".to_string(),
                testnet: config.testnet,
                is_default,
                is_active: true,
                paper_trading: false,
                paper_balance: None,
            };
            store.save_account(&account).await?;
        }

        self.accounts.write().await.insert(account_id.clone(), config);
        if is_default {
            *self.default_account.write().await = Some(account_id.clone());
        }

        info!("Registered exchange account '{}'", account_id);
        Ok(())
    }

    /// Hard delete. Refused while strategies still reference the account
    /// (RESTRICT); deactivate instead when history must be kept.
    pub async fn remove_account(&self, account_id: &str) -> Result<bool, EngineError> {
        let account_id = account_id.to_lowercase();

        if let Some(store) = &self.store {
            let strategies = store
                .account_strategy_count(&account_id)
                .await
                .map_err(|e| EngineError::Persistence {
                    reason: e.to_string(),
                })?;
            if strategies > 0 {
                return Err(EngineError::AccountHasStrategies {
                    account_id,
                    strategies: strategies as usize,
                });
            }
            store
                .delete_account(&account_id)
                .await
                .map_err(|e| EngineError::Persistence {
                    reason: e.to_string(),
                })?;
        }

        let existed = self.accounts.write().await.remove(&account_id).is_some();
        self.clients.write().await.remove(&account_id);
        let mut default = self.default_account.write().await;
        if default.as_deref() == Some(&account_id) {
            *default = None;
        }

        if existed {
            info!("Deleted exchange account '{}'", account_id);
        }
        Ok(existed)
    }

    /// Deactivate without deleting: the row and its history stay, the
    /// runtime map drops the account.
    pub async fn deactivate_account(&self, account_id: &str) -> Result<(), EngineError> {
        let account_id = account_id.to_lowercase();
        if let Some(store) = &self.store {
            store
                .set_account_active(&account_id, false)
                .await
                .map_err(|e| EngineError::Persistence {
                    reason: e.to_string(),
                })?;
        }
        self.accounts.write().await.remove(&account_id);
        self.clients.write().await.remove(&account_id);
        info!("Deactivated exchange account '{}'", account_id);
        Ok(())
    }

    /// Install a ready-made client for an account. Injected clients always
    /// win over lazily constructed ones, so tests can pin a mock under
    /// `default` regardless of environment configuration.
    pub async fn inject_client(&self, account_id: &str, client: Arc<dyn ExchangeApi>) {
        let account_id = account_id.to_lowercase();
        self.accounts
            .write()
            .await
            .entry(account_id.clone())
            .or_insert_with(|| AccountConfig::mock(&account_id));
        self.clients.write().await.insert(account_id, client);
    }

    pub async fn account_exists(&self, account_id: &str) -> bool {
        self.accounts
            .read()
            .await
            .contains_key(&account_id.to_lowercase())
    }

    pub async fn account_config(&self, account_id: &str) -> Option<AccountConfig> {
        self.accounts
            .read()
            .await
            .get(&account_id.to_lowercase())
            .cloned()
    }

    /// Short id of the account marked default, falling back to `default`.
    pub async fn default_account_id(&self) -> String {
        self.default_account
            .read()
            .await
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    pub async fn list_accounts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live client for the account, constructing one on first use.
    pub async fn get_client(&self, account_id: &str) -> Result<Arc<dyn ExchangeApi>, EngineError> {
        let account_id = account_id.to_lowercase();

        if let Some(client) = self.clients.read().await.get(&account_id) {
            return Ok(client.clone());
        }

        let config = {
            let accounts = self.accounts.read().await;
            accounts.get(&account_id).cloned()
        };
        let Some(config) = config else {
            let available = self.list_accounts().await.join(", ");
            return Err(EngineError::UnknownAccount {
                account_id,
                available,
            });
        };

        let client: Arc<dyn ExchangeApi> = Arc::new(BinanceFuturesClient::new(&config));
        let mut clients = self.clients.write().await;
        // Another task may have constructed (or a test injected) one in the
        // meantime; first writer wins.
        let client = clients.entry(account_id).or_insert(client).clone();
        Ok(client)
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockExchange;

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let manager = ClientManager::new();
        assert!(!manager.account_exists("nope").await);
        assert!(matches!(
            manager.get_client("nope").await,
            Err(EngineError::UnknownAccount { .. })
        ));
    }

    #[tokio::test]
    async fn injected_client_registers_the_account() {
        let manager = ClientManager::new();
        manager
            .inject_client("Default", Arc::new(MockExchange::new()))
            .await;

        assert!(manager.account_exists("default").await);
        assert!(manager.get_client("default").await.is_ok());
        assert_eq!(manager.list_accounts().await, vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn injected_client_overrides_lazy_construction() {
        let manager = ClientManager::new();
        let mock = Arc::new(MockExchange::new());
        mock.set_balance(777.0);
        manager.inject_client("default", mock).await;
        manager
            .add_account(AccountConfig::new("default", "Main", "k", "s", true), true)
            .await
            .unwrap();

        let client = manager.get_client("default").await.unwrap();
        assert_eq!(client.futures_account_balance().await.unwrap(), 777.0);
    }

    #[tokio::test]
    async fn default_account_id_tracks_the_flag() {
        let manager = ClientManager::new();
        assert_eq!(manager.default_account_id().await, "default");

        manager
            .add_account(AccountConfig::new("main1", "Main", "k", "s", true), true)
            .await
            .unwrap();
        assert_eq!(manager.default_account_id().await, "main1");
    }
}
