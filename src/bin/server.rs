//! Futrade server - headless strategy engine.
//!
//! Boots the state store (with bounded retry), warms the in-memory view,
//! restores strategies that were running before the restart and then runs
//! until Ctrl+C. If the store is unreachable the process still comes up in
//! degraded mode: reads come from the cache mirror and writes are refused
//! until the health probe sees the database again.

use anyhow::Result;
use futrade::application::engine::Engine;
use futures_util::future::join_all;
use futrade::config::Config;
use futrade::domain::account::AccountConfig;
use futrade::domain::ports::Notifier;
use futrade::infrastructure::accounts::ClientManager;
use futrade::infrastructure::cache::CacheMirror;
use futrade::infrastructure::notify::LogNotifier;
use futrade::infrastructure::persistence::StateStore;
use futrade::infrastructure::secrets::CredentialCipher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Futrade server {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: testnet={}, max_concurrent={}, db={}",
        config.binance_testnet, config.max_concurrent_strategies, config.database_url
    );

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    // Authoritative store with bounded retry; degraded mode on failure.
    let store = match StateStore::open_with_retry(&config.database_url, config.user_id).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            error!(
                "State store unavailable, continuing in degraded mode (writes refused): {}",
                e
            );
            None
        }
    };
    if let Some(store) = &store
        && let Err(e) = store.provision_user().await
    {
        warn!("Failed to provision tenant user: {}", e);
    }

    // Accounts live in the store with encrypted credentials; environment
    // credentials only seed the store on first boot.
    let cipher = if config.credentials_secret.is_empty() {
        warn!("CREDENTIALS_SECRET not set; deriving the credential key from a development default");
        CredentialCipher::from_secret("futrade-dev-secret")
    } else {
        CredentialCipher::from_secret(&config.credentials_secret)
    };
    let clients = Arc::new(match &store {
        Some(store) => ClientManager::with_store(store.clone(), cipher),
        None => ClientManager::new(),
    });
    if let Err(e) = clients.load_from_store().await {
        error!("Failed to load accounts from the state store: {}", e);
    }
    if !config.binance_api_key.is_empty() && !clients.account_exists("default").await {
        let make_default = match &store {
            Some(store) => store.load_default_account().await.ok().flatten().is_none(),
            None => true,
        };
        info!("Migrating environment credentials into the account store (default account)");
        if let Err(e) = clients
            .add_account(
                AccountConfig::new(
                    "default",
                    "Default Account",
                    &config.binance_api_key,
                    &config.binance_api_secret,
                    config.binance_testnet,
                ),
                make_default,
            )
            .await
        {
            error!("Failed to register default account: {}", e);
        }
    }
    if clients.list_accounts().await.is_empty() {
        warn!("No exchange accounts available; configure one or set BINANCE_API_KEY");
    }

    let cache = if config.redis_enabled
        && let Some(redis_url) = &config.redis_url
    {
        match CacheMirror::connect(redis_url, config.trade_history_limit).await {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!("Cache mirror unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let engine = Engine::new(
        config.engine_config(),
        clients.clone(),
        store.clone(),
        cache,
        notifier.clone(),
    );

    // Hydrate memory (cache warms, store wins), install risk configs,
    // restart whatever was running.
    if let Err(e) = engine.hydrate().await {
        error!("Hydration from the state store failed: {}", e);
    }
    if let Err(e) = engine.load_risk_configs().await {
        error!("Loading risk configs failed: {}", e);
    }
    // Accounts without a stored risk config get an empty one anchored in
    // the configured timezone, so limits added at runtime use it.
    for account_id in clients.list_accounts().await {
        if engine.risk().account_config(&account_id).await.is_none() {
            engine
                .risk()
                .set_account_config(
                    &account_id,
                    Some(futrade::domain::risk_config::RiskConfig {
                        timezone: config.risk_timezone.clone(),
                        ..futrade::domain::risk_config::RiskConfig::default()
                    }),
                )
                .await;
        }
    }
    let (restored, errors) = engine.restore_running_strategies().await;
    info!(
        "Restoration complete: {} restored, {} failed",
        restored,
        errors.len()
    );

    let _reaper = engine
        .spawn_dead_task_reaper(Duration::from_secs(config.dead_task_cleanup_interval_seconds));
    let _watcher =
        engine.spawn_breaker_watcher(Duration::from_secs(config.breaker_watch_interval_seconds));
    let _health = store.as_ref().map(|store| {
        store.clone().spawn_health_monitor(
            notifier.clone(),
            Duration::from_secs(config.db_health_check_interval_seconds),
        )
    });

    info!("Engine running. Press Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping strategies...");

    let running: Vec<_> = engine
        .list_strategies()
        .await
        .into_iter()
        .filter(|s| s.status == futrade::domain::strategy::StrategyStatus::Running)
        .collect();
    let results = join_all(running.iter().map(|s| engine.stop(&s.id))).await;
    for (summary, result) in running.iter().zip(results) {
        if let Err(e) = result {
            warn!("Failed to stop strategy {} on shutdown: {}", summary.id, e);
        }
    }

    info!("Clean shutdown complete.");
    Ok(())
}
