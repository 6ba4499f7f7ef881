//! Transparent proxy middleware in front of the local cluster: requests
//! are forwarded as-is, and misses on namespaces covered by a sync or
//! migration profile are serviced from the remote store.

use axum::Router;
use axum::routing::any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use strato_core::config::{Config, ConfigWatcher};
use strato_core::error::{Result, StratoError};
use strato_core::provider::{ProviderConfig, RemoteProvider};
use tokio::sync::{Mutex, RwLock};

mod listing;
mod proxy;

pub use listing::{ListingFormat, merge_listings, render_listing};
pub use proxy::{response_is_complete, shunt_request};

/// Hop-by-hop headers never forwarded in either direction.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Serving state: the active config plus lazily-built providers, swapped
/// wholesale when the config file changes on disk.
pub struct ShuntState {
    watcher: Mutex<ConfigWatcher>,
    active: RwLock<Arc<ActiveConfig>>,
    client: reqwest::Client,
}

pub struct ActiveConfig {
    pub config: Config,
    providers: Mutex<HashMap<(String, String), Arc<RemoteProvider>>>,
}

impl ShuntState {
    pub fn new(config_path: PathBuf) -> Result<Arc<Self>> {
        let mut watcher = ConfigWatcher::new(config_path.clone());
        let config = watcher.poll().ok_or_else(|| {
            StratoError::Config(format!("cannot load config {}", config_path.display()))
        })?;
        Ok(Arc::new(Self {
            watcher: Mutex::new(watcher),
            active: RwLock::new(Arc::new(ActiveConfig {
                config,
                providers: Mutex::new(HashMap::new()),
            })),
            client: reqwest::Client::new(),
        }))
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// The active config, refreshed first if the file changed. A broken
    /// rewrite keeps the previous config serving.
    pub async fn active(&self) -> Arc<ActiveConfig> {
        {
            let mut watcher = self.watcher.lock().await;
            if let Some(config) = watcher.poll() {
                tracing::info!("Shunt configuration reloaded");
                *self.active.write().await = Arc::new(ActiveConfig {
                    config,
                    providers: Mutex::new(HashMap::new()),
                });
            }
        }
        self.active.read().await.clone()
    }
}

impl ActiveConfig {
    /// Whether any profile shunts this (account, container) namespace, and
    /// whether it comes from a migration (migrations also shunt listings).
    pub fn covering_profile(
        &self,
        account: &str,
        container: &str,
    ) -> Option<(ProviderConfig, bool)> {
        if let Some(migration) = self.config.migration_for(account, container) {
            if migration.merge_namespaces || migration.all_buckets() {
                let mut resolved = migration.clone();
                if migration.all_buckets() {
                    resolved = migration.for_bucket(container);
                }
                return Some((ProviderConfig::from_migration(&resolved), true));
            }
        }
        let profile = self.config.sync_profile_for(account, container)?;
        if !profile.merge_namespaces {
            return None;
        }
        let resolved = if profile.per_account() {
            profile.for_container(container)
        } else {
            profile.clone()
        };
        Some((ProviderConfig::from_sync(&resolved), false))
    }

    /// Wildcard migration for account-level listings.
    pub fn account_migration(&self, account: &str) -> Option<ProviderConfig> {
        self.config
            .migrations
            .iter()
            .find(|m| m.account == account && m.all_buckets())
            .map(ProviderConfig::from_migration)
    }

    pub async fn provider(
        &self,
        key: (String, String),
        config: ProviderConfig,
    ) -> Result<Arc<RemoteProvider>> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&key) {
            return Ok(provider.clone());
        }
        let provider = Arc::new(RemoteProvider::create(config).await?);
        providers.insert(key, provider.clone());
        Ok(provider)
    }
}

/// The proxy router: every path under /v1 flows through the shunt.
pub fn router(state: Arc<ShuntState>) -> Router {
    Router::new()
        .route("/v1/:account", any(proxy::handle_account))
        .route("/v1/:account/:container", any(proxy::handle_container))
        .route("/v1/:account/:container/*object", any(proxy::handle_object))
        .with_state(state)
}

pub use strato_core::provider::ListEntry;
