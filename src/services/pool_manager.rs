use crate::config::DatabaseConfig;
use crate::services::db_adapter::{self, DbAdapter};
use crate::utils::CollectorResult;
use dashmap::DashMap;
use std::sync::Arc;

/// Manager for database adapters (and the pools they own) using DashMap
///
/// Maintains one adapter per configured endpoint so scrapers, the feature
/// detector and the ASH sampler share a pool instead of reconnecting.
#[derive(Clone, Default)]
pub struct AdapterManager {
    adapters: Arc<DashMap<String, Arc<dyn DbAdapter>>>,
}

impl AdapterManager {
    pub fn new() -> Self {
        Self { adapters: Arc::new(DashMap::new()) }
    }

    /// Get or create the adapter for the given endpoint
    ///
    /// Fast path: if the adapter exists, return immediately (lock-free read)
    /// Slow path: connect and cache
    pub async fn get_adapter(&self, config: &DatabaseConfig) -> CollectorResult<Arc<dyn DbAdapter>> {
        let key = format!("{}/{}/{}", config.kind, config.endpoint(), config.database);

        if let Some(adapter) = self.adapters.get(&key) {
            return Ok(adapter.clone());
        }

        let adapter = db_adapter::create_adapter(config).await?;
        self.adapters.insert(key.clone(), adapter.clone());

        tracing::info!("Registered adapter for {} ({})", config.display_name(), key);

        Ok(adapter)
    }

    /// Remove and close the adapter for one endpoint
    pub async fn remove_adapter(&self, key: &str) {
        if let Some((_, adapter)) = self.adapters.remove(key) {
            adapter.close().await;
            tracing::info!("Removed adapter {}", key);
        }
    }

    /// Close every adapter; used on shutdown
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove_adapter(&key).await;
        }
        tracing::info!("Closed all database adapters");
    }

    /// Adapter count (for monitoring)
    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }
}
