//! Connection Pool Management
//!
//! Lazily builds provider adapters through an [`AdapterFactory`], caches
//! them, and evicts the ones that have gone dormant.
//!
//! # Design
//!
//! The cache key depends on [`AdapterScope`]:
//! - `PerCredential` keys on (provider, model, credential), so every
//!   credential gets its own adapter and rotation is always honored.
//! - `PerModel` keys on (provider, model); the adapter built for the first
//!   credential is reused for all of them until it is pruned.
//!
//! Adapter construction is synchronous and never touches the network, so
//! the map lock is only held for lookups and inserts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::ProviderConfig;
use super::credentials::Credential;
use crate::backend::{AdapterError, ProviderAdapter};

// ============================================================================
// Factory
// ============================================================================

/// Builds adapters for a provider model under a credential
pub trait AdapterFactory: Send + Sync {
    fn build(
        &self,
        provider: &ProviderConfig,
        model: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn ProviderAdapter>, AdapterError>;
}

/// Granularity of the adapter cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterScope {
    #[default]
    PerCredential,
    PerModel,
}

// ============================================================================
// Pool Types
// ============================================================================

/// Errors returned by [`ConnectionPool::acquire`]
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to construct adapter for {provider}/{model}: {source}")]
    Construction {
        provider: String,
        model: String,
        #[source]
        source: AdapterError,
    },
}

/// Statistics for the pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Adapters currently cached
    pub cached: usize,
    /// Adapters built since startup
    pub built: u64,
    /// Adapters evicted for dormancy
    pub pruned: u64,
    pub construction_failures: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PoolKey {
    provider: String,
    model: String,
    credential: Option<String>,
}

struct PooledAdapter {
    adapter: Arc<dyn ProviderAdapter>,
    last_used: Instant,
    uses: u64,
}

impl PooledAdapter {
    fn new(adapter: Arc<dyn ProviderAdapter>, now: Instant) -> Self {
        Self {
            adapter,
            last_used: now,
            uses: 0,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_used = now;
        self.uses += 1;
    }

    fn is_dormant(&self, dormancy: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_used) > dormancy
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Cache of ready adapters shared by every request
pub struct ConnectionPool {
    factory: Arc<dyn AdapterFactory>,
    scope: AdapterScope,
    dormancy: Duration,
    adapters: Mutex<HashMap<PoolKey, PooledAdapter>>,
    built: AtomicU64,
    pruned: AtomicU64,
    construction_failures: AtomicU64,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn AdapterFactory>, scope: AdapterScope, dormancy: Duration) -> Self {
        Self {
            factory,
            scope,
            dormancy,
            adapters: Mutex::new(HashMap::new()),
            built: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            construction_failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn scope(&self) -> AdapterScope {
        self.scope
    }

    fn key(&self, provider: &str, model: &str, credential: &Credential) -> PoolKey {
        PoolKey {
            provider: provider.to_string(),
            model: model.to_string(),
            credential: match self.scope {
                AdapterScope::PerCredential => Some(credential.fingerprint().to_string()),
                AdapterScope::PerModel => None,
            },
        }
    }

    /// Get a cached adapter or build a new one
    pub fn acquire(
        &self,
        provider: &ProviderConfig,
        model: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn ProviderAdapter>, PoolError> {
        let key = self.key(&provider.name, model, credential);

        {
            let mut adapters = self.adapters.lock();
            if let Some(pooled) = adapters.get_mut(&key) {
                pooled.touch(Instant::now());
                return Ok(Arc::clone(&pooled.adapter));
            }
        }

        let adapter = match self.factory.build(provider, model, credential) {
            Ok(adapter) => adapter,
            Err(source) => {
                self.construction_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    provider = %provider.name,
                    model = %model,
                    credential = %credential.fingerprint(),
                    error = %source,
                    "Adapter construction failed"
                );
                return Err(PoolError::Construction {
                    provider: provider.name.clone(),
                    model: model.to_string(),
                    source,
                });
            }
        };

        let now = Instant::now();
        let mut adapters = self.adapters.lock();
        let pooled = adapters.entry(key).or_insert_with(|| {
            self.built.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                provider = %provider.name,
                model = %model,
                credential = %credential.fingerprint(),
                "Adapter created"
            );
            PooledAdapter::new(adapter, now)
        });
        pooled.touch(now);
        Ok(Arc::clone(&pooled.adapter))
    }

    /// Evict adapters idle longer than the dormancy threshold
    ///
    /// Returns the number evicted.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<(PoolKey, PooledAdapter)> = {
            let mut adapters = self.adapters.lock();
            let dormant: Vec<PoolKey> = adapters
                .iter()
                .filter(|(_, pooled)| pooled.is_dormant(self.dormancy, now))
                .map(|(key, _)| key.clone())
                .collect();
            dormant
                .into_iter()
                .filter_map(|key| adapters.remove(&key).map(|pooled| (key, pooled)))
                .collect()
        };

        for (key, pooled) in &evicted {
            pooled.adapter.release();
            tracing::debug!(
                provider = %key.provider,
                model = %key.model,
                uses = pooled.uses,
                "Pruned dormant adapter"
            );
        }

        let count = evicted.len();
        if count > 0 {
            self.pruned.fetch_add(count as u64, Ordering::Relaxed);
            tracing::info!(count, "Pruned dormant adapters");
        }
        count
    }

    /// Drop every cached adapter
    pub fn clear(&self) {
        let drained: Vec<PooledAdapter> = self.adapters.lock().drain().map(|(_, p)| p).collect();
        for pooled in drained {
            pooled.adapter.release();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            cached: self.len(),
            built: self.built.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            construction_failures: self.construction_failures.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic prune task
    pub fn spawn_pruner(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                pool.prune();
            }
        })
    }
}
