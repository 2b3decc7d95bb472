//! Keep-alive cache façade combining the active registry and the idle pool.
//!
//! Request-processing code talks only to [`KeepAliveCache`]. The two
//! underlying structures have independent locks and no operation here holds
//! both at once.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, trace};

use crate::active::ActiveRegistry;
use crate::config::KeepAliveConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::idle::IdlePool;
use crate::key::ConnectionKey;
use crate::metrics::CacheMetrics;
use crate::owner::Owner;

/// Point-in-time occupancy of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Idle connections across all keys.
    pub idle_connections: usize,
    /// Keys with an idle stack.
    pub idle_keys: usize,
    /// Connections registered as active.
    pub active_connections: usize,
}

/// Cache of active and idle keep-alive connections.
pub struct KeepAliveCache<C: Connection + ?Sized> {
    config: KeepAliveConfig,
    metrics: Arc<CacheMetrics>,
    active: ActiveRegistry<C>,
    idle: IdlePool<C>,
}

impl<C: Connection + ?Sized> KeepAliveCache<C> {
    /// Creates a cache with an explicit configuration.
    pub fn new(config: KeepAliveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Creates a cache from the process-wide configuration.
    pub fn with_defaults() -> Self {
        Self::build(KeepAliveConfig::global().clone())
    }

    fn build(config: KeepAliveConfig) -> Self {
        let metrics = Arc::new(CacheMetrics::new());
        Self {
            active: ActiveRegistry::new(config.clone(), metrics.clone()),
            idle: IdlePool::new(config.clone(), metrics.clone()),
            config,
            metrics,
        }
    }

    /// Registers `conn` as in use by `owner`.
    ///
    /// Without an owner the connection is not tracked for reclamation.
    pub fn put_active(&self, conn: Arc<C>, owner: Option<&Owner>) {
        if let Some(owner) = owner {
            self.active.put(conn, owner);
        }
    }

    /// Marks `conn` idle and available for reuse under `key`.
    pub fn put_idle(&self, key: &ConnectionKey, conn: Arc<C>) {
        self.active.remove(&conn);
        self.idle.put(key, conn);
    }

    /// Takes an idle connection for `key`, registering it as active under
    /// `requester` when one is given.
    ///
    /// `None` means the caller must open a new connection.
    pub fn get_idle(&self, key: &ConnectionKey, requester: Option<&Owner>) -> Option<Arc<C>> {
        let Some(conn) = self.idle.get(key) else {
            self.metrics.inc_idle_misses();
            trace!(key = %key, "no idle connection");
            return None;
        };
        self.metrics.inc_idle_hits();
        if let Some(owner) = requester {
            self.active.put(conn.clone(), owner);
        }
        Some(conn)
    }

    /// Forgets `conn` entirely, e.g. after a protocol error. Does not close it.
    pub fn remove(&self, conn: &Arc<C>, key: &ConnectionKey) {
        self.active.remove(conn);
        self.idle.remove(conn, key);
        self.metrics.inc_removals();
    }

    /// Use [`KeepAliveCache::put_idle`] instead.
    #[deprecated(note = "use put_idle")]
    pub fn put(&self, key: &ConnectionKey, conn: Arc<C>) {
        self.put_idle(key, conn);
    }

    /// Use [`KeepAliveCache::get_idle`] instead.
    #[deprecated(note = "use get_idle")]
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<C>> {
        self.get_idle(key, None)
    }

    /// Whether `conn` is registered as active.
    pub fn is_active(&self, conn: &Arc<C>) -> bool {
        self.active.contains(conn)
    }

    /// Whether `conn` is parked idle under `key`.
    pub fn is_idle(&self, conn: &Arc<C>, key: &ConnectionKey) -> bool {
        self.idle.contains(conn, key)
    }

    /// Number of idle connections parked under `key`.
    pub fn idle_count(&self, key: &ConnectionKey) -> usize {
        self.idle.len(key)
    }

    /// Current occupancy.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            idle_connections: self.idle.total(),
            idle_keys: self.idle.key_count(),
            active_connections: self.active.len(),
        }
    }

    /// Event counters since creation.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Closes every idle connection and forgets every active registration.
    pub fn shutdown(&self) -> CacheStats {
        let active = self.active.clear();
        let idle = self.idle.clear();
        info!(idle, active, "keep-alive cache shut down");
        CacheStats {
            idle_connections: idle,
            idle_keys: 0,
            active_connections: active,
        }
    }
}

impl<C: Connection + ?Sized> std::fmt::Debug for KeepAliveCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveCache")
            .field("config", &self.config)
            .field("active", &self.active)
            .field("idle", &self.idle)
            .finish()
    }
}
