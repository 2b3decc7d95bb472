//! Idle connection pool with per-key LIFO reuse and background expiry.
//!
//! Each connection key owns a bounded stack of idle connections. The newest
//! entry sits at the front and is reused first; the oldest sits at the back and
//! is the first to expire. A single reaper thread sweeps expired entries while
//! the pool is non-empty and exits once it drains, to be restarted by the next
//! `put`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::KeepAliveConfig;
use crate::connection::{close_quietly, Connection, ConnectionId};
use crate::key::ConnectionKey;
use crate::metrics::CacheMetrics;

const REAPER_THREAD_NAME: &str = "keepalive-timer";

struct IdleEntry<C: ?Sized> {
    conn: Arc<C>,
    idle_start: Instant,
}

struct IdleStack<C: ?Sized> {
    /// Fixed when the stack is created, from the first connection's advertised timeout.
    timeout: Duration,
    /// Newest first.
    entries: VecDeque<IdleEntry<C>>,
}

impl<C: Connection + ?Sized> IdleStack<C> {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: VecDeque::new(),
        }
    }

    fn is_expired(&self, entry: &IdleEntry<C>, now: Instant) -> bool {
        now.saturating_duration_since(entry.idle_start) > self.timeout
    }

    fn position(&self, id: ConnectionId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| ConnectionId::of(&e.conn) == id)
    }

    /// Pops from the oldest end until a live entry is found.
    fn drain_expired(&mut self, now: Instant, out: &mut Vec<Arc<C>>) {
        while let Some(oldest) = self.entries.back() {
            if !self.is_expired(oldest, now) {
                break;
            }
            if let Some(entry) = self.entries.pop_back() {
                out.push(entry.conn);
            }
        }
    }
}

struct IdleState<C: ?Sized> {
    stacks: HashMap<ConnectionKey, IdleStack<C>>,
    reaper_running: bool,
}

struct IdleShared<C: ?Sized> {
    config: KeepAliveConfig,
    metrics: Arc<CacheMetrics>,
    state: Mutex<IdleState<C>>,
}

impl<C: ?Sized> IdleShared<C> {
    fn lock(&self) -> MutexGuard<'_, IdleState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded per-key pool of idle connections.
pub struct IdlePool<C: Connection + ?Sized> {
    shared: Arc<IdleShared<C>>,
}

impl<C: Connection + ?Sized> IdlePool<C> {
    /// Creates an empty pool.
    pub fn new(config: KeepAliveConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            shared: Arc::new(IdleShared {
                config,
                metrics,
                state: Mutex::new(IdleState {
                    stacks: HashMap::new(),
                    reaper_running: false,
                }),
            }),
        }
    }

    /// Offers `conn` for reuse under `key`.
    ///
    /// If the key already holds the maximum number of idle connections, the
    /// offered connection is closed and the cached ones are kept.
    pub fn put(&self, key: &ConnectionKey, conn: Arc<C>) {
        let max = self.shared.config.max_idle_per_key;
        let rejected = {
            let mut state = self.shared.lock();
            self.ensure_reaper(&mut state);

            let base = self.shared.config.base_lifetime;
            let stack = state
                .stacks
                .entry(key.clone())
                .or_insert_with(|| IdleStack::new(effective_timeout(conn.as_ref(), base)));

            if stack.position(ConnectionId::of(&conn)).is_some() {
                trace!(key = %key, "connection already idle");
                return;
            }

            if stack.entries.len() >= max {
                Some(conn)
            } else {
                stack.entries.push_front(IdleEntry {
                    conn,
                    idle_start: Instant::now(),
                });
                trace!(key = %key, idle = stack.entries.len(), "connection parked idle");
                None
            }
        };

        match rejected {
            Some(conn) => {
                debug!(key = %key, max, "idle stack full, closing offered connection");
                close_quietly(conn.as_ref(), "idle overflow");
                self.shared.metrics.inc_overflow_closes();
            }
            None => self.shared.metrics.inc_idle_puts(),
        }
    }

    /// Takes the most recently parked live connection for `key`.
    ///
    /// Expired entries met on the way are closed and discarded.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<C>> {
        let mut expired = Vec::new();
        let found = {
            let mut state = self.shared.lock();
            let stack = state.stacks.get_mut(key)?;
            let now = Instant::now();
            let mut found = None;
            while let Some(entry) = stack.entries.pop_front() {
                if stack.is_expired(&entry, now) {
                    expired.push(entry.conn);
                } else {
                    found = Some(entry.conn);
                    break;
                }
            }
            found
        };

        self.close_expired(expired);
        found
    }

    /// Detaches `conn` from the stack for `key` without closing it.
    ///
    /// Returns whether the connection was found. Drops the stack once empty.
    pub fn remove(&self, conn: &Arc<C>, key: &ConnectionKey) -> bool {
        let mut state = self.shared.lock();
        let Some(stack) = state.stacks.get_mut(key) else {
            return false;
        };
        let removed = match stack.position(ConnectionId::of(conn)) {
            Some(idx) => stack.entries.remove(idx).is_some(),
            None => false,
        };
        if stack.entries.is_empty() {
            state.stacks.remove(key);
        }
        removed
    }

    /// Whether `conn` is parked under `key`.
    pub fn contains(&self, conn: &Arc<C>, key: &ConnectionKey) -> bool {
        let state = self.shared.lock();
        state
            .stacks
            .get(key)
            .is_some_and(|s| s.position(ConnectionId::of(conn)).is_some())
    }

    /// Number of idle connections parked under `key`.
    pub fn len(&self, key: &ConnectionKey) -> usize {
        let state = self.shared.lock();
        state.stacks.get(key).map_or(0, |s| s.entries.len())
    }

    /// Number of idle connections across all keys.
    pub fn total(&self) -> usize {
        let state = self.shared.lock();
        state.stacks.values().map(|s| s.entries.len()).sum()
    }

    /// Number of keys with a stack, including stacks emptied by reuse but not yet reaped.
    pub fn key_count(&self) -> usize {
        self.shared.lock().stacks.len()
    }

    /// Whether the pool holds no stacks at all.
    pub fn is_empty(&self) -> bool {
        self.shared.lock().stacks.is_empty()
    }

    /// Effective idle timeout of the stack for `key`, if one exists.
    pub fn timeout_for(&self, key: &ConnectionKey) -> Option<Duration> {
        self.shared.lock().stacks.get(key).map(|s| s.timeout)
    }

    /// Whether the reaper thread is currently running.
    pub fn reaper_running(&self) -> bool {
        self.shared.lock().reaper_running
    }

    /// Closes every idle connection and empties the pool. Returns how many were closed.
    pub fn clear(&self) -> usize {
        let drained: Vec<Arc<C>> = {
            let mut state = self.shared.lock();
            state
                .stacks
                .drain()
                .flat_map(|(_, stack)| stack.entries.into_iter().map(|e| e.conn))
                .collect()
        };
        let count = drained.len();
        for conn in drained {
            close_quietly(conn.as_ref(), "pool cleared");
        }
        count
    }

    fn close_expired(&self, expired: Vec<Arc<C>>) {
        if expired.is_empty() {
            return;
        }
        self.shared.metrics.add_expired_closes(expired.len() as u64);
        for conn in expired {
            close_quietly(conn.as_ref(), "idle expired");
        }
    }

    /// Starts the reaper unless one is running. Called with the pool lock held.
    fn ensure_reaper(&self, state: &mut IdleState<C>) {
        if state.reaper_running {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.config.base_lifetime;
        let spawned = thread::Builder::new()
            .name(REAPER_THREAD_NAME.to_string())
            .spawn(move || reap_loop(weak, interval));
        match spawned {
            Ok(_) => {
                state.reaper_running = true;
                debug!(interval_ms = interval.as_millis() as u64, "idle reaper started");
            }
            // Expired entries are still skipped on `get`; the next `put` retries.
            Err(e) => warn!(error = %e, "failed to start idle reaper"),
        }
    }
}

impl<C: Connection + ?Sized> std::fmt::Debug for IdlePool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("IdlePool")
            .field("keys", &state.stacks.len())
            .field(
                "idle",
                &state.stacks.values().map(|s| s.entries.len()).sum::<usize>(),
            )
            .field("reaper_running", &state.reaper_running)
            .finish()
    }
}

fn effective_timeout<C: Connection + ?Sized>(conn: &C, base: Duration) -> Duration {
    match conn.keep_alive_timeout() {
        Some(t) if !t.is_zero() => t,
        _ => base,
    }
}

fn reap_loop<C: Connection + ?Sized>(pool: Weak<IdleShared<C>>, interval: Duration) {
    loop {
        thread::sleep(interval);

        let Some(shared) = pool.upgrade() else {
            return;
        };

        let mut expired = Vec::new();
        let done = {
            let mut state = shared.lock();
            let now = Instant::now();
            state.stacks.retain(|_, stack| {
                stack.drain_expired(now, &mut expired);
                !stack.entries.is_empty()
            });
            if state.stacks.is_empty() {
                state.reaper_running = false;
                true
            } else {
                false
            }
        };

        if !expired.is_empty() {
            debug!(count = expired.len(), "reaping expired idle connections");
            shared.metrics.add_expired_closes(expired.len() as u64);
            for conn in expired {
                close_quietly(conn.as_ref(), "idle expired");
            }
        }

        if done {
            debug!("idle pool empty, reaper exiting");
            return;
        }
    }
}
