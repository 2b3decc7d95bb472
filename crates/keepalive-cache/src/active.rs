//! Registry of connections lent to in-flight requests.
//!
//! Every registration links a connection to the [`Owner`] that borrowed it.
//! The owner is held weakly. When its last handle drops, the registration id
//! arrives on the dead-owner channel and the reclaimer thread releases the
//! connection: if its response stream is one that returns the connection to
//! the cache on close, the stream is closed so the connection ends up idle;
//! otherwise the connection is simply dropped.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::KeepAliveConfig;
use crate::connection::{Connection, ConnectionId};
use crate::metrics::CacheMetrics;
use crate::owner::{Owner, OwnerRef, RegistrationId};

const RECLAIMER_THREAD_NAME: &str = "keepalive-gc-handler";

struct Registration<C: ?Sized> {
    conn: Arc<C>,
    owner: OwnerRef,
}

struct ActiveState<C: ?Sized> {
    owners: HashMap<RegistrationId, Registration<C>>,
    clients: HashMap<ConnectionId, RegistrationId>,
    reclaimer_running: bool,
    /// Parked here whenever no reclaimer thread owns it.
    dead_rx: Option<Receiver<RegistrationId>>,
}

struct ActiveShared<C: ?Sized> {
    config: KeepAliveConfig,
    metrics: Arc<CacheMetrics>,
    dead_tx: Sender<RegistrationId>,
    state: Mutex<ActiveState<C>>,
}

impl<C: ?Sized> ActiveShared<C> {
    fn lock(&self) -> MutexGuard<'_, ActiveState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Connection + ?Sized> ActiveShared<C> {
    fn reclaim(&self, registration: RegistrationId) {
        let conn = {
            let mut state = self.lock();
            let Some(entry) = state.owners.remove(&registration) else {
                // Already released through `remove` or `put_idle`.
                trace!(?registration, "dead owner has no registration");
                return;
            };
            let id = ConnectionId::of(&entry.conn);
            if state.clients.get(&id).copied() != Some(registration) {
                // Re-registered under another owner without a release in between.
                debug!(?registration, connection = ?id, "stale registration, skipping reclamation");
                return;
            }
            state.clients.remove(&id);
            entry.conn
        };

        self.metrics.inc_owners_reclaimed();

        match conn.response_stream() {
            Some(stream) if stream.kind().returns_on_close() => {
                debug!(
                    key = %conn.key(),
                    kind = ?stream.kind(),
                    "closing abandoned response stream"
                );
                match stream.close() {
                    Ok(()) => self.metrics.inc_streams_closed(),
                    Err(e) => {
                        debug!(key = %conn.key(), error = %e, "ignoring stream close failure")
                    }
                }
            }
            _ => trace!(key = %conn.key(), "abandoned connection not reusable, dropping"),
        }
    }
}

/// Tracks which owner each active connection is lent to.
pub struct ActiveRegistry<C: Connection + ?Sized> {
    shared: Arc<ActiveShared<C>>,
}

impl<C: Connection + ?Sized> ActiveRegistry<C> {
    /// Creates an empty registry.
    pub fn new(config: KeepAliveConfig, metrics: Arc<CacheMetrics>) -> Self {
        let (dead_tx, dead_rx) = mpsc::channel();
        Self {
            shared: Arc::new(ActiveShared {
                config,
                metrics,
                dead_tx,
                state: Mutex::new(ActiveState {
                    owners: HashMap::new(),
                    clients: HashMap::new(),
                    reclaimer_running: false,
                    dead_rx: Some(dead_rx),
                }),
            }),
        }
    }

    /// Records that `conn` is now in use by `owner`.
    pub fn put(&self, conn: Arc<C>, owner: &Owner) {
        let registration = RegistrationId::next();
        let id = ConnectionId::of(&conn);
        owner.watch(registration, self.shared.dead_tx.clone());
        {
            let mut state = self.shared.lock();
            state.owners.insert(
                registration,
                Registration {
                    conn,
                    owner: owner.downgrade(),
                },
            );
            state.clients.insert(id, registration);
            self.ensure_reclaimer(&mut state);
        }
        self.shared.metrics.inc_active_registrations();
        trace!(?registration, owner = owner.id().as_u64(), "connection registered active");
    }

    /// Forgets any registration of `conn`. Returns whether one existed.
    pub fn remove(&self, conn: &Arc<C>) -> bool {
        let id = ConnectionId::of(conn);
        let released = {
            let mut state = self.shared.lock();
            match state.clients.remove(&id) {
                Some(reg) => state.owners.remove(&reg).map(|entry| (reg, entry)),
                None => None,
            }
        };
        match released {
            Some((registration, entry)) => {
                entry.owner.unwatch(registration);
                true
            }
            None => false,
        }
    }

    /// Whether `conn` is currently registered.
    pub fn contains(&self, conn: &Arc<C>) -> bool {
        self.shared
            .lock()
            .clients
            .contains_key(&ConnectionId::of(conn))
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.shared.lock().owners.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.shared.lock().owners.is_empty()
    }

    /// Whether the reclaimer thread is currently running.
    pub fn reclaimer_running(&self) -> bool {
        self.shared.lock().reclaimer_running
    }

    /// Drops every registration without touching the connections. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<(RegistrationId, Registration<C>)> = {
            let mut state = self.shared.lock();
            state.clients.clear();
            state.owners.drain().collect()
        };
        let count = drained.len();
        for (registration, entry) in drained {
            entry.owner.unwatch(registration);
        }
        count
    }

    /// Starts the reclaimer unless one is running. Called with the registry lock held.
    fn ensure_reclaimer(&self, state: &mut ActiveState<C>) {
        if state.reclaimer_running {
            return;
        }
        let Some(rx) = state.dead_rx.take() else {
            warn!("reclaimer channel missing, abandoned connections will not be reclaimed");
            return;
        };

        let weak = Arc::downgrade(&self.shared);
        let poll = self.shared.config.reclaim_poll_interval;
        // The receiver must come back if the thread cannot be created.
        let handoff = Arc::new(Mutex::new(Some(rx)));
        let slot = handoff.clone();
        let spawned = thread::Builder::new()
            .name(RECLAIMER_THREAD_NAME.to_string())
            .spawn(move || {
                let rx = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(rx) = rx {
                    reclaim_loop(weak, rx, poll);
                }
            });

        match spawned {
            Ok(_) => {
                state.reclaimer_running = true;
                debug!("active reclaimer started");
            }
            Err(e) => {
                state.dead_rx = handoff.lock().unwrap_or_else(PoisonError::into_inner).take();
                warn!(error = %e, "failed to start active reclaimer");
            }
        }
    }
}

impl<C: Connection + ?Sized> std::fmt::Debug for ActiveRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ActiveRegistry")
            .field("active", &state.owners.len())
            .field("reclaimer_running", &state.reclaimer_running)
            .finish()
    }
}

fn reclaim_loop<C: Connection + ?Sized>(
    registry: Weak<ActiveShared<C>>,
    rx: Receiver<RegistrationId>,
    poll: Duration,
) {
    loop {
        let event = rx.recv_timeout(poll);

        let Some(shared) = registry.upgrade() else {
            return;
        };

        match event {
            Ok(registration) => shared.reclaim(registration),
            Err(RecvTimeoutError::Timeout) => trace!("reclaimer woke with no dead owners"),
            Err(RecvTimeoutError::Disconnected) => {}
        }

        let mut state = shared.lock();
        if state.owners.is_empty() {
            state.reclaimer_running = false;
            state.dead_rx = Some(rx);
            debug!("active registry empty, reclaimer exiting");
            return;
        }
    }
}
