//! Request owners and dead-owner notification.
//!
//! An [`Owner`] stands for the request handle that currently borrows a
//! connection. The registry never keeps an owner alive: it only holds a weak
//! back-reference and a notification slot. When the last clone of an owner is
//! dropped, every registration made against it is posted to the registry's
//! dead-owner channel so the reclaimer can release the connection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::trace;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// One registration of a connection under an owner.
///
/// A fresh id is minted for every `put`, so a stale notification can never be
/// confused with a newer registration of the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl RegistrationId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct Watch {
    registration: RegistrationId,
    notify: Sender<RegistrationId>,
}

struct OwnerInner {
    id: OwnerId,
    watches: Mutex<Vec<Watch>>,
}

impl Drop for OwnerInner {
    fn drop(&mut self) {
        let watches = std::mem::take(
            self.watches
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for watch in watches {
            // The registry may already be gone; nothing to reclaim then.
            let _ = watch.notify.send(watch.registration);
        }
        trace!(owner = self.id.0, "owner dropped");
    }
}

/// Handle for the request that currently uses a connection.
///
/// Clones share identity. Dropping the last clone signals abandonment.
#[derive(Clone)]
pub struct Owner {
    inner: Arc<OwnerInner>,
}

impl Owner {
    /// Creates a new, unregistered owner.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(OwnerInner {
                id: OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)),
                watches: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This owner's identifier.
    pub fn id(&self) -> OwnerId {
        self.inner.id
    }

    /// Number of live registrations that will be notified on drop.
    pub fn watch_count(&self) -> usize {
        self.inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn watch(&self, registration: RegistrationId, notify: Sender<RegistrationId>) {
        self.inner
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Watch {
                registration,
                notify,
            });
    }

    pub(crate) fn downgrade(&self) -> OwnerRef {
        OwnerRef(Arc::downgrade(&self.inner))
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("id", &self.inner.id)
            .field("watches", &self.watch_count())
            .finish()
    }
}

/// Weak back-reference from a registration to its owner.
pub(crate) struct OwnerRef(Weak<OwnerInner>);

impl OwnerRef {
    /// Drops the notification for `registration` if the owner is still alive.
    pub(crate) fn unwatch(&self, registration: RegistrationId) {
        if let Some(inner) = self.0.upgrade() {
            inner
                .watches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|w| w.registration != registration);
        }
    }
}
