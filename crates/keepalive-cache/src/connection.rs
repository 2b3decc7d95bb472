//! Abstractions the cache needs from the transport and protocol layers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::key::ConnectionKey;

/// A persistent transport connection that can be reused across requests.
pub trait Connection: Send + Sync + 'static {
    /// The endpoint this connection is bound to.
    fn key(&self) -> &ConnectionKey;

    /// Keep-alive timeout advertised by the peer, if any.
    ///
    /// `None` or zero means the cache's base lifetime applies.
    fn keep_alive_timeout(&self) -> Option<Duration>;

    /// Tears down the underlying transport.
    ///
    /// Must be idempotent: calling it on an already closed connection is a no-op.
    fn close_server(&self) -> Result<()>;

    /// The response stream currently attached to this connection, if any.
    fn response_stream(&self) -> Option<Arc<dyn ResponseStream>> {
        None
    }
}

/// Category of a response body stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Chunked transfer-encoded body.
    Chunked,
    /// Body with a known length, tracked byte by byte.
    Metered,
    /// Anything else (raw, upgraded, already detached).
    Other,
}

impl StreamKind {
    /// Whether closing a stream of this kind drains it and offers the
    /// connection back to the idle pool.
    pub fn returns_on_close(self) -> bool {
        matches!(self, StreamKind::Chunked | StreamKind::Metered)
    }
}

/// A response body stream owned by the protocol layer.
pub trait ResponseStream: Send + Sync {
    /// The stream's category.
    fn kind(&self) -> StreamKind;

    /// Closes the stream. For returning kinds this reads any pending bytes
    /// and hands the connection back to the cache.
    fn close(&self) -> Result<()>;
}

/// Identity of a shared connection, derived from its allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    /// Returns the identity of `conn`. Stable while any clone of the `Arc` is alive.
    pub fn of<C: ?Sized>(conn: &Arc<C>) -> Self {
        Self(Arc::as_ptr(conn).cast::<()>() as usize)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({:#x})", self.0)
    }
}

/// Closes `conn`, logging and discarding any failure.
pub(crate) fn close_quietly<C: Connection + ?Sized>(conn: &C, reason: &'static str) {
    match conn.close_server() {
        Ok(()) => debug!(key = %conn.key(), reason, "closed keep-alive connection"),
        Err(e) => debug!(key = %conn.key(), reason, error = %e, "ignoring close failure"),
    }
}
