//! In-memory connection and stream doubles for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::connection::{Connection, ResponseStream, StreamKind};
use crate::error::{CacheError, Result};
use crate::key::ConnectionKey;

pub(crate) struct MockConnection {
    key: ConnectionKey,
    timeout: Option<Duration>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    fail_close: AtomicBool,
    stream: Mutex<Option<Arc<dyn ResponseStream>>>,
}

impl MockConnection {
    pub(crate) fn new(key: ConnectionKey) -> Arc<Self> {
        Self::build(key, None)
    }

    pub(crate) fn with_timeout(key: ConnectionKey, timeout: Duration) -> Arc<Self> {
        Self::build(key, Some(timeout))
    }

    fn build(key: ConnectionKey, timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            key,
            timeout,
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            stream: Mutex::new(None),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn attach_stream(&self, stream: Arc<dyn ResponseStream>) {
        *self.stream.lock().unwrap() = Some(stream);
    }
}

impl Connection for MockConnection {
    fn key(&self) -> &ConnectionKey {
        &self.key
    }

    fn keep_alive_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn close_server(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(CacheError::CloseFailed {
                endpoint: self.key.to_string(),
                reason: "simulated".to_string(),
            });
        }
        Ok(())
    }

    fn response_stream(&self) -> Option<Arc<dyn ResponseStream>> {
        self.stream.lock().unwrap().clone()
    }
}

type OnClose = Box<dyn Fn() + Send + Sync>;

pub(crate) struct MockStream {
    kind: StreamKind,
    closed: AtomicUsize,
    fail_close: AtomicBool,
    on_close: Mutex<Option<OnClose>>,
}

impl MockStream {
    pub(crate) fn new(kind: StreamKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            closed: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            on_close: Mutex::new(None),
        })
    }

    pub(crate) fn on_close<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.on_close.lock().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }
}

impl ResponseStream for MockStream {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(CacheError::StreamClose {
                reason: "simulated".to_string(),
            });
        }
        let callback = self.on_close.lock().unwrap().take();
        if let Some(f) = callback {
            f();
        }
        Ok(())
    }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
