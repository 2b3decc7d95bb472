//! Common test doubles for keep-alive cache integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use keepalive_cache::{
    Connection, ConnectionKey, KeepAliveCache, KeepAliveConfig, ResponseStream, Result, StreamKind,
};

/// In-memory connection that records how often it was closed.
pub struct TestConnection {
    pub key: ConnectionKey,
    timeout: Option<Duration>,
    closes: AtomicUsize,
    stream: Mutex<Option<Arc<dyn ResponseStream>>>,
}

impl TestConnection {
    pub fn new(key: &ConnectionKey) -> Arc<Self> {
        Self::build(key, None)
    }

    pub fn with_timeout(key: &ConnectionKey, timeout: Duration) -> Arc<Self> {
        Self::build(key, Some(timeout))
    }

    fn build(key: &ConnectionKey, timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            key: key.clone(),
            timeout,
            closes: AtomicUsize::new(0),
            stream: Mutex::new(None),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }

    pub fn set_stream(&self, stream: Arc<dyn ResponseStream>) {
        *self.stream.lock().unwrap() = Some(stream);
    }
}

impl Connection for TestConnection {
    fn key(&self) -> &ConnectionKey {
        &self.key
    }

    fn keep_alive_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn close_server(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn response_stream(&self) -> Option<Arc<dyn ResponseStream>> {
        self.stream.lock().unwrap().clone()
    }
}

/// Response body that returns its connection to the cache when closed,
/// the way a metered or chunked body does once drained.
pub struct ReturningBody {
    cache: Weak<KeepAliveCache<TestConnection>>,
    conn: Mutex<Option<Arc<TestConnection>>>,
    pub closed: AtomicBool,
}

impl ReturningBody {
    pub fn attach(
        cache: &Arc<KeepAliveCache<TestConnection>>,
        conn: &Arc<TestConnection>,
    ) -> Arc<Self> {
        let body = Arc::new(Self {
            cache: Arc::downgrade(cache),
            conn: Mutex::new(Some(conn.clone())),
            closed: AtomicBool::new(false),
        });
        let stream: Arc<dyn ResponseStream> = body.clone();
        conn.set_stream(stream);
        body
    }
}

impl ResponseStream for ReturningBody {
    fn kind(&self) -> StreamKind {
        StreamKind::Chunked
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let conn = self.conn.lock().unwrap().take();
        if let (Some(conn), Some(cache)) = (conn, self.cache.upgrade()) {
            let key = conn.key.clone();
            cache.put_idle(&key, conn);
        }
        Ok(())
    }
}

pub fn test_key() -> ConnectionKey {
    ConnectionKey::new("https", "localhost", 8443)
}

pub fn cache(max: usize, lifetime_ms: u64) -> Arc<KeepAliveCache<TestConnection>> {
    let config = KeepAliveConfig {
        max_idle_per_key: max,
        base_lifetime: Duration::from_millis(lifetime_ms),
        reclaim_poll_interval: Duration::from_millis(20),
    };
    Arc::new(KeepAliveCache::new(config).expect("valid config"))
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
