//! Drives the keep-alive cache with simulated requests, some of which are
//! abandoned without releasing their connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use keepalive_cache::{
    Connection, ConnectionKey, KeepAliveCache, Owner, ResponseStream, Result, StreamKind,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static OPENED: AtomicU64 = AtomicU64::new(0);

struct SimConnection {
    key: ConnectionKey,
    closed: AtomicBool,
    stream: Mutex<Option<Arc<dyn ResponseStream>>>,
}

impl Connection for SimConnection {
    fn key(&self) -> &ConnectionKey {
        &self.key
    }

    fn keep_alive_timeout(&self) -> Option<Duration> {
        None
    }

    fn close_server(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn response_stream(&self) -> Option<Arc<dyn ResponseStream>> {
        self.stream.lock().ok().and_then(|s| s.clone())
    }
}

/// Body stream that hands its connection back to the cache once drained.
struct SimBody {
    cache: Weak<KeepAliveCache<SimConnection>>,
    conn: Mutex<Option<Arc<SimConnection>>>,
}

impl ResponseStream for SimBody {
    fn kind(&self) -> StreamKind {
        StreamKind::Metered
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().ok().and_then(|mut c| c.take());
        if let (Some(conn), Some(cache)) = (conn, self.cache.upgrade()) {
            if let Ok(mut slot) = conn.stream.lock() {
                slot.take();
            }
            cache.put_idle(&conn.key.clone(), conn);
        }
        Ok(())
    }
}

fn checkout(
    cache: &Arc<KeepAliveCache<SimConnection>>,
    key: &ConnectionKey,
    owner: &Owner,
) -> Arc<SimConnection> {
    if let Some(conn) = cache.get_idle(key, Some(owner)) {
        return conn;
    }
    OPENED.fetch_add(1, Ordering::Relaxed);
    let conn = Arc::new(SimConnection {
        key: key.clone(),
        closed: AtomicBool::new(false),
        stream: Mutex::new(None),
    });
    cache.put_active(conn.clone(), Some(owner));
    conn
}

fn attach_body(
    cache: &Arc<KeepAliveCache<SimConnection>>,
    conn: &Arc<SimConnection>,
) -> Arc<SimBody> {
    let body = Arc::new(SimBody {
        cache: Arc::downgrade(cache),
        conn: Mutex::new(Some(conn.clone())),
    });
    let stream: Arc<dyn ResponseStream> = body.clone();
    if let Ok(mut slot) = conn.stream.lock() {
        *slot = Some(stream);
    }
    body
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cache = Arc::new(KeepAliveCache::<SimConnection>::with_defaults());
    let key = ConnectionKey::new("https", "localhost", 8443);

    tracing::info!(config = ?cache.config(), "keep-alive demo starting");

    let mut workers = Vec::new();
    for worker in 0..4u64 {
        let cache = cache.clone();
        let key = key.clone();
        workers.push(tokio::spawn(async move {
            for request in 0..25u64 {
                let owner = Owner::new();
                let conn = checkout(&cache, &key, &owner);
                let body = attach_body(&cache, &conn);
                tokio::time::sleep(Duration::from_millis(2)).await;

                if (worker + request) % 3 == 0 {
                    // Abandoned: neither closed nor drained.
                    drop(body);
                    drop(owner);
                } else {
                    body.close()?;
                }
            }
            Ok::<_, keepalive_cache::CacheError>(())
        }));
    }

    for worker in workers {
        worker.await??;
    }

    // Give the reclaimer a chance to return abandoned connections.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = serde_json::json!({
        "opened": OPENED.load(Ordering::Relaxed),
        "stats": cache.stats(),
        "metrics": cache.metrics().snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    cache.shutdown();
    Ok(())
}
