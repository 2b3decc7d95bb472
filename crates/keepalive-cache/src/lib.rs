#![warn(missing_docs)]

//! Keep-alive connection cache: per-key idle pool with expiry, plus reclamation
//! of connections whose owning request was abandoned.

pub mod active;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod idle;
pub mod key;
pub mod metrics;
pub mod owner;

#[cfg(test)]
mod test_support;

pub use cache::{CacheStats, KeepAliveCache};
pub use config::KeepAliveConfig;
pub use connection::{Connection, ConnectionId, ResponseStream, StreamKind};
pub use error::{CacheError, Result};
pub use key::{ConnectionKey, Discriminator};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use owner::{Owner, OwnerId};
