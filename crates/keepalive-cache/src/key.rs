//! Connection keys used to group reusable connections.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Auxiliary key component that keeps otherwise identical endpoints apart,
/// such as connections made through different proxies or trust stores.
///
/// Two discriminators are equal only if they wrap the same allocation.
#[derive(Clone)]
pub struct Discriminator(Arc<dyn Any + Send + Sync>);

impl Discriminator {
    /// Wraps a value. Clones of the returned discriminator compare equal to each other.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Wraps an existing shared value without reallocating it.
    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(value)
    }

    /// Returns the wrapped value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl PartialEq for Discriminator {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Discriminator {}

impl Hash for Discriminator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Discriminator({:#x})", self.addr())
    }
}

/// Identity of a group of interchangeable connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    protocol: String,
    host: String,
    port: u16,
    discriminator: Option<Discriminator>,
}

impl ConnectionKey {
    /// Creates a key without a discriminator. Protocol and host are lowercased.
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        Self {
            protocol: protocol.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
            discriminator: None,
        }
    }

    /// Returns a copy of this key scoped to `discriminator`.
    pub fn with_discriminator(mut self, discriminator: Discriminator) -> Self {
        self.discriminator = Some(discriminator);
        self
    }

    /// Scheme, e.g. `http` or `https`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Host name or address literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Auxiliary key component, if any.
    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}
