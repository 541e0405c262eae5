//! Process-wide registry of ports claimed by live fixtures.
//!
//! The registry only prevents two fixtures in this process from picking the
//! same random port. It says nothing about the OS: an unrelated process may
//! still hold an allocated port, in which case the bind fails when the
//! server starts.
//!
//! Entries live exactly as long as their [`PortLease`]. Dropping the lease
//! (which `RedisServer::shutdown` and `Drop` both do) makes the port
//! available for allocation again.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use rand::Rng;

/// Dynamic/private port range (RFC 6335).
pub const DYNAMIC_PORTS: RangeInclusive<u16> = 49152..=65535;

static GLOBAL: LazyLock<Arc<PortRegistry>> = LazyLock::new(|| Arc::new(PortRegistry::new()));

/// Set of ports currently claimed by fixtures, with a claim count per port.
///
/// Explicit ports are counted rather than rejected so that asking for the
/// same explicit port twice reaches the OS and fails there.
#[derive(Debug, Default)]
pub struct PortRegistry {
    claimed: Mutex<HashMap<u16, usize>>,
}

impl PortRegistry {
    /// Create an empty registry. Most callers want [`PortRegistry::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every fixture in this process.
    pub fn global() -> Arc<PortRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Pick a random unclaimed port from [`DYNAMIC_PORTS`] and claim it.
    ///
    /// Retries until a free candidate is found. Check and insert happen
    /// under one lock, so concurrent callers never get the same port.
    pub fn allocate(self: &Arc<Self>) -> PortLease {
        let mut rng = rand::thread_rng();
        let mut claimed = self.lock();
        let port = loop {
            let candidate = rng.gen_range(DYNAMIC_PORTS);
            if !claimed.contains_key(&candidate) {
                break candidate;
            }
        };
        claimed.insert(port, 1);
        drop(claimed);

        tracing::trace!("Allocated port {}", port);
        PortLease {
            port,
            registry: Arc::clone(self),
        }
    }

    /// Record a caller-chosen port. Never fails.
    pub fn claim(self: &Arc<Self>, port: u16) -> PortLease {
        *self.lock().entry(port).or_insert(0) += 1;
        PortLease {
            port,
            registry: Arc::clone(self),
        }
    }

    /// Whether any live lease holds `port`.
    pub fn is_claimed(&self, port: u16) -> bool {
        self.lock().contains_key(&port)
    }

    /// Number of distinct claimed ports.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no port is claimed.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn release(&self, port: u16) {
        let mut claimed = self.lock();
        if let Some(count) = claimed.get_mut(&port) {
            *count -= 1;
            if *count == 0 {
                claimed.remove(&port);
            }
        }
    }

    // A panic while holding the lock cannot leave the map inconsistent,
    // so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HashMap<u16, usize>> {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A claimed port, released back to its registry on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    registry: Arc<PortRegistry>,
}

impl PortLease {
    /// The claimed port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.registry.release(self.port);
    }
}
