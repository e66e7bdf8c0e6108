//! Process-scoped pool of ephemeral local ports.
//!
//! Ports come from the OS (bind to port 0, read the assignment) and are
//! tracked as in use until returned, so concurrently provisioned swarms
//! never receive the same port twice. Each pool is an explicit object;
//! tests build independent pools.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Mutex, MutexGuard};

use peerlab_core::{LabError, LabResult};
use tracing::{debug, warn};

/// Collisions tolerated per allocation before giving up.
const MAX_ATTEMPTS: usize = 128;

#[derive(Debug)]
pub struct PortPool {
    host: String,
    in_use: Mutex<HashSet<u16>>,
}

impl PortPool {
    /// A pool handing out ports bindable on `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            in_use: Mutex::new(HashSet::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        // The set stays consistent even if a holder panicked.
        self.in_use.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn probe(&self) -> LabResult<u16> {
        let listener = TcpListener::bind((self.host.as_str(), 0))
            .map_err(|e| LabError::Unavailable(format!("probe free port on {}: {e}", self.host)))?;
        let port = listener
            .local_addr()
            .map_err(|e| LabError::Internal(format!("read probed port: {e}")))?
            .port();
        Ok(port)
    }

    /// Reserve `count` distinct free ports. Ports the OS hands back while
    /// still reserved here are skipped and probed again.
    pub fn acquire(&self, count: usize) -> LabResult<Vec<u16>> {
        let mut in_use = self.lock();
        let mut ports = Vec::with_capacity(count);
        let mut collisions = 0;

        while ports.len() < count {
            let port = self.probe()?;
            if in_use.contains(&port) || ports.contains(&port) {
                collisions += 1;
                warn!(port, collisions, "probed port already reserved, retrying");
                if collisions >= MAX_ATTEMPTS {
                    return Err(LabError::Unavailable(format!(
                        "no free port after {collisions} collisions"
                    )));
                }
                continue;
            }
            ports.push(port);
        }

        in_use.extend(ports.iter().copied());
        debug!(?ports, "ports reserved");
        Ok(ports)
    }

    /// Return ports to the pool. Returning a port that is not reserved is
    /// logged and otherwise ignored.
    pub fn release(&self, ports: &[u16]) {
        let mut in_use = self.lock();
        let mut returned = 0;
        for port in ports {
            if in_use.remove(port) {
                returned += 1;
            } else {
                warn!(port, "returning a port that is not reserved");
            }
        }
        debug!(returned, "ports returned");
    }

    /// Number of ports currently reserved.
    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn acquire_returns_distinct_reserved_ports() {
        let pool = PortPool::new("127.0.0.1");
        let ports = pool.acquire(4).unwrap();
        assert_eq!(ports.len(), 4);
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(ports.iter().all(|p| pool.is_reserved(*p)));
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn release_of_unreserved_port_is_a_no_op() {
        let pool = PortPool::new("127.0.0.1");
        let ports = pool.acquire(2).unwrap();
        pool.release(&ports);
        pool.release(&ports);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn pools_are_independent() {
        let a = PortPool::new("127.0.0.1");
        let b = PortPool::new("127.0.0.1");
        let ports = a.acquire(2).unwrap();
        assert!(!b.is_reserved(ports[0]));
        assert_eq!(b.in_use(), 0);
    }

    #[test]
    fn concurrent_acquisitions_never_overlap() {
        let pool = Arc::new(PortPool::new("127.0.0.1"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.acquire(2).unwrap())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(all.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(pool.in_use(), 16);
    }
}
