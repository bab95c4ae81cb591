//! Host port allocation for sandbox containers.
//!
//! Ports come from a fixed range. A port is handed out only if it is not
//! already reserved by this process *and* a transient bind on the host
//! succeeds, so ports held by unrelated processes are skipped.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;
use tracing::debug;

use crate::config::PortConfig;
use crate::error::SandboxError;

/// Hands out unique, bind-verified ports from a fixed range.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    bind_host: String,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Creates an allocator over `start..=end`.
    pub fn new(start: u16, end: u16, bind_host: impl Into<String>) -> Self {
        Self {
            start,
            end,
            bind_host: bind_host.into(),
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Creates an allocator from the `[ports]` config section.
    pub fn from_config(config: &PortConfig) -> Self {
        Self::new(config.start, config.end, config.bind_host.clone())
    }

    /// Reserve a free port.
    ///
    /// Scan and reservation happen under one lock so two concurrent callers
    /// can never be handed the same port.
    pub fn allocate(&self) -> Result<u16, SandboxError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());

        for port in self.start..=self.end {
            if in_use.contains(&port) {
                continue;
            }
            if !self.is_bindable(port) {
                debug!(port, "Port busy on host, skipping");
                continue;
            }
            in_use.insert(port);
            debug!(port, reserved = in_use.len(), "Port allocated");
            return Ok(port);
        }

        Err(SandboxError::port_exhausted(self.start, self.end))
    }

    /// Return a port to the pool. Releasing an unknown port is a no-op.
    pub fn release(&self, port: u16) {
        let removed = self
            .in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
        if removed {
            debug!(port, "Port released");
        }
    }

    /// Whether `port` is currently reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&port)
    }

    /// Number of reserved ports.
    pub fn in_use(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The configured range as `(start, end)`.
    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    fn is_bindable(&self, port: u16) -> bool {
        // Listener drops immediately, freeing the port again.
        TcpListener::bind((self.bind_host.as_str(), port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// A small range that is very likely free on a test host.
    fn free_range(len: u16) -> (u16, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);
        let start = base.saturating_sub(len).max(20_000);
        (start, start + len - 1)
    }

    #[test]
    fn test_allocate_returns_port_in_range() {
        let (start, end) = free_range(16);
        let ports = PortAllocator::new(start, end, "127.0.0.1");
        let port = ports.allocate().unwrap();
        assert!((start..=end).contains(&port));
        assert!(ports.is_reserved(port));
        assert_eq!(ports.in_use(), 1);
    }

    #[test]
    fn test_allocations_are_unique() {
        let (start, end) = free_range(16);
        let ports = PortAllocator::new(start, end, "127.0.0.1");
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (start, end) = free_range(4);
        let ports = PortAllocator::new(start, end, "127.0.0.1");
        let port = ports.allocate().unwrap();
        ports.release(port);
        ports.release(port);
        ports.release(1);
        assert_eq!(ports.in_use(), 0);
        assert!(!ports.is_reserved(port));
    }

    #[test]
    fn test_exhaustion() {
        let (start, _) = free_range(2);
        let ports = PortAllocator::new(start, start, "127.0.0.1");
        let first = ports.allocate().unwrap();
        let err = ports.allocate().unwrap_err();
        assert!(err.is_port_exhausted());

        ports.release(first);
        assert_eq!(ports.allocate().unwrap(), first);
    }

    #[test]
    fn test_skips_port_bound_by_another_process() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let ports = PortAllocator::new(port, port, "127.0.0.1");
        assert!(ports.allocate().unwrap_err().is_port_exhausted());
        drop(held);
    }

    #[test]
    fn test_default_host_sees_ports_held_on_loopback() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let config = crate::config::PortConfig {
            start: port,
            end: port,
            ..crate::config::PortConfig::default()
        };
        let ports = PortAllocator::from_config(&config);
        assert!(ports.allocate().unwrap_err().is_port_exhausted());
        drop(held);
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let (start, end) = free_range(32);
        let ports = Arc::new(PortAllocator::new(start, end, "127.0.0.1"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || ports.allocate().ok())
            })
            .collect();

        let got: Vec<u16> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<u16> = got.iter().copied().collect();
        assert_eq!(unique.len(), got.len());
    }
}
