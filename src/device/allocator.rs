//! Port pool allocation
//!
//! Two independent pools back the registry: console ports (TCP) for
//! interactive device access and data ports (UDP) for inter-device
//! tunnels. Allocation scans forward from a rolling cursor, wrapping to
//! the start of the range, and skips ports that are tracked as allocated
//! or that the operating system reports as in use.

use std::collections::HashSet;
use std::net::{TcpListener, UdpSocket};

use tracing::{debug, trace};

use super::DeviceError;

/// Transport used when probing a candidate port against the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A pool of ports over one inclusive range
///
/// The pool never returns a port twice while it is held; a released port
/// becomes eligible for reuse. The OS probe is advisory only: another
/// process can still win a bind race after a successful probe, in which
/// case the caller retries with a fresh allocation.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    cursor: u16,
    protocol: Protocol,
    allocated: HashSet<u16>,
}

impl PortPool {
    /// Create a pool over `start..=end`
    pub fn new(start: u16, end: u16, protocol: Protocol) -> Self {
        Self {
            start,
            end,
            cursor: start,
            protocol,
            allocated: HashSet::new(),
        }
    }

    /// Allocate the next unused port at or after the cursor
    ///
    /// Performs one full pass of the range before reporting exhaustion.
    pub fn allocate(&mut self, host: &str) -> Result<u16, DeviceError> {
        if self.end < self.start {
            return Err(DeviceError::ResourceExhausted {
                start: self.start,
                end: self.end,
            });
        }
        if self.cursor > self.end || self.cursor < self.start {
            self.cursor = self.start;
        }

        let span = (self.end - self.start) as u32 + 1;
        for offset in 0..span {
            let candidate = self.start
                + ((self.cursor - self.start) as u32 + offset).rem_euclid(span) as u16;

            if self.allocated.contains(&candidate) {
                continue;
            }
            if !self.probe(host, candidate) {
                trace!("port {} is in use by the OS, skipping", candidate);
                continue;
            }

            self.allocated.insert(candidate);
            self.cursor = if candidate >= self.end {
                self.start
            } else {
                candidate + 1
            };
            debug!("allocated {:?} port {}", self.protocol, candidate);
            return Ok(candidate);
        }

        Err(DeviceError::ResourceExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool
    pub fn release(&mut self, port: u16) {
        if self.allocated.remove(&port) {
            debug!("released {:?} port {}", self.protocol, port);
        }
    }

    /// Change the range; takes effect for subsequent allocations only
    pub fn set_range(&mut self, start: u16, end: u16) {
        self.start = start;
        self.end = end;
        if self.cursor < start || self.cursor > end {
            self.cursor = start;
        }
    }

    /// Reset the cursor and forget all allocations
    pub fn reset(&mut self) {
        self.cursor = self.start;
        self.allocated.clear();
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    fn probe(&self, host: &str, port: u16) -> bool {
        match self.protocol {
            Protocol::Tcp => TcpListener::bind((host, port)).is_ok(),
            Protocol::Udp => UdpSocket::bind((host, port)).is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "127.0.0.1";

    #[test]
    fn test_allocations_are_distinct() {
        let mut pool = PortPool::new(45101, 45110, Protocol::Tcp);
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let port = pool.allocate(HOST).unwrap();
            assert!((45101..=45110).contains(&port));
            assert!(seen.insert(port), "port {} returned twice", port);
        }
    }

    #[test]
    fn test_wraparound_and_reuse() {
        let mut pool = PortPool::new(45201, 45203, Protocol::Tcp);
        assert_eq!(pool.allocate(HOST).unwrap(), 45201);
        assert_eq!(pool.allocate(HOST).unwrap(), 45202);
        assert_eq!(pool.allocate(HOST).unwrap(), 45203);

        pool.release(45201);
        // cursor wrapped past the end; the released port is found again
        assert_eq!(pool.allocate(HOST).unwrap(), 45201);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = PortPool::new(45301, 45302, Protocol::Udp);
        pool.allocate(HOST).unwrap();
        pool.allocate(HOST).unwrap();
        let err = pool.allocate(HOST).unwrap_err();
        assert!(matches!(err, DeviceError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_skips_os_bound_port() {
        let listener = TcpListener::bind((HOST, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        // a range starting at the busy port must skip over it
        if busy < u16::MAX - 2 {
            let mut pool = PortPool::new(busy, busy + 2, Protocol::Tcp);
            let port = pool.allocate(HOST).unwrap();
            assert_ne!(port, busy);
        }
    }

    #[test]
    fn test_set_range_applies_to_next_allocation() {
        let mut pool = PortPool::new(45401, 45405, Protocol::Udp);
        let first = pool.allocate(HOST).unwrap();
        assert_eq!(first, 45401);

        pool.set_range(45501, 45505);
        let second = pool.allocate(HOST).unwrap();
        assert!((45501..=45505).contains(&second));

        // the earlier allocation is still tracked
        pool.release(first);
    }

    #[test]
    fn test_reset_restores_cursor() {
        let mut pool = PortPool::new(45601, 45605, Protocol::Tcp);
        pool.allocate(HOST).unwrap();
        pool.allocate(HOST).unwrap();
        pool.reset();
        assert_eq!(pool.allocate(HOST).unwrap(), 45601);
    }
}
