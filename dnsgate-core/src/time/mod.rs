//! ## dnsgate-core::time
//! **Wall-clock abstraction for TTL expiry decisions**
//!
//! Rule expiries are unix timestamps in seconds. The engine reads them
//! through [`Clock`] so tests can drive a [`VirtualClock`] instead of
//! sleeping through real TTLs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of unix timestamps (seconds).
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// System wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_secs()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Clone)]
pub struct VirtualClock {
    offset: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new(start: u64) -> Self {
        Self {
            offset: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.offset.fetch_add(secs, Ordering::Release);
    }

    pub fn set(&self, secs: u64) {
        self.offset.store(secs, Ordering::Release);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_advances() {
        let clock = VirtualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(31);
        assert_eq!(clock.now(), 131);
        clock.set(50);
        assert_eq!(clock.now(), 50);
    }

    #[test]
    fn shared_handles_observe_advance() {
        let clock = VirtualClock::new(0);
        let other = clock.clone();
        clock.advance(10);
        assert_eq!(other.now(), 10);
    }
}
