//! Injectable time sources.
//!
//! Every timer-driven behavior in the stack reads time through a
//! [`TimeProvider`] so tests can drive retransmission, quarantine and
//! registration schedules deterministically.

use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait TimeProvider: Send + Sync + Debug {
    /// Monotonic time for intervals and deadlines.
    fn now_instant(&self) -> Instant;
    /// Wall-clock milliseconds since the Unix epoch, for call tokens and
    /// DATETIME IEs.
    fn now_system_ms(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_system_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A manual time provider for deterministic tests.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    system_ms: RwLock<i64>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, system_ms: i64) -> Self {
        Self {
            instant: RwLock::new(instant),
            system_ms: RwLock::new(system_ms),
        }
    }

    pub fn set_time(&self, instant: Instant, system_ms: i64) {
        *self.instant.write().unwrap() = instant;
        *self.system_ms.write().unwrap() = system_ms;
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
        *self.system_ms.write().unwrap() += duration.as_millis() as i64;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_system_ms(&self) -> i64 {
        *self.system_ms.read().unwrap()
    }
}
