use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic nanosecond time source.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// [`HostClock`] backed by [`Instant`], counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct StdHostClock {
    start: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        let elapsed = self.start.elapsed().as_nanos();
        u64::try_from(elapsed).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying counter, so a test can keep one handle while the device model
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeHostClock {
    now: Arc<AtomicU64>,
}

impl FakeHostClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ns)),
        }
    }

    pub fn set_ns(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
