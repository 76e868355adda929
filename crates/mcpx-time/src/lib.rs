//! Device-model time sources and frame scheduling.
//!
//! Device models never read the host clock directly. They are handed a [`HostClock`] at
//! construction so production code can run against [`StdHostClock`] while tests drive time
//! deterministically with [`FakeHostClock`].

mod clock;
mod frame_timer;

pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use frame_timer::FrameTimer;

/// Nanoseconds per millisecond.
pub const NANOS_PER_MS: u64 = 1_000_000;
