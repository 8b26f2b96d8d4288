//! The monotonic millisecond clock collaborator (spec §2, §6).
//!
//! The engine never reads a wall clock and never sleeps on its own — it asks
//! its embedder for the current tick and compares typed durations. Using
//! `fugit`'s typed instants/durations instead of a bare `u64` means a
//! millisecond can't accidentally be compared against a microsecond count
//! somewhere downstream.

/// A millisecond-resolution monotonic timestamp.
pub type Instant = fugit::TimerInstantU64<1_000>;
/// A millisecond-resolution duration.
pub type Duration = fugit::TimerDurationU64<1_000>;

/// Construct a millisecond `Duration` from a plain integer; used for the
/// wire-fixed constants in [`crate::constants`] and for decoding the LOCK
/// command's seconds argument.
pub const fn millis(ms: u64) -> Duration {
    Duration::from_ticks(ms)
}

/// Monotonic millisecond tick source.
///
/// Deliberately out of scope per spec §1: the embedder is expected to back
/// this with a hardware timer/systick. Need not be wall-clock accurate, only
/// monotonic and non-wrapping over the device's uptime.
pub trait Clock {
    /// The current tick. Must never go backwards between calls.
    fn now(&self) -> Instant;
}
