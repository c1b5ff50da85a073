//! unison-clock - room clock estimation for LAN-synchronized playback.
//!
//! Tracks the offset between the local wall clock and the Host's
//! authoritative clock from ping/pong exchanges, NTP style. The Host's
//! clock defines "room time"; every other subsystem (future-start
//! scheduling, catch-up, KeepSync) works in room time.

pub mod clock;
pub mod handle;
pub mod stats;
pub mod synchronizer;

pub use clock::{ClockSample, DropReason, RoomClock, SampleOutcome};
pub use handle::RoomTimeHandle;
pub use stats::ClockStats;
pub use synchronizer::{Cadence, PingRequest, Synchronizer};
