//! unison-sync - the synchronization engine for LAN-synchronized playback.
//!
//! One device hosts; the rest follow. The engine keeps every follower's
//! decoder within a few tens of milliseconds of the host's position:
//!
//! * a coordinated **future start** launches playback at an agreed room
//!   time (two-phase wait: coarse sleep + fine poll),
//! * **catch-up** drops a late joiner onto the host's predicted position,
//! * **KeepSync** holds alignment afterwards with bounded rate nudges and
//!   threshold seeks,
//! * **metrics** watch the delta stream and flip into protection mode when
//!   the controller starts thrashing.
//!
//! The room clock itself lives in `unison-clock`; transports and track
//! distribution live in `unison-net`.

pub mod catchup;
pub mod config;
pub mod decoder;
pub mod error;
pub mod facade;
pub mod keepsync;
pub mod messages;
pub mod metrics;
pub mod scheduler;
pub mod transport;

pub use config::{Calibration, KeepSyncConfig, Platform, SyncConfig};
pub use decoder::{Decoder, DecoderError};
pub use error::SyncError;
pub use facade::{
    EngineCommand, EngineHandle, EngineNotification, EngineStatus, Role, SyncEngine, TrackMetadata,
};
pub use keepsync::{Decision, DecisionAction, DecisionReason, KeepSync, KeepSyncInput};
pub use messages::{decode_frame, DecodeError, PeerRole, ReadyErrorCode, WireMessage};
pub use metrics::{SyncMetrics, SyncSample, WindowStats};
pub use scheduler::{FutureStartScheduler, ScheduleOutcome, StartDescriptor, StartReport};
pub use transport::{PeerSender, SharedSender, TransportEvent};
