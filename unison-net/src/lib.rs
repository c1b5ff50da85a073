//! unison-net - LAN plumbing around the sync engine.
//!
//! WebSocket transport (the engine's `PeerSender`/event contract),
//! multicast room discovery, HTTP track distribution with content
//! hashing, and calibration persistence.

pub mod calibration;
pub mod discovery;
pub mod transfer;
pub mod transport;

pub use discovery::DiscoveredRoom;
pub use transfer::{download_track, hash_file, TrackServer, TransferError};
pub use transport::{TransportError, WsClient, WsHost};
