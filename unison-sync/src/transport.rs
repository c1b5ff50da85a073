//! Message transport contract.
//!
//! The engine talks to exactly one seam: a `PeerSender` for outbound
//! frames and a stream of `TransportEvent`s for everything inbound.
//! Delivery is ordered per peer and best-effort; a peer that went away
//! surfaces as a disconnect event, never as a send error the engine has
//! to unwind.

use std::sync::Arc;

pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected {
        peer_id: PeerId,
    },
    PeerDisconnected {
        peer_id: PeerId,
        reason: Option<String>,
    },
    /// One inbound text frame, in arrival order for its peer.
    Frame {
        peer_id: PeerId,
        text: String,
    },
}

/// Outbound side of the transport.
pub trait PeerSender: Send + Sync {
    /// Queue a frame for one peer. Unknown peers are dropped silently.
    fn send_to(&self, peer_id: &str, text: String);
    /// Queue a frame for every connected peer.
    fn broadcast(&self, text: String);
}

pub type SharedSender = Arc<dyn PeerSender>;

/// In-memory transport for tests and single-process demos.
pub mod loopback {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    /// Registry of in-process peers; frames are delivered as
    /// `TransportEvent::Frame` on the receiver's event queue.
    #[derive(Default)]
    pub struct LoopbackHub {
        peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl LoopbackHub {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Attach a peer; returns the event stream its engine consumes.
        pub fn attach(self: &Arc<Self>, peer_id: &str) -> mpsc::UnboundedReceiver<TransportEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.peers.lock().insert(peer_id.to_owned(), tx);
            rx
        }

        pub fn connect(&self, from: &str, to: &str) {
            for (a, b) in [(from, to), (to, from)] {
                if let Some(tx) = self.peers.lock().get(b) {
                    let _ = tx.send(TransportEvent::PeerConnected {
                        peer_id: a.to_owned(),
                    });
                }
            }
        }

        pub fn disconnect(&self, from: &str, to: &str, reason: Option<String>) {
            for (a, b) in [(from, to), (to, from)] {
                if let Some(tx) = self.peers.lock().get(b) {
                    let _ = tx.send(TransportEvent::PeerDisconnected {
                        peer_id: a.to_owned(),
                        reason: reason.clone(),
                    });
                }
            }
        }

        /// Sender handle for one peer: frames it sends arrive at the
        /// addressee tagged with this peer's id.
        pub fn sender(self: &Arc<Self>, peer_id: &str) -> SharedSender {
            Arc::new(LoopbackSender {
                hub: Arc::clone(self),
                peer_id: peer_id.to_owned(),
            })
        }

        fn deliver(&self, from: &str, to: &str, text: String) {
            if let Some(tx) = self.peers.lock().get(to) {
                let _ = tx.send(TransportEvent::Frame {
                    peer_id: from.to_owned(),
                    text,
                });
            }
        }
    }

    struct LoopbackSender {
        hub: Arc<LoopbackHub>,
        peer_id: PeerId,
    }

    impl PeerSender for LoopbackSender {
        fn send_to(&self, peer_id: &str, text: String) {
            self.hub.deliver(&self.peer_id, peer_id, text);
        }

        fn broadcast(&self, text: String) {
            let targets: Vec<PeerId> = self
                .hub
                .peers
                .lock()
                .keys()
                .filter(|p| **p != self.peer_id)
                .cloned()
                .collect();
            for target in targets {
                self.hub.deliver(&self.peer_id, &target, text.clone());
            }
        }
    }

}
