//! WebSocket transport.
//!
//! Implements the engine's transport contract over tokio-tungstenite:
//! the host accepts connections and keeps one outbound queue per peer;
//! a client holds the single link to its host. Frames are JSON text,
//! delivered in order per peer; a broken link surfaces as a disconnect
//! event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

use unison_sync::transport::{PeerId, PeerSender, SharedSender, TransportEvent};

/// The peer id a client engine sees its host link under.
pub const HOST_LINK: &str = "host";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

type PeerMap = Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<Message>>>>;

/// Accepting side of the transport. Peers are keyed by remote address.
pub struct WsHost {
    local_addr: SocketAddr,
    peers: PeerMap,
    accept_task: JoinHandle<()>,
}

impl WsHost {
    /// Bind and start accepting. Events for every peer arrive on the
    /// returned receiver, which the engine consumes directly.
    pub async fn bind(
        addr: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let accept_peers = Arc::clone(&peers);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::error!("accept failed: {err}");
                        break;
                    }
                };
                let peers = Arc::clone(&accept_peers);
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => serve_peer(ws, remote.to_string(), peers, event_tx).await,
                        Err(err) => log::warn!("handshake with {remote} failed: {err}"),
                    }
                });
            }
        });

        Ok((
            Self {
                local_addr,
                peers,
                accept_task,
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sender(&self) -> SharedSender {
        Arc::new(MapSender {
            peers: Arc::clone(&self.peers),
        })
    }
}

impl Drop for WsHost {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_peer(
    ws: WebSocketStream<TcpStream>,
    peer_id: PeerId,
    peers: PeerMap,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    peers.lock().insert(peer_id.clone(), out_tx);
    let _ = event_tx.send(TransportEvent::PeerConnected {
        peer_id: peer_id.clone(),
    });

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut reason = None;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let _ = event_tx.send(TransportEvent::Frame {
                    peer_id: peer_id.clone(),
                    text,
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                reason = Some(err.to_string());
                break;
            }
        }
    }

    peers.lock().remove(&peer_id);
    writer.abort();
    let _ = event_tx.send(TransportEvent::PeerDisconnected { peer_id, reason });
}

struct MapSender {
    peers: PeerMap,
}

impl PeerSender for MapSender {
    fn send_to(&self, peer_id: &str, text: String) {
        if let Some(tx) = self.peers.lock().get(peer_id) {
            let _ = tx.send(Message::Text(text));
        }
    }

    fn broadcast(&self, text: String) {
        for tx in self.peers.lock().values() {
            let _ = tx.send(Message::Text(text.clone()));
        }
    }
}

/// Connecting side: one link, surfaced to the engine as peer `host`.
pub struct WsClient {
    out_tx: mpsc::UnboundedSender<Message>,
    io_task: JoinHandle<()>,
}

impl WsClient {
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (ws, _) = connect_async(url).await?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();

        let _ = event_tx.send(TransportEvent::PeerConnected {
            peer_id: HOST_LINK.to_owned(),
        });
        let io_task = tokio::spawn(client_io(ws, out_rx, event_tx));

        Ok((Self { out_tx, io_task }, event_rx))
    }

    pub fn sender(&self) -> SharedSender {
        Arc::new(LinkSender {
            out_tx: self.out_tx.clone(),
        })
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

async fn client_io(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut reason = None;
    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(msg) => {
                    if let Err(err) = sink.send(msg).await {
                        reason = Some(err.to_string());
                        break;
                    }
                }
                None => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = event_tx.send(TransportEvent::Frame {
                        peer_id: HOST_LINK.to_owned(),
                        text,
                    });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    reason = Some(err.to_string());
                    break;
                }
            },
        }
    }
    let _ = event_tx.send(TransportEvent::PeerDisconnected {
        peer_id: HOST_LINK.to_owned(),
        reason,
    });
}

struct LinkSender {
    out_tx: mpsc::UnboundedSender<Message>,
}

impl PeerSender for LinkSender {
    fn send_to(&self, _peer_id: &str, text: String) {
        let _ = self.out_tx.send(Message::Text(text));
    }

    fn broadcast(&self, text: String) {
        let _ = self.out_tx.send(Message::Text(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_between_host_and_client() {
        let (host, mut host_events) = WsHost::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", host.local_addr());
        let (client, mut client_events) = WsClient::connect(&url).await.unwrap();

        // Client sees the link immediately; host sees the accepted peer.
        assert!(matches!(
            client_events.recv().await.unwrap(),
            TransportEvent::PeerConnected { peer_id } if peer_id == HOST_LINK
        ));
        let peer_id = match host_events.recv().await.unwrap() {
            TransportEvent::PeerConnected { peer_id } => peer_id,
            other => panic!("expected connect, got {other:?}"),
        };

        client.sender().send_to(HOST_LINK, "hello".into());
        match host_events.recv().await.unwrap() {
            TransportEvent::Frame { peer_id: from, text } => {
                assert_eq!(from, peer_id);
                assert_eq!(text, "hello");
            }
            other => panic!("expected frame, got {other:?}"),
        }

        host.sender().send_to(&peer_id, "welcome".into());
        match client_events.recv().await.unwrap() {
            TransportEvent::Frame { peer_id: from, text } => {
                assert_eq!(from, HOST_LINK);
                assert_eq!(text, "welcome");
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_client_surfaces_as_disconnect() {
        let (host, mut host_events) = WsHost::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", host.local_addr());
        let (client, _client_events) = WsClient::connect(&url).await.unwrap();

        assert!(matches!(
            host_events.recv().await.unwrap(),
            TransportEvent::PeerConnected { .. }
        ));
        drop(client);
        assert!(matches!(
            host_events.recv().await.unwrap(),
            TransportEvent::PeerDisconnected { .. }
        ));
    }
}
