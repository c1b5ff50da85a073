//! Room discovery over multicast UDP.
//!
//! The host beacons its room as a small JSON datagram into an
//! administratively-scoped multicast group once a second; browsers join
//! the group and surface each room the first time its beacon is seen.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

/// Administratively scoped group for room beacons.
const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);
const DISCOVERY_PORT: u16 = 47_800;
const BEACON_INTERVAL: Duration = Duration::from_secs(1);

/// One advertised room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredRoom {
    pub room_id: String,
    pub room_name: String,
    pub host_ip: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub app_version: String,
    pub codec: String,
}

fn multicast_socket(bind_port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, bind_port).into())?;
    socket.join_multicast_v4(&DISCOVERY_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket.into())
}

/// Advertises one room until dropped.
pub struct RoomPublisher {
    task: JoinHandle<()>,
}

impl RoomPublisher {
    pub fn publish(room: DiscoveredRoom) -> std::io::Result<Self> {
        let std_socket = multicast_socket(0)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let payload = serde_json::to_vec(&room).expect("room beacon serialization");
        let dest = SocketAddrV4::new(DISCOVERY_GROUP, DISCOVERY_PORT);

        let task = tokio::spawn(async move {
            let mut tick = interval(BEACON_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(err) = socket.send_to(&payload, dest).await {
                    log::warn!("room beacon send failed: {err}");
                }
            }
        });
        log::info!("publishing room {} ({})", room.room_id, room.room_name);
        Ok(Self { task })
    }
}

impl Drop for RoomPublisher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Handle keeping a browse task alive.
pub struct RoomBrowser {
    task: JoinHandle<()>,
}

impl RoomBrowser {
    /// Join the discovery group and stream each room the first time its
    /// beacon arrives. Malformed datagrams are skipped.
    pub fn browse() -> std::io::Result<(Self, mpsc::UnboundedReceiver<DiscoveredRoom>)> {
        let std_socket = multicast_socket(DISCOVERY_PORT)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                match serde_json::from_slice::<DiscoveredRoom>(&buf[..len]) {
                    Ok(room) => {
                        if seen.insert(room.room_id.clone()) && tx.send(room).is_err() {
                            break;
                        }
                    }
                    Err(err) => log::debug!("bad beacon from {from}: {err}"),
                }
            }
        });
        Ok((Self { task }, rx))
    }
}

impl Drop for RoomBrowser {
    fn drop(&mut self) {
        self.task.abort();
    }
}
