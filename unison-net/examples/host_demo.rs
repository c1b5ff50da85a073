//! Minimal host: advertise a room, serve a local file, start playback.
//!
//! No audio stack is attached (NullDecoder); this demonstrates the wiring
//! between discovery, transport, track distribution and the engine.
//!
//! Usage: host_demo <audio-file>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use unison_clock::RoomTimeHandle;
use unison_net::discovery::{DiscoveredRoom, RoomPublisher};
use unison_net::transfer::{hash_file, TrackServer};
use unison_net::transport::WsHost;
use unison_sync::decoder::testing::NullDecoder;
use unison_sync::facade::{EngineCommand, Role, SyncEngine, TrackMetadata};
use unison_sync::SyncConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let file = std::env::args()
        .nth(1)
        .expect("usage: host_demo <audio-file>");
    let path = PathBuf::from(&file);

    let (ws, events) = WsHost::bind("0.0.0.0:0").await?;
    let tracks = TrackServer::serve("0.0.0.0:0", "track-1", &path).await?;
    let file_hash = hash_file(&path).await?;
    let size_bytes = std::fs::metadata(&path)?.len();

    let room_id = format!("room-{:04x}", rand::random::<u16>());
    let _beacon = RoomPublisher::publish(DiscoveredRoom {
        room_id: room_id.clone(),
        room_name: "demo room".into(),
        host_ip: "127.0.0.1".into(),
        ws_port: ws.local_addr().port(),
        http_port: tracks.local_addr().port(),
        app_version: env!("CARGO_PKG_VERSION").into(),
        codec: "mp3".into(),
    })?;
    println!("hosting {room_id}: ws {}, http {}", ws.local_addr(), tracks.local_addr());

    let (engine, mut notifications) = SyncEngine::spawn(
        Role::Host,
        &room_id,
        "host",
        SyncConfig::default(),
        Arc::new(NullDecoder),
        ws.sender(),
        RoomTimeHandle::new(),
        events,
    );

    engine.send(EngineCommand::AnnounceTrack(TrackMetadata {
        track_id: "track-1".into(),
        url: tracks.url_for("127.0.0.1", "track-1"),
        file_hash,
        size_bytes,
        duration_ms: 0,
        file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        local_path: Some(file),
    }))?;

    // Give listeners a few seconds to join and prepare, then go.
    tokio::time::sleep(Duration::from_secs(5)).await;
    engine.send(EngineCommand::StartPlayback { start_pos_ms: 0 })?;

    while let Some(note) = notifications.recv().await {
        println!("{note:?}");
    }
    Ok(())
}
