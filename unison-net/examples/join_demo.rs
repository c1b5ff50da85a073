//! Minimal client: find a room on the LAN, join it and follow the host.
//!
//! Usage: join_demo

use std::sync::Arc;
use std::time::{Duration, Instant};

use unison_clock::RoomTimeHandle;
use unison_net::discovery::RoomBrowser;
use unison_net::transfer::download_track;
use unison_net::transport::WsClient;
use unison_sync::decoder::testing::NullDecoder;
use unison_sync::facade::{EngineCommand, EngineNotification, Role, SyncEngine};
use unison_sync::SyncConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let (_browser, mut rooms) = RoomBrowser::browse()?;
    println!("waiting for a room beacon...");
    let room = rooms.recv().await.expect("browse stream ended");
    println!("joining {} on {}", room.room_name, room.host_ip);

    let url = format!("ws://{}:{}", room.host_ip, room.ws_port);
    let (link, events) = WsClient::connect(&url).await?;
    let peer_id = format!("peer-{:04x}", rand::random::<u16>());

    let (engine, mut notifications) = SyncEngine::spawn(
        Role::Client,
        &room.room_id,
        &peer_id,
        SyncConfig::default(),
        Arc::new(NullDecoder),
        link.sender(),
        RoomTimeHandle::new(),
        events,
    );

    while let Some(note) = notifications.recv().await {
        match note {
            EngineNotification::TrackAnnounced(meta) => {
                let dest = std::env::temp_dir().join(format!("{}-{}.cache", peer_id, meta.track_id));
                let fetch_started = Instant::now();
                match download_track(&meta.url, &dest, &meta.file_hash, Duration::from_secs(30))
                    .await
                {
                    Ok(path) => engine.send(EngineCommand::TrackReady {
                        track_id: meta.track_id,
                        local_path: path.display().to_string(),
                        prepare_ms: fetch_started.elapsed().as_millis() as i64,
                    })?,
                    Err(err) => engine.send(EngineCommand::TrackFailed {
                        track_id: meta.track_id,
                        code: err.error_code(),
                        message: err.to_string(),
                    })?,
                }
            }
            other => println!("{other:?}"),
        }
    }
    Ok(())
}
