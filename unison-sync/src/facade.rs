//! Sync engine facade.
//!
//! One task owns every piece of mutable sync state: the room clock, the
//! ping scheduler, the future-start scheduler, catch-up, KeepSync and the
//! metrics ring. Everything reaches it as an event — transport frames,
//! app commands, timer ticks, completions from spawned waits — so no lock
//! guards any of the decision state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};

use unison_clock::{ClockStats, RoomClock, RoomTimeHandle, SampleOutcome, Synchronizer};

use crate::catchup::{run_catch_up, CatchUpController, CatchUpReport, CatchUpRequest};
use crate::config::SyncConfig;
use crate::decoder::{Decoder, DecoderError};
use crate::error::SyncError;
use crate::keepsync::{Decision, DecisionAction, KeepSync, KeepSyncCounters, KeepSyncInput};
use crate::messages::{
    decode_frame, DecodeError, PeerRole, ReadyErrorCode, UnknownTypeWarner, WireMessage,
};
use crate::metrics::{SampleAction, SyncMetrics, SyncSample};
use crate::scheduler::{
    FutureStartScheduler, ScheduleOutcome, SchedulerPhase, StartDescriptor, StartReport,
};
use crate::transport::{PeerId, SharedSender, TransportEvent};

/// Engine tick period; pings and host-state broadcasts are paced off this.
const TICK_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Track metadata as announced by the host. `local_path` is set on the
/// host (source file) and on clients once the download lands.
#[derive(Debug, Clone)]
pub struct TrackMetadata {
    pub track_id: String,
    pub url: String,
    pub file_hash: String,
    pub size_bytes: u64,
    pub duration_ms: i64,
    pub file_name: Option<String>,
    pub local_path: Option<String>,
}

#[derive(Debug)]
pub enum EngineCommand {
    /// Host: set the session track and announce it to everyone.
    AnnounceTrack(TrackMetadata),
    /// Host: start coordinated playback from this position.
    StartPlayback { start_pos_ms: i64 },
    /// Host: pause playback and stop the state broadcast.
    PausePlayback,
    /// Client: the announced track is downloaded and loadable.
    TrackReady {
        track_id: String,
        local_path: String,
        prepare_ms: i64,
    },
    /// Client: the download failed.
    TrackFailed {
        track_id: String,
        code: ReadyErrorCode,
        message: String,
    },
    /// Client: app moved to/from the background.
    SetBackground(bool),
    Shutdown,
}

/// Events the app layer may want to react to (download requests mostly).
#[derive(Debug, Clone)]
pub enum EngineNotification {
    /// Client side: fetch this track, then send `TrackReady`/`TrackFailed`.
    TrackAnnounced(TrackMetadata),
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// Playback began locally (future start or catch-up).
    Started { epoch: u64, start_error_ms: i64 },
}

/// Read-only engine snapshot published over a watch channel.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub is_host: bool,
    pub state: String,
    pub epoch: u64,
    pub playing: bool,
    pub clock: ClockStats,
    pub keepsync: KeepSyncCounters,
    pub current_speed: f64,
    pub last_delta_ms: Option<i64>,
    pub protection_active: bool,
    pub protection_trigger: Option<&'static str>,
}

#[derive(Debug)]
pub enum EngineEvent {
    Transport(TransportEvent),
    Command(EngineCommand),
    StartFired(StartReport),
    StartPlayFailed { epoch: u64, seq: u64, error: String },
    CatchUpDone(Result<CatchUpReport, DecoderError>),
}

/// Cheap handle for feeding commands and reading status.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    pub fn send(&self, cmd: EngineCommand) -> Result<(), SyncError> {
        self.tx
            .send(EngineEvent::Command(cmd))
            .map_err(|_| SyncError::EngineStopped)
    }

    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }
}

#[derive(Debug, Clone, Copy)]
struct SeekEcho {
    set_at_wall_ms: i64,
    target_ms: i64,
}

#[derive(Debug, Clone)]
struct HostStateSnapshot {
    track_id: String,
    is_playing: bool,
    host_pos_ms: i64,
    sampled_at_room_ms: i64,
    epoch: u64,
}

pub struct SyncEngine {
    role: Role,
    room_id: String,
    peer_id: String,
    cfg: SyncConfig,

    clock: RoomClock,
    time: RoomTimeHandle,
    synchronizer: Synchronizer,
    scheduler: FutureStartScheduler,
    catchup: CatchUpController,
    keepsync: KeepSync,
    metrics: SyncMetrics,

    decoder: Arc<dyn Decoder>,
    sender: SharedSender,
    internal_tx: mpsc::UnboundedSender<EngineEvent>,
    internal_rx: mpsc::UnboundedReceiver<EngineEvent>,
    notify_tx: mpsc::UnboundedSender<EngineNotification>,
    status_tx: watch::Sender<EngineStatus>,
    warner: UnknownTypeWarner,

    track: Option<TrackMetadata>,
    track_ready: bool,
    playing: bool,
    state_label: String,

    // Client side.
    host_peer: Option<PeerId>,
    session_id: Option<String>,
    host_playing: bool,
    last_host_epoch: u64,
    last_host_state: Option<HostStateSnapshot>,
    seek_echo: Option<SeekEcho>,

    // Host side.
    peers: HashMap<PeerId, String>,
    next_host_state_at_wall: i64,
}

impl SyncEngine {
    /// Build an engine. The caller drives `run()`, usually via `spawn`.
    pub fn new(
        role: Role,
        room_id: &str,
        peer_id: &str,
        cfg: SyncConfig,
        decoder: Arc<dyn Decoder>,
        sender: SharedSender,
        time: RoomTimeHandle,
    ) -> (
        Self,
        EngineHandle,
        mpsc::UnboundedReceiver<EngineNotification>,
    ) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(EngineStatus {
            is_host: role == Role::Host,
            state: "idle".into(),
            current_speed: 1.0,
            ..EngineStatus::default()
        });

        let engine = Self {
            role,
            room_id: room_id.to_owned(),
            peer_id: peer_id.to_owned(),
            scheduler: FutureStartScheduler::new(time.clone()),
            catchup: CatchUpController::new(cfg.catchup_min_spacing_ms),
            keepsync: KeepSync::new(cfg.keepsync.clone()),
            metrics: SyncMetrics::new(),
            cfg,
            clock: RoomClock::new(),
            time,
            synchronizer: Synchronizer::new(),
            decoder,
            sender,
            internal_tx: internal_tx.clone(),
            internal_rx,
            notify_tx,
            status_tx,
            warner: UnknownTypeWarner::default(),
            track: None,
            track_ready: false,
            playing: false,
            state_label: "idle".into(),
            host_peer: None,
            session_id: None,
            host_playing: false,
            last_host_epoch: 0,
            last_host_state: None,
            seek_echo: None,
            peers: HashMap::new(),
            next_host_state_at_wall: 0,
        };
        let handle = EngineHandle {
            tx: internal_tx,
            status: status_rx,
        };
        (engine, handle, notify_rx)
    }

    /// Build and spawn in one step.
    pub fn spawn(
        role: Role,
        room_id: &str,
        peer_id: &str,
        cfg: SyncConfig,
        decoder: Arc<dyn Decoder>,
        sender: SharedSender,
        time: RoomTimeHandle,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<EngineNotification>) {
        let (engine, handle, notify_rx) = Self::new(role, room_id, peer_id, cfg, decoder, sender, time);
        tokio::spawn(engine.run(transport_rx));
        (handle, notify_rx)
    }

    fn wall_now(&self) -> i64 {
        self.time.wall_now_ms()
    }

    fn room_now(&self) -> i64 {
        self.clock.room_time(self.wall_now())
    }

    pub async fn run(mut self, mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ev = self.internal_rx.recv() => {
                    match ev {
                        Some(EngineEvent::Command(EngineCommand::Shutdown)) | None => break,
                        Some(ev) => self.handle_event(ev).await,
                    }
                }
                ev = transport_rx.recv() => {
                    match ev {
                        Some(ev) => self.handle_event(EngineEvent::Transport(ev)).await,
                        None => break,
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }
        log::info!("sync engine for {} stopped", self.peer_id);
    }

    async fn handle_event(&mut self, ev: EngineEvent) {
        match ev {
            EngineEvent::Transport(ev) => self.on_transport(ev).await,
            EngineEvent::Command(cmd) => self.on_command(cmd).await,
            EngineEvent::StartFired(report) => self.on_start_fired(report).await,
            EngineEvent::StartPlayFailed { epoch, seq, error } => {
                log::error!("play at start epoch {epoch} seq {seq} failed: {error}");
                self.state_label = format!("failed: {error}");
                self.publish_status();
            }
            EngineEvent::CatchUpDone(result) => self.on_catch_up_done(result),
        }
    }

    async fn on_tick(&mut self) {
        let wall = self.wall_now();
        if self.role == Role::Client {
            if let Some(ping) = self.synchronizer.poll(wall) {
                if let Some(host) = self.host_peer.clone() {
                    self.sender.send_to(
                        &host,
                        WireMessage::Ping {
                            seq: ping.seq,
                            t0_client_ms: ping.t0,
                        }
                        .encode(),
                    );
                }
            }
        }

        if self.role == Role::Host && self.playing && wall >= self.next_host_state_at_wall {
            self.broadcast_host_state(true).await;
            self.next_host_state_at_wall += self.cfg.host_state_period_ms;
            if self.next_host_state_at_wall <= wall {
                self.next_host_state_at_wall = wall + self.cfg.host_state_period_ms;
            }
        }

        self.metrics.evaluate(self.room_now());
    }

    async fn broadcast_host_state(&mut self, is_playing: bool) {
        let Some(track) = self.track.as_ref() else {
            return;
        };
        let host_pos_ms = self.decoder.position().await;
        let msg = WireMessage::HostState {
            room_id: self.room_id.clone(),
            track_id: track.track_id.clone(),
            is_playing,
            host_pos_ms,
            sampled_at_room_time_ms: self.room_now(),
            epoch: self.clock.epoch(),
            seq: self.clock.next_seq(),
        };
        self.sender.broadcast(msg.encode());
    }

    async fn on_transport(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::PeerConnected { peer_id } => {
                if self.role == Role::Client {
                    self.host_peer = Some(peer_id.clone());
                    self.sender.send_to(
                        &peer_id,
                        WireMessage::Hello {
                            proto_ver: crate::messages::PROTO_VERSION,
                            room_id: self.room_id.clone(),
                            peer_id: self.peer_id.clone(),
                            role: PeerRole::Client,
                            device_info: std::env::consts::OS.to_owned(),
                        }
                        .encode(),
                    );
                    self.synchronizer.start(self.wall_now());
                }
            }
            TransportEvent::PeerDisconnected { peer_id, reason } => match self.role {
                Role::Client => {
                    if self.host_peer.as_deref() == Some(peer_id.as_str()) {
                        log::warn!("host link lost: {reason:?}");
                        self.host_peer = None;
                        self.synchronizer.stop();
                    }
                }
                Role::Host => {
                    if let Some(logical) = self.peers.remove(&peer_id) {
                        self.sender.broadcast(
                            WireMessage::PeerLeave {
                                peer_id: logical.clone(),
                                reason,
                            }
                            .encode(),
                        );
                        let _ = self
                            .notify_tx
                            .send(EngineNotification::PeerLeft { peer_id: logical });
                    }
                }
            },
            TransportEvent::Frame { peer_id, text } => match decode_frame(&text) {
                Ok(msg) => self.on_message(peer_id, msg).await,
                Err(DecodeError::UnknownType(t)) => self.warner.warn(&t, self.wall_now()),
                Err(err) => log::debug!("undecodable frame from {peer_id}: {err}"),
            },
        }
    }

    async fn on_message(&mut self, from: PeerId, msg: WireMessage) {
        match (self.role, msg) {
            // Host side.
            (
                Role::Host,
                WireMessage::Hello {
                    proto_ver,
                    room_id,
                    peer_id: logical,
                    ..
                },
            ) => {
                if room_id != self.room_id {
                    log::warn!("peer {logical} greeted room {room_id}, we are {}", self.room_id);
                    return;
                }
                log::info!("peer {logical} joined (proto {proto_ver})");
                self.peers.insert(from.clone(), logical.clone());
                let session_id = self
                    .session_id
                    .get_or_insert_with(|| format!("{}-{}", self.room_id, self.time.wall_now_ms()))
                    .clone();
                self.sender.send_to(
                    &from,
                    WireMessage::Welcome {
                        session_id,
                        server_now_ms: self.room_now(),
                    }
                    .encode(),
                );
                self.sender.broadcast(
                    WireMessage::PeerJoin {
                        peer_id: logical.clone(),
                        role: Some(PeerRole::Client),
                        device_info: None,
                    }
                    .encode(),
                );
                // Late joiner gets the current track directly.
                if let Some(track) = self.track.as_ref() {
                    self.sender.send_to(&from, announce_message(&self.room_id, &self.peer_id, track));
                }
                let _ = self
                    .notify_tx
                    .send(EngineNotification::PeerJoined { peer_id: logical });
            }
            (Role::Host, WireMessage::Ping { seq, t0_client_ms }) => {
                self.sender.send_to(
                    &from,
                    WireMessage::Pong {
                        seq,
                        t0_client_ms,
                        t1_server_ms: self.room_now(),
                    }
                    .encode(),
                );
            }
            (Role::Host, WireMessage::ClientReady { track_id, prepare_ms, .. }) => {
                log::info!(
                    "peer {} ready for track {track_id} (prepared in {prepare_ms} ms)",
                    self.peers.get(&from).map_or(from.as_str(), |p| p.as_str())
                );
            }
            (Role::Host, WireMessage::ClientReadyError { track_id, error_code, error_message }) => {
                log::warn!(
                    "peer {from} failed to prepare track {track_id}: {error_code:?} {error_message}"
                );
            }
            (Role::Host, WireMessage::ClientStartReport { peer_id, start_error_ms, .. }) => {
                log::info!("peer {peer_id} started with error {start_error_ms} ms");
            }

            // Client side.
            (Role::Client, WireMessage::Welcome { session_id, .. }) => {
                self.session_id = Some(session_id);
            }
            (Role::Client, WireMessage::Pong { seq, t1_server_ms, .. }) => {
                self.on_pong(seq, t1_server_ms).await;
            }
            (Role::Client, WireMessage::PeerJoin { peer_id, .. }) => {
                let _ = self.notify_tx.send(EngineNotification::PeerJoined { peer_id });
            }
            (Role::Client, WireMessage::PeerLeave { peer_id, .. }) => {
                let _ = self.notify_tx.send(EngineNotification::PeerLeft { peer_id });
            }
            (Role::Client, WireMessage::TrackAnnounce {
                track_id,
                url,
                file_hash,
                size_bytes,
                duration_ms,
                file_name,
                ..
            }) => {
                // Broadcast and join-time unicast can both deliver the same
                // announcement; a repeat must not reset readiness.
                let already_known = self
                    .track
                    .as_ref()
                    .is_some_and(|t| t.track_id == track_id && t.file_hash == file_hash);
                if already_known {
                    return;
                }
                let meta = TrackMetadata {
                    track_id,
                    url,
                    file_hash,
                    size_bytes,
                    duration_ms,
                    file_name,
                    local_path: None,
                };
                self.track_ready = false;
                self.track = Some(meta.clone());
                let _ = self.notify_tx.send(EngineNotification::TrackAnnounced(meta));
            }
            (Role::Client, WireMessage::StartAt {
                epoch,
                seq,
                track_id,
                start_at_room_time_ms,
                start_pos_ms,
            }) => {
                self.on_start_at(epoch, seq, track_id, start_at_room_time_ms, start_pos_ms);
            }
            (Role::Client, WireMessage::HostState {
                track_id,
                is_playing,
                host_pos_ms,
                sampled_at_room_time_ms,
                epoch,
                ..
            }) => {
                self.on_host_state(HostStateSnapshot {
                    track_id,
                    is_playing,
                    host_pos_ms,
                    sampled_at_room_ms: sampled_at_room_time_ms,
                    epoch,
                })
                .await;
            }

            (_, other) => {
                log::debug!("message {other:?} ignored in role {:?}", self.role);
            }
        }
    }

    async fn on_pong(&mut self, seq: u64, t1_server_ms: i64) {
        let wall = self.wall_now();
        let Some(sample) = self.synchronizer.on_pong(seq, t1_server_ms, wall) else {
            return;
        };
        match self.clock.on_sample(sample) {
            SampleOutcome::Accepted { lock_edge } => {
                self.time.set_offset_ms(self.clock.offset_ms());
                if let Some(locked) = lock_edge {
                    self.time.set_locked(locked);
                    self.publish_status();
                    if locked {
                        self.maybe_catch_up().await;
                    }
                }
            }
            SampleOutcome::Rejected(_) => {}
        }
    }

    fn on_start_at(
        &mut self,
        epoch: u64,
        seq: u64,
        track_id: String,
        start_at_room_time_ms: i64,
        start_pos_ms: i64,
    ) {
        let Some(local_path) = self
            .track
            .as_ref()
            .filter(|t| t.track_id == track_id)
            .and_then(|t| t.local_path.clone())
        else {
            log::error!("start_at for track {track_id} but no local copy; staying idle");
            self.state_label = "failed: track missing on start".into();
            self.publish_status();
            return;
        };

        let decoder = Arc::clone(&self.decoder);
        let path = local_path.clone();
        let prepare = Box::new(move || {
            async move {
                decoder.load(&path).await.map_err(|e| e.to_string())?;
                decoder.seek(start_pos_ms).await.map_err(|e| e.to_string())?;
                Ok(())
            }
            .boxed()
        });

        let decoder = Arc::clone(&self.decoder);
        let tx = self.internal_tx.clone();
        let on_start = Box::new(move |report: StartReport| {
            async move {
                match decoder.play().await {
                    Ok(()) => {
                        let _ = tx.send(EngineEvent::StartFired(report));
                    }
                    Err(err) => {
                        let _ = tx.send(EngineEvent::StartPlayFailed {
                            epoch: report.epoch,
                            seq: report.seq,
                            error: err.to_string(),
                        });
                    }
                }
            }
            .boxed()
        });

        let outcome = self.scheduler.schedule(
            StartDescriptor {
                epoch,
                seq,
                track_id,
                start_at_room_ms: start_at_room_time_ms,
                start_pos_ms,
            },
            prepare,
            on_start,
        );
        if outcome == ScheduleOutcome::Scheduled {
            self.state_label = "preparing".into();
            self.publish_status();
        }
    }

    async fn on_host_state(&mut self, snap: HostStateSnapshot) {
        if snap.epoch < self.last_host_epoch {
            return;
        }
        self.last_host_epoch = snap.epoch;

        if !self.host_playing && snap.is_playing {
            self.catchup.clear_done_epoch();
        }
        self.host_playing = snap.is_playing;
        self.last_host_state = Some(snap.clone());

        if self.decoder.is_playing().await {
            self.keep_sync_step(&snap).await;
        } else if snap.is_playing {
            self.maybe_catch_up().await;
        }
    }

    async fn keep_sync_step(&mut self, snap: &HostStateSnapshot) {
        let wall = self.wall_now();

        // Right after a seek, the decoder still reports the old position;
        // reacting to it would trigger a second correction.
        if let Some(echo) = self.seek_echo {
            if wall - echo.set_at_wall_ms <= self.cfg.seek_echo_window_ms {
                let pos = self.decoder.position().await;
                if (pos - echo.target_ms).abs() > self.cfg.seek_echo_tolerance_ms {
                    return;
                }
            }
            self.seek_echo = None;
        }

        let client_pos_ms = self.decoder.position().await;
        let duration_ms = match self.track.as_ref().map(|t| t.duration_ms).filter(|d| *d > 0) {
            Some(d) => d,
            None => self.decoder.duration().await,
        };
        let clock = self.clock.snapshot();
        let room_now_ms = self.room_now();
        let clock_locked = self.clock.is_locked();
        let latency_comp_ms = self.cfg.calibration.total_compensation_ms();

        let decision = self.keepsync.decide(
            KeepSyncInput {
                is_playing: snap.is_playing,
                epoch: snap.epoch,
                track_id: &snap.track_id,
                host_pos_ms: snap.host_pos_ms,
                sampled_at_room_ms: snap.sampled_at_room_ms,
                room_now_ms,
                client_pos_ms,
                duration_ms,
                latency_comp_ms,
                clock_locked,
                jitter_ms: clock.jitter_ms,
                rtt_ms: clock.rtt_ms,
            },
            wall,
        );

        let executed = self.execute_decision(&decision, wall).await;
        self.metrics.record(SyncSample {
            ts_room_ms: self.room_now(),
            delta_ms: decision.delta_ms,
            audible_pos_ms: client_pos_ms,
            target_pos_ms: decision.target_pos_ms,
            rtt_ms: clock.rtt_ms,
            jitter_ms: clock.jitter_ms,
            speed: self.keepsync.current_speed(),
            action: executed,
            reason: decision.reason,
        });
        self.publish_status_with_delta(decision.delta_ms);
    }

    /// Apply a decision to the decoder, narrowed by protection mode.
    /// KeepSync's pacing state is committed only once the decoder accepted
    /// the action; a refused call changes nothing anywhere. Returns what
    /// actually happened.
    async fn execute_decision(&mut self, decision: &Decision, wall: i64) -> SampleAction {
        match decision.action {
            DecisionAction::Noop => SampleAction::Noop,
            DecisionAction::SetSpeed(rate) => {
                let rate = if self.metrics.protection_active() {
                    SyncMetrics::clamp_protected_speed(rate)
                } else {
                    rate
                };
                match self.decoder.set_speed(rate).await {
                    Ok(()) => {
                        self.keepsync.commit_last(wall, Some(rate));
                        SampleAction::SetSpeed
                    }
                    Err(err) => {
                        log::warn!("set_speed({rate}) failed: {err}");
                        SampleAction::Noop
                    }
                }
            }
            DecisionAction::Seek(target_ms) => {
                if self.metrics.seek_suppressed(decision.delta_ms) {
                    log::debug!(
                        "seek of {} ms suppressed by protection mode",
                        decision.delta_ms
                    );
                    return SampleAction::Noop;
                }
                match self.decoder.seek(target_ms).await {
                    Ok(()) => {
                        self.keepsync.commit_last(wall, None);
                        self.seek_echo = Some(SeekEcho {
                            set_at_wall_ms: wall,
                            target_ms,
                        });
                        SampleAction::Seek
                    }
                    Err(err) => {
                        log::warn!("seek({target_ms}) failed: {err}");
                        SampleAction::Noop
                    }
                }
            }
        }
    }

    async fn maybe_catch_up(&mut self) {
        if self.role != Role::Client || self.decoder.is_playing().await {
            return;
        }
        let Some(snap) = self.last_host_state.clone() else {
            return;
        };
        if !snap.is_playing || !self.track_ready || !self.clock.is_locked() {
            return;
        }
        let Some(local_path) = self.track.as_ref().and_then(|t| t.local_path.clone()) else {
            return;
        };
        // A pending coordinated start owns the decoder.
        if matches!(
            self.scheduler.phase(),
            SchedulerPhase::Preparing { .. } | SchedulerPhase::Waiting { .. }
        ) {
            return;
        }
        let Some(guard) = self.catchup.try_begin(snap.epoch, self.wall_now()) else {
            return;
        };

        let req = CatchUpRequest {
            epoch: snap.epoch,
            local_path,
            host_pos_ms: snap.host_pos_ms,
            sampled_at_room_ms: snap.sampled_at_room_ms,
            latency_comp_ms: self.cfg.calibration.total_compensation_ms(),
            prepare_lead_ms: self.cfg.prepare_lead_ms,
        };
        let decoder = Arc::clone(&self.decoder);
        let time = self.time.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = run_catch_up(req, decoder, time, guard).await;
            let _ = tx.send(EngineEvent::CatchUpDone(result));
        });
        self.state_label = "catching_up".into();
        self.publish_status();
    }

    async fn on_start_fired(&mut self, report: StartReport) {
        self.playing = true;
        self.state_label = "playing".into();
        match self.role {
            Role::Host => {
                // Begin the periodic state broadcast right away.
                self.next_host_state_at_wall = self.wall_now();
            }
            Role::Client => {
                // This epoch is aligned by construction; catch-up stays off.
                self.catchup.mark_done(report.epoch);
                if let Some(host) = self.host_peer.clone() {
                    self.sender.send_to(
                        &host,
                        WireMessage::ClientStartReport {
                            peer_id: self.peer_id.clone(),
                            epoch: report.epoch,
                            seq: report.seq,
                            actual_start_room_time_ms: report.actual_start_room_ms,
                            start_error_ms: report.start_error_ms,
                        }
                        .encode(),
                    );
                }
            }
        }
        let _ = self.notify_tx.send(EngineNotification::Started {
            epoch: report.epoch,
            start_error_ms: report.start_error_ms,
        });
        self.publish_status();
    }

    fn on_catch_up_done(&mut self, result: Result<CatchUpReport, DecoderError>) {
        match result {
            Ok(report) => {
                self.playing = true;
                self.state_label = "playing".into();
                let _ = self.notify_tx.send(EngineNotification::Started {
                    epoch: report.epoch,
                    start_error_ms: report.started_at_room_ms - report.target_room_ms,
                });
            }
            Err(err) => {
                log::error!("catch-up failed: {err}");
                self.state_label = format!("failed: {err}");
            }
        }
        self.publish_status();
    }

    async fn on_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::AnnounceTrack(meta) => {
                if self.role != Role::Host {
                    log::warn!("announce_track ignored on a client");
                    return;
                }
                self.sender
                    .broadcast(announce_message(&self.room_id, &self.peer_id, &meta));
                self.track = Some(meta);
                self.track_ready = true;
            }
            EngineCommand::StartPlayback { start_pos_ms } => {
                self.start_playback(start_pos_ms).await;
            }
            EngineCommand::PausePlayback => {
                if self.role != Role::Host {
                    return;
                }
                if let Err(err) = self.decoder.pause().await {
                    log::warn!("pause failed: {err}");
                }
                self.playing = false;
                self.state_label = "paused".into();
                self.broadcast_host_state(false).await;
                self.publish_status();
            }
            EngineCommand::TrackReady {
                track_id,
                local_path,
                prepare_ms,
            } => {
                let Some(track) = self.track.as_mut().filter(|t| t.track_id == track_id) else {
                    log::warn!("track_ready for unknown track {track_id}");
                    return;
                };
                track.local_path = Some(local_path.clone());
                self.track_ready = true;
                if let Some(host) = self.host_peer.clone() {
                    self.sender.send_to(
                        &host,
                        WireMessage::ClientReady {
                            track_id,
                            cached: true,
                            local_path,
                            prepare_ms,
                        }
                        .encode(),
                    );
                }
                self.maybe_catch_up().await;
            }
            EngineCommand::TrackFailed {
                track_id,
                code,
                message,
            } => {
                if let Some(host) = self.host_peer.clone() {
                    self.sender.send_to(
                        &host,
                        WireMessage::ClientReadyError {
                            track_id,
                            error_code: code,
                            error_message: message,
                        }
                        .encode(),
                    );
                }
            }
            EngineCommand::SetBackground(background) => {
                self.synchronizer.set_background(background, self.wall_now());
            }
            EngineCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn start_playback(&mut self, start_pos_ms: i64) {
        if self.role != Role::Host {
            log::warn!("start_playback ignored on a client");
            return;
        }
        let Some((track_id, local_path)) = self
            .track
            .as_ref()
            .and_then(|t| t.local_path.clone().map(|p| (t.track_id.clone(), p)))
        else {
            log::error!("start_playback with no local track");
            self.state_label = "failed: no track".into();
            self.publish_status();
            return;
        };

        let epoch = self.clock.new_epoch();
        let seq = self.clock.next_seq();
        let start_at_room_ms = self.room_now() + self.cfg.start_lead_ms;

        self.sender.broadcast(
            WireMessage::StartAt {
                epoch,
                seq,
                track_id: track_id.clone(),
                start_at_room_time_ms: start_at_room_ms,
                start_pos_ms,
            }
            .encode(),
        );

        let decoder = Arc::clone(&self.decoder);
        let path = local_path.clone();
        let prepare = Box::new(move || {
            async move {
                decoder.load(&path).await.map_err(|e| e.to_string())?;
                decoder.seek(start_pos_ms).await.map_err(|e| e.to_string())?;
                Ok(())
            }
            .boxed()
        });
        let decoder = Arc::clone(&self.decoder);
        let tx = self.internal_tx.clone();
        let on_start = Box::new(move |report: StartReport| {
            async move {
                match decoder.play().await {
                    Ok(()) => {
                        let _ = tx.send(EngineEvent::StartFired(report));
                    }
                    Err(err) => {
                        let _ = tx.send(EngineEvent::StartPlayFailed {
                            epoch: report.epoch,
                            seq: report.seq,
                            error: err.to_string(),
                        });
                    }
                }
            }
            .boxed()
        });

        self.scheduler.schedule(
            StartDescriptor {
                epoch,
                seq,
                track_id,
                start_at_room_ms,
                start_pos_ms,
            },
            prepare,
            on_start,
        );
        self.state_label = "preparing".into();
        self.publish_status();
    }

    fn publish_status(&mut self) {
        self.publish_status_inner(None);
    }

    fn publish_status_with_delta(&mut self, delta_ms: i64) {
        self.publish_status_inner(Some(delta_ms));
    }

    fn publish_status_inner(&mut self, delta_ms: Option<i64>) {
        let status = EngineStatus {
            is_host: self.role == Role::Host,
            state: self.state_label.clone(),
            epoch: self.clock.epoch().max(self.last_host_epoch),
            playing: self.playing,
            clock: self.clock.snapshot(),
            keepsync: self.keepsync.counters(),
            current_speed: self.keepsync.current_speed(),
            last_delta_ms: delta_ms.or_else(|| self.status_tx.borrow().last_delta_ms),
            protection_active: self.metrics.protection_active(),
            protection_trigger: self.metrics.protection_trigger().map(|t| t.as_str()),
        };
        let _ = self.status_tx.send(status);
    }
}

fn announce_message(room_id: &str, host_peer_id: &str, track: &TrackMetadata) -> String {
    WireMessage::TrackAnnounce {
        room_id: room_id.to_owned(),
        host_peer_id: host_peer_id.to_owned(),
        track_id: track.track_id.clone(),
        url: track.url.clone(),
        file_hash: track.file_hash.clone(),
        size_bytes: track.size_bytes,
        duration_ms: track.duration_ms,
        file_name: track.file_name.clone(),
    }
    .encode()
}
