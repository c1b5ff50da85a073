//! Catch-up controller.
//!
//! Brings a joining (or recovered) client to the host's predicted
//! position: load, seek to where the host *will* be one prepare window
//! from now, sleep until that room time, then play. Runs once per epoch;
//! a host pause/resume edge re-arms it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use unison_clock::RoomTimeHandle;

use crate::decoder::{Decoder, DecoderError};
use crate::scheduler::{COARSE_MARGIN_MS, FINE_TICK_MS};

/// Gate bookkeeping. The gates are checked (and the in-flight flag plus
/// done-epoch are set) synchronously on the engine task, before any async
/// work, so two `host_state` arrivals cannot both launch a run.
#[derive(Debug)]
pub struct CatchUpController {
    min_spacing_ms: i64,
    in_flight: Arc<AtomicBool>,
    done_epoch: Option<u64>,
    last_attempt_wall_ms: Option<i64>,
}

/// Clears the in-flight flag when the run finishes, however it finishes.
pub struct CatchUpGuard(Arc<AtomicBool>);

impl Drop for CatchUpGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CatchUpController {
    pub fn new(min_spacing_ms: i64) -> Self {
        Self {
            min_spacing_ms,
            in_flight: Arc::new(AtomicBool::new(false)),
            done_epoch: None,
            last_attempt_wall_ms: None,
        }
    }

    /// Try to claim a catch-up run for `epoch`. Returns a guard when all
    /// three gates pass; state is committed before the caller awaits
    /// anything.
    pub fn try_begin(&mut self, epoch: u64, wall_now_ms: i64) -> Option<CatchUpGuard> {
        if self.in_flight.load(Ordering::SeqCst) {
            return None;
        }
        if self.done_epoch == Some(epoch) {
            return None;
        }
        if self
            .last_attempt_wall_ms
            .is_some_and(|at| wall_now_ms - at < self.min_spacing_ms)
        {
            return None;
        }

        self.in_flight.store(true, Ordering::SeqCst);
        self.done_epoch = Some(epoch);
        self.last_attempt_wall_ms = Some(wall_now_ms);
        Some(CatchUpGuard(Arc::clone(&self.in_flight)))
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn done_epoch(&self) -> Option<u64> {
        self.done_epoch
    }

    /// Host `is_playing` false→true edge: the next playing state may catch
    /// up again, even within the same epoch.
    pub fn clear_done_epoch(&mut self) {
        self.done_epoch = None;
    }

    /// An epoch that started via the coordinated-start path is aligned by
    /// construction and must not catch up on top of it.
    pub fn mark_done(&mut self, epoch: u64) {
        self.done_epoch = Some(epoch);
    }
}

/// Inputs for one catch-up run, captured from the triggering host state.
#[derive(Debug, Clone)]
pub struct CatchUpRequest {
    pub epoch: u64,
    pub local_path: String,
    pub host_pos_ms: i64,
    pub sampled_at_room_ms: i64,
    pub latency_comp_ms: i64,
    pub prepare_lead_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpReport {
    pub epoch: u64,
    pub target_room_ms: i64,
    pub seek_to_ms: i64,
    pub started_at_room_ms: i64,
}

/// Run the catch-up procedure. On failure the done-epoch stays set, so a
/// broken decoder does not retry on every host state; recovery needs a
/// fresh `is_playing` edge.
pub async fn run_catch_up(
    req: CatchUpRequest,
    decoder: Arc<dyn Decoder>,
    time: RoomTimeHandle,
    _guard: CatchUpGuard,
) -> Result<CatchUpReport, DecoderError> {
    let target_room_ms = time.room_now_ms() + req.prepare_lead_ms;
    let host_future_pos =
        req.host_pos_ms + (target_room_ms - req.sampled_at_room_ms) - req.latency_comp_ms;

    let duration_ms = decoder.load(&req.local_path).await?;
    let seek_to_ms = host_future_pos.clamp(0, duration_ms);
    decoder.seek(seek_to_ms).await?;

    // Same two-phase wait as the future-start path, aimed at the prepare
    // deadline instead of a host-announced start.
    let remaining = target_room_ms - time.room_now_ms();
    if remaining > COARSE_MARGIN_MS {
        tokio::time::sleep(Duration::from_millis((remaining - COARSE_MARGIN_MS) as u64)).await;
    }
    while time.room_now_ms() < target_room_ms {
        tokio::time::sleep(Duration::from_millis(FINE_TICK_MS)).await;
    }

    decoder.play().await?;
    let report = CatchUpReport {
        epoch: req.epoch,
        target_room_ms,
        seek_to_ms,
        started_at_room_ms: time.room_now_ms(),
    };
    log::info!(
        "catch-up epoch {}: seek {} ms, started at room {} (target {})",
        report.epoch,
        report.seek_to_ms,
        report.started_at_room_ms,
        report.target_room_ms
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::testing::{DecoderCall, FakeDecoder};

    #[test]
    fn gates_serialize_concurrent_triggers() {
        let mut ctl = CatchUpController::new(1_500);
        let guard = ctl.try_begin(1, 10_000).expect("first trigger runs");
        // G1: already in flight.
        assert!(ctl.try_begin(1, 10_001).is_none());
        drop(guard);
        // G2: epoch already done.
        assert!(ctl.try_begin(1, 20_000).is_none());
        // A new epoch passes, once G3's spacing allows.
        assert!(ctl.try_begin(2, 20_000).is_some());
    }

    #[test]
    fn spacing_gate_limits_attempt_rate() {
        let mut ctl = CatchUpController::new(1_500);
        drop(ctl.try_begin(1, 10_000).unwrap());
        ctl.clear_done_epoch();
        // G3: too soon after the last attempt.
        assert!(ctl.try_begin(1, 11_000).is_none());
        assert!(ctl.try_begin(1, 11_500).is_some());
    }

    #[test]
    fn playing_edge_rearms_the_same_epoch() {
        let mut ctl = CatchUpController::new(1_500);
        drop(ctl.try_begin(1, 10_000).unwrap());
        assert!(ctl.try_begin(1, 20_000).is_none());
        ctl.clear_done_epoch();
        assert!(ctl.try_begin(1, 20_000).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn procedure_seeks_to_the_predicted_position() {
        // Host state: playing at 42_000 ms, sampled at room 20_000;
        // client room time is 20_150 with 100 ms latency comp.
        let time = RoomTimeHandle::with_base(20_150);
        let decoder = Arc::new(FakeDecoder::new(300_000));
        let mut ctl = CatchUpController::new(1_500);
        let guard = ctl.try_begin(1, time.wall_now_ms()).unwrap();

        let req = CatchUpRequest {
            epoch: 1,
            local_path: "/cache/track.mp3".into(),
            host_pos_ms: 42_000,
            sampled_at_room_ms: 20_000,
            latency_comp_ms: 100,
            prepare_lead_ms: 300,
        };
        let report = run_catch_up(req, Arc::clone(&decoder) as Arc<dyn Decoder>, time, guard)
            .await
            .unwrap();

        assert_eq!(report.target_room_ms, 20_450);
        assert_eq!(report.seek_to_ms, 42_350);
        assert!((report.started_at_room_ms - 20_450).abs() <= 4);
        assert_eq!(
            decoder.calls(),
            vec![
                DecoderCall::Load("/cache/track.mp3".into()),
                DecoderCall::Seek(42_350),
                DecoderCall::Play,
            ]
        );
        assert!(!ctl.is_in_flight());
        assert_eq!(ctl.done_epoch(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn seek_target_is_clamped_to_the_track() {
        let time = RoomTimeHandle::with_base(20_000);
        let decoder = Arc::new(FakeDecoder::new(42_500));
        let mut ctl = CatchUpController::new(1_500);
        let guard = ctl.try_begin(1, time.wall_now_ms()).unwrap();

        let req = CatchUpRequest {
            epoch: 1,
            local_path: "/cache/track.mp3".into(),
            host_pos_ms: 42_400,
            sampled_at_room_ms: 19_000,
            latency_comp_ms: 0,
            prepare_lead_ms: 300,
        };
        let report = run_catch_up(req, decoder as Arc<dyn Decoder>, time, guard)
            .await
            .unwrap();
        assert_eq!(report.seek_to_ms, 42_500);
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_leaves_done_epoch_set() {
        let time = RoomTimeHandle::with_base(20_000);
        let decoder = Arc::new(FakeDecoder::new(300_000));
        decoder.fail_next_load("missing file");
        let mut ctl = CatchUpController::new(1_500);
        let guard = ctl.try_begin(1, time.wall_now_ms()).unwrap();

        let req = CatchUpRequest {
            epoch: 1,
            local_path: "/cache/track.mp3".into(),
            host_pos_ms: 1_000,
            sampled_at_room_ms: 19_900,
            latency_comp_ms: 0,
            prepare_lead_ms: 300,
        };
        let result = run_catch_up(req, decoder as Arc<dyn Decoder>, time, guard).await;
        assert!(result.is_err());
        assert!(!ctl.is_in_flight());
        // No tight retry loop: the epoch stays marked done.
        assert!(ctl.try_begin(1, 30_000).is_none());
    }
}
