//! Future-start scheduler.
//!
//! Starts playback at an agreed room time with a two-phase wait: one
//! coarse sleep to just short of the target, then a fine 2 ms poll of the
//! room clock. A single long sleep would miss the target whenever the
//! offset estimate moves or the OS wakes the task late; the fine loop
//! absorbs both.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use unison_clock::RoomTimeHandle;

/// The coarse sleep ends this far before the target (ms).
pub const COARSE_MARGIN_MS: i64 = 80;
/// Fine poll period (ms).
pub const FINE_TICK_MS: u64 = 2;
/// How long the `Started` phase lingers before returning to idle (ms).
const STARTED_LINGER_MS: u64 = 2_000;

/// One coordinated start attempt. `(epoch, seq)` uniquely identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartDescriptor {
    pub epoch: u64,
    pub seq: u64,
    pub track_id: String,
    pub start_at_room_ms: i64,
    pub start_pos_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerPhase {
    Idle,
    Preparing {
        epoch: u64,
        seq: u64,
    },
    Waiting {
        epoch: u64,
        seq: u64,
        start_at_room_ms: i64,
    },
    Started {
        epoch: u64,
        seq: u64,
        actual_start_room_ms: i64,
        start_error_ms: i64,
    },
    Failed {
        epoch: u64,
        seq: u64,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// This `(epoch, seq)` was already scheduled; nothing changed.
    DuplicateAttempt,
    /// The descriptor's epoch is older than one already seen.
    StaleEpoch,
}

/// Fired exactly once per started attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReport {
    pub epoch: u64,
    pub seq: u64,
    pub actual_start_room_ms: i64,
    pub start_error_ms: i64,
}

pub type PrepareFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;
pub type StartFn = Box<dyn FnOnce(StartReport) -> BoxFuture<'static, ()> + Send>;

pub struct FutureStartScheduler {
    time: RoomTimeHandle,
    phase: Arc<Mutex<SchedulerPhase>>,
    task: Option<JoinHandle<()>>,
    seen: HashSet<(u64, u64)>,
    max_epoch: u64,
}

impl FutureStartScheduler {
    pub fn new(time: RoomTimeHandle) -> Self {
        Self {
            time,
            phase: Arc::new(Mutex::new(SchedulerPhase::Idle)),
            task: None,
            seen: HashSet::new(),
            max_epoch: 0,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase.lock().clone()
    }

    /// Schedule a start attempt. `prepare` runs once (load + seek); the
    /// start callback fires at `start_at_room_ms` — at most once per
    /// `(epoch, seq)`, no matter how often the descriptor is retransmitted.
    /// A new attempt cancels any outstanding one first.
    pub fn schedule(
        &mut self,
        desc: StartDescriptor,
        prepare: PrepareFn,
        on_start: StartFn,
    ) -> ScheduleOutcome {
        let key = (desc.epoch, desc.seq);
        if self.seen.contains(&key) {
            log::warn!(
                "start attempt epoch {} seq {} repeated, ignoring",
                desc.epoch,
                desc.seq
            );
            return ScheduleOutcome::DuplicateAttempt;
        }
        if desc.epoch < self.max_epoch {
            log::warn!(
                "start attempt epoch {} is older than epoch {}, ignoring",
                desc.epoch,
                self.max_epoch
            );
            return ScheduleOutcome::StaleEpoch;
        }

        self.cancel();
        self.seen.insert(key);
        self.max_epoch = desc.epoch;
        *self.phase.lock() = SchedulerPhase::Preparing {
            epoch: desc.epoch,
            seq: desc.seq,
        };

        let phase = Arc::clone(&self.phase);
        let time = self.time.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(error) = prepare().await {
                log::error!(
                    "prepare for start epoch {} seq {} failed: {error}",
                    desc.epoch,
                    desc.seq
                );
                *phase.lock() = SchedulerPhase::Failed {
                    epoch: desc.epoch,
                    seq: desc.seq,
                    error,
                };
                return;
            }

            *phase.lock() = SchedulerPhase::Waiting {
                epoch: desc.epoch,
                seq: desc.seq,
                start_at_room_ms: desc.start_at_room_ms,
            };

            // Coarse phase: sleep to just short of the target, recomputed
            // after prepare. Skipped entirely when the target is close or
            // already past.
            let remaining = desc.start_at_room_ms - time.room_now_ms();
            if remaining > COARSE_MARGIN_MS {
                tokio::time::sleep(Duration::from_millis((remaining - COARSE_MARGIN_MS) as u64))
                    .await;
            }

            // Fine phase: poll the room clock until the target passes.
            while time.room_now_ms() < desc.start_at_room_ms {
                tokio::time::sleep(Duration::from_millis(FINE_TICK_MS)).await;
            }

            let actual_start_room_ms = time.room_now_ms();
            let start_error_ms = actual_start_room_ms - desc.start_at_room_ms;
            if start_error_ms != 0 {
                log::debug!(
                    "start epoch {} seq {} fired with error {} ms",
                    desc.epoch,
                    desc.seq,
                    start_error_ms
                );
            }
            *phase.lock() = SchedulerPhase::Started {
                epoch: desc.epoch,
                seq: desc.seq,
                actual_start_room_ms,
                start_error_ms,
            };

            on_start(StartReport {
                epoch: desc.epoch,
                seq: desc.seq,
                actual_start_room_ms,
                start_error_ms,
            })
            .await;

            tokio::time::sleep(Duration::from_millis(STARTED_LINGER_MS)).await;
            let mut p = phase.lock();
            if matches!(&*p, SchedulerPhase::Started { epoch, seq, .. }
                if *epoch == desc.epoch && *seq == desc.seq)
            {
                *p = SchedulerPhase::Idle;
            }
        }));

        ScheduleOutcome::Scheduled
    }

    /// Drop any outstanding timers without firing the start callback.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut p = self.phase.lock();
        if matches!(
            &*p,
            SchedulerPhase::Preparing { .. } | SchedulerPhase::Waiting { .. }
        ) {
            *p = SchedulerPhase::Idle;
        }
    }
}

impl Drop for FutureStartScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn desc(epoch: u64, seq: u64, start_at: i64) -> StartDescriptor {
        StartDescriptor {
            epoch,
            seq,
            track_id: "t1".into(),
            start_at_room_ms: start_at,
            start_pos_ms: 0,
        }
    }

    fn noop_prepare() -> PrepareFn {
        Box::new(|| async { Ok(()) }.boxed())
    }

    fn slow_prepare(ms: u64) -> PrepareFn {
        Box::new(move || {
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            .boxed()
        })
    }

    fn recording_start(
        time: &RoomTimeHandle,
        log: &Arc<Mutex<Vec<(i64, StartReport)>>>,
    ) -> StartFn {
        let time = time.clone();
        let log = Arc::clone(log);
        Box::new(move |report| {
            log.lock().push((time.room_now_ms(), report));
            async {}.boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_the_target_time() {
        let time = RoomTimeHandle::with_base(10_000);
        let mut sched = FutureStartScheduler::new(time.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        let outcome = sched.schedule(
            desc(1, 0, 11_500),
            slow_prepare(200),
            recording_start(&time, &fired),
        );
        assert_eq!(outcome, ScheduleOutcome::Scheduled);

        tokio::time::sleep(Duration::from_millis(1_800)).await;
        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        let (at, report) = fired[0];
        assert!((at - 11_500).abs() <= 4, "fired at {at}");
        assert!(report.start_error_ms.abs() <= 4);
        assert_eq!(report.epoch, 1);
        assert_eq!(report.seq, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_descriptor_has_no_effect() {
        let time = RoomTimeHandle::with_base(10_000);
        let mut sched = FutureStartScheduler::new(time.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        sched.schedule(desc(1, 0, 10_500), noop_prepare(), recording_start(&time, &fired));
        let outcome = sched.schedule(
            desc(1, 0, 10_500),
            noop_prepare(),
            recording_start(&time, &fired),
        );
        assert_eq!(outcome, ScheduleOutcome::DuplicateAttempt);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(fired.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_epoch_is_refused() {
        let time = RoomTimeHandle::with_base(10_000);
        let mut sched = FutureStartScheduler::new(time.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        sched.schedule(desc(3, 0, 10_200), noop_prepare(), recording_start(&time, &fired));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let outcome = sched.schedule(
            desc(2, 9, 11_000),
            noop_prepare(),
            recording_start(&time, &fired),
        );
        assert_eq!(outcome, ScheduleOutcome::StaleEpoch);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fired.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_cancels_the_outstanding_attempt() {
        let time = RoomTimeHandle::with_base(10_000);
        let mut sched = FutureStartScheduler::new(time.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        sched.schedule(desc(1, 0, 15_000), noop_prepare(), recording_start(&time, &fired));
        sched.schedule(desc(1, 1, 12_000), noop_prepare(), recording_start(&time, &fired));

        tokio::time::sleep(Duration::from_millis(6_000)).await;
        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1.seq, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let time = RoomTimeHandle::with_base(10_000);
        let mut sched = FutureStartScheduler::new(time.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        sched.schedule(desc(1, 0, 11_000), noop_prepare(), recording_start(&time, &fired));
        tokio::time::sleep(Duration::from_millis(100)).await;
        sched.cancel();
        assert_eq!(sched.phase(), SchedulerPhase::Idle);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert!(fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn target_passed_during_prepare_fires_immediately() {
        let time = RoomTimeHandle::with_base(10_000);
        let mut sched = FutureStartScheduler::new(time.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        // Prepare overruns the target by 400 ms.
        sched.schedule(desc(1, 0, 10_100), slow_prepare(500), recording_start(&time, &fired));
        tokio::time::sleep(Duration::from_millis(600)).await;

        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        let (at, report) = fired[0];
        assert_eq!(at, 10_500);
        assert_eq!(report.start_error_ms, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_prepare_surfaces_without_firing() {
        let time = RoomTimeHandle::with_base(10_000);
        let mut sched = FutureStartScheduler::new(time.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        let prepare: PrepareFn = Box::new(|| async { Err("no decoder".to_string()) }.boxed());
        sched.schedule(desc(1, 0, 11_000), prepare, recording_start(&time, &fired));
        tokio::time::sleep(Duration::from_millis(2_000)).await;

        assert!(fired.lock().is_empty());
        assert_eq!(
            sched.phase(),
            SchedulerPhase::Failed {
                epoch: 1,
                seq: 0,
                error: "no decoder".into(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn started_phase_returns_to_idle() {
        let time = RoomTimeHandle::with_base(10_000);
        let mut sched = FutureStartScheduler::new(time.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));

        sched.schedule(desc(1, 0, 10_200), noop_prepare(), recording_start(&time, &fired));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(sched.phase(), SchedulerPhase::Started { .. }));

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(sched.phase(), SchedulerPhase::Idle);
    }
}
