//! Room clock offset estimator.
//!
//! Feeds on `(seq, t0, t1, t2)` ping/pong samples and maintains a smoothed
//! offset mapping local wall time to room time, plus RTT/jitter estimates
//! and a lock flag downstream consumers gate on. Offset updates use the
//! minimum-RTT sample of the last few accepted measurements, which rejects
//! most of the queueing noise a busy WiFi link adds to individual pings.

use std::collections::VecDeque;

/// Reject samples with round trips above this (ms).
pub const RTT_CAP_MS: i64 = 200;
/// Reject samples whose raw offset jumps more than this from the estimate (ms).
pub const OFFSET_JUMP_CAP_MS: i64 = 120;
/// Smoothing factor for the offset/RTT/jitter EMAs.
pub const EMA_ALPHA: f64 = 0.1;

const SAMPLE_RING_CAP: usize = 30;
const GOOD_RING_CAP: usize = 5;
const LOCK_MIN_SAMPLES: u64 = 3;
const LOCK_RTT_MAX_MS: i64 = 300;
const LOCK_JITTER_MAX_MS: i64 = 100;

/// One ping/pong measurement.
///
/// `t0` is the client's send time, `t1` the host's stamp on the reply,
/// `t2` the client's receive time, all in wall milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub seq: u64,
    pub t0: i64,
    pub t1: i64,
    pub t2: i64,
}

impl ClockSample {
    pub fn rtt(&self) -> i64 {
        self.t2 - self.t0
    }

    /// Offset of the host clock relative to ours, assuming a symmetric path.
    pub fn offset_raw(&self) -> i64 {
        self.t1 - (self.t0 + self.t2) / 2
    }
}

/// Why a sample was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RttNegative,
    RttTooHigh,
    OffsetJump,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::RttNegative => "rtt_negative",
            DropReason::RttTooHigh => "rtt_too_high",
            DropReason::OffsetJump => "offset_jump",
        }
    }
}

/// Outcome of feeding one sample to the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Sample accepted. `lock_edge` is set when the lock flag flipped.
    Accepted { lock_edge: Option<bool> },
    /// Sample rejected; estimates untouched.
    Rejected(DropReason),
}

/// NTP-style room clock estimator.
///
/// Room time is defined as `local wall now + offset_ema`. The estimator
/// never steps the local clock; callers read `room_time()` instead.
#[derive(Debug)]
pub struct RoomClock {
    offset_raw: i64,
    offset_ema: i64,
    rtt: i64,
    rtt_ema: f64,
    jitter_ema: f64,
    sample_count: u64,
    seq: u64,
    epoch: u64,
    locked: bool,
    /// All recent samples, accepted or not.
    samples: VecDeque<ClockSample>,
    /// Recent accepted samples, kept for min-RTT selection.
    good: VecDeque<ClockSample>,
    dropped: u64,
    last_drop: Option<DropReason>,
}

impl RoomClock {
    pub fn new() -> Self {
        Self {
            offset_raw: 0,
            offset_ema: 0,
            rtt: 0,
            rtt_ema: 0.0,
            jitter_ema: 0.0,
            sample_count: 0,
            seq: 0,
            epoch: 0,
            locked: false,
            samples: VecDeque::with_capacity(SAMPLE_RING_CAP),
            good: VecDeque::with_capacity(GOOD_RING_CAP),
            dropped: 0,
            last_drop: None,
        }
    }

    /// Ingest one measurement.
    pub fn on_sample(&mut self, sample: ClockSample) -> SampleOutcome {
        if self.samples.len() == SAMPLE_RING_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        let rtt = sample.rtt();
        if rtt < 0 {
            return self.reject(DropReason::RttNegative);
        }
        if rtt > RTT_CAP_MS {
            return self.reject(DropReason::RttTooHigh);
        }
        let offset_raw = sample.offset_raw();
        if self.offset_ema != 0 && (offset_raw - self.offset_ema).abs() > OFFSET_JUMP_CAP_MS {
            return self.reject(DropReason::OffsetJump);
        }

        if self.good.len() == GOOD_RING_CAP {
            self.good.pop_front();
        }
        self.good.push_back(sample);

        self.sample_count += 1;
        self.rtt = rtt;
        self.offset_raw = offset_raw;

        if self.sample_count == 1 {
            self.rtt_ema = rtt as f64;
        } else {
            self.rtt_ema = EMA_ALPHA * rtt as f64 + (1.0 - EMA_ALPHA) * self.rtt_ema;
        }
        self.jitter_ema =
            EMA_ALPHA * (rtt as f64 - self.rtt_ema).abs() + (1.0 - EMA_ALPHA) * self.jitter_ema;

        // Offset follows the lowest-RTT sample of the recent accepted set.
        let best = self
            .good
            .iter()
            .min_by_key(|s| s.rtt())
            .copied()
            .unwrap_or(sample);
        let best_offset = best.offset_raw();
        self.offset_ema = if self.offset_ema == 0 {
            best_offset
        } else {
            (EMA_ALPHA * best_offset as f64 + (1.0 - EMA_ALPHA) * self.offset_ema as f64).round()
                as i64
        };

        let was_locked = self.locked;
        self.locked = self.sample_count >= LOCK_MIN_SAMPLES
            && (self.rtt_ema.round() as i64) <= LOCK_RTT_MAX_MS
            && self.jitter() <= LOCK_JITTER_MAX_MS;
        let lock_edge = (was_locked != self.locked).then_some(self.locked);
        if let Some(locked) = lock_edge {
            log::info!(
                "room clock {} (offset {} ms, rtt {:.0} ms, jitter {} ms)",
                if locked { "locked" } else { "unlocked" },
                self.offset_ema,
                self.rtt_ema,
                self.jitter()
            );
        }

        SampleOutcome::Accepted { lock_edge }
    }

    fn reject(&mut self, reason: DropReason) -> SampleOutcome {
        self.dropped += 1;
        self.last_drop = Some(reason);
        log::debug!("clock sample dropped: {}", reason.as_str());
        SampleOutcome::Rejected(reason)
    }

    /// Map a local wall timestamp to room time.
    pub fn room_time(&self, wall_ms: i64) -> i64 {
        wall_ms + self.offset_ema
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ema
    }

    pub fn rtt_ms(&self) -> i64 {
        self.rtt_ema.round() as i64
    }

    /// Smoothed jitter, rounded to whole milliseconds.
    pub fn jitter(&self) -> i64 {
        self.jitter_ema.round() as i64
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start a new playback epoch. Host side only; resets the seq counter.
    pub fn new_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.seq = 0;
        self.epoch
    }

    /// Next per-epoch sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Clear estimator state. Keeps the epoch/seq counters; crossing an
    /// epoch is always an explicit `new_epoch` call.
    pub fn reset(&mut self, keep_history: bool) {
        self.offset_raw = 0;
        self.offset_ema = 0;
        self.rtt = 0;
        self.rtt_ema = 0.0;
        self.jitter_ema = 0.0;
        self.sample_count = 0;
        self.locked = false;
        self.dropped = 0;
        self.last_drop = None;
        if !keep_history {
            self.samples.clear();
            self.good.clear();
        }
    }

    pub fn snapshot(&self) -> crate::stats::ClockStats {
        crate::stats::ClockStats {
            locked: self.locked,
            offset_ms: self.offset_ema,
            offset_raw_ms: self.offset_raw,
            rtt_ms: self.rtt,
            rtt_ema_ms: self.rtt_ema,
            jitter_ms: self.jitter(),
            sample_count: self.sample_count,
            dropped: self.dropped,
            last_drop: self.last_drop.map(|r| r.as_str()),
            epoch: self.epoch,
        }
    }
}

impl Default for RoomClock {
    fn default() -> Self {
        Self::new()
    }
}
