//! Sync metrics and protection mode.
//!
//! Every KeepSync decision is appended as a sample; windowed statistics
//! over the ring feed the status surface and the protection triggers.
//! Protection mode is not an error state — it narrows the allowed actions
//! until the instability that tripped it has had time to settle.

use std::collections::VecDeque;

use crate::keepsync::DecisionReason;

/// Ring capacity in samples.
const RING_CAP: usize = 600;
/// Ring span in room-time ms.
const RING_SPAN_MS: i64 = 120_000;

/// Short statistics window (ms).
pub const SHORT_WINDOW_MS: i64 = 30_000;
/// Long statistics window (ms).
pub const LONG_WINDOW_MS: i64 = 120_000;
/// |delta| at or below this counts as aligned (ms).
pub const ALIGNED_MS: i64 = 30;

/// Protection entry: short-window p95 above this (ms)...
const P95_LIMIT_MS: i64 = 60;
/// ...sustained for this long (ms).
const P95_SUSTAIN_MS: i64 = 10_000;
/// Protection entry: more seeks than this...
const SEEK_LIMIT: u64 = 3;
/// ...within this window (ms).
const SEEK_WINDOW_MS: i64 = 60_000;
/// Protection entry: consecutive stale drops.
const STALE_STREAK_LIMIT: u32 = 5;
/// Protection persists for this long once entered (ms).
pub const PROTECTION_DURATION_MS: i64 = 10_000;
/// Speed commands accepted in protection are clamped to this range.
pub const PROTECTION_SPEED_RANGE: (f64, f64) = (0.985, 1.015);
/// Seeks below this |delta| are suppressed in protection (ms).
pub const PROTECTION_MIN_SEEK_DELTA_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleAction {
    Noop,
    SetSpeed,
    Seek,
}

/// One recorded decision.
#[derive(Debug, Clone)]
pub struct SyncSample {
    pub ts_room_ms: i64,
    pub delta_ms: i64,
    pub audible_pos_ms: i64,
    pub target_pos_ms: i64,
    pub rtt_ms: i64,
    pub jitter_ms: i64,
    pub speed: f64,
    pub action: SampleAction,
    pub reason: DecisionReason,
}

/// Aggregates over one window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub mean_delta_ms: f64,
    pub stdev_delta_ms: f64,
    pub p50_abs_delta_ms: i64,
    pub p95_abs_delta_ms: i64,
    pub p99_abs_delta_ms: i64,
    /// Fraction of samples with |delta| ≤ 30 ms.
    pub aligned_fraction: f64,
    pub seeks: u64,
    pub speed_sets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionTrigger {
    P95Sustained,
    SeekTooFrequent,
    StaleStreak,
}

impl ProtectionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionTrigger::P95Sustained => "p95Sustained",
            ProtectionTrigger::SeekTooFrequent => "seekTooFrequent",
            ProtectionTrigger::StaleStreak => "staleStreak",
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    ring: VecDeque<SyncSample>,
    stale_streak: u32,
    p95_high_since: Option<i64>,
    protection_entered_at: Option<i64>,
    protection_trigger: Option<ProtectionTrigger>,
    /// Seeks before this timestamp no longer count toward re-entry.
    seek_floor_ms: i64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one decision sample and re-evaluate protection.
    pub fn record(&mut self, sample: SyncSample) {
        if sample.reason == DecisionReason::StaleHostState {
            self.stale_streak += 1;
        } else {
            self.stale_streak = 0;
        }

        let now = sample.ts_room_ms;
        self.ring.push_back(sample);
        while self.ring.len() > RING_CAP {
            self.ring.pop_front();
        }
        while self
            .ring
            .front()
            .is_some_and(|s| now - s.ts_room_ms > RING_SPAN_MS)
        {
            self.ring.pop_front();
        }

        self.evaluate(now);
    }

    /// Re-check protection entry/exit at `now_room_ms`. Also called from
    /// the engine tick so exit does not wait for the next sample.
    pub fn evaluate(&mut self, now_room_ms: i64) {
        if let Some(entered) = self.protection_entered_at {
            if now_room_ms - entered < PROTECTION_DURATION_MS {
                return;
            }
            log::info!("protection mode exit after {} ms", now_room_ms - entered);
            self.protection_entered_at = None;
            self.protection_trigger = None;
            // Re-entry needs fresh evidence, not the history that tripped
            // the mode in the first place.
            self.stale_streak = 0;
            self.p95_high_since = None;
            self.seek_floor_ms = now_room_ms;
        }

        // Keep the sustained-p95 tracker current even while checking the
        // cheaper triggers first.
        let p95 = self.stats(SHORT_WINDOW_MS, now_room_ms).p95_abs_delta_ms;
        if p95 > P95_LIMIT_MS {
            self.p95_high_since.get_or_insert(now_room_ms);
        } else {
            self.p95_high_since = None;
        }

        let trigger = if self.recent_seeks(now_room_ms) > SEEK_LIMIT {
            Some(ProtectionTrigger::SeekTooFrequent)
        } else if self.stale_streak >= STALE_STREAK_LIMIT {
            Some(ProtectionTrigger::StaleStreak)
        } else if self
            .p95_high_since
            .is_some_and(|since| now_room_ms - since >= P95_SUSTAIN_MS)
        {
            Some(ProtectionTrigger::P95Sustained)
        } else {
            None
        };

        if let Some(trigger) = trigger {
            self.protection_entered_at = Some(now_room_ms);
            self.protection_trigger = Some(trigger);
            log::warn!("protection mode entry: {}", trigger.as_str());
        }
    }

    fn recent_seeks(&self, now_room_ms: i64) -> u64 {
        self.ring
            .iter()
            .filter(|s| {
                s.ts_room_ms >= self.seek_floor_ms
                    && now_room_ms - s.ts_room_ms <= SEEK_WINDOW_MS
            })
            .filter(|s| s.action == SampleAction::Seek)
            .count() as u64
    }

    pub fn protection_active(&self) -> bool {
        self.protection_entered_at.is_some()
    }

    pub fn protection_trigger(&self) -> Option<ProtectionTrigger> {
        self.protection_trigger
    }

    pub fn stale_streak(&self) -> u32 {
        self.stale_streak
    }

    /// Clamp an accepted speed command to the protection envelope.
    pub fn clamp_protected_speed(rate: f64) -> f64 {
        rate.clamp(PROTECTION_SPEED_RANGE.0, PROTECTION_SPEED_RANGE.1)
    }

    /// Whether a seek of this delta is suppressed under protection.
    pub fn seek_suppressed(&self, delta_ms: i64) -> bool {
        self.protection_active() && delta_ms.abs() < PROTECTION_MIN_SEEK_DELTA_MS
    }

    /// Windowed statistics over the trailing `window_ms`.
    pub fn stats(&self, window_ms: i64, now_room_ms: i64) -> WindowStats {
        let samples: Vec<&SyncSample> = self
            .ring
            .iter()
            .filter(|s| now_room_ms - s.ts_room_ms <= window_ms)
            .collect();
        let count = samples.len();
        if count == 0 {
            return WindowStats::default();
        }

        let mean = samples.iter().map(|s| s.delta_ms as f64).sum::<f64>() / count as f64;
        let variance = samples
            .iter()
            .map(|s| {
                let d = s.delta_ms as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / count as f64;

        let mut abs: Vec<i64> = samples.iter().map(|s| s.delta_ms.abs()).collect();
        abs.sort_unstable();
        let percentile = |q: f64| -> i64 {
            let rank = ((q * count as f64).ceil() as usize).clamp(1, count);
            abs[rank - 1]
        };

        let aligned = abs.iter().filter(|d| **d <= ALIGNED_MS).count();

        WindowStats {
            count,
            mean_delta_ms: mean,
            stdev_delta_ms: variance.sqrt(),
            p50_abs_delta_ms: percentile(0.50),
            p95_abs_delta_ms: percentile(0.95),
            p99_abs_delta_ms: percentile(0.99),
            aligned_fraction: aligned as f64 / count as f64,
            seeks: samples
                .iter()
                .filter(|s| s.action == SampleAction::Seek)
                .count() as u64,
            speed_sets: samples
                .iter()
                .filter(|s| s.action == SampleAction::SetSpeed)
                .count() as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn reset(&mut self) {
        self.ring.clear();
        self.stale_streak = 0;
        self.p95_high_since = None;
        self.protection_entered_at = None;
        self.protection_trigger = None;
    }
}
