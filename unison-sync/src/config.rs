//! Engine configuration.
//!
//! All tunables live here with their defaults; the iOS-safe profile is a
//! constructor on `KeepSyncConfig` rather than inline platform checks.

use serde::{Deserialize, Serialize};

/// Target platform for the playback path. The choice only selects a
/// KeepSync profile; nothing downstream branches on the platform itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Desktop,
    Ios,
}

/// KeepSync controller tunables.
#[derive(Debug, Clone)]
pub struct KeepSyncConfig {
    /// No action while |predicted delta| stays inside this band (ms).
    pub deadband_ms: i64,
    /// |delta| above this is corrected by seeking, not rate nudging (ms).
    pub seek_threshold_ms: i64,
    /// Minimum spacing between seeks (ms, wall clock).
    pub seek_cooldown_ms: i64,
    /// No speed changes this soon after a seek (ms, wall clock).
    pub speed_cooldown_after_seek_ms: i64,
    /// Minimum spacing between speed changes (ms, wall clock).
    pub speed_interval_ms: i64,
    /// Reverse guard fires when the delta sign flips below this magnitude (ms).
    pub reverse_guard_threshold_ms: i64,
    /// Hold duration pinned at speed 1.0 after a reverse-guard trip (ms).
    pub reverse_guard_hold_ms: i64,
    /// Window the delta is projected over when predicting (ms).
    pub prediction_window_ms: i64,
    /// Proportional gain mapping predicted delta (ms) to a speed delta.
    pub gain: f64,
    /// EMA factor for the speed target.
    pub speed_alpha: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    /// Largest per-decision change of the commanded speed.
    pub max_step: f64,
    /// Commanded changes smaller than this are not worth a decoder call.
    pub min_emit_step: f64,
    /// Jitter above this halves the EMA factor (ms).
    pub high_jitter_ms: i64,
    /// RTT above this halves the EMA factor (ms).
    pub high_rtt_ms: i64,
    /// Host state older than this is dropped as stale (ms, room clock).
    pub stale_threshold_ms: i64,
    /// When false the speed path is off entirely and only seeks correct
    /// drift. Audio stacks without usable rate control (iOS) set this.
    pub set_speed_enabled: bool,
}

impl Default for KeepSyncConfig {
    fn default() -> Self {
        Self {
            deadband_ms: 30,
            seek_threshold_ms: 1_000,
            seek_cooldown_ms: 1_500,
            speed_cooldown_after_seek_ms: 500,
            speed_interval_ms: 400,
            reverse_guard_threshold_ms: 120,
            reverse_guard_hold_ms: 800,
            prediction_window_ms: 500,
            gain: 2e-4,
            speed_alpha: 0.2,
            min_speed: 0.96,
            max_speed: 1.04,
            max_step: 0.005,
            min_emit_step: 0.002,
            high_jitter_ms: 40,
            high_rtt_ms: 120,
            stale_threshold_ms: 1_200,
            set_speed_enabled: true,
        }
    }
}

impl KeepSyncConfig {
    /// Profile for audio stacks that handle rate changes poorly: the
    /// speed path is off (seeks do all the correcting), and the speed
    /// tunables are narrowed anyway for anything that reads them.
    pub fn ios_safe() -> Self {
        Self {
            deadband_ms: 40,
            seek_cooldown_ms: 2_000,
            speed_interval_ms: 800,
            gain: 1e-4,
            min_speed: 0.98,
            max_speed: 1.02,
            max_step: 0.003,
            set_speed_enabled: false,
            ..Self::default()
        }
    }
}

/// Calibration constants, persisted by the app layer.
///
/// `calibration_offset_ms` is the user-tunable trim; `latency_comp_ms`
/// models the output-path delay. Values are clamped on construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Calibration {
    calibration_offset_ms: i64,
    latency_comp_ms: i64,
}

impl Calibration {
    pub const OFFSET_RANGE_MS: (i64, i64) = (-300, 300);
    pub const LATENCY_RANGE_MS: (i64, i64) = (0, 500);

    pub fn new(calibration_offset_ms: i64, latency_comp_ms: i64) -> Self {
        Self {
            calibration_offset_ms: calibration_offset_ms
                .clamp(Self::OFFSET_RANGE_MS.0, Self::OFFSET_RANGE_MS.1),
            latency_comp_ms: latency_comp_ms
                .clamp(Self::LATENCY_RANGE_MS.0, Self::LATENCY_RANGE_MS.1),
        }
    }

    pub fn calibration_offset_ms(&self) -> i64 {
        self.calibration_offset_ms
    }

    pub fn latency_comp_ms(&self) -> i64 {
        self.latency_comp_ms
    }

    /// The compensation applied to every target-position computation.
    pub fn total_compensation_ms(&self) -> i64 {
        self.calibration_offset_ms + self.latency_comp_ms
    }

    /// Re-clamp after deserializing from disk.
    pub fn sanitized(self) -> Self {
        Self::new(self.calibration_offset_ms, self.latency_comp_ms)
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// Engine-level timing configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Host state broadcast period while playing (ms).
    pub host_state_period_ms: i64,
    /// How far in the future the host schedules a coordinated start (ms).
    pub start_lead_ms: i64,
    /// Catch-up prepare window: seek target is predicted this far ahead (ms).
    pub prepare_lead_ms: i64,
    /// Minimum spacing between catch-up attempts (ms, wall clock).
    pub catchup_min_spacing_ms: i64,
    /// Ignore host state for this long after issuing a seek (ms, wall clock).
    pub seek_echo_window_ms: i64,
    /// ...or until the decoder reports a position this close to the seek target (ms).
    pub seek_echo_tolerance_ms: i64,
    pub keepsync: KeepSyncConfig,
    pub platform: Platform,
    pub calibration: Calibration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host_state_period_ms: 200,
            start_lead_ms: 1_500,
            prepare_lead_ms: 300,
            catchup_min_spacing_ms: 1_500,
            seek_echo_window_ms: 800,
            seek_echo_tolerance_ms: 300,
            keepsync: KeepSyncConfig::default(),
            platform: Platform::Desktop,
            calibration: Calibration::default(),
        }
    }
}

impl SyncConfig {
    pub fn for_platform(platform: Platform) -> Self {
        let keepsync = match platform {
            Platform::Desktop => KeepSyncConfig::default(),
            Platform::Ios => KeepSyncConfig::ios_safe(),
        };
        Self {
            keepsync,
            platform,
            ..Self::default()
        }
    }
}
