//! KeepSync controller.
//!
//! Pure decision function: each `host_state` received during playback is
//! turned into exactly one of {noop, set_speed, seek}. Rate nudging is
//! bounded and heavily rate-limited; seeks handle everything the speed
//! envelope cannot. The reverse guard pins the rate back to 1.0 when the
//! delta sign flips at small magnitude, which is the signature of the
//! controller chasing its own corrections.
//!
//! Pacing state (commanded speed, EMA, cooldown stamps, counters) is
//! staged by `decide` and only applied by `commit_last` once the decoder
//! accepted the action. A decoder that refuses a seek or rate change
//! leaves the controller's model untouched, so the next decision is
//! computed against what the decoder is actually doing.
//!
//! Cool-downs and intervals are measured on the local wall clock; room
//! time is only used for position math.

use crate::config::KeepSyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    NotPlaying,
    ClockNotLocked,
    StaleHostState,
    Hold,
    ReturnToNormal,
    WithinDeadband,
    SeekCooldown,
    SeekThreshold,
    SpeedCooldownAfterSeek,
    SpeedInterval,
    ReverseGuard,
    SpeedChangeTooSmall,
    SpeedAdjust,
    SpeedDisabled,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::NotPlaying => "not_playing",
            DecisionReason::ClockNotLocked => "clock_not_locked",
            DecisionReason::StaleHostState => "stale_host_state",
            DecisionReason::Hold => "hold",
            DecisionReason::ReturnToNormal => "return_to_normal",
            DecisionReason::WithinDeadband => "within_deadband",
            DecisionReason::SeekCooldown => "seek_cooldown",
            DecisionReason::SeekThreshold => "seek_threshold",
            DecisionReason::SpeedCooldownAfterSeek => "speed_cooldown_after_seek",
            DecisionReason::SpeedInterval => "speed_interval",
            DecisionReason::ReverseGuard => "reverse_guard",
            DecisionReason::SpeedChangeTooSmall => "speed_change_too_small",
            DecisionReason::SpeedAdjust => "speed_adjust",
            DecisionReason::SpeedDisabled => "speed_disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecisionAction {
    Noop,
    SetSpeed(f64),
    Seek(i64),
}

/// One KeepSync verdict, with the derived values that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub action: DecisionAction,
    pub reason: DecisionReason,
    pub delta_ms: i64,
    pub predicted_delta_ms: i64,
    pub target_pos_ms: i64,
}

impl Decision {
    fn noop(reason: DecisionReason) -> Self {
        Self {
            action: DecisionAction::Noop,
            reason,
            delta_ms: 0,
            predicted_delta_ms: 0,
            target_pos_ms: 0,
        }
    }

    fn with_derived(mut self, delta: i64, predicted: i64, target: i64) -> Self {
        self.delta_ms = delta;
        self.predicted_delta_ms = predicted;
        self.target_pos_ms = target;
        self
    }
}

/// Inputs for one decision, sampled by the facade at receipt time.
#[derive(Debug, Clone, Copy)]
pub struct KeepSyncInput<'a> {
    pub is_playing: bool,
    pub epoch: u64,
    pub track_id: &'a str,
    pub host_pos_ms: i64,
    pub sampled_at_room_ms: i64,
    pub room_now_ms: i64,
    pub client_pos_ms: i64,
    pub duration_ms: i64,
    pub latency_comp_ms: i64,
    pub clock_locked: bool,
    pub jitter_ms: i64,
    pub rtt_ms: i64,
}

/// Diagnostic counters, cumulative for the engine's lifetime. Only
/// committed (decoder-accepted) actions count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepSyncCounters {
    pub seeks: u64,
    pub speed_sets: u64,
    pub dropped_host_states: u64,
}

/// Staged pacing effect of the last emitted decision.
#[derive(Debug, Clone, Copy)]
enum PendingCommit {
    Seek,
    Speed {
        rate: f64,
        ema: f64,
        sign: Option<i8>,
        hold_until_wall: Option<i64>,
    },
}

#[derive(Debug)]
pub struct KeepSync {
    cfg: KeepSyncConfig,
    current_speed: f64,
    speed_ema: f64,
    last_speed_set_at_wall: Option<i64>,
    last_seek_at_wall: Option<i64>,
    active_epoch: Option<u64>,
    active_track: Option<String>,
    last_delta_sign: i8,
    hold_until_wall: i64,
    pending: Option<PendingCommit>,
    counters: KeepSyncCounters,
    last_dropped_reason: Option<DecisionReason>,
}

impl KeepSync {
    pub fn new(cfg: KeepSyncConfig) -> Self {
        Self {
            cfg,
            current_speed: 1.0,
            speed_ema: 1.0,
            last_speed_set_at_wall: None,
            last_seek_at_wall: None,
            active_epoch: None,
            active_track: None,
            last_delta_sign: 0,
            hold_until_wall: 0,
            pending: None,
            counters: KeepSyncCounters::default(),
            last_dropped_reason: None,
        }
    }

    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }

    pub fn counters(&self) -> KeepSyncCounters {
        self.counters
    }

    pub fn last_dropped_reason(&self) -> Option<DecisionReason> {
        self.last_dropped_reason
    }

    pub fn config(&self) -> &KeepSyncConfig {
        &self.cfg
    }

    /// Evaluate one host state. `wall_now_ms` is the local wall clock.
    ///
    /// An emitted `set_speed`/`seek` takes effect on this controller only
    /// through `commit_last`; a decision that is never committed (decoder
    /// failure, facade suppression) leaves all pacing state as it was.
    pub fn decide(&mut self, input: KeepSyncInput<'_>, wall_now_ms: i64) -> Decision {
        self.pending = None;

        // Epoch or track change invalidates all pacing state.
        let epoch_changed = self.active_epoch.is_some_and(|e| e != input.epoch);
        let track_changed = self
            .active_track
            .as_deref()
            .is_some_and(|t| t != input.track_id);
        if epoch_changed || track_changed {
            self.reset_pacing();
        }
        self.active_epoch = Some(input.epoch);
        if self.active_track.as_deref() != Some(input.track_id) {
            self.active_track = Some(input.track_id.to_owned());
        }

        if !input.is_playing {
            return self.drop(DecisionReason::NotPlaying, false);
        }
        if !input.clock_locked {
            return self.drop(DecisionReason::ClockNotLocked, false);
        }
        let elapsed = input.room_now_ms - input.sampled_at_room_ms;
        if elapsed > self.cfg.stale_threshold_ms {
            return self.drop(DecisionReason::StaleHostState, true);
        }

        let target_pos =
            (input.host_pos_ms + elapsed - input.latency_comp_ms).clamp(0, input.duration_ms);
        let delta = target_pos - input.client_pos_ms;
        let predicted = (delta as f64
            + (self.current_speed - 1.0) * self.cfg.prediction_window_ms as f64)
            .round() as i64;
        let derived = |d: Decision| d.with_derived(delta, predicted, target_pos);

        // 1. Hold: speed stays pinned to 1.0 until the hold expires.
        if wall_now_ms < self.hold_until_wall {
            if self.current_speed != 1.0 {
                return derived(self.emit_speed(1.0, self.speed_ema, None, None, DecisionReason::Hold));
            }
            return derived(Decision::noop(DecisionReason::Hold));
        }

        // 2. Dead-band: nothing to correct.
        if predicted.abs() <= self.cfg.deadband_ms {
            if self.current_speed != 1.0 && self.speed_interval_elapsed(wall_now_ms) {
                return derived(self.emit_speed(
                    1.0,
                    self.speed_ema,
                    None,
                    None,
                    DecisionReason::ReturnToNormal,
                ));
            }
            return derived(Decision::noop(DecisionReason::WithinDeadband));
        }

        // 3. Large delta: seek, unless one just happened.
        if delta.abs() > self.cfg.seek_threshold_ms {
            if self
                .last_seek_at_wall
                .is_some_and(|at| wall_now_ms - at < self.cfg.seek_cooldown_ms)
            {
                return derived(Decision::noop(DecisionReason::SeekCooldown));
            }
            self.pending = Some(PendingCommit::Seek);
            return derived(Decision {
                action: DecisionAction::Seek(target_pos),
                reason: DecisionReason::SeekThreshold,
                delta_ms: 0,
                predicted_delta_ms: 0,
                target_pos_ms: 0,
            });
        }

        // 4. Speed region. Profiles without usable rate control rely on
        // the seek path alone.
        if !self.cfg.set_speed_enabled {
            return derived(Decision::noop(DecisionReason::SpeedDisabled));
        }

        if self
            .last_seek_at_wall
            .is_some_and(|at| wall_now_ms - at < self.cfg.speed_cooldown_after_seek_ms)
        {
            return derived(Decision::noop(DecisionReason::SpeedCooldownAfterSeek));
        }

        // Reverse guard runs ahead of the interval check so a sign flip is
        // damped immediately even mid-interval.
        let sign = delta.signum() as i8;
        if self.last_delta_sign != 0
            && sign != 0
            && sign != self.last_delta_sign
            && delta.abs() < self.cfg.reverse_guard_threshold_ms
        {
            return derived(self.emit_speed(
                1.0,
                1.0,
                Some(sign),
                Some(wall_now_ms + self.cfg.reverse_guard_hold_ms),
                DecisionReason::ReverseGuard,
            ));
        }

        if !self.speed_interval_elapsed(wall_now_ms) {
            return derived(Decision::noop(DecisionReason::SpeedInterval));
        }

        let speed_delta = (predicted as f64 * self.cfg.gain)
            .clamp(self.cfg.min_speed - 1.0, self.cfg.max_speed - 1.0);
        let speed_target = 1.0 + speed_delta;
        let mut alpha = self.cfg.speed_alpha;
        if input.jitter_ms > self.cfg.high_jitter_ms || input.rtt_ms > self.cfg.high_rtt_ms {
            alpha /= 2.0;
        }
        let new_ema = ((1.0 - alpha) * self.speed_ema + alpha * speed_target)
            .clamp(self.cfg.min_speed, self.cfg.max_speed);
        let speed_cmd = new_ema.clamp(
            self.current_speed - self.cfg.max_step,
            self.current_speed + self.cfg.max_step,
        );

        if (speed_cmd - self.current_speed).abs() < self.cfg.min_emit_step {
            // No decoder call happens for this decision, so the filter
            // state can advance right here.
            self.speed_ema = new_ema;
            if sign != 0 {
                self.last_delta_sign = sign;
            }
            return derived(Decision::noop(DecisionReason::SpeedChangeTooSmall));
        }
        derived(self.emit_speed(
            speed_cmd,
            new_ema,
            (sign != 0).then_some(sign),
            None,
            DecisionReason::SpeedAdjust,
        ))
    }

    /// Apply the pacing effects of the last emitted decision, after the
    /// decoder accepted it. `applied_rate` is the rate actually sent when
    /// the facade narrowed the command (protection mode). Skipping this
    /// call on failure is the whole rollback story: nothing was touched.
    pub fn commit_last(&mut self, wall_now_ms: i64, applied_rate: Option<f64>) {
        match self.pending.take() {
            Some(PendingCommit::Seek) => {
                self.current_speed = 1.0;
                self.speed_ema = 1.0;
                self.last_delta_sign = 0;
                self.hold_until_wall = 0;
                self.last_seek_at_wall = Some(wall_now_ms);
                self.counters.seeks += 1;
            }
            Some(PendingCommit::Speed {
                rate,
                ema,
                sign,
                hold_until_wall,
            }) => {
                self.current_speed = applied_rate.unwrap_or(rate);
                self.speed_ema = ema;
                if let Some(sign) = sign {
                    self.last_delta_sign = sign;
                }
                if let Some(hold) = hold_until_wall {
                    self.hold_until_wall = hold;
                }
                self.last_speed_set_at_wall = Some(wall_now_ms);
                self.counters.speed_sets += 1;
            }
            None => {}
        }
    }

    fn emit_speed(
        &mut self,
        rate: f64,
        ema: f64,
        sign: Option<i8>,
        hold_until_wall: Option<i64>,
        reason: DecisionReason,
    ) -> Decision {
        self.pending = Some(PendingCommit::Speed {
            rate,
            ema,
            sign,
            hold_until_wall,
        });
        Decision {
            action: DecisionAction::SetSpeed(rate),
            reason,
            delta_ms: 0,
            predicted_delta_ms: 0,
            target_pos_ms: 0,
        }
    }

    fn speed_interval_elapsed(&self, wall_now_ms: i64) -> bool {
        self.last_speed_set_at_wall
            .map_or(true, |at| wall_now_ms - at >= self.cfg.speed_interval_ms)
    }

    fn drop(&mut self, reason: DecisionReason, stale: bool) -> Decision {
        if stale {
            self.counters.dropped_host_states += 1;
        }
        self.last_dropped_reason = Some(reason);
        Decision::noop(reason)
    }

    fn reset_pacing(&mut self) {
        self.current_speed = 1.0;
        self.speed_ema = 1.0;
        self.last_speed_set_at_wall = None;
        self.last_seek_at_wall = None;
        self.last_delta_sign = 0;
        self.hold_until_wall = 0;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(delta: i64) -> KeepSyncInput<'static> {
        // Client at 10_000 ms; host sampled `delta` ahead, no elapsed time,
        // no compensation, so targetPos - clientPos == delta exactly.
        KeepSyncInput {
            is_playing: true,
            epoch: 1,
            track_id: "t1",
            host_pos_ms: 10_000 + delta,
            sampled_at_room_ms: 50_000,
            room_now_ms: 50_000,
            client_pos_ms: 10_000,
            duration_ms: 300_000,
            latency_comp_ms: 0,
            clock_locked: true,
            jitter_ms: 5,
            rtt_ms: 20,
        }
    }

    fn keepsync() -> KeepSync {
        KeepSync::new(KeepSyncConfig::default())
    }

    /// Decide and, like the facade does on decoder success, commit.
    fn decide_ok(ks: &mut KeepSync, input: KeepSyncInput<'_>, wall: i64) -> Decision {
        let d = ks.decide(input, wall);
        match d.action {
            DecisionAction::SetSpeed(rate) => ks.commit_last(wall, Some(rate)),
            DecisionAction::Seek(_) => ks.commit_last(wall, None),
            DecisionAction::Noop => {}
        }
        d
    }

    #[test]
    fn drops_when_not_playing() {
        let mut ks = keepsync();
        let mut inp = input(0);
        inp.is_playing = false;
        let d = ks.decide(inp, 1_000);
        assert_eq!(d.action, DecisionAction::Noop);
        assert_eq!(d.reason, DecisionReason::NotPlaying);
    }

    #[test]
    fn drops_when_clock_unlocked() {
        let mut ks = keepsync();
        let mut inp = input(500);
        inp.clock_locked = false;
        assert_eq!(
            ks.decide(inp, 1_000).reason,
            DecisionReason::ClockNotLocked
        );
    }

    #[test]
    fn drops_stale_host_state_and_counts_it() {
        let mut ks = keepsync();
        let mut inp = input(500);
        inp.room_now_ms = inp.sampled_at_room_ms + 1_300;
        let d = ks.decide(inp, 1_000);
        assert_eq!(d.reason, DecisionReason::StaleHostState);
        assert_eq!(ks.counters().dropped_host_states, 1);
        assert_eq!(
            ks.last_dropped_reason(),
            Some(DecisionReason::StaleHostState)
        );
    }

    #[test]
    fn deadband_stream_is_all_noop() {
        // Scenario: predicted deltas {-20, 5, 10, -8, 15} at speed 1.0.
        let mut ks = keepsync();
        for (i, delta) in [-20, 5, 10, -8, 15].into_iter().enumerate() {
            let d = ks.decide(input(delta), 1_000 + i as i64 * 200);
            assert_eq!(d.action, DecisionAction::Noop, "delta {delta}");
            assert_eq!(d.reason, DecisionReason::WithinDeadband, "delta {delta}");
        }
        assert_eq!(ks.counters().speed_sets, 0);
        assert_eq!(ks.current_speed(), 1.0);
    }

    #[test]
    fn deadband_returns_speed_to_normal() {
        let mut ks = keepsync();
        // Build up a non-unit speed.
        let d = decide_ok(&mut ks, input(400), 1_000);
        assert!(matches!(d.action, DecisionAction::SetSpeed(_)));
        assert!(ks.current_speed() > 1.0);
        // Back inside the dead-band after the interval: reset to 1.0.
        let d = decide_ok(&mut ks, input(0), 1_000 + 500);
        assert_eq!(d.action, DecisionAction::SetSpeed(1.0));
        assert_eq!(d.reason, DecisionReason::ReturnToNormal);
        // And stays quiet afterwards.
        let d = decide_ok(&mut ks, input(0), 1_000 + 1_000);
        assert_eq!(d.reason, DecisionReason::WithinDeadband);
    }

    #[test]
    fn large_delta_seeks_and_resets_speed_state() {
        // Scenario: delta +2500 with no cooldown.
        let mut ks = keepsync();
        decide_ok(&mut ks, input(400), 1_000); // non-unit speed first
        let d = decide_ok(&mut ks, input(2_500), 2_000);
        match d.action {
            DecisionAction::Seek(target) => assert_eq!(target, 12_500),
            other => panic!("expected seek, got {other:?}"),
        }
        assert_eq!(d.reason, DecisionReason::SeekThreshold);
        assert_eq!(ks.current_speed(), 1.0);
        assert_eq!(ks.counters().seeks, 1);

        // Within 500 ms of the seek, the speed path stays quiet.
        let d = decide_ok(&mut ks, input(400), 2_400);
        assert_eq!(d.reason, DecisionReason::SpeedCooldownAfterSeek);
    }

    #[test]
    fn seek_cooldown_blocks_consecutive_seeks() {
        let mut ks = keepsync();
        assert!(matches!(
            decide_ok(&mut ks, input(2_500), 1_000).action,
            DecisionAction::Seek(_)
        ));
        let d = decide_ok(&mut ks, input(2_500), 2_000);
        assert_eq!(d.action, DecisionAction::Noop);
        assert_eq!(d.reason, DecisionReason::SeekCooldown);
        // After the cooldown, seeking resumes.
        assert!(matches!(
            decide_ok(&mut ks, input(2_500), 2_600).action,
            DecisionAction::Seek(_)
        ));
    }

    #[test]
    fn reverse_guard_holds_at_unit_speed() {
        // Scenario: +80 then -70 inside the speed interval.
        let mut ks = keepsync();
        let d = decide_ok(&mut ks, input(80), 1_000);
        assert!(matches!(d.action, DecisionAction::SetSpeed(r) if r > 1.0));

        let d = decide_ok(&mut ks, input(-70), 1_200);
        assert_eq!(d.action, DecisionAction::SetSpeed(1.0));
        assert_eq!(d.reason, DecisionReason::ReverseGuard);

        // The next 800 ms of decisions are held.
        for at in [1_300, 1_600, 1_900] {
            let d = decide_ok(&mut ks, input(-70), at);
            assert_eq!(d.action, DecisionAction::Noop, "at {at}");
            assert_eq!(d.reason, DecisionReason::Hold, "at {at}");
        }
        // Hold expired: the controller may act again.
        let d = decide_ok(&mut ks, input(-70), 2_000);
        assert_ne!(d.reason, DecisionReason::Hold);
    }

    #[test]
    fn reverse_guard_ignores_large_flips() {
        let mut ks = keepsync();
        decide_ok(&mut ks, input(400), 1_000);
        // Sign flips but |delta| is beyond the guard threshold: the
        // interval check applies instead.
        let d = decide_ok(&mut ks, input(-400), 1_200);
        assert_eq!(d.reason, DecisionReason::SpeedInterval);
    }

    #[test]
    fn speed_interval_limits_emission_rate() {
        let mut ks = keepsync();
        assert!(matches!(
            decide_ok(&mut ks, input(400), 1_000).action,
            DecisionAction::SetSpeed(_)
        ));
        assert_eq!(
            decide_ok(&mut ks, input(420), 1_200).reason,
            DecisionReason::SpeedInterval
        );
        assert!(matches!(
            decide_ok(&mut ks, input(440), 1_400).action,
            DecisionAction::SetSpeed(_)
        ));
    }

    #[test]
    fn speed_stays_inside_the_envelope() {
        let mut ks = keepsync();
        let cfg = KeepSyncConfig::default();
        let mut at = 1_000;
        for _ in 0..100 {
            let d = decide_ok(&mut ks, input(900), at);
            if let DecisionAction::SetSpeed(r) = d.action {
                assert!(r >= cfg.min_speed && r <= cfg.max_speed, "rate {r}");
            }
            assert!(ks.current_speed() >= cfg.min_speed);
            assert!(ks.current_speed() <= cfg.max_speed);
            at += cfg.speed_interval_ms;
        }
        // Sustained +900 ms lag pushes the rate to the ceiling.
        assert!((ks.current_speed() - cfg.max_speed).abs() < 1e-9);
    }

    #[test]
    fn per_step_change_is_rate_limited() {
        let mut ks = keepsync();
        let cfg = KeepSyncConfig::default();
        let mut prev = 1.0;
        let mut at = 1_000;
        for _ in 0..20 {
            let d = decide_ok(&mut ks, input(900), at);
            if let DecisionAction::SetSpeed(r) = d.action {
                assert!((r - prev).abs() <= cfg.max_step + 1e-12);
                prev = r;
            }
            at += cfg.speed_interval_ms;
        }
    }

    #[test]
    fn tiny_speed_changes_are_suppressed() {
        let mut ks = keepsync();
        // 31 ms predicted delta: outside the dead-band, but the EMA step is
        // far below the emission floor.
        let d = ks.decide(input(31), 1_000);
        assert_eq!(d.action, DecisionAction::Noop);
        assert_eq!(d.reason, DecisionReason::SpeedChangeTooSmall);
    }

    #[test]
    fn high_jitter_halves_the_alpha() {
        let mut calm = keepsync();
        let mut noisy = keepsync();
        let calm_d = decide_ok(&mut calm, input(600), 1_000);
        let mut inp = input(600);
        inp.jitter_ms = 90;
        let noisy_d = decide_ok(&mut noisy, inp, 1_000);
        match (calm_d.action, noisy_d.action) {
            (DecisionAction::SetSpeed(a), DecisionAction::SetSpeed(b)) => {
                assert!(a > b, "noisy link should nudge more gently ({a} vs {b})");
            }
            other => panic!("expected two speed sets, got {other:?}"),
        }
    }

    #[test]
    fn epoch_change_resets_pacing() {
        let mut ks = keepsync();
        decide_ok(&mut ks, input(400), 1_000);
        assert!(ks.current_speed() > 1.0);
        let mut inp = input(0);
        inp.epoch = 2;
        let d = decide_ok(&mut ks, inp, 1_100);
        // New epoch: speed state is fresh, so the dead-band sample is a
        // plain noop rather than a return-to-normal.
        assert_eq!(d.reason, DecisionReason::WithinDeadband);
        assert_eq!(ks.current_speed(), 1.0);
    }

    #[test]
    fn prediction_accounts_for_current_speed() {
        let mut ks = keepsync();
        // Speed up first.
        decide_ok(&mut ks, input(400), 1_000);
        let speed = ks.current_speed();
        assert!(speed > 1.0);
        // With a positive correction outstanding, a negative delta is
        // projected closer to zero over the prediction window.
        let d = ks.decide(input(-60), 1_200);
        let expected = (-60.0 + (speed - 1.0) * 500.0).round() as i64;
        assert_eq!(d.delta_ms, -60);
        assert_eq!(d.predicted_delta_ms, expected);
        assert!(d.predicted_delta_ms > d.delta_ms);
    }

    #[test]
    fn uncommitted_speed_leaves_state_untouched() {
        // A decoder that rejects set_speed must not move the controller's
        // model of the rate, the EMA, or the counters.
        let mut ks = keepsync();
        let d = ks.decide(input(400), 1_000);
        assert!(matches!(d.action, DecisionAction::SetSpeed(r) if r > 1.0));
        // No commit: the set_speed failed at the decoder.
        assert_eq!(ks.current_speed(), 1.0);
        assert_eq!(ks.counters().speed_sets, 0);

        // The retry computes the exact same command from unchanged state,
        // with no interval in the way (nothing was ever stamped).
        let retry = ks.decide(input(400), 1_050);
        assert_eq!(retry.action, d.action);
        // Once the decoder accepts, the model catches up.
        ks.commit_last(1_050, None);
        assert!(ks.current_speed() > 1.0);
        assert_eq!(ks.counters().speed_sets, 1);
    }

    #[test]
    fn uncommitted_seek_keeps_cooldowns_clear() {
        let mut ks = keepsync();
        decide_ok(&mut ks, input(400), 1_000);
        let speed_before = ks.current_speed();

        let d = ks.decide(input(2_500), 2_000);
        assert!(matches!(d.action, DecisionAction::Seek(_)));
        // The decoder refused: no cooldown stamp, no reset, no counter.
        assert_eq!(ks.counters().seeks, 0);
        assert_eq!(ks.current_speed(), speed_before);

        // The very next sample may seek again; with this one committed,
        // the reset and the cooldown land.
        let d = ks.decide(input(2_500), 2_200);
        assert!(matches!(d.action, DecisionAction::Seek(_)));
        ks.commit_last(2_200, None);
        assert_eq!(ks.counters().seeks, 1);
        assert_eq!(ks.current_speed(), 1.0);
        assert_eq!(
            ks.decide(input(2_500), 2_400).reason,
            DecisionReason::SeekCooldown
        );
    }

    #[test]
    fn committed_rate_can_be_narrowed_by_the_caller() {
        // Protection mode clamps the rate actually sent to the decoder;
        // the model must track what the decoder got, not what was asked.
        let mut ks = keepsync();
        let d = ks.decide(input(900), 1_000);
        let asked = match d.action {
            DecisionAction::SetSpeed(r) => r,
            other => panic!("expected set_speed, got {other:?}"),
        };
        assert!(asked > 1.002);
        ks.commit_last(1_000, Some(1.002));
        assert_eq!(ks.current_speed(), 1.002);
    }

    #[test]
    fn disabled_speed_path_is_seek_only() {
        let cfg = KeepSyncConfig {
            set_speed_enabled: false,
            ..KeepSyncConfig::default()
        };
        let mut ks = KeepSync::new(cfg);

        // Speed-region deltas produce nothing at all.
        for at in [1_000, 1_400, 1_800, 2_200] {
            let d = decide_ok(&mut ks, input(500), at);
            assert_eq!(d.action, DecisionAction::Noop, "at {at}");
            assert_eq!(d.reason, DecisionReason::SpeedDisabled, "at {at}");
        }
        assert_eq!(ks.current_speed(), 1.0);
        assert_eq!(ks.counters().speed_sets, 0);

        // The seek path still corrects large deltas.
        let d = decide_ok(&mut ks, input(2_500), 3_000);
        assert!(matches!(d.action, DecisionAction::Seek(_)));
        assert_eq!(ks.counters().seeks, 1);
    }
}
