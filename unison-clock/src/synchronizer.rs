//! Ping/pong exchange driver.
//!
//! Pure state machine: the engine loop calls `poll` on its timer tick and
//! `on_pong` on message receipt; the synchronizer decides when a ping is
//! due, tracks in-flight sequence numbers, and matches pongs back into
//! full `ClockSample`s for the estimator. Pings whose pong never arrives
//! expire after two seconds.

use std::collections::HashMap;

use crate::clock::ClockSample;

/// In-flight pings expire after this (ms).
pub const PING_TIMEOUT_MS: i64 = 2_000;
/// Ping period while in the foreground (ms).
pub const NORMAL_INTERVAL_MS: i64 = 800;
/// Ping period while backgrounded (ms).
pub const BACKGROUND_INTERVAL_MS: i64 = 2_000;
/// Ping period during fast recovery (ms).
pub const FAST_INTERVAL_MS: i64 = 200;
/// Number of fast-recovery pings after a background→foreground edge.
const FAST_RECOVERY_COUNT: u8 = 3;

/// Ping cadence. The three cadences are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Normal,
    Background,
    FastRecovery,
}

impl Cadence {
    fn interval_ms(self) -> i64 {
        match self {
            Cadence::Normal => NORMAL_INTERVAL_MS,
            Cadence::Background => BACKGROUND_INTERVAL_MS,
            Cadence::FastRecovery => FAST_INTERVAL_MS,
        }
    }
}

/// A ping the engine should put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingRequest {
    pub seq: u64,
    pub t0: i64,
}

/// Client-side ping scheduler and pong matcher.
#[derive(Debug)]
pub struct Synchronizer {
    running: bool,
    cadence: Cadence,
    fast_remaining: u8,
    next_seq: u64,
    next_ping_at: i64,
    in_flight: HashMap<u64, i64>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            running: false,
            cadence: Cadence::Normal,
            fast_remaining: 0,
            next_seq: 0,
            next_ping_at: 0,
            in_flight: HashMap::new(),
        }
    }

    /// Begin pinging. The first ping is due immediately.
    pub fn start(&mut self, wall_now: i64) {
        self.running = true;
        self.next_ping_at = wall_now;
    }

    /// Stop scheduling new pings (transport disconnect). In-flight entries
    /// still expire by timeout.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Foreground/background transitions. Returning to the foreground
    /// triggers a short burst of fast pings to re-converge the clock.
    pub fn set_background(&mut self, background: bool, wall_now: i64) {
        if background {
            self.cadence = Cadence::Background;
        } else if self.cadence == Cadence::Background {
            self.cadence = Cadence::FastRecovery;
            self.fast_remaining = FAST_RECOVERY_COUNT;
            self.next_ping_at = wall_now;
        }
    }

    /// Emit a ping if one is due, and expire stale in-flight entries.
    pub fn poll(&mut self, wall_now: i64) -> Option<PingRequest> {
        self.expire(wall_now);
        if !self.running || wall_now < self.next_ping_at {
            return None;
        }

        let ping = PingRequest {
            seq: self.next_seq,
            t0: wall_now,
        };
        self.next_seq += 1;
        self.in_flight.insert(ping.seq, ping.t0);

        if self.cadence == Cadence::FastRecovery {
            self.fast_remaining = self.fast_remaining.saturating_sub(1);
            if self.fast_remaining == 0 {
                self.cadence = Cadence::Normal;
            }
        }
        self.next_ping_at = wall_now + self.cadence.interval_ms();
        Some(ping)
    }

    /// Wall time of the next scheduled ping, if running.
    pub fn next_due(&self) -> Option<i64> {
        self.running.then_some(self.next_ping_at)
    }

    /// Match a pong against its in-flight ping. `t1` is the host's stamp;
    /// the receive time becomes `t2`.
    pub fn on_pong(&mut self, seq: u64, t1: i64, wall_now: i64) -> Option<ClockSample> {
        let t0 = self.in_flight.remove(&seq)?;
        Some(ClockSample {
            seq,
            t0,
            t1,
            t2: wall_now,
        })
    }

    fn expire(&mut self, wall_now: i64) {
        self.in_flight
            .retain(|_, t0| wall_now - *t0 <= PING_TIMEOUT_MS);
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}
