//! Clock statistics snapshot and formatting.

/// Read-only snapshot of the room clock, for status surfaces and logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClockStats {
    pub locked: bool,
    pub offset_ms: i64,
    pub offset_raw_ms: i64,
    pub rtt_ms: i64,
    pub rtt_ema_ms: f64,
    pub jitter_ms: i64,
    pub sample_count: u64,
    pub dropped: u64,
    pub last_drop: Option<&'static str>,
    pub epoch: u64,
}

impl ClockStats {
    /// One-line summary.
    ///
    /// Returns a string like:
    /// "locked, offset -3 ms, rtt 12 ms, jitter 2 ms (41 samples, 1 dropped)"
    pub fn format_display(&self) -> String {
        let lock = if self.locked { "locked" } else { "unlocked" };
        format!(
            "{}, offset {} ms, rtt {:.0} ms, jitter {} ms ({} samples, {} dropped)",
            lock, self.offset_ms, self.rtt_ema_ms, self.jitter_ms, self.sample_count, self.dropped
        )
    }
}
