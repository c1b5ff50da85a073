//! Shared room-time handle.
//!
//! The `RoomClock` itself is owned by the engine task; timed work that runs
//! off that task (future-start waits, catch-up sleeps) polls room time
//! through this handle instead. It anchors a wall-clock base to a
//! `tokio::time::Instant`, so under `tokio::time::pause` the whole time
//! base is virtual and tests are deterministic.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

#[derive(Debug)]
struct Inner {
    base_instant: Instant,
    base_wall_ms: i64,
    offset_ms: AtomicI64,
    locked: AtomicBool,
}

/// Cheaply clonable view of the current wall/room time mapping.
#[derive(Debug, Clone)]
pub struct RoomTimeHandle {
    inner: Arc<Inner>,
}

impl RoomTimeHandle {
    /// Anchor the handle at the current wall clock.
    pub fn new() -> Self {
        let base_wall_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self::with_base(base_wall_ms)
    }

    /// Anchor the handle at an explicit wall base. Used by tests to pin
    /// the time axis.
    pub fn with_base(base_wall_ms: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                base_instant: Instant::now(),
                base_wall_ms,
                offset_ms: AtomicI64::new(0),
                locked: AtomicBool::new(false),
            }),
        }
    }

    /// Current local wall time in milliseconds.
    pub fn wall_now_ms(&self) -> i64 {
        self.inner.base_wall_ms + self.inner.base_instant.elapsed().as_millis() as i64
    }

    /// Current room time in milliseconds.
    pub fn room_now_ms(&self) -> i64 {
        self.wall_now_ms() + self.offset_ms()
    }

    pub fn offset_ms(&self) -> i64 {
        self.inner.offset_ms.load(Ordering::Relaxed)
    }

    /// Published by the clock owner after each accepted sample.
    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.inner.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::Relaxed)
    }

    pub fn set_locked(&self, locked: bool) {
        self.inner.locked.store(locked, Ordering::Relaxed);
    }
}

impl Default for RoomTimeHandle {
    fn default() -> Self {
        Self::new()
    }
}
