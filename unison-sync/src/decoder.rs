//! Decoder collaborator contract.
//!
//! The engine never touches audio itself; it drives whatever decoder the
//! platform provides through this seam. `set_speed` may be a no-op on
//! platforms without native rate control.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DecoderError {
    #[error("load failed: {0}")]
    Load(String),
    #[error("decoder operation failed: {0}")]
    Op(String),
}

/// Playback operations the engine consumes.
///
/// Exclusivity is temporal: the future-start scheduler owns the decoder
/// during prepare/start, catch-up during a catch-up run, and the KeepSync
/// executor during steady playback.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Load a local file and return its duration in ms.
    async fn load(&self, path: &str) -> Result<i64, DecoderError>;
    async fn seek(&self, pos_ms: i64) -> Result<(), DecoderError>;
    async fn play(&self) -> Result<(), DecoderError>;
    async fn pause(&self) -> Result<(), DecoderError>;
    /// `rate` is within [0.5, 2.0]; 1.0 is natural speed.
    async fn set_speed(&self, rate: f64) -> Result<(), DecoderError>;
    async fn position(&self) -> i64;
    async fn duration(&self) -> i64;
    async fn is_playing(&self) -> bool;
}

/// Test and demo decoders.
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    pub enum DecoderCall {
        Load(String),
        Seek(i64),
        Play,
        Pause,
        SetSpeed(f64),
    }

    #[derive(Debug)]
    struct FakeState {
        loaded: Option<String>,
        duration_ms: i64,
        playing: bool,
        speed: f64,
        /// Position at `anchored_at`; advances with the tokio clock while playing.
        pos_ms: i64,
        anchored_at: Instant,
        /// Accepted operations only; refused ones never land here.
        calls: Vec<DecoderCall>,
        fail_load: Option<String>,
        fail_seek: Option<String>,
        fail_set_speed: bool,
    }

    /// Scripted decoder whose position advances with the (possibly paused)
    /// tokio clock, scaled by the commanded speed.
    pub struct FakeDecoder {
        state: Mutex<FakeState>,
    }

    impl FakeDecoder {
        pub fn new(duration_ms: i64) -> Self {
            Self {
                state: Mutex::new(FakeState {
                    loaded: None,
                    duration_ms,
                    playing: false,
                    speed: 1.0,
                    pos_ms: 0,
                    anchored_at: Instant::now(),
                    calls: Vec::new(),
                    fail_load: None,
                    fail_seek: None,
                    fail_set_speed: false,
                }),
            }
        }

        /// Make the next `load` fail with the given message.
        pub fn fail_next_load(&self, message: &str) {
            self.state.lock().fail_load = Some(message.to_owned());
        }

        /// Make the next `seek` fail with the given message.
        pub fn fail_next_seek(&self, message: &str) {
            self.state.lock().fail_seek = Some(message.to_owned());
        }

        /// Refuse every `set_speed` until turned off again.
        pub fn set_speed_failing(&self, failing: bool) {
            self.state.lock().fail_set_speed = failing;
        }

        pub fn calls(&self) -> Vec<DecoderCall> {
            self.state.lock().calls.clone()
        }

        pub fn take_calls(&self) -> Vec<DecoderCall> {
            std::mem::take(&mut self.state.lock().calls)
        }

        fn current_pos(state: &FakeState) -> i64 {
            if !state.playing {
                return state.pos_ms;
            }
            let elapsed = state.anchored_at.elapsed().as_millis() as f64;
            let pos = state.pos_ms + (elapsed * state.speed) as i64;
            pos.min(state.duration_ms)
        }

        fn reanchor(state: &mut FakeState) {
            state.pos_ms = Self::current_pos(state);
            state.anchored_at = Instant::now();
        }
    }

    #[async_trait]
    impl Decoder for FakeDecoder {
        async fn load(&self, path: &str) -> Result<i64, DecoderError> {
            let mut s = self.state.lock();
            if let Some(msg) = s.fail_load.take() {
                return Err(DecoderError::Load(msg));
            }
            s.loaded = Some(path.to_owned());
            s.playing = false;
            s.pos_ms = 0;
            s.anchored_at = Instant::now();
            s.calls.push(DecoderCall::Load(path.to_owned()));
            Ok(s.duration_ms)
        }

        async fn seek(&self, pos_ms: i64) -> Result<(), DecoderError> {
            let mut s = self.state.lock();
            if let Some(msg) = s.fail_seek.take() {
                return Err(DecoderError::Op(msg));
            }
            s.pos_ms = pos_ms.clamp(0, s.duration_ms);
            s.anchored_at = Instant::now();
            s.calls.push(DecoderCall::Seek(pos_ms));
            Ok(())
        }

        async fn play(&self) -> Result<(), DecoderError> {
            let mut s = self.state.lock();
            Self::reanchor(&mut s);
            s.playing = true;
            s.calls.push(DecoderCall::Play);
            Ok(())
        }

        async fn pause(&self) -> Result<(), DecoderError> {
            let mut s = self.state.lock();
            Self::reanchor(&mut s);
            s.playing = false;
            s.calls.push(DecoderCall::Pause);
            Ok(())
        }

        async fn set_speed(&self, rate: f64) -> Result<(), DecoderError> {
            let mut s = self.state.lock();
            if s.fail_set_speed {
                return Err(DecoderError::Op("rate control unavailable".into()));
            }
            Self::reanchor(&mut s);
            s.speed = rate;
            s.calls.push(DecoderCall::SetSpeed(rate));
            Ok(())
        }

        async fn position(&self) -> i64 {
            let s = self.state.lock();
            Self::current_pos(&s)
        }

        async fn duration(&self) -> i64 {
            self.state.lock().duration_ms
        }

        async fn is_playing(&self) -> bool {
            self.state.lock().playing
        }
    }

    /// Decoder that accepts everything and produces nothing. Used by the
    /// wiring demos where no audio stack is attached.
    pub struct NullDecoder;

    #[async_trait]
    impl Decoder for NullDecoder {
        async fn load(&self, _path: &str) -> Result<i64, DecoderError> {
            Ok(0)
        }
        async fn seek(&self, _pos_ms: i64) -> Result<(), DecoderError> {
            Ok(())
        }
        async fn play(&self) -> Result<(), DecoderError> {
            Ok(())
        }
        async fn pause(&self) -> Result<(), DecoderError> {
            Ok(())
        }
        async fn set_speed(&self, _rate: f64) -> Result<(), DecoderError> {
            Ok(())
        }
        async fn position(&self) -> i64 {
            0
        }
        async fn duration(&self) -> i64 {
            0
        }
        async fn is_playing(&self) -> bool {
            false
        }
    }

}
