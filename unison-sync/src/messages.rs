//! Wire protocol.
//!
//! Every message is a JSON object with a `type` tag. Receivers tolerate
//! framing variants (`data`/`payload` envelopes), missing optional fields,
//! and unknown types — peers running a newer app version must not break
//! older ones. All millisecond fields are 64-bit signed.

use serde::{Deserialize, Serialize};

/// Protocol version carried in `hello`.
pub const PROTO_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Host,
    Client,
}

/// Typed error codes a client reports when track preparation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyErrorCode {
    DownloadFailed,
    HashMismatch,
    Http4xx,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    #[serde(rename_all = "camelCase")]
    Hello {
        proto_ver: u32,
        room_id: String,
        peer_id: String,
        role: PeerRole,
        device_info: String,
    },
    #[serde(rename_all = "camelCase")]
    Welcome {
        session_id: String,
        server_now_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    Ping { seq: u64, t0_client_ms: i64 },
    #[serde(rename_all = "camelCase")]
    Pong {
        seq: u64,
        t0_client_ms: i64,
        t1_server_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoin {
        peer_id: String,
        role: Option<PeerRole>,
        device_info: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeave {
        peer_id: String,
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TrackAnnounce {
        room_id: String,
        host_peer_id: String,
        track_id: String,
        url: String,
        file_hash: String,
        size_bytes: u64,
        duration_ms: i64,
        file_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ClientReady {
        track_id: String,
        cached: bool,
        local_path: String,
        prepare_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    ClientReadyError {
        track_id: String,
        error_code: ReadyErrorCode,
        error_message: String,
    },
    #[serde(rename_all = "camelCase")]
    StartAt {
        epoch: u64,
        seq: u64,
        track_id: String,
        start_at_room_time_ms: i64,
        start_pos_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    ClientStartReport {
        peer_id: String,
        epoch: u64,
        seq: u64,
        actual_start_room_time_ms: i64,
        start_error_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    HostState {
        room_id: String,
        track_id: String,
        is_playing: bool,
        host_pos_ms: i64,
        sampled_at_room_time_ms: i64,
        epoch: u64,
        seq: u64,
    },
}

impl WireMessage {
    pub fn encode(&self) -> String {
        // The enum serializes to a flat object; this cannot fail.
        serde_json::to_string(self).expect("wire message serialization")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no type field")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

/// Rate limiter for unknown-type warnings: at most one log line per 2 s.
#[derive(Debug, Default)]
pub struct UnknownTypeWarner {
    last_warn_wall_ms: Option<i64>,
}

impl UnknownTypeWarner {
    const MIN_SPACING_MS: i64 = 2_000;

    pub fn warn(&mut self, msg_type: &str, wall_now: i64) {
        let due = self
            .last_warn_wall_ms
            .map_or(true, |last| wall_now - last >= Self::MIN_SPACING_MS);
        if due {
            self.last_warn_wall_ms = Some(wall_now);
            log::warn!("ignoring unknown message type {msg_type:?}");
        }
    }
}

/// Decode one frame, unwrapping a `data`/`payload` envelope if the top
/// level carries no `type` of its own.
pub fn decode_frame(text: &str) -> Result<WireMessage, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let body = unwrap_envelope(value);
    let msg_type = match body.get("type").and_then(|t| t.as_str()) {
        Some(t) => t.to_owned(),
        None => return Err(DecodeError::MissingType),
    };
    match serde_json::from_value::<WireMessage>(body) {
        Ok(msg) => Ok(msg),
        Err(err) => {
            if err.to_string().contains("unknown variant") {
                Err(DecodeError::UnknownType(msg_type))
            } else {
                Err(DecodeError::Json(err))
            }
        }
    }
}

fn unwrap_envelope(value: serde_json::Value) -> serde_json::Value {
    if value.get("type").is_some() {
        return value;
    }
    for key in ["data", "payload"] {
        if let Some(inner) = value.get(key) {
            if inner.get("type").is_some() {
                return inner.clone();
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_wire_field_names() {
        let msg = WireMessage::Ping {
            seq: 7,
            t0_client_ms: 123_456,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["t0ClientMs"], 123_456);
    }

    #[test]
    fn decodes_host_state() {
        let text = r#"{"type":"host_state","roomId":"r1","trackId":"t1",
            "isPlaying":true,"hostPosMs":42000,"sampledAtRoomTimeMs":20000,
            "epoch":1,"seq":12}"#;
        let msg = decode_frame(text).unwrap();
        assert_eq!(
            msg,
            WireMessage::HostState {
                room_id: "r1".into(),
                track_id: "t1".into(),
                is_playing: true,
                host_pos_ms: 42_000,
                sampled_at_room_time_ms: 20_000,
                epoch: 1,
                seq: 12,
            }
        );
    }

    #[test]
    fn decodes_nested_envelopes() {
        for key in ["data", "payload"] {
            let text = format!(
                r#"{{"{key}":{{"type":"pong","seq":3,"t0ClientMs":10,"t1ServerMs":20}}}}"#
            );
            let msg = decode_frame(&text).unwrap();
            assert_eq!(
                msg,
                WireMessage::Pong {
                    seq: 3,
                    t0_client_ms: 10,
                    t1_server_ms: 20,
                }
            );
        }
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let msg = decode_frame(r#"{"type":"peer_leave","peerId":"p1"}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::PeerLeave {
                peer_id: "p1".into(),
                reason: None,
            }
        );
    }

    #[test]
    fn unknown_type_is_reported_as_such() {
        match decode_frame(r#"{"type":"disco_ball","shine":9}"#) {
            Err(DecodeError::UnknownType(t)) => assert_eq!(t, "disco_ball"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn missing_type_is_distinct_from_unknown() {
        assert!(matches!(
            decode_frame(r#"{"seq":1}"#),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn warner_rate_limits() {
        let mut warner = UnknownTypeWarner::default();
        warner.warn("x", 1_000);
        assert_eq!(warner.last_warn_wall_ms, Some(1_000));
        warner.warn("x", 2_500); // suppressed
        assert_eq!(warner.last_warn_wall_ms, Some(1_000));
        warner.warn("x", 3_100);
        assert_eq!(warner.last_warn_wall_ms, Some(3_100));
    }

    #[test]
    fn error_codes_use_wire_spelling() {
        let msg = WireMessage::ClientReadyError {
            track_id: "t".into(),
            error_code: ReadyErrorCode::HashMismatch,
            error_message: "digest differs".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(json["errorCode"], "hash_mismatch");
    }
}
