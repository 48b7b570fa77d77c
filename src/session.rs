//! Peer Session (spec §4.D): one instance per connected drone. Owns the
//! WebSocket, the assigned fly-to target, and the WebRTC peer state.
//!
//! WebRTC wiring follows `other_examples/...angkira-rpi-webrtc-streamer...
//! webrtc_streamer.rs`: `APIBuilder`, a single registered video codec, and
//! callback-driven ICE/connection-state handling.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};

use crate::planner::FlyToTarget;

/// WebRTC peer state (spec §3, §4.D). Progresses monotonically; only
/// `Closed` may be reached from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    OfferReceived,
    Answered,
    Connected,
    Closed,
}

pub type WsSink = SplitSink<WebSocket, Message>;

/// Server-side record for one connected drone.
pub struct PeerSession {
    pub connection_id: String,
    /// Stable id supplied by an `Identify` message, if any (spec §9).
    pub stable_id: Option<String>,
    pub target: Option<FlyToTarget>,
    /// Shared with the `on_peer_connection_state_change` callback so the
    /// WebRTC implementation's own connection-state events can drive the
    /// `Connected`/`Closed` transitions (spec §4.D).
    state: Arc<Mutex<PeerState>>,
    sink: Arc<Mutex<WsSink>>,
    peer_connection: Option<Arc<RTCPeerConnection>>,
}

impl PeerSession {
    pub fn new(connection_id: String, sink: WsSink, target: Option<FlyToTarget>) -> Self {
        Self {
            connection_id,
            stable_id: None,
            target,
            state: Arc::new(Mutex::new(PeerState::Idle)),
            sink: Arc::new(Mutex::new(sink)),
            peer_connection: None,
        }
    }

    pub async fn state(&self) -> PeerState {
        *self.state.lock().await
    }

    async fn send(&self, value: &Value) -> bool {
        let Ok(text) = serde_json::to_string(value) else {
            warn!(connection_id = %self.connection_id, "failed to serialize outbound frame");
            return false;
        };
        let mut sink = self.sink.lock().await;
        match futures_util::SinkExt::send(&mut *sink, Message::Text(text)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(connection_id = %self.connection_id, "send failed: {e}");
                false
            }
        }
    }

    /// Serialise the assigned target as `Coordinate_assignment`. Silently
    /// skipped if no target is assigned. Lat/lng truncated to 9 chars,
    /// altitude to 2, angle as an integer string (spec §4.D).
    pub async fn send_assigned_coordinate(&self) -> bool {
        let Some(target) = self.target else {
            return true;
        };
        let lat: String = format!("{}", target.coordinate.lat).chars().take(9).collect();
        let lng: String = format!("{}", target.coordinate.lng).chars().take(9).collect();
        let alt: String = {
            let s = format!("{:.2}", target.coordinate.alt);
            s.chars().take(2).collect()
        };
        let angle = format!("{}", target.yaw_deg.round() as i64);

        self.send(&json!({
            "msg_type": "Coordinate_assignment",
            "lat": lat,
            "lng": lng,
            "alt": alt,
            "angle": angle,
        }))
        .await
    }

    pub async fn send_command(&self, command: &str, payload: Value) -> bool {
        let mut frame = payload;
        if !frame.is_object() {
            frame = json!({});
        }
        frame["msg_type"] = json!(command);
        self.send(&frame).await
    }

    /// Route an inbound frame by `msg_type` (spec §4.D `dispatch`, §6.1).
    /// Returns `Some(PositionRecord-shaped value)` when the frame is a
    /// `Position` telemetry update, for the caller to persist to cache.
    pub async fn handle_offer(&mut self, sdp: String) {
        let current = self.state().await;
        match current {
            PeerState::Idle => {}
            _ => {
                warn!(connection_id = %self.connection_id, state = ?current, "duplicate offer ignored");
                return;
            }
        }

        let pc = match self.peer_connection.clone() {
            Some(pc) => pc,
            None => match build_peer_connection().await {
                Ok(pc) => {
                    let pc = Arc::new(pc);
                    self.peer_connection = Some(pc.clone());
                    self.wire_callbacks(&pc);
                    pc
                }
                Err(e) => {
                    warn!(connection_id = %self.connection_id, "failed to create peer connection: {e}");
                    return;
                }
            },
        };

        let offer = match RTCSessionDescription::offer(sdp) {
            Ok(o) => o,
            Err(e) => {
                warn!(connection_id = %self.connection_id, "malformed offer SDP dropped: {e}");
                return;
            }
        };
        if let Err(e) = pc.set_remote_description(offer).await {
            warn!(connection_id = %self.connection_id, "set_remote_description failed: {e}");
            return;
        }
        *self.state.lock().await = PeerState::OfferReceived;

        let answer = match pc.create_answer(None).await {
            Ok(a) => a,
            Err(e) => {
                warn!(connection_id = %self.connection_id, "create_answer failed: {e}");
                return;
            }
        };
        if let Err(e) = pc.set_local_description(answer.clone()).await {
            warn!(connection_id = %self.connection_id, "set_local_description failed: {e}");
            return;
        }

        self.send(&json!({
            "msg_type": "answer",
            "sdp": answer.sdp,
            "type": "answer",
        }))
        .await;
        *self.state.lock().await = PeerState::Answered;
    }

    pub async fn handle_candidate(&mut self, candidate: Option<Value>) {
        let Some(candidate) = candidate else {
            // End-of-candidates: treated as a no-op (spec §9 open question).
            return;
        };
        if matches!(self.state().await, PeerState::Idle) {
            warn!(connection_id = %self.connection_id, "candidate received before remote description, dropping");
            return;
        }
        let Some(pc) = &self.peer_connection else {
            warn!(connection_id = %self.connection_id, "candidate received with no peer connection, dropping");
            return;
        };

        let init: RTCIceCandidateInit = match serde_json::from_value(candidate) {
            Ok(init) => init,
            Err(e) => {
                warn!(connection_id = %self.connection_id, "malformed ICE candidate dropped: {e}");
                return;
            }
        };
        if let Err(e) = pc.add_ice_candidate(init).await {
            warn!(connection_id = %self.connection_id, "add_ice_candidate failed: {e}");
        }
    }

    fn wire_callbacks(&self, pc: &Arc<RTCPeerConnection>) {
        let connection_id = self.connection_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let connection_id = connection_id.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    debug!(%connection_id, "local ICE candidate gathered: {}", c.address);
                }
            })
        }));

        let connection_id = self.connection_id.clone();
        let state = self.state.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let connection_id = connection_id.clone();
            let state = state.clone();
            Box::pin(async move {
                info!(%connection_id, "peer connection state: {s}");
                let mut current = state.lock().await;
                if *current == PeerState::Closed {
                    return;
                }
                match s {
                    RTCPeerConnectionState::Connected => *current = PeerState::Connected,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        *current = PeerState::Closed;
                    }
                    _ => {}
                }
            })
        }));
    }

    /// Close the peer and the WebSocket (spec §4.D `close`). The caller is
    /// responsible for removing this session from the connection map.
    pub async fn close(&mut self, reason: &str) {
        if self.state().await == PeerState::Closed {
            return;
        }
        info!(connection_id = %self.connection_id, reason, "closing peer session");
        if let Some(pc) = self.peer_connection.take() {
            let _ = pc.close().await;
        }
        let mut sink = self.sink.lock().await;
        let _ = futures_util::SinkExt::close(&mut *sink).await;
        *self.state.lock().await = PeerState::Closed;
    }
}

async fn build_peer_connection() -> webrtc::error::Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    api.new_peer_connection(RTCConfiguration::default()).await
}

/// Inbound frame envelope shared across `msg_type`s (spec §6.1, §9 `Identify`
/// supplement).
#[derive(Debug, Deserialize)]
#[serde(tag = "msg_type")]
pub enum InboundFrame {
    #[serde(rename = "Coordinate_request")]
    CoordinateRequest,
    Position {
        latitude: f64,
        longitude: f64,
        altitude: f64,
        timestamp: Option<i64>,
    },
    Debug {
        msg: String,
    },
    #[serde(rename = "offer")]
    Offer {
        sdp: String,
        #[serde(rename = "type", default)]
        sdp_type: Option<String>,
    },
    #[serde(rename = "candidate")]
    Candidate { candidate: Option<Value> },
    #[serde(rename = "answer")]
    Answer {
        #[serde(default)]
        sdp: Option<String>,
    },
    Identify {
        drone_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frame_parses_position() {
        let raw = serde_json::json!({
            "msg_type": "Position",
            "latitude": 57.7,
            "longitude": 11.9,
            "altitude": 42.0,
        });
        let frame: InboundFrame = serde_json::from_value(raw).unwrap();
        match frame {
            InboundFrame::Position { latitude, longitude, altitude, timestamp } => {
                assert_eq!(latitude, 57.7);
                assert_eq!(longitude, 11.9);
                assert_eq!(altitude, 42.0);
                assert!(timestamp.is_none());
            }
            _ => panic!("expected Position"),
        }
    }

    #[test]
    fn inbound_frame_parses_offer() {
        let raw = serde_json::json!({"msg_type": "offer", "sdp": "v=0..."});
        let frame: InboundFrame = serde_json::from_value(raw).unwrap();
        assert!(matches!(frame, InboundFrame::Offer { .. }));
    }

    #[test]
    fn inbound_frame_parses_candidate_with_null() {
        let raw = serde_json::json!({"msg_type": "candidate", "candidate": null});
        let frame: InboundFrame = serde_json::from_value(raw).unwrap();
        match frame {
            InboundFrame::Candidate { candidate } => assert!(candidate.is_none()),
            _ => panic!("expected candidate"),
        }
    }

    #[test]
    fn inbound_frame_rejects_unknown_msg_type() {
        let raw = serde_json::json!({"msg_type": "bogus"});
        let result: Result<InboundFrame, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }
}
