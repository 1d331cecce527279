use crate::media::TrackKind;
use crate::session::RoomId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as exchanged over signaling: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate in browser form (`RTCIceCandidateInit`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn kind(&self) -> CandidateKind {
        CandidateKind::classify(&self.candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl CandidateKind {
    /// Reads the `typ` attribute of an SDP candidate line.
    pub fn classify(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        while let Some(p) = parts.next() {
            if p == "typ" {
                return match parts.next() {
                    Some("host") => CandidateKind::Host,
                    Some("srflx") => CandidateKind::ServerReflexive,
                    Some("prflx") => CandidateKind::PeerReflexive,
                    Some("relay") => CandidateKind::Relay,
                    _ => CandidateKind::Unknown,
                };
            }
        }
        CandidateKind::Unknown
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relay => "relay",
            CandidateKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Peer connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_problem(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

/// One media track received from the partner.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Native track for rendering; absent for transports without RTP.
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("native", &self.handle.is_some())
            .finish()
    }
}

/// The partner's media as surfaced to the UI.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

// ========== SIGNALING PAYLOADS ==========

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Matched {
    pub room_id: RoomId,
    #[serde(default)]
    pub initiator: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub room_id: RoomId,
    pub offer: SessionDescription,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub room_id: RoomId,
    pub answer: SessionDescription,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub room_id: RoomId,
    pub candidate: IceCandidate,
}

/// `skip`, `end` and `partner-left`; the room is optional on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

/// Local `connect` announcement from the signaling channel.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkUp {
    pub generation: u64,
}
