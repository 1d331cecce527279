use super::ice::{CandidateBuffer, CandidateStats, PushOutcome};
use super::transport::{PeerTransport, TransportFactory, TransportHandlers};
use super::types::{
    CandidatePayload, IceCandidate, RemoteStream, RemoteTrack, SdpKind, SessionDescription,
    TransportState,
};
use crate::config::IceServerConfig;
use crate::error::{CandidateApplyError, NegotiationError};
use crate::logger::dump_candidate;
use crate::media::LocalMedia;
use crate::session::{Role, RoomId};
use crate::signaling::{events, SignalingChannel};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transport callbacks, tagged with the room they belong to.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    RemoteTrack { room_id: RoomId, track: RemoteTrack },
    StateChanged { room_id: RoomId, state: TransportState },
}

impl PeerEvent {
    pub fn room_id(&self) -> &RoomId {
        match self {
            PeerEvent::RemoteTrack { room_id, .. } | PeerEvent::StateChanged { room_id, .. } => {
                room_id
            }
        }
    }
}

pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// One peer-to-peer transport bound to one room.
pub struct PeerSession {
    room_id: RoomId,
    role: Role,
    transport: Arc<dyn PeerTransport>,
    candidates: CandidateBuffer,
    stats: Arc<Mutex<CandidateStats>>,
    remote: Option<RemoteStream>,
    transport_state: TransportState,
    local_tracks: usize,
    offered: bool,
    closed: bool,
}

impl PeerSession {
    /// Opens a transport for `room_id` and attaches every local track.
    ///
    /// Local candidates go straight to `channel` tagged with the room;
    /// remote tracks and state changes go to `sink`.
    pub async fn create(
        room_id: RoomId,
        role: Role,
        local: &LocalMedia,
        factory: &dyn TransportFactory,
        ice_servers: &[IceServerConfig],
        channel: Arc<SignalingChannel>,
        sink: PeerEventSink,
    ) -> Result<Self, NegotiationError> {
        let stats = Arc::new(Mutex::new(CandidateStats::default()));

        let handlers = {
            let (room, st) = (room_id.clone(), stats.clone());
            let on_candidate = Arc::new(move |candidate: IceCandidate| {
                dump_candidate("LOCAL", &candidate);
                st.lock().record(&candidate);
                let payload = CandidatePayload {
                    room_id: room.clone(),
                    candidate,
                };
                if let Err(e) = channel.emit(events::ICE_CANDIDATE, &payload) {
                    debug!(error = %e, "local candidate not sent");
                }
            });
            let (room, s) = (room_id.clone(), sink.clone());
            let on_remote_track = Arc::new(move |track: RemoteTrack| {
                s(PeerEvent::RemoteTrack {
                    room_id: room.clone(),
                    track,
                });
            });
            let (room, s) = (room_id.clone(), sink);
            let on_state = Arc::new(move |state: TransportState| {
                s(PeerEvent::StateChanged {
                    room_id: room.clone(),
                    state,
                });
            });
            TransportHandlers {
                on_candidate,
                on_remote_track,
                on_state,
            }
        };

        let transport = factory.create(ice_servers, handlers).await?;
        let mut session = Self {
            room_id,
            role,
            transport,
            candidates: CandidateBuffer::new(),
            stats,
            remote: None,
            transport_state: TransportState::New,
            local_tracks: 0,
            offered: false,
            closed: false,
        };

        for track in local.tracks() {
            if let Err(e) = session.transport.add_track(track).await {
                session.teardown().await;
                return Err(e);
            }
            session.local_tracks += 1;
        }
        info!(room = %session.room_id, role = ?role, tracks = session.local_tracks, "peer session created");
        Ok(session)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn local_track_count(&self) -> usize {
        self.local_tracks
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn remote_description_set(&self) -> bool {
        self.candidates.remote_description_set()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote.as_ref()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport_state
    }

    pub fn set_transport_state(&mut self, state: TransportState) {
        self.transport_state = state;
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_role(&self, operation: &'static str, role: Role) -> Result<(), NegotiationError> {
        if self.role != role {
            return Err(NegotiationError::WrongRole {
                operation,
                role: self.role,
            });
        }
        Ok(())
    }

    /// Creates the local offer and sets it as local description.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.ensure_role("create_offer", Role::Initiator)?;
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.offered = true;
        debug!(room = %self.room_id, "local offer set");
        Ok(offer)
    }

    /// Applies the partner's offer, drains queued candidates and returns
    /// the local answer.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.ensure_role("accept_offer", Role::Responder)?;
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::UnexpectedDescription {
                expected: SdpKind::Offer,
                got: offer.kind,
            });
        }
        self.transport.set_remote_description(offer).await?;
        self.candidates.drain(self.transport.as_ref()).await;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        debug!(room = %self.room_id, "local answer set");
        Ok(answer)
    }

    /// Applies the partner's answer to our offer and drains queued candidates.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.ensure_role("accept_answer", Role::Initiator)?;
        if !self.offered {
            return Err(NegotiationError::NoLocalOffer {
                operation: "accept_answer",
            });
        }
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::UnexpectedDescription {
                expected: SdpKind::Answer,
                got: answer.kind,
            });
        }
        self.transport.set_remote_description(answer).await?;
        self.candidates.drain(self.transport.as_ref()).await;
        debug!(room = %self.room_id, "remote answer set");
        Ok(())
    }

    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<PushOutcome, CandidateApplyError> {
        if self.closed {
            return Err(CandidateApplyError("peer session closed".into()));
        }
        dump_candidate("REMOTE", &candidate);
        self.candidates
            .push(candidate, self.transport.as_ref())
            .await
    }

    /// Records a remote track. Returns true for the first one.
    pub fn on_remote_track(&mut self, track: RemoteTrack) -> bool {
        match &mut self.remote {
            Some(stream) => {
                stream.tracks.push(track);
                false
            }
            None => {
                self.remote = Some(RemoteStream {
                    stream_id: track.stream_id.clone(),
                    tracks: vec![track],
                });
                true
            }
        }
    }

    /// Detaches callbacks, then closes the transport. Safe to call twice.
    pub async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.transport.clear_handlers();
        let dropped = self.candidates.clear();
        if dropped > 0 {
            debug!(room = %self.room_id, dropped, "discarded pending candidates");
        }
        self.transport.close().await;
        self.remote = None;
        self.stats.lock().log_summary();
        info!(room = %self.room_id, "peer session closed");
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(room = %self.room_id, "peer session dropped without teardown");
        self.transport.clear_handlers();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let transport = self.transport.clone();
            rt.spawn(async move { transport.close().await });
        }
    }
}
