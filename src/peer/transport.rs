//! The peer-connection capability behind a [`PeerSession`](super::session::PeerSession).
//!
//! The transport's own signaling/ICE state is opaque: callers only rely on
//! the results of the operations below.

use super::types::{IceCandidate, RemoteTrack, SessionDescription, TransportState};
use crate::config::IceServerConfig;
use crate::error::{CandidateApplyError, NegotiationError};
use crate::media::LocalTrack;
use async_trait::async_trait;
use std::sync::Arc;

pub type CandidateCallback = Arc<dyn Fn(IceCandidate) + Send + Sync>;
pub type RemoteTrackCallback = Arc<dyn Fn(RemoteTrack) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(TransportState) + Send + Sync>;

/// Callbacks a transport fires until [`PeerTransport::clear_handlers`].
#[derive(Clone)]
pub struct TransportHandlers {
    pub on_candidate: CandidateCallback,
    pub on_remote_track: RemoteTrackCallback,
    pub on_state: StateCallback,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CandidateApplyError>;

    /// After this returns no handler fires again, even for work already in flight.
    fn clear_handlers(&self);

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        handlers: TransportHandlers,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError>;
}
