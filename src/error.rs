//! Error taxonomy for the call engine.
//!
//! Only `MediaAccessError` is fatal to a call. Everything else is logged
//! and the session stays where it was; recovery is a user `skip` or a
//! counterpart `partner-left`.

use thiserror::Error;

use crate::peer::types::SdpKind;
use crate::session::Role;

pub type Result<T> = std::result::Result<T, Error>;

/// Local capture could not be started.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("neither audio nor video was requested")]
    NothingRequested,

    #[error("media access denied: {0}")]
    Denied(String),
}

/// A description could not be created or applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{operation} is not valid for the {role:?} role")]
    WrongRole { operation: &'static str, role: Role },

    #[error("peer session already closed")]
    Closed,

    #[error("{operation} needs a prior local offer")]
    NoLocalOffer { operation: &'static str },

    #[error("expected {expected:?} description, got {got:?}")]
    UnexpectedDescription { expected: SdpKind, got: SdpKind },

    #[error("transport error: {0}")]
    Transport(String),
}

/// One remote candidate was rejected by the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to apply ICE candidate: {0}")]
pub struct CandidateApplyError(pub String);

/// The signaling channel has no live transport; the event was dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("signaling channel unavailable, dropped `{event}`")]
pub struct ChannelUnavailable {
    pub event: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid ICE server `{id}`: {reason}")]
    InvalidIceServer { id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Media(#[from] MediaAccessError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Candidate(#[from] CandidateApplyError),

    #[error(transparent)]
    Channel(#[from] ChannelUnavailable),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<webrtc::Error> for NegotiationError {
    fn from(e: webrtc::Error) -> Self {
        NegotiationError::Transport(e.to_string())
    }
}
