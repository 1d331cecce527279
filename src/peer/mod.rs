pub mod connection;
pub mod ice;
pub mod session;
pub mod transport;
pub mod types;

pub use connection::{RtcTransport, RtcTransportFactory};
pub use ice::{CandidateBuffer, DrainReport, PushOutcome};
pub use session::{PeerEvent, PeerSession};
pub use transport::{PeerTransport, TransportFactory, TransportHandlers};
pub use types::{
    AnswerPayload, CandidatePayload, IceCandidate, Matched, OfferPayload, RemoteStream,
    RemoteTrack, RoomPayload, SdpKind, SessionDescription, TransportState,
};
