use super::transport::{PeerTransport, TransportFactory, TransportHandlers};
use super::types::{IceCandidate, RemoteTrack, SdpKind, SessionDescription, TransportState};
use crate::config::IceServerConfig;
use crate::error::{CandidateApplyError, NegotiationError};
use crate::logger::dump_selected_pair;
use crate::media::{LocalTrack, TrackKind};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

type HandlerSlot = Arc<Mutex<Option<TransportHandlers>>>;
type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Builds `webrtc` peer connections with default codecs and interceptors.
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    pub candidate_pool_size: u8,
}

impl Default for RtcTransportFactory {
    fn default() -> Self {
        Self {
            candidate_pool_size: 10,
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        handlers: TransportHandlers,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(ice_servers, self.candidate_pool_size))
                .await?,
        );
        let slot: HandlerSlot = Arc::new(Mutex::new(Some(handlers)));
        install_callbacks(&pc, &slot);
        debug!(servers = ice_servers.len(), "peer connection created");

        Ok(Arc::new(RtcTransport { pc, handlers: slot }))
    }
}

/// Peer connection settings for the configured ICE servers.
fn rtc_config(servers: &[IceServerConfig], pool_size: u8) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        ice_candidate_pool_size: pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn handler<T>(slot: &HandlerSlot, pick: impl FnOnce(&TransportHandlers) -> T) -> Option<T> {
    slot.lock().as_ref().map(pick)
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, slot: &HandlerSlot) {
    let s = slot.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let s = s.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(c) = cand else {
                debug!("ICE candidate gathering completed");
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    };
                    if let Some(cb) = handler(&s, |h| h.on_candidate.clone()) {
                        cb(candidate);
                    }
                }
                Err(e) => warn!(error = %e, "cannot serialize local candidate"),
            }
        })
    }));

    let s = slot.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>|
              -> HandlerFuture {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                other => {
                    warn!(kind = ?other, "ignoring remote track of unknown kind");
                    return Box::pin(async {});
                }
            };
            let remote = RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                handle: Some(track),
            };
            if let Some(cb) = handler(&s, |h| h.on_remote_track.clone()) {
                cb(remote);
            }
            Box::pin(async {})
        },
    ));

    // Weak: the connection owns this closure
    let s = slot.clone();
    let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| -> HandlerFuture {
        info!(state = %st, "peer connection state changed");
        let state = match st {
            RTCPeerConnectionState::New => TransportState::New,
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => return Box::pin(async {}),
        };
        if state.is_problem() {
            if let Some(pc) = weak_pc.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        if let Some(cb) = handler(&s, |h| h.on_state.clone()) {
            cb(state);
        }
        Box::pin(async {})
    }));
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    Ok(parsed?)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(NegotiationError::Transport(format!(
            "unexpected description type {other}"
        ))),
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    handlers: HandlerSlot,
}

impl RtcTransport {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sender = self
            .pc
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP has to be read for interceptors (NACK, reports) to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        debug!(track = track.id(), kind = ?track.kind(), "local track attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        from_rtc_description(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CandidateApplyError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| CandidateApplyError(e.to_string()))
    }

    fn clear_handlers(&self) {
        self.handlers.lock().take();
        self.pc
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| -> HandlerFuture {
                Box::pin(async {})
            }));
        self.pc.on_track(Box::new(
            |_: Arc<TrackRemote>,
             _: Arc<RTCRtpReceiver>,
             _: Arc<RTCRtpTransceiver>|
             -> HandlerFuture { Box::pin(async {}) },
        ));
        self.pc.on_peer_connection_state_change(Box::new(
            |_: RTCPeerConnectionState| -> HandlerFuture { Box::pin(async {}) },
        ));
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_ice_servers, IceServerKind};

    #[test]
    fn ice_servers_get_scheme_and_credentials() {
        let servers = vec![IceServerConfig {
            id: "relay".into(),
            kind: IceServerKind::Turn,
            url: "relay.example.org:3478".into(),
            username: Some("u".into()),
            credential: Some("p".into()),
        }];
        let rtc = to_rtc_ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(rtc[0].username, "u");
        assert_eq!(rtc[0].credential, "p");
    }

    #[test]
    fn config_uses_bundle_and_mux() {
        let cfg = rtc_config(&default_ice_servers(), 10);
        assert_eq!(cfg.ice_servers.len(), 2);
        assert_eq!(cfg.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(cfg.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
    }

    #[test]
    fn only_offer_and_answer_convert() {
        let mut pranswer = RTCSessionDescription::default();
        pranswer.sdp_type = RTCSdpType::Pranswer;
        pranswer.sdp = "v=0".into();
        assert!(from_rtc_description(pranswer).is_err());
    }
}
