//! Call session state machine.
//!
//! Everything that can change a call (signaling events, user commands,
//! transport callbacks, timers) is funnelled into one queue and handled
//! one event at a time. Negotiation steps are awaited inside the handler,
//! so a step always sees the state left by the previous one.
//!
//! ```text
//! Idle ──start──▶ Searching ──matched──▶ Negotiating ──remote track──▶ Connected
//!                    ▲                        │  │                         │
//!                    └──────── skip ──────────┘  └──── partner-left ───────┴──▶ PartnerLeft
//! ```

use crate::commands::{CallCommand, CallHandle};
use crate::config::{CallConfig, Config, IceServerConfig};
use crate::error::{MediaAccessError, NegotiationError};
use crate::media::MediaCapability;
use crate::peer::session::{PeerEvent, PeerEventSink, PeerSession};
use crate::peer::transport::TransportFactory;
use crate::peer::types::{
    AnswerPayload, CandidatePayload, LinkUp, Matched, OfferPayload, RoomPayload, TransportState,
};
use crate::session::{CallState, Role, RoomId, Session};
use crate::signaling::{events, HandlerId, SignalingChannel};
use crate::store::{CallObserver, Notice, NoticeLevel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Inbound signaling, already decoded.
#[derive(Debug, Clone)]
pub enum Inbound {
    Matched(Matched),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(CandidatePayload),
    PartnerLeft(RoomPayload),
    LinkUp(LinkUp),
}

#[derive(Debug)]
pub enum CallEvent {
    Signal(Inbound),
    Command(CallCommand),
    Peer(PeerEvent),
    GraceExpired { room_id: RoomId },
}

pub struct Orchestrator {
    channel: Arc<SignalingChannel>,
    media: Arc<MediaCapability>,
    transports: Arc<dyn TransportFactory>,
    observer: Arc<dyn CallObserver>,
    ice_servers: Vec<IceServerConfig>,
    call: CallConfig,
    session: Session,
    peer: Option<PeerSession>,
    grace: Option<JoinHandle<()>>,
    /// Link generation the last successful `join` went out on.
    joined_on: Option<u64>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    events_rx: mpsc::UnboundedReceiver<CallEvent>,
    subscriptions: Vec<(&'static str, HandlerId)>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        channel: Arc<SignalingChannel>,
        media: Arc<MediaCapability>,
        transports: Arc<dyn TransportFactory>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            media,
            transports,
            observer,
            ice_servers: config.effective_ice_servers(),
            call: config.call.clone(),
            session: Session::default(),
            peer: None,
            grace: None,
            joined_on: None,
            events_tx,
            events_rx,
            subscriptions: Vec::new(),
        }
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle::new(self.events_tx.clone())
    }

    pub fn state(&self) -> CallState {
        self.session.state
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.session.room_id.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.session.role
    }

    pub fn peer(&self) -> Option<&PeerSession> {
        self.peer.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    // ========== CHANNEL SUBSCRIPTIONS ==========

    /// Registers one handler per inbound event. Calling it twice is a no-op.
    pub fn attach(&mut self) {
        if self.is_attached() {
            return;
        }
        self.subscribe(events::MATCHED, Inbound::Matched);
        self.subscribe(events::OFFER, Inbound::Offer);
        self.subscribe(events::ANSWER, Inbound::Answer);
        self.subscribe(events::ICE_CANDIDATE, Inbound::IceCandidate);
        self.subscribe(events::PARTNER_LEFT, Inbound::PartnerLeft);
        self.subscribe(events::CONNECT, Inbound::LinkUp);
        debug!(handlers = self.subscriptions.len(), "orchestrator attached to signaling");
    }

    /// Removes exactly the handlers `attach` registered.
    pub fn detach(&mut self) {
        for (event, id) in self.subscriptions.drain(..) {
            self.channel.off(event, id);
        }
    }

    fn subscribe<T, F>(&mut self, event: &'static str, wrap: F)
    where
        T: DeserializeOwned,
        F: Fn(T) -> Inbound + Send + Sync + 'static,
    {
        let tx = self.events_tx.clone();
        let id = self.channel.on(
            event,
            Arc::new(move |payload: &Value| {
                // payload-less events decode as an empty object
                let value = if payload.is_null() {
                    Value::Object(Default::default())
                } else {
                    payload.clone()
                };
                match serde_json::from_value::<T>(value) {
                    Ok(decoded) => {
                        let _ = tx.send(CallEvent::Signal(wrap(decoded)));
                    }
                    Err(e) => warn!(event, error = %e, "malformed signaling payload dropped"),
                }
            }),
        );
        self.subscriptions.push((event, id));
    }

    // ========== EVENT LOOP ==========

    /// Handles events until a `Shutdown` command, then detaches.
    pub async fn run(mut self) {
        info!("orchestrator running");
        while let Some(event) = self.events_rx.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        self.detach();
        info!("orchestrator stopped");
    }

    /// Handles everything queued right now. Returns the number of events handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            handled += 1;
            if !self.handle_event(event).await {
                break;
            }
        }
        handled
    }

    /// Returns false after a shutdown.
    pub async fn handle_event(&mut self, event: CallEvent) -> bool {
        match event {
            CallEvent::Signal(inbound) => self.on_signal(inbound).await,
            CallEvent::Peer(ev) => self.on_peer_event(ev),
            CallEvent::GraceExpired { room_id } => self.on_grace_expired(room_id),
            CallEvent::Command(cmd) => match cmd {
                CallCommand::Start => {
                    // already surfaced as a notice
                    let _ = self.start().await;
                }
                CallCommand::Skip => self.skip().await,
                CallCommand::End => self.end().await,
                CallCommand::Rejoin => self.rejoin(),
                CallCommand::SetAudioEnabled(on) => self.set_audio_enabled(on),
                CallCommand::SetVideoEnabled(on) => self.set_video_enabled(on),
                CallCommand::Shutdown => {
                    self.shutdown().await;
                    return false;
                }
            },
        }
        true
    }

    async fn on_signal(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Matched(m) => self.on_matched(m).await,
            Inbound::Offer(p) => self.on_offer(p).await,
            Inbound::Answer(p) => self.on_answer(p).await,
            Inbound::IceCandidate(p) => self.on_ice_candidate(p).await,
            Inbound::PartnerLeft(p) => self.on_partner_left(p).await,
            Inbound::LinkUp(l) => self.on_link_up(l),
        }
    }

    // ========== LOCAL ACTIONS ==========

    /// Acquires local media and enters matchmaking.
    pub async fn start(&mut self) -> Result<(), MediaAccessError> {
        if !matches!(self.session.state, CallState::Idle | CallState::Ended) {
            debug!(state = ?self.session.state, "start ignored, call already running");
            return Ok(());
        }
        let media = match self.media.acquire().await {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "error accessing media devices");
                self.observer.notice(Notice::new(
                    NoticeLevel::Error,
                    "Could not access camera and microphone.",
                ));
                return Err(e);
            }
        };
        self.observer.set_local_stream(Some(media));
        self.observer.set_muted(!self.media.audio_enabled());
        self.observer.set_camera_on(self.media.video_enabled());
        self.enter_searching();
        Ok(())
    }

    /// Leaves the current room (if any) and asks for a new partner.
    pub async fn skip(&mut self) {
        if matches!(self.session.state, CallState::Idle | CallState::Ended) {
            debug!("skip ignored, no call running");
            return;
        }
        self.teardown_peer().await;
        let vacated = self.session.vacate(CallState::Searching);
        info!(room = ?vacated, "skipping partner");
        self.send(events::SKIP, &RoomPayload { room_id: vacated });
        self.enter_searching();
    }

    /// Hangs up for good: closes the peer, releases local media.
    pub async fn end(&mut self) {
        if matches!(self.session.state, CallState::Idle | CallState::Ended) && self.media.current().is_none() {
            debug!("end ignored, no call running");
            return;
        }
        self.teardown_peer().await;
        let vacated = self.session.vacate(CallState::Idle);
        self.media.release();
        self.send(events::END, &RoomPayload { room_id: vacated });

        self.observer.set_local_stream(None);
        self.observer.set_searching(false);
        self.set_state(CallState::Idle);
        info!("call ended");
    }

    /// User-triggered return to matchmaking after the partner left.
    pub fn rejoin(&mut self) {
        if self.session.state != CallState::PartnerLeft {
            debug!(state = ?self.session.state, "rejoin ignored");
            return;
        }
        self.enter_searching();
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.media.set_audio_enabled(enabled);
        self.observer.set_muted(!enabled);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.media.set_video_enabled(enabled);
        self.observer.set_camera_on(enabled);
    }

    async fn shutdown(&mut self) {
        self.end().await;
        self.detach();
        self.session.state = CallState::Ended;
    }

    // ========== SIGNALING ==========

    async fn on_matched(&mut self, m: Matched) {
        if matches!(self.session.state, CallState::Idle | CallState::Ended) {
            debug!(room = %m.room_id, "matched while idle, ignoring");
            return;
        }
        let Some(local) = self.media.current() else {
            warn!(room = %m.room_id, "matched without local media, ignoring");
            return;
        };

        // at most one live peer connection
        self.teardown_peer().await;

        let role = Role::from_initiator(m.initiator);
        info!(room = %m.room_id, ?role, "matched");
        self.session.assign(m.room_id.clone(), role);
        self.set_state(CallState::Negotiating);
        self.observer.set_searching(false);

        let sink: PeerEventSink = {
            let tx = self.events_tx.clone();
            Arc::new(move |ev: PeerEvent| {
                let _ = tx.send(CallEvent::Peer(ev));
            })
        };
        let created = PeerSession::create(
            m.room_id.clone(),
            role,
            &local,
            self.transports.as_ref(),
            &self.ice_servers,
            self.channel.clone(),
            sink,
        )
        .await;
        let peer = match created {
            Ok(p) => self.peer.insert(p),
            Err(e) => {
                self.report_negotiation("create peer session", &e);
                return;
            }
        };

        if role == Role::Initiator {
            match peer.create_offer().await {
                Ok(offer) => self.send(
                    events::OFFER,
                    &OfferPayload {
                        room_id: m.room_id,
                        offer,
                    },
                ),
                Err(e) => self.report_negotiation("create offer", &e),
            }
        }
    }

    /// The live peer for `room`, or None (with a log line) if `room` is stale.
    fn peer_for(&mut self, room: &RoomId, event: &str) -> Option<&mut PeerSession> {
        if self.session.room_id.is_none() {
            debug!(event, %room, "no active room, dropped");
            return None;
        }
        if !self.session.is_current(room) {
            debug!(event, %room, "stale room, dropped");
            return None;
        }
        if self.peer.is_none() {
            debug!(event, %room, "no peer session, dropped");
        }
        self.peer.as_mut()
    }

    async fn on_offer(&mut self, p: OfferPayload) {
        let Some(peer) = self.peer_for(&p.room_id, events::OFFER) else {
            return;
        };
        match peer.accept_offer(p.offer).await {
            Ok(answer) => self.send(
                events::ANSWER,
                &AnswerPayload {
                    room_id: p.room_id,
                    answer,
                },
            ),
            Err(e) => self.report_negotiation("accept offer", &e),
        }
    }

    async fn on_answer(&mut self, p: AnswerPayload) {
        let Some(peer) = self.peer_for(&p.room_id, events::ANSWER) else {
            return;
        };
        if let Err(e) = peer.accept_answer(p.answer).await {
            self.report_negotiation("accept answer", &e);
        }
    }

    async fn on_ice_candidate(&mut self, p: CandidatePayload) {
        let Some(peer) = self.peer_for(&p.room_id, events::ICE_CANDIDATE) else {
            return;
        };
        if let Err(e) = peer.add_remote_candidate(p.candidate).await {
            warn!(room = %p.room_id, error = %e, "remote candidate skipped");
        }
    }

    async fn on_partner_left(&mut self, p: RoomPayload) {
        let Some(current) = self.session.room_id.clone() else {
            debug!("partner-left without active room, ignoring");
            return;
        };
        if let Some(room) = &p.room_id {
            if *room != current {
                debug!(%room, "partner-left for stale room, ignoring");
                return;
            }
        }
        info!(room = %current, "partner left");
        self.teardown_peer().await;
        self.session.vacate(CallState::PartnerLeft);
        self.set_state(CallState::PartnerLeft);
        self.observer
            .notice(Notice::new(NoticeLevel::Info, "Your partner left the chat."));

        if self.call.auto_rejoin {
            self.enter_searching();
        }
    }

    /// A fresh link knows nothing of an earlier `join`.
    fn on_link_up(&mut self, link: LinkUp) {
        if self.session.state != CallState::Searching {
            return;
        }
        if self.joined_on == Some(link.generation) {
            debug!(generation = link.generation, "join already sent on this link");
            return;
        }
        info!(generation = link.generation, "signaling link up, re-requesting a partner");
        self.request_match();
    }

    // ========== PEER CALLBACKS ==========

    fn on_peer_event(&mut self, ev: PeerEvent) {
        if !self.session.is_current(ev.room_id()) {
            debug!(room = %ev.room_id(), "event from a closed peer session, dropped");
            return;
        }
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        match ev {
            PeerEvent::RemoteTrack { track, .. } => {
                debug!(track = %track.id, kind = ?track.kind, "remote track");
                let first = peer.on_remote_track(track);
                self.observer.set_remote_stream(peer.remote_stream().cloned());
                if first && self.session.state == CallState::Negotiating {
                    self.set_state(CallState::Connected);
                    self.observer.set_partner_connected(true);
                }
            }
            PeerEvent::StateChanged { room_id, state } => {
                peer.set_transport_state(state);
                if state.is_problem() {
                    if self.grace.is_some() {
                        debug!("grace period already running");
                        return;
                    }
                    self.observer.notice(Notice::new(
                        NoticeLevel::Warning,
                        "Connection problem, trying to recover...",
                    ));
                    let tx = self.events_tx.clone();
                    let delay = self.call.grace_period();
                    debug!(secs = delay.as_secs(), "grace period started");
                    self.grace = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(CallEvent::GraceExpired { room_id });
                    }));
                } else if state == TransportState::Connected {
                    if let Some(h) = self.grace.take() {
                        h.abort();
                        self.observer
                            .notice(Notice::new(NoticeLevel::Info, "Connection recovered."));
                    }
                }
            }
        }
    }

    fn on_grace_expired(&mut self, room_id: RoomId) {
        if !self.session.is_current(&room_id) {
            return;
        }
        self.grace = None;
        let recovered = self
            .peer
            .as_ref()
            .is_some_and(|p| p.transport_state() == TransportState::Connected);
        if recovered {
            debug!(room = %room_id, "connection recovered during grace period");
            return;
        }
        warn!(room = %room_id, "connection not recovered");
        self.observer.notice(Notice::new(
            NoticeLevel::Error,
            "Connection lost. Skip to find a new partner.",
        ));
    }

    // ========== HELPERS ==========

    fn enter_searching(&mut self) {
        self.set_state(CallState::Searching);
        self.observer.set_searching(true);
        self.observer.set_partner_connected(false);
        self.request_match();
    }

    fn request_match(&mut self) {
        match self.channel.emit_empty(events::JOIN) {
            Ok(()) => self.joined_on = Some(self.channel.generation()),
            Err(e) => {
                self.joined_on = None;
                debug!(error = %e, "join not sent, waiting for the link");
            }
        }
    }

    async fn teardown_peer(&mut self) {
        if let Some(h) = self.grace.take() {
            h.abort();
        }
        if let Some(mut peer) = self.peer.take() {
            peer.teardown().await;
            self.observer.set_remote_stream(None);
            self.observer.set_partner_connected(false);
        }
    }

    fn set_state(&mut self, state: CallState) {
        if self.session.state != state {
            debug!(from = ?self.session.state, to = ?state, "call state");
        }
        self.session.state = state;
        self.observer.set_connection_state(state.into());
    }

    fn send<T: Serialize>(&self, event: &str, payload: &T) {
        if let Err(e) = self.channel.emit(event, payload) {
            debug!(error = %e, "outbound event dropped");
        }
    }

    fn report_negotiation(&self, step: &str, e: &NegotiationError) {
        warn!(step, error = %e, room = ?self.session.room_id, "negotiation failed");
        self.observer.notice(Notice::new(
            NoticeLevel::Warning,
            format!("Could not connect to partner ({step}). Skip to try again."),
        ));
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.detach();
        if let Some(h) = self.grace.take() {
            h.abort();
        }
    }
}
