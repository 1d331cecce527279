//! Process-wide signaling channel to the matchmaking server.
//!
//! Frames are JSON text messages `{"event": "...", "data": ...}` over a
//! websocket. The socket task reconnects forever; while it is down every
//! outbound event is dropped, never queued. Each time a link comes up the
//! channel dispatches a local [`events::CONNECT`] so subscribers can
//! re-request whatever the server forgot.

use crate::config::SignalingConfig;
use crate::error::ChannelUnavailable;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

pub mod events {
    /// Local only: a link came up. Payload `{"generation": n}`.
    pub const CONNECT: &str = "connect";
    pub const JOIN: &str = "join";
    pub const MATCHED: &str = "matched";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    pub const SKIP: &str = "skip";
    pub const END: &str = "end";
    pub const PARTNER_LEFT: &str = "partner-left";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Link {
    outbound: mpsc::UnboundedSender<Envelope>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    fn is_alive(&self) -> bool {
        match &self.task {
            Some(task) => !task.is_finished(),
            None => !self.outbound.is_closed(),
        }
    }
}

pub struct SignalingChannel {
    config: SignalingConfig,
    link: Mutex<Option<Link>>,
    connected: Arc<AtomicBool>,
    generation: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_handler: AtomicU64,
}

static GLOBAL: OnceCell<Arc<SignalingChannel>> = OnceCell::new();

impl SignalingChannel {
    pub fn new(config: SignalingConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            link: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
        })
    }

    /// The shared instance. `config` only matters on the first call.
    pub fn global(config: &SignalingConfig) -> Arc<Self> {
        GLOBAL.get_or_init(|| Self::new(config.clone())).clone()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Starts the websocket task. A no-op while a link is already alive.
    pub fn connect(self: &Arc<Self>) {
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(Link::is_alive) {
            trace!("signaling already connected, reusing");
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(
            Arc::downgrade(self),
            self.config.url.clone(),
            self.config.reconnect_delay(),
            self.connected.clone(),
            rx,
        ));
        *link = Some(Link {
            outbound: tx,
            task: Some(task),
        });
        info!(url = %self.config.url, "signaling connect started");
    }

    /// Uses `sink` as the outbound transport instead of a websocket.
    /// Inbound traffic is fed through [`SignalingChannel::dispatch`].
    pub fn connect_with_sink(&self, sink: mpsc::UnboundedSender<Envelope>) {
        let mut link = self.link.lock();
        if let Some(Link { task: Some(task), .. }) = link.take() {
            task.abort();
        }
        *link = Some(Link {
            outbound: sink,
            task: None,
        });
        drop(link);
        self.announce_connected();
    }

    /// Counts links that came up; 0 before the first one.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn announce_connected(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.connected.store(true, Ordering::Release);
        debug!(generation, "signaling link up");
        self.dispatch(events::CONNECT, &serde_json::json!({ "generation": generation }));
        generation
    }

    pub fn disconnect(&self) {
        if let Some(Link { task: Some(task), .. }) = self.link.lock().take() {
            task.abort();
        }
        self.connected.store(false, Ordering::Release);
        info!("signaling disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Fire-and-forget send.
    pub fn emit<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), ChannelUnavailable> {
        let data = serde_json::to_value(payload).unwrap_or_else(|e| {
            warn!(event, error = %e, "payload not serializable, sending null");
            Value::Null
        });
        self.send(Envelope {
            event: event.to_string(),
            data,
        })
    }

    pub fn emit_empty(&self, event: &str) -> Result<(), ChannelUnavailable> {
        self.send(Envelope {
            event: event.to_string(),
            data: Value::Null,
        })
    }

    fn send(&self, envelope: Envelope) -> Result<(), ChannelUnavailable> {
        let unavailable = || ChannelUnavailable {
            event: envelope.event.clone(),
        };
        if !self.is_connected() {
            return Err(unavailable());
        }
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(unavailable());
        };
        trace!(event = %envelope.event, "signaling emit");
        let event = envelope.event.clone();
        link.outbound
            .send(envelope)
            .map_err(|_| ChannelUnavailable { event })
    }

    pub fn on(&self, event: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Removes exactly the registration `id`. Returns false if it was not found.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, Vec::len)
    }

    /// Delivers an inbound event to its handlers, in registration order.
    pub fn dispatch(&self, event: &str, payload: &Value) {
        let targets: Vec<Handler> = self
            .handlers
            .lock()
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        if targets.is_empty() {
            debug!(event, "no handler for inbound event");
            return;
        }
        for h in targets {
            h(payload);
        }
    }
}

async fn run_socket(
    channel: Weak<SignalingChannel>,
    url: String,
    reconnect_delay: Duration,
    connected: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(%url, "signaling websocket connected");
                let Some(ch) = channel.upgrade() else { return };
                ch.announce_connected();
                drop(ch);
                let (mut write, mut read) = ws.split();

                loop {
                    tokio::select! {
                        out = outbound.recv() => {
                            let Some(envelope) = out else {
                                // channel dropped
                                connected.store(false, Ordering::Release);
                                let _ = write.close().await;
                                return;
                            };
                            let text = match serde_json::to_string(&envelope) {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(error = %e, "cannot encode envelope");
                                    continue;
                                }
                            };
                            if let Err(e) = write.send(Message::text(text)).await {
                                warn!(error = %e, "signaling write failed");
                                break;
                            }
                        }
                        incoming = read.next() => {
                            match incoming {
                                Some(Ok(Message::Close(_))) | None => {
                                    info!("signaling websocket closed by server");
                                    break;
                                }
                                Some(Ok(msg)) if msg.is_text() => {
                                    let Ok(text) = msg.to_text() else { continue };
                                    match serde_json::from_str::<Envelope>(text) {
                                        Ok(envelope) => {
                                            let Some(ch) = channel.upgrade() else { return };
                                            ch.dispatch(&envelope.event, &envelope.data);
                                        }
                                        Err(e) => warn!(error = %e, "malformed signaling frame"),
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "signaling read failed");
                                    break;
                                }
                            }
                        }
                    }
                }
                connected.store(false, Ordering::Release);
            }
            Err(e) => warn!(%url, error = %e, "signaling connect failed"),
        }

        // nothing sent while down survives the reconnect
        while outbound.try_recv().is_ok() {}
        if channel.strong_count() == 0 {
            return;
        }
        debug!(delay_ms = reconnect_delay.as_millis() as u64, "signaling reconnect scheduled");
        tokio::time::sleep(reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn channel() -> Arc<SignalingChannel> {
        SignalingChannel::new(SignalingConfig::default())
    }

    #[test]
    fn emit_without_link_is_unavailable() {
        let ch = channel();
        let err = ch.emit_empty(events::JOIN).unwrap_err();
        assert_eq!(err.event, "join");
    }

    #[test]
    fn sink_receives_envelopes() {
        let ch = channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.connect_with_sink(tx);
        ch.emit(events::SKIP, &json!({"roomId": "r1"})).unwrap();
        let env = rx.try_recv().unwrap();
        assert_eq!(env.event, "skip");
        assert_eq!(env.data, json!({"roomId": "r1"}));
    }

    #[test]
    fn dropped_sink_is_unavailable() {
        let ch = channel();
        let (tx, rx) = mpsc::unbounded_channel();
        ch.connect_with_sink(tx);
        drop(rx);
        assert!(ch.emit_empty(events::JOIN).is_err());
    }

    #[test]
    fn every_link_is_announced() {
        let ch = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        ch.on(events::CONNECT, Arc::new(move |v: &Value| s.lock().push(v["generation"].as_u64())));
        assert_eq!(ch.generation(), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        ch.connect_with_sink(tx);
        ch.disconnect();
        let (tx, _rx2) = mpsc::unbounded_channel();
        ch.connect_with_sink(tx);

        assert_eq!(ch.generation(), 2);
        assert_eq!(*seen.lock(), vec![Some(1), Some(2)]);
    }

    #[test]
    fn on_off_is_symmetric() {
        let ch = channel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = ch.on(events::MATCHED, Arc::new(move |_: &Value| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        ch.dispatch(events::MATCHED, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(ch.off(events::MATCHED, id));
        assert!(!ch.off(events::MATCHED, id));
        assert_eq!(ch.handler_count(events::MATCHED), 0);
        ch.dispatch(events::MATCHED, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let ch = channel();
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let (c, s) = (ch.clone(), slot.clone());
        let id = ch.on(events::OFFER, Arc::new(move |_: &Value| {
            if let Some(id) = *s.lock() {
                c.off(events::OFFER, id);
            }
        }));
        *slot.lock() = Some(id);
        ch.dispatch(events::OFFER, &Value::Null);
        assert_eq!(ch.handler_count(events::OFFER), 0);
    }

    #[tokio::test]
    async fn websocket_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::text(
                json!({"event": "matched", "data": {"roomId": "r9", "initiator": false}}).to_string(),
            ))
            .await
            .unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(msg)) if msg.is_text() => {
                        return serde_json::from_str::<Envelope>(msg.to_text().unwrap()).unwrap();
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        });

        let ch = SignalingChannel::new(SignalingConfig {
            url: format!("ws://{addr}"),
            reconnect_delay_ms: 50,
        });
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        ch.on(events::MATCHED, Arc::new(move |v: &Value| {
            let _ = seen_tx.send(v.clone());
        }));
        ch.connect();
        ch.connect();

        let matched = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(matched["roomId"], "r9");
        assert!(ch.is_connected());

        ch.emit_empty(events::JOIN).unwrap();
        let received = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(received.event, "join");
        assert_eq!(received.data, Value::Null);
        ch.disconnect();
    }
}
