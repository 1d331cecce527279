//! What the UI sees of a call.
//!
//! The orchestrator only writes through [`CallObserver`]; a UI reads the
//! [`CallStore`] snapshot or subscribes to its changes.

use crate::media::LocalMedia;
use crate::peer::types::RemoteStream;
use crate::session::CallState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Searching,
    PartnerLeft,
}

impl From<CallState> for ConnectionState {
    fn from(state: CallState) -> Self {
        match state {
            CallState::Idle | CallState::Ended => ConnectionState::Disconnected,
            CallState::Searching => ConnectionState::Searching,
            CallState::Negotiating => ConnectionState::Connecting,
            CallState::Connected => ConnectionState::Connected,
            CallState::PartnerLeft => ConnectionState::PartnerLeft,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A toast-style message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

pub trait CallObserver: Send + Sync {
    fn set_connection_state(&self, state: ConnectionState);
    fn set_local_stream(&self, stream: Option<Arc<LocalMedia>>);
    fn set_remote_stream(&self, stream: Option<RemoteStream>);
    fn set_partner_connected(&self, connected: bool);
    fn set_searching(&self, searching: bool);
    fn notice(&self, notice: Notice);

    fn set_muted(&self, _muted: bool) {}

    fn set_camera_on(&self, _on: bool) {}
}

#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub connection_state: ConnectionState,
    pub local_stream: Option<Arc<LocalMedia>>,
    pub remote_stream: Option<RemoteStream>,
    pub partner_connected: bool,
    pub searching: bool,
    pub is_muted: bool,
    pub camera_on: bool,
    pub last_notice: Option<Notice>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            local_stream: None,
            remote_stream: None,
            partner_connected: false,
            searching: false,
            is_muted: false,
            camera_on: true,
            last_notice: None,
        }
    }
}

/// `watch`-backed store; every setter notifies subscribers.
#[derive(Debug)]
pub struct CallStore {
    tx: watch::Sender<CallSnapshot>,
}

impl Default for CallStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CallSnapshot::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.tx.subscribe()
    }

}

impl CallObserver for CallStore {
    fn set_connection_state(&self, state: ConnectionState) {
        self.tx.send_modify(|s| s.connection_state = state);
    }

    fn set_local_stream(&self, stream: Option<Arc<LocalMedia>>) {
        self.tx.send_modify(|s| s.local_stream = stream);
    }

    fn set_remote_stream(&self, stream: Option<RemoteStream>) {
        self.tx.send_modify(|s| s.remote_stream = stream);
    }

    fn set_partner_connected(&self, connected: bool) {
        self.tx.send_modify(|s| s.partner_connected = connected);
    }

    fn set_searching(&self, searching: bool) {
        self.tx.send_modify(|s| s.searching = searching);
    }

    fn notice(&self, notice: Notice) {
        self.tx.send_modify(|s| s.last_notice = Some(notice));
    }

    fn set_muted(&self, muted: bool) {
        self.tx.send_modify(|s| s.is_muted = muted);
    }

    fn set_camera_on(&self, on: bool) {
        self.tx.send_modify(|s| s.camera_on = on);
    }
}
