// Client configuration.
// Every field has a default: an empty or missing file gives a working client.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // on in debug builds

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // off in release unless enabled in the config

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3000";

/// How long a dropped connection may recover before it is reported lost.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<IceServerConfig>,
    pub call: CallConfig,
    pub media: MediaConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub reconnect_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.into(),
            reconnect_delay_ms: 2000,
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// One ICE server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::InvalidIceServer {
                id: self.id.clone(),
                reason: "url cannot be empty".into(),
            });
        }
        if self.kind == IceServerKind::Turn
            && (self.username.is_none() || self.credential.is_none())
        {
            return Err(ConfigError::InvalidIceServer {
                id: self.id.clone(),
                reason: "TURN servers require username and credential".into(),
            });
        }
        Ok(())
    }
}

/// Public STUN servers used when none are configured.
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            id: "default-stun".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        IceServerConfig {
            id: "default-stun-1".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Go back to matchmaking on `partner-left` without waiting for the user.
    pub auto_rejoin: bool,
    pub grace_period_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            auto_rejoin: false,
            grace_period_secs: GRACE_PERIOD.as_secs(),
        }
    }
}

impl CallConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
    pub start_muted: bool,
    pub start_camera_off: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            start_muted: false,
            start_camera_off: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            level: "info".into(),
            json: false,
        }
    }
}

impl Config {
    /// Reads the TOML file (if any), then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("PAIRLINE_SIGNALING_URL") {
            if !url.is_empty() {
                self.signaling.url = url;
            }
        }
        if let Ok(v) = std::env::var("PAIRLINE_AUTO_REJOIN") {
            self.call.auto_rejoin = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ice_servers.iter().try_for_each(IceServerConfig::validate)
    }

    /// Configured servers, or the defaults when the list is empty.
    pub fn effective_ice_servers(&self) -> Vec<IceServerConfig> {
        if self.ice_servers.is_empty() {
            default_ice_servers()
        } else {
            self.ice_servers.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.signaling.url, DEFAULT_SIGNALING_URL);
        assert_eq!(cfg.call.grace_period(), GRACE_PERIOD);
        assert!(!cfg.call.auto_rejoin);
        assert!(cfg.media.audio && cfg.media.video);
        assert_eq!(cfg.effective_ice_servers().len(), 2);
    }

    #[test]
    fn parses_ice_servers() {
        let cfg = Config::from_toml_str(
            r#"
            [signaling]
            url = "wss://match.example.org/ws"

            [[ice_servers]]
            id = "relay"
            type = "turn"
            url = "relay.example.org:3478"
            username = "u"
            credential = "p"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.signaling.url, "wss://match.example.org/ws");
        assert_eq!(cfg.signaling.reconnect_delay_ms, 2000);
        assert_eq!(cfg.ice_servers[0].kind, IceServerKind::Turn);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.effective_ice_servers().len(), 1);
    }

    #[test]
    fn turn_without_credentials_rejected() {
        let server = IceServerConfig {
            id: "relay".into(),
            kind: IceServerKind::Turn,
            url: "relay.example.org".into(),
            username: Some("u".into()),
            credential: None,
        };
        assert!(matches!(
            server.validate(),
            Err(ConfigError::InvalidIceServer { .. })
        ));
    }

    #[test]
    fn empty_url_rejected() {
        let server = IceServerConfig {
            id: "x".into(),
            kind: IceServerKind::Stun,
            url: "  ".into(),
            username: None,
            credential: None,
        };
        assert!(server.validate().is_err());
    }
}
