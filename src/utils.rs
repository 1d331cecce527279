use crate::config::{IceServerConfig, IceServerKind};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Prefixes `stun:` / `turn:` when the configured url has no scheme.
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
        || config.url.starts_with("stuns:")
    {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: IceServerKind, url: &str) -> IceServerConfig {
        IceServerConfig {
            id: "t".into(),
            kind,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn scheme_added_by_kind() {
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Stun, "stun.example.org:3478")),
            "stun:stun.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Turn, "relay.example.org:3478")),
            "turn:relay.example.org:3478"
        );
    }

    #[test]
    fn existing_scheme_kept() {
        // a stun url configured as turn keeps its own scheme
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Turn, "stun:stun1.l.google.com:19302")),
            "stun:stun1.l.google.com:19302"
        );
    }

    #[test]
    fn random_ids_are_hex() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }
}
