use crate::config::LogConfig;
use crate::peer::types::IceCandidate;
use tracing::{debug, info};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, EnvFilter};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

pub const LOG_ENV: &str = "PAIRLINE_LOG";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global subscriber. Returns false when logging is disabled
/// or a subscriber is already installed.
pub fn init(config: &LogConfig) -> bool {
    if !config.enabled {
        return false;
    }
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let timer = ChronoLocal::new(TIMESTAMP_FORMAT.to_string());

    let installed = if config.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(timer)
            .with_current_span(true)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_timer(timer)
            .with_target(true)
            .try_init()
    };
    installed.is_ok()
}

/// Logs a trickled ICE candidate as it appears.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        label,
        kind = %cand.kind(),
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}

/// Quick `get_stats()` snapshot of the nominated candidate pair.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logging_installs_nothing() {
        let cfg = LogConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!init(&cfg));
    }
}
