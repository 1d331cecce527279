pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;

pub use commands::{parse_command, CallCommand, CallHandle};
pub use config::Config;
pub use error::{Error, Result};
pub use media::{LocalMedia, MediaCapability, MediaSource, SampleSource};
pub use orchestrator::Orchestrator;
pub use session::{CallState, Role, RoomId};
pub use signaling::SignalingChannel;
pub use store::{CallObserver, CallStore, ConnectionState};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "PAIRLINE_CONFIG";

/// Headless client: joins matchmaking right away and reads commands
/// (`skip`, `end`, `mute`, `camera off`, `quit`, ...) from stdin.
pub async fn run() -> Result<()> {
    let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    logger::init(&config.log);
    info!(signaling = %config.signaling.url, ice_servers = config.effective_ice_servers().len(), "pairline starting");

    let channel = SignalingChannel::global(&config.signaling);
    channel.connect();

    let store = Arc::new(CallStore::new());
    let media = Arc::new(MediaCapability::new(Arc::new(SampleSource), &config.media));
    let transports = Arc::new(peer::RtcTransportFactory::default());

    let mut orchestrator =
        Orchestrator::new(&config, channel.clone(), media, transports, store.clone());
    orchestrator.attach();
    let handle = orchestrator.handle();
    let call = tokio::spawn(orchestrator.run());

    let mut updates = store.subscribe();
    tokio::spawn(async move {
        let mut last = None;
        let mut last_notice: Option<store::Notice> = None;
        while updates.changed().await.is_ok() {
            let snap = updates.borrow_and_update().clone();
            if last != Some(snap.connection_state) {
                info!(state = ?snap.connection_state, partner = snap.partner_connected, "call status");
                last = Some(snap.connection_state);
            }
            if snap.last_notice.is_some() && snap.last_notice != last_notice {
                if let Some(n) = &snap.last_notice {
                    info!(level = ?n.level, "{}", n.message);
                }
                last_notice = snap.last_notice;
            }
        }
    });

    handle.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(CallCommand::Shutdown) => break,
            Some(cmd) => {
                if !handle.send(cmd) {
                    break;
                }
            }
            None => warn!(input = %line.trim(), "unknown command"),
        }
    }

    handle.shutdown();
    if let Err(e) = call.await {
        warn!(error = %e, "orchestrator task failed");
    }
    channel.disconnect();
    info!("pairline stopped");
    Ok(())
}
