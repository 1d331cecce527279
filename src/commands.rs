use crate::orchestrator::CallEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Local user actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    Start,
    Skip,
    End,
    Rejoin,
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    Shutdown,
}

/// Cloneable sender of [`CallCommand`]s into a running orchestrator.
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl CallHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the orchestrator has stopped.
    pub fn send(&self, command: CallCommand) -> bool {
        let ok = self.tx.send(CallEvent::Command(command)).is_ok();
        if !ok {
            debug!(?command, "orchestrator gone, command dropped");
        }
        ok
    }

    pub fn start(&self) -> bool {
        self.send(CallCommand::Start)
    }

    pub fn skip(&self) -> bool {
        self.send(CallCommand::Skip)
    }

    pub fn end(&self) -> bool {
        self.send(CallCommand::End)
    }

    pub fn rejoin(&self) -> bool {
        self.send(CallCommand::Rejoin)
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.send(CallCommand::SetAudioEnabled(enabled))
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.send(CallCommand::SetVideoEnabled(enabled))
    }

    pub fn shutdown(&self) -> bool {
        self.send(CallCommand::Shutdown)
    }
}

/// Parses one line of the interactive client.
pub fn parse_command(line: &str) -> Option<CallCommand> {
    let mut words = line.split_whitespace();
    let cmd = match (words.next()?, words.next()) {
        ("start", None) => CallCommand::Start,
        ("skip" | "next", None) => CallCommand::Skip,
        ("end", None) => CallCommand::End,
        ("rejoin", None) => CallCommand::Rejoin,
        ("mute", None) => CallCommand::SetAudioEnabled(false),
        ("unmute", None) => CallCommand::SetAudioEnabled(true),
        ("camera", Some("on")) => CallCommand::SetVideoEnabled(true),
        ("camera", Some("off")) => CallCommand::SetVideoEnabled(false),
        ("quit" | "exit", None) => CallCommand::Shutdown,
        _ => return None,
    };
    words.next().is_none().then_some(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_command("skip"), Some(CallCommand::Skip));
        assert_eq!(parse_command("  mute "), Some(CallCommand::SetAudioEnabled(false)));
        assert_eq!(parse_command("camera off"), Some(CallCommand::SetVideoEnabled(false)));
        assert_eq!(parse_command("quit"), Some(CallCommand::Shutdown));
    }

    #[test]
    fn rejects_unknown_or_extra_words() {
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("camera"), None);
        assert_eq!(parse_command("skip now"), None);
        assert_eq!(parse_command("camera off please"), None);
        assert_eq!(parse_command("dance"), None);
    }

    #[tokio::test]
    async fn handle_reports_closed_orchestrator() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CallHandle::new(tx);
        assert!(handle.skip());
        drop(rx);
        assert!(!handle.end());
    }
}
