//! Control-channel wire protocol
//!
//! Frames are plain text. Inbound frames are either one of the literal
//! tokens `ready`, `restart` and `delete`, or a path ending in a playable
//! audio extension. Outbound, `speech_start` announces a capture and
//! `speech_end` is immediately followed by a second frame carrying the
//! artifact path.

use std::path::PathBuf;

/// Audio extensions accepted as playable artifacts
pub const ARTIFACT_EXTENSIONS: &[&str] = &["wav", "mp3"];

/// Outbound token announcing a capture has begun
pub const SPEECH_START: &str = "speech_start";

/// Outbound token announcing a capture has finished
pub const SPEECH_END: &str = "speech_end";

/// Message exchanged with the speech service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Peer finished initializing
    Ready,
    /// An artifact is ready to play
    ArtifactAvailable(PathBuf),
    /// Permit and resume playback
    Restart,
    /// Cancel all queued and playing artifacts
    Delete,
    /// A capture segment has begun
    SpeechStarted,
    /// A capture segment finished and was written to the path
    SpeechEnded(PathBuf),
}

impl ControlMessage {
    /// Classify an inbound frame
    ///
    /// Returns `None` for frames this side does not understand, so newer
    /// peers can add frames without breaking older coordinators.
    #[must_use]
    pub fn parse(frame: &str) -> Option<Self> {
        let frame = frame.trim();

        match frame {
            "ready" => return Some(Self::Ready),
            "restart" => return Some(Self::Restart),
            "delete" => return Some(Self::Delete),
            _ => {}
        }

        is_artifact_path(frame).then(|| Self::ArtifactAvailable(PathBuf::from(frame)))
    }

    /// Serialize to the frames written on the wire, in order
    #[must_use]
    pub fn frames(&self) -> Vec<String> {
        match self {
            Self::Ready => vec!["ready".to_string()],
            Self::Restart => vec!["restart".to_string()],
            Self::Delete => vec!["delete".to_string()],
            Self::ArtifactAvailable(path) => vec![path.display().to_string()],
            Self::SpeechStarted => vec![SPEECH_START.to_string()],
            Self::SpeechEnded(path) => vec![SPEECH_END.to_string(), path.display().to_string()],
        }
    }

    /// Whether this message is sent by the coordinator rather than the peer
    #[must_use]
    pub const fn is_outbound(&self) -> bool {
        matches!(self, Self::SpeechStarted | Self::SpeechEnded(_))
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::ArtifactAvailable(path) => write!(f, "artifact {}", path.display()),
            Self::Restart => write!(f, "restart"),
            Self::Delete => write!(f, "delete"),
            Self::SpeechStarted => write!(f, "{SPEECH_START}"),
            Self::SpeechEnded(path) => write!(f, "{SPEECH_END} {}", path.display()),
        }
    }
}

fn is_artifact_path(frame: &str) -> bool {
    let Some((stem, ext)) = frame.rsplit_once('.') else {
        return false;
    };

    !stem.is_empty()
        && !stem.ends_with(['/', '\\'])
        && ARTIFACT_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known))
}
