use serde::Serialize;
use std::fmt;

use doorline_common::DoorConfig;

use crate::media::{LocalStream, MediaConstraints, TrackKind};

/// ICE connection state as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Media can flow.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// The call cannot continue on this connection.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::HaveLocalPranswer => "have-local-pranswer",
            Self::HaveRemotePranswer => "have-remote-pranswer",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    Ringing,
    Connected,
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Ringing => "ringing",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Snapshot of the controller, recomputed after every processed event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CallStatus {
    pub link_open: bool,
    pub media_ready: bool,
    pub ringing: bool,
    pub connected: bool,
    pub preview: bool,
    pub remote_media: bool,
    pub ice_state: IceConnectionState,
    pub signaling_state: SignalingState,
    pub last_error: Option<String>,
    /// Swallowed answer/candidate failures on the current session.
    pub negotiation_failures: u32,
}

impl CallStatus {
    pub fn phase(&self) -> CallPhase {
        if self.connected {
            CallPhase::Connected
        } else if self.ringing {
            CallPhase::Ringing
        } else {
            CallPhase::Idle
        }
    }
}

/// A track announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Presentation seam: where local preview and remote media end up.
pub trait MediaView: Send {
    /// `None` clears the preview.
    fn show_preview(&mut self, stream: Option<&LocalStream>);
    fn attach_remote(&mut self, track: RemoteTrack);
    fn detach_remote(&mut self);
}

/// View for headless doors.
#[derive(Debug, Default)]
pub struct NullView;

impl MediaView for NullView {
    fn show_preview(&mut self, _stream: Option<&LocalStream>) {}
    fn attach_remote(&mut self, _track: RemoteTrack) {}
    fn detach_remote(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Capture is permitted in this context.
    pub secure_context: bool,
    pub constraints: MediaConstraints,
    /// Preview shown as soon as media is available.
    pub show_preview: bool,
}

impl ControllerOptions {
    pub fn from_config(config: &DoorConfig) -> Self {
        Self {
            secure_context: config.secure_context(),
            constraints: MediaConstraints::default(),
            show_preview: false,
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            secure_context: true,
            constraints: MediaConstraints::default(),
            show_preview: false,
        }
    }
}
