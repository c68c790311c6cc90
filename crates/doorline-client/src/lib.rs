//! Door-side call core for Doorline.
//!
//! The door places calls to a hub: [`SignalingLink`] carries offer, answer,
//! candidate and bye messages over a WebSocket, [`MediaSource`] owns the
//! capture stream, [`PeerSession`] owns one peer connection, and
//! [`CallController`] ties them into a single call lifecycle.

pub mod controller;
pub mod error;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod signaling;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{CallController, CallDeps, CallHandle};
pub use error::{AcquisitionError, CallError, PeerError, PreconditionError};
pub use media::{
    AudioProcessing, CaptureBackend, LocalStream, LocalTrack, MediaConstraints, MediaSource,
    SampleCapture, TrackKind, OPUS_SILENCE_FRAME,
};
pub use peer::{
    AnswerOutcome, CandidateOutcome, PeerConnection, PeerEvent, PeerEventSink, PeerFactory,
    PeerSession, SessionEvent, Subscription,
};
pub use rtc::RtcPeerFactory;
pub use signaling::{LinkEvent, SignalingLink};
pub use types::{
    CallPhase, CallStatus, ControllerOptions, IceConnectionState, MediaView, NullView,
    RemoteTrack, SignalingState,
};
