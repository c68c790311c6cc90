//! Errors surfaced by the call core.
//!
//! Only `ring()` hands an error back to its caller. Everything that happens
//! on the transport or protocol side is absorbed into status and logs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("ring failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("ring failed: {0}")]
    Negotiation(String),

    #[error("ring cancelled before the offer was sent")]
    Cancelled,

    #[error("call controller is not running")]
    Stopped,
}

/// A `ring()` precondition did not hold; nothing was changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("a call is already in progress")]
    CallInProgress,

    #[error("insecure context: capture requires a wss:// or loopback signaling endpoint")]
    InsecureContext,

    #[error("unsupported: media capture is not available on this device")]
    Unsupported,

    #[error("signaling link is not open")]
    LinkNotOpen,

    #[error("peer session is not ready")]
    NoPeerSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("unsupported: media capture is not available on this device")]
    Unsupported,

    #[error("insecure context: capture requires a wss:// or loopback signaling endpoint")]
    InsecureContext,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("capture device error: {0}")]
    DeviceError(String),

    #[error("a capture attempt is already in progress")]
    AlreadyInProgress,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("invalid peer session state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
