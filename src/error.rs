use std::path::PathBuf;

use crate::models::{Identity, SignalKind};

/// Local media acquisition failed. Recoverable: the join or share simply
/// does not happen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no device available: {0}")]
    Unavailable(String),

    #[error("capture failed: {0}")]
    Capture(String),
}

/// Presence or signaling relay could not be reached. Never retried by the engine.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay connection closed")]
    Closed,

    #[error("relay transport error: {0}")]
    Transport(String),

    #[error("relay encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The underlying peer connection rejected an operation or failed.
/// Terminal for the one session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to create connection: {0}")]
    Setup(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("failed to apply candidate: {0}")]
    Candidate(String),

    #[error("track operation failed: {0}")]
    Track(String),

    #[error("session is closed")]
    Closed,
}

/// An inbound envelope that cannot be applied. Logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("{kind:?} from {from} has no matching session")]
    UnknownSession { kind: SignalKind, from: Identity },

    #[error("{kind:?} from {from} carries the wrong payload")]
    PayloadMismatch { kind: SignalKind, from: Identity },
}

/// Errors reported to callers of the voice handle.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("voice engine is not running")]
    EngineStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failures while bringing up a node or relay process.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
