//! Error types for the voice call node

use thiserror::Error;

use crate::protocol::Status;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown handshake token: {0:?}")]
    UnknownToken(String),

    #[error("Participant list is empty")]
    EmptyParticipantList,

    #[error("Participant list too long: {0} entries")]
    TooManyParticipants(usize),

    #[error("Invalid peer address: {0:?}")]
    InvalidAddress(String),

    #[error("Handshake line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Connection closed before the handshake completed")]
    UnexpectedEof,
}

/// Signaling transport errors
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Connection to {peer} failed: {source}")]
    ConnectFailed {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out talking to {peer} during {stage}")]
    Timeout { peer: String, stage: &'static str },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to propagate participant list to {peer} (index {index}): {source}")]
    Propagation {
        peer: String,
        index: usize,
        #[source]
        source: Box<SignalingError>,
    },
}

/// Audio buffer pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Payload of {len} bytes exceeds block capacity of {capacity} bytes")]
    BlockOverflow { len: usize, capacity: usize },

    #[error("Buffer pool closed")]
    PoolClosed,

    #[error("Queue peer disconnected")]
    Disconnected,
}

/// Media session errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Socket bind failed on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Send failed: {0}")]
    SendFailed(std::io::Error),

    #[error("Media session closed")]
    Closed,

    #[error("Invalid media ports: {0}")]
    InvalidPorts(String),

    #[error("Cannot resolve peer {0}")]
    Unresolved(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
}

/// Call state machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Cannot {event} while {from}")]
    InvalidTransition { from: Status, event: &'static str },

    #[error("Peer {peer} is not available ({status})")]
    PeerUnavailable { peer: String, status: Status },

    #[error("Call setup failed: {0}")]
    SetupFailed(String),

    #[error("This node is not in the participant list")]
    NotListed,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
