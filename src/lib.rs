//! # LAN Voice Call
//!
//! Peer-to-peer voice calls between nodes on a LAN: presence probing,
//! call setup by participant-list propagation, teardown, and the media
//! bridge that moves received audio into a recycled buffer pool.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              INITIATOR NODE                                  │
//! │  ┌──────────────────────┐        probe / start / quit (TCP, line based)      │
//! │  │ SignalingClient      │ ─────────────────────────────────────────┐        │
//! │  └──────────────────────┘                                          │        │
//! └────────────────────────────────────────────────────────────────────┼────────┘
//!                                                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PEER NODE                                       │
//! │  ┌──────────────────────┐   ┌──────────────────────┐                        │
//! │  │ SignalingServer      │──▶│ SessionCoordinator   │  status + participants │
//! │  │ (accept loop task)   │   │ IDLE / SESSION /ERROR│                        │
//! │  └──────────────────────┘   └──────────┬───────────┘                        │
//! │                                        │ start_call / stop_call             │
//! │                                        ▼                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │                 CallPanel (call::MediaCallPanel)                    │   │
//! │  │   one MediaBridge per remote participant                            │   │
//! │  │  ┌────────────────┐     ┌────────────────┐     ┌────────────────┐   │   │
//! │  │  │ inbound session│ ──▶ │ return queue   │ ──▶ │ carrier queue  │ ──▶ playback
//! │  │  │ (UDP data+ctl) │     │ (empty blocks) │ ◀── │ (full blocks)  │   │   │
//! │  │  └────────────────┘     └────────────────┘     └────────────────┘   │   │
//! │  │  ┌────────────────┐                                                 │   │
//! │  │  │outbound session│ ◀── capture                                     │   │
//! │  │  └────────────────┘                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod call;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod signaling;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Well-known TCP port every node listens on for handshakes
    pub const SIGNALING_PORT: u16 = 14999;

    /// Probe connect/read timeout in milliseconds
    pub const PROBE_TIMEOUT_MS: u64 = 1000;

    /// Connect timeout for start/quit handshakes in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 3000;

    /// How long the server waits for a complete handshake in milliseconds
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

    /// First UDP port used for media legs
    pub const DEFAULT_MEDIA_BASE_PORT: u16 = 16000;

    /// Capacity of one audio block in bytes
    pub const AUDIO_BLOCK_CAPACITY: usize = 1024;

    /// Number of audio blocks allocated per queue pair
    pub const AUDIO_POOL_SIZE: usize = 32;

    /// Poll interval while waiting for a free audio block, in milliseconds
    pub const INGEST_POLL_MS: u64 = 50;

    /// Largest UDP payload a media session can receive
    pub const MAX_DATAGRAM_SIZE: usize = 65_507; // 65535 - IP/UDP headers

    /// Longest handshake line accepted on the wire
    pub const MAX_LINE_LENGTH: usize = 512;

    /// Largest participant list accepted in a start handshake
    pub const MAX_PARTICIPANTS: usize = 64;
}
