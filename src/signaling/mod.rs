//! Call signaling: handshake listener, outbound client, and the call
//! state machine they drive

pub mod client;
pub mod coordinator;
pub mod server;

pub use client::{QuitReport, SignalingClient};
pub use coordinator::{CallPanel, QuitOutcome, SessionCoordinator};
pub use server::{SignalingServer, SignalingServerHandle};
