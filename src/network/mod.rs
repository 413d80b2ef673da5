//! Network subsystem for media transport

pub mod bridge;
pub mod session;
pub mod udp;

pub use bridge::MediaBridge;
pub use session::{FrameHandler, LegPorts, MediaSender, MediaSession, MediaTransport, PortPair};
pub use udp::{create_socket, UdpTransport};
