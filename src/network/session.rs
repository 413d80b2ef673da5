//! Media session contract
//!
//! A media session is one direction of real-time audio between two peers.
//! Transports only have to move opaque payloads; packetisation is theirs.

use std::net::IpAddr;

use crate::error::MediaError;

/// Called for every frame received on an inbound session
pub type FrameHandler = Box<dyn Fn(&[u8]) + Send + 'static>;

/// Local (data, control) UDP port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub data: u16,
    pub control: u16,
}

impl PortPair {
    /// Let the OS pick both ports
    pub const EPHEMERAL: PortPair = PortPair { data: 0, control: 0 };

    /// Pair reserved for participant `index`: `base + 2*index` and the next port
    pub fn for_index(base: u16, index: usize) -> Result<Self, MediaError> {
        let data = index
            .checked_mul(2)
            .and_then(|offset| u16::try_from(offset).ok())
            .and_then(|offset| base.checked_add(offset));
        let control = data.and_then(|d| d.checked_add(1));
        match (data, control) {
            (Some(data), Some(control)) => Ok(Self { data, control }),
            _ => Err(MediaError::InvalidPorts(format!(
                "participant {} does not fit above base port {}",
                index, base
            ))),
        }
    }
}

/// Ports of one call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegPorts {
    /// Where this node listens for the peer's audio
    pub receive: PortPair,
    /// Where the peer listens for this node's audio
    pub send: PortPair,
}

impl LegPorts {
    /// Derive the leg between list positions `local_index` and `remote_index`.
    ///
    /// Every node receives from participant `p` on `p`'s pair, so both ends
    /// agree on the ports from the participant list alone.
    pub fn derive(base: u16, local_index: usize, remote_index: usize) -> Result<Self, MediaError> {
        if local_index == remote_index {
            return Err(MediaError::InvalidPorts(format!(
                "leg from participant {} to itself",
                local_index
            )));
        }
        Ok(Self {
            receive: PortPair::for_index(base, remote_index)?,
            send: PortPair::for_index(base, local_index)?,
        })
    }
}

/// One open media session
pub trait MediaSession: Send {
    /// Ports actually bound locally
    fn local_ports(&self) -> PortPair;

    /// Datagrams moved so far
    fn packets(&self) -> u64 {
        0
    }

    /// Stop the session. Idempotent.
    fn close(&mut self);
}

/// A session that can transmit
pub trait MediaSender: MediaSession + Sync {
    /// Transmit one payload. No retry, no buffering.
    fn send(&self, payload: &[u8]) -> Result<(), MediaError>;
}

/// Factory for media sessions
pub trait MediaTransport: Send + Sync {
    /// Receive from `remote` on `local`, delivering each frame to `on_frame`
    fn open_inbound(
        &self,
        remote: IpAddr,
        local: PortPair,
        on_frame: FrameHandler,
    ) -> Result<Box<dyn MediaSession>, MediaError>;

    /// Send to `remote` at `remote_ports`
    fn open_outbound(
        &self,
        remote: IpAddr,
        remote_ports: PortPair,
    ) -> Result<Box<dyn MediaSender>, MediaError>;
}
