//! Media bridge for one call leg
//!
//! Owns the inbound and outbound media sessions to a single peer. Inbound
//! frames are copied into the leg's [`AudioQueuePair`]; outbound audio is
//! forwarded to the peer as-is.

use std::net::IpAddr;
use std::time::Duration;

use crate::audio::buffer::{AudioQueuePair, BlockConsumer, BlockProducer, QueueStats};
use crate::error::{AudioError, MediaError};
use crate::network::session::{LegPorts, MediaSender, MediaSession, MediaTransport, PortPair};

/// Bridge between the network and the audio pool for one peer
pub struct MediaBridge {
    peer: IpAddr,
    queues: AudioQueuePair,
    producer: BlockProducer,
    outbound: Option<Box<dyn MediaSender>>,
    inbound: Option<Box<dyn MediaSession>>,
}

impl MediaBridge {
    /// Open both sessions of the leg to `peer`.
    ///
    /// The pool holds `pool_size` blocks of `block_capacity` bytes;
    /// `ingest_poll` bounds each wait on an exhausted pool.
    pub fn open(
        transport: &dyn MediaTransport,
        peer: IpAddr,
        ports: LegPorts,
        pool_size: usize,
        block_capacity: usize,
        ingest_poll: Duration,
    ) -> Result<Self, MediaError> {
        let queues = AudioQueuePair::new(pool_size, block_capacity);
        let producer = queues.producer().with_poll_interval(ingest_poll);

        let rx_producer = producer.clone();
        let mut inbound = transport.open_inbound(
            peer,
            ports.receive,
            Box::new(move |frame| {
                let _ = ingest(&rx_producer, frame);
            }),
        )?;

        let outbound = match transport.open_outbound(peer, ports.send) {
            Ok(session) => session,
            Err(e) => {
                queues.close();
                inbound.close();
                return Err(e);
            }
        };

        tracing::info!(
            "Media bridge to {} open (rx {}/{}, tx {}/{})",
            peer,
            ports.receive.data,
            ports.receive.control,
            ports.send.data,
            ports.send.control
        );

        Ok(Self {
            peer,
            queues,
            producer,
            outbound: Some(outbound),
            inbound: Some(inbound),
        })
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    /// Copy a received frame into the pool, waiting for a free block if
    /// playback is behind
    pub fn on_frame_received(&self, payload: &[u8]) -> Result<(), MediaError> {
        if self.inbound.is_none() {
            return Err(MediaError::Closed);
        }
        ingest(&self.producer, payload)
    }

    /// Forward captured audio to the peer
    pub fn send(&self, payload: &[u8]) -> Result<(), MediaError> {
        match &self.outbound {
            Some(session) => session.send(payload),
            None => Err(MediaError::Closed),
        }
    }

    /// Playback side of the pool
    pub fn consumer(&self) -> BlockConsumer {
        self.queues.consumer()
    }

    pub fn stats(&self) -> QueueStats {
        self.queues.stats()
    }

    /// Datagrams received from the peer
    pub fn packets_received(&self) -> u64 {
        self.inbound.as_ref().map_or(0, |s| s.packets())
    }

    /// Datagrams sent to the peer
    pub fn packets_sent(&self) -> u64 {
        self.outbound.as_ref().map_or(0, |s| s.packets())
    }

    /// Locally bound inbound ports, once open
    pub fn receive_ports(&self) -> Option<PortPair> {
        self.inbound.as_ref().map(|s| s.local_ports())
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_none() && self.inbound.is_none()
    }

    /// Close the outbound session, then the inbound one. Best effort.
    pub fn close(&mut self) {
        if let Some(mut outbound) = self.outbound.take() {
            outbound.close();
        }
        // Release a receive thread parked on an exhausted pool before joining it
        self.queues.close();
        if let Some(mut inbound) = self.inbound.take() {
            inbound.close();
        }
        tracing::info!("Media bridge to {} closed", self.peer);
    }
}

impl Drop for MediaBridge {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

fn ingest(producer: &BlockProducer, frame: &[u8]) -> Result<(), MediaError> {
    match producer.write_frame(frame) {
        Ok(()) => {
            tracing::trace!("Queued {} byte frame", frame.len());
            Ok(())
        }
        Err(AudioError::PoolClosed) => Err(MediaError::Closed),
        Err(e) => Err(e.into()),
    }
}
