//! Media side of a call
//!
//! [`MediaCallPanel`] is the [`CallPanel`] used by a running node: starting a
//! call opens one [`MediaBridge`] per remote participant, stopping it closes
//! them all. Playback and capture attach through
//! [`playback_consumers`](MediaCallPanel::playback_consumers) and
//! [`broadcast`](MediaCallPanel::broadcast).

use parking_lot::Mutex;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::buffer::BlockConsumer;
use crate::config::MediaConfig;
use crate::error::{MediaError, SessionError};
use crate::network::bridge::MediaBridge;
use crate::network::session::{LegPorts, MediaTransport};
use crate::protocol::{ParticipantList, PeerAddress};
use crate::signaling::coordinator::CallPanel;

/// Media to one remote participant
pub struct CallLeg {
    pub peer: PeerAddress,
    /// Position of the peer in the participant list
    pub index: usize,
    bridge: MediaBridge,
}

struct ActiveCall {
    participants: ParticipantList,
    legs: Vec<CallLeg>,
}

/// Opens and closes the media legs of a call
pub struct MediaCallPanel {
    transport: Arc<dyn MediaTransport>,
    media: MediaConfig,
    local: Option<PeerAddress>,
    active: Mutex<Option<ActiveCall>>,
    visible: AtomicBool,
}

impl MediaCallPanel {
    /// `local` is this node's entry as it appears in participant lists.
    /// Without it no call can be started.
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        media: MediaConfig,
        local: Option<PeerAddress>,
    ) -> Self {
        Self {
            transport,
            media,
            local,
            active: Mutex::new(None),
            visible: AtomicBool::new(true),
        }
    }

    /// This node's position in `participants`
    pub fn local_index(&self, participants: &ParticipantList) -> Option<usize> {
        let local = self.local.as_ref()?;
        if let Some(index) = participants.position(local) {
            return Some(index);
        }
        // Same host written with or without an explicit port
        let ip = local.ip()?;
        let mut matches = participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.matches_ip(ip));
        match (matches.next(), matches.next()) {
            (Some((index, _)), None) => Some(index),
            _ => None,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn leg_count(&self) -> usize {
        self.active.lock().as_ref().map_or(0, |call| call.legs.len())
    }

    /// Playback side of every leg
    pub fn playback_consumers(&self) -> Vec<(PeerAddress, BlockConsumer)> {
        self.active.lock().as_ref().map_or_else(Vec::new, |call| {
            call.legs
                .iter()
                .map(|leg| (leg.peer.clone(), leg.bridge.consumer()))
                .collect()
        })
    }

    /// Datagrams (received, sent) over all legs of the active call
    pub fn traffic(&self) -> (u64, u64) {
        self.active.lock().as_ref().map_or((0, 0), |call| {
            call.legs.iter().fold((0, 0), |(rx, tx), leg| {
                (rx + leg.bridge.packets_received(), tx + leg.bridge.packets_sent())
            })
        })
    }

    /// Hand every received block straight back to its pool. Returns how
    /// many blocks were drained. Used when no playback device is attached.
    pub fn drain_playback(&self) -> u64 {
        let mut drained = 0;
        for (_, consumer) in self.playback_consumers() {
            while let Some(block) = consumer.try_next_filled() {
                drained += 1;
                if consumer.recycle(block).is_err() {
                    break;
                }
            }
        }
        drained
    }

    /// Send captured audio to every leg. Returns how many legs took it.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let guard = self.active.lock();
        let Some(call) = guard.as_ref() else {
            return 0;
        };
        call.legs
            .iter()
            .filter(|leg| match leg.bridge.send(payload) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Send to {} failed: {}", leg.peer, e);
                    false
                }
            })
            .count()
    }

    fn open_legs(&self, participants: &ParticipantList) -> crate::Result<Vec<CallLeg>> {
        let local_index = self.local_index(participants).ok_or_else(|| {
            let local = self.local.as_ref().map_or("<unset>".to_string(), |l| l.to_string());
            SessionError::SetupFailed(format!("{} is not in the participant list", local))
        })?;

        let mut legs = Vec::with_capacity(participants.len().saturating_sub(1));
        for (index, peer) in participants.iter().enumerate() {
            if index == local_index {
                continue;
            }
            let ip = resolve(peer)?;
            let ports = LegPorts::derive(self.media.base_port, local_index, index)?;
            // Legs opened so far are closed on drop if this one fails
            let bridge = MediaBridge::open(
                self.transport.as_ref(),
                ip,
                ports,
                self.media.pool_size,
                self.media.block_capacity,
                self.media.ingest_poll(),
            )?;
            legs.push(CallLeg {
                peer: peer.clone(),
                index,
                bridge,
            });
        }
        Ok(legs)
    }
}

impl CallPanel for MediaCallPanel {
    fn start_call(&self, participants: &ParticipantList) -> crate::Result<()> {
        self.stop_call();

        let legs = self.open_legs(participants)?;
        tracing::info!("Call started with {} media legs", legs.len());
        *self.active.lock() = Some(ActiveCall {
            participants: participants.clone(),
            legs,
        });
        Ok(())
    }

    fn stop_call(&self) {
        let call = self.active.lock().take();
        if let Some(mut call) = call {
            for leg in &mut call.legs {
                leg.bridge.close();
            }
            tracing::info!("Call stopped, {} media legs closed", call.legs.len());
        }
    }

    fn current_participant_list(&self) -> Option<ParticipantList> {
        self.active
            .lock()
            .as_ref()
            .map(|call| call.participants.clone())
    }

    fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
        tracing::debug!("Main window {}", if visible { "shown" } else { "hidden" });
    }

    fn can_join(&self, participants: &ParticipantList) -> bool {
        self.local_index(participants).is_some()
    }
}

fn resolve(peer: &PeerAddress) -> Result<IpAddr, MediaError> {
    if let Some(ip) = peer.ip() {
        return Ok(ip);
    }
    (peer.host(), 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| MediaError::Unresolved(peer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::udp::UdpTransport;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn panel(local: &str, base_port: u16) -> MediaCallPanel {
        let transport = Arc::new(UdpTransport::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let media = MediaConfig {
            base_port,
            pool_size: 4,
            block_capacity: 256,
            ..Default::default()
        };
        MediaCallPanel::new(transport, media, Some(PeerAddress::parse(local).unwrap()))
    }

    #[test]
    fn test_local_index_lookup() {
        let p = panel("10.0.0.2", 30000);
        let list = ParticipantList::parse(["10.0.0.1", "10.0.0.2:14999", "10.0.0.3"]).unwrap();
        assert_eq!(p.local_index(&list), Some(1));

        let exact = panel("127.0.0.1:7002", 30000);
        let list = ParticipantList::parse(["127.0.0.1:7001", "127.0.0.1:7002"]).unwrap();
        assert_eq!(exact.local_index(&list), Some(1));

        // Ambiguous by address alone
        let bare = panel("127.0.0.1", 30000);
        assert_eq!(bare.local_index(&list), None);
    }

    #[test]
    fn test_start_call_requires_local_entry() {
        let p = panel("10.0.0.9", 30000);
        let list = ParticipantList::parse(["10.0.0.1", "10.0.0.2"]).unwrap();
        assert!(p.start_call(&list).is_err());
        assert_eq!(p.leg_count(), 0);
        assert_eq!(p.current_participant_list(), None);

        let transport = Arc::new(UdpTransport::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let anonymous = MediaCallPanel::new(transport, MediaConfig::default(), None);
        assert_eq!(anonymous.local_index(&list), None);
        assert!(!anonymous.can_join(&list));
        assert!(anonymous.start_call(&list).is_err());
    }

    #[test]
    fn test_two_party_audio_over_loopback() {
        let list = ParticipantList::parse(["127.0.0.1:7001", "127.0.0.1:7002"]).unwrap();
        let alice = panel("127.0.0.1:7001", 23100);
        let bob = panel("127.0.0.1:7002", 23100);

        alice.start_call(&list).unwrap();
        bob.start_call(&list).unwrap();
        assert_eq!(alice.leg_count(), 1);
        assert_eq!(alice.current_participant_list(), Some(list.clone()));

        assert_eq!(alice.broadcast(b"hello bob"), 1);
        let (from, consumer) = bob.playback_consumers().pop().unwrap();
        assert_eq!(from.as_str(), "127.0.0.1:7001");
        let block = consumer.next_filled_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(block.as_slice(), b"hello bob");
        consumer.recycle(block).unwrap();

        assert_eq!(bob.broadcast(b"hi alice"), 1);
        let (_, consumer) = alice.playback_consumers().pop().unwrap();
        let block = consumer.next_filled_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(block.as_slice(), b"hi alice");
        assert_eq!(alice.traffic(), (1, 1));
        assert_eq!(bob.traffic(), (1, 1));

        // Without a playback device queued blocks go back to the pool
        assert_eq!(bob.broadcast(b"again"), 1);
        let mut drained = 0;
        for _ in 0..200 {
            drained += alice.drain_playback();
            if drained > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(drained, 1);

        alice.stop_call();
        bob.stop_call();
        assert_eq!(alice.leg_count(), 0);
        assert_eq!(alice.broadcast(b"gone"), 0);
    }

    #[test]
    fn test_visibility_tracks_calls() {
        let p = panel("10.0.0.2", 30000);
        assert!(p.is_visible());
        p.set_visible(false);
        assert!(!p.is_visible());
    }
}
