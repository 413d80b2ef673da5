//! Outbound handshakes
//!
//! Every operation talks to one peer at a time and every network step is
//! bounded by a timeout, so a dead peer costs at most one timeout.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};

use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::protocol::{read_line, Handshake, ParticipantList, PeerAddress, Status};

/// Per-peer results of a quit notification
#[derive(Debug, Default)]
pub struct QuitReport {
    pub outcomes: Vec<(PeerAddress, Result<(), SignalingError>)>,
}

impl QuitReport {
    /// Peers that could not be notified
    pub fn failures(&self) -> impl Iterator<Item = (&PeerAddress, &SignalingError)> {
        self.outcomes
            .iter()
            .filter_map(|(peer, result)| result.as_ref().err().map(|e| (peer, e)))
    }

    pub fn all_notified(&self) -> bool {
        self.outcomes.iter().all(|(_, result)| result.is_ok())
    }
}

/// Client side of the handshake protocol
#[derive(Debug, Clone)]
pub struct SignalingClient {
    config: SignalingConfig,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig) -> Self {
        Self { config }
    }

    /// Ask `peer` for its status.
    ///
    /// Any failure is reported as [`Status::Error`], never as idle.
    pub async fn probe(&self, peer: &PeerAddress) -> Status {
        match self.try_probe(peer).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Probe of {} failed: {}", peer, e);
                Status::Error
            }
        }
    }

    /// [`probe`](Self::probe) with the failure cause kept
    pub async fn try_probe(&self, peer: &PeerAddress) -> Result<Status, SignalingError> {
        let timeout = self.config.probe_timeout();
        let stream = self.connect(peer, timeout).await?;
        let (read_half, mut write_half) = stream.into_split();

        bounded(peer, "probe send", timeout, async {
            write_half
                .write_all(Handshake::Probe.encode().as_bytes())
                .await
                .map_err(SignalingError::from)
        })
        .await?;

        let mut reader = BufReader::new(read_half);
        let reply = bounded(peer, "probe reply", timeout, read_line(&mut reader)).await?;
        let status = Status::from_reply(&reply);
        tracing::debug!("Probe of {} answered {:?} ({})", peer, reply, status);
        Ok(status)
    }

    /// Send the start handshake to every participant except the initiator.
    ///
    /// Peers are contacted in list order. The first failure aborts the pass
    /// and names the peer; peers before it have already joined.
    pub async fn propagate(&self, participants: &ParticipantList) -> Result<(), SignalingError> {
        let message = Handshake::Start(participants.clone()).encode();

        for (index, peer) in participants.invitees() {
            self.send_raw(peer, &message)
                .await
                .map_err(|e| SignalingError::Propagation {
                    peer: peer.to_string(),
                    index,
                    source: Box::new(e),
                })?;
            tracing::info!("Sent participant list to {}", peer);
        }
        Ok(())
    }

    /// Send quit to each of `peers`. Failures are collected, not fatal.
    pub async fn notify_quit(&self, peers: &[PeerAddress]) -> QuitReport {
        let message = Handshake::Quit.encode();
        let mut report = QuitReport::default();

        for peer in peers {
            let result = self.send_raw(peer, &message).await;
            match &result {
                Ok(()) => tracing::info!("Notified {} of quit", peer),
                Err(e) => tracing::warn!("Could not notify {} of quit: {}", peer, e),
            }
            report.outcomes.push((peer.clone(), result));
        }
        report
    }

    /// Deliver one handshake that expects no reply
    async fn send_raw(&self, peer: &PeerAddress, message: &str) -> Result<(), SignalingError> {
        let timeout = self.config.connect_timeout();
        let mut stream = self.connect(peer, timeout).await?;

        bounded(peer, "send", timeout, async {
            stream.write_all(message.as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        })
        .await
    }

    async fn connect(&self, peer: &PeerAddress, timeout: Duration) -> Result<TcpStream, SignalingError> {
        let target = peer.signaling_target(self.config.port);
        let local = self.config.local_address;

        bounded(peer, "connect", timeout, async {
            let connect_failed = |source| SignalingError::ConnectFailed {
                peer: peer.to_string(),
                source,
            };

            let addr: SocketAddr = tokio::net::lookup_host(&target)
                .await
                .map_err(connect_failed)?
                .next()
                .ok_or_else(|| {
                    connect_failed(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no address for {}", target),
                    ))
                })?;

            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .map_err(connect_failed)?;

            // Peers recognise a quitting participant by source address
            if let Some(ip) = local {
                if ip.is_ipv4() == addr.is_ipv4() {
                    socket
                        .bind(SocketAddr::new(ip, 0))
                        .map_err(connect_failed)?;
                }
            }

            socket.connect(addr).await.map_err(connect_failed)
        })
        .await
    }
}

async fn bounded<T, F>(
    peer: &PeerAddress,
    stage: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, SignalingError>
where
    F: Future<Output = Result<T, SignalingError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SignalingError::Timeout {
            peer: peer.to_string(),
            stage,
        })?
}
