//! A complete voice node
//!
//! Wires configuration, the call state machine, the handshake listener and
//! client, and the media panel together, and implements the caller's side
//! of a call: probe everyone, propagate the participant list, start media.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::call::MediaCallPanel;
use crate::config::AppConfig;
use crate::constants::SIGNALING_PORT;
use crate::error::{ConfigError, Error, SessionError, SignalingError};
use crate::network::udp::UdpTransport;
use crate::protocol::{ParticipantList, PeerAddress, Status};
use crate::signaling::{
    CallPanel, QuitReport, SessionCoordinator, SignalingClient, SignalingServer,
    SignalingServerHandle,
};

/// One participant in the voice network
pub struct VoiceNode {
    config: AppConfig,
    local: Option<PeerAddress>,
    coordinator: Arc<SessionCoordinator>,
    client: SignalingClient,
    media: Option<Arc<MediaCallPanel>>,
    server: Option<SignalingServerHandle>,
}

impl VoiceNode {
    /// Node with UDP media legs
    pub fn new(config: AppConfig) -> crate::Result<Self> {
        config.validate()?;
        let local = advertised_address(&config)?;
        let media_ip = config
            .signaling
            .local_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        if local.is_none() {
            tracing::warn!("signaling.local_address is unset; this node cannot take part in calls");
        }
        let transport = Arc::new(UdpTransport::new(media_ip));
        let panel = Arc::new(MediaCallPanel::new(transport, config.media.clone(), local.clone()));

        let mut node = Self::with_panel(config, local, panel.clone());
        node.media = Some(panel);
        Ok(node)
    }

    /// Node driving a caller-supplied panel
    pub fn with_panel(
        config: AppConfig,
        local: Option<PeerAddress>,
        panel: Arc<dyn CallPanel>,
    ) -> Self {
        let client = SignalingClient::new(config.signaling.clone());
        Self {
            coordinator: Arc::new(SessionCoordinator::new(panel)),
            client,
            local,
            config,
            media: None,
            server: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn client(&self) -> &SignalingClient {
        &self.client
    }

    /// Media legs, when the node was built with [`VoiceNode::new`]
    pub fn media(&self) -> Option<&Arc<MediaCallPanel>> {
        self.media.as_ref()
    }

    pub fn status(&self) -> Status {
        self.coordinator.status()
    }

    /// This node's entry in participant lists, if configured
    pub fn local_address(&self) -> Option<&PeerAddress> {
        self.local.as_ref()
    }

    /// Start answering handshakes. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, SignalingError> {
        if let Some(server) = &self.server {
            return Ok(server.local_addr());
        }
        let server = SignalingServer::new(self.config.signaling.clone(), self.coordinator.clone())
            .start()
            .await?;
        let addr = server.local_addr();
        self.server = Some(server);
        Ok(addr)
    }

    /// Stop answering handshakes
    pub async fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
    }

    pub async fn probe(&self, peer: &PeerAddress) -> Status {
        self.client.probe(peer).await
    }

    /// Place a call to `peers`.
    ///
    /// Every peer must probe idle. If propagation fails part way, peers that
    /// already joined are sent a quit and the error names the failed peer.
    pub async fn dial(&self, peers: &[PeerAddress]) -> crate::Result<ParticipantList> {
        let local = self.local.clone().ok_or_else(|| {
            ConfigError::Invalid("signaling.local_address is required to place calls".into())
        })?;
        let status = self.status();
        if status != Status::Idle {
            return Err(SessionError::InvalidTransition {
                from: status,
                event: "start a call",
            }
            .into());
        }

        for peer in peers {
            let status = self.client.probe(peer).await;
            if status != Status::Idle {
                return Err(SessionError::PeerUnavailable {
                    peer: peer.to_string(),
                    status,
                }
                .into());
            }
        }

        let mut entries = Vec::with_capacity(peers.len() + 1);
        entries.push(local);
        entries.extend(peers.iter().cloned());
        let participants = ParticipantList::new(entries)?;

        if let Err(e) = self.client.propagate(&participants).await {
            if let SignalingError::Propagation { index, .. } = &e {
                let joined = &participants.as_slice()[1..*index];
                if !joined.is_empty() {
                    tracing::warn!("Call setup failed, releasing {} peers", joined.len());
                    self.client.notify_quit(joined).await;
                }
            }
            return Err(e.into());
        }

        let coordinator = self.coordinator.clone();
        let list = participants.clone();
        let started = tokio::task::spawn_blocking(move || coordinator.start_local_call(list))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)));

        match started {
            Ok(Ok(())) => Ok(participants),
            Ok(Err(e)) => {
                self.release(&participants).await;
                Err(e.into())
            }
            Err(e) => {
                self.release(&participants).await;
                Err(e)
            }
        }
    }

    /// Every invitee already has the list; tell them all the call is off
    async fn release(&self, participants: &ParticipantList) {
        let invitees = &participants.as_slice()[1..];
        tracing::warn!("Local call start failed, releasing {} peers", invitees.len());
        self.client.notify_quit(invitees).await;
    }

    /// End the active call and tell the other participants
    pub async fn hang_up(&self) -> crate::Result<QuitReport> {
        let coordinator = self.coordinator.clone();
        let participants = tokio::task::spawn_blocking(move || coordinator.hang_up())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        let others: Vec<PeerAddress> = participants
            .iter()
            .filter(|p| Some(*p) != self.local.as_ref())
            .cloned()
            .collect();
        Ok(self.client.notify_quit(&others).await)
    }
}

/// `local_address` plus the port when it differs from the well-known one
fn advertised_address(config: &AppConfig) -> Result<Option<PeerAddress>, ConfigError> {
    let Some(ip) = config.signaling.local_address else {
        return Ok(None);
    };
    let raw = if config.signaling.port == SIGNALING_PORT {
        ip.to_string()
    } else {
        SocketAddr::new(ip, config.signaling.port).to_string()
    };
    PeerAddress::parse(&raw)
        .map(Some)
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaConfig, SignalingConfig};
    use crate::protocol::read_line;
    use crate::signaling::coordinator::tests::RecordingPanel;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn node_config(host: [u8; 4], port: u16) -> AppConfig {
        let ip = IpAddr::V4(Ipv4Addr::from(host));
        AppConfig {
            signaling: SignalingConfig {
                bind_address: ip,
                port,
                local_address: Some(ip),
                probe_timeout_ms: 500,
                connect_timeout_ms: 500,
                handshake_timeout_ms: 500,
            },
            media: MediaConfig {
                base_port: 24100,
                pool_size: 4,
                block_capacity: 256,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn started(config: AppConfig) -> VoiceNode {
        let mut node = VoiceNode::new(config).unwrap();
        node.start().await.unwrap();
        node
    }

    async fn wait_for_status(node: &VoiceNode, status: Status) {
        for _ in 0..200 {
            if node.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status never became {}", status);
    }

    fn recording_node(config: AppConfig, panel: RecordingPanel) -> VoiceNode {
        let local = advertised_address(&config).unwrap();
        VoiceNode::with_panel(config, local, Arc::new(panel))
    }

    /// Peer that answers probes with idle and reports every other handshake
    async fn scripted_peer(addr: SocketAddr) -> mpsc::UnboundedReceiver<String> {
        let listener = TcpListener::bind(addr).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let Ok(token) = read_line(&mut reader).await else {
                    continue;
                };
                if token == "probe" {
                    let _ = write_half.write_all(b"idle\n").await;
                    continue;
                }
                let mut rest = String::new();
                let _ = reader.read_to_string(&mut rest).await;
                let _ = tx.send(format!("{}\n{}", token, rest));
            }
        });
        rx
    }

    /// Peer that answers one probe with idle and stops listening
    async fn vanishing_peer(addr: SocketAddr) {
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(listener);
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let _ = read_line(&mut reader).await;
                let _ = write_half.write_all(b"idle\n").await;
            }
        });
    }

    #[test]
    fn test_advertised_address() {
        let mut config = node_config([10, 0, 0, 5], SIGNALING_PORT);
        assert_eq!(advertised_address(&config).unwrap().unwrap().as_str(), "10.0.0.5");

        config.signaling.port = 15000;
        assert_eq!(
            advertised_address(&config).unwrap().unwrap().as_str(),
            "10.0.0.5:15000"
        );

        config.signaling.local_address = None;
        assert!(advertised_address(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dial_requires_local_address() {
        let mut config = node_config([127, 0, 0, 1], 24010);
        config.signaling.local_address = None;
        let node = VoiceNode::new(config).unwrap();
        assert!(node.local_address().is_none());

        let err = node
            .dial(&[PeerAddress::parse("127.0.0.2:24011").unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(node.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_dial_refuses_busy_or_dead_peer() {
        let caller = started(node_config([127, 0, 0, 1], 24020)).await;

        let panel = Arc::new(RecordingPanel::default());
        let busy_config = node_config([127, 0, 0, 2], 24021);
        let busy_local = advertised_address(&busy_config).unwrap();
        let mut busy = VoiceNode::with_panel(busy_config, busy_local, panel.clone());
        busy.start().await.unwrap();
        busy.coordinator()
            .start_local_call(ParticipantList::parse(["127.0.0.2:24021", "10.0.0.9"]).unwrap())
            .unwrap();

        let busy_addr = PeerAddress::parse("127.0.0.2:24021").unwrap();
        let err = caller.dial(&[busy_addr]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::PeerUnavailable {
                status: Status::Session,
                ..
            })
        ));

        // Nothing listens here
        let dead = PeerAddress::parse("127.0.0.3:24022").unwrap();
        let err = caller.dial(&[dead]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::PeerUnavailable {
                status: Status::Error,
                ..
            })
        ));

        assert_eq!(caller.status(), Status::Idle);
        // The busy node never saw a start
        assert_eq!(panel.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_local_start_releases_invitees() {
        let caller = recording_node(
            node_config([127, 0, 0, 1], 24031),
            RecordingPanel {
                fail_start: true,
                ..Default::default()
            },
        );
        let mut invitee_config = node_config([127, 0, 0, 2], 24032);
        invitee_config.media.base_port = 25100;
        let mut invitee = started(invitee_config).await;
        let invitee_addr = invitee.local_address().cloned().unwrap();

        let err = caller.dial(&[invitee_addr]).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::SetupFailed(_))));
        assert_eq!(caller.status(), Status::Error);

        // The invitee joined, then was told the call is off
        wait_for_status(&invitee, Status::Idle).await;
        assert_eq!(invitee.media().unwrap().leg_count(), 0);
        assert!(invitee.media().unwrap().is_visible());

        invitee.stop().await;
    }

    #[tokio::test]
    async fn test_partial_propagation_releases_joined_peers() {
        let caller = recording_node(node_config([127, 0, 0, 1], 24041), RecordingPanel::default());
        let first: SocketAddr = "127.0.0.2:24042".parse().unwrap();
        let second: SocketAddr = "127.0.0.3:24043".parse().unwrap();
        let mut first_rx = scripted_peer(first).await;
        vanishing_peer(second).await;

        let peers = [
            PeerAddress::parse(&first.to_string()).unwrap(),
            PeerAddress::parse(&second.to_string()).unwrap(),
        ];
        let err = caller.dial(&peers).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Signaling(SignalingError::Propagation { index: 2, .. })
        ));
        assert_eq!(caller.status(), Status::Idle);

        let start = first_rx.recv().await.unwrap();
        assert_eq!(
            start,
            "start\n127.0.0.1:24041\n127.0.0.2:24042\n127.0.0.3:24043\ninitialized\n"
        );
        assert_eq!(first_rx.recv().await.unwrap(), "quit\n");
    }

    #[tokio::test]
    async fn test_node_without_identity_stays_idle_on_start() {
        let mut config = node_config([127, 0, 0, 1], 24051);
        config.signaling.local_address = None;
        let mut node = VoiceNode::new(config).unwrap();
        let addr = node.start().await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"start\n127.0.0.2:24052\n127.0.0.3:24053\ninitialized\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;

        assert_eq!(node.status(), Status::Idle);
        assert!(node.media().unwrap().is_visible());
        let me = PeerAddress::parse(&addr.to_string()).unwrap();
        assert_eq!(node.probe(&me).await, Status::Idle);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_three_party_call_and_quit() {
        let a = started(node_config([127, 0, 0, 1], 24001)).await;
        let b = started(node_config([127, 0, 0, 2], 24002)).await;
        let c = started(node_config([127, 0, 0, 3], 24003)).await;

        // Bystander in its own call that does not include b
        let d_config = node_config([127, 0, 0, 4], 24004);
        let d_local = advertised_address(&d_config).unwrap();
        let d_panel = Arc::new(RecordingPanel::default());
        let mut d = VoiceNode::with_panel(d_config, d_local, d_panel.clone());
        d.start().await.unwrap();

        let b_addr = b.local_address().cloned().unwrap();
        let c_addr = c.local_address().cloned().unwrap();
        let d_addr = d.local_address().cloned().unwrap();

        let list = a.dial(&[b_addr.clone(), c_addr.clone()]).await.unwrap();
        assert_eq!(list.initiator(), a.local_address().unwrap());
        assert_eq!(a.status(), Status::Session);
        wait_for_status(&b, Status::Session).await;
        wait_for_status(&c, Status::Session).await;
        assert_eq!(b.coordinator().current_participants(), Some(list.clone()));
        assert_eq!(c.coordinator().current_participants(), Some(list.clone()));
        // Only listed peers received the start
        assert_eq!(d.status(), Status::Idle);
        assert!(d_panel.events.lock().is_empty());

        // Each node has a leg to every other participant
        assert_eq!(a.media().unwrap().leg_count(), 2);
        assert_eq!(b.media().unwrap().leg_count(), 2);
        assert!(!b.media().unwrap().is_visible());

        d.coordinator()
            .start_local_call(ParticipantList::new(vec![d_addr.clone(), c_addr.clone()]).unwrap())
            .unwrap();

        let report = b.hang_up().await.unwrap();
        assert!(report.all_notified());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(b.status(), Status::Idle);
        assert_eq!(b.media().unwrap().leg_count(), 0);

        wait_for_status(&a, Status::Idle).await;
        wait_for_status(&c, Status::Idle).await;
        assert_eq!(a.media().unwrap().leg_count(), 0);

        // b is not in d's call
        assert!(b.client().notify_quit(&[d_addr]).await.all_notified());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(d.status(), Status::Session);
        assert!(!d_panel.events.lock().iter().any(|e| e == "stop"));

        for mut node in [a, b, c, d] {
            node.stop().await;
        }
    }
}
