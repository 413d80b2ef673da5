//! Handshake listener
//!
//! Accepts signaling connections on the well-known port. Every connection
//! carries exactly one handshake and is handled on its own task, so a stalled
//! peer only holds up its own connection. State changes from one peer address
//! are applied in the order their connections were accepted.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::protocol::{read_handshake, Handshake};
use crate::signaling::coordinator::SessionCoordinator;

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Signaling listener, not yet bound
pub struct SignalingServer {
    config: SignalingConfig,
    coordinator: Arc<SessionCoordinator>,
}

impl SignalingServer {
    pub fn new(config: SignalingConfig, coordinator: Arc<SessionCoordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// Bind the listener and spawn the accept loop
    pub async fn start(self) -> Result<SignalingServerHandle, SignalingError> {
        let bind_addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Signaling server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.coordinator,
            self.config.handshake_timeout(),
            shutdown_rx,
        ));

        Ok(SignalingServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Running signaling server. Dropping the handle also stops the accept loop.
pub struct SignalingServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SignalingServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the accept loop to exit. Connections already accepted finish.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the accept loop to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("Signaling accept loop panicked: {}", e);
        }
    }

    /// `stop()` then `join()`
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    coordinator: Arc<SessionCoordinator>,
    handshake_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Completion of the latest connection from each peer address
    let mut last_from: HashMap<IpAddr, oneshot::Receiver<()>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    last_from.retain(|_, done| {
                        matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty))
                    });
                    let (done_tx, done_rx) = oneshot::channel();
                    let turn = PeerTurn {
                        previous: last_from.insert(peer.ip().to_canonical(), done_rx),
                        done: Some(done_tx),
                    };

                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, coordinator, handshake_timeout, turn).await {
                            tracing::warn!("Handshake from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    tracing::info!("Signaling server stopped");
}

/// A connection's place in its peer's queue. Dropping it lets the next
/// connection from the same address proceed once every earlier one has.
struct PeerTurn {
    previous: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl PeerTurn {
    /// Wait until earlier connections from this peer are finished
    async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Err only means the earlier task ended without signalling
            let _ = previous.await;
        }
    }
}

impl Drop for PeerTurn {
    fn drop(&mut self) {
        // Never waited (probe or bad handshake): keep later connections
        // queued behind the earlier ones without blocking this one
        if let (Some(previous), Some(done)) = (self.previous.take(), self.done.take()) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = previous.await;
                    drop(done);
                });
            }
        }
    }
}

/// Serve one handshake; the connection is closed on return
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<SessionCoordinator>,
    handshake_timeout: Duration,
    mut turn: PeerTurn,
) -> Result<(), SignalingError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let handshake = tokio::time::timeout(handshake_timeout, read_handshake(&mut reader))
        .await
        .map_err(|_| SignalingError::Timeout {
            peer: peer.to_string(),
            stage: "handshake",
        })??;

    tracing::debug!("{} handshake from {}", handshake.token(), peer);

    match handshake {
        Handshake::Probe => {
            // Probes change nothing and never queue
            drop(turn);
            let status = coordinator.status();
            let reply = format!("{}\n", status.as_wire());
            write_half.write_all(reply.as_bytes()).await?;
            write_half.shutdown().await?;
            tracing::debug!("Answered probe from {} with {}", peer, status);
        }
        Handshake::Start(participants) => {
            turn.wait().await;
            // Opening media legs binds sockets and may block
            let result =
                tokio::task::spawn_blocking(move || coordinator.on_start_received(participants))
                    .await
                    .map_err(|e| SignalingError::Io(std::io::Error::other(e)))?;
            if let Err(e) = result {
                tracing::warn!("Start from {} not accepted: {}", peer, e);
            }
        }
        Handshake::Quit => {
            turn.wait().await;
            let sender = peer.ip();
            let outcome = tokio::task::spawn_blocking(move || coordinator.on_quit_received(sender))
                .await
                .map_err(|e| SignalingError::Io(std::io::Error::other(e)))?;
            tracing::debug!("Quit from {}: {:?}", peer, outcome);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ParticipantList, Status};
    use crate::signaling::coordinator::tests::RecordingPanel;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncReadExt;

    fn test_config() -> SignalingConfig {
        SignalingConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            handshake_timeout_ms: 300,
            ..Default::default()
        }
    }

    async fn start_server() -> (Arc<RecordingPanel>, Arc<SessionCoordinator>, SignalingServerHandle) {
        let panel = Arc::new(RecordingPanel::default());
        let coordinator = Arc::new(SessionCoordinator::new(panel.clone()));
        let handle = SignalingServer::new(test_config(), coordinator.clone())
            .start()
            .await
            .unwrap();
        (panel, coordinator, handle)
    }

    /// Send raw bytes, then read everything until the server closes
    async fn exchange(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut reply))
            .await
            .unwrap()
            .unwrap();
        reply
    }

    async fn wait_for_status(coordinator: &SessionCoordinator, status: Status) {
        for _ in 0..100 {
            if coordinator.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status never became {}", status);
    }

    #[tokio::test]
    async fn test_probe_reply_for_every_status() {
        let (_panel, coordinator, handle) = start_server().await;
        let addr = handle.local_addr();

        assert_eq!(exchange(addr, "probe\n").await, "idle\n");

        coordinator
            .start_local_call(ParticipantList::parse(["127.0.0.1", "10.0.0.2"]).unwrap())
            .unwrap();
        assert_eq!(exchange(addr, "probe\n").await, "insession\n");

        coordinator.fail("test");
        assert_eq!(exchange(addr, "probe\n").await, "error\n");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_then_quit_from_member() {
        let (panel, coordinator, handle) = start_server().await;
        let addr = handle.local_addr();

        let reply = exchange(addr, "start\n127.0.0.1\n10.0.0.2\ninitialized\n").await;
        assert!(reply.is_empty());
        wait_for_status(&coordinator, Status::Session).await;
        assert_eq!(
            coordinator.current_participants(),
            Some(ParticipantList::parse(["127.0.0.1", "10.0.0.2"]).unwrap())
        );

        // Test connections originate from 127.0.0.1, a listed participant
        assert!(exchange(addr, "quit\n").await.is_empty());
        wait_for_status(&coordinator, Status::Idle).await;
        assert!(panel.events.lock().iter().any(|e| e == "stop"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_quit_from_non_member_ignored() {
        let (panel, coordinator, handle) = start_server().await;
        let addr = handle.local_addr();

        exchange(addr, "start\n10.0.0.1\n10.0.0.2\ninitialized\n").await;
        wait_for_status(&coordinator, Status::Session).await;

        exchange(addr, "quit\n").await;
        // A probe on a fresh connection is served after the quit was handled
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(exchange(addr, "probe\n").await, "insession\n");
        assert!(!panel.events.lock().iter().any(|e| e == "stop"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_handshakes_do_not_kill_listener() {
        let (_panel, coordinator, handle) = start_server().await;
        let addr = handle.local_addr();

        assert!(exchange(addr, "hello\n").await.is_empty());
        assert!(exchange(addr, "start\n10.0.0.1\n").await.is_empty());
        assert_eq!(coordinator.status(), Status::Idle);

        assert_eq!(exchange(addr, "probe\n").await, "idle\n");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_probes() {
        let (_panel, _coordinator, handle) = start_server().await;
        let addr = handle.local_addr();

        // Opens a start handshake and never finishes it
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(b"start\n10.0.0.1\n").await.unwrap();

        assert_eq!(exchange(addr, "probe\n").await, "idle\n");

        // The stalled connection is dropped once the handshake timeout passes
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stalled.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_quit_waits_for_earlier_start_from_same_peer() {
        let (panel, coordinator, handle) = start_server().await;
        let addr = handle.local_addr();

        // Start is accepted first but completes after the quit arrives
        let mut start = TcpStream::connect(addr).await.unwrap();
        start.write_all(b"start\n127.0.0.1\n10.0.0.2\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let quit = tokio::spawn(exchange(addr, "quit\n"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.status(), Status::Idle);

        start.write_all(b"initialized\n").await.unwrap();
        start.shutdown().await.unwrap();
        quit.await.unwrap();

        wait_for_status(&coordinator, Status::Idle).await;
        let events = panel.events.lock().clone();
        assert!(events.iter().any(|e| e.starts_with("start")));
        assert_eq!(events.iter().filter(|e| *e == "stop").count(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let (_panel, _coordinator, handle) = start_server().await;
        let addr = handle.local_addr();
        handle.shutdown().await;

        assert!(TcpListener::bind(addr).await.is_ok());
    }
}
