//! UDP media sessions
//!
//! Plain datagram transport standing in for an RTP stack: one data socket
//! and one control socket per session. Payloads are carried unframed.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::MediaError;
use crate::network::session::{FrameHandler, MediaSender, MediaSession, MediaTransport, PortPair};

/// Socket receive buffer size
const RECV_BUFFER_SIZE: usize = 256 * 1024;

/// Read timeout so receive threads notice `close()`
const RECV_POLL: Duration = Duration::from_millis(50);

/// Create a UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr) -> Result<UdpSocket, MediaError> {
    let bind_failed = |source| MediaError::BindFailed {
        port: addr.port(),
        source,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_failed)?;
    socket
        .set_recv_buffer_size(RECV_BUFFER_SIZE)
        .map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;

    Ok(socket.into())
}

/// Opens UDP media sessions on one local address
pub struct UdpTransport {
    bind_ip: IpAddr,
}

impl UdpTransport {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

impl MediaTransport for UdpTransport {
    fn open_inbound(
        &self,
        remote: IpAddr,
        local: PortPair,
        on_frame: FrameHandler,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        let session = UdpInboundSession::open(self.bind_ip, remote, local, on_frame)?;
        Ok(Box::new(session))
    }

    fn open_outbound(
        &self,
        remote: IpAddr,
        remote_ports: PortPair,
    ) -> Result<Box<dyn MediaSender>, MediaError> {
        let session = UdpOutboundSession::open(self.bind_ip, remote, remote_ports)?;
        Ok(Box::new(session))
    }
}

/// Receives frames from one peer on a dedicated thread
pub struct UdpInboundSession {
    local: PortPair,
    running: Arc<AtomicBool>,
    packets_received: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
    // Held open so the control port stays reserved for this leg
    _control: UdpSocket,
}

impl UdpInboundSession {
    pub fn open(
        bind_ip: IpAddr,
        remote: IpAddr,
        local: PortPair,
        on_frame: FrameHandler,
    ) -> Result<Self, MediaError> {
        let data = create_socket(SocketAddr::new(bind_ip, local.data))?;
        let control = create_socket(SocketAddr::new(bind_ip, local.control))?;
        let bound = PortPair {
            data: data.local_addr().map_err(|e| bind_error(local.data, e))?.port(),
            control: control.local_addr().map_err(|e| bind_error(local.control, e))?.port(),
        };
        data.set_read_timeout(Some(RECV_POLL))
            .map_err(|e| bind_error(bound.data, e))?;

        let running = Arc::new(AtomicBool::new(true));
        let packets_received = Arc::new(AtomicU64::new(0));

        let running_for_loop = running.clone();
        let received = packets_received.clone();
        let remote = remote.to_canonical();

        tracing::info!("Receiving from {} on ports {}/{}", remote, bound.data, bound.control);

        let handle = thread::Builder::new()
            .name(format!("media-rx-{}", bound.data))
            .spawn(move || {
                // One spare byte so a datagram that filled the buffer is known to be cut
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
                while running_for_loop.load(Ordering::Relaxed) {
                    match data.recv_from(&mut buf) {
                        Ok((n, from)) => {
                            if from.ip().to_canonical() != remote {
                                tracing::trace!("Ignoring datagram from {}", from);
                                continue;
                            }
                            if n > MAX_DATAGRAM_SIZE {
                                tracing::warn!("Dropping truncated datagram from {}", from);
                                continue;
                            }
                            received.fetch_add(1, Ordering::Relaxed);
                            on_frame(&buf[..n]);
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => {
                            tracing::error!("Media receive failed: {}", e);
                            break;
                        }
                    }
                }
                tracing::debug!("Media receiver on port {} stopped", bound.data);
            })
            .map_err(|e| bind_error(bound.data, e))?;

        Ok(Self {
            local: bound,
            running,
            packets_received,
            thread_handle: Some(handle),
            _control: control,
        })
    }

}

impl MediaSession for UdpInboundSession {
    fn local_ports(&self) -> PortPair {
        self.local
    }

    fn packets(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpInboundSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sends frames to one peer's data port
pub struct UdpOutboundSession {
    local: PortPair,
    target: SocketAddr,
    data: UdpSocket,
    _control: UdpSocket,
    closed: AtomicBool,
    packets_sent: AtomicU64,
    // Serialises sends so frames leave in submission order
    send_lock: Mutex<()>,
}

impl UdpOutboundSession {
    pub fn open(bind_ip: IpAddr, remote: IpAddr, remote_ports: PortPair) -> Result<Self, MediaError> {
        let data = create_socket(SocketAddr::new(bind_ip, 0))?;
        let control = create_socket(SocketAddr::new(bind_ip, 0))?;
        let local = PortPair {
            data: data.local_addr().map_err(|e| bind_error(0, e))?.port(),
            control: control.local_addr().map_err(|e| bind_error(0, e))?.port(),
        };
        let target = SocketAddr::new(remote, remote_ports.data);

        tracing::info!(
            "Sending to {} ports {}/{} from {}/{}",
            remote,
            remote_ports.data,
            remote_ports.control,
            local.data,
            local.control
        );

        Ok(Self {
            local,
            target,
            data,
            _control: control,
            closed: AtomicBool::new(false),
            packets_sent: AtomicU64::new(0),
            send_lock: Mutex::new(()),
        })
    }

}

impl MediaSession for UdpOutboundSession {
    fn local_ports(&self) -> PortPair {
        self.local
    }

    fn packets(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MediaSender for UdpOutboundSession {
    fn send(&self, payload: &[u8]) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        let _guard = self.send_lock.lock();
        self.data
            .send_to(payload, self.target)
            .map_err(MediaError::SendFailed)?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn bind_error(port: u16, source: std::io::Error) -> MediaError {
    MediaError::BindFailed { port, source }
}
