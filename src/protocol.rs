//! Handshake wire protocol
//!
//! Line-oriented plaintext over TCP. The first line of every connection is a
//! handshake token:
//!
//! ```text
//! probe                      -> server answers one status line, then closes
//! start                      -> followed by one address per line, index 0 is
//! <addr 0>                      the initiator, terminated by the sentinel
//! ...
//! initialized
//! quit                       -> no reply
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::constants::{MAX_LINE_LENGTH, MAX_PARTICIPANTS};
use crate::error::{ProtocolError, SignalingError};

pub const HANDSHAKE_PROBE: &str = "probe";
pub const HANDSHAKE_START: &str = "start";
pub const HANDSHAKE_QUIT: &str = "quit";
/// Terminates the participant list of a start handshake
pub const START_SENTINEL: &str = "initialized";

pub const IDLE_MSG: &str = "idle";
pub const SESSION_MSG: &str = "insession";
pub const ERROR_MSG: &str = "error";

/// Call status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Idle = 1,
    Session = 2,
    Error = 3,
}

impl Status {
    /// Line sent in reply to a probe
    pub fn as_wire(self) -> &'static str {
        match self {
            Status::Idle => IDLE_MSG,
            Status::Session => SESSION_MSG,
            Status::Error => ERROR_MSG,
        }
    }

    /// Interpret a probe reply. Anything unrecognised is `Error`.
    pub fn from_reply(line: &str) -> Status {
        match line {
            IDLE_MSG => Status::Idle,
            SESSION_MSG => Status::Session,
            _ => Status::Error,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Idle,
            2 => Status::Session,
            _ => Status::Error,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Network address of a participant: `host` or `host:port`.
///
/// Kept verbatim so the list crosses the wire byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let invalid = raw.is_empty()
            || raw.len() > MAX_LINE_LENGTH
            || raw.chars().any(|c| c.is_whitespace() || c.is_control())
            || matches!(
                raw,
                HANDSHAKE_PROBE | HANDSHAKE_START | HANDSHAKE_QUIT | START_SENTINEL
            );
        if invalid {
            return Err(ProtocolError::InvalidAddress(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part without any port
    pub fn host(&self) -> &str {
        if self.0.parse::<SocketAddr>().is_ok() {
            // "[v6]:port" or "v4:port"
            if let Some((host, _)) = self.0.rsplit_once(':') {
                return host.trim_start_matches('[').trim_end_matches(']');
            }
        }
        if self.0.parse::<IpAddr>().is_ok() {
            return &self.0;
        }
        match self.0.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => &self.0,
        }
    }

    /// Explicit port, if the address carries one
    pub fn port(&self) -> Option<u16> {
        if let Ok(addr) = self.0.parse::<SocketAddr>() {
            return Some(addr.port());
        }
        if self.0.parse::<IpAddr>().is_ok() {
            return None;
        }
        self.0.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
    }

    /// Host as an IP address, when it is a literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host().parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
    }

    /// Whether a connection from `ip` comes from this participant
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        match self.ip() {
            Some(own) => own == ip,
            None => self.host() == ip.to_string(),
        }
    }

    /// `host:port` to dial for signaling, using `default_port` for bare hosts
    pub fn signaling_target(&self, default_port: u16) -> String {
        let port = self.port().unwrap_or(default_port);
        match self.ip() {
            Some(ip) => SocketAddr::new(ip, port).to_string(),
            None => format!("{}:{}", self.host(), port),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeerAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Ordered participants of a call. Index 0 is the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantList(Vec<PeerAddress>);

impl ParticipantList {
    pub fn new(peers: Vec<PeerAddress>) -> Result<Self, ProtocolError> {
        if peers.is_empty() {
            return Err(ProtocolError::EmptyParticipantList);
        }
        if peers.len() > MAX_PARTICIPANTS {
            return Err(ProtocolError::TooManyParticipants(peers.len()));
        }
        Ok(Self(peers))
    }

    /// Build from raw address strings
    pub fn parse<I, S>(raw: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers = raw
            .into_iter()
            .map(|s| PeerAddress::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(peers)
    }

    pub fn initiator(&self) -> &PeerAddress {
        &self.0[0]
    }

    /// Everyone except the initiator, in call order
    pub fn invitees(&self) -> impl Iterator<Item = (usize, &PeerAddress)> {
        self.0.iter().enumerate().skip(1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddress> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Never true; lists are non-empty by construction
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PeerAddress> {
        self.0.get(index)
    }

    pub fn as_slice(&self) -> &[PeerAddress] {
        &self.0
    }

    pub fn position(&self, peer: &PeerAddress) -> Option<usize> {
        self.0.iter().position(|p| p == peer)
    }

    /// Whether a connection from `ip` belongs to a listed participant
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.0.iter().any(|p| p.matches_ip(ip))
    }
}

/// One handshake as carried on a signaling connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Probe,
    Start(ParticipantList),
    Quit,
}

impl Handshake {
    pub fn token(&self) -> &'static str {
        match self {
            Handshake::Probe => HANDSHAKE_PROBE,
            Handshake::Start(_) => HANDSHAKE_START,
            Handshake::Quit => HANDSHAKE_QUIT,
        }
    }

    /// Wire form, newline terminated
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(self.token());
        out.push('\n');
        if let Handshake::Start(list) = self {
            for peer in list.iter() {
                out.push_str(peer.as_str());
                out.push('\n');
            }
            out.push_str(START_SENTINEL);
            out.push('\n');
        }
        out
    }
}

/// Read one handshake, including the participant list of a start
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, SignalingError>
where
    R: AsyncBufRead + Unpin,
{
    let token = read_line(reader).await?;
    match token.as_str() {
        HANDSHAKE_PROBE => Ok(Handshake::Probe),
        HANDSHAKE_QUIT => Ok(Handshake::Quit),
        HANDSHAKE_START => {
            let mut peers = Vec::new();
            loop {
                let line = read_line(reader).await?;
                if line == START_SENTINEL {
                    break;
                }
                if peers.len() == MAX_PARTICIPANTS {
                    return Err(ProtocolError::TooManyParticipants(peers.len() + 1).into());
                }
                peers.push(PeerAddress::parse(&line)?);
            }
            Ok(Handshake::Start(ParticipantList::new(peers)?))
        }
        _ => Err(ProtocolError::UnknownToken(token).into()),
    }
}

/// Read one line without its terminator.
///
/// A final line lacking a newline is accepted; lines longer than
/// `MAX_LINE_LENGTH` are rejected.
pub async fn read_line<R>(reader: &mut R) -> Result<String, SignalingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(ProtocolError::UnexpectedEof.into());
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_LENGTH {
        return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH).into());
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
