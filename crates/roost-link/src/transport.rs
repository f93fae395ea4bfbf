//! Byte transports under the link layer.
//!
//! Every transport splits into a reader half (owned by a blocking reader
//! thread) and a writer half (shared with the command dispatcher). Reads
//! are bounded: `recv` returns `Ok(None)` when nothing arrived inside the
//! poll window, so reader threads can check their stop flag instead of
//! parking forever inside the OS.

use std::collections::VecDeque;
use std::io::{self, Cursor, Write as _};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavlink::common::MavMessage;
use mavlink::error::MessageReadError;
use mavlink::{MavConnection, MavHeader};
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use crate::error::LinkError;

/// Poll window for bounded reads.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed connect URL, `scheme:address:number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    /// Listen semantics: bind locally, learn the autopilot's address from
    /// its first datagram.
    Udp { host: String, port: u16 },
    Serial { dev: String, baud: u32 },
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, LinkError> {
        if let Some(rest) = url.strip_prefix("tcp:") {
            let (host, port) = split_host_port(url, rest)?;
            return Ok(Endpoint::Tcp { host, port });
        }
        if let Some(rest) = url.strip_prefix("udp:") {
            let (host, port) = split_host_port(url, rest)?;
            return Ok(Endpoint::Udp { host, port });
        }
        if let Some(rest) = url.strip_prefix("serial:") {
            let mut it = rest.rsplitn(2, ':');
            let baud_part = it.next().unwrap_or_default();
            let dev = it
                .next()
                .ok_or_else(|| LinkError::Endpoint(format!("{} (missing baud)", url)))?;
            let baud: u32 = baud_part
                .parse()
                .map_err(|_| LinkError::Endpoint(format!("{} (bad baud)", url)))?;
            return Ok(Endpoint::Serial { dev: dev.to_string(), baud });
        }
        Err(LinkError::Endpoint(format!(
            "{} (expected tcp:, udp: or serial:)",
            url
        )))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Endpoint::Udp { host, port } => write!(f, "udp:{}:{}", host, port),
            Endpoint::Serial { dev, baud } => write!(f, "serial:{}:{}", dev, baud),
        }
    }
}

fn split_host_port(url: &str, rest: &str) -> Result<(String, u16), LinkError> {
    let mut it = rest.rsplitn(2, ':');
    let port_part = it.next().unwrap_or_default();
    let host = it
        .next()
        .ok_or_else(|| LinkError::Endpoint(format!("{} (missing port)", url)))?;
    let port: u16 = port_part
        .parse()
        .map_err(|_| LinkError::Endpoint(format!("{} (bad port)", url)))?;
    Ok((host.to_string(), port))
}

pub trait TransportReader: Send {
    /// Bounded read. `Ok(None)` means nothing arrived this poll window;
    /// `Err` means the transport is gone.
    fn recv(&mut self) -> Result<Option<(MavHeader, MavMessage)>, LinkError>;
}

pub trait TransportWriter: Send {
    fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> Result<(), LinkError>;
}

pub struct TransportPair {
    pub label: String,
    pub reader: Box<dyn TransportReader>,
    pub writer: Box<dyn TransportWriter>,
}

pub fn open(endpoint: &Endpoint) -> Result<TransportPair, LinkError> {
    match endpoint {
        Endpoint::Tcp { host, port } => open_tcp(host, *port),
        Endpoint::Udp { host, port } => open_udp(host, *port),
        Endpoint::Serial { dev, baud } => open_serial(dev, *baud),
    }
}

fn idle_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

// ----- TCP -----

struct TcpReader {
    stream: TcpStream,
}

struct TcpWriter {
    stream: TcpStream,
}

fn open_tcp(host: &str, port: u16) -> Result<TransportPair, LinkError> {
    let addr = resolve(host, port)?;
    let stream = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let writer = stream.try_clone()?;
    Ok(TransportPair {
        label: format!("tcp:{}:{}", host, port),
        reader: Box::new(TcpReader { stream }),
        writer: Box::new(TcpWriter { stream: writer }),
    })
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, LinkError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| LinkError::Endpoint(format!("{}:{} did not resolve", host, port)))
}

impl TransportReader for TcpReader {
    fn recv(&mut self) -> Result<Option<(MavHeader, MavMessage)>, LinkError> {
        match mavlink::read_v2_msg::<MavMessage, _>(&mut self.stream) {
            Ok(frame) => Ok(Some(frame)),
            Err(MessageReadError::Io(e)) if idle_io(&e) => Ok(None),
            Err(MessageReadError::Io(e)) => Err(LinkError::TransportRead(e.to_string())),
            // Unknown-dialect noise; the parser resyncs on the next magic byte.
            Err(_) => Ok(None),
        }
    }
}

impl TransportWriter for TcpWriter {
    fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> Result<(), LinkError> {
        mavlink::write_v2_msg(&mut self.stream, *header, msg)
            .map_err(|e| LinkError::TransportRead(e.to_string()))?;
        self.stream.flush()?;
        Ok(())
    }
}

// ----- UDP -----

struct UdpReader {
    socket: Arc<UdpSocket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    pending: VecDeque<(MavHeader, MavMessage)>,
    buf: Vec<u8>,
}

struct UdpWriter {
    socket: Arc<UdpSocket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
}

fn open_udp(host: &str, port: u16) -> Result<TransportPair, LinkError> {
    let socket = UdpSocket::bind((host, port))?;
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    let socket = Arc::new(socket);
    let peer = Arc::new(Mutex::new(None));
    Ok(TransportPair {
        label: format!("udp:{}:{}", host, port),
        reader: Box::new(UdpReader {
            socket: socket.clone(),
            peer: peer.clone(),
            pending: VecDeque::new(),
            buf: vec![0u8; 2048],
        }),
        writer: Box::new(UdpWriter { socket, peer }),
    })
}

impl TransportReader for UdpReader {
    fn recv(&mut self) -> Result<Option<(MavHeader, MavMessage)>, LinkError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        match self.socket.recv_from(&mut self.buf) {
            Ok((n, from)) => {
                *self.peer.lock().unwrap() = Some(from);
                // One datagram can carry several frames.
                let mut cursor = Cursor::new(&self.buf[..n]);
                while let Ok(frame) = mavlink::read_v2_msg::<MavMessage, _>(&mut cursor) {
                    self.pending.push_back(frame);
                }
                Ok(self.pending.pop_front())
            }
            Err(e) if idle_io(&e) => Ok(None),
            Err(e) => Err(LinkError::TransportRead(e.to_string())),
        }
    }
}

impl TransportWriter for UdpWriter {
    fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> Result<(), LinkError> {
        let peer = *self.peer.lock().unwrap();
        let Some(peer) = peer else {
            debug!("udp: dropping send, peer not learned yet");
            return Ok(());
        };
        let mut frame = Vec::with_capacity(296);
        mavlink::write_v2_msg(&mut frame, *header, msg)
            .map_err(|e| LinkError::TransportRead(e.to_string()))?;
        self.socket.send_to(&frame, peer)?;
        Ok(())
    }
}

// ----- Serial -----

struct SerialReader {
    conn: Arc<dyn MavConnection<MavMessage> + Sync + Send>,
}

struct SerialWriter {
    conn: Arc<dyn MavConnection<MavMessage> + Sync + Send>,
}

fn open_serial(dev: &str, baud: u32) -> Result<TransportPair, LinkError> {
    // Quick validate the device before handing it to the mavlink crate.
    let _ = tokio_serial::new(dev, baud)
        .open_native_async()
        .map_err(|e| LinkError::Endpoint(format!("serial:{}:{} ({})", dev, baud, e)))?;

    let url = format!("serial:{}:{}", dev, baud);
    let conn = mavlink::connect::<MavMessage>(&url)
        .map_err(|e| LinkError::Endpoint(format!("{} ({})", url, e)))?;
    let conn: Arc<dyn MavConnection<MavMessage> + Sync + Send> = Arc::from(conn);
    Ok(TransportPair {
        label: url,
        reader: Box::new(SerialReader { conn: conn.clone() }),
        writer: Box::new(SerialWriter { conn }),
    })
}

impl TransportReader for SerialReader {
    /// Best-effort: recv failures read as an empty poll.
    fn recv(&mut self) -> Result<Option<(MavHeader, MavMessage)>, LinkError> {
        match self.conn.recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(_) => Ok(None),
        }
    }
}

impl TransportWriter for SerialWriter {
    fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> Result<(), LinkError> {
        self.conn
            .send(header, msg)
            .map(|_| ())
            .map_err(|e| LinkError::TransportRead(e.to_string()))
    }
}

// ----- In-process channel -----

/// Far end of a [`channel_pair`], held by a scripted autopilot peer in
/// tests.
pub struct ChannelPeer {
    tx: mpsc::Sender<(MavHeader, MavMessage)>,
    rx: mpsc::Receiver<(MavHeader, MavMessage)>,
}

impl ChannelPeer {
    /// False when the link side has been torn down.
    pub fn send(&self, header: MavHeader, msg: MavMessage) -> bool {
        self.tx.send((header, msg)).is_ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<(MavHeader, MavMessage)> {
        self.rx.recv_timeout(timeout).ok()
    }
}

struct ChannelReader {
    rx: mpsc::Receiver<(MavHeader, MavMessage)>,
}

struct ChannelWriter {
    tx: mpsc::Sender<(MavHeader, MavMessage)>,
}

/// Paired in-process endpoints: the link side drives one, the test's
/// scripted peer drives the other.
pub fn channel_pair(label: &str) -> (TransportPair, ChannelPeer) {
    let (to_link, from_peer) = mpsc::channel();
    let (to_peer, from_link) = mpsc::channel();
    let pair = TransportPair {
        label: label.to_string(),
        reader: Box::new(ChannelReader { rx: from_peer }),
        writer: Box::new(ChannelWriter { tx: to_peer }),
    };
    let peer = ChannelPeer { tx: to_link, rx: from_link };
    (pair, peer)
}

impl TransportReader for ChannelReader {
    fn recv(&mut self) -> Result<Option<(MavHeader, MavMessage)>, LinkError> {
        match self.rx.recv_timeout(Duration::from_millis(50)) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(LinkError::TransportRead("peer endpoint closed".into()))
            }
        }
    }
}

impl TransportWriter for ChannelWriter {
    fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> Result<(), LinkError> {
        self.tx
            .send((*header, msg.clone()))
            .map_err(|_| LinkError::TransportRead("peer endpoint closed".into()))
    }
}
