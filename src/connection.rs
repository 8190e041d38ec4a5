use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use bytes::BytesMut;

use crate::{
    error::MediaError,
    rtsp::{Request, Response, media::InterleavedSink, request},
};

const READ_CHUNK: usize = 4096;

pub enum Incoming {
    Request(Request),
    /// Nothing complete arrived within the read timeout.
    Idle,
    /// Peer closed the stream.
    Closed,
    Malformed(MediaError),
}

/// One accepted client stream with its read buffer. Owned by the pool queue
/// until a worker takes it, then by that worker until it is dropped.
pub struct Connection {
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    buf: BytesMut,
    last_rx: Instant,
    interleaved_rx: usize,
}

impl Connection {
    pub fn new(id: u64, stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr().ok();
        stream.set_nodelay(true)?;
        Ok(Self {
            id,
            stream,
            peer,
            local,
            buf: BytesMut::with_capacity(READ_CHUNK),
            last_rx: Instant::now(),
            interleaved_rx: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Host part clients used to reach us, for SDP origin lines.
    pub fn local_host(&self) -> String {
        self.local
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_rx)
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    /// Next request, reading from the socket at most once.
    pub fn poll_request(&mut self) -> io::Result<Incoming> {
        if let Some(incoming) = self.framed() {
            return Ok(incoming);
        }

        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Ok(Incoming::Closed),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                self.last_rx = Instant::now();
                Ok(self.framed().unwrap_or(Incoming::Idle))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Incoming::Idle)
            }
            Err(e) => Err(e),
        }
    }

    /// Interleaved frames received from the client since the last call.
    pub fn take_interleaved(&mut self) -> usize {
        std::mem::take(&mut self.interleaved_rx)
    }

    fn framed(&mut self) -> Option<Incoming> {
        self.interleaved_rx += request::skip_interleaved(&mut self.buf);
        match request::parse(&mut self.buf) {
            Ok(Some(req)) => Some(Incoming::Request(req)),
            Ok(None) => None,
            Err(err) => {
                self.buf.clear();
                Some(Incoming::Malformed(err))
            }
        }
    }

    pub fn send(&mut self, response: &Response) -> io::Result<()> {
        self.stream.write_all(&response.encode())?;
        self.stream.flush()
    }
}

impl InterleavedSink for Connection {
    fn send_interleaved(&mut self, channel: u8, packet: &[u8]) -> io::Result<()> {
        let len = u16::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interleaved packet too large"))?;
        let mut frame = Vec::with_capacity(4 + packet.len());
        frame.push(b'$');
        frame.push(channel);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(packet);
        self.stream.write_all(&frame)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}
