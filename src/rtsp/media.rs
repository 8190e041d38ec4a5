use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    time::{Instant, SystemTime},
};

use encoder_bus::FrameReader;

use crate::rtsp::{
    response::SERVER_NAME,
    rtp::{Packetizer, RTCP_BYE, RTCP_INTERVAL, rtcp_packet_type},
    transport::{Delivery, TransportDescriptor},
};

/// Frames taken per track in one pass, so a slow client cannot keep the
/// serving thread away from its RTSP requests.
const MAX_FRAMES_PER_PASS: usize = 8;

/// RTP carried on the RTSP connection itself (`$` framing).
pub trait InterleavedSink {
    fn send_interleaved(&mut self, channel: u8, packet: &[u8]) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub rtp_sent: usize,
    pub rtcp_received: usize,
}

enum Route {
    /// UDP sockets are bound when playback first starts.
    Unbound,
    Udp {
        rtp: UdpSocket,
        rtcp: UdpSocket,
        client_rtp: SocketAddr,
        client_rtcp: SocketAddr,
    },
    Interleaved {
        rtp: u8,
        rtcp: u8,
    },
    /// Nowhere to send; the track stays silent.
    Closed,
}

/// Delivers one track's frames to the client over the negotiated transport.
pub struct TrackSender {
    track: u8,
    transport: TransportDescriptor,
    peer: Option<IpAddr>,
    reader: FrameReader,
    packetizer: Packetizer,
    route: Route,
    next_report: Option<Instant>,
}

impl TrackSender {
    pub fn new(
        transport: &TransportDescriptor,
        peer: Option<IpAddr>,
        reader: FrameReader,
        packetizer: Packetizer,
    ) -> Self {
        Self {
            track: transport.track,
            transport: transport.clone(),
            peer,
            reader,
            packetizer,
            route: Route::Unbound,
            next_report: None,
        }
    }

    pub fn track(&self) -> u8 {
        self.track
    }

    pub fn packetizer(&self) -> &Packetizer {
        &self.packetizer
    }

    /// Restart from the next keyframe; used when playback (re)starts.
    pub fn resync(&mut self) {
        self.reader.resync();
        self.next_report = None;
    }

    fn open_route(&mut self) {
        if !matches!(self.route, Route::Unbound) {
            return;
        }
        self.route = match self.transport.delivery {
            Delivery::Interleaved => {
                let (rtp, rtcp) = self.transport.interleaved.unwrap_or((0, 1));
                Route::Interleaved { rtp, rtcp }
            }
            Delivery::Datagram => match self.bind_udp() {
                Ok(route) => route,
                Err(e) => {
                    log::warn!("track{}: cannot open UDP delivery: {}", self.track, e);
                    Route::Closed
                }
            },
        };
    }

    fn bind_udp(&self) -> io::Result<Route> {
        let (Some(peer), Some(client), Some(server)) =
            (self.peer, self.transport.client_ports, self.transport.server_ports)
        else {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no client address or port pair",
            ));
        };
        let any = match peer {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let rtp = UdpSocket::bind((any, server.rtp))?;
        let rtcp = UdpSocket::bind((any, server.rtcp))?;
        rtcp.set_nonblocking(true)?;
        log::debug!(
            "track{}: sending {} -> {}:{}",
            self.track,
            server,
            peer,
            client
        );
        Ok(Route::Udp {
            rtp,
            rtcp,
            client_rtp: SocketAddr::new(peer, client.rtp),
            client_rtcp: SocketAddr::new(peer, client.rtcp),
        })
    }

    /// Send whatever the encoder produced since the last pass, plus a sender
    /// report when one is due. Only errors on the RTSP connection itself are
    /// returned; UDP send failures are the client's problem and are logged.
    pub fn pass(&mut self, tcp: &mut dyn InterleavedSink, now: Instant) -> io::Result<PassReport> {
        self.open_route();
        let mut report = PassReport {
            rtcp_received: self.drain_rtcp(),
            ..Default::default()
        };
        if matches!(self.route, Route::Closed) {
            return Ok(report);
        }

        for _ in 0..MAX_FRAMES_PER_PASS {
            let frame = match self.reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return Err(io::Error::other(format!("track{}: {:#}", self.track, e))),
            };
            for packet in self.packetizer.packetize(&frame) {
                self.send(tcp, &packet, false)?;
                report.rtp_sent += 1;
            }
        }

        if self.packetizer.packets() > 0 {
            let due = *self.next_report.get_or_insert(now);
            if now >= due {
                let sr = self.packetizer.sender_report(SystemTime::now(), SERVER_NAME);
                self.send(tcp, &sr, true)?;
                self.next_report = Some(now + RTCP_INTERVAL);
            }
        }
        Ok(report)
    }

    fn send(&self, tcp: &mut dyn InterleavedSink, packet: &[u8], control: bool) -> io::Result<()> {
        match &self.route {
            Route::Udp {
                rtp,
                rtcp,
                client_rtp,
                client_rtcp,
            } => {
                let (socket, target) = if control { (rtcp, client_rtcp) } else { (rtp, client_rtp) };
                if let Err(e) = socket.send_to(packet, target) {
                    log::trace!("track{}: send to {} failed: {}", self.track, target, e);
                }
                Ok(())
            }
            Route::Interleaved { rtp, rtcp } => {
                tcp.send_interleaved(if control { *rtcp } else { *rtp }, packet)
            }
            Route::Unbound | Route::Closed => Ok(()),
        }
    }

    /// Receiver reports arriving on the RTCP port. Each valid one counts as
    /// client activity.
    fn drain_rtcp(&self) -> usize {
        let Route::Udp { rtcp, .. } = &self.route else {
            return 0;
        };
        let mut buf = [0u8; 1500];
        let mut received = 0;
        loop {
            match rtcp.recv_from(&mut buf) {
                Ok((len, from)) => match rtcp_packet_type(&buf[..len]) {
                    Some(RTCP_BYE) => {
                        log::debug!("track{}: RTCP BYE from {}", self.track, from);
                        received += 1;
                    }
                    Some(_) => received += 1,
                    None => log::trace!("track{}: ignoring non-RTCP datagram from {}", self.track, from),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::trace!("track{}: RTCP receive failed: {}", self.track, e);
                    break;
                }
            }
        }
        received
    }
}

impl std::fmt::Debug for TrackSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackSender")
            .field("track", &self.track)
            .field("delivery", &self.transport.delivery)
            .field("packets", &self.packetizer.packets())
            .finish()
    }
}
