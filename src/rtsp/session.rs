use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
    time::{Duration, Instant},
};

use encoder_bus::{StreamLease, StreamRouter};
use serde::Serialize;

use crate::{
    capability::MediaCapability,
    error::{MediaError, ProtocolFault},
    rtsp::{
        media::{InterleavedSink, TrackSender},
        ports::{PortAllocator, PortLease},
        rtp::{Packetizer, PayloadFormat},
        sdp::{AUDIO_TRACK, VIDEO_TRACK},
        transport::{self, TransportDescriptor},
    },
};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Described,
    Setup,
    Playing,
    Paused,
    TornDown,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Described => "DESCRIBED",
            SessionState::Setup => "SETUP",
            SessionState::Playing => "PLAYING",
            SessionState::Paused => "PAUSED",
            SessionState::TornDown => "TORN_DOWN",
        };
        f.write_str(name)
    }
}

/// Random 64-bit session identifier, upper-case hex.
pub fn new_session_id() -> String {
    let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
    format!("{:016X}", high)
}

struct Track {
    transport: TransportDescriptor,
    sender: Option<TrackSender>,
    // held for as long as the track is configured
    _ports: Option<PortLease>,
}

/// One client's RTSP conversation.
///
/// A session is owned by the worker serving its connection and is never
/// shared, so it carries no lock. Whatever path ends it (TEARDOWN, idle
/// expiry, disconnect, or the owner dropping it) the router lease is released
/// exactly once: the lease is an owned value that is taken out of the session
/// the first time and dropped.
pub struct Session {
    id: String,
    state: SessionState,
    profile: Option<MediaCapability>,
    tracks: Vec<Track>,
    lease: Option<StreamLease>,
    issued: bool,
    router: StreamRouter,
    ports: PortAllocator,
    peer: Option<IpAddr>,
    default_timeout: Duration,
    timeout: Duration,
    created: Instant,
    last_activity: Instant,
    rtp_seq: u16,
    rtp_time: u32,
}

impl Session {
    pub fn new(
        id: String,
        router: StreamRouter,
        ports: PortAllocator,
        default_timeout: Duration,
        now: Instant,
    ) -> Self {
        let (a, b) = uuid::Uuid::new_v4().as_u64_pair();
        Self {
            id,
            state: SessionState::Init,
            profile: None,
            tracks: Vec::new(),
            lease: None,
            issued: false,
            router,
            ports,
            peer: None,
            default_timeout,
            timeout: default_timeout,
            created: now,
            last_activity: now,
            rtp_seq: a as u16,
            rtp_time: b as u32,
        }
    }

    /// Client address UDP media is sent to.
    pub fn with_peer(mut self, peer: IpAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> Option<&MediaCapability> {
        self.profile.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// True once SETUP has handed the session id to the client.
    pub fn issued(&self) -> bool {
        self.issued
    }

    /// Whether the session holds a router reference.
    pub fn acquired(&self) -> bool {
        self.lease.is_some()
    }

    pub fn lease(&self) -> Option<&StreamLease> {
        self.lease.as_ref()
    }

    pub fn transports(&self) -> impl Iterator<Item = &TransportDescriptor> {
        self.tracks.iter().map(|t| &t.transport)
    }

    /// `Session` response header value.
    pub fn header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout.as_secs())
    }

    pub fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Idle longer than the timeout. Exactly `timeout` of idleness is not yet
    /// expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::debug!("session {}: {} -> {}", self.id, self.state, next);
            self.state = next;
        }
    }

    fn invalid(&self, verb: &str) -> MediaError {
        MediaError::protocol(
            ProtocolFault::MethodNotValidInState,
            format!("{} not valid in state {}", verb, self.state),
        )
    }

    fn adopt_profile(&mut self, cap: &MediaCapability) {
        self.timeout = cap.session_timeout.unwrap_or(self.default_timeout);
        self.profile = Some(cap.clone());
    }

    pub fn describe(&mut self, cap: &MediaCapability, now: Instant) -> Result<(), MediaError> {
        match self.state {
            SessionState::Init | SessionState::Described => {}
            _ => return Err(self.invalid("DESCRIBE")),
        }
        self.adopt_profile(cap);
        self.transition(SessionState::Described);
        self.touch(now);
        Ok(())
    }

    /// Configure one track.
    ///
    /// The steps run in a fixed order: transport negotiation, state check,
    /// track check, router acquire (first track only), port allocation. A
    /// failure at any step leaves the session as it was before the call.
    pub fn setup(
        &mut self,
        cap: &MediaCapability,
        track: u8,
        transport_header: &str,
        uri: &str,
        now: Instant,
    ) -> Result<&TransportDescriptor, MediaError> {
        let mut descriptor = transport::negotiate(transport_header, track, uri)?;

        let first = match self.state {
            SessionState::Init | SessionState::Described => true,
            SessionState::Setup | SessionState::Paused => false,
            _ => return Err(self.invalid("SETUP")),
        };
        if !first {
            let current = self.profile.as_ref().map(|p| p.token.as_str());
            if current != Some(cap.token.as_str()) {
                return Err(MediaError::protocol(
                    ProtocolFault::MethodNotValidInState,
                    format!("session is bound to profile {:?}", current),
                ));
            }
        }

        let valid_track = track == VIDEO_TRACK || (track == AUDIO_TRACK && cap.audio_enabled);
        if !valid_track {
            return Err(MediaError::protocol(
                ProtocolFault::NotFound,
                format!("profile {:?} has no track{}", cap.token, track),
            ));
        }
        if self.tracks.iter().any(|t| t.transport.track == track) {
            return Err(MediaError::protocol(
                ProtocolFault::MethodNotValidInState,
                format!("track{} already set up", track),
            ));
        }

        let new_lease = if first {
            Some(self.router.acquire(&cap.token)?)
        } else {
            None
        };

        let port_lease = if descriptor.needs_ports() {
            // on failure `new_lease` drops here and releases the router
            let lease = self.ports.allocate()?;
            descriptor.server_ports = Some(lease.ports());
            Some(lease)
        } else {
            None
        };

        let sender = self.track_sender(&descriptor, new_lease.as_ref());
        if let Some(lease) = new_lease {
            self.lease = Some(lease);
            self.adopt_profile(cap);
        }
        self.issued = true;
        log::debug!(
            "session {}: track{} -> {}",
            self.id,
            track,
            descriptor.header_value()
        );
        self.tracks.push(Track {
            transport: descriptor,
            sender,
            _ports: port_lease,
        });
        if first {
            self.transition(SessionState::Setup);
        }
        self.touch(now);

        let index = self.tracks.len() - 1;
        Ok(&self.tracks[index].transport)
    }

    fn track_sender(
        &self,
        descriptor: &TransportDescriptor,
        new_lease: Option<&StreamLease>,
    ) -> Option<TrackSender> {
        let lease = new_lease.or(self.lease.as_ref())?;
        let (reader, format) = if descriptor.track == VIDEO_TRACK {
            (Some(lease.video_reader()), PayloadFormat::H264)
        } else {
            (lease.audio_reader(), PayloadFormat::Pcma)
        };
        let Some(reader) = reader else {
            log::warn!(
                "session {}: profile {:?} has no audio encoder bound, track{} stays silent",
                self.id,
                lease.token(),
                descriptor.track
            );
            return None;
        };
        let ssrc = uuid::Uuid::new_v4().as_u64_pair().0 as u32;
        let packetizer = Packetizer::new(format, ssrc, self.rtp_seq, self.rtp_time);
        Some(TrackSender::new(descriptor, self.peer, reader, packetizer))
    }

    pub fn play(&mut self, now: Instant) -> Result<(), MediaError> {
        match self.state {
            SessionState::Setup | SessionState::Paused | SessionState::Playing => {}
            _ => return Err(self.invalid("PLAY")),
        }
        if self.state != SessionState::Playing {
            for sender in self.tracks.iter_mut().filter_map(|t| t.sender.as_mut()) {
                sender.resync();
            }
        }
        self.transition(SessionState::Playing);
        self.touch(now);
        Ok(())
    }

    pub fn pause(&mut self, now: Instant) -> Result<(), MediaError> {
        match self.state {
            SessionState::Playing | SessionState::Paused => {}
            _ => return Err(self.invalid("PAUSE")),
        }
        self.transition(SessionState::Paused);
        self.touch(now);
        Ok(())
    }

    /// GET_PARAMETER / SET_PARAMETER liveness ping.
    pub fn keepalive(&mut self, now: Instant) -> Result<(), MediaError> {
        if self.state == SessionState::TornDown {
            return Err(self.invalid("keep-alive"));
        }
        self.touch(now);
        Ok(())
    }

    /// `RTP-Info` header value for the configured tracks.
    pub fn rtp_info(&self, base_uri: &str) -> String {
        let base = base_uri.trim_end_matches('/');
        let mut tracks: Vec<(u8, u16, u32)> = self
            .tracks
            .iter()
            .map(|t| match &t.sender {
                Some(sender) => (
                    t.transport.track,
                    sender.packetizer().next_seq(),
                    sender.packetizer().rtptime(),
                ),
                None => (t.transport.track, self.rtp_seq, self.rtp_time),
            })
            .collect();
        tracks.sort_unstable();
        tracks
            .iter()
            .map(|(track, seq, rtptime)| {
                format!("url={}/track{};seq={};rtptime={}", base, track, seq, rtptime)
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Send the media produced since the last call. Does nothing unless
    /// playing. RTCP from the client counts as activity.
    ///
    /// Returns the number of RTP packets sent. An error means the RTSP
    /// connection (or the encoder stream) is gone.
    pub fn pump(&mut self, tcp: &mut dyn InterleavedSink, now: Instant) -> Result<usize, MediaError> {
        if self.state != SessionState::Playing {
            return Ok(0);
        }
        let mut sent = 0;
        let mut heard = false;
        for sender in self.tracks.iter_mut().filter_map(|t| t.sender.as_mut()) {
            let report = sender.pass(tcp, now)?;
            sent += report.rtp_sent;
            heard |= report.rtcp_received > 0;
        }
        if heard {
            self.touch(now);
        }
        Ok(sent)
    }

    /// RTP packets sent on all tracks.
    pub fn packets_sent(&self) -> u64 {
        self.tracks
            .iter()
            .filter_map(|t| t.sender.as_ref())
            .map(|s| u64::from(s.packetizer().packets()))
            .sum()
    }

    /// End the session. Returns true when this call released the router
    /// reference; later calls are no-ops that return false.
    pub fn teardown(&mut self) -> bool {
        self.tracks.clear();
        let released = match self.lease.take() {
            Some(lease) => {
                lease.release();
                true
            }
            None => false,
        };
        self.transition(SessionState::TornDown);
        released
    }

    /// Transport-layer hook for every connection-loss path.
    pub fn on_disconnect(&mut self) -> bool {
        let released = self.teardown();
        if released {
            log::info!("session {}: client gone without TEARDOWN, released stream", self.id);
        }
        released
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("acquired", &self.acquired())
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
