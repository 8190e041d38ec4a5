use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use encoder_bus::StreamRouter;

use crate::{
    capability::CapabilityProvider,
    connection::{Connection, Incoming},
    error::{MediaError, ProtocolFault},
    pool::{Dispatch, WorkerContext},
    rtsp::{
        auth::Authenticator,
        media::InterleavedSink,
        ports::PortAllocator,
        registry::{SessionRegistry, SessionSummary},
        request::{Method, RTSP_VERSION, Request, split_track},
        response::{Response, StatusCode},
        sdp,
        session::{Session, SessionState, new_session_id},
        transport,
    },
};

pub const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

/// Read timeout while media is flowing; bounds the latency of the next
/// frame behind a quiet RTSP connection.
pub const MEDIA_TICK: Duration = Duration::from_millis(10);

/// The session living on one connection, plus what the handler needs to
/// report it. Dropping the slot is the disconnect path: whatever ended the
/// connection, the session's router reference goes with it.
pub struct SessionSlot {
    peer: String,
    host: String,
    session: Option<Session>,
    registry: SessionRegistry,
    /// Set once the connection has authenticated.
    user: Option<String>,
    /// Digest nonce from the last challenge sent on this connection.
    nonce: Option<String>,
}

impl SessionSlot {
    pub fn new(peer: impl Into<String>, host: impl Into<String>, registry: SessionRegistry) -> Self {
        Self {
            peer: peer.into(),
            host: host.into(),
            session: None,
            registry,
            user: None,
            nonce: None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn playing(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Playing)
    }

    fn touch(&mut self, now: Instant) {
        if let Some(session) = self.session.as_mut() {
            session.touch(now);
        }
    }

    /// Push pending media of a playing session.
    pub fn pump(&mut self, sink: &mut dyn InterleavedSink, now: Instant) -> Result<usize, MediaError> {
        match self.session.as_mut() {
            Some(session) => session.pump(sink, now),
            None => Ok(0),
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state() != SessionState::TornDown && s.is_expired(now))
    }

    /// Reaper path for an idle session.
    fn expire(&mut self, now: Instant) {
        if let Some(session) = self.session.as_mut() {
            let reason = MediaError::Timeout(format!(
                "session {} from {} idle for {:?}",
                session.id(),
                self.peer,
                session.idle_for(now)
            ));
            log::info!("{}, tearing down", reason);
            session.teardown();
            self.registry.remove(session.id());
        }
    }

    fn publish(&self, now: Instant) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.state() == SessionState::TornDown {
            self.registry.remove(session.id());
        } else if session.issued() {
            self.registry.update(SessionSummary::of(session, &self.peer, now));
        }
    }

    /// Connection lost. Returns true when this released a router reference.
    pub fn disconnect(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) => {
                let released = session.on_disconnect();
                self.registry.remove(session.id());
                released
            }
            None => false,
        }
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// RTSP front-end run by the pool workers, one connection per call.
pub struct RtspHandler {
    caps: Arc<dyn CapabilityProvider>,
    router: StreamRouter,
    ports: PortAllocator,
    registry: SessionRegistry,
    default_timeout: Duration,
    poll_interval: Duration,
    auth: Authenticator,
}

impl RtspHandler {
    pub fn new(
        caps: Arc<dyn CapabilityProvider>,
        router: StreamRouter,
        ports: PortAllocator,
        registry: SessionRegistry,
        default_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            caps,
            router,
            ports,
            registry,
            default_timeout,
            poll_interval,
            auth: Authenticator::disabled(),
        }
    }

    pub fn with_auth(mut self, auth: Authenticator) -> Self {
        self.auth = auth;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn slot(&self, peer: impl Into<String>, host: impl Into<String>) -> SessionSlot {
        SessionSlot::new(peer, host, self.registry.clone())
    }

    /// Serve one connection until the client leaves, the session expires or
    /// the pool stops.
    pub fn serve(&self, mut conn: Connection, ctx: &WorkerContext) {
        let peer = conn.peer();
        if let Err(e) = conn.set_read_timeout(self.poll_interval) {
            log::warn!("{}: cannot set read timeout: {}", peer, e);
            return;
        }
        let mut read_timeout = self.poll_interval;
        let mut slot = self.slot(peer.to_string(), conn.local_host());
        log::debug!("worker {}: serving connection {} from {}", ctx.index, conn.id(), peer);

        loop {
            if ctx.stop.is_cancelled() {
                log::info!("{}: server stopping, closing connection", peer);
                break;
            }
            let now = Instant::now();
            if slot.expired(now) {
                slot.expire(now);
                break;
            }
            if slot.session.is_none() && conn.idle_for(now) > self.default_timeout {
                log::debug!("{}: no request within {:?}, closing", peer, self.default_timeout);
                break;
            }
            let wanted = if slot.playing() {
                MEDIA_TICK.min(self.poll_interval)
            } else {
                self.poll_interval
            };
            if wanted != read_timeout {
                if let Err(e) = conn.set_read_timeout(wanted) {
                    log::warn!("{}: cannot set read timeout: {}", peer, e);
                    break;
                }
                read_timeout = wanted;
            }

            match conn.poll_request() {
                Ok(Incoming::Request(req)) => {
                    let response = self.handle_request(&mut slot, &req, Instant::now());
                    let close = req.method == Method::Teardown && response.status().is_success();
                    if let Err(e) = conn.send(&response) {
                        log::debug!("{}: write failed: {}", peer, e);
                        break;
                    }
                    if close {
                        break;
                    }
                }
                Ok(Incoming::Idle) => {}
                Ok(Incoming::Closed) => {
                    log::debug!("{}: closed by peer", peer);
                    break;
                }
                Ok(Incoming::Malformed(err)) => {
                    log::debug!("{}: {}", peer, err);
                    let _ = conn.send(&Response::new(err.status()));
                    break;
                }
                Err(e) => {
                    log::debug!("{}: read failed: {}", peer, e);
                    break;
                }
            }

            let now = Instant::now();
            if conn.take_interleaved() > 0 {
                // RTCP receiver reports over TCP
                slot.touch(now);
            }
            if let Err(e) = slot.pump(&mut conn, now) {
                log::debug!("{}: media stopped: {}", peer, e);
                break;
            }
        }

        // normal drop runs the disconnect path; be explicit for the log line
        if slot.disconnect() {
            log::debug!("{}: released stream on disconnect", peer);
        }
    }

    /// Answer one request. Every response echoes the request's `CSeq`.
    ///
    /// A SETUP proposing SRTP gets 461 whatever else is wrong with it.
    pub fn handle_request(&self, slot: &mut SessionSlot, req: &Request, now: Instant) -> Response {
        if req.method == Method::Setup {
            if let Err(err) = transport::reject_secure(req.header("Transport").unwrap_or_default()) {
                log::debug!("{}: SETUP {} -> {}", slot.peer, req.uri, err);
                let response = Response::new(err.status());
                return match req.cseq() {
                    Some(cseq) => response.header("CSeq", cseq),
                    None => response,
                };
            }
        }

        let Some(cseq) = req.cseq() else {
            log::debug!("{}: {} without CSeq", slot.peer, req.method_name);
            return Response::new(StatusCode::BAD_REQUEST);
        };

        let result = if req.version != RTSP_VERSION {
            Err(MediaError::protocol(
                ProtocolFault::VersionNotSupported,
                req.version.clone(),
            ))
        } else {
            self.route(slot, req, cseq, now)
        };

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    MediaError::ProtocolViolation { .. } => {
                        log::debug!("{}: {} {} -> {}", slot.peer, req.method_name, req.uri, err)
                    }
                    _ => log::warn!("{}: {} {} -> {}", slot.peer, req.method_name, req.uri, err),
                }
                Response::new(err.status()).header("CSeq", cseq)
            }
        };
        slot.publish(now);
        response
    }

    fn route(
        &self,
        slot: &mut SessionSlot,
        req: &Request,
        cseq: u32,
        now: Instant,
    ) -> Result<Response, MediaError> {
        if req.method != Method::Options {
            if let Some(challenge) = self.authorize(slot, req, cseq) {
                return Ok(challenge);
            }
        }

        let ok = Response::ok().header("CSeq", cseq);
        match req.method {
            Method::Options => {
                if let Some(session) = slot.session.as_mut() {
                    session.touch(now);
                }
                Ok(ok.header("Public", PUBLIC_METHODS))
            }
            Method::Describe => self.describe(slot, req, ok, now),
            Method::Setup => self.setup(slot, req, ok, now),
            Method::Play => {
                let session = bound_session(slot, req)?;
                session.play(now)?;
                let (base, _) = split_track(&req.uri);
                Ok(ok
                    .header("Session", session.header_value())
                    .header("Range", "npt=0.000-")
                    .header("RTP-Info", session.rtp_info(base)))
            }
            Method::Pause => {
                let session = bound_session(slot, req)?;
                session.pause(now)?;
                Ok(ok.header("Session", session.header_value()))
            }
            Method::Teardown => {
                let session = bound_session(slot, req)?;
                if !session.issued() {
                    return Err(session_not_found("TEARDOWN without a session"));
                }
                let header = session.header_value();
                if session.teardown() {
                    log::debug!("session {}: torn down by client", session.id());
                }
                Ok(ok.header("Session", header))
            }
            Method::GetParameter | Method::SetParameter => {
                let session = self.open(slot, now);
                check_session_header(session, req)?;
                session.keepalive(now)?;
                Ok(if session.issued() {
                    ok.header("Session", session.header_value())
                } else {
                    ok
                })
            }
            Method::Unknown => Err(MediaError::protocol(
                ProtocolFault::NotImplemented,
                format!("method {}", req.method_name),
            )),
        }
    }

    /// `None` when the request may proceed, otherwise the 401 to send.
    fn authorize(&self, slot: &mut SessionSlot, req: &Request, cseq: u32) -> Option<Response> {
        if !self.auth.enabled() || slot.user.is_some() {
            return None;
        }
        let verified = self.auth.verify(
            req.header("Authorization"),
            &req.method_name,
            slot.nonce.as_deref(),
        );
        match verified {
            Ok(user) => {
                log::info!("{}: authenticated as {:?}", slot.peer, user);
                slot.user = Some(user);
                slot.nonce = None;
                None
            }
            Err(failure) => {
                let err = MediaError::protocol(ProtocolFault::Unauthorized, failure.to_string());
                log::debug!("{}: {} {} -> {}", slot.peer, req.method_name, req.uri, err);
                let nonce = Authenticator::new_nonce();
                let challenge = self.auth.challenge(&nonce);
                slot.nonce = Some(nonce);
                Some(
                    Response::new(err.status())
                        .header("CSeq", cseq)
                        .header("WWW-Authenticate", challenge),
                )
            }
        }
    }

    fn describe(
        &self,
        slot: &mut SessionSlot,
        req: &Request,
        ok: Response,
        now: Instant,
    ) -> Result<Response, MediaError> {
        let (path, _) = split_track(req.path());
        let cap = self
            .caps
            .by_path(path)
            .ok_or_else(|| not_found(path))?;
        let host = slot.host.clone();
        let session = self.open(slot, now);
        session.describe(&cap, now)?;

        let origin = u64::from_str_radix(session.id(), 16).unwrap_or_default();
        let body = sdp::describe(&cap, origin, &host);
        Ok(ok
            .header("Content-Base", format!("{}/", req.uri.trim_end_matches('/')))
            .body("application/sdp", body))
    }

    fn setup(
        &self,
        slot: &mut SessionSlot,
        req: &Request,
        ok: Response,
        now: Instant,
    ) -> Result<Response, MediaError> {
        let (path, track) = split_track(req.path());
        let track = track.unwrap_or(sdp::VIDEO_TRACK);
        let transport_header = req.header("Transport").unwrap_or_default();
        // a secure proposal fails before anything else in the request counts
        transport::negotiate(transport_header, track, &req.uri)?;

        let cap = self
            .caps
            .by_path(path)
            .ok_or_else(|| not_found(path))?;
        let session = self.open(slot, now);
        check_session_header(session, req)?;

        let transport = session
            .setup(&cap, track, transport_header, &req.uri, now)?
            .header_value();
        log::info!(
            "session {}: SETUP {} track{} ({})",
            session.id(),
            cap.token,
            track,
            transport
        );
        Ok(ok
            .header("Transport", transport)
            .header("Session", session.header_value()))
    }

    fn open<'a>(&self, slot: &'a mut SessionSlot, now: Instant) -> &'a mut Session {
        let peer = slot.peer.parse::<SocketAddr>().ok().map(|addr| addr.ip());
        slot.session.get_or_insert_with(|| {
            let session = Session::new(
                new_session_id(),
                self.router.clone(),
                self.ports.clone(),
                self.default_timeout,
                now,
            );
            match peer {
                Some(ip) => session.with_peer(ip),
                None => session,
            }
        })
    }
}

impl Dispatch<Connection> for RtspHandler {
    fn dispatch(&self, conn: Connection, ctx: &WorkerContext) {
        self.serve(conn, ctx)
    }
}

fn not_found(path: &str) -> MediaError {
    MediaError::protocol(ProtocolFault::NotFound, format!("no media at {}", path))
}

fn session_not_found(detail: impl Into<String>) -> MediaError {
    MediaError::protocol(ProtocolFault::SessionNotFound, detail)
}

/// A `Session` header must name this connection's session once one has been
/// issued, and must be absent before that.
fn check_session_header(session: &Session, req: &Request) -> Result<(), MediaError> {
    match (session.issued(), req.session_id()) {
        (true, Some(id)) if id == session.id() => Ok(()),
        (true, Some(id)) => Err(session_not_found(format!("unknown session {}", id))),
        (true, None) => Err(session_not_found("missing Session header")),
        (false, Some(id)) => Err(session_not_found(format!("unknown session {}", id))),
        (false, None) => Ok(()),
    }
}

fn bound_session<'a>(slot: &'a mut SessionSlot, req: &Request) -> Result<&'a mut Session, MediaError> {
    let Some(session) = slot.session.as_mut() else {
        return Err(match req.session_id() {
            Some(id) => session_not_found(format!("unknown session {}", id)),
            None => MediaError::protocol(
                ProtocolFault::MethodNotValidInState,
                format!("{} before SETUP", req.method_name),
            ),
        });
    };
    check_session_header(session, req)?;
    Ok(session)
}

#[cfg(test)]
#[path = "handler_test.rs"]
mod handler_test;
