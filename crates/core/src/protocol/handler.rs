use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::bus::MediaPacket;
use crate::client::{self, RelayKind};
use crate::config::SetupFailurePolicy;
use crate::error::{Result, RtspError, TransportError};
use crate::hub::extract_stream_path;
use crate::protocol::auth::{self, Credentials};
use crate::protocol::message::InterleavedFrame;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::SessionDescription;
use crate::server::ServerContext;
use crate::session::transport::TransportHeader;
use crate::session::{
    Attachment, ForwardSink, Session, SessionState, TransportAssignment, TransportNegotiator,
};

const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

/// Media direction fixed by DESCRIBE (play) or ANNOUNCE (record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Play,
    Record,
}

/// A response plus whether the connection must close after sending it.
#[derive(Debug)]
pub struct Reply {
    pub response: RtspResponse,
    pub close: bool,
}

/// Server-role protocol driver for one connection.
///
/// Owns the per-connection protocol data (session description, transport
/// assignments, nonce, violation count). Only the connection's reading
/// thread calls into it.
pub struct MethodHandler {
    ctx: ServerContext,
    session: Arc<Session>,
    peer_addr: SocketAddr,
    description: Option<SessionDescription>,
    direction: Option<Direction>,
    stream_path: String,
    negotiator: TransportNegotiator,
    token_issued: bool,
    nonce: Option<String>,
    violations: u32,
}

impl MethodHandler {
    pub fn new(ctx: ServerContext, session: Arc<Session>, peer_addr: SocketAddr) -> Self {
        MethodHandler {
            ctx,
            session,
            peer_addr,
            description: None,
            direction: None,
            stream_path: String::new(),
            negotiator: TransportNegotiator::new(),
            token_issued: false,
            nonce: None,
            violations: 0,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn handle(&mut self, request: &RtspRequest) -> Reply {
        let cseq = request.cseq().unwrap_or("0").to_string();
        tracing::debug!(
            session_id = %self.session.id,
            peer = %self.peer_addr,
            method = %request.method,
            uri = %request.uri,
            %cseq,
            "request"
        );

        if let Some(reply) = self.authorize(request) {
            return self.finish(reply, &cseq);
        }

        let reply = match self.dispatch(request) {
            Ok(response) => {
                self.violations = 0;
                Reply {
                    response,
                    close: request.method == "TEARDOWN",
                }
            }
            Err(e) => self.reject(&request.method, e),
        };
        self.finish(reply, &cseq)
    }

    /// Answer a request whose head could not be parsed.
    pub fn on_parse_error(&mut self, error: RtspError) -> Reply {
        let fatal = matches!(&error, RtspError::Parse { kind } if kind.is_fatal());
        let mut reply = self.reject("?", error);
        reply.close |= fatal;
        tracing::debug!(session_id = %self.session.id, status = reply.response.status_code, "response");
        reply
    }

    /// Handle an interleaved frame sent by the peer.
    ///
    /// While recording, frames are routed to their track and forwarded to
    /// the bus. Otherwise (player RTCP receiver reports) they are dropped.
    pub fn on_frame(&self, frame: InterleavedFrame) {
        if self.session.state() != SessionState::Recording {
            tracing::trace!(session_id = %self.session.id, channel = frame.channel, "dropping frame");
            return;
        }
        match self.negotiator.route(frame.channel) {
            Some((track, kind)) => self.ctx.bus.forward(
                &self.stream_path,
                &MediaPacket {
                    track,
                    kind,
                    payload: frame.payload,
                },
            ),
            None => {
                tracing::debug!(session_id = %self.session.id, channel = frame.channel, "frame on unassigned channel");
            }
        }
    }

    fn finish(&self, mut reply: Reply, cseq: &str) -> Reply {
        reply.response = reply.response.add_header("CSeq", cseq);
        tracing::debug!(
            session_id = %self.session.id,
            status = reply.response.status_code,
            %cseq,
            "response"
        );
        reply
    }

    fn reject(&mut self, method: &str, error: RtspError) -> Reply {
        let (code, text) = error.status();
        let mut close = false;

        if error.is_violation() {
            self.violations += 1;
            let max = self.ctx.config.max_protocol_violations;
            tracing::warn!(
                session_id = %self.session.id,
                peer = %self.peer_addr,
                method,
                error = %error,
                violations = self.violations,
                "protocol violation"
            );
            if max > 0 && self.violations >= max {
                tracing::warn!(session_id = %self.session.id, max, "too many protocol violations");
                close = true;
            }
        } else {
            tracing::info!(session_id = %self.session.id, method, error = %error, status = code, "request failed");
        }

        if matches!(error, RtspError::Transport(_))
            && method == "SETUP"
            && self.ctx.config.setup_failure == SetupFailurePolicy::TeardownSession
        {
            close = true;
        }

        Reply {
            response: RtspResponse::new(code, text),
            close,
        }
    }

    /// Check credentials when an authenticator is installed. Returns the
    /// 401 reply to send, or `None` when the request may proceed.
    fn authorize(&mut self, request: &RtspRequest) -> Option<Reply> {
        let authenticator = self.ctx.authenticator.clone()?;
        if request.method == "OPTIONS" {
            return None;
        }

        let presented = request.get_header("Authorization").map(Credentials::parse);
        let granted = match &presented {
            Some(Some(creds)) => {
                let bound = match creds {
                    Credentials::Digest { nonce, uri, .. } => {
                        self.nonce.as_deref() == Some(nonce.as_str()) && *uri == request.uri
                    }
                    Credentials::Basic { .. } => true,
                };
                bound && authenticator.verify(&request.method, creds)
            }
            _ => false,
        };
        if granted {
            return None;
        }

        let nonce = self.nonce.get_or_insert_with(auth::new_nonce).clone();
        let mut reply = if presented.is_some() {
            self.reject(&request.method, RtspError::Unauthorized)
        } else {
            tracing::debug!(session_id = %self.session.id, method = %request.method, "challenging unauthenticated request");
            Reply {
                response: RtspResponse::new(401, "Unauthorized"),
                close: false,
            }
        };
        for value in auth::challenge_headers(&self.ctx.config.realm, &nonce) {
            reply.response = reply.response.add_header("WWW-Authenticate", &value);
        }
        Some(reply)
    }

    fn dispatch(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        if let Some(id) = request.session_id()
            && (!self.token_issued || id != self.session.id)
        {
            return Err(RtspError::SessionNotFound(id.to_string()));
        }

        match request.method.as_str() {
            "OPTIONS" => Ok(RtspResponse::ok().add_header("Public", PUBLIC_METHODS)),
            "DESCRIBE" => self.handle_describe(request),
            "ANNOUNCE" => self.handle_announce(request),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(request),
            "RECORD" => self.handle_record(request),
            "PAUSE" => self.handle_pause(request),
            "TEARDOWN" => Ok(RtspResponse::ok()),
            "GET_PARAMETER" | "SET_PARAMETER" => Ok(self.with_session(RtspResponse::ok())),
            _ => {
                tracing::warn!(method = %request.method, "unsupported RTSP method");
                Ok(RtspResponse::not_implemented())
            }
        }
    }

    fn with_session(&self, response: RtspResponse) -> RtspResponse {
        if self.token_issued {
            response.add_header("Session", &self.session.session_header_value())
        } else {
            response
        }
    }

    fn require_state(&self, method: &str, allowed: &[SessionState]) -> Result<()> {
        let state = self.session.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(RtspError::InvalidState {
                method: method.to_string(),
                state: state.to_string(),
            })
        }
    }

    fn require_token(&self, request: &RtspRequest) -> Result<()> {
        match request.session_id() {
            Some(_) => Ok(()),
            None => Err(RtspError::SessionNotFound(String::new())),
        }
    }

    fn require_direction(&self, method: &str, direction: Direction) -> Result<()> {
        if self.direction == Some(direction) {
            Ok(())
        } else {
            Err(RtspError::InvalidState {
                method: method.to_string(),
                state: format!("{} ({:?} direction)", self.session.state(), self.direction),
            })
        }
    }

    fn record_details(&self, request: &RtspRequest, sdp: &str) {
        let agent = request.get_header("User-Agent").unwrap_or("").to_string();
        self.session.update_details(|d| {
            d.url = request.uri.clone();
            d.stream_path = self.stream_path.clone();
            d.sdp = sdp.to_string();
            d.agent = agent;
        });
    }

    fn handle_describe(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        self.require_state("DESCRIBE", &[SessionState::Init, SessionState::Described])?;
        if self.direction == Some(Direction::Record) {
            return Err(RtspError::InvalidState {
                method: "DESCRIBE".to_string(),
                state: "announced".to_string(),
            });
        }

        let stream_path = extract_stream_path(&request.uri).to_string();
        let sdp = match self.ctx.bus.describe(&stream_path) {
            Some(sdp) => sdp,
            None => self.pull_on_demand(&stream_path)?,
        };
        let description = SessionDescription::parse(&sdp)?;

        tracing::info!(session_id = %self.session.id, stream_path, tracks = description.tracks.len(), "DESCRIBE");

        self.stream_path = stream_path;
        self.description = Some(description);
        self.direction = Some(Direction::Play);
        self.record_details(request, &sdp);
        self.session.set_state(SessionState::Described);

        let base = format!("{}/", request.uri.trim_end_matches('/'));
        Ok(RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(sdp))
    }

    /// With auto pull on, fetch an unpublished stream from the remote
    /// template before answering DESCRIBE.
    fn pull_on_demand(&self, stream_path: &str) -> Result<String> {
        let not_found = || RtspError::StreamNotFound(stream_path.to_string());
        if stream_path.is_empty() || !self.ctx.auto_pull.load(Ordering::SeqCst) {
            return Err(not_found());
        }

        let target = self.ctx.config.remote_url(stream_path);
        tracing::info!(session_id = %self.session.id, stream_path, %target, "pulling on DESCRIBE");
        if let Err(e) = client::start_relay(&self.ctx, RelayKind::Pull, stream_path, &target) {
            tracing::info!(session_id = %self.session.id, stream_path, error = %e, "on-demand pull failed");
        }
        // A concurrent pull may have published the path first.
        self.ctx.bus.describe(stream_path).ok_or_else(not_found)
    }

    fn handle_announce(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        self.require_state("ANNOUNCE", &[SessionState::Init, SessionState::Described])?;
        if self.direction == Some(Direction::Play) {
            return Err(RtspError::InvalidState {
                method: "ANNOUNCE".to_string(),
                state: "described".to_string(),
            });
        }

        let sdp = request
            .body
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| RtspError::BadRequest("ANNOUNCE without SDP body".to_string()))?;
        let description = SessionDescription::parse(sdp)?;

        let stream_path = extract_stream_path(&request.uri).to_string();
        if stream_path.is_empty() {
            return Err(RtspError::BadRequest("ANNOUNCE without stream path".to_string()));
        }
        if self.ctx.bus.describe(&stream_path).is_some() {
            return Err(RtspError::StreamBusy(stream_path));
        }

        tracing::info!(session_id = %self.session.id, stream_path, tracks = description.tracks.len(), "ANNOUNCE");

        self.stream_path = stream_path;
        self.description = Some(description);
        self.direction = Some(Direction::Record);
        self.record_details(request, sdp);
        self.session.set_state(SessionState::Described);
        Ok(RtspResponse::ok())
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        self.require_state(
            "SETUP",
            &[
                SessionState::Described,
                SessionState::SetupPartial,
                SessionState::SetupComplete,
            ],
        )?;

        let transport_value = request
            .get_header("Transport")
            .ok_or_else(|| RtspError::BadRequest("SETUP without Transport header".to_string()))?;
        let description = self
            .description
            .as_ref()
            .ok_or_else(|| RtspError::BadRequest("SETUP before DESCRIBE/ANNOUNCE".to_string()))?;
        let track = description
            .resolve_track(&request.uri)
            .ok_or_else(|| TransportError::UnknownTrack(request.uri.clone()))?;
        let header = TransportHeader::parse(transport_value)?;

        let assignment =
            self.negotiator
                .negotiate(track, &header, self.peer_addr.ip(), &self.ctx.ports)?;
        let kinds: Vec<_> = description.tracks.iter().map(|t| t.kind).collect();
        let complete = self.negotiator.is_complete(kinds);

        let record = self.direction == Some(Direction::Record);
        let transport_reply = match &assignment {
            TransportAssignment::Interleaved { rtp, rtcp } => {
                TransportHeader::interleaved_reply(*rtp, *rtcp, record)
            }
            TransportAssignment::Udp(pair) => {
                TransportHeader::udp_reply(pair.peer_ports(), pair.local_ports(), record)
            }
        };

        tracing::info!(
            session_id = %self.session.id,
            track = track.as_str(),
            transport = %transport_reply,
            complete,
            "SETUP"
        );

        self.token_issued = true;
        self.session.set_state(if complete {
            SessionState::SetupComplete
        } else {
            SessionState::SetupPartial
        });

        Ok(RtspResponse::ok()
            .add_header("Transport", &transport_reply)
            .add_header("Session", &self.session.session_header_value()))
    }

    fn handle_play(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        self.require_state("PLAY", &[SessionState::SetupComplete, SessionState::Playing])?;
        self.require_token(request)?;
        self.require_direction("PLAY", Direction::Play)?;

        if self.session.state() == SessionState::SetupComplete {
            let sink = ForwardSink::new(self.session.clone(), self.negotiator.routes());
            self.ctx
                .bus
                .subscribe(&self.stream_path, &self.session.id, Arc::new(sink))?;
            self.session.attach(Attachment::Subscriber {
                stream_path: self.stream_path.clone(),
            });
            self.session.set_state(SessionState::Playing);
            tracing::info!(session_id = %self.session.id, stream_path = %self.stream_path, "PLAY");
        }

        Ok(RtspResponse::ok()
            .add_header("Session", &self.session.session_header_value())
            .add_header("Range", "npt=0.000-"))
    }

    fn handle_record(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        self.require_state("RECORD", &[SessionState::SetupComplete])?;
        self.require_token(request)?;
        self.require_direction("RECORD", Direction::Record)?;

        let sdp = self
            .description
            .as_ref()
            .map(|d| d.raw.clone())
            .unwrap_or_default();
        self.ctx.bus.publish(&self.stream_path, &sdp)?;
        self.session.attach(Attachment::Publisher {
            stream_path: self.stream_path.clone(),
        });

        for (track, pair) in self.negotiator.udp_pairs() {
            let session = self.session.clone();
            let bus = self.ctx.bus.clone();
            let stream_path = self.stream_path.clone();
            pair.spawn_receivers(
                track,
                move || !session.is_closed(),
                move |packet| bus.forward(&stream_path, &packet),
            )?;
        }

        self.session.set_state(SessionState::Recording);
        tracing::info!(session_id = %self.session.id, stream_path = %self.stream_path, "RECORD");

        Ok(RtspResponse::ok().add_header("Session", &self.session.session_header_value()))
    }

    fn handle_pause(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        self.require_state("PAUSE", &[SessionState::Playing])?;
        self.require_token(request)?;

        self.session.detach(self.ctx.bus.as_ref());
        self.session.set_state(SessionState::SetupComplete);
        tracing::info!(session_id = %self.session.id, "PAUSE");

        Ok(RtspResponse::ok().add_header("Session", &self.session.session_header_value()))
    }
}
