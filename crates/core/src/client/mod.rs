//! RTSP client role: pulling remote streams onto the bus and pushing local
//! streams to remote servers.
//!
//! ## Pull (RFC 2326 §10, player side)
//!
//! ```text
//! OPTIONS → DESCRIBE → SETUP (per track, interleaved 2i/2i+1) → PLAY
//! ```
//!
//! The remote SDP is published on the bus only after PLAY succeeds, and
//! interleaved frames are then forwarded as they arrive.
//!
//! ## Push (publisher side)
//!
//! ```text
//! OPTIONS → ANNOUNCE → SETUP (per track, mode=record) → RECORD
//! ```
//!
//! A [`ForwardSink`] then writes the local publisher's packets to the
//! connection.
//!
//! Both directions always use TCP interleaved transport.

pub mod relay;

use std::io::BufReader;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use url::Url;

use crate::bus::MediaPacket;
use crate::error::{Result, RtspError};
use crate::protocol::auth::Challenge;
use crate::protocol::response::SERVER_AGENT;
use crate::protocol::sdp::{SessionDescription, control_url};
use crate::protocol::{Message, RtspRequest, RtspResponse, read_message};
use crate::server::ServerContext;
use crate::session::transport::TransportHeader;
use crate::session::{Attachment, ForwardSink, Role, Session, SessionState, TransportNegotiator};
use crate::transport::{DeadlineStream, SessionWriter};

const DEFAULT_RTSP_PORT: u16 = 554;
/// Longest keepalive interval of pull sessions; shorter deadlines halve it.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Direction of a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKind {
    Pull,
    Push,
}

impl RelayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

/// An outgoing RTSP connection during and after its handshake.
pub struct RtspClient {
    session: Arc<Session>,
    reader: BufReader<DeadlineStream>,
    /// Request URL with any userinfo removed.
    url: String,
    credentials: Option<(String, String)>,
    challenge: Option<Challenge>,
    token: Option<String>,
    cseq: u32,
}

impl RtspClient {
    /// Open a TCP connection to `target` (`rtsp://[user:pass@]host[:port]/path`).
    pub fn connect(target: &str, role: Role, ctx: &ServerContext) -> Result<Self> {
        let mut url = Url::parse(target).map_err(|e| RtspError::InvalidUrl(format!("{target}: {e}")))?;
        if url.scheme() != "rtsp" {
            return Err(RtspError::InvalidUrl(format!("unsupported scheme in {target}")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| RtspError::InvalidUrl(format!("no host in {target}")))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);

        let credentials = (!url.username().is_empty()).then(|| {
            (
                url.username().to_string(),
                url.password().unwrap_or("").to_string(),
            )
        });
        // Both setters only fail for URLs without a host, ruled out above.
        let _ = url.set_username("");
        let _ = url.set_password(None);

        let timeout = ctx.config.timeout();
        let stream = connect_tcp(&host, port, timeout)?;
        stream.set_nodelay(true)?;

        let reader = DeadlineStream::new(stream, timeout);
        let writer = SessionWriter::new(reader.try_clone()?);
        let session = Arc::new(Session::new(role, writer));
        tracing::debug!(session_id = %session.id, %host, port, "connected");

        Ok(Self {
            session,
            reader: BufReader::with_capacity(ctx.config.read_buffer_size.max(4096), reader),
            url: url.as_str().to_string(),
            credentials,
            challenge: None,
            token: None,
            cseq: 0,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send(&mut self, request: &RtspRequest) -> Result<()> {
        self.cseq += 1;
        let mut request = request
            .clone()
            .add_header("CSeq", &self.cseq.to_string())
            .add_header("User-Agent", SERVER_AGENT);
        if let Some(token) = &self.token {
            request = request.add_header("Session", token);
        }
        if let (Some(challenge), Some((user, pass))) = (&self.challenge, &self.credentials) {
            let value = challenge.authorization(user, pass, &request.method, &request.uri);
            request = request.add_header("Authorization", &value);
        }
        tracing::debug!(session_id = %self.session.id, method = %request.method, uri = %request.uri, "sending request");
        self.session.writer.write_request(&request)
    }

    /// Read until the next response, skipping frames and server requests.
    fn read_response(&mut self) -> Result<RtspResponse> {
        loop {
            match read_message(&mut self.reader)? {
                Some(Message::Response(response)) => return Ok(response),
                Some(Message::Data(_)) => {}
                Some(Message::Request(r)) => {
                    tracing::debug!(method = %r.method, "ignoring server request");
                }
                None => return Err(RtspError::ConnectionClosed),
            }
        }
    }

    /// Send `request` and wait for a successful response.
    ///
    /// A 401 is answered once with the URL's credentials.
    pub fn request(&mut self, request: RtspRequest) -> Result<RtspResponse> {
        self.send(&request)?;
        let mut response = self.read_response()?;

        if response.status_code == 401 && self.credentials.is_some() && self.challenge.is_none() {
            self.challenge = Challenge::select(response.get_headers("WWW-Authenticate"));
            if self.challenge.is_some() {
                self.send(&request)?;
                response = self.read_response()?;
            }
        }

        if !response.is_success() {
            return Err(RtspError::Handshake {
                method: request.method.clone(),
                status: response.status_code,
                reason: response.status_text.clone(),
            });
        }
        if let Some(server) = response.get_header("Server") {
            let server = server.to_string();
            self.session.update_details(|d| d.agent = server);
        }
        if self.token.is_none()
            && let Some(id) = response.session_id()
        {
            self.token = Some(id.to_string());
        }
        Ok(response)
    }

    /// SETUP every track over interleaved channels 2i/2i+1. Channels
    /// echoed by the server take precedence.
    fn setup_tracks(
        &mut self,
        description: &SessionDescription,
        base: &str,
        record: bool,
    ) -> Result<TransportNegotiator> {
        let mut negotiator = TransportNegotiator::new();
        for (i, track) in description.tracks.iter().enumerate() {
            let rtp = u8::try_from(2 * i).map_err(|_| RtspError::Sdp("too many tracks".to_string()))?;
            let uri = control_url(base, track.control.as_deref());
            let request = RtspRequest::new("SETUP", &uri)
                .add_header("Transport", &TransportHeader::interleaved_reply(rtp, rtp + 1, record));
            let response = self.request(request)?;

            let (rtp, rtcp) = response
                .get_header("Transport")
                .and_then(|t| TransportHeader::parse(t).ok())
                .and_then(|t| t.interleaved)
                .unwrap_or((rtp, rtp + 1));
            negotiator.assign_interleaved(track.kind, rtp, rtcp)?;
        }
        Ok(negotiator)
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(RtspError::from)
        .unwrap_or_else(|| RtspError::InvalidUrl(format!("{host} did not resolve"))))
}

/// Pull `target` into `stream_path` and serve it on a background thread.
pub fn pull(ctx: &ServerContext, stream_path: &str, target: &str) -> Result<Arc<Session>> {
    let role = Role::Pull {
        stream_path: stream_path.to_string(),
        target: target.to_string(),
    };
    let mut client = RtspClient::connect(target, role, ctx)?;
    let url = client.url().to_string();

    client.request(RtspRequest::new("OPTIONS", &url))?;
    let response = client.request(RtspRequest::new("DESCRIBE", &url).add_header("Accept", "application/sdp"))?;
    let sdp = response
        .body
        .clone()
        .ok_or_else(|| RtspError::Sdp("DESCRIBE response without body".to_string()))?;
    let description = SessionDescription::parse(&sdp)?;
    let base = response
        .get_header("Content-Base")
        .or_else(|| response.get_header("Content-Location"))
        .unwrap_or(&url)
        .to_string();

    let negotiator = client.setup_tracks(&description, &base, false)?;
    client.request(RtspRequest::new("PLAY", &url).add_header("Range", "npt=0.000-"))?;

    let session = client.session().clone();
    ctx.bus.publish(stream_path, &sdp)?;
    session.attach(Attachment::Publisher {
        stream_path: stream_path.to_string(),
    });
    session.update_details(|d| {
        d.url = url.clone();
        d.stream_path = stream_path.to_string();
        d.sdp = sdp.clone();
    });
    session.set_state(SessionState::Playing);
    if let Err(e) = ctx.registry.register(session.clone()) {
        session.teardown(ctx, "registration failed");
        return Err(e);
    }

    tracing::info!(session_id = %session.id, stream_path, target, tracks = description.tracks.len(), "pull started");

    let thread_ctx = ctx.clone();
    let path = stream_path.to_string();
    let target = target.to_string();
    let spawned = thread::Builder::new()
        .name(format!("rtsp-pull-{}", session.id))
        .spawn(move || {
            let reason = run_pull(&mut client, &negotiator, &thread_ctx, &path);
            client.session().teardown(&thread_ctx, reason);
            if thread_ctx.config.reconnect && thread_ctx.is_running() {
                relay::schedule_reconnect(thread_ctx, RelayKind::Pull, path, target);
            }
        });
    if let Err(e) = spawned {
        session.teardown(ctx, "thread spawn failed");
        return Err(e.into());
    }
    Ok(session)
}

fn run_pull(
    client: &mut RtspClient,
    negotiator: &TransportNegotiator,
    ctx: &ServerContext,
    stream_path: &str,
) -> &'static str {
    let keepalive = ctx
        .config
        .timeout()
        .map_or(KEEPALIVE_INTERVAL, |t| (t / 2).min(KEEPALIVE_INTERVAL));
    let mut last_keepalive = Instant::now();
    loop {
        if client.session().is_closed() {
            return "closed";
        }
        match read_message(&mut client.reader) {
            Ok(Some(Message::Data(frame))) => match negotiator.route(frame.channel) {
                Some((track, kind)) => ctx.bus.forward(
                    stream_path,
                    &MediaPacket {
                        track,
                        kind,
                        payload: frame.payload,
                    },
                ),
                None => {
                    tracing::trace!(channel = frame.channel, "frame on unassigned channel");
                }
            },
            Ok(Some(Message::Response(r))) if !r.is_success() => {
                tracing::warn!(session_id = %client.session().id, status = r.status_code, "keepalive rejected");
            }
            Ok(Some(_)) => {}
            Ok(None) => return "connection closed by peer",
            Err(e) if e.is_timeout() => return "idle timeout",
            Err(e) => {
                tracing::debug!(session_id = %client.session().id, error = %e, "pull read failed");
                return "read error";
            }
        }

        if last_keepalive.elapsed() >= keepalive {
            last_keepalive = Instant::now();
            let url = client.url().to_string();
            if client.send(&RtspRequest::new("OPTIONS", &url)).is_err() {
                return "write error";
            }
        }
    }
}

/// Push the local publisher of `stream_path` to `target`.
pub fn push(ctx: &ServerContext, stream_path: &str, target: &str) -> Result<Arc<Session>> {
    let sdp = ctx
        .bus
        .describe(stream_path)
        .ok_or_else(|| RtspError::StreamNotFound(stream_path.to_string()))?;
    let description = SessionDescription::parse(&sdp)?;

    let role = Role::Push {
        stream_path: stream_path.to_string(),
        target: target.to_string(),
    };
    let mut client = RtspClient::connect(target, role, ctx)?;
    let url = client.url().to_string();

    client.request(RtspRequest::new("OPTIONS", &url))?;
    client.request(
        RtspRequest::new("ANNOUNCE", &url)
            .add_header("Content-Type", "application/sdp")
            .with_body(sdp.clone()),
    )?;
    let negotiator = client.setup_tracks(&description, &url, true)?;
    client.request(RtspRequest::new("RECORD", &url).add_header("Range", "npt=0.000-"))?;

    let session = client.session().clone();
    session.update_details(|d| {
        d.url = url.clone();
        d.stream_path = stream_path.to_string();
        d.sdp = sdp.clone();
    });
    session.set_state(SessionState::Recording);
    if let Err(e) = ctx.registry.register(session.clone()) {
        session.teardown(ctx, "registration failed");
        return Err(e);
    }

    let sink = ForwardSink::new(session.clone(), negotiator.routes());
    if let Err(e) = ctx.bus.subscribe(stream_path, &session.id, Arc::new(sink)) {
        session.teardown(ctx, "subscribe failed");
        return Err(e);
    }
    session.attach(Attachment::Subscriber {
        stream_path: stream_path.to_string(),
    });

    tracing::info!(session_id = %session.id, stream_path, target, "push started");

    let thread_ctx = ctx.clone();
    let path = stream_path.to_string();
    let target = target.to_string();
    let spawned = thread::Builder::new()
        .name(format!("rtsp-push-{}", session.id))
        .spawn(move || {
            let reason = drain(&mut client);
            client.session().teardown(&thread_ctx, reason);
            if thread_ctx.config.reconnect && thread_ctx.is_running() {
                relay::schedule_reconnect(thread_ctx, RelayKind::Push, path, target);
            }
        });
    if let Err(e) = spawned {
        session.teardown(ctx, "thread spawn failed");
        return Err(e.into());
    }
    Ok(session)
}

/// Consume whatever the server sends back (RTCP, keepalive replies) until
/// the connection ends.
fn drain(client: &mut RtspClient) -> &'static str {
    loop {
        match read_message(&mut client.reader) {
            Ok(Some(_)) => {}
            Ok(None) => return "connection closed by peer",
            Err(e) if e.is_timeout() => {
                if client.session().is_closed() {
                    return "closed";
                }
            }
            Err(_) => return "read error",
        }
    }
}

/// Start a pull or push. On failure with reconnect enabled, schedule a
/// background retry before returning the error.
pub fn start_relay(
    ctx: &ServerContext,
    kind: RelayKind,
    stream_path: &str,
    target: &str,
) -> Result<Arc<Session>> {
    let result = match kind {
        RelayKind::Pull => pull(ctx, stream_path, target),
        RelayKind::Push => push(ctx, stream_path, target),
    };
    if let Err(e) = &result {
        tracing::warn!(relay = kind.as_str(), stream_path, target, error = %e, "relay failed");
        if ctx.config.reconnect && ctx.is_running() {
            relay::schedule_reconnect(
                ctx.clone(),
                kind,
                stream_path.to_string(),
                target.to_string(),
            );
        }
    }
    result
}
