//! Error types for the RTSP engine.

use std::fmt;
use std::io;

/// Errors that can occur in the RTSP engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), [`BadRequest`](Self::BadRequest),
///   [`Sdp`](Self::Sdp): malformed RTSP messages or session descriptions.
/// - **Connection**: [`Io`](Self::Io), [`ConnectionClosed`](Self::ConnectionClosed),
///   [`FrameTooLarge`](Self::FrameTooLarge).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`InvalidState`](Self::InvalidState), [`Unauthorized`](Self::Unauthorized),
///   [`SessionClosed`](Self::SessionClosed).
/// - **Transport negotiation**: [`Transport`](Self::Transport).
/// - **Media bus**: [`StreamNotFound`](Self::StreamNotFound),
///   [`StreamBusy`](Self::StreamBusy).
/// - **Client path**: [`InvalidUrl`](Self::InvalidUrl),
///   [`Handshake`](Self::Handshake).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error (including read/write timeouts).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection in the middle of an exchange.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The `Session` header does not name this connection's session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A session with the same id is already registered.
    #[error("duplicate session id: {0}")]
    DuplicateSession(String),

    /// Media was offered to a session that has already been torn down.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The method is not allowed in the session's current state.
    #[error("{method} not valid in state {state}")]
    InvalidState { method: String, state: String },

    /// Credentials were missing or rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// Failed to parse an RTSP message (RFC 2326 §6, §7).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Request was syntactically valid but unusable (e.g. missing header).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// SDP body could not be parsed or describes no usable track.
    #[error("invalid SDP: {0}")]
    Sdp(String),

    /// Transport negotiation failed for one track.
    #[error("transport negotiation failed: {0}")]
    Transport(#[from] TransportError),

    /// No publisher exists for the stream path.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The stream path already has a live publisher.
    #[error("stream already published: {0}")]
    StreamBusy(String),

    /// Interleaved payloads are limited to 65535 bytes by the `$` framing.
    #[error("interleaved frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Remote URL could not be used for a pull/push connection.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The remote server answered a handshake request with a failure status.
    #[error("{method} failed: {status} {reason}")]
    Handshake {
        method: String,
        status: u16,
        reason: String,
    },

    /// Monitoring snapshot serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

impl RtspError {
    /// Whether this error is a read/write deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
    }

    /// Whether the error counts toward the protocol-violation threshold.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::BadRequest(_)
                | Self::SessionNotFound(_)
                | Self::InvalidState { .. }
                | Self::Unauthorized
        )
    }

    /// RTSP status code and reason phrase used when answering a request
    /// that failed with this error (RFC 2326 §7.1.1).
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::Parse { .. } | Self::BadRequest(_) | Self::Sdp(_) => (400, "Bad Request"),
            Self::Unauthorized => (401, "Unauthorized"),
            Self::StreamNotFound(_) => (404, "Not Found"),
            Self::StreamBusy(_) => (406, "Not Acceptable"),
            Self::SessionNotFound(_) => (454, "Session Not Found"),
            Self::InvalidState { .. } => (455, "Method Not Valid in This State"),
            Self::Transport(TransportError::TrackAlreadySetup(_)) => {
                (455, "Method Not Valid in This State")
            }
            Self::Transport(TransportError::UnknownTrack(_)) => (404, "Not Found"),
            Self::Transport(TransportError::UdpBind(_)) => (500, "Internal Server Error"),
            Self::Transport(_) => (461, "Unsupported Transport"),
            _ => (500, "Internal Server Error"),
        }
    }
}

/// Transport negotiation failures for a single SETUP (RFC 2326 §12.39).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The `Transport` header could not be parsed.
    #[error("malformed Transport header: {0}")]
    Malformed(String),

    /// Lower transport or profile this engine does not implement.
    #[error("unsupported transport: {0}")]
    Unsupported(String),

    /// Interleaved channel already assigned to another track or role.
    #[error("interleaved channel {0} already in use")]
    ChannelInUse(u8),

    /// RTP and RTCP were proposed on the same channel.
    #[error("RTP and RTCP share channel {0}")]
    ChannelCollision(u8),

    /// The track already has a transport assignment.
    #[error("track {0} already set up")]
    TrackAlreadySetup(String),

    /// SETUP URI does not match any track in the session description.
    #[error("no track matches {0}")]
    UnknownTrack(String),

    /// Could not bind a local RTP/RTCP socket pair.
    #[error("UDP bind failed: {0}")]
    UdpBind(String),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number.
    InvalidContentLength,
    /// The header block exceeded the size limit.
    HeaderTooLarge,
    /// `Content-Length` exceeded the body limit.
    BodyTooLarge,
}

impl ParseErrorKind {
    /// Whether the reader lost track of message boundaries, so nothing
    /// after this error can be parsed reliably.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::InvalidContentLength | Self::HeaderTooLarge | Self::BodyTooLarge
        )
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::HeaderTooLarge => write!(f, "header block too large"),
            Self::BodyTooLarge => write!(f, "body too large"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
