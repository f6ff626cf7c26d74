//! RTSP sessions (RFC 2326 §3, §12.37).
//!
//! One [`Session`] exists per RTSP connection, whether the peer connected
//! to us (server role) or we connected out to pull or push a stream
//! (client role). It is split into:
//!
//! - a connection layer: the serialized [`SessionWriter`] and its byte
//!   counters;
//! - the protocol state ([`SessionState`]);
//! - role data ([`Role`]);
//! - public details used by monitoring, and the media bus attachment.
//!
//! Protocol bookkeeping that only the reading thread touches (tracks,
//! transport assignments, nonce, violation count) lives in the role's
//! driver, not here.
//!
//! ## Server-role lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! Init ──DESCRIBE/ANNOUNCE──► Described ──SETUP──► SetupPartial ──SETUP──► SetupComplete
//!                                                                     │
//!                               Playing ◄──PLAY──────────────────────┤
//!                               Recording ◄──RECORD──────────────────┘
//! any ──TEARDOWN / error / timeout──► TornDown
//! ```

pub mod forward;
pub mod negotiator;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::bus::MediaBus;
use crate::error::{Result, RtspError};
use crate::server::ServerContext;
use crate::transport::SessionWriter;

pub use forward::ForwardSink;
pub use negotiator::{TransportAssignment, TransportNegotiator};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Described,
    /// At least one, but not every, track has a transport.
    SetupPartial,
    SetupComplete,
    Playing,
    Recording,
    TornDown,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Described => "described",
            Self::SetupPartial => "setup_partial",
            Self::SetupComplete => "setup_complete",
            Self::Playing => "playing",
            Self::Recording => "recording",
            Self::TornDown => "torn_down",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side opened the connection, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Role {
    /// A peer connected to our listener.
    Inbound { peer: SocketAddr },
    /// We connected out to pull `target` into `stream_path`.
    Pull { stream_path: String, target: String },
    /// We connected out to push `stream_path` to `target`.
    Push { stream_path: String, target: String },
}

/// Descriptive fields shown by monitoring.
#[derive(Debug, Clone, Default)]
pub struct SessionDetails {
    pub url: String,
    pub stream_path: String,
    pub sdp: String,
    /// Peer's `User-Agent` (server role) or `Server` (client role).
    pub agent: String,
}

/// How a session is attached to the media bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Subscriber { stream_path: String },
    Publisher { stream_path: String },
}

pub struct Session {
    /// Unique identifier (16 hex digits), also the `Session` header token.
    pub id: String,
    pub role: Role,
    pub writer: SessionWriter,
    state: RwLock<SessionState>,
    details: RwLock<SessionDetails>,
    attachment: Mutex<Option<Attachment>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(role: Role, writer: SessionWriter) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Session {
            id: format!("{:016X}", id),
            role,
            writer,
            state: RwLock::new(SessionState::Init),
            details: RwLock::new(SessionDetails::default()),
            attachment: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Transition to `state`. A torn-down session stays torn down.
    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current == SessionState::TornDown || *current == state {
            return;
        }
        tracing::debug!(session_id = %self.id, old_state = %*current, new_state = %state, "state transition");
        *current = state;
    }

    pub fn details(&self) -> SessionDetails {
        self.details.read().clone()
    }

    pub fn update_details(&self, f: impl FnOnce(&mut SessionDetails)) {
        f(&mut self.details.write());
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.attachment.lock().clone()
    }

    /// Record the bus attachment, replacing any previous one.
    pub fn attach(&self, attachment: Attachment) {
        *self.attachment.lock() = Some(attachment);
    }

    /// Undo the bus attachment, if any.
    pub fn detach(&self, bus: &dyn MediaBus) {
        let attachment = self.attachment.lock().take();
        match attachment {
            Some(Attachment::Subscriber { stream_path }) => bus.unsubscribe(&stream_path, &self.id),
            Some(Attachment::Publisher { stream_path }) => bus.unpublish(&stream_path),
            None => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down: leave the bus, leave the registry, close the
    /// socket. Only the first call has any effect.
    pub fn teardown(&self, ctx: &ServerContext, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::TornDown);
        self.detach(ctx.bus.as_ref());
        ctx.registry.remove(&self.id);
        self.writer.shutdown();

        let traffic = self.writer.traffic();
        tracing::info!(
            session_id = %self.id,
            reason,
            in_bytes = traffic.received(),
            out_bytes = traffic.sent(),
            "session closed"
        );
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"0000000000000001;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, DEFAULT_SESSION_TIMEOUT_SECS)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Thread-safe registry of live sessions.
///
/// Backed by `parking_lot::RwLock`; the lock is held only for single map
/// operations.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) -> Result<()> {
        let total = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&session.id) {
                return Err(RtspError::DuplicateSession(session.id.clone()));
            }
            sessions.insert(session.id.clone(), session.clone());
            sessions.len()
        };
        tracing::debug!(session_id = %session.id, total_sessions = total, "session registered");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let (removed, total) = {
            let mut sessions = self.sessions.write();
            (sessions.remove(id), sessions.len())
        };
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = total, "session removed");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Sessions whose details name `stream_path`.
    pub fn by_stream(&self, stream_path: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.details.read().stream_path == stream_path)
            .cloned()
            .collect()
    }
}
