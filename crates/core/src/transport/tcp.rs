use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{Result, RtspError};
use crate::protocol::handler::Reply;
use crate::protocol::{Message, MethodHandler, read_message};
use crate::server::ServerContext;
use crate::session::{Role, Session};

use super::{DeadlineStream, SessionWriter};

/// Sleep between polls of the non-blocking listener.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

const EMFILE: i32 = 24;
const ENFILE: i32 = 23;
const ENOMEM: i32 = 12;
#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

/// What the listener does after a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptDecision {
    /// Transient: back off and accept again.
    Retry,
    /// Stop listening and report the error.
    Fatal,
}

/// Classify an `accept` error.
///
/// Aborted/reset handshakes, interrupts, timeouts and resource exhaustion
/// (descriptor or buffer limits) are transient. Everything else is fatal.
pub fn classify_accept_error(error: &io::Error) -> AcceptDecision {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => return AcceptDecision::Retry,
        _ => {}
    }
    match error.raw_os_error() {
        Some(EMFILE | ENFILE | ENOBUFS | ENOMEM) => AcceptDecision::Retry,
        _ => AcceptDecision::Fatal,
    }
}

/// Exponential backoff for transient accept failures: 5 ms doubling up
/// to 1 s.
#[derive(Debug)]
pub struct Backoff {
    current: Option<Duration>,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => Self::INITIAL,
            Some(d) => (d * 2).min(Self::MAX),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
/// Returns the first fatal accept error.
pub fn accept_loop(listener: TcpListener, ctx: ServerContext, running: Arc<AtomicBool>) -> Result<()> {
    listener.set_nonblocking(true)?;
    let mut backoff = Backoff::new();

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                backoff.reset();
                if let Err(e) = spawn_session(stream, peer, &ctx, &running) {
                    tracing::warn!(%peer, error = %e, "failed to start session");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => match classify_accept_error(&e) {
                AcceptDecision::Retry => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "transient accept error");
                    thread::sleep(delay);
                }
                AcceptDecision::Fatal => {
                    tracing::error!(error = %e, "fatal accept error, listener stopping");
                    return Err(e.into());
                }
            },
        }
    }
    tracing::debug!("accept loop exited");
    Ok(())
}

/// Wrap an accepted stream in a session, register it and serve it on its
/// own thread.
fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &ServerContext,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let reader = DeadlineStream::new(stream, ctx.config.timeout());
    let writer = SessionWriter::new(reader.try_clone()?);
    let session = Arc::new(Session::new(Role::Inbound { peer }, writer));
    ctx.registry.register(session.clone())?;

    tracing::info!(session_id = %session.id, %peer, "client connected");

    let capacity = ctx.config.read_buffer_size.max(4096);
    let conn = Connection {
        reader: BufReader::with_capacity(capacity, reader),
        handler: MethodHandler::new(ctx.clone(), session.clone(), peer),
        ctx: ctx.clone(),
        running: running.clone(),
    };

    let spawned = thread::Builder::new()
        .name(format!("rtsp-session-{}", session.id))
        .spawn(move || conn.serve());
    if let Err(e) = spawned {
        session.teardown(ctx, "thread spawn failed");
        return Err(e.into());
    }
    Ok(())
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<DeadlineStream>,
    handler: MethodHandler,
    ctx: ServerContext,
    running: Arc<AtomicBool>,
}

impl Connection {
    fn serve(mut self) {
        let reason = self.run();
        let session = self.handler.session().clone();
        session.teardown(&self.ctx, reason);
    }

    /// Read loop. Returns the reason for exiting.
    fn run(&mut self) -> &'static str {
        while self.running.load(Ordering::SeqCst) {
            let reply = match read_message(&mut self.reader) {
                Ok(None) => return "connection closed by peer",
                Ok(Some(Message::Request(request))) => self.handler.handle(&request),
                Ok(Some(Message::Data(frame))) => {
                    self.handler.on_frame(frame);
                    continue;
                }
                Ok(Some(Message::Response(response))) => {
                    tracing::debug!(status = response.status_code, "ignoring response from peer");
                    continue;
                }
                Err(e) if e.is_timeout() => return "idle timeout",
                Err(e @ RtspError::Parse { .. }) => self.handler.on_parse_error(e),
                Err(e) => {
                    tracing::debug!(session_id = %self.handler.session().id, error = %e, "read failed");
                    return "read error";
                }
            };

            if let Err(reason) = self.send(reply) {
                return reason;
            }
        }
        "server shutting down"
    }

    fn send(&self, reply: Reply) -> std::result::Result<(), &'static str> {
        let session = self.handler.session();
        if let Err(e) = session.writer.write_response(&reply.response) {
            tracing::debug!(session_id = %session.id, error = %e, "write failed");
            return Err("write error");
        }
        if reply.close {
            return Err("closed by request");
        }
        Ok(())
    }
}
