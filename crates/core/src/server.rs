use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::bus::{BusHooks, MediaBus, normalize_stream_path};
use crate::client::{self, RelayKind, relay::AutoRelay};
use crate::config::ServerConfig;
use crate::error::{Result, RtspError};
use crate::monitor::{self, PullStatus, SessionInfo};
use crate::protocol::auth::Authenticator;
use crate::session::{Session, SessionRegistry};
use crate::transport::PortAllocator;
use crate::transport::tcp;

/// Everything a session, the listener or the relay client needs.
///
/// Cheap to clone; all fields are shared handles.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub registry: SessionRegistry,
    pub bus: Arc<dyn MediaBus>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub ports: Arc<PortAllocator>,
    /// Runtime auto-pull switch, seeded from the config.
    pub auto_pull: Arc<AtomicBool>,
    /// Cleared when the server stops; relays stop reconnecting.
    pub running: Arc<AtomicBool>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, bus: Arc<dyn MediaBus>) -> Self {
        let ports = PortAllocator::new(config.udp_port_min, config.udp_port_max);
        let auto_pull = config.auto_pull;
        Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            bus,
            authenticator: None,
            ports: Arc::new(ports),
            auto_pull: Arc::new(AtomicBool::new(auto_pull)),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// High-level RTSP server orchestrator.
///
/// Owns the session registry and the relay hooks, and delegates TCP
/// connection handling to [`transport::tcp`](crate::transport::tcp).
pub struct Server {
    ctx: ServerContext,
    listening: Arc<AtomicBool>,
    /// Sole strong handle on the bus hooks; the bus holds them weakly.
    _relay: Arc<AutoRelay>,
    listener_thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a server on top of `bus` and register the auto pull/push
    /// hooks with it.
    pub fn new(config: ServerConfig, bus: Arc<dyn MediaBus>) -> Self {
        let ctx = ServerContext::new(config, bus);
        let relay = Arc::new(AutoRelay::new(ctx.clone()));
        let hooks: Arc<dyn BusHooks> = relay.clone();
        ctx.bus.register_hooks(Arc::downgrade(&hooks));

        Self {
            ctx,
            listening: Arc::new(AtomicBool::new(false)),
            _relay: relay,
            listener_thread: None,
            local_addr: None,
        }
    }

    /// Require credentials on every request except OPTIONS.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.ctx.authenticator = Some(authenticator);
        self
    }

    fn bind(&mut self) -> Result<TcpListener> {
        if self.listening.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }
        let listener = TcpListener::bind(&self.ctx.config.listen_addr)?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);
        self.ctx.running.store(true, Ordering::SeqCst);
        self.listening.store(true, Ordering::SeqCst);
        tracing::info!(%addr, "RTSP server listening");
        Ok(listener)
    }

    /// Listen and serve on the calling thread until [`stop`](Self::stop)
    /// or a fatal accept error.
    pub fn run(&mut self) -> Result<()> {
        let listener = self.bind()?;
        let result = tcp::accept_loop(listener, self.ctx.clone(), self.listening.clone());
        self.listening.store(false, Ordering::SeqCst);
        result
    }

    /// Listen and serve on a background thread.
    pub fn start(&mut self) -> Result<()> {
        let listener = self.bind()?;
        let ctx = self.ctx.clone();
        let listening = self.listening.clone();

        let handle = thread::Builder::new()
            .name("rtsp-listener".to_string())
            .spawn(move || {
                if let Err(e) = tcp::accept_loop(listener, ctx, listening.clone()) {
                    tracing::error!(error = %e, "listener terminated");
                }
                listening.store(false, Ordering::SeqCst);
            })?;
        self.listener_thread = Some(handle);
        Ok(())
    }

    /// Stop listening and close every live session.
    pub fn stop(&mut self) {
        tracing::info!("server stopping");
        self.listening.store(false, Ordering::SeqCst);
        self.ctx.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener_thread.take()
            && handle.join().is_err()
        {
            tracing::error!("listener thread panicked");
        }
        for session in self.ctx.registry.sessions() {
            session.teardown(&self.ctx, "server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Bound listening address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn set_auto_pull(&self, enabled: bool) {
        tracing::info!(enabled, "auto pull toggled");
        self.ctx.auto_pull.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_pull(&self) -> bool {
        self.ctx.auto_pull.load(Ordering::SeqCst)
    }

    /// Pull `target` (default: the configured template) into `stream_path`.
    ///
    /// Returns once the handshake completed and the stream is published.
    /// On failure nothing is published; with reconnect enabled a retry is
    /// scheduled in the background.
    pub fn pull_stream(&self, stream_path: &str, target: Option<&str>) -> Result<Arc<Session>> {
        let path = normalize_stream_path(stream_path);
        let target = target.map_or_else(|| self.ctx.config.remote_url(path), str::to_string);
        client::start_relay(&self.ctx, RelayKind::Pull, path, &target)
    }

    /// Push the local publisher of `stream_path` to `target` (default: the
    /// configured push template).
    pub fn push_stream(&self, stream_path: &str, target: Option<&str>) -> Result<Arc<Session>> {
        let path = normalize_stream_path(stream_path);
        let target = target.map_or_else(|| self.ctx.config.push_url(path), str::to_string);
        client::start_relay(&self.ctx, RelayKind::Push, path, &target)
    }

    /// On-demand pull with a JSON-ready outcome.
    pub fn pull_status(&self, stream_path: &str, target: &str) -> PullStatus {
        self.pull_stream(stream_path, Some(target)).into()
    }

    /// Monitoring snapshot of every live session.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        monitor::snapshot(&self.ctx.registry)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.listening.load(Ordering::SeqCst) || self.listener_thread.is_some() {
            self.stop();
        }
    }
}
