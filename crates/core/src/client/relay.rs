use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use parking_lot::Mutex;

use crate::bus::BusHooks;
use crate::server::ServerContext;

use super::{RelayKind, pull, push, start_relay};

/// Bus hooks that start pulls and pushes automatically.
///
/// - A subscriber on a path without a publisher triggers a pull of the
///   templated `remote_addr`, while auto pull is on.
/// - A newly registered publisher triggers a push to the templated
///   `push_addr`, when auto push is configured.
///
/// At most one relay per (direction, path) is being established at a time.
/// The bus holds this object weakly; the [`Server`](crate::Server) owns it.
pub struct AutoRelay {
    ctx: ServerContext,
    in_flight: Arc<Mutex<HashSet<(RelayKind, String)>>>,
}

impl AutoRelay {
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn trigger(&self, kind: RelayKind, stream_path: &str, target: String) {
        let key = (kind, stream_path.to_string());
        if !self.in_flight.lock().insert(key.clone()) {
            tracing::debug!(relay = kind.as_str(), stream_path, "relay already in flight");
            return;
        }

        tracing::info!(relay = kind.as_str(), stream_path, %target, "starting automatic relay");
        let ctx = self.ctx.clone();
        let in_flight = self.in_flight.clone();
        let spawned = thread::Builder::new()
            .name(format!("rtsp-auto-{}", kind.as_str()))
            .spawn(move || {
                let _ = start_relay(&ctx, kind, &key.1, &target);
                in_flight.lock().remove(&key);
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn relay thread");
            self.in_flight.lock().remove(&(kind, stream_path.to_string()));
        }
    }
}

impl BusHooks for AutoRelay {
    fn on_subscribe(&self, stream_path: &str, has_publisher: bool) {
        if has_publisher || stream_path.is_empty() || !self.ctx.auto_pull.load(Ordering::SeqCst) {
            return;
        }
        self.trigger(RelayKind::Pull, stream_path, self.ctx.config.remote_url(stream_path));
    }

    fn on_publish(&self, stream_path: &str) {
        if !self.ctx.config.auto_push {
            return;
        }
        self.trigger(RelayKind::Push, stream_path, self.ctx.config.push_url(stream_path));
    }
}

/// Retry a failed relay in the background.
///
/// Makes up to `reconnect_attempts` full handshakes, one every
/// `reconnect_interval_ms`. A pull stops early once the path has a
/// publisher again; a push stops once the path has none. Exhaustion is
/// logged as an error.
pub fn schedule_reconnect(ctx: ServerContext, kind: RelayKind, stream_path: String, target: String) {
    tracing::info!(
        relay = kind.as_str(),
        %stream_path,
        %target,
        attempts = ctx.config.reconnect_attempts,
        "reconnect scheduled"
    );

    let spawned = thread::Builder::new()
        .name(format!("rtsp-reconnect-{}", kind.as_str()))
        .spawn(move || {
            for attempt in 1..=ctx.config.reconnect_attempts {
                thread::sleep(ctx.config.reconnect_interval());
                if !ctx.is_running() {
                    return;
                }
                let has_publisher = ctx.bus.describe(&stream_path).is_some();
                let result = match kind {
                    RelayKind::Pull if has_publisher => {
                        tracing::info!(%stream_path, "stream already published, reconnect abandoned");
                        return;
                    }
                    RelayKind::Push if !has_publisher => {
                        tracing::info!(%stream_path, "stream no longer published, reconnect abandoned");
                        return;
                    }
                    RelayKind::Pull => pull(&ctx, &stream_path, &target),
                    RelayKind::Push => push(&ctx, &stream_path, &target),
                };
                match result {
                    Ok(session) => {
                        tracing::info!(session_id = %session.id, attempt, %stream_path, "reconnected");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(attempt, %stream_path, error = %e, "reconnect attempt failed");
                    }
                }
            }
            tracing::error!(relay = kind.as_str(), %stream_path, %target, "reconnect attempts exhausted");
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to spawn reconnect thread");
    }
}
