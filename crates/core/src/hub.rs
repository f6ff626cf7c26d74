use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::bus::{BusHooks, MediaBus, MediaPacket, PacketSink, normalize_stream_path};
use crate::error::{Result, RtspError};

/// A named stream: an optional publisher SDP and the subscribed sinks.
///
/// Subscribers may attach before a publisher exists; they start receiving
/// packets as soon as one is registered.
#[derive(Default)]
struct Stream {
    sdp: Option<String>,
    subscribers: HashMap<String, Arc<dyn PacketSink>>,
}

impl Stream {
    fn is_idle(&self) -> bool {
        self.sdp.is_none() && self.subscribers.is_empty()
    }
}

/// In-process [`MediaBus`]: stream paths mapped to one publisher and any
/// number of subscribers.
///
/// Locks are held only for map operations. Packet delivery and hook
/// callbacks run after the lock is released, so sinks and hooks may call
/// back into the hub.
#[derive(Clone, Default)]
pub struct StreamHub {
    streams: Arc<RwLock<HashMap<String, Stream>>>,
    hooks: Arc<RwLock<Vec<Weak<dyn BusHooks>>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `stream_path` currently has a publisher.
    pub fn has_publisher(&self, stream_path: &str) -> bool {
        self.streams
            .read()
            .get(normalize_stream_path(stream_path))
            .is_some_and(|s| s.sdp.is_some())
    }

    /// Subscriber ids attached to `stream_path`.
    pub fn subscriber_ids(&self, stream_path: &str) -> Vec<String> {
        self.streams
            .read()
            .get(normalize_stream_path(stream_path))
            .map(|s| s.subscribers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Paths that currently have a publisher.
    pub fn published_paths(&self) -> Vec<String> {
        self.streams
            .read()
            .iter()
            .filter(|(_, s)| s.sdp.is_some())
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn live_hooks(&self) -> Vec<Arc<dyn BusHooks>> {
        let mut hooks = self.hooks.write();
        hooks.retain(|h| h.strong_count() > 0);
        hooks.iter().filter_map(Weak::upgrade).collect()
    }
}

impl MediaBus for StreamHub {
    fn publish(&self, stream_path: &str, sdp: &str) -> Result<()> {
        let path = normalize_stream_path(stream_path);
        {
            let mut streams = self.streams.write();
            let stream = streams.entry(path.to_string()).or_default();
            if stream.sdp.is_some() {
                return Err(RtspError::StreamBusy(path.to_string()));
            }
            stream.sdp = Some(sdp.to_string());
        }
        tracing::info!(stream_path = path, "publisher registered");

        for hook in self.live_hooks() {
            hook.on_publish(path);
        }
        Ok(())
    }

    fn unpublish(&self, stream_path: &str) {
        let path = normalize_stream_path(stream_path);
        let mut streams = self.streams.write();
        if let Some(stream) = streams.get_mut(path)
            && stream.sdp.take().is_some()
        {
            tracing::info!(stream_path = path, "publisher removed");
            if stream.is_idle() {
                streams.remove(path);
            }
        }
    }

    fn describe(&self, stream_path: &str) -> Option<String> {
        self.streams
            .read()
            .get(normalize_stream_path(stream_path))
            .and_then(|s| s.sdp.clone())
    }

    fn forward(&self, stream_path: &str, packet: &MediaPacket) {
        let path = normalize_stream_path(stream_path);
        let sinks: Vec<(String, Arc<dyn PacketSink>)> = match self.streams.read().get(path) {
            Some(stream) => stream
                .subscribers
                .iter()
                .map(|(id, sink)| (id.clone(), sink.clone()))
                .collect(),
            None => return,
        };

        let mut failed = Vec::new();
        for (id, sink) in sinks {
            if let Err(e) = sink.send_packet(packet) {
                tracing::debug!(stream_path = path, subscriber = %id, error = %e, "dropping subscriber");
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            let mut streams = self.streams.write();
            if let Some(stream) = streams.get_mut(path) {
                for id in &failed {
                    stream.subscribers.remove(id);
                }
                if stream.is_idle() {
                    streams.remove(path);
                }
            }
        }
    }

    fn subscribe(
        &self,
        stream_path: &str,
        subscriber_id: &str,
        sink: Arc<dyn PacketSink>,
    ) -> Result<()> {
        let path = normalize_stream_path(stream_path);
        let has_publisher = {
            let mut streams = self.streams.write();
            let stream = streams.entry(path.to_string()).or_default();
            stream.subscribers.insert(subscriber_id.to_string(), sink);
            stream.sdp.is_some()
        };
        tracing::debug!(stream_path = path, subscriber_id, has_publisher, "subscriber attached");

        for hook in self.live_hooks() {
            hook.on_subscribe(path, has_publisher);
        }
        Ok(())
    }

    fn unsubscribe(&self, stream_path: &str, subscriber_id: &str) {
        let path = normalize_stream_path(stream_path);
        let mut streams = self.streams.write();
        if let Some(stream) = streams.get_mut(path) {
            if stream.subscribers.remove(subscriber_id).is_some() {
                tracing::debug!(stream_path = path, subscriber_id, "subscriber detached");
            }
            if stream.is_idle() {
                streams.remove(path);
            }
        }
    }

    fn register_hooks(&self, hooks: Weak<dyn BusHooks>) {
        self.hooks.write().push(hooks);
    }
}

/// Extract the stream path from an RTSP request URI.
///
/// `rtsp://host:8554/live/cam1` → `live/cam1`
/// `rtsp://host:8554/cam1/?token=x` → `cam1`
/// `/cam1`                       → `cam1`
/// `rtsp://host:8554`            → `` (empty)
pub fn extract_stream_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "",
        }
    } else {
        uri
    };

    let path = match path.find('?') {
        Some(q) => &path[..q],
        None => path,
    };
    normalize_stream_path(path)
}
