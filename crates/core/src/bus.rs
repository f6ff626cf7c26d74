//! Interface to the surrounding media-distribution bus.
//!
//! The engine never looks inside media payloads. It hands the bus complete
//! RTP/RTCP packets tagged with the track they belong to, and receives the
//! same from it for players and pushers. Stream paths are normalized (no
//! leading or trailing `/`) before they reach the bus.

use std::sync::Weak;

use serde::Serialize;

use crate::error::Result;

/// Media kind of an SDP track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Which half of a track's channel pair a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

/// One RTP or RTCP packet exchanged with the codec layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub track: TrackKind,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl MediaPacket {
    pub fn rtp(track: TrackKind, payload: Vec<u8>) -> Self {
        Self {
            track,
            kind: PacketKind::Rtp,
            payload,
        }
    }

    pub fn rtcp(track: TrackKind, payload: Vec<u8>) -> Self {
        Self {
            track,
            kind: PacketKind::Rtcp,
            payload,
        }
    }
}

/// Receiver of a stream's packets (a player session, a pusher, ...).
///
/// Returning an error tells the bus the subscriber is gone.
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: &MediaPacket) -> Result<()>;
}

/// Events the bus raises toward the engine.
pub trait BusHooks: Send + Sync {
    /// A subscriber attached to `stream_path`.
    fn on_subscribe(&self, stream_path: &str, has_publisher: bool);

    /// A publisher was registered for `stream_path`.
    fn on_publish(&self, _stream_path: &str) {}
}

/// The narrow slice of the media bus the engine depends on.
pub trait MediaBus: Send + Sync {
    /// Register a publisher with its SDP. Fails with
    /// [`StreamBusy`](crate::RtspError::StreamBusy) if one is already live.
    fn publish(&self, stream_path: &str, sdp: &str) -> Result<()>;

    /// Drop the publisher of `stream_path`, if any.
    fn unpublish(&self, stream_path: &str);

    /// SDP of the live publisher, if any.
    fn describe(&self, stream_path: &str) -> Option<String>;

    /// Fan a publisher's packet out to the stream's subscribers.
    fn forward(&self, stream_path: &str, packet: &MediaPacket);

    /// Attach `sink` to `stream_path` under `subscriber_id`.
    fn subscribe(
        &self,
        stream_path: &str,
        subscriber_id: &str,
        sink: std::sync::Arc<dyn PacketSink>,
    ) -> Result<()>;

    fn unsubscribe(&self, stream_path: &str, subscriber_id: &str);

    /// Route bus events to `hooks` for as long as the hooks are alive.
    fn register_hooks(&self, hooks: Weak<dyn BusHooks>);
}

/// Normalize a stream path: `/cam1/` → `cam1`.
pub fn normalize_stream_path(path: &str) -> &str {
    path.trim_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_slashes() {
        assert_eq!(normalize_stream_path("/camX"), "camX");
        assert_eq!(normalize_stream_path("live/cam1/"), "live/cam1");
        assert_eq!(normalize_stream_path("cam"), "cam");
    }
}
