//! SDP (Session Description Protocol) parsing (RFC 8866).
//!
//! The engine does not generate SDP: DESCRIBE answers with the publisher's
//! description verbatim. It only needs each track's kind and control URL
//! to route SETUP requests, plus the codec attributes for monitoring:
//!
//! ```text
//! m=video 0 RTP/AVP 96          ← kind + payload type
//! a=rtpmap:96 H264/90000        ← encoding / clock rate
//! a=fmtp:96 packetization-mode=1
//! a=control:trackID=0           ← SETUP URL suffix
//! ```

use crate::bus::TrackKind;
use crate::error::{Result, RtspError};

/// One negotiable media track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub kind: TrackKind,
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap` (e.g. `H264`, `MPEG4-GENERIC`).
    pub encoding: Option<String>,
    pub clock_rate: Option<u32>,
    pub fmtp: Option<String>,
    /// `a=control` value: relative (`trackID=0`) or absolute URL.
    pub control: Option<String>,
}

/// A parsed session description plus its original text.
#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub raw: String,
    pub tracks: Vec<TrackDescriptor>,
}

impl SessionDescription {
    /// Parse `raw`, keeping the first video and the first audio track.
    ///
    /// Other media kinds are ignored. A description with neither video nor
    /// audio is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let session = sdp_types::Session::parse(raw.as_bytes())
            .map_err(|e| RtspError::Sdp(e.to_string()))?;

        let mut tracks: Vec<TrackDescriptor> = Vec::new();
        for media in &session.medias {
            let kind = match media.media.as_str() {
                "video" => TrackKind::Video,
                "audio" => TrackKind::Audio,
                other => {
                    tracing::debug!(media = other, "ignoring SDP media section");
                    continue;
                }
            };
            if tracks.iter().any(|t| t.kind == kind) {
                tracing::debug!(kind = kind.as_str(), "ignoring extra SDP track");
                continue;
            }
            tracks.push(parse_media(kind, media)?);
        }

        if tracks.is_empty() {
            return Err(RtspError::Sdp("no audio or video track".to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            tracks,
        })
    }

    pub fn track(&self, kind: TrackKind) -> Option<&TrackDescriptor> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Find the track a SETUP request URI refers to.
    ///
    /// Matches on the `a=control` suffix first, then on a `video`/`audio`
    /// substring, then falls back to the only track of a single-track
    /// description.
    pub fn resolve_track(&self, uri: &str) -> Option<TrackKind> {
        let by_control = self.tracks.iter().find(|t| match t.control.as_deref() {
            Some(control) if control.contains("://") => uri == control,
            Some(control) if !control.is_empty() && control != "*" => {
                uri.ends_with(&format!("/{control}")) || uri == control
            }
            _ => false,
        });
        if let Some(track) = by_control {
            return Some(track.kind);
        }

        let lower = uri.to_ascii_lowercase();
        for track in &self.tracks {
            if lower.contains(track.kind.as_str()) {
                return Some(track.kind);
            }
        }

        match self.tracks.as_slice() {
            [only] => Some(only.kind),
            _ => None,
        }
    }
}

fn parse_media(kind: TrackKind, media: &sdp_types::Media) -> Result<TrackDescriptor> {
    let pt_str = media.fmt.split_ascii_whitespace().next().unwrap_or("");
    let payload_type: u8 = pt_str
        .parse()
        .ok()
        .filter(|pt| pt & 0x80 == 0)
        .ok_or_else(|| RtspError::Sdp(format!("invalid payload type {pt_str:?}")))?;

    let mut track = TrackDescriptor {
        kind,
        payload_type,
        encoding: None,
        clock_rate: None,
        fmtp: None,
        control: None,
    };

    for a in &media.attributes {
        let value = a.value.as_deref();
        match (a.attribute.as_str(), value) {
            ("rtpmap", Some(v)) => {
                // rtpmap-value = payload-type SP encoding-name "/" clock-rate [ "/" params ]
                if let Some((pt, map)) = v.split_once(' ')
                    && pt == pt_str
                {
                    let mut parts = map.split('/');
                    track.encoding = parts.next().map(|s| s.trim().to_string());
                    track.clock_rate = parts.next().and_then(|r| r.trim().parse().ok());
                }
            }
            ("fmtp", Some(v)) => {
                if let Some((pt, params)) = v.split_once(' ')
                    && pt == pt_str
                {
                    track.fmtp = Some(params.trim().to_string());
                }
            }
            ("control", Some(v)) => track.control = Some(v.trim().to_string()),
            _ => {}
        }
    }

    Ok(track)
}

/// Resolve a track's control attribute against the presentation base URL
/// (RFC 2326 §C.1.1).
pub fn control_url(base: &str, control: Option<&str>) -> String {
    match control {
        Some(c) if c.contains("://") => c.to_string(),
        Some(c) if !c.is_empty() && c != "*" => {
            format!("{}/{}", base.trim_end_matches('/'), c.trim_start_matches('/'))
        }
        _ => base.to_string(),
    }
}
