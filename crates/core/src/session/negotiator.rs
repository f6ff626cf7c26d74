use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::bus::{PacketKind, TrackKind};
use crate::error::TransportError;
use crate::transport::udp::{PortAllocator, UdpPair};

use super::transport::{LowerTransport, TransportHeader};

/// How one track's packets travel.
#[derive(Debug, Clone)]
pub enum TransportAssignment {
    /// `$`-framed on the RTSP connection.
    Interleaved { rtp: u8, rtcp: u8 },
    Udp(Arc<UdpPair>),
}

impl TransportAssignment {
    fn uses_channel(&self, channel: u8) -> bool {
        matches!(self, Self::Interleaved { rtp, rtcp } if *rtp == channel || *rtcp == channel)
    }
}

/// Per-session transport assignments, at most one per track.
///
/// Interleaved channel numbers are unique across all tracks of the
/// session. A track without an entry has not been set up.
#[derive(Debug, Default)]
pub struct TransportNegotiator {
    assignments: HashMap<TrackKind, TransportAssignment>,
}

impl TransportNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a transport to `track` from a parsed `Transport` header.
    ///
    /// Fails without touching existing assignments when the track is
    /// already set up, the proposed channels collide, or no UDP pair could
    /// be bound.
    pub fn negotiate(
        &mut self,
        track: TrackKind,
        header: &TransportHeader,
        peer_ip: IpAddr,
        ports: &PortAllocator,
    ) -> Result<TransportAssignment, TransportError> {
        if self.assignments.contains_key(&track) {
            return Err(TransportError::TrackAlreadySetup(track.as_str().to_string()));
        }

        match (header.lower, header.interleaved, header.client_port) {
            (LowerTransport::Tcp, Some((rtp, rtcp)), _) => {
                self.assign_interleaved(track, rtp, rtcp)?;
            }
            (LowerTransport::Udp, _, Some(peer_ports)) => {
                let pair = UdpPair::bind(ports, peer_ip, peer_ports)?;
                self.assignments
                    .insert(track, TransportAssignment::Udp(Arc::new(pair)));
            }
            _ => {
                return Err(TransportError::Malformed(
                    "no channels or client ports".to_string(),
                ));
            }
        }

        Ok(self.assignments[&track].clone())
    }

    /// Claim an interleaved channel pair for `track`.
    pub fn assign_interleaved(
        &mut self,
        track: TrackKind,
        rtp: u8,
        rtcp: u8,
    ) -> Result<(), TransportError> {
        if self.assignments.contains_key(&track) {
            return Err(TransportError::TrackAlreadySetup(track.as_str().to_string()));
        }
        if rtp == rtcp {
            return Err(TransportError::ChannelCollision(rtp));
        }
        for channel in [rtp, rtcp] {
            if self.assignments.values().any(|a| a.uses_channel(channel)) {
                return Err(TransportError::ChannelInUse(channel));
            }
        }
        self.assignments
            .insert(track, TransportAssignment::Interleaved { rtp, rtcp });
        Ok(())
    }

    pub fn assignment(&self, track: TrackKind) -> Option<&TransportAssignment> {
        self.assignments.get(&track)
    }

    /// Whether every one of `tracks` has an assignment.
    pub fn is_complete(&self, tracks: impl IntoIterator<Item = TrackKind>) -> bool {
        tracks.into_iter().all(|t| self.assignments.contains_key(&t))
    }

    /// Map an incoming interleaved channel to its track and packet kind.
    pub fn route(&self, channel: u8) -> Option<(TrackKind, PacketKind)> {
        self.assignments.iter().find_map(|(track, a)| match a {
            TransportAssignment::Interleaved { rtp, .. } if *rtp == channel => {
                Some((*track, PacketKind::Rtp))
            }
            TransportAssignment::Interleaved { rtcp, .. } if *rtcp == channel => {
                Some((*track, PacketKind::Rtcp))
            }
            _ => None,
        })
    }

    /// Copy of the assignments, for a forwarding sink.
    pub fn routes(&self) -> HashMap<TrackKind, TransportAssignment> {
        self.assignments.clone()
    }

    /// UDP pairs of all tracks set up over UDP.
    pub fn udp_pairs(&self) -> impl Iterator<Item = (TrackKind, &Arc<UdpPair>)> {
        self.assignments.iter().filter_map(|(track, a)| match a {
            TransportAssignment::Udp(pair) => Some((*track, pair)),
            TransportAssignment::Interleaved { .. } => None,
        })
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tcp(rtp: u8, rtcp: u8) -> TransportHeader {
        TransportHeader::parse(&TransportHeader::interleaved_reply(rtp, rtcp, false)).unwrap()
    }

    fn ports() -> PortAllocator {
        PortAllocator::new(30_000, 40_000)
    }

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn tracks_get_distinct_channels() {
        let mut n = TransportNegotiator::new();
        n.negotiate(TrackKind::Video, &tcp(0, 1), PEER, &ports()).unwrap();
        n.negotiate(TrackKind::Audio, &tcp(2, 3), PEER, &ports()).unwrap();

        assert!(n.is_complete([TrackKind::Video, TrackKind::Audio]));
        assert_eq!(n.route(3), Some((TrackKind::Audio, PacketKind::Rtcp)));
        assert_eq!(n.route(0), Some((TrackKind::Video, PacketKind::Rtp)));
        assert_eq!(n.route(4), None);
    }

    #[test]
    fn colliding_channel_is_rejected_without_mutation() {
        let mut n = TransportNegotiator::new();
        n.negotiate(TrackKind::Video, &tcp(0, 1), PEER, &ports()).unwrap();

        let err = n
            .negotiate(TrackKind::Audio, &tcp(0, 5), PEER, &ports())
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelInUse(0)));
        assert!(n.assignment(TrackKind::Audio).is_none());
        assert!(!n.is_complete([TrackKind::Video, TrackKind::Audio]));
    }

    #[test]
    fn rtp_and_rtcp_must_differ() {
        let mut n = TransportNegotiator::new();
        assert!(matches!(
            n.assign_interleaved(TrackKind::Video, 4, 4),
            Err(TransportError::ChannelCollision(4))
        ));
        assert!(n.is_empty());
    }

    #[test]
    fn duplicate_setup_keeps_existing_assignment() {
        let mut n = TransportNegotiator::new();
        n.negotiate(TrackKind::Video, &tcp(0, 1), PEER, &ports()).unwrap();

        let err = n
            .negotiate(TrackKind::Video, &tcp(6, 7), PEER, &ports())
            .unwrap_err();
        assert!(matches!(err, TransportError::TrackAlreadySetup(_)));
        assert!(matches!(
            n.assignment(TrackKind::Video),
            Some(TransportAssignment::Interleaved { rtp: 0, rtcp: 1 })
        ));
        assert_eq!(n.len(), 1);
    }

    #[test]
    fn udp_assignment_binds_a_pair() {
        let mut n = TransportNegotiator::new();
        let header = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
        let a = n.negotiate(TrackKind::Audio, &header, PEER, &ports()).unwrap();

        let TransportAssignment::Udp(pair) = a else {
            panic!("expected UDP assignment");
        };
        let (rtp, rtcp) = pair.local_ports();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
        assert_eq!(pair.peer_ports(), (8000, 8001));
        assert_eq!(n.udp_pairs().count(), 1);
    }
}
