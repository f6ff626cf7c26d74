use std::collections::HashMap;
use std::sync::Arc;

use crate::bus::{MediaPacket, PacketKind, PacketSink, TrackKind};
use crate::error::{Result, RtspError};

use super::Session;
use super::negotiator::TransportAssignment;

/// Delivers bus packets to one session over its negotiated transports.
///
/// Used by playing server sessions and by push client sessions. Packets
/// for tracks the peer did not set up are dropped. Once the session is
/// closed every send fails, which detaches the sink from the bus.
pub struct ForwardSink {
    session: Arc<Session>,
    routes: HashMap<TrackKind, TransportAssignment>,
}

impl ForwardSink {
    pub fn new(session: Arc<Session>, routes: HashMap<TrackKind, TransportAssignment>) -> Self {
        Self { session, routes }
    }
}

impl PacketSink for ForwardSink {
    fn send_packet(&self, packet: &MediaPacket) -> Result<()> {
        if self.session.is_closed() {
            return Err(RtspError::SessionClosed(self.session.id.clone()));
        }
        match self.routes.get(&packet.track) {
            Some(TransportAssignment::Interleaved { rtp, rtcp }) => {
                let channel = match packet.kind {
                    PacketKind::Rtp => *rtp,
                    PacketKind::Rtcp => *rtcp,
                };
                self.session.writer.write_frame(channel, &packet.payload)
            }
            Some(TransportAssignment::Udp(pair)) => {
                let n = pair.send(packet.kind, &packet.payload)?;
                self.session.writer.traffic().add_sent(n);
                Ok(())
            }
            None => Ok(()),
        }
    }
}
