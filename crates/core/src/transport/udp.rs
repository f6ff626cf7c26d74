use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crate::bus::{MediaPacket, PacketKind, TrackKind};
use crate::error::{Result, TransportError};

/// Bind attempts before a SETUP gives up on UDP.
const BIND_ATTEMPTS: usize = 32;
/// Receive timeout of record-side sockets; bounds how long a receiver
/// outlives its session.
const RECV_POLL: Duration = Duration::from_millis(200);
const MAX_DATAGRAM: usize = 65_536;

/// Hands out local (RTP, RTCP) port pairs from a wrapping range.
///
/// Per RFC 3550 §11 the RTP port is even and RTCP is RTP + 1.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU32,
    min: u32,
    max: u32,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        let min = (u32::from(min) + 1) & !1;
        let max = u32::from(max).max(min + 1);
        Self {
            next: AtomicU32::new(min),
            min,
            max,
        }
    }

    /// Next candidate pair. Wraps back to the start of the range.
    pub fn next_pair(&self) -> (u16, u16) {
        loop {
            let rtp = self.next.fetch_add(2, Ordering::SeqCst);
            if rtp < self.max {
                return (rtp as u16, (rtp + 1) as u16);
            }
            tracing::debug!(rtp, min = self.min, "port range exhausted, wrapping");
            let _ = self
                .next
                .compare_exchange(rtp + 2, self.min, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

/// A bound RTP/RTCP socket pair for one track, plus the peer's ports.
#[derive(Debug)]
pub struct UdpPair {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    local_ports: (u16, u16),
    peer_rtp: SocketAddr,
    peer_rtcp: SocketAddr,
}

impl UdpPair {
    /// Bind a pair from `ports`, trying several candidates.
    pub fn bind(
        ports: &PortAllocator,
        peer_ip: IpAddr,
        peer_ports: (u16, u16),
    ) -> std::result::Result<Self, TransportError> {
        let mut last_err = None;
        for _ in 0..BIND_ATTEMPTS {
            let (rtp_port, rtcp_port) = ports.next_pair();
            let rtp = match UdpSocket::bind(("0.0.0.0", rtp_port)) {
                Ok(s) => s,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let rtcp = match UdpSocket::bind(("0.0.0.0", rtcp_port)) {
                Ok(s) => s,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            tracing::debug!(rtp_port, rtcp_port, %peer_ip, "bound UDP pair");
            return Ok(Self {
                rtp,
                rtcp,
                local_ports: (rtp_port, rtcp_port),
                peer_rtp: SocketAddr::new(peer_ip, peer_ports.0),
                peer_rtcp: SocketAddr::new(peer_ip, peer_ports.1),
            });
        }
        Err(TransportError::UdpBind(
            last_err.map_or_else(|| "no candidate ports".to_string(), |e| e.to_string()),
        ))
    }

    pub fn local_ports(&self) -> (u16, u16) {
        self.local_ports
    }

    pub fn peer_ports(&self) -> (u16, u16) {
        (self.peer_rtp.port(), self.peer_rtcp.port())
    }

    /// Send one packet to the peer's RTP or RTCP port.
    pub fn send(&self, kind: PacketKind, payload: &[u8]) -> Result<usize> {
        let sent = match kind {
            PacketKind::Rtp => self.rtp.send_to(payload, self.peer_rtp)?,
            PacketKind::Rtcp => self.rtcp.send_to(payload, self.peer_rtcp)?,
        };
        Ok(sent)
    }

    /// Start one receiver thread per socket.
    ///
    /// Each datagram is handed to `deliver` tagged with `track`. Receivers
    /// poll `alive` on every receive timeout and exit once it is false.
    pub fn spawn_receivers<A, F>(self: &Arc<Self>, track: TrackKind, alive: A, deliver: F) -> io::Result<()>
    where
        A: Fn() -> bool + Clone + Send + 'static,
        F: Fn(MediaPacket) + Clone + Send + 'static,
    {
        for kind in [PacketKind::Rtp, PacketKind::Rtcp] {
            let pair = self.clone();
            let alive = alive.clone();
            let deliver = deliver.clone();
            let port = match kind {
                PacketKind::Rtp => pair.local_ports.0,
                PacketKind::Rtcp => pair.local_ports.1,
            };
            thread::Builder::new()
                .name(format!("rtsp-udp-{port}"))
                .spawn(move || pair.receive(track, kind, alive, deliver))?;
        }
        Ok(())
    }

    fn receive<A, F>(&self, track: TrackKind, kind: PacketKind, alive: A, deliver: F)
    where
        A: Fn() -> bool,
        F: Fn(MediaPacket),
    {
        let socket = match kind {
            PacketKind::Rtp => &self.rtp,
            PacketKind::Rtcp => &self.rtcp,
        };
        if let Err(e) = socket.set_read_timeout(Some(RECV_POLL)) {
            tracing::warn!(error = %e, "UDP receiver not started");
            return;
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        while alive() {
            match socket.recv_from(&mut buf) {
                Ok((n, _from)) => deliver(MediaPacket {
                    track,
                    kind,
                    payload: buf[..n].to_vec(),
                }),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "UDP receive failed");
                    break;
                }
            }
        }
        tracing::trace!(track = track.as_str(), ?kind, "UDP receiver exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    #[test]
    fn pairs_are_even_and_adjacent() {
        let ports = PortAllocator::new(5001, 5010);
        assert_eq!(ports.next_pair(), (5002, 5003));
        assert_eq!(ports.next_pair(), (5004, 5005));
    }

    #[test]
    fn allocator_wraps_at_the_end_of_the_range() {
        let ports = PortAllocator::new(6000, 6003);
        assert_eq!(ports.next_pair(), (6000, 6001));
        assert_eq!(ports.next_pair(), (6002, 6003));
        assert_eq!(ports.next_pair(), (6000, 6001));
    }

    #[test]
    fn record_receivers_deliver_and_stop() {
        let ports = PortAllocator::new(40_000, 60_000);
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let pair = Arc::new(UdpPair::bind(&ports, localhost, (9, 10)).unwrap());
        let (rtp_port, _) = pair.local_ports();

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let alive = {
            let running = running.clone();
            move || running.load(Ordering::SeqCst)
        };
        pair.spawn_receivers(TrackKind::Video, alive, move |p| {
            let _ = tx.send(p);
        })
        .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0x80, 96, 0, 1], ("127.0.0.1", rtp_port)).unwrap();

        let packet = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(packet, MediaPacket::rtp(TrackKind::Video, vec![0x80, 96, 0, 1]));

        running.store(false, Ordering::SeqCst);
        // Both receivers drop their sender clones on exit.
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        ));
    }
}
