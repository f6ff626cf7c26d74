use crate::error::TransportError;

/// Lower transport requested in a `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    Udp,
    Tcp,
}

/// One parsed alternative of the `Transport` header (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// Transport: RTP/AVP/TCP;unicast;interleaved=2-3;mode=record
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub lower: LowerTransport,
    /// Proposed interleaved (RTP, RTCP) channels.
    pub interleaved: Option<(u8, u8)>,
    /// Peer's (RTP, RTCP) receive ports.
    pub client_port: Option<(u16, u16)>,
    /// `mode=record` (or `mode="RECORD"`).
    pub record: bool,
}

impl TransportHeader {
    /// Parse a `Transport` header value.
    ///
    /// Comma-separated alternatives are tried in order and the first usable
    /// one wins. When none is usable the error of the first one is returned.
    ///
    /// ```
    /// use rtsp::session::transport::{LowerTransport, TransportHeader};
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
    /// assert_eq!(th.lower, LowerTransport::Tcp);
    /// assert_eq!(th.interleaved, Some((0, 1)));
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.client_port, Some((8000, 8001)));
    /// ```
    pub fn parse(header: &str) -> Result<Self, TransportError> {
        let mut first_err = None;
        for alternative in header.split(',') {
            match Self::parse_one(alternative) {
                Ok(th) => return Ok(th),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or_else(|| TransportError::Malformed(header.to_string())))
    }

    fn parse_one(spec: &str) -> Result<Self, TransportError> {
        let mut parts = spec.split(';').map(str::trim);
        let protocol = parts.next().unwrap_or("");

        let lower = match protocol.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => LowerTransport::Udp,
            "RTP/AVP/TCP" => LowerTransport::Tcp,
            "" => return Err(TransportError::Malformed(spec.to_string())),
            other => return Err(TransportError::Unsupported(other.to_string())),
        };

        let mut th = TransportHeader {
            lower,
            interleaved: None,
            client_port: None,
            record: false,
        };

        for param in parts {
            let (name, value) = match param.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim())),
                None => (param, None),
            };
            match (name.to_ascii_lowercase().as_str(), value) {
                ("interleaved", Some(v)) => {
                    th.interleaved = Some(parse_channels(v)?);
                }
                ("client_port", Some(v)) => {
                    th.client_port = Some(parse_ports(v)?);
                }
                ("mode", Some(v)) => {
                    th.record = v.trim_matches('"').eq_ignore_ascii_case("record");
                }
                ("multicast", None) => {
                    return Err(TransportError::Unsupported("multicast".to_string()));
                }
                _ => {}
            }
        }

        match th.lower {
            LowerTransport::Tcp if th.interleaved.is_none() => Err(TransportError::Malformed(
                "TCP transport without interleaved channels".to_string(),
            )),
            LowerTransport::Udp if th.client_port.is_none() => Err(TransportError::Malformed(
                "UDP transport without client_port".to_string(),
            )),
            _ => Ok(th),
        }
    }

    /// Header value echoed to the peer for an interleaved assignment.
    pub fn interleaved_reply(rtp: u8, rtcp: u8, record: bool) -> String {
        let mode = if record { ";mode=record" } else { "" };
        format!("RTP/AVP/TCP;unicast;interleaved={rtp}-{rtcp}{mode}")
    }

    /// Header value returned for a UDP assignment.
    pub fn udp_reply(client: (u16, u16), server: (u16, u16), record: bool) -> String {
        let mode = if record { ";mode=record" } else { "" };
        format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{}{mode}",
            client.0, client.1, server.0, server.1
        )
    }
}

/// `a-b` or `a` (RTCP = a + 1). Values outside 0..=255 are rejected.
fn parse_channels(value: &str) -> Result<(u8, u8), TransportError> {
    let bad = || TransportError::Malformed(format!("interleaved={value}"));
    let channel = |s: &str| s.trim().parse::<u8>().map_err(|_| bad());

    match value.split_once('-') {
        Some((a, b)) => Ok((channel(a)?, channel(b)?)),
        None => {
            let rtp = channel(value)?;
            Ok((rtp, rtp.checked_add(1).ok_or_else(bad)?))
        }
    }
}

fn parse_ports(value: &str) -> Result<(u16, u16), TransportError> {
    let bad = || TransportError::Malformed(format!("client_port={value}"));
    let port = |s: &str| s.trim().parse::<u16>().map_err(|_| bad());

    match value.split_once('-') {
        Some((a, b)) => Ok((port(a)?, port(b)?)),
        None => {
            let rtp = port(value)?;
            Ok((rtp, rtp.checked_add(1).ok_or_else(bad)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_record_mode() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3;mode=\"RECORD\"")
            .unwrap();
        assert!(th.record);
        assert_eq!(th.interleaved, Some((2, 3)));
    }

    #[test]
    fn single_channel_implies_next() {
        let th = TransportHeader::parse("RTP/AVP/TCP;interleaved=4").unwrap();
        assert_eq!(th.interleaved, Some((4, 5)));
    }

    #[test]
    fn negative_or_out_of_range_channels_are_rejected() {
        assert!(matches!(
            TransportHeader::parse("RTP/AVP/TCP;interleaved=-1-0"),
            Err(TransportError::Malformed(_))
        ));
        assert!(matches!(
            TransportHeader::parse("RTP/AVP/TCP;interleaved=256-257"),
            Err(TransportError::Malformed(_))
        ));
        assert!(TransportHeader::parse("RTP/AVP/TCP;interleaved=255").is_err());
    }

    #[test]
    fn first_usable_alternative_wins() {
        let th = TransportHeader::parse(
            "RTP/SAVP;unicast;client_port=1-2,RTP/AVP/TCP;unicast;interleaved=0-1",
        )
        .unwrap();
        assert_eq!(th.lower, LowerTransport::Tcp);
    }

    #[test]
    fn unsupported_profile() {
        assert!(matches!(
            TransportHeader::parse("RTP/SAVP;unicast;client_port=1-2"),
            Err(TransportError::Unsupported(_))
        ));
        assert!(matches!(
            TransportHeader::parse("RTP/AVP;multicast"),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_no_client_port() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_err());
    }

    #[test]
    fn replies_format() {
        assert_eq!(
            TransportHeader::interleaved_reply(0, 1, false),
            "RTP/AVP/TCP;unicast;interleaved=0-1"
        );
        assert_eq!(
            TransportHeader::udp_reply((8000, 8001), (5000, 5001), true),
            "RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001;mode=record"
        );
    }
}
