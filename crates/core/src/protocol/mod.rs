//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: parsing and
//! building requests and responses, splitting interleaved binary frames
//! off the same byte stream, authenticating peers, parsing SDP and running
//! the server-side method state machine.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! On a connection using interleaved transport (RFC 2326 §10.12), binary
//! frames `$ <channel:u8> <length:u16> <payload>` appear between messages.
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | ANNOUNCE | §10.3 | Publish an SDP session description |
//! | SETUP | §10.4 | Negotiate transport per track |
//! | PLAY | §10.5 | Start media delivery |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keepalive |
//! | SET_PARAMETER | §10.9 | Keepalive |
//! | RECORD | §10.11 | Start receiving published media |

pub mod auth;
pub mod handler;
pub mod message;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use message::{InterleavedFrame, Message, read_message};
pub use request::RtspRequest;
pub use response::RtspResponse;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Parse `Name: value` lines up to the first blank line.
fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();

    for line in lines {
        if line.is_empty() {
            break;
        }

        let colon_pos = line.find(':').ok_or(RtspError::Parse {
            kind: ParseErrorKind::InvalidHeader,
        })?;

        let name = line[..colon_pos].trim().to_string();
        let value = line[colon_pos + 1..].trim().to_string();

        headers.push((name, value));
    }

    Ok(headers)
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// `"SESSIONID;timeout=60"` → `"SESSIONID"`
fn strip_session_params(value: &str) -> &str {
    value.split(';').next().unwrap_or(value).trim()
}

fn write_headers_and_body(out: &mut String, headers: &[(String, String)], body: Option<&str>) {
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }

    if let Some(body) = body {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
        out.push_str("\r\n");
        out.push_str(body);
    } else {
        out.push_str("\r\n");
    }
}
