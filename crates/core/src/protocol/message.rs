//! Framing of the RTSP byte stream.
//!
//! One TCP stream carries three kinds of units: requests, responses and
//! interleaved binary frames. A frame starts with `$`, which can never
//! begin a request or status line, so one byte of lookahead is enough to
//! tell them apart.

use std::io::{BufRead, Read};

use crate::error::{ParseErrorKind, Result, RtspError};

use super::{RtspRequest, RtspResponse};

/// Largest accepted header block.
const MAX_HEAD_LEN: usize = 64 * 1024;
/// Largest accepted message body (SDP).
const MAX_BODY_LEN: usize = 1024 * 1024;

/// Marker byte of an interleaved frame (RFC 2326 §10.12).
pub const INTERLEAVED_MAGIC: u8 = b'$';

/// A binary packet carried inside the RTSP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

impl InterleavedFrame {
    /// Encode as `$ channel len_hi len_lo payload`.
    pub fn encode(channel: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let len = u16::try_from(payload.len()).map_err(|_| RtspError::FrameTooLarge(payload.len()))?;
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.push(INTERLEAVED_MAGIC);
        buf.push(channel);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }
}

#[derive(Debug)]
pub enum Message {
    Request(RtspRequest),
    Response(RtspResponse),
    Data(InterleavedFrame),
}

/// Read the next unit from `reader`.
///
/// Returns `Ok(None)` on a clean EOF between units. EOF inside a unit is an
/// `UnexpectedEof` I/O error. A malformed head yields
/// [`RtspError::Parse`] after the whole head has been consumed, so the
/// caller can answer it and keep reading. Parse errors whose kind
/// [`is_fatal`](ParseErrorKind::is_fatal) leave the stream position
/// unknown; the connection must be closed after answering.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<Message>> {
    loop {
        let first = match reader.fill_buf()?.first() {
            Some(b) => *b,
            None => return Ok(None),
        };
        match first {
            INTERLEAVED_MAGIC => return read_frame(reader).map(|f| Some(Message::Data(f))),
            b'\r' | b'\n' => reader.consume(1),
            _ => break,
        }
    }

    let head = read_head(reader)?;
    let mut message = if head.starts_with("RTSP/") {
        Message::Response(RtspResponse::parse(&head)?)
    } else {
        Message::Request(RtspRequest::parse(&head)?)
    };

    let content_length = match &message {
        Message::Request(r) => r.get_header("Content-Length"),
        Message::Response(r) => r.get_header("Content-Length"),
        Message::Data(_) => None,
    };
    let content_length = match content_length {
        Some(v) => v.trim().parse::<usize>().map_err(|_| RtspError::Parse {
            kind: ParseErrorKind::InvalidContentLength,
        })?,
        None => 0,
    };
    if content_length > MAX_BODY_LEN {
        return Err(RtspError::Parse {
            kind: ParseErrorKind::BodyTooLarge,
        });
    }

    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;
        let body = String::from_utf8_lossy(&body).into_owned();
        match &mut message {
            Message::Request(r) => r.body = Some(body),
            Message::Response(r) => r.body = Some(body),
            Message::Data(_) => {}
        }
    }

    Ok(Some(message))
}

/// Read header lines up to the blank line, never buffering more than
/// `MAX_HEAD_LEN` bytes. Invalid UTF-8 is reported only once the head has
/// been consumed.
fn read_head<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let limit = (MAX_HEAD_LEN + 1 - start) as u64;
        Read::take(&mut *reader, limit).read_until(b'\n', &mut head)?;

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            if head.len() > MAX_HEAD_LEN {
                return Err(RtspError::Parse {
                    kind: ParseErrorKind::HeaderTooLarge,
                });
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        if line == b"\r\n" || line == b"\n" {
            head.truncate(start);
            break;
        }
    }
    String::from_utf8(head).map_err(|_| RtspError::Parse {
        kind: ParseErrorKind::InvalidRequestLine,
    })
}

fn read_frame<R: BufRead>(reader: &mut R) -> Result<InterleavedFrame> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(InterleavedFrame {
        channel: header[1],
        payload,
    })
}
