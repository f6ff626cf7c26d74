use crate::error::{ParseErrorKind, RtspError};

/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Identification string sent as `Server` in responses and `User-Agent`
/// in client requests (RFC 2326 §12.36, §12.41).
pub const SERVER_AGENT: &str = "rtsp-engine/0.1";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 501 Not Implemented: method unknown to this server.
    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Parse a response head (status line and headers).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();
        let status_line = lines.next().ok_or(RtspError::Parse {
            kind: ParseErrorKind::InvalidStatusLine,
        })?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        let code = parts.next().and_then(|c| c.trim().parse::<u16>().ok());
        let (true, Some(status_code)) = (version.starts_with("RTSP/"), code) else {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidStatusLine,
            });
        };
        let status_text = parts.next().unwrap_or("").trim().to_string();

        Ok(RtspResponse {
            status_code,
            status_text,
            headers: super::parse_headers(lines)?,
            body: None,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        super::find_header(&self.headers, name)
    }

    /// All values of a repeated header (e.g. several `WWW-Authenticate`).
    pub fn get_headers<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Session id from the `Session` header, without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session").map(super::strip_session_params)
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);
        super::write_headers_and_body(&mut response, &self.headers, self.body.as_deref());
        response
    }
}
