//! Monitoring documents for an embedding HTTP server.
//!
//! - [`run_feed`]: a Server-Sent-Events stream, one `data:` record per
//!   interval carrying the JSON array of live sessions.
//! - [`PullStatus`]: the JSON answer of an on-demand pull,
//!   `{"code":0}` or `{"code":1,"msg":"..."}`.

use std::io::Write;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::session::{Role, SessionRegistry, SessionState};

/// Public view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub role: Role,
    pub state: SessionState,
    pub url: String,
    pub stream_path: String,
    pub sdp: String,
    pub agent: String,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// Snapshot of every registered session, ordered by id.
pub fn snapshot(registry: &SessionRegistry) -> Vec<SessionInfo> {
    let mut infos: Vec<SessionInfo> = registry
        .sessions()
        .into_iter()
        .map(|s| {
            let details = s.details();
            let traffic = s.writer.traffic();
            SessionInfo {
                id: s.id.clone(),
                role: s.role.clone(),
                state: s.state(),
                url: details.url,
                stream_path: details.stream_path,
                sdp: details.sdp,
                agent: details.agent,
                in_bytes: traffic.received(),
                out_bytes: traffic.sent(),
            }
        })
        .collect();
    infos.sort_by(|a, b| a.id.cmp(&b.id));
    infos
}

pub fn snapshot_json(registry: &SessionRegistry) -> Result<String> {
    Ok(serde_json::to_string(&snapshot(registry))?)
}

/// Write one SSE record per `interval` to `out` until a write fails.
///
/// Only returns with the error that ended the feed.
pub fn run_feed<W: Write>(registry: &SessionRegistry, mut out: W, interval: Duration) -> Result<()> {
    loop {
        let json = snapshot_json(registry)?;
        write!(out, "data: {json}\n\n")?;
        out.flush()?;
        thread::sleep(interval);
    }
}

/// Outcome of an on-demand pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullStatus {
    pub code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl PullStatus {
    pub fn ok() -> Self {
        Self { code: 0, msg: None }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            code: 1,
            msg: Some(msg.into()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T> From<Result<T>> for PullStatus {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtspError;
    use std::io;

    #[test]
    fn pull_status_json() {
        assert_eq!(PullStatus::ok().to_json().unwrap(), r#"{"code":0}"#);
        let failed: PullStatus = Result::<()>::Err(RtspError::StreamNotFound("cam1".into())).into();
        assert_eq!(
            failed.to_json().unwrap(),
            r#"{"code":1,"msg":"stream not found: cam1"}"#
        );
    }

    struct FailAfter {
        written: Vec<u8>,
        records_left: usize,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.records_left == 0 {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.records_left = self.records_left.saturating_sub(1);
            Ok(())
        }
    }

    #[test]
    fn feed_writes_records_until_the_writer_fails() {
        let registry = SessionRegistry::new();
        let mut sink = FailAfter {
            written: Vec::new(),
            records_left: 2,
        };
        let result = run_feed(&registry, &mut sink, Duration::from_millis(1));
        assert!(matches!(result, Err(RtspError::Io(_))));
        assert_eq!(
            String::from_utf8(sink.written).unwrap(),
            "data: []\n\ndata: []\n\n"
        );
    }
}
