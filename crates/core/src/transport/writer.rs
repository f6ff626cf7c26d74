use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::protocol::{InterleavedFrame, RtspRequest, RtspResponse};

use super::deadline::{DeadlineStream, Traffic};

/// The single write path of a connection.
///
/// Responses, client requests and interleaved media frames from any
/// thread go through one mutex, and each unit is written with one
/// `write_all` under it, so units never interleave on the wire.
#[derive(Debug)]
pub struct SessionWriter {
    stream: Mutex<DeadlineStream>,
    traffic: Arc<Traffic>,
}

impl SessionWriter {
    pub fn new(stream: DeadlineStream) -> Self {
        let traffic = stream.traffic().clone();
        Self {
            stream: Mutex::new(stream),
            traffic,
        }
    }

    pub fn traffic(&self) -> &Arc<Traffic> {
        &self.traffic
    }

    pub fn write_response(&self, response: &RtspResponse) -> Result<()> {
        self.write_bytes(response.serialize().as_bytes())
    }

    pub fn write_request(&self, request: &RtspRequest) -> Result<()> {
        self.write_bytes(request.serialize().as_bytes())
    }

    pub fn write_frame(&self, channel: u8, payload: &[u8]) -> Result<()> {
        let frame = InterleavedFrame::encode(channel, payload)?;
        self.write_bytes(&frame)
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Shut the socket down in both directions.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.lock().shutdown() {
            tracing::trace!(error = %e, "socket shutdown");
        }
    }
}
