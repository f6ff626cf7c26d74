use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Byte counters shared by every handle of one connection.
#[derive(Debug, Default)]
pub struct Traffic {
    received: AtomicU64,
    sent: AtomicU64,
}

impl Traffic {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn add_received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// A `TcpStream` that re-arms its deadline before every read and write.
///
/// A stalled peer makes the pending call fail with `WouldBlock`/`TimedOut`
/// after at most one timeout interval. `None` disables deadlines. The
/// wrapper does not serialize callers; see
/// [`SessionWriter`](super::SessionWriter).
#[derive(Debug)]
pub struct DeadlineStream {
    stream: TcpStream,
    timeout: Option<Duration>,
    traffic: Arc<Traffic>,
}

impl DeadlineStream {
    pub fn new(stream: TcpStream, timeout: Option<Duration>) -> Self {
        Self {
            stream,
            timeout,
            traffic: Arc::new(Traffic::default()),
        }
    }

    /// Second handle on the same socket, sharing deadline and counters.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            timeout: self.timeout,
            traffic: self.traffic.clone(),
        })
    }

    pub fn traffic(&self) -> &Arc<Traffic> {
        &self.traffic
    }

    /// Close both directions; blocked readers on any handle return.
    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.set_read_timeout(self.timeout)?;
        let n = self.stream.read(buf)?;
        self.traffic.add_received(n);
        Ok(n)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.set_write_timeout(self.timeout)?;
        let n = self.stream.write(buf)?;
        self.traffic.add_sent(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn stalled_peer_times_out() {
        let (_client, server) = pair();
        let mut stream = DeadlineStream::new(server, Some(Duration::from_millis(100)));

        let start = Instant::now();
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn counts_bytes_across_clones() {
        let (mut client, server) = pair();
        let mut reader = DeadlineStream::new(server, None);
        let mut writer = reader.try_clone().unwrap();

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        writer.write_all(b"abc").unwrap();

        assert_eq!(reader.traffic().received(), 5);
        assert_eq!(reader.traffic().sent(), 3);
    }
}
