use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Mutex, Notify};
use tokio::time;

use crate::error::RelayError;

/// Process-unique identifier for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Hand out the next id. Ids are never reused within a process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Set once a write to the connection failed or was cut short. The stream
/// may then hold a partial line, so nothing more is written to it.
#[derive(Default)]
struct WriteHealth {
    broken: AtomicBool,
    notify: Notify,
}

/// Write side of a connection. Cloning is cheap (Arc + id).
///
/// The Registry keeps one of these per entry; the owning session keeps the
/// read side. Writers are serialized by the inner mutex so a broadcast and the
/// session's own notices never interleave bytes.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Arc<str>,
    writer: Arc<Mutex<BoxedWriter>>,
    health: Arc<WriteHealth>,
}

impl ConnectionHandle {
    pub fn new<W>(id: ConnectionId, peer: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer: Arc::from(peer.into()),
            writer: Arc::new(Mutex::new(Box::new(writer))),
            health: Arc::new(WriteHealth::default()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_broken(&self) -> bool {
        self.health.broken.load(Ordering::Acquire)
    }

    fn mark_broken(&self) {
        if !self.health.broken.swap(true, Ordering::AcqRel) {
            self.health.notify.notify_waiters();
        }
    }

    /// Resolves once a write to this connection has failed.
    pub async fn broken(&self) {
        loop {
            let notified = self.health.notify.notified();
            if self.is_broken() {
                return;
            }
            notified.await;
        }
    }

    /// Write raw bytes and flush. Fails fast once the connection is broken,
    /// and any error marks it broken.
    pub async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        if self.is_broken() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection marked broken"));
        }
        let mut w = self.writer.lock().await;
        let result = match w.write_all(bytes).await {
            Ok(()) => w.flush().await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.mark_broken();
        }
        result
    }

    /// `write_all` bounded by `timeout`. A write cut short by the timeout may
    /// have left part of the bytes on the stream, so it marks the connection
    /// broken too.
    pub async fn write_timed(&self, bytes: &[u8], timeout: Duration) -> io::Result<()> {
        match time::timeout(timeout, self.write_all(bytes)).await {
            Ok(result) => result,
            Err(_) => {
                self.mark_broken();
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
            }
        }
    }

    /// Write `line` followed by exactly one `\n`, within `timeout`.
    pub async fn send_line(&self, line: &str, timeout: Duration) -> io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.trim_end_matches('\n').as_bytes());
        buf.push(b'\n');
        self.write_timed(&buf, timeout).await
    }

    /// Shut down the write side. Errors are ignored: the peer may already be gone.
    pub async fn close(&self) {
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// One client's session: the buffered read side plus its write handle.
///
/// Inbound data is framed as `\n`-terminated lines of at most
/// `max_line_bytes` bytes (a trailing `\r` is dropped).
pub struct Connection<R> {
    handle: ConnectionHandle,
    reader: BufReader<R>,
    max_line_bytes: usize,
    buf: Vec<u8>,
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new<W>(reader: R, writer: W, peer: impl Into<String>, max_line_bytes: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            handle: ConnectionHandle::new(ConnectionId::next(), peer, writer),
            reader: BufReader::new(reader),
            max_line_bytes,
            buf: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Read the next full line.
    ///
    /// `Ok(None)` means end of stream. Bytes after the last `\n` at end of
    /// stream are not a full line and are discarded. Invalid UTF-8 is
    /// replaced rather than rejected.
    ///
    /// Cancel safe: if the future is dropped mid-line, the bytes read so far
    /// are kept and the next call continues the same line.
    pub async fn read_line(&mut self) -> Result<Option<String>, RelayError> {
        // Room for the payload plus "\r\n"
        let frame_limit = self.max_line_bytes as u64 + 2;
        let remaining = frame_limit.saturating_sub(self.buf.len() as u64);

        (&mut self.reader)
            .take(remaining)
            .read_until(b'\n', &mut self.buf)
            .await?;

        if self.buf.last() != Some(&b'\n') {
            let too_long = self.buf.len() as u64 >= frame_limit;
            self.buf.clear();
            if too_long {
                return Err(RelayError::LineTooLong { max: self.max_line_bytes });
            }
            // Underlying stream hit EOF before a newline
            return Ok(None);
        }

        self.buf.pop();
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        if self.buf.len() > self.max_line_bytes {
            self.buf.clear();
            return Err(RelayError::LineTooLong { max: self.max_line_bytes });
        }

        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

impl Connection<OwnedReadHalf> {
    /// Wrap an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream, addr: SocketAddr, max_line_bytes: usize) -> Self {
        // Small chat lines should go out immediately; failure here is harmless
        let _ = stream.set_nodelay(true);
        let (reader_half, writer_half) = stream.into_split();
        Self::new(reader_half, writer_half, addr.to_string(), max_line_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex, split};

    const WRITE: Duration = Duration::from_secs(1);

    fn pair(max: usize) -> (Connection<tokio::io::ReadHalf<tokio::io::DuplexStream>>, tokio::io::DuplexStream) {
        let (server, client) = duplex(1024);
        let (r, w) = split(server);
        (Connection::new(r, w, "test", max), client)
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn reads_lines_and_strips_crlf() {
        let (mut conn, mut client) = pair(64);
        client.write_all(b"alice\r\nhello there\n").await.unwrap();

        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("alice"));
        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn two_messages_in_one_write_are_split() {
        let (mut conn, mut client) = pair(64);
        client.write_all(b"one\ntwo\n").await.unwrap();
        drop(client);

        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(conn.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_discarded() {
        let (mut conn, mut client) = pair(64);
        client.write_all(b"bob").await.unwrap();
        drop(client);

        assert_eq!(conn.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn line_at_limit_is_accepted() {
        let (mut conn, mut client) = pair(4);
        client.write_all(b"abcd\r\n").await.unwrap();

        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let (mut conn, mut client) = pair(4);
        client.write_all(b"abcdefgh\n").await.unwrap();

        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, RelayError::LineTooLong { max: 4 }));
    }

    #[tokio::test]
    async fn send_line_appends_single_newline() {
        let (conn, mut client) = pair(64);
        conn.handle().send_line("bob: hi", WRITE).await.unwrap();
        conn.handle().send_line("already\n", WRITE).await.unwrap();

        let mut buf = vec![0u8; 17];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut buf).await.unwrap();
        assert_eq!(&buf, b"bob: hi\nalready\n");
    }

    #[tokio::test]
    async fn timed_out_write_breaks_the_connection() {
        let (server, mut client) = duplex(8);
        let handle = ConnectionHandle::new(ConnectionId::next(), "slow", server);

        let err = handle
            .write_timed(b"alice: a long first message\n", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(handle.is_broken());

        // Drain the fragment that made it into the pipe
        let mut fragment = [0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut fragment).await.unwrap();
        assert_eq!(&fragment, b"alice: a");

        // Later lines are refused instead of being glued onto the fragment
        let err = handle.send_line("bob: hi", WRITE).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let mut more = [0u8; 1];
        let read = time::timeout(
            Duration::from_millis(50),
            tokio::io::AsyncReadExt::read(&mut client, &mut more),
        )
        .await;
        assert!(read.is_err(), "nothing should follow the fragment");
    }

    #[tokio::test]
    async fn broken_resolves_after_failed_write() {
        let (server, client) = duplex(8);
        let handle = ConnectionHandle::new(ConnectionId::next(), "gone", server);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.broken().await })
        };

        drop(client);
        assert!(handle.send_line("hello", WRITE).await.is_err());
        time::timeout(WRITE, waiter).await.unwrap().unwrap();
    }
}
