//! One connected client.
//!
//! A [`Session`] owns both halves of its transport. The read half is only ever
//! driven by the session's own read loop, while the write half is shared with
//! every broadcast that targets the session; the two halves sit behind
//! separate locks so a pending read never holds up a write.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        OnceLock,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::debug;

use crate::error::SessionError;

pub type SessionId = u64;

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest line a client may send, terminator excluded.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Connection state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    name: OnceLock<String>,
    state: AtomicU8,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
    write_timeout: Duration,
    max_line_len: usize,
}

impl Session {
    pub fn new<R, W>(id: SessionId, reader: R, writer: W, write_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let (closed, _) = watch::channel(false);
        Self {
            id,
            peer: None,
            name: OnceLock::new(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            reader: Mutex::new(Some(BufReader::new(reader))),
            writer: Mutex::new(Some(writer)),
            closed,
            write_timeout,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    /// Caps the length of every line read from this session, the name included.
    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len;
        self
    }

    pub fn from_tcp(id: SessionId, stream: TcpStream, write_timeout: Duration) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let mut session = Self::new(id, reader, writer, write_timeout);
        session.peer = peer;
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The display name, once the handshake has completed.
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub(crate) fn label(&self) -> &str {
        self.name().unwrap_or("unknown")
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// `Connecting -> Active`. Fails for a session that is already active or closed.
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn retire(&self) {
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Reads the client's name: exactly one line, non-empty after trimming.
    pub async fn handshake(&self, limit: Duration) -> Result<&str, SessionError> {
        if self.name.get().is_some() {
            return Err(SessionError::handshake("name already set"));
        }

        let line = match timeout(limit, self.next_line()).await {
            Err(_) => {
                return Err(SessionError::handshake(format!(
                    "no name received within {limit:?}"
                )));
            }
            Ok(Err(SessionError::EndOfStream)) => {
                return Err(SessionError::handshake(
                    "connection closed before a name was sent",
                ));
            }
            Ok(Err(err)) => return Err(SessionError::handshake(err.to_string())),
            Ok(Ok(line)) => line,
        };

        let name = line.trim();
        if name.is_empty() {
            return Err(SessionError::handshake("name must not be empty"));
        }

        self.name
            .set(name.to_string())
            .map_err(|_| SessionError::handshake("name already set"))?;
        Ok(self.label())
    }

    /// Next chat line with its terminator removed.
    pub async fn read_line(&self) -> Result<String, SessionError> {
        self.next_line().await
    }

    async fn next_line(&self) -> Result<String, SessionError> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(SessionError::Closed);
        };

        select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => {
                guard.take();
                Err(SessionError::Closed)
            }
            read = read_bounded_line(reader, self.max_line_len) => {
                read?.ok_or(SessionError::EndOfStream)
            }
        }
    }

    /// Sends `text` plus a newline. Writes are serialized per session and
    /// bounded by the configured write timeout.
    pub async fn write_line(&self, text: &str) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(SessionError::Closed);
        };

        let mut frame = String::with_capacity(text.len() + 1);
        frame.push_str(text);
        frame.push('\n');

        let write = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        };
        match timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::Connection(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }

    /// Closes the session. Returns `true` only for the call that released the
    /// transport; later calls are no-ops.
    pub async fn close(&self) -> bool {
        self.retire();
        self.closed.send_replace(true);

        // A read in flight drops the read half itself once it sees the signal.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        let Some(mut writer) = self.writer.lock().await.take() else {
            return false;
        };
        match timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(session = self.id, error = ?err, "transport shutdown failed"),
            Err(_) => debug!(session = self.id, "transport shutdown timed out"),
        }
        debug!(session = self.id, "session closed");
        true
    }
}

/// Reads through the next `\n`, decoding invalid UTF-8 lossily. `None` at end
/// of stream; `InvalidData` once a line outgrows `max` bytes.
async fn read_bounded_line(reader: &mut BoxedReader, max: usize) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    // Room for the longest accepted line plus a CRLF terminator.
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(2);
    if reader.take(limit).read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }

    let content = buf
        .iter()
        .rposition(|byte| !matches!(byte, b'\n' | b'\r'))
        .map_or(0, |last| last + 1);
    if content > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {max} bytes"),
        ));
    }

    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
