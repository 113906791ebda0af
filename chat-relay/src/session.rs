//! One connected client.
//!
//! A connection is split in two on accept. The write half is handed to a
//! per-session writer task fed by a bounded queue, so pushing a line never
//! waits on the client reading it. The read half becomes a [`SessionReader`]
//! owned by the connection's own receive loop, so a broadcaster never waits on
//! a blocked read either.

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::debug;

use crate::{
    error::SessionError,
    protocol::{self, USERNAME_PROMPT},
};

/// Process-unique session identity. Usernames are not unique, ids are.
pub type SessionId = u64;

/// Lines a session may have queued before further pushes to it are dropped.
pub const OUTBOUND_CAPACITY: usize = 256;

/// How long `close` waits for queued lines to reach the client.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    username: OnceLock<String>,
    outbound: Mutex<Option<Outbound>>,
}

struct Outbound {
    queue: mpsc::Sender<String>,
    writer: JoinHandle<()>,
}

/// Read side of a session, owned by its receive loop.
pub struct SessionReader {
    reader: BufReader<BoxedReader>,
    buf: Vec<u8>,
}

impl Session {
    /// Wraps both halves of a connection and starts its writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<R, W>(
        id: SessionId,
        peer: Option<SocketAddr>,
        reader: R,
        writer: W,
    ) -> (Arc<Self>, SessionReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (queue, lines) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = Box::new(writer) as BoxedWriter;
        let writer = tokio::spawn(write_outbound(id, writer, lines));
        let session = Arc::new(Self {
            id,
            peer,
            username: OnceLock::new(),
            outbound: Mutex::new(Some(Outbound { queue, writer })),
        });
        let reader = SessionReader {
            reader: BufReader::new(Box::new(reader) as BoxedReader),
            buf: Vec::new(),
        };
        (session, reader)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The username, once the handshake has read one.
    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Prompts for a username and reads exactly one line as the answer.
    ///
    /// The username is assigned once; a repeated handshake returns the first one.
    pub async fn handshake(&self, reader: &mut SessionReader) -> Result<&str, SessionError> {
        self.push(USERNAME_PROMPT).await.map_err(|err| match err {
            SessionError::PushFailed { source, .. } => SessionError::read_failed(source),
            other => other,
        })?;
        let username = reader.receive_line().await?;
        Ok(self.username.get_or_init(|| username).as_str())
    }

    /// Queues one line for the client without waiting for it to be written.
    ///
    /// Fails if the queue is full because the client stopped reading, or if
    /// the session is closed or its transport broke.
    pub async fn push(&self, line: &str) -> Result<(), SessionError> {
        let guard = self.outbound.lock().await;
        let Some(outbound) = guard.as_ref() else {
            return Err(self.push_failed(io::ErrorKind::NotConnected.into()));
        };
        outbound
            .queue
            .try_send(line.to_string())
            .map_err(|err| match err {
                TrySendError::Full(_) => self.push_failed(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "outbound queue full",
                )),
                TrySendError::Closed(_) => self.push_failed(io::ErrorKind::BrokenPipe.into()),
            })
    }

    /// Flushes queued lines, then shuts down and releases the write half.
    /// Calling it again does nothing.
    pub async fn close(&self) {
        let Some(Outbound { queue, writer }) = self.outbound.lock().await.take() else {
            return;
        };
        drop(queue);
        let abort = writer.abort_handle();
        match timeout(CLOSE_GRACE, writer).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(session = self.id, ?error, "writer task failed"),
            Err(_) => {
                debug!(session = self.id, "client not reading, dropping queued lines");
                abort.abort();
            }
        }
    }

    /// True once the session is closed or its writer task has stopped.
    pub async fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .await
            .as_ref()
            .map_or(true, |outbound| outbound.queue.is_closed())
    }

    fn push_failed(&self, source: io::Error) -> SessionError {
        SessionError::PushFailed {
            session: self.id,
            source,
        }
    }
}

/// Writes queued lines in order until the queue closes or a write fails.
async fn write_outbound(
    id: SessionId,
    mut writer: BoxedWriter,
    mut lines: mpsc::Receiver<String>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(error) = protocol::write_line(&mut writer, &line).await {
            debug!(session = id, ?error, "outbound write failed");
            break;
        }
    }
    lines.close();
    if let Err(error) = writer.shutdown().await {
        debug!(session = id, ?error, "transport shutdown failed");
    }
}

impl SessionReader {
    /// Blocks until the client sends a line.
    pub async fn receive_line(&mut self) -> Result<String, SessionError> {
        match protocol::read_line(&mut self.reader, &mut self.buf).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(SessionError::ConnectionClosed(None)),
            Err(err) => Err(SessionError::read_failed(err)),
        }
    }
}
