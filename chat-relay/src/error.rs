use std::io;

use crate::session::SessionId;

/// Failures of a single session. None of them ever reach another session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The peer hung up, or reading from its transport failed.
    ///
    /// `None` is a clean end of stream; `Some` carries the transport error.
    #[error("connection closed")]
    ConnectionClosed(Option<io::Error>),

    /// Writing a line to one recipient failed.
    #[error("failed to push line to session {session}: {source}")]
    PushFailed {
        session: SessionId,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    pub(crate) fn read_failed(err: io::Error) -> Self {
        SessionError::ConnectionClosed(Some(err))
    }

    /// True when the peer closed the stream rather than the transport failing.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, SessionError::ConnectionClosed(None))
    }
}
