use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    broadcaster::Broadcaster,
    error::SessionError,
    protocol::ClientLine,
    registry::Registry,
    session::{Session, SessionId, SessionReader},
};

pub struct Server {
    listener: TcpListener,
    state: Arc<RelayState>,
}

struct RelayState {
    broadcaster: Broadcaster,
    next_id: AtomicU64,
}

impl RelayState {
    fn new() -> Self {
        Self {
            broadcaster: Broadcaster::new(Arc::new(Registry::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.state.broadcaster.registry())
    }

    /// Accepts connections until an accept fails, which ends the server.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`Server::run`], but stops accepting once `shutdown` resolves.
    ///
    /// Sessions that are already connected keep running until their clients
    /// leave.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay stopped accepting connections");
                    break;
                }
                accept_result = listener.accept() => {
                    let (stream, peer) = accept_result.context("failed to accept connection")?;
                    spawn_session(stream, peer, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>) {
    let id = state.next_id();
    let broadcaster = state.broadcaster.clone();
    debug!(session = id, %peer, "connection accepted");

    let (reader, writer) = stream.into_split();
    tokio::spawn(async move {
        serve_connection(id, Some(peer), reader, writer, broadcaster).await;
    });
}

/// Why a session left the relay.
#[derive(Debug)]
pub enum SessionExit {
    /// The stream ended before a username arrived; the session never joined.
    HandshakeAborted(SessionError),
    /// The client sent the disconnect token.
    Disconnected,
    /// The client closed its end of the stream.
    StreamEnded,
    /// Reading from the client failed.
    Failed(SessionError),
}

/// Runs one connection from accept to close.
///
/// The session joins the registry only after its username handshake and is
/// removed again before the closing membership update goes out.
pub async fn serve_connection<R, W>(
    id: SessionId,
    peer: Option<SocketAddr>,
    reader: R,
    writer: W,
    broadcaster: Broadcaster,
) -> SessionExit
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (session, mut inbound) = Session::open(id, peer, reader, writer);

    let username = match session.handshake(&mut inbound).await {
        Ok(username) => username.to_string(),
        Err(err) => {
            debug!(session = id, ?peer, error = %err, "connection closed during handshake");
            session.close().await;
            return SessionExit::HandshakeAborted(err);
        }
    };

    broadcaster.registry().add(Arc::clone(&session)).await;
    info!(session = id, ?peer, %username, "client joined");
    broadcaster.broadcast_membership().await;

    let exit = relay_lines(&session, &mut inbound, &broadcaster, &username).await;

    session.close().await;
    broadcaster.registry().remove(id).await;
    info!(session = id, ?peer, %username, reason = ?exit, "client left");
    broadcaster.broadcast_membership().await;

    exit
}

async fn relay_lines(
    session: &Session,
    inbound: &mut SessionReader,
    broadcaster: &Broadcaster,
    username: &str,
) -> SessionExit {
    loop {
        let line = match inbound.receive_line().await {
            Ok(line) => line,
            Err(err) if err.is_end_of_stream() => return SessionExit::StreamEnded,
            Err(err) => return SessionExit::Failed(err),
        };

        match ClientLine::parse(&line) {
            ClientLine::Disconnect => return SessionExit::Disconnected,
            ClientLine::Chat(body) => {
                debug!(session = session.id(), %username, body, "relaying line");
                broadcaster.broadcast(session, username, body).await;
            }
        }
    }
}
