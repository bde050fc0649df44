//! Per-connection handler.
//!
//! A handler owns exactly one accepted connection and walks it through
//! `Accepted → Receiving → Replying → Closed`. Any failure along the way
//! lands in `Failed`, which drops the socket without further I/O. Handlers
//! never share mutable state with each other.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::protocol::{FrameAccumulator, FrameError};

/// Identifier assigned to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Handed over by the listener; nothing read yet.
    Accepted,
    /// Reading until the marker arrives.
    Receiving,
    /// Sending the reply.
    Replying,
    /// Reply sent and socket shut down.
    Closed,
    /// Abandoned after an error; no reply was (fully) sent.
    Failed,
}

/// Errors that end a connection in [`HandlerState::Failed`].
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("peer closed the connection after {received} bytes without sending the marker")]
    PrematureClose { received: usize },
    #[error("connection idle for longer than {0:?}")]
    IdleTimeout(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Tuning knobs shared by every handler spawned from one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSettings {
    /// Bytes requested per receive.
    pub recv_buffer_size: usize,
    /// Largest accepted frame, marker included.
    pub max_frame_size: usize,
    /// Deadline for each receive, and for the send plus shutdown.
    pub idle_timeout: Option<Duration>,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HandlerSettings {
    fn from(config: &Config) -> Self {
        Self {
            recv_buffer_size: config.recv_buffer_size,
            max_frame_size: config.max_frame_size,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Summary of a connection that reached [`HandlerState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub bytes_received: usize,
    /// Confirmed bytes written before shutdown.
    pub bytes_sent: usize,
    /// Bytes that followed the first marker and were dropped.
    pub trailing_bytes: usize,
}

/// State machine for a single connection.
pub struct ConnectionHandler<S> {
    id: ConnectionId,
    stream: Option<S>,
    state: HandlerState,
    frame: FrameAccumulator,
    recv_buf: Vec<u8>,
    idle_timeout: Option<Duration>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: ConnectionId, stream: S, settings: &HandlerSettings) -> Self {
        Self {
            id,
            stream: Some(stream),
            state: HandlerState::Accepted,
            frame: FrameAccumulator::new(settings.max_frame_size),
            recv_buf: vec![0u8; settings.recv_buffer_size.max(1)],
            idle_timeout: settings.idle_timeout,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Drive the connection to completion.
    ///
    /// The stream is released before this returns, on success and on
    /// failure alike. A handler runs once; a second call fails with
    /// `NotConnected`.
    pub async fn run(&mut self) -> Result<HandlerOutcome, HandlerError> {
        let Some(mut stream) = self.stream.take() else {
            return Err(HandlerError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already released",
            )));
        };

        let result = self.drive(&mut stream).await;
        drop(stream);

        match result {
            Ok(_) => self.transition(HandlerState::Closed),
            Err(_) => self.transition(HandlerState::Failed),
        }
        result
    }

    async fn drive(&mut self, stream: &mut S) -> Result<HandlerOutcome, HandlerError> {
        self.transition(HandlerState::Receiving);

        let mut received = 0;
        while !self.frame.is_complete() {
            let n = with_deadline(self.idle_timeout, stream.read(&mut self.recv_buf)).await?;
            if n == 0 {
                return Err(HandlerError::PrematureClose { received });
            }
            received += n;
            trace!(conn_id = %self.id, bytes = n, buffered = self.frame.len(), "Received chunk");
            self.frame.append(&self.recv_buf[..n])?;
        }

        self.transition(HandlerState::Replying);

        let reply = self.frame.extract_content()?;
        let trailing_bytes = self.frame.trailing_len();
        if trailing_bytes > 0 {
            debug!(conn_id = %self.id, trailing_bytes, "Discarding bytes after marker");
        }
        debug!(conn_id = %self.id, bytes = received, "Frame complete");
        trace!(conn_id = %self.id, data = %reply, "Reply");

        // Content is ASCII-decoded on receipt, so the reply is single-byte text.
        let payload = reply.into_bytes();
        with_deadline(self.idle_timeout, async {
            stream.write_all(&payload).await?;
            stream.shutdown().await
        })
        .await?;

        Ok(HandlerOutcome {
            bytes_received: received,
            bytes_sent: payload.len(),
            trailing_bytes,
        })
    }

    fn transition(&mut self, next: HandlerState) {
        trace!(conn_id = %self.id, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }
}

/// Run a handler for an accepted connection and log how it ended.
pub async fn handle_connection<S>(
    stream: S,
    id: ConnectionId,
    peer: SocketAddr,
    settings: Arc<HandlerSettings>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handler = ConnectionHandler::new(id, stream, &settings);

    match handler.run().await {
        Ok(outcome) => {
            debug!(
                conn_id = %id,
                peer = %peer,
                bytes_received = outcome.bytes_received,
                bytes_sent = outcome.bytes_sent,
                "Sent reply, connection closed"
            );
        }
        Err(e @ (HandlerError::Frame(_) | HandlerError::IdleTimeout(_))) => {
            warn!(conn_id = %id, peer = %peer, error = %e, "Connection abandoned");
        }
        Err(e) => {
            debug!(conn_id = %id, peer = %peer, error = %e, "Connection error");
        }
    }
}

async fn with_deadline<T, F>(limit: Option<Duration>, fut: F) -> Result<T, HandlerError>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| HandlerError::IdleTimeout(limit))?
            .map_err(HandlerError::from),
        None => fut.await.map_err(HandlerError::from),
    }
}
