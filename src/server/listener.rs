//! TCP listener and accept loop.
//!
//! The accept loop runs on its own task and hands every accepted connection
//! to a freshly spawned handler task, then goes straight back to accepting.
//! A slow or silent client therefore never holds up the loop or any other
//! connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{AcceptErrorPolicy, Config, ConfigError, HandoffMode};
use crate::server::handler::{handle_connection, ConnectionId, HandlerSettings};
use crate::server::ready::ReadySignal;

/// Pause after a failed accept before trying again, so persistent errors
/// such as fd exhaustion do not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A bound listening socket plus the policy for serving it.
pub struct Listener {
    inner: TcpListener,
    settings: Arc<HandlerSettings>,
    accept_errors: AcceptErrorPolicy,
    handoff: HandoffMode,
    shutdown_grace: Duration,
    ready: Arc<ReadySignal>,
    next_id: u64,
}

impl Listener {
    /// Bind `addr` and start listening with the given backlog.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind { addr, source };

        let std_listener = create_listener(addr, backlog).map_err(bind_err)?;
        let inner = TcpListener::from_std(std_listener).map_err(bind_err)?;
        let local_addr = inner.local_addr().map_err(bind_err)?;

        info!(address = %local_addr, backlog, "Server listening");

        Ok(Self {
            inner,
            settings: Arc::new(HandlerSettings::default()),
            accept_errors: AcceptErrorPolicy::default(),
            handoff: HandoffMode::default(),
            shutdown_grace: Duration::from_secs(5),
            ready: Arc::new(ReadySignal::new()),
            next_id: 0,
        })
    }

    /// Bind and configure a listener from resolved configuration.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let listener = Self::bind(config.socket_addr()?, config.backlog)?
            .with_settings(HandlerSettings::from(config))
            .with_accept_errors(config.accept_errors)
            .with_handoff(config.handoff)
            .with_shutdown_grace(config.shutdown_grace);
        Ok(listener)
    }

    pub fn with_settings(mut self, settings: HandlerSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_accept_errors(mut self, policy: AcceptErrorPolicy) -> Self {
        self.accept_errors = policy;
        self
    }

    pub fn with_handoff(mut self, handoff: HandoffMode) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept connections forever.
    ///
    /// Returns only when accepting fails under [`AcceptErrorPolicy::Fatal`].
    pub async fn accept_loop(self) -> Result<(), ServerError> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// After shutdown, in-flight connections get the grace period to finish
    /// and are aborted afterwards.
    pub async fn serve_until<F>(mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break Ok(());
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection handler panicked");
                        }
                    }
                }

                accepted = self.inner.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(&mut tasks, stream, peer).await,
                    Err(e) => {
                        if let Err(fatal) = self.on_accept_error(e).await {
                            break Err(fatal);
                        }
                    }
                },
            }
        };

        self.drain(tasks).await;
        result
    }

    /// Apply the accept-error policy. An `Err` stops the accept loop.
    async fn on_accept_error(&self, e: io::Error) -> Result<(), ServerError> {
        match self.accept_errors {
            AcceptErrorPolicy::Fatal => Err(ServerError::Accept(e)),
            AcceptErrorPolicy::Continue => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                Ok(())
            }
        }
    }

    /// Spawn a handler task for an accepted connection.
    async fn dispatch(&mut self, tasks: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        debug!(conn_id = %id, peer = %peer, "New connection");

        let settings = Arc::clone(&self.settings);

        match self.handoff {
            HandoffMode::Immediate => {
                tasks.spawn(handle_connection(stream, id, peer, settings));
            }
            HandoffMode::Confirmed => {
                self.ready.reset();
                let ready = Arc::clone(&self.ready);
                tasks.spawn(async move {
                    ready.signal();
                    handle_connection(stream, id, peer, settings).await;
                });
                self.ready.wait().await;
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        info!(in_flight = tasks.len(), "Waiting for in-flight connections");
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = tasks.len(), "Grace period elapsed, aborting connections");
            tasks.shutdown().await;
        }
    }
}

/// Create a non-blocking listening socket with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let backlog = i32::try_from(backlog)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Start serving `listener` until the returned sender fires.
    fn spawn_server(
        listener: Listener,
    ) -> (
        SocketAddr,
        oneshot::Sender<()>,
        JoinHandle<Result<(), ServerError>>,
    ) {
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(listener.serve_until(async move {
            let _ = rx.await;
        }));
        (addr, tx, handle)
    }

    async fn round_trip(addr: SocketAddr, message: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(message).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_hello_from_client() {
        let (addr, tx, server) = spawn_server(Listener::bind(loopback(), 2).unwrap());

        let reply = tokio::time::timeout(TEST_TIMEOUT, round_trip(addr, b"Hello from Client<EOF>"))
            .await
            .unwrap();
        assert_eq!(reply, b"Hello from Server");

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_chunked_message() {
        let listener = Listener::bind(loopback(), 2).unwrap().with_settings(HandlerSettings {
            recv_buffer_size: 3,
            ..HandlerSettings::default()
        });
        let (addr, tx, server) = spawn_server(listener);

        let mut client = TcpStream::connect(addr).await.unwrap();
        for piece in [&b"Hi Cli"[..], b"ent, bye Cl", b"ient<E", b"OF>"] {
            client.write_all(piece).await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut reply = Vec::new();
        tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"Hi Server, bye Server");

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_clients_no_crosstalk() {
        // Large backlog so simultaneous connects are not dropped while queued.
        let (addr, tx, server) = spawn_server(Listener::bind(loopback(), 128).unwrap());

        let clients: Vec<_> = (0..50)
            .map(|i| {
                tokio::spawn(async move {
                    let message = format!("Client number {i}<EOF>");
                    let reply = round_trip(addr, message.as_bytes()).await;
                    (i, String::from_utf8(reply).unwrap())
                })
            })
            .collect();

        for client in clients {
            let (i, reply) = tokio::time::timeout(TEST_TIMEOUT, client)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply, format!("Server number {i}"));
        }

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_others() {
        let (addr, tx, server) = spawn_server(Listener::bind(loopback(), 2).unwrap());

        // Holds its connection open without ever sending the marker.
        let mut silent = TcpStream::connect(addr).await.unwrap();
        silent.write_all(b"still typing").await.unwrap();

        let reply = tokio::time::timeout(TEST_TIMEOUT, round_trip(addr, b"Client<EOF>"))
            .await
            .unwrap();
        assert_eq!(reply, b"Server");

        drop(silent);
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_premature_close_gets_no_reply() {
        let (addr, tx, server) = spawn_server(Listener::bind(loopback(), 2).unwrap());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"no marker here").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());

        // The server keeps serving afterwards.
        let reply = tokio::time::timeout(TEST_TIMEOUT, round_trip(addr, b"next Client<EOF>"))
            .await
            .unwrap();
        assert_eq!(reply, b"next Server");

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_closed_without_reply() {
        let listener = Listener::bind(loopback(), 2).unwrap().with_settings(HandlerSettings {
            max_frame_size: 16,
            ..HandlerSettings::default()
        });
        let (addr, tx, server) = spawn_server(listener);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[b'x'; 64]).await.unwrap();

        // The server may reset rather than close, so only the reply matters.
        let mut reply = Vec::new();
        let _ = tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap();
        assert!(reply.is_empty());

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connections_beyond_backlog_are_queued() {
        let listener = Listener::bind(loopback(), 2).unwrap();
        let addr = listener.local_addr().unwrap();

        // Nothing is accepting yet. Two more than the backlog still connect;
        // the kernel queues or retries the extra handshakes.
        let mut clients = Vec::new();
        for i in 0..4 {
            let mut client = tokio::time::timeout(TEST_TIMEOUT, TcpStream::connect(addr))
                .await
                .unwrap()
                .unwrap();
            client
                .write_all(format!("c{i} Client<EOF>").as_bytes())
                .await
                .unwrap();
            clients.push(client);
        }

        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.serve_until(async move {
            let _ = rx.await;
        }));

        for (i, client) in clients.iter_mut().enumerate() {
            let mut reply = Vec::new();
            tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply, format!("c{i} Server").into_bytes());
        }

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accept_loop_serves_until_aborted() {
        let listener = Listener::bind(loopback(), 2).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(listener.accept_loop());

        let reply = tokio::time::timeout(TEST_TIMEOUT, round_trip(addr, b"loop Client<EOF>"))
            .await
            .unwrap();
        assert_eq!(reply, b"loop Server");

        // Runs forever without a shutdown future.
        assert!(!server.is_finished());
        server.abort();
    }

    #[tokio::test]
    async fn test_fatal_accept_error_stops_loop() {
        let listener = Listener::bind(loopback(), 2)
            .unwrap()
            .with_accept_errors(AcceptErrorPolicy::Fatal);

        let err = listener
            .on_accept_error(io::Error::new(io::ErrorKind::Other, "too many open files"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Accept(ref e) if e.to_string() == "too many open files"));
    }

    #[tokio::test]
    async fn test_continue_accept_error_keeps_serving() {
        let listener = Listener::bind(loopback(), 2)
            .unwrap()
            .with_accept_errors(AcceptErrorPolicy::Continue);

        listener
            .on_accept_error(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted"))
            .await
            .unwrap();

        // The same listener still serves afterwards.
        let (addr, tx, server) = spawn_server(listener);
        let reply = tokio::time::timeout(TEST_TIMEOUT, round_trip(addr, b"after Client<EOF>"))
            .await
            .unwrap();
        assert_eq!(reply, b"after Server");

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_confirmed_handoff() {
        let listener = Listener::bind(loopback(), 128)
            .unwrap()
            .with_handoff(HandoffMode::Confirmed);
        let (addr, tx, server) = spawn_server(listener);

        let clients: Vec<_> = (0..10)
            .map(|i| {
                tokio::spawn(async move {
                    let message = format!("Client {i}<EOF>");
                    (i, round_trip(addr, message.as_bytes()).await)
                })
            })
            .collect();

        for client in clients {
            let (i, reply) = tokio::time::timeout(TEST_TIMEOUT, client)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply, format!("Server {i}").into_bytes());
        }

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_idle_connections_after_grace() {
        let listener = Listener::bind(loopback(), 2)
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(50));
        let (addr, tx, server) = spawn_server(listener);

        let mut idle = TcpStream::connect(addr).await.unwrap();
        idle.write_all(b"waiting").await.unwrap();
        // Let the accept loop pick the connection up.
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send(()).unwrap();
        tokio::time::timeout(TEST_TIMEOUT, server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();

        // The aborted handler released its socket.
        let mut reply = Vec::new();
        let _ = tokio::time::timeout(TEST_TIMEOUT, idle.read_to_end(&mut reply))
            .await
            .unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_bind_in_use_fails() {
        let first = Listener::bind(loopback(), 2).unwrap();
        let addr = first.local_addr().unwrap();

        let err = Listener::bind(addr, 2).err().expect("second bind should fail");
        assert!(matches!(err, ServerError::Bind { addr: a, .. } if a == addr));
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = Config {
            port: 0,
            backlog: 4,
            ..Config::default()
        };
        let listener = Listener::from_config(&config).unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
        assert_eq!(listener.settings.recv_buffer_size, 1024);
    }
}
