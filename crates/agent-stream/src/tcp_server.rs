//! TCP stream tunnel endpoint
//!
//! Each connection carries one header naming a destination, then raw bytes
//! relayed in both directions until either side finishes.

use crate::common::{read_header, HANDSHAKE_TIMEOUT, TCP_BUFFER_SIZE};
use crate::destination::{TcpDestination, TcpDialer};
use crate::mux::{MuxListener, ServerTlsStream};
use crate::pool::{BufferPool, PooledBuffer};
use crate::registry::ConnectionRegistry;
use crate::{HandshakeError, StreamError, TunnelServerConfig};
use agent_cert::server_config;
use agent_proto::STREAM_ALPN;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum Listener {
    Tls {
        listener: TcpListener,
        acceptor: TlsAcceptor,
    },
    Mux(tokio::sync::Mutex<MuxListener>),
    Handoff,
}

struct Shared {
    registry: ConnectionRegistry<TcpDialer>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
    header_timeout: Duration,
}

pub struct TcpTunnelServer {
    listener: Listener,
    local_addr: Option<SocketAddr>,
    shared: Arc<Shared>,
}

impl TcpTunnelServer {
    fn with_listener(
        listener: Listener,
        local_addr: Option<SocketAddr>,
        cancel: CancellationToken,
        dial_timeout: Duration,
        header_timeout: Duration,
    ) -> Self {
        let shared = Shared {
            registry: ConnectionRegistry::new(TcpDialer::new(dial_timeout, cancel.clone())),
            pool: BufferPool::new(),
            cancel,
            header_timeout,
        };
        Self {
            listener,
            local_addr,
            shared: Arc::new(shared),
        }
    }

    /// Bind a listener that terminates mTLS itself
    pub async fn bind(
        config: &TunnelServerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, StreamError> {
        let tls = server_config(&config.ca, &config.server, config.client_auth, &[STREAM_ALPN])?;
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| StreamError::bind(config.bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        let listener = Listener::Tls {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls)),
        };
        Ok(Self::with_listener(
            listener,
            Some(local_addr),
            cancel,
            config.dial_timeout,
            config.header_timeout,
        ))
    }

    /// Serve connections already handshaken by the ALPN mux
    pub fn from_mux(listener: MuxListener, cancel: CancellationToken, dial_timeout: Duration) -> Self {
        let local_addr = listener.local_addr();
        Self::with_listener(
            Listener::Mux(tokio::sync::Mutex::new(listener)),
            Some(local_addr),
            cancel,
            dial_timeout,
            HANDSHAKE_TIMEOUT,
        )
    }

    /// No listener of its own; connections arrive through [`serve_conn`](Self::serve_conn)
    pub fn handler(cancel: CancellationToken, dial_timeout: Duration) -> Self {
        Self::with_listener(Listener::Handoff, None, cancel, dial_timeout, HANDSHAKE_TIMEOUT)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live destination entries
    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// Serve one handshaken connection in its own task
    pub fn serve_conn(&self, stream: ServerTlsStream, peer: SocketAddr) {
        let shared = self.shared.clone();
        tokio::spawn(Self::handle_connection(shared, stream, peer));
    }

    /// Run the accept loop until cancelled
    pub async fn start(&self) -> Result<(), StreamError> {
        let result = match &self.listener {
            Listener::Tls { listener, acceptor } => self.accept_tls(listener, acceptor).await,
            Listener::Mux(listener) => self.accept_mux(listener).await,
            Listener::Handoff => {
                self.shared.cancel.cancelled().await;
                Ok(())
            }
        };
        self.shared.registry.close_all();
        debug!(protocol = "tcp", "Stream endpoint stopped");
        result
    }

    async fn accept_tls(
        &self,
        listener: &TcpListener,
        acceptor: &TlsAcceptor,
    ) -> Result<(), StreamError> {
        if let Ok(addr) = listener.local_addr() {
            info!(protocol = "tcp", "Stream endpoint listening on {}", addr);
        }

        loop {
            let (socket, peer) = tokio::select! {
                _ = self.shared.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted.map_err(|e| {
                    error!(protocol = "tcp", "Accept error: {}", e);
                    StreamError::Accept(e)
                })?,
            };
            debug!(protocol = "tcp", remote = %peer, "New connection");

            let acceptor = acceptor.clone();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
                    Ok(Ok(stream)) => Self::handle_connection(shared, stream, peer).await,
                    Ok(Err(e)) => {
                        warn!(protocol = "tcp", "{}", HandshakeError::new(Some(peer), e.to_string()))
                    }
                    Err(_) => {
                        warn!(protocol = "tcp", "{}", HandshakeError::new(Some(peer), "timed out"))
                    }
                }
            });
        }
    }

    async fn accept_mux(
        &self,
        listener: &tokio::sync::Mutex<MuxListener>,
    ) -> Result<(), StreamError> {
        let mut listener = listener.lock().await;
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shared.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(StreamError::Closed) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };
            debug!(protocol = "tcp", remote = %peer, "New connection from mux");
            self.serve_conn(stream, peer);
        }
    }

    async fn handle_connection(shared: Arc<Shared>, mut stream: ServerTlsStream, peer: SocketAddr) {
        let header =
            match tokio::time::timeout(shared.header_timeout, read_header(&mut stream)).await {
                Ok(Ok(header)) => header,
                Ok(Err(e)) => {
                    warn!(protocol = "tcp", remote = %peer, "Rejecting connection: {}", e);
                    return;
                }
                Err(_) => {
                    warn!(protocol = "tcp", remote = %peer, "Rejecting connection: no request header");
                    return;
                }
            };

        if header.should_close_immediately() {
            info!(protocol = "tcp", remote = %peer, "health check received");
            let _ = stream.shutdown().await;
            return;
        }

        let (host, port) = match header.host_port() {
            Ok(target) => target,
            Err(e) => {
                warn!(protocol = "tcp", remote = %peer, "Rejecting connection: {}", e);
                return;
            }
        };

        let dest = match shared.registry.get_or_create(peer, host, port).await {
            Ok(dest) => dest,
            Err(e) => {
                error!(protocol = "tcp", remote = %peer, dst = %format!("{}:{}", host, port), "{}", e);
                return;
            }
        };
        debug!(protocol = "tcp", remote = %peer, dst = %dest.peer_addr(), "Relaying");

        if let Err(e) = Self::relay(&shared, stream, &dest).await {
            debug!(protocol = "tcp", remote = %peer, "Relay ended with error: {}", e);
        }
        shared.registry.delete(&peer);
        debug!(protocol = "tcp", remote = %peer, "Connection closed");
    }

    async fn relay(
        shared: &Shared,
        stream: ServerTlsStream,
        dest: &TcpDestination,
    ) -> Result<(), StreamError> {
        let (mut client_read, mut client_write) = tokio::io::split(stream);
        let mut dest_read = dest.reader.lock().await;
        let mut dest_write = dest.writer.lock().await;

        let upstream = copy_half(
            &mut client_read,
            &mut *dest_write,
            shared.pool.get(TCP_BUFFER_SIZE),
        );
        let downstream = copy_half(
            &mut *dest_read,
            &mut client_write,
            shared.pool.get(TCP_BUFFER_SIZE),
        );

        tokio::select! {
            res = async { tokio::try_join!(upstream, downstream) } => {
                res.map(|_| ()).map_err(StreamError::Relay)
            }
            _ = dest.closed() => Ok(()),
            _ = shared.cancel.cancelled() => Ok(()),
        }
    }

    /// Stop accepting and close every destination; safe to call repeatedly
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.registry.close_all();
    }
}

/// Copy until EOF, then shut down the write side
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, mut buf: PooledBuffer) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}
