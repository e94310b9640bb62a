//! UDP stream tunnel endpoint over QUIC
//!
//! A client opens one bidirectional control stream and writes the request
//! header on it. The endpoint answers by finishing its side of the stream
//! once the destination is dialed, or by closing the connection with an
//! application code. Payload then travels as QUIC datagrams, one per UDP
//! packet in each direction.

use crate::common::{close_code, read_header, HANDSHAKE_TIMEOUT, UDP_BUFFER_SIZE};
use crate::destination::{UdpDestination, UdpDialer};
use crate::pool::BufferPool;
use crate::registry::{ConnectionRegistry, Destination};
use crate::{HandshakeError, StreamError, TunnelServerConfig};
use agent_cert::server_config;
use agent_proto::STREAM_ALPN;
use bytes::Bytes;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection, ConnectionError, Endpoint, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const HEALTH_CHECK_LINGER: Duration = Duration::from_secs(1);
const MAX_QUIC_IDLE: Duration = Duration::from_secs(30);

struct Shared {
    /// Keyed by `Connection::stable_id`
    registry: ConnectionRegistry<UdpDialer, usize>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    header_timeout: Duration,
}

pub struct UdpTunnelServer {
    endpoint: Endpoint,
    shared: Arc<Shared>,
}

fn close(conn: &Connection, code: u32, reason: &str) {
    conn.close(VarInt::from_u32(code), reason.as_bytes());
}

/// Close reasons that end a session without anything worth reporting
fn is_clean_close(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::ApplicationClosed(close) => {
            close.error_code == VarInt::from_u32(close_code::DONE)
        }
        ConnectionError::LocallyClosed | ConnectionError::TimedOut => true,
        _ => false,
    }
}

impl UdpTunnelServer {
    /// Bind a QUIC endpoint with mutual TLS
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &TunnelServerConfig, cancel: CancellationToken) -> Result<Self, StreamError> {
        let tls = server_config(&config.ca, &config.server, config.client_auth, &[STREAM_ALPN])?;
        let crypto =
            QuicServerConfig::try_from(tls).map_err(|e| StreamError::Config(e.to_string()))?;

        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            MAX_QUIC_IDLE
                .try_into()
                .map_err(|_| StreamError::Config("invalid idle timeout".to_string()))?,
        ));
        transport.max_concurrent_uni_streams(0u8.into());

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport));

        let endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| StreamError::bind(config.bind_addr, e))?;

        let shared = Shared {
            registry: ConnectionRegistry::new(UdpDialer::new(config.dial_timeout, cancel.clone())),
            pool: BufferPool::new(),
            cancel,
            idle_timeout: config.idle_timeout,
            header_timeout: config.header_timeout,
        };

        Ok(Self {
            endpoint,
            shared: Arc::new(shared),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Number of live destination entries
    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// Run the accept loop until cancelled
    pub async fn start(&self) -> Result<(), StreamError> {
        info!(protocol = "udp", "Stream endpoint listening on {}", self.local_addr()?);

        loop {
            let incoming = tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            let peer = incoming.remote_address();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let conn = match Self::handshake(incoming).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(protocol = "udp", remote = %peer, "{}", e);
                        return;
                    }
                };
                if let Err(e) = Self::handle_connection(&shared, conn, peer).await {
                    warn!(protocol = "udp", remote = %peer, "{}", e);
                }
            });
        }

        self.shared.registry.close_all();
        self.endpoint
            .close(VarInt::from_u32(close_code::SHUTDOWN), b"shutdown");
        debug!(protocol = "udp", "Stream endpoint stopped");
        Ok(())
    }

    async fn handshake(incoming: quinn::Incoming) -> Result<Connection, StreamError> {
        let peer = incoming.remote_address();
        let connecting = incoming
            .accept()
            .map_err(|e| HandshakeError::new(Some(peer), e.to_string()))?;
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(HandshakeError::new(Some(peer), e.to_string()).into()),
            Err(_) => Err(HandshakeError::new(Some(peer), "timed out").into()),
        }
    }

    async fn handle_connection(
        shared: &Arc<Shared>,
        conn: Connection,
        peer: SocketAddr,
    ) -> Result<(), StreamError> {
        let request = async {
            let (send, mut recv) = conn.accept_bi().await?;
            let header = read_header(&mut recv).await?;
            Ok::<_, StreamError>((send, header))
        };
        let (mut send, header) = match tokio::time::timeout(shared.header_timeout, request).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                close(&conn, close_code::INVALID_HEADER, "invalid header");
                return Err(e);
            }
            Err(_) => {
                close(&conn, close_code::INVALID_HEADER, "no request header");
                return Err(StreamError::Timeout("waiting for request header".to_string()));
            }
        };

        if header.should_close_immediately() {
            info!(protocol = "udp", remote = %peer, "health check received");
            let _ = send.finish();
            let _ = tokio::time::timeout(HEALTH_CHECK_LINGER, conn.closed()).await;
            close(&conn, close_code::DONE, "health check");
            return Ok(());
        }

        let (host, port) = match header.host_port() {
            Ok(target) => target,
            Err(e) => {
                close(&conn, close_code::INVALID_HEADER, "invalid header");
                return Err(e.into());
            }
        };

        let id = conn.stable_id();
        let dest = match shared.registry.get_or_create(id, host, port).await {
            Ok(dest) => dest,
            Err(e) => {
                error!(protocol = "udp", remote = %peer, "{}", e);
                close(&conn, close_code::DIAL_FAILED, &e.to_string());
                return Ok(());
            }
        };

        if send.finish().is_err() {
            shared.registry.delete(&id);
            return Ok(());
        }
        debug!(protocol = "udp", remote = %peer, dst = %dest.peer_addr(), "Relaying");

        let downstream = tokio::spawn(Self::relay_to_client(
            shared.clone(),
            conn.clone(),
            dest.clone(),
        ));

        let result = Self::relay_to_destination(&conn, &dest).await;

        dest.close();
        let _ = downstream.await;
        shared.registry.delete(&id);
        close(&conn, close_code::DONE, "done");
        debug!(protocol = "udp", remote = %peer, "Connection closed");
        result
    }

    async fn relay_to_destination(
        conn: &Connection,
        dest: &UdpDestination,
    ) -> Result<(), StreamError> {
        loop {
            let datagram = tokio::select! {
                _ = dest.closed() => return Ok(()),
                datagram = conn.read_datagram() => datagram,
            };
            match datagram {
                Ok(data) => {
                    if let Err(e) = dest.socket.send(&data).await {
                        return Err(StreamError::Relay(e));
                    }
                }
                Err(e) if is_clean_close(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Destination to client, ending the session after `idle_timeout` without traffic
    async fn relay_to_client(shared: Arc<Shared>, conn: Connection, dest: Arc<UdpDestination>) {
        let mut buf = shared.pool.get(UDP_BUFFER_SIZE);
        loop {
            let received = tokio::select! {
                _ = dest.closed() => break,
                received = tokio::time::timeout(shared.idle_timeout, dest.socket.recv(&mut buf)) => received,
            };

            let n = match received {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(protocol = "udp", dst = %dest.peer_addr(), "Destination read error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!(protocol = "udp", dst = %dest.peer_addr(), "Idle timeout, ending session");
                    close(&conn, close_code::IDLE_TIMEOUT, "idle timeout");
                    break;
                }
            };

            match conn.max_datagram_size() {
                Some(max) if n > max => {
                    warn!(
                        protocol = "udp",
                        dst = %dest.peer_addr(),
                        "Dropping {} byte datagram, peer accepts at most {}",
                        n,
                        max
                    );
                    continue;
                }
                Some(_) => {}
                None => {
                    warn!(protocol = "udp", "Peer does not accept datagrams");
                    break;
                }
            }

            if let Err(e) = conn.send_datagram(Bytes::copy_from_slice(&buf[..n])) {
                debug!(protocol = "udp", "Failed to forward datagram: {}", e);
                break;
            }
        }
        dest.close();
    }

    /// Stop accepting, close every destination and the QUIC endpoint
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.registry.close_all();
        self.endpoint
            .close(VarInt::from_u32(close_code::SHUTDOWN), b"shutdown");
    }
}
