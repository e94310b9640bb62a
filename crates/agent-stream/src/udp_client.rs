//! Control-plane side of the UDP stream tunnel

use crate::common::{close_code, split_host_port, HANDSHAKE_TIMEOUT, PROBE_TIMEOUT};
use crate::{ClientCredentials, HandshakeError, StreamError};
use agent_cert::client_config;
use agent_proto::{StreamRequestHeader, CERTS_DNS_NAME, STREAM_ALPN};
use bytes::Bytes;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{
    ConnectionError, Endpoint, ReadError, ReadToEndError, RecvStream, SendDatagramError, VarInt,
    WriteError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// TLS alerts surface in QUIC as transport codes 0x100 + alert
fn is_crypto_code(code: u64) -> bool {
    (0x100..=0x1ff).contains(&code)
}

/// Sort a QUIC connection failure into handshake, rejection or transport errors
pub fn classify_connection_error(err: ConnectionError, peer: Option<SocketAddr>) -> StreamError {
    match &err {
        ConnectionError::TransportError(e) if is_crypto_code(u64::from(e.code)) => {
            HandshakeError::new(peer, e.to_string()).into()
        }
        ConnectionError::ConnectionClosed(close) if is_crypto_code(u64::from(close.error_code)) => {
            HandshakeError::new(peer, close.to_string()).into()
        }
        ConnectionError::ApplicationClosed(close) => StreamError::Rejected {
            code: close.error_code.into_inner(),
            reason: String::from_utf8_lossy(&close.reason).into_owned(),
        },
        _ => StreamError::Connection(err),
    }
}

fn classify_write_error(err: WriteError, peer: SocketAddr) -> StreamError {
    match err {
        WriteError::ConnectionLost(e) => classify_connection_error(e, Some(peer)),
        other => StreamError::Io(other.into()),
    }
}

fn classify_read_error(err: ReadToEndError, peer: SocketAddr) -> StreamError {
    match err {
        ReadToEndError::Read(ReadError::ConnectionLost(e)) => {
            classify_connection_error(e, Some(peer))
        }
        ReadToEndError::Read(other) => StreamError::Io(other.into()),
        ReadToEndError::TooLong => StreamError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected data on control stream",
        )),
    }
}

#[derive(Clone)]
pub struct UdpTunnelClient {
    config: quinn::ClientConfig,
}

impl UdpTunnelClient {
    pub fn new(creds: &ClientCredentials) -> Result<Self, StreamError> {
        let tls = client_config(&creds.ca, Some(&creds.client), &[STREAM_ALPN])?;
        Self::from_tls_config(tls)
    }

    pub fn from_tls_config(config: rustls::ClientConfig) -> Result<Self, StreamError> {
        let crypto =
            QuicClientConfig::try_from(config).map_err(|e| StreamError::Config(e.to_string()))?;
        Ok(Self {
            config: quinn::ClientConfig::new(Arc::new(crypto)),
        })
    }

    /// Handshake, then send `header` on a fresh control stream
    async fn open(
        &self,
        server_addr: SocketAddr,
        header: &StreamRequestHeader,
    ) -> Result<(Endpoint, quinn::Connection, RecvStream), StreamError> {
        let bind = if server_addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(self.config.clone());

        let connecting = endpoint
            .connect(server_addr, CERTS_DNS_NAME)
            .map_err(|e| StreamError::Config(e.to_string()))?;
        let conn = tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting)
            .await
            .map_err(|_| HandshakeError::new(Some(server_addr), "timed out"))?
            .map_err(|e| classify_connection_error(e, Some(server_addr)))?;

        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| classify_connection_error(e, Some(server_addr)))?;
        send.write_all(&header.to_bytes())
            .await
            .map_err(|e| classify_write_error(e, server_addr))?;
        let _ = send.finish();

        Ok((endpoint, conn, recv))
    }

    /// Open a tunnel through the agent at `server_addr` to `target` (`host:port`)
    ///
    /// Returns once the agent has dialed the destination.
    pub async fn connect(
        &self,
        server_addr: SocketAddr,
        target: &str,
    ) -> Result<UdpTunnelConn, StreamError> {
        let (host, port) = split_host_port(target)?;
        let header = StreamRequestHeader::new(host, port)?;

        let (endpoint, conn, mut recv) = self.open(server_addr, &header).await?;
        recv.read_to_end(0)
            .await
            .map_err(|e| classify_read_error(e, server_addr))?;

        debug!(protocol = "udp", addr = %server_addr, dst = %target, "Tunnel established");
        Ok(UdpTunnelConn { endpoint, conn })
    }

    /// Send a health check header and wait for the agent to accept it
    pub async fn probe(&self, server_addr: SocketAddr) -> Result<(), StreamError> {
        let probe = async {
            let header = StreamRequestHeader::health_check();
            let (endpoint, conn, mut recv) = self.open(server_addr, &header).await?;
            let result = recv
                .read_to_end(0)
                .await
                .map(|_| ())
                .map_err(|e| classify_read_error(e, server_addr));
            conn.close(VarInt::from_u32(close_code::DONE), b"done");
            endpoint.wait_idle().await;
            result
        };

        tokio::time::timeout(PROBE_TIMEOUT, probe)
            .await
            .map_err(|_| StreamError::Timeout(format!("probing {}", server_addr)))?
    }
}

/// An established UDP tunnel; each datagram maps to one destination packet
pub struct UdpTunnelConn {
    endpoint: Endpoint,
    conn: quinn::Connection,
}

impl UdpTunnelConn {
    pub fn send(&self, data: &[u8]) -> Result<(), StreamError> {
        let peer = self.conn.remote_address();
        self.conn
            .send_datagram(Bytes::copy_from_slice(data))
            .map_err(|e| match e {
                SendDatagramError::ConnectionLost(e) => classify_connection_error(e, Some(peer)),
                other => StreamError::Config(other.to_string()),
            })
    }

    /// Next datagram from the destination; `None` once the session ends cleanly
    pub async fn recv(&self) -> Result<Option<Bytes>, StreamError> {
        match self.conn.read_datagram().await {
            Ok(data) => Ok(Some(data)),
            Err(ConnectionError::ApplicationClosed(close))
                if close.error_code == VarInt::from_u32(close_code::DONE)
                    || close.error_code == VarInt::from_u32(close_code::IDLE_TIMEOUT) =>
            {
                Ok(None)
            }
            Err(ConnectionError::LocallyClosed) => Ok(None),
            Err(e) => Err(classify_connection_error(e, Some(self.conn.remote_address()))),
        }
    }

    pub fn max_datagram_size(&self) -> Option<usize> {
        self.conn.max_datagram_size()
    }

    pub fn close(&self) {
        self.conn.close(VarInt::from_u32(close_code::DONE), b"done");
    }
}

impl Drop for UdpTunnelConn {
    fn drop(&mut self) {
        self.close();
        self.endpoint.close(VarInt::from_u32(close_code::DONE), b"done");
    }
}
