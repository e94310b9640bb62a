//! Control-plane side of the TCP stream tunnel

use crate::common::{split_host_port, DEFAULT_DIAL_TIMEOUT, HANDSHAKE_TIMEOUT, PROBE_TIMEOUT};
use crate::{ClientCredentials, HandshakeError, StreamError};
use agent_cert::{client_config, server_name};
use agent_proto::{StreamRequestHeader, STREAM_ALPN};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// An established tunnel: read and write the destination's bytes directly
pub type TcpTunnelStream = tokio_rustls::client::TlsStream<TcpStream>;

#[derive(Clone)]
pub struct TcpTunnelClient {
    connector: TlsConnector,
}

impl TcpTunnelClient {
    pub fn new(creds: &ClientCredentials) -> Result<Self, StreamError> {
        let tls = client_config(&creds.ca, Some(&creds.client), &[STREAM_ALPN])?;
        Ok(Self::from_tls_config(tls))
    }

    pub fn from_tls_config(config: rustls::ClientConfig) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    async fn handshake(&self, server_addr: SocketAddr) -> Result<TcpTunnelStream, StreamError> {
        let tcp = tokio::time::timeout(DEFAULT_DIAL_TIMEOUT, TcpStream::connect(server_addr))
            .await
            .map_err(|_| StreamError::Timeout(format!("connecting to {}", server_addr)))?
            .map_err(|e| StreamError::Dial {
                address: server_addr.to_string(),
                source: e,
            })?;
        tcp.set_nodelay(true)?;

        let name = server_name()?;
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.connector.connect(name, tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(HandshakeError::new(Some(server_addr), e.to_string()).into()),
            Err(_) => Err(HandshakeError::new(Some(server_addr), "timed out").into()),
        }
    }

    /// Open a tunnel through the agent at `server_addr` to `target` (`host:port`)
    pub async fn connect(
        &self,
        server_addr: SocketAddr,
        target: &str,
    ) -> Result<TcpTunnelStream, StreamError> {
        let (host, port) = split_host_port(target)?;
        let header = StreamRequestHeader::new(host, port)?;

        let mut stream = self.handshake(server_addr).await?;
        stream
            .write_all(&header.to_bytes())
            .await
            .map_err(|e| StreamError::from_tls_io(e, Some(server_addr)))?;
        stream
            .flush()
            .await
            .map_err(|e| StreamError::from_tls_io(e, Some(server_addr)))?;

        debug!(protocol = "tcp", addr = %server_addr, dst = %target, "Tunnel established");
        Ok(stream)
    }

    /// Send a health check header and wait for the agent's graceful close
    pub async fn probe(&self, server_addr: SocketAddr) -> Result<(), StreamError> {
        let probe = async {
            let mut stream = self.handshake(server_addr).await?;
            let io_err = |e: std::io::Error| StreamError::from_tls_io(e, Some(server_addr));

            stream
                .write_all(&StreamRequestHeader::health_check().to_bytes())
                .await
                .map_err(io_err)?;
            stream.flush().await.map_err(io_err)?;

            let mut buf = [0u8; 1];
            match stream.read(&mut buf).await.map_err(io_err)? {
                0 => Ok(()),
                _ => Err(StreamError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unexpected data after health check",
                ))),
            }
        };

        tokio::time::timeout(PROBE_TIMEOUT, probe)
            .await
            .map_err(|_| StreamError::Timeout(format!("probing {}", server_addr)))?
    }
}
