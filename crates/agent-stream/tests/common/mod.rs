//! Shared fixtures for the stream tunnel integration tests
#![allow(dead_code)]

use agent_cert::{client_config, create_agent_pki, AgentPki};
use agent_proto::{
    StreamRequestHeader, CERTS_DNS_NAME, CHECKSUM_SIZE, FLAG_CLOSE_IMMEDIATELY, HEADER_SIZE,
    STREAM_ALPN,
};
use agent_stream::{ClientCredentials, TcpTunnelServer, TunnelServerConfig, UdpTunnelServer};
use quinn::crypto::rustls::QuicClientConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

pub const LOCALHOST: &str = "127.0.0.1:0";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn pki() -> AgentPki {
    create_agent_pki().unwrap()
}

pub fn server_config(pki: &AgentPki) -> TunnelServerConfig {
    TunnelServerConfig::from_pki(LOCALHOST.parse().unwrap(), pki).unwrap()
}

pub fn credentials(pki: &AgentPki) -> ClientCredentials {
    ClientCredentials::from_pki(pki).unwrap()
}

/// TCP echo server counting accepted connections
pub struct TcpEcho {
    pub addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
}

impl TcpEcho {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(LOCALHOST).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));

        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { addr, accepts }
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// UDP echo server counting received datagrams
pub struct UdpEcho {
    pub addr: SocketAddr,
    datagrams: Arc<AtomicUsize>,
}

impl UdpEcho {
    pub async fn start() -> Self {
        let socket = UdpSocket::bind(LOCALHOST).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let datagrams = Arc::new(AtomicUsize::new(0));

        let counter = datagrams.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 65535];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });

        Self { addr, datagrams }
    }

    pub fn datagrams(&self) -> usize {
        self.datagrams.load(Ordering::SeqCst)
    }
}

/// Bind and start a TCP endpoint on an ephemeral port
pub async fn start_tcp_server(
    config: &TunnelServerConfig,
) -> (Arc<TcpTunnelServer>, SocketAddr, CancellationToken) {
    let cancel = CancellationToken::new();
    let server = Arc::new(TcpTunnelServer::bind(config, cancel.clone()).await.unwrap());
    let addr = server.local_addr().unwrap();

    let runner = server.clone();
    tokio::spawn(async move { runner.start().await });

    (server, addr, cancel)
}

/// Bind and start a UDP endpoint on an ephemeral port
pub async fn start_udp_server(
    config: &TunnelServerConfig,
) -> (Arc<UdpTunnelServer>, SocketAddr, CancellationToken) {
    let cancel = CancellationToken::new();
    let server = Arc::new(UdpTunnelServer::bind(config, cancel.clone()).unwrap());
    let addr = server.local_addr().unwrap();

    let runner = server.clone();
    tokio::spawn(async move { runner.start().await });

    (server, addr, cancel)
}

/// Close-immediately header that still names a real destination
pub fn close_immediately_header(target: SocketAddr) -> [u8; HEADER_SIZE] {
    let mut bytes =
        StreamRequestHeader::new(&target.ip().to_string(), &target.port().to_string())
            .unwrap()
            .to_bytes();
    let checksum_offset = HEADER_SIZE - CHECKSUM_SIZE;
    bytes[checksum_offset - 1] |= FLAG_CLOSE_IMMEDIATELY;
    let checksum = crc32fast::hash(&bytes[..checksum_offset]);
    bytes[checksum_offset..].copy_from_slice(&checksum.to_be_bytes());

    let header = StreamRequestHeader::from_bytes(&bytes);
    assert!(header.validate());
    assert!(header.should_close_immediately());
    assert_eq!(header.host_port().unwrap().1, target.port().to_string());
    bytes
}

/// A bare QUIC client endpoint presenting the control plane identity
pub fn quic_endpoint(creds: &ClientCredentials) -> quinn::Endpoint {
    let tls = client_config(&creds.ca, Some(&creds.client), &[STREAM_ALPN]).unwrap();
    let crypto = QuicClientConfig::try_from(tls).unwrap();
    let mut endpoint = quinn::Endpoint::client(LOCALHOST.parse().unwrap()).unwrap();
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));
    endpoint
}

/// Connect, send `header` on the control stream and wait for the agent's FIN
pub async fn open_quic_tunnel(
    endpoint: &quinn::Endpoint,
    server: SocketAddr,
    header: &[u8],
) -> quinn::Connection {
    let conn = endpoint
        .connect(server, CERTS_DNS_NAME)
        .unwrap()
        .await
        .unwrap();
    let (mut send, mut recv) = conn.open_bi().await.unwrap();
    send.write_all(header).await.unwrap();
    send.finish().unwrap();
    recv.read_to_end(0).await.unwrap();
    conn
}
