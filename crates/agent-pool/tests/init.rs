//! Agent initialization against live stream endpoints

use agent_cert::create_agent_pki;
use agent_pool::{AgentConfig, AgentError, AgentPool};
use agent_stream::{ClientCredentials, TcpTunnelServer, TunnelServerConfig, UdpTunnelServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn tcp_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr.to_string()
}

#[tokio::test]
async fn test_init_detects_both_endpoints() {
    let pki = create_agent_pki().unwrap();
    let cancel = CancellationToken::new();

    let config = TunnelServerConfig::from_pki("127.0.0.1:0".parse().unwrap(), &pki).unwrap();
    let tcp = Arc::new(TcpTunnelServer::bind(&config, cancel.clone()).await.unwrap());
    let addr = tcp.local_addr().unwrap();
    let udp = Arc::new(UdpTunnelServer::bind(&config.with_bind_addr(addr), cancel.clone()).unwrap());

    let runner = tcp.clone();
    tokio::spawn(async move { runner.start().await });
    let runner = udp.clone();
    tokio::spawn(async move { runner.start().await });

    let creds = ClientCredentials::from_pki(&pki).unwrap();
    let mut agent = AgentConfig::new("nas", addr, &creds).unwrap();
    agent.init().await;
    assert!(agent.is_initialized());
    assert!(agent.supports_tcp_stream());
    assert!(agent.supports_udp_stream());

    let pool = AgentPool::new();
    pool.add(agent);
    let agent = pool.get_by_name("nas").unwrap();

    let target = tcp_echo().await;
    let mut stream = agent.new_tcp_client(&target).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    cancel.cancel();
}

#[tokio::test]
async fn test_init_without_udp_endpoint() {
    let pki = create_agent_pki().unwrap();
    let cancel = CancellationToken::new();

    let config = TunnelServerConfig::from_pki("127.0.0.1:0".parse().unwrap(), &pki).unwrap();
    let tcp = Arc::new(TcpTunnelServer::bind(&config, cancel.clone()).await.unwrap());
    let addr = tcp.local_addr().unwrap();
    let runner = tcp.clone();
    tokio::spawn(async move { runner.start().await });

    let creds = ClientCredentials::from_pki(&pki).unwrap();
    let mut agent = AgentConfig::new("tcp-only", addr, &creds).unwrap();
    agent.init().await;

    assert!(agent.is_initialized());
    assert!(agent.supports_tcp_stream());
    assert!(!agent.supports_udp_stream());

    let err = match agent.new_udp_client("127.0.0.1:53").await {
        Ok(_) => panic!("udp tunnel should be refused"),
        Err(e) => e,
    };
    assert!(matches!(err, AgentError::StreamUnsupported { protocol: "UDP", .. }));

    cancel.cancel();
}
