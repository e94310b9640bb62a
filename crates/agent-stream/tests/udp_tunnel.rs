//! End-to-end tests for the UDP stream tunnel
mod common;

use agent_cert::client_config;
use agent_proto::{StreamRequestHeader, STREAM_ALPN};
use agent_stream::common::close_code;
use agent_stream::{StreamError, UdpTunnelClient, UdpTunnelServer};
use bytes::Bytes;
use common::*;
use quinn::VarInt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_udp_tunnel_echo() {
    init_tracing();
    let echo = UdpEcho::start().await;
    let pki = pki();
    let (server, addr, _cancel) = start_udp_server(&server_config(&pki)).await;

    let client = UdpTunnelClient::new(&credentials(&pki)).unwrap();
    let conn = client.connect(addr, &echo.addr.to_string()).await.unwrap();
    assert!(conn.max_datagram_size().is_some());

    for msg in [&b"ping"[..], &b"second datagram"[..], &b"third"[..]] {
        conn.send(msg).unwrap();
        let reply = tokio::time::timeout(DEADLINE, conn.recv())
            .await
            .unwrap()
            .unwrap()
            .expect("session should still be open");
        assert_eq!(&reply[..], msg);
    }

    assert_eq!(echo.datagrams(), 3);
    assert_eq!(server.active_connections(), 1);

    conn.close();
    tokio::time::timeout(DEADLINE, async {
        while server.active_connections() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registry entry should be removed after the client closes");
}

#[tokio::test]
async fn test_idle_timeout_ends_session() {
    let echo = UdpEcho::start().await;
    let pki = pki();
    let config = server_config(&pki).with_idle_timeout(Duration::from_millis(300));
    let (server, addr, _cancel) = start_udp_server(&config).await;

    let client = UdpTunnelClient::new(&credentials(&pki)).unwrap();
    let conn = client.connect(addr, &echo.addr.to_string()).await.unwrap();

    conn.send(b"ping").unwrap();
    let reply = tokio::time::timeout(DEADLINE, conn.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.as_deref(), Some(&b"ping"[..]));

    let end = tokio::time::timeout(DEADLINE, conn.recv())
        .await
        .expect("idle session should end")
        .unwrap();
    assert!(end.is_none());

    tokio::time::timeout(DEADLINE, async {
        while server.active_connections() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_foreign_ca_client_gets_handshake_error() {
    let echo = UdpEcho::start().await;
    let pki = pki();
    let foreign = common::pki();
    let (server, addr, _cancel) = start_udp_server(&server_config(&pki)).await;

    let creds = credentials(&pki);
    let foreign_client = foreign.client.to_certificate().unwrap();
    let tls = client_config(&creds.ca, Some(&foreign_client), &[STREAM_ALPN]).unwrap();
    let client = UdpTunnelClient::from_tls_config(tls).unwrap();

    let err = match client.connect(addr, &echo.addr.to_string()).await {
        Ok(_) => panic!("foreign client must not get a tunnel"),
        Err(e) => e,
    };
    assert!(err.is_handshake(), "expected handshake error, got {}", err);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(echo.datagrams(), 0);
    assert_eq!(server.active_connections(), 0);
}

#[tokio::test]
async fn test_client_without_certificate_gets_handshake_error() {
    let pki = pki();
    let (_server, addr, _cancel) = start_udp_server(&server_config(&pki)).await;

    let creds = credentials(&pki);
    let tls = client_config(&creds.ca, None, &[STREAM_ALPN]).unwrap();
    let client = UdpTunnelClient::from_tls_config(tls).unwrap();

    let err = client.probe(addr).await.unwrap_err();
    assert!(err.is_handshake(), "expected handshake error, got {}", err);
}

#[tokio::test]
async fn test_probe_never_dials() {
    let pki = pki();
    let (server, addr, _cancel) = start_udp_server(&server_config(&pki)).await;

    agent_stream::probe_udp(addr, &credentials(&pki)).await.unwrap();
    assert_eq!(server.active_connections(), 0);
}

#[tokio::test]
async fn test_close_immediately_ignores_destination() {
    let echo = UdpEcho::start().await;
    let pki = pki();
    let (server, addr, _cancel) = start_udp_server(&server_config(&pki)).await;

    let endpoint = quic_endpoint(&credentials(&pki));
    let conn = open_quic_tunnel(&endpoint, addr, &close_immediately_header(echo.addr)).await;
    let _ = conn.send_datagram(Bytes::from_static(b"must not arrive"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.active_connections(), 0);
    assert_eq!(echo.datagrams(), 0);

    conn.close(VarInt::from_u32(0), b"done");
}

#[tokio::test]
async fn test_connections_sharing_a_socket_keep_own_destinations() {
    init_tracing();
    let echo_a = UdpEcho::start().await;
    let echo_b = UdpEcho::start().await;
    let pki = pki();
    let (server, addr, _cancel) = start_udp_server(&server_config(&pki)).await;

    let endpoint = quic_endpoint(&credentials(&pki));
    let header = |target: std::net::SocketAddr| {
        StreamRequestHeader::new("127.0.0.1", &target.port().to_string())
            .unwrap()
            .to_bytes()
    };
    let a = open_quic_tunnel(&endpoint, addr, &header(echo_a.addr)).await;
    let b = open_quic_tunnel(&endpoint, addr, &header(echo_b.addr)).await;
    assert_eq!(server.active_connections(), 2);

    b.send_datagram(Bytes::from_static(b"for-b")).unwrap();
    let reply = tokio::time::timeout(DEADLINE, b.read_datagram())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[..], b"for-b");
    assert_eq!(echo_a.datagrams(), 0);
    assert_eq!(echo_b.datagrams(), 1);

    b.close(VarInt::from_u32(0), b"done");
    tokio::time::timeout(DEADLINE, async {
        while server.active_connections() != 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("only the closed connection's entry should be removed");

    a.send_datagram(Bytes::from_static(b"for-a")).unwrap();
    let reply = tokio::time::timeout(DEADLINE, a.read_datagram())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[..], b"for-a");
    assert_eq!(echo_a.datagrams(), 1);
    assert_eq!(echo_b.datagrams(), 1);
}

#[tokio::test]
async fn test_missing_header_times_out() {
    let pki = pki();
    let config = server_config(&pki).with_header_timeout(Duration::from_millis(300));
    let (server, addr, _cancel) = start_udp_server(&config).await;

    let endpoint = quic_endpoint(&credentials(&pki));
    let conn = endpoint
        .connect(addr, agent_proto::CERTS_DNS_NAME)
        .unwrap()
        .await
        .unwrap();

    let err = tokio::time::timeout(DEADLINE, conn.closed()).await.unwrap();
    match err {
        quinn::ConnectionError::ApplicationClosed(close) => {
            assert_eq!(close.error_code, VarInt::from_u32(close_code::INVALID_HEADER));
        }
        other => panic!("expected application close, got {}", other),
    }
    assert_eq!(server.active_connections(), 0);
}

#[tokio::test]
async fn test_unresolvable_destination_is_rejected() {
    let pki = pki();
    let config = server_config(&pki).with_dial_timeout(Duration::from_secs(1));
    let (server, addr, _cancel) = start_udp_server(&config).await;

    let client = UdpTunnelClient::new(&credentials(&pki)).unwrap();
    let err = match client.connect(addr, "does-not-exist.invalid:53").await {
        Ok(_) => panic!("dial should fail"),
        Err(e) => e,
    };
    match err {
        StreamError::Rejected { code, .. } => assert_eq!(code, 2),
        other => panic!("expected rejection, got {}", other),
    }
    assert_eq!(server.active_connections(), 0);
}

#[tokio::test]
async fn test_cancellation_stops_accept_loop() {
    let pki = pki();
    let cancel = CancellationToken::new();
    let server = Arc::new(UdpTunnelServer::bind(&server_config(&pki), cancel.clone()).unwrap());

    let runner = server.clone();
    let task = tokio::spawn(async move { runner.start().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    tokio::time::timeout(DEADLINE, task)
        .await
        .expect("accept loop should stop after cancellation")
        .unwrap()
        .unwrap();
}
