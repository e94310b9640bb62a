//! Agent health probes
//!
//! A probe is a real client connection carrying a close-immediately header:
//! it exercises the handshake and certificate checks but never makes the agent
//! dial anything.

use crate::{ClientCredentials, StreamError, TcpTunnelClient, UdpTunnelClient};
use std::net::SocketAddr;

/// Probe the TCP stream endpoint
pub async fn probe_tcp(addr: SocketAddr, creds: &ClientCredentials) -> Result<(), StreamError> {
    TcpTunnelClient::new(creds)?.probe(addr).await
}

/// Probe the UDP stream endpoint
pub async fn probe_udp(addr: SocketAddr, creds: &ClientCredentials) -> Result<(), StreamError> {
    UdpTunnelClient::new(creds)?.probe(addr).await
}

pub async fn probe(addr: SocketAddr, creds: &ClientCredentials) -> Result<(), StreamError> {
    probe_tcp(addr, creds).await
}
