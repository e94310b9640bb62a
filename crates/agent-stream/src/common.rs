//! Constants and helpers shared by both transports

use crate::StreamError;
use agent_proto::{StreamRequestHeader, HEADER_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub const TCP_BUFFER_SIZE: usize = 16 * 1024;
pub const UDP_BUFFER_SIZE: usize = 65535;

/// QUIC application close codes
pub mod close_code {
    pub const DONE: u32 = 0;
    pub const INVALID_HEADER: u32 = 1;
    pub const DIAL_FAILED: u32 = 2;
    pub const IDLE_TIMEOUT: u32 = 3;
    pub const SHUTDOWN: u32 = 4;
}

/// Read exactly one header and validate it
pub async fn read_header<R>(reader: &mut R) -> Result<StreamRequestHeader, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(StreamError::ShortHeader)?;

    let header = StreamRequestHeader::from_bytes(&buf);
    header.check()?;
    Ok(header)
}

/// `host:port`, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split `host:port` or `[v6]:port`
pub fn split_host_port(addr: &str) -> Result<(&str, &str), StreamError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| StreamError::InvalidAddress(format!("missing port in {}", addr)))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if port.is_empty() {
        return Err(StreamError::InvalidAddress(format!("missing port in {}", addr)));
    }
    Ok((host, port))
}
