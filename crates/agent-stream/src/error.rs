//! Error types for the stream tunnel

use agent_cert::CertError;
use agent_proto::HeaderError;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// A failed TLS or QUIC handshake, including certificate rejection
#[derive(Debug, Clone, Error)]
pub struct HandshakeError {
    pub peer: Option<SocketAddr>,
    pub reason: String,
}

impl HandshakeError {
    pub fn new(peer: Option<SocketAddr>, reason: impl Into<String>) -> Self {
        Self {
            peer,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "handshake with {} failed: {}", peer, self.reason),
            None => write!(f, "handshake failed: {}", self.reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to read request header: {0}")]
    ShortHeader(#[source] std::io::Error),

    #[error("invalid request header: {0}")]
    InvalidHeader(#[from] HeaderError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        source: std::io::Error,
    },

    #[error("relay error: {0}")]
    Relay(#[source] std::io::Error),

    #[error("rejected by agent (code {code}): {reason}")]
    Rejected { code: u64, reason: String },

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("accept error: {0}")]
    Accept(#[source] std::io::Error),

    #[error("endpoint closed")]
    Closed,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub fn is_handshake(&self) -> bool {
        matches!(self, StreamError::Handshake(_))
    }

    pub(crate) fn bind(addr: SocketAddr, reason: impl ToString) -> Self {
        StreamError::Bind {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: reason.to_string(),
        }
    }

    /// Map an IO error out of a TLS stream, surfacing rustls failures as handshake errors
    pub(crate) fn from_tls_io(err: std::io::Error, peer: Option<SocketAddr>) -> Self {
        let tls = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .map(|e| e.to_string());
        match tls {
            Some(reason) => StreamError::Handshake(HandshakeError::new(peer, reason)),
            None => StreamError::Io(err),
        }
    }
}
