//! Wire protocol shared by the agent stream endpoints and their clients
//!
//! Every tunnel connection starts with exactly one fixed-size
//! [`StreamRequestHeader`]. There is no other framing.

pub mod header;

pub use header::{
    HeaderError, StreamRequestHeader, CHECKSUM_SIZE, FLAG_CLOSE_IMMEDIATELY, HEADER_SIZE,
    HOST_SIZE, PORT_SIZE, VERSION, VERSION_SIZE,
};

/// TLS ALPN protocol id of the stream tunnel.
///
/// A TCP client negotiating this id is routed to the stream tunnel handler
/// instead of the HTTPS API sharing the same port.
pub const STREAM_ALPN: &str = "godoxy-agent-stream/1";

/// DNS name carried by every agent server certificate.
///
/// Clients pin the server identity to this name; the real address is only
/// used at dial time.
pub const CERTS_DNS_NAME: &str = "godoxy.agent";
