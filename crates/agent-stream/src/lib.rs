//! Stream tunnel endpoints and clients
//!
//! An agent exposes one port. Over TCP, an ALPN multiplexer splits that port
//! between the HTTPS API and the stream tunnel; over UDP, a QUIC endpoint
//! carries datagram tunnels. Every tunnel starts with one
//! [`agent_proto::StreamRequestHeader`] naming the destination.

pub mod common;
pub mod config;
pub mod destination;
pub mod error;
pub mod health;
pub mod mux;
pub mod pool;
pub mod registry;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp_client;
pub mod udp_server;

pub use config::{ClientCredentials, TunnelServerConfig};
pub use destination::{TcpDestination, TcpDialer, UdpDestination, UdpDialer};
pub use error::{HandshakeError, StreamError};
pub use health::{probe, probe_tcp, probe_udp};
pub use mux::{route, AlpnMux, MuxListener, MuxListeners, MuxRoute, ServerTlsStream};
pub use pool::{BufferPool, PooledBuffer};
pub use registry::{ConnectionRegistry, Destination, DestinationDialer};
pub use tcp_client::{TcpTunnelClient, TcpTunnelStream};
pub use tcp_server::TcpTunnelServer;
pub use udp_client::{classify_connection_error, UdpTunnelClient, UdpTunnelConn};
pub use udp_server::UdpTunnelServer;

pub use agent_cert::ClientAuth;
