//! TCP and UDP destinations and their dialers

use crate::common::join_host_port;
use crate::registry::{Destination, DestinationDialer};
use crate::StreamError;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A dialed TCP destination
///
/// Halves sit behind separate locks so both relay directions run at once.
#[derive(Debug)]
pub struct TcpDestination {
    pub(crate) reader: Mutex<OwnedReadHalf>,
    pub(crate) writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
    close: CancellationToken,
}

impl TcpDestination {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Resolves once the destination is closed
    pub async fn closed(&self) {
        self.close.cancelled().await
    }
}

impl Destination for TcpDestination {
    fn close(&self) {
        self.close.cancel();
    }

    fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// A connected UDP destination socket
#[derive(Debug)]
pub struct UdpDestination {
    pub(crate) socket: UdpSocket,
    peer: SocketAddr,
    close: CancellationToken,
}

impl UdpDestination {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn closed(&self) {
        self.close.cancelled().await
    }
}

impl Destination for UdpDestination {
    fn close(&self) {
        self.close.cancel();
    }

    fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

fn dial_error(address: String, source: io::Error) -> StreamError {
    StreamError::Dial { address, source }
}

fn timed_out(address: String) -> StreamError {
    dial_error(
        address,
        io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
    )
}

/// Dials TCP destinations
///
/// Destination close tokens are children of `parent`, so cancelling the
/// endpoint closes every destination it dialed.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
    parent: CancellationToken,
}

impl TcpDialer {
    pub fn new(timeout: Duration, parent: CancellationToken) -> Self {
        Self { timeout, parent }
    }
}

#[async_trait]
impl DestinationDialer for TcpDialer {
    type Conn = TcpDestination;

    async fn dial(&self, host: &str, port: &str) -> Result<TcpDestination, StreamError> {
        let address = join_host_port(host, port);
        debug!(dst = %address, "Dialing TCP destination");

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| timed_out(address.clone()))?
            .map_err(|e| dial_error(address.clone(), e))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(TcpDestination {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
            close: self.parent.child_token(),
        })
    }
}

/// Dials UDP destinations; the timeout covers name resolution
#[derive(Debug, Clone)]
pub struct UdpDialer {
    timeout: Duration,
    parent: CancellationToken,
}

impl UdpDialer {
    pub fn new(timeout: Duration, parent: CancellationToken) -> Self {
        Self { timeout, parent }
    }
}

#[async_trait]
impl DestinationDialer for UdpDialer {
    type Conn = UdpDestination;

    async fn dial(&self, host: &str, port: &str) -> Result<UdpDestination, StreamError> {
        let address = join_host_port(host, port);
        debug!(dst = %address, "Dialing UDP destination");

        let connect = async {
            let peer = tokio::net::lookup_host(&address).await?.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
            })?;
            let local: SocketAddr = if peer.is_ipv6() {
                SocketAddr::from(([0u16; 8], 0))
            } else {
                SocketAddr::from(([0u8; 4], 0))
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(peer).await?;
            Ok::<_, io::Error>((socket, peer))
        };

        let (socket, peer) = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| timed_out(address.clone()))?
            .map_err(|e| dial_error(address.clone(), e))?;

        Ok(UdpDestination {
            socket,
            peer,
            close: self.parent.child_token(),
        })
    }
}
