//! ALPN multiplexer
//!
//! Terminates TLS once for the agent port and hands every handshaken
//! connection to one of two listeners by negotiated protocol: the stream
//! tunnel or the HTTPS API.

use crate::common::HANDSHAKE_TIMEOUT;
use crate::{HandshakeError, StreamError, TunnelServerConfig};
use agent_cert::server_config;
use agent_proto::STREAM_ALPN;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server side TLS stream produced by the mux
pub type ServerTlsStream = tokio_rustls::server::TlsStream<TcpStream>;

const ALPN_H2: &str = "h2";
const ALPN_HTTP1: &str = "http/1.1";
const LISTENER_CAPACITY: usize = 128;

type Accepted = (ServerTlsStream, SocketAddr);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRoute {
    Stream,
    Https,
}

/// Pick the listener for a negotiated ALPN protocol
pub fn route(alpn: Option<&[u8]>) -> MuxRoute {
    match alpn {
        Some(proto) if proto == STREAM_ALPN.as_bytes() => MuxRoute::Stream,
        _ => MuxRoute::Https,
    }
}

/// Receiving side of one mux route
#[derive(Debug)]
pub struct MuxListener {
    rx: mpsc::Receiver<Accepted>,
    local_addr: SocketAddr,
}

impl MuxListener {
    /// Next handshaken connection, or [`StreamError::Closed`] once the mux stops
    pub async fn accept(&mut self) -> Result<Accepted, StreamError> {
        self.rx.recv().await.ok_or(StreamError::Closed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[derive(Debug)]
pub struct MuxListeners {
    pub stream: MuxListener,
    pub https: MuxListener,
}

pub struct AlpnMux {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    stream_tx: mpsc::Sender<Accepted>,
    https_tx: mpsc::Sender<Accepted>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl AlpnMux {
    pub async fn bind(
        config: &TunnelServerConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, MuxListeners), StreamError> {
        let tls = server_config(
            &config.ca,
            &config.server,
            config.client_auth,
            &[ALPN_H2, ALPN_HTTP1, STREAM_ALPN],
        )?;

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| StreamError::bind(config.bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        let (stream_tx, stream_rx) = mpsc::channel(LISTENER_CAPACITY);
        let (https_tx, https_rx) = mpsc::channel(LISTENER_CAPACITY);

        let mux = Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls)),
            stream_tx,
            https_tx,
            local_addr,
            cancel,
        };
        let listeners = MuxListeners {
            stream: MuxListener {
                rx: stream_rx,
                local_addr,
            },
            https: MuxListener {
                rx: https_rx,
                local_addr,
            },
        };
        Ok((mux, listeners))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and route connections until cancelled
    pub async fn run(self) -> Result<(), StreamError> {
        info!("ALPN mux listening on {}", self.local_addr);

        loop {
            let (socket, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("ALPN mux on {} cancelled", self.local_addr);
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("ALPN mux accept error: {}", e);
                        return Err(StreamError::Accept(e));
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let stream_tx = self.stream_tx.clone();
            let https_tx = self.https_tx.clone();

            tokio::spawn(async move {
                let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket))
                    .await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!("{}", HandshakeError::new(Some(peer), e.to_string()));
                        return;
                    }
                    Err(_) => {
                        warn!("{}", HandshakeError::new(Some(peer), "timed out"));
                        return;
                    }
                };

                let route = route(stream.get_ref().1.alpn_protocol());
                debug!(remote = %peer, ?route, "Routing mux connection");

                let tx = match route {
                    MuxRoute::Stream => stream_tx,
                    MuxRoute::Https => https_tx,
                };
                if tx.send((stream, peer)).await.is_err() {
                    debug!(remote = %peer, ?route, "Listener gone, dropping connection");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route() {
        assert_eq!(route(Some(STREAM_ALPN.as_bytes())), MuxRoute::Stream);
        assert_eq!(route(Some(b"h2")), MuxRoute::Https);
        assert_eq!(route(Some(b"http/1.1")), MuxRoute::Https);
        assert_eq!(route(Some(b"godoxy-agent-stream/2")), MuxRoute::Https);
        assert_eq!(route(None), MuxRoute::Https);
    }
}
