//! Endpoint and client configuration

use crate::common::{DEFAULT_DIAL_TIMEOUT, DEFAULT_IDLE_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::StreamError;
use agent_cert::{AgentPki, Certificate, ClientAuth, PemKeyPair};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration shared by the TCP endpoint, the UDP endpoint and the mux
#[derive(Debug, Clone)]
pub struct TunnelServerConfig {
    pub bind_addr: SocketAddr,
    pub ca: Vec<CertificateDer<'static>>,
    pub server: Certificate,
    pub client_auth: ClientAuth,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    /// How long a client may take to send its request header
    pub header_timeout: Duration,
}

impl TunnelServerConfig {
    pub fn new(bind_addr: SocketAddr, ca: Vec<CertificateDer<'static>>, server: Certificate) -> Self {
        Self {
            bind_addr,
            ca,
            server,
            client_auth: ClientAuth::RequireAndVerify,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            header_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Build from the CA pair and the server pair of an agent
    pub fn from_pem(
        bind_addr: SocketAddr,
        ca: &PemKeyPair,
        server: &PemKeyPair,
    ) -> Result<Self, StreamError> {
        Ok(Self::new(bind_addr, ca.cert_chain()?, server.to_certificate()?))
    }

    pub fn from_pki(bind_addr: SocketAddr, pki: &AgentPki) -> Result<Self, StreamError> {
        Self::from_pem(bind_addr, &pki.ca, &pki.server)
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Idle timeout of a UDP session, renewed on every destination read
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }
}

/// Trust anchor and identity of a control-plane client
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub ca: Vec<CertificateDer<'static>>,
    pub client: Certificate,
}

impl ClientCredentials {
    pub fn new(ca: Vec<CertificateDer<'static>>, client: Certificate) -> Self {
        Self { ca, client }
    }

    pub fn from_pem(ca: &PemKeyPair, client: &PemKeyPair) -> Result<Self, StreamError> {
        Ok(Self::new(ca.cert_chain()?, client.to_certificate()?))
    }

    pub fn from_pki(pki: &AgentPki) -> Result<Self, StreamError> {
        Self::from_pem(&pki.ca, &pki.client)
    }
}
