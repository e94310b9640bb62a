//! Agent certificate bootstrap and TLS configuration
//!
//! Generates the CA / server / client triple that pairs one agent with its
//! control plane, and turns that material into rustls configs for both sides.

pub mod pki;
pub mod tls;

pub use pki::{create_agent_pki, AgentPki, PemKeyPair};
pub use tls::{client_config, ensure_crypto_provider, server_config, server_name, ClientAuth};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

/// Certificate errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("invalid key pair encoding: expected \"<cert>;<key>\"")]
    InvalidPair,

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PEM parse error: {0}")]
    Pem(String),

    #[error("no certificate found in PEM data")]
    NoCertificate,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("client verifier error: {0}")]
    Verifier(String),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),
}

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }
}

impl Clone for Certificate {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}
