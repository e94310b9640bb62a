//! rustls configuration for agent endpoints and clients
//!
//! Both sides trust exactly one CA: the one generated for the pairing.
//! Server identity is pinned to [`CERTS_DNS_NAME`] regardless of the address
//! the client dials.

use crate::{CertError, Certificate};
use agent_proto::CERTS_DNS_NAME;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;

/// Client certificate policy of a server config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientAuth {
    /// Client must present a certificate issued by the pairing CA
    #[default]
    RequireAndVerify,
    /// No client certificate is requested
    None,
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn root_store(ca: &[CertificateDer<'static>]) -> Result<RootCertStore, CertError> {
    let mut roots = RootCertStore::empty();
    for cert in ca {
        roots.add(cert.clone())?;
    }
    if roots.is_empty() {
        return Err(CertError::NoCertificate);
    }
    Ok(roots)
}

fn alpn_protocols(alpn: &[&str]) -> Vec<Vec<u8>> {
    alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// Build a server config presenting `identity`
pub fn server_config(
    ca: &[CertificateDer<'static>],
    identity: &Certificate,
    client_auth: ClientAuth,
    alpn: &[&str],
) -> Result<ServerConfig, CertError> {
    ensure_crypto_provider();

    let builder = ServerConfig::builder();
    let builder = match client_auth {
        ClientAuth::RequireAndVerify => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca)?))
                .build()
                .map_err(|e| CertError::Verifier(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        ClientAuth::None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(
        identity.cert_chain.clone(),
        identity.private_key.clone_key(),
    )?;
    config.alpn_protocols = alpn_protocols(alpn);
    Ok(config)
}

/// Build a client config trusting only `ca`, optionally presenting `identity`
pub fn client_config(
    ca: &[CertificateDer<'static>],
    identity: Option<&Certificate>,
    alpn: &[&str],
) -> Result<ClientConfig, CertError> {
    ensure_crypto_provider();

    let builder = ClientConfig::builder().with_root_certificates(root_store(ca)?);
    let mut config = match identity {
        Some(identity) => builder.with_client_auth_cert(
            identity.cert_chain.clone(),
            identity.private_key.clone_key(),
        )?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = alpn_protocols(alpn);
    Ok(config)
}

/// TLS server name every client verifies
pub fn server_name() -> Result<ServerName<'static>, CertError> {
    ServerName::try_from(CERTS_DNS_NAME).map_err(|e| CertError::InvalidServerName(e.to_string()))
}
