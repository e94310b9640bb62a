//! Agent PKI generation and PEM key pair handling
//!
//! A pairing consists of three certificates, each with its own ECDSA P-256 key:
//! - a self-signed CA (path length 0)
//! - a server certificate for the agent (`ServerAuth`)
//! - a client certificate for the control plane (`ClientAuth`)
//!
//! Server and client certificates carry the same DNS SAN, [`CERTS_DNS_NAME`],
//! so every agent is addressed by one fixed TLS server name.

use crate::{CertError, Certificate};
use agent_proto::CERTS_DNS_NAME;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const ORGANIZATION: &str = "GoDoxy";
const VALIDITY_DAYS: i64 = 1000 * 365;

/// PEM encoded certificate and private key
#[derive(Clone, PartialEq, Eq)]
pub struct PemKeyPair {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl PemKeyPair {
    pub fn new(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Decode a `base64(cert);base64(key)` string
    pub fn load(data: &str) -> Result<Self, CertError> {
        let mut parts = data.trim().split(';');
        let (Some(cert), Some(key), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CertError::InvalidPair);
        };
        Ok(Self {
            cert: STANDARD.decode(cert)?,
            key: STANDARD.decode(key)?,
        })
    }

    /// Encode as `base64(cert);base64(key)`
    pub fn encode(&self) -> String {
        format!("{};{}", STANDARD.encode(&self.cert), STANDARD.encode(&self.key))
    }

    pub fn cert_chain(&self) -> Result<Vec<CertificateDer<'static>>, CertError> {
        let mut reader = BufReader::new(self.cert.as_slice());
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::Pem(e.to_string()))?;
        if certs.is_empty() {
            return Err(CertError::NoCertificate);
        }
        Ok(certs)
    }

    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, CertError> {
        let mut reader = BufReader::new(self.key.as_slice());
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| CertError::Pem(e.to_string()))?
            .ok_or(CertError::NoPrivateKey)
    }

    /// Parse into a rustls-ready chain and key
    pub fn to_certificate(&self) -> Result<Certificate, CertError> {
        Ok(Certificate::new(self.cert_chain()?, self.private_key()?))
    }

    /// Save certificate and key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.cert)?;
        std::fs::write(key_path, &self.key)?;
        Ok(())
    }
}

impl FromStr for PemKeyPair {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::load(s)
    }
}

impl fmt::Display for PemKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for PemKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PemKeyPair")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Key material for one agent pairing
#[derive(Debug, Clone)]
pub struct AgentPki {
    pub ca: PemKeyPair,
    pub server: PemKeyPair,
    pub client: PemKeyPair,
}

/// Generate a fresh CA and the server and client certificates it issues
pub fn create_agent_pki() -> Result<AgentPki, CertError> {
    let ca_key = generate_key()?;
    let mut ca_params = base_params(None)?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let ca_cert = ca_params.self_signed(&ca_key).map_err(generation)?;

    let issue = |unit: &str, usage: ExtendedKeyUsagePurpose| -> Result<PemKeyPair, CertError> {
        let key = generate_key()?;
        let mut params = base_params(Some(unit))?;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![usage];
        let cert = params
            .signed_by(&key, &ca_cert, &ca_key)
            .map_err(generation)?;
        Ok(PemKeyPair::new(cert.pem(), key.serialize_pem()))
    };

    let server = issue("Server", ExtendedKeyUsagePurpose::ServerAuth)?;
    let client = issue("Client", ExtendedKeyUsagePurpose::ClientAuth)?;
    let ca = PemKeyPair::new(ca_cert.pem(), ca_key.serialize_pem());

    debug!("Generated agent PKI for {}", CERTS_DNS_NAME);

    Ok(AgentPki { ca, server, client })
}

fn generate_key() -> Result<KeyPair, CertError> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(generation)
}

fn base_params(unit: Option<&str>) -> Result<CertificateParams, CertError> {
    let mut params =
        CertificateParams::new(vec![CERTS_DNS_NAME.to_string()]).map_err(generation)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    if let Some(unit) = unit {
        dn.push(DnType::OrganizationalUnitName, unit);
    }
    dn.push(DnType::CommonName, CERTS_DNS_NAME);
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
    params.serial_number = Some(random_serial());

    Ok(params)
}

/// Random positive 128-bit serial
fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 16] = rand::random();
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn generation(e: impl fmt::Display) -> CertError {
    CertError::Generation(e.to_string())
}
