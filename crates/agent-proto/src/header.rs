//! Fixed-layout stream request header
//!
//! Layout (network byte order, 275 bytes total):
//!
//! ```text
//! version[8] | host_len[1] | host[255] | port_len[1] | port[5] | flags[1] | crc32[4]
//! ```
//!
//! The checksum is CRC-32/IEEE over every byte before it. Fields are encoded one
//! by one, so the on-wire bytes never depend on in-memory struct layout.

use std::fmt;
use thiserror::Error;

pub const VERSION_SIZE: usize = 8;
pub const HOST_SIZE: usize = 255;
pub const PORT_SIZE: usize = 5;
pub const FLAGS_SIZE: usize = 1;
pub const CHECKSUM_SIZE: usize = 4;

/// Total encoded size of a header
pub const HEADER_SIZE: usize =
    VERSION_SIZE + 1 + HOST_SIZE + 1 + PORT_SIZE + FLAGS_SIZE + CHECKSUM_SIZE;

/// Protocol version, zero padded
pub const VERSION: [u8; VERSION_SIZE] = *b"0.1.0\0\0\0";

/// Health check: the server validates the header and closes without dialing
pub const FLAG_CLOSE_IMMEDIATELY: u8 = 1 << 0;

const HOST_LEN_OFFSET: usize = VERSION_SIZE;
const HOST_OFFSET: usize = HOST_LEN_OFFSET + 1;
const PORT_LEN_OFFSET: usize = HOST_OFFSET + HOST_SIZE;
const PORT_OFFSET: usize = PORT_LEN_OFFSET + 1;
const FLAGS_OFFSET: usize = PORT_OFFSET + PORT_SIZE;
const CHECKSUM_OFFSET: usize = FLAGS_OFFSET + FLAGS_SIZE;

/// Header codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("host is too long: max {max} bytes, got {got}")]
    HostTooLong { max: usize, got: usize },

    #[error("port is too long: max {max} bytes, got {got}")]
    PortTooLong { max: usize, got: usize },

    #[error("invalid header size: expected {expected} bytes, got {got}")]
    InvalidSize { expected: usize, got: usize },

    #[error("header version mismatch")]
    VersionMismatch,

    #[error("declared host length {0} exceeds {HOST_SIZE}")]
    HostLengthOutOfBounds(u8),

    #[error("declared port length {0} exceeds {PORT_SIZE}")]
    PortLengthOutOfBounds(u8),

    #[error("header checksum mismatch")]
    ChecksumMismatch,

    #[error("header field is not valid UTF-8")]
    InvalidUtf8,
}

/// The one-per-connection request sent by a tunnel client
#[derive(Clone, PartialEq, Eq)]
pub struct StreamRequestHeader {
    version: [u8; VERSION_SIZE],
    host_len: u8,
    host: [u8; HOST_SIZE],
    port_len: u8,
    port: [u8; PORT_SIZE],
    flags: u8,
    checksum: u32,
}

impl StreamRequestHeader {
    /// Build a header targeting `host:port`
    ///
    /// Fails instead of truncating when a field does not fit.
    pub fn new(host: &str, port: &str) -> Result<Self, HeaderError> {
        Self::with_flags(host, port, 0)
    }

    /// Build a health check header: empty target, close-immediately flag set
    pub fn health_check() -> Self {
        let mut header = Self::empty();
        header.flags = FLAG_CLOSE_IMMEDIATELY;
        header.checksum = header.compute_checksum();
        header
    }

    fn with_flags(host: &str, port: &str, flags: u8) -> Result<Self, HeaderError> {
        if host.len() > HOST_SIZE {
            return Err(HeaderError::HostTooLong {
                max: HOST_SIZE,
                got: host.len(),
            });
        }
        if port.len() > PORT_SIZE {
            return Err(HeaderError::PortTooLong {
                max: PORT_SIZE,
                got: port.len(),
            });
        }

        let mut header = Self::empty();
        header.host_len = host.len() as u8;
        header.host[..host.len()].copy_from_slice(host.as_bytes());
        header.port_len = port.len() as u8;
        header.port[..port.len()].copy_from_slice(port.as_bytes());
        header.flags = flags;
        header.checksum = header.compute_checksum();
        Ok(header)
    }

    fn empty() -> Self {
        Self {
            version: VERSION,
            host_len: 0,
            host: [0; HOST_SIZE],
            port_len: 0,
            port: [0; PORT_SIZE],
            flags: 0,
            checksum: 0,
        }
    }

    /// Decode a header without validating it
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut version = [0u8; VERSION_SIZE];
        version.copy_from_slice(&buf[..VERSION_SIZE]);
        let mut host = [0u8; HOST_SIZE];
        host.copy_from_slice(&buf[HOST_OFFSET..HOST_OFFSET + HOST_SIZE]);
        let mut port = [0u8; PORT_SIZE];
        port.copy_from_slice(&buf[PORT_OFFSET..PORT_OFFSET + PORT_SIZE]);
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&buf[CHECKSUM_OFFSET..]);

        Self {
            version,
            host_len: buf[HOST_LEN_OFFSET],
            host,
            port_len: buf[PORT_LEN_OFFSET],
            port,
            flags: buf[FLAGS_OFFSET],
            checksum: u32::from_be_bytes(checksum),
        }
    }

    /// Decode a header from a slice that must be exactly [`HEADER_SIZE`] long
    pub fn from_slice(buf: &[u8]) -> Result<Self, HeaderError> {
        let buf: &[u8; HEADER_SIZE] = buf.try_into().map_err(|_| HeaderError::InvalidSize {
            expected: HEADER_SIZE,
            got: buf.len(),
        })?;
        Ok(Self::from_bytes(buf))
    }

    /// Encode the header, checksum included
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = self.bytes_without_checksum();
        buf[CHECKSUM_OFFSET..].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Encode every field but leave the checksum bytes zeroed
    fn bytes_without_checksum(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..VERSION_SIZE].copy_from_slice(&self.version);
        buf[HOST_LEN_OFFSET] = self.host_len;
        buf[HOST_OFFSET..HOST_OFFSET + HOST_SIZE].copy_from_slice(&self.host);
        buf[PORT_LEN_OFFSET] = self.port_len;
        buf[PORT_OFFSET..PORT_OFFSET + PORT_SIZE].copy_from_slice(&self.port);
        buf[FLAGS_OFFSET] = self.flags;
        buf
    }

    fn compute_checksum(&self) -> u32 {
        let buf = self.bytes_without_checksum();
        crc32fast::hash(&buf[..CHECKSUM_OFFSET])
    }

    /// Check version, declared lengths and checksum, reporting the first failure
    pub fn check(&self) -> Result<(), HeaderError> {
        if self.version != VERSION {
            return Err(HeaderError::VersionMismatch);
        }
        if usize::from(self.host_len) > HOST_SIZE {
            return Err(HeaderError::HostLengthOutOfBounds(self.host_len));
        }
        if usize::from(self.port_len) > PORT_SIZE {
            return Err(HeaderError::PortLengthOutOfBounds(self.port_len));
        }
        if self.compute_checksum() != self.checksum {
            return Err(HeaderError::ChecksumMismatch);
        }
        Ok(())
    }

    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }

    pub fn should_close_immediately(&self) -> bool {
        self.flags & FLAG_CLOSE_IMMEDIATELY != 0
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Destination host and port as declared by the client
    pub fn host_port(&self) -> Result<(&str, &str), HeaderError> {
        let host_len = usize::from(self.host_len);
        let port_len = usize::from(self.port_len);
        if host_len > HOST_SIZE {
            return Err(HeaderError::HostLengthOutOfBounds(self.host_len));
        }
        if port_len > PORT_SIZE {
            return Err(HeaderError::PortLengthOutOfBounds(self.port_len));
        }
        let host =
            std::str::from_utf8(&self.host[..host_len]).map_err(|_| HeaderError::InvalidUtf8)?;
        let port =
            std::str::from_utf8(&self.port[..port_len]).map_err(|_| HeaderError::InvalidUtf8)?;
        Ok((host, port))
    }
}

impl fmt::Debug for StreamRequestHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host_len = usize::from(self.host_len).min(HOST_SIZE);
        let port_len = usize::from(self.port_len).min(PORT_SIZE);
        f.debug_struct("StreamRequestHeader")
            .field("version", &String::from_utf8_lossy(&self.version))
            .field("host", &String::from_utf8_lossy(&self.host[..host_len]))
            .field("port", &String::from_utf8_lossy(&self.port[..port_len]))
            .field("flags", &self.flags)
            .field("checksum", &format_args!("{:#010x}", self.checksum))
            .finish()
    }
}
