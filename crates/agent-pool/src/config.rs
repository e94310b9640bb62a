use crate::AgentError;
use agent_stream::{
    ClientCredentials, StreamError, TcpTunnelClient, TcpTunnelStream, UdpTunnelClient,
    UdpTunnelConn,
};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Snapshot of what an agent supports, as reported to API consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub addr: SocketAddr,
    pub supports_tcp_stream: bool,
    pub supports_udp_stream: bool,
}

pub struct AgentConfig {
    name: String,
    addr: SocketAddr,
    tcp: TcpTunnelClient,
    udp: UdpTunnelClient,
    initialized: bool,
    supports_tcp_stream: bool,
    supports_udp_stream: bool,
}

impl AgentConfig {
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        creds: &ClientCredentials,
    ) -> Result<Self, AgentError> {
        Ok(Self {
            name: name.into(),
            addr,
            tcp: TcpTunnelClient::new(creds)?,
            udp: UdpTunnelClient::new(creds)?,
            initialized: false,
            supports_tcp_stream: false,
            supports_udp_stream: false,
        })
    }

    /// Probe both stream endpoints and record which ones answer
    ///
    /// Probe failures are not errors: the agent stays usable for whatever
    /// did answer, and a single warning lists what did not.
    pub async fn init(&mut self) {
        let (tcp, udp) = tokio::join!(self.tcp.probe(self.addr), self.udp.probe(self.addr));

        let mut failures = Vec::new();
        self.supports_tcp_stream = record("TCP", tcp, &mut failures);
        self.supports_udp_stream = record("UDP", udp, &mut failures);
        self.initialized = true;

        if !failures.is_empty() {
            warn!(
                agent = %self.name,
                addr = %self.addr,
                "Agent has limited or no stream tunneling support, routes via this agent may not work: {}",
                failures.join("; ")
            );
        }
        info!(agent = %self.name, addr = %self.addr, "Agent initialized");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn supports_tcp_stream(&self) -> bool {
        self.supports_tcp_stream
    }

    pub fn supports_udp_stream(&self) -> bool {
        self.supports_udp_stream
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            name: self.name.clone(),
            addr: self.addr,
            supports_tcp_stream: self.supports_tcp_stream,
            supports_udp_stream: self.supports_udp_stream,
        }
    }

    /// Open a TCP tunnel through this agent to `target` (`host:port`)
    pub async fn new_tcp_client(&self, target: &str) -> Result<TcpTunnelStream, AgentError> {
        self.check_support("TCP", self.supports_tcp_stream)?;
        Ok(self.tcp.connect(self.addr, target).await?)
    }

    /// Open a UDP tunnel through this agent to `target` (`host:port`)
    pub async fn new_udp_client(&self, target: &str) -> Result<UdpTunnelConn, AgentError> {
        self.check_support("UDP", self.supports_udp_stream)?;
        Ok(self.udp.connect(self.addr, target).await?)
    }

    fn check_support(&self, protocol: &'static str, supported: bool) -> Result<(), AgentError> {
        if !self.initialized {
            return Err(AgentError::NotInitialized(self.to_string()));
        }
        if !supported {
            return Err(AgentError::StreamUnsupported {
                agent: self.to_string(),
                protocol,
            });
        }
        Ok(())
    }
}

fn record(protocol: &str, result: Result<(), StreamError>, failures: &mut Vec<String>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            failures.push(format!("{} stream: {}", protocol, e));
            false
        }
    }
}

impl fmt::Display for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("initialized", &self.initialized)
            .field("supports_tcp_stream", &self.supports_tcp_stream)
            .field("supports_udp_stream", &self.supports_udp_stream)
            .finish()
    }
}
