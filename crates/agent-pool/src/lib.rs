//! Control-plane view of remote agents
//!
//! An [`AgentConfig`] knows how to reach one agent and which stream tunnels
//! it supports; an [`AgentPool`] tracks every known agent by address.

pub mod config;
pub mod pool;

pub use config::{AgentConfig, AgentStatus};
pub use pool::AgentPool;

use agent_stream::StreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {0} is not initialized")]
    NotInitialized(String),

    #[error("agent {agent} does not support {protocol} stream tunneling")]
    StreamUnsupported {
        agent: String,
        protocol: &'static str,
    },

    #[error(transparent)]
    Stream(#[from] StreamError),
}
