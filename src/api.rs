//! HTTPS API served on the connections the ALPN mux routes away from the tunnel

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const API_BASE: &str = "/godoxy/agent";

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
    pub supports_tcp_stream: bool,
    pub supports_udp_stream: bool,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("GIT_TAG"),
            commit: env!("GIT_HASH"),
            built: env!("BUILD_TIME"),
            supports_tcp_stream: true,
            supports_udp_stream: true,
        }
    }
}

pub fn router(info: AgentInfo) -> Router {
    Router::new()
        .route(&format!("{}/info", API_BASE), get(info_handler))
        .route(&format!("{}/name", API_BASE), get(name_handler))
        .route(&format!("{}/version", API_BASE), get(version_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(info))
}

async fn info_handler(State(info): State<Arc<AgentInfo>>) -> Json<AgentInfo> {
    Json(info.as_ref().clone())
}

// Older control planes ask for name and version separately
async fn name_handler(State(info): State<Arc<AgentInfo>>) -> String {
    info.name.clone()
}

async fn version_handler(State(info): State<Arc<AgentInfo>>) -> &'static str {
    info.version
}
