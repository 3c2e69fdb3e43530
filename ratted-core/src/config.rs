//! Endpoint configuration injected into sessions.

use crate::protocol::{DEFAULT_DOMAIN, SOCKET_PATH};

const POST_PATH: &str = "/upload/new";

/// Where to upload and how to identify ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Host name, optionally with port (e.g. `ratted.systems`).
    pub domain: String,
    pub socket_path: String,
    pub user_agent: String,
}

impl EndpointConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// `wss://{domain}{socket_path}`.
    pub fn socket_uri(&self) -> String {
        format!("wss://{}{}", self.domain.trim_end_matches('/'), self.socket_path)
    }

    /// Multipart POST endpoint for small files.
    pub fn post_url(&self) -> String {
        format!("https://{}{}", self.domain.trim_end_matches('/'), POST_PATH)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            socket_path: SOCKET_PATH.to_string(),
            user_agent: default_user_agent(),
        }
    }
}

/// `RattedSystemsCli/{version} (+https://ratted.systems/) {os}`.
pub fn default_user_agent() -> String {
    format!(
        "RattedSystemsCli/{} (+https://{}/) {}",
        env!("CARGO_PKG_VERSION"),
        DEFAULT_DOMAIN,
        std::env::consts::OS
    )
}
