//! HTTP transport seam.
//!
//! The federation layer never talks to the network directly: the node
//! binary plugs in a reqwest client, tests plug in an in-process fake.

use async_trait::async_trait;
use ddl_protocol::NetworkMessageHeader;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("http status {0}")]
    Status(u16),
    #[error("invalid body: {0}")]
    Body(String),
}

/// One HTTP exchange as seen by the federation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub header: NetworkMessageHeader,
    /// Parsed body when the reply was JSON.
    pub body: Option<Value>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// GET a JSON document.
    async fn get_json(&self, url: &str) -> Result<Value, TransportError>;

    /// POST an encoded message with its transport header.
    async fn post(
        &self,
        url: &str,
        header: &NetworkMessageHeader,
        body: Vec<u8>,
    ) -> Result<TransportResponse, TransportError>;
}
