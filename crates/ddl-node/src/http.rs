//! reqwest-backed [`Transport`] used by the node binary.

use async_trait::async_trait;
use ddl_federation::{Transport, TransportError, TransportResponse};
use ddl_protocol::NetworkMessageHeader;
use serde_json::Value;
use std::time::Duration;

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connect(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, url: &str) -> Result<Value, TransportError> {
        let response = self.client.get(url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))
    }

    async fn post(
        &self,
        url: &str,
        header: &NetworkMessageHeader,
        body: Vec<u8>,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in header.headers() {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(request_error)?;

        let status = response.status();
        let reply_header = NetworkMessageHeader::from_lookup(|name| {
            response.headers().get(name).and_then(|v| v.to_str().ok())
        });
        let bytes = response.bytes().await.map_err(request_error)?;

        // Error bodies are informational only; a success body must be JSON.
        let body = if bytes.is_empty() {
            None
        } else if status.is_success() {
            Some(serde_json::from_slice(&bytes).map_err(|e| TransportError::Body(e.to_string()))?)
        } else {
            serde_json::from_slice(&bytes).ok()
        };
        tracing::trace!(url, status = status.as_u16(), "node: post answered");
        Ok(TransportResponse {
            status: status.as_u16(),
            header: reply_header,
            body,
        })
    }
}
