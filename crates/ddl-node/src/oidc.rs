//! OpenID Connect driver speaking to a real identity provider.
//!
//! Endpoints come from the issuer's discovery document, fetched on first
//! use. The client-credentials token is cached until shortly before it
//! expires.

use async_trait::async_trait;
use ddl_federation::{Introspection, OidcDriver, OidcError};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Renew a cached service token this long before it lapses.
const EXPIRY_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
struct Discovery {
    token_endpoint: String,
    introspection_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

pub struct HttpOidcDriver {
    issuer: String,
    discovery_url: String,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
    discovery: OnceCell<Discovery>,
    service_token: Mutex<Option<(String, Instant)>>,
}

impl HttpOidcDriver {
    pub fn new(
        http: reqwest::Client,
        issuer: impl Into<String>,
        discovery_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            discovery_url: discovery_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http,
            discovery: OnceCell::new(),
            service_token: Mutex::new(None),
        }
    }

    async fn endpoints(&self) -> Result<&Discovery, OidcError> {
        self.discovery
            .get_or_try_init(|| async {
                let discovery: Discovery = self
                    .http
                    .get(&self.discovery_url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(failed)?
                    .json()
                    .await
                    .map_err(failed)?;
                tracing::debug!(issuer = %self.issuer, "auth: discovery document loaded");
                Ok(discovery)
            })
            .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, OidcError> {
        let endpoints = self.endpoints().await?;
        self.http
            .post(&endpoints.token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(failed)?
            .json()
            .await
            .map_err(failed)
    }
}

fn failed(e: reqwest::Error) -> OidcError {
    OidcError::Request(e.to_string())
}

#[async_trait]
impl OidcDriver for HttpOidcDriver {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn service_token(&self) -> Result<String, OidcError> {
        let mut cached = self.service_token.lock().await;
        if let Some((token, expires)) = cached.as_ref() {
            if Instant::now() + EXPIRY_MARGIN < *expires {
                return Ok(token.clone());
            }
        }

        let response = self.token_request(&[("grant_type", "client_credentials")]).await?;
        let token = response.access_token.ok_or(OidcError::MissingField("access_token"))?;
        match response.expires_in {
            Some(secs) => *cached = Some((token.clone(), Instant::now() + Duration::from_secs(secs))),
            None => *cached = None,
        }
        tracing::debug!(issuer = %self.issuer, "auth: service token issued");
        Ok(token)
    }

    async fn exchange_token(&self, external_token: &str) -> Result<String, OidcError> {
        let response = self
            .token_request(&[
                ("grant_type", TOKEN_EXCHANGE_GRANT),
                ("subject_token", external_token),
                ("subject_token_type", ACCESS_TOKEN_TYPE),
                ("requested_token_type", ACCESS_TOKEN_TYPE),
            ])
            .await?;
        response.access_token.ok_or(OidcError::MissingField("access_token"))
    }

    async fn introspect_token(&self, token: &str) -> Result<Introspection, OidcError> {
        let endpoints = self.endpoints().await?;
        self.http
            .post(&endpoints.introspection_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(failed)?
            .json()
            .await
            .map_err(failed)
    }
}
