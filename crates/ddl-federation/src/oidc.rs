//! Identity provider seam and the issuer registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OidcError {
    #[error("identity provider request failed: {0}")]
    Request(String),
    #[error("identity provider returned no {0}")]
    MissingField(&'static str),
    #[error("token is not active")]
    Inactive,
    #[error("no driver for issuer {0}")]
    UnknownIssuer(String),
}

/// RFC 7662 introspection result. Unknown claims are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Introspection {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait OidcDriver: Send + Sync {
    fn issuer(&self) -> &str;

    /// Client-credentials token for this instance's service account.
    async fn service_token(&self) -> Result<String, OidcError>;

    /// Swap a token from a trusted external IdP for one of ours.
    async fn exchange_token(&self, external_token: &str) -> Result<String, OidcError>;

    async fn introspect_token(&self, token: &str) -> Result<Introspection, OidcError>;

    /// Subject behind a token issued elsewhere. `client_id` is the client
    /// the calling node registered with.
    async fn validate_external(&self, token: &str, client_id: &str) -> Result<String, OidcError> {
        let exchanged = self.exchange_token(token).await?;
        let info = self.introspect_token(&exchanged).await?;
        if !info.active {
            return Err(OidcError::Inactive);
        }
        tracing::debug!(client_id, "auth: external token exchanged");
        info.sub.ok_or(OidcError::MissingField("sub"))
    }
}

/// Drivers keyed by issuer. Built once at startup.
#[derive(Default, Clone)]
pub struct OidcRegistry {
    default_issuer: Option<String>,
    drivers: HashMap<String, Arc<dyn OidcDriver>>,
}

impl OidcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one driver, which becomes the default.
    pub fn with_default(driver: Arc<dyn OidcDriver>) -> Self {
        let mut registry = Self::new();
        registry.register(driver, true);
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn OidcDriver>, default: bool) {
        let issuer = driver.issuer().to_string();
        if default || self.default_issuer.is_none() {
            self.default_issuer = Some(issuer.clone());
        }
        self.drivers.insert(issuer, driver);
    }

    pub fn default_issuer(&self) -> Option<&str> {
        self.default_issuer.as_deref()
    }

    pub fn default_driver(&self) -> Option<&Arc<dyn OidcDriver>> {
        self.default_issuer.as_ref().and_then(|i| self.drivers.get(i))
    }

    /// Driver for `issuer`, or the default one when no issuer is named.
    pub fn driver(&self, issuer: Option<&str>) -> Result<&Arc<dyn OidcDriver>, OidcError> {
        match issuer {
            Some(iss) => self
                .drivers
                .get(iss)
                .ok_or_else(|| OidcError::UnknownIssuer(iss.to_string())),
            None => self
                .default_driver()
                .ok_or_else(|| OidcError::UnknownIssuer("<default>".to_string())),
        }
    }

    /// Driver for `issuer` when registered, else the default one. Tokens
    /// from unregistered issuers are judged by the default IdP.
    pub fn resolve(&self, issuer: Option<&str>) -> Option<&Arc<dyn OidcDriver>> {
        issuer
            .and_then(|iss| self.drivers.get(iss))
            .or_else(|| self.default_driver())
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for OidcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcRegistry")
            .field("default_issuer", &self.default_issuer)
            .field("issuers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}
