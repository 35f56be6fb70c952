//! Configuration types for ddl-node.
//! Parsed from ~/.ddl/config.toml.

use ddl_federation::{DdlConfig, DEFAULT_FEDERATION_PATH};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub ddl: DdlConfig,
    #[serde(default)]
    pub oidc: OidcSection,
    #[serde(default)]
    pub pending: PendingSection,
    #[serde(default)]
    pub membership: MembershipSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// SQLite path, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,
    /// PEM key installed for stored networks that have none yet.
    #[serde(default = "default_network_key")]
    pub network_key: String,
    #[serde(default = "default_federation_path")]
    pub federation_path: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database: default_database(),
            network_key: default_network_key(),
            federation_path: default_federation_path(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Identity provider of this instance. Left empty, no tokens are issued or
/// validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OidcSection {
    pub issuer: Option<String>,
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub trusted: Vec<TrustedIssuer>,
}

impl OidcSection {
    pub fn is_configured(&self) -> bool {
        self.issuer.is_some()
    }
}

/// Additional issuer whose tokens callers may present, reached with this
/// instance's client credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedIssuer {
    pub issuer: String,
    pub discovery_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSection {
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Also ask every approved member for relays parked there for us.
    #[serde(default = "default_true")]
    pub poll_members: bool,
}

impl Default for PendingSection {
    fn default() -> Self {
        Self {
            retry_interval_secs: default_retry_interval(),
            poll_members: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipSection {
    /// How often members are asked for their member lists; 0 disables.
    #[serde(default = "default_member_sync")]
    pub sync_interval_secs: u64,
}

impl Default for MembershipSection {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_member_sync(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0:8000".into()
}
fn default_database() -> String {
    "~/.ddl/ddl.db".into()
}
fn default_network_key() -> String {
    "~/.ddl/network.pem".into()
}
fn default_federation_path() -> String {
    DEFAULT_FEDERATION_PATH.into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_retry_interval() -> u64 {
    60
}
fn default_member_sync() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

/// Discovery document location for an issuer without an explicit one.
pub fn discovery_url_for(issuer: &str, explicit: Option<&str>) -> String {
    match explicit {
        Some(url) => url.to_string(),
        None => format!("{}/.well-known/openid-configuration", issuer.trim_end_matches('/')),
    }
}

impl NodeConfig {
    /// Load config from file, or defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
