//! Per-instance federation options.

use ddl_governor::ScoreParams;
use ddl_protocol::DEFAULT_RELAY_TTL;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_description")]
    pub description: String,
    /// Where other nodes reach this instance.
    #[serde(default = "default_url")]
    pub url: String,
    /// Accept tokens whose introspection carries no `client_id`.
    #[serde(default)]
    pub allow_non_client_authenticated: bool,
    /// Create local users for unknown subjects of dynamically mapped nodes.
    #[serde(default)]
    pub auto_user_registration: bool,
    /// Callers that resolve to no subject act as the anonymous user.
    #[serde(default)]
    pub anonymous_access: bool,
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,
    #[serde(default = "default_half")]
    pub optimal_record_percentage: f64,
    #[serde(default = "default_half")]
    pub time_score_weight: f64,
    #[serde(default = "default_half")]
    pub ema_factor: f64,
}

fn default_name() -> String {
    "Decentralised Discovery Link".into()
}
fn default_description() -> String {
    "A decentralised discovery service".into()
}
fn default_url() -> String {
    "http://localhost:8000".into()
}
fn default_ttl() -> u32 {
    DEFAULT_RELAY_TTL
}
fn default_half() -> f64 {
    0.5
}

impl DdlConfig {
    pub fn score_params(&self) -> ScoreParams {
        ScoreParams {
            optimal_record_percentage: self.optimal_record_percentage,
            time_score_weight: self.time_score_weight,
            ema_factor: self.ema_factor,
        }
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: default_description(),
            url: default_url(),
            allow_non_client_authenticated: false,
            auto_user_registration: false,
            anonymous_access: false,
            default_ttl: default_ttl(),
            optimal_record_percentage: default_half(),
            time_score_weight: default_half(),
            ema_factor: default_half(),
        }
    }
}
