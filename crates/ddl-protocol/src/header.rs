//! Transport-level message header.
//!
//! Travels as HTTP headers on requests and responses, and as a JSON object
//! of the same names inside relay envelopes.

use serde_json::{Map, Value};

pub const CONTENT_TYPE: &str = "Content-Type";
pub const X_NODE_ID: &str = "X-Node-ID";
pub const X_NETWORK_ID: &str = "X-Network-ID";
pub const X_SERVER_SIGNATURE: &str = "X-Server-Signature";
pub const AUTHORIZATION: &str = "Authorization";
pub const X_USER_ID: &str = "X-User-ID";
pub const X_DELIVERED: &str = "X-Delivered";
pub const X_DELIVERED_TO: &str = "X-Delivered-To";
pub const X_IDP_ISS: &str = "X-IDP-ISS";

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkMessageHeader {
    pub node_id: Option<String>,
    pub network_id: Option<String>,
    /// Base64 RSA-PSS signature over the canonical message body.
    pub server_signature: Option<String>,
    pub access_token: Option<String>,
    /// Issuer of `access_token`, when it is not the receiver's default IdP.
    pub idp_iss: Option<String>,
    /// Set by the receiver once the caller has been resolved.
    pub user_id: Option<String>,
    /// Set by a relay hop when the enveloped message reached its target.
    pub delivered: bool,
    /// Recipients a relay hop confirms got the enveloped message.
    pub delivered_to: Vec<String>,
}

impl NetworkMessageHeader {
    pub fn new(node_id: impl Into<String>, network_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            network_id: Some(network_id.into()),
            ..Default::default()
        }
    }

    /// Header name/value pairs in wire order. Absent fields are omitted.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![(CONTENT_TYPE, "application/json".to_string())];
        if let Some(v) = &self.node_id {
            out.push((X_NODE_ID, v.clone()));
        }
        if let Some(v) = &self.network_id {
            out.push((X_NETWORK_ID, v.clone()));
        }
        if let Some(v) = &self.server_signature {
            out.push((X_SERVER_SIGNATURE, v.clone()));
        }
        if let Some(v) = &self.access_token {
            out.push((AUTHORIZATION, format!("{BEARER_PREFIX}{v}")));
        }
        if let Some(v) = &self.idp_iss {
            out.push((X_IDP_ISS, v.clone()));
        }
        if let Some(v) = &self.user_id {
            out.push((X_USER_ID, v.clone()));
        }
        if self.delivered {
            out.push((X_DELIVERED, "true".to_string()));
        }
        if !self.delivered_to.is_empty() {
            out.push((X_DELIVERED_TO, self.delivered_to.join(",")));
        }
        out
    }

    /// Build from any case-insensitive header lookup (HTTP header maps).
    pub fn from_lookup<'a, F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let owned = |name: &str| get(name).map(str::to_string);
        Self {
            node_id: owned(X_NODE_ID),
            network_id: owned(X_NETWORK_ID),
            server_signature: owned(X_SERVER_SIGNATURE),
            access_token: get(AUTHORIZATION).and_then(parse_bearer),
            idp_iss: owned(X_IDP_ISS),
            user_id: owned(X_USER_ID),
            delivered: get(X_DELIVERED).map(parse_flag).unwrap_or(false),
            delivered_to: get(X_DELIVERED_TO).map(parse_list).unwrap_or_default(),
        }
    }

    /// JSON object form used inside relay targets.
    pub fn to_map(&self) -> Map<String, Value> {
        self.headers()
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v)))
            .collect()
    }

    /// Inverse of [`NetworkMessageHeader::to_map`]. Key match ignores case,
    /// non-string values are ignored.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self::from_lookup(|name| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.as_str())
        })
    }
}

fn parse_bearer(value: &str) -> Option<String> {
    let token = value.strip_prefix(BEARER_PREFIX)?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("true") || value == "1"
}
