//! Inbound trust checks: replay window, sender signature, access token,
//! then user mapping.
//!
//! Replay, signature and token-classification failures are fatal. A token
//! that cannot be validated for any other reason falls back to the sending
//! node's user mapping, which is only allowed while that node has never
//! presented a valid token.

use ddl_protocol::header::{X_NETWORK_ID, X_NODE_ID, X_SERVER_SIGNATURE};
use ddl_protocol::{
    canonical_payload, AuthMessage, MappingError, MessageType, NetworkMessage, NetworkMessageHeader, Node,
    ProtocolError, User, UserMapping,
};
use ddl_storage::Storage;
use serde_json::{json, Map};

use crate::config::DdlConfig;
use crate::oidc::OidcRegistry;
use crate::{AuthFailure, FederationError, Result};

/// Allowed clock difference between sender and receiver.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 60;

/// User ID given to callers with no resolvable subject when anonymous
/// access is on.
pub const ANONYMOUS_USER: &str = "anonymous";

const SERVICE_ACCOUNT_PREFIX: &str = "service-account-";

/// Which stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checks {
    pub timestamp: bool,
    pub signature: bool,
    pub access_token: bool,
}

impl Checks {
    pub fn all() -> Self {
        Self {
            timestamp: true,
            signature: true,
            access_token: true,
        }
    }

    /// Messages that waited in a relay or pending store: the replay window
    /// does not apply.
    pub fn relayed() -> Self {
        Self {
            timestamp: false,
            ..Self::all()
        }
    }
}

impl Default for Checks {
    fn default() -> Self {
        Self::all()
    }
}

pub struct AccessValidator<'a> {
    config: &'a DdlConfig,
    storage: &'a dyn Storage,
    oidc: &'a OidcRegistry,
}

impl<'a> AccessValidator<'a> {
    pub fn new(config: &'a DdlConfig, storage: &'a dyn Storage, oidc: &'a OidcRegistry) -> Self {
        Self { config, storage, oidc }
    }

    /// Resolve the local user a message acts for.
    pub async fn validate_message(
        &self,
        message: &NetworkMessage,
        header: &NetworkMessageHeader,
        checks: Checks,
    ) -> Result<String> {
        let (node, stranger) = self.sender(message, header)?;
        self.check_origin(message, header, &node, checks)?;

        // A stranger has no registered client a token could belong to.
        if checks.access_token && !stranger {
            if let Some(token) = header.access_token.as_deref() {
                if let Some(user_id) = self.validate_token(message, header, &node, token).await? {
                    return Ok(user_id);
                }
            }
        }
        self.remap_user(message.network_id(), &node, header).await
    }

    /// Replay and signature checks only. Used on replies, which carry no
    /// caller identity.
    pub fn verify_origin(&self, message: &NetworkMessage, header: &NetworkMessageHeader, checks: Checks) -> Result<()> {
        let (node, _) = self.sender(message, header)?;
        self.check_origin(message, header, &node, checks)
    }

    fn check_origin(
        &self,
        message: &NetworkMessage,
        header: &NetworkMessageHeader,
        node: &Node,
        checks: Checks,
    ) -> Result<()> {
        if checks.timestamp {
            check_timestamp(message.timestamp(), chrono::Utc::now().timestamp())?;
        }
        if checks.signature {
            let signature = header
                .server_signature
                .as_deref()
                .ok_or(FederationError::MissingHeader(X_SERVER_SIGNATURE))?;
            let public_key = node.public_key.as_deref().ok_or_else(|| {
                ddl_crypto::CryptoError::InvalidKey(format!("node {} has no public key", node.node_id))
            })?;
            let payload = canonical_payload(message)?;
            ddl_crypto::verify(public_key, signature, &payload).inspect_err(|e| {
                tracing::debug!(node_id = %node.node_id, message_id = message.message_id(), error = %e, "auth: signature rejected");
            })?;
        }
        Ok(())
    }

    /// The sending node's record, and whether it came from the message
    /// rather than the store.
    fn sender(&self, message: &NetworkMessage, header: &NetworkMessageHeader) -> Result<(Node, bool)> {
        let node_id = header.node_id.as_deref().ok_or(FederationError::MissingHeader(X_NODE_ID))?;
        let network_id = header
            .network_id
            .as_deref()
            .ok_or(FederationError::MissingHeader(X_NETWORK_ID))?;
        if network_id != message.network_id() {
            return Err(ProtocolError::NetworkIdMismatch {
                declared: message.network_id().to_string(),
                found: network_id.to_string(),
            }
            .into());
        }
        if node_id != message.node_id() {
            return Err(ProtocolError::NodeIdMismatch {
                declared: message.node_id().to_string(),
                found: node_id.to_string(),
            }
            .into());
        }

        match self.storage.load_node(network_id, node_id) {
            Ok(node) => Ok((node, false)),
            Err(e) if e.is_not_found() => Ok((self.stranger(message, node_id)?, true)),
            Err(e) => Err(e.into()),
        }
    }

    /// Record for a sender not in the store. Join requests and invitations
    /// carry one; an answer is only believed when it comes back for a
    /// request this instance sent to that node. Nothing but identity and
    /// key is taken from the carried record: strangers act as the
    /// anonymous user.
    fn stranger(&self, message: &NetworkMessage, node_id: &str) -> Result<Node> {
        let unknown = || FederationError::from(AuthFailure::UnknownNode(node_id.to_string()));
        let carried = match message {
            NetworkMessage::Auth(AuthMessage::Request(m)) | NetworkMessage::Auth(AuthMessage::Invite(m)) => &m.node,
            NetworkMessage::Auth(AuthMessage::Response(m)) => {
                let node = m.node().ok_or_else(unknown)?;
                if !self.is_solicited(message, node)? {
                    tracing::warn!(node_id, message_id = message.message_id(), "auth: unsolicited response");
                    return Err(AuthFailure::Unsolicited(message.message_id().to_string()).into());
                }
                node
            }
            _ => return Err(unknown()),
        };
        if carried.node_id != node_id {
            return Err(unknown());
        }
        Ok(Node {
            approved: false,
            score: 0.0,
            authentication_enabled: false,
            user_mapping: UserMapping::Static {
                user_id: ANONYMOUS_USER.to_string(),
            },
            client_id: String::new(),
            ..carried.clone()
        })
    }

    /// Whether `message` answers a handshake this instance opened with `node`.
    pub fn is_solicited(&self, message: &NetworkMessage, node: &Node) -> Result<bool> {
        match self.storage.load_handshake(message.message_id()) {
            Ok(handshake) => Ok(handshake.network_id == message.network_id() && handshake.answered_by(node)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// `Ok(None)` when the token could not be judged and the mapping
    /// fallback should run.
    async fn validate_token(
        &self,
        message: &NetworkMessage,
        header: &NetworkMessageHeader,
        node: &Node,
        token: &str,
    ) -> Result<Option<String>> {
        let Some(driver) = self.oidc.resolve(header.idp_iss.as_deref()) else {
            tracing::debug!(node_id = %node.node_id, "auth: no identity provider configured");
            return Ok(None);
        };
        let info = match driver.introspect_token(token).await {
            Ok(info) if info.active => info,
            Ok(_) => {
                tracing::debug!(node_id = %node.node_id, "auth: token not active");
                return Ok(None);
            }
            Err(e) => {
                tracing::debug!(node_id = %node.node_id, error = %e, "auth: introspection failed");
                return Ok(None);
            }
        };

        match info.client_id.as_deref() {
            Some(client_id) if client_id == node.client_id => {}
            None if self.config.allow_non_client_authenticated => {}
            found => {
                return Err(AuthFailure::ClientMismatch {
                    expected: node.client_id.clone(),
                    found: found.map(str::to_string),
                }
                .into())
            }
        }

        let service_account = info
            .preferred_username
            .as_deref()
            .is_some_and(|u| u.starts_with(SERVICE_ACCOUNT_PREFIX));
        match (message.message_type(), service_account) {
            (MessageType::Data, true) => return Err(AuthFailure::ServiceAccountForbidden.into()),
            (MessageType::Data, false) => {}
            (_, false) => return Err(AuthFailure::ServiceAccountRequired.into()),
            (_, true) => {}
        }

        if !node.authentication_enabled {
            self.enable_authentication(message.network_id(), &node.node_id)?;
        }
        Ok(info.sub)
    }

    /// Authentication stays on once a node has presented a valid token.
    fn enable_authentication(&self, network_id: &str, node_id: &str) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("authenticationEnabled".into(), true.into());
        match self.storage.update_node(network_id, node_id, &patch) {
            Ok(_) => {
                tracing::info!(network_id, node_id, "auth: authentication enabled for node");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remap_user(&self, network_id: &str, node: &Node, header: &NetworkMessageHeader) -> Result<String> {
        if node.authentication_enabled {
            return Err(AuthFailure::AuthenticationRequired.into());
        }

        let subject = match header.access_token.as_deref() {
            Some(token) => match self.oidc.resolve(header.idp_iss.as_deref()) {
                Some(driver) => match driver.validate_external(token, &node.client_id).await {
                    Ok(sub) => Some(sub),
                    Err(e) => {
                        tracing::debug!(node_id = %node.node_id, error = %e, "auth: external validation failed");
                        None
                    }
                },
                None => None,
            },
            None => None,
        };

        match node.user_mapping.remap(subject.as_deref()) {
            Ok(user_id) => Ok(user_id),
            Err(MappingError::MissingSubject) if self.config.anonymous_access => Ok(ANONYMOUS_USER.to_string()),
            Err(MappingError::UnknownSubject(subject)) if self.config.auto_user_registration => {
                self.register_user(network_id, node, &subject)
            }
            Err(e) => Err(AuthFailure::Mapping(e).into()),
        }
    }

    /// New local user for an unmapped subject, recorded in the node's
    /// dynamic mapping.
    fn register_user(&self, network_id: &str, node: &Node, subject: &str) -> Result<String> {
        let UserMapping::Dynamic { mapping } = &node.user_mapping else {
            return Err(AuthFailure::Mapping(MappingError::UnknownSubject(subject.to_string())).into());
        };
        let user_id = uuid::Uuid::new_v4().to_string();
        self.storage.store_user(&User::new(user_id.clone()))?;

        let mut mapping = mapping.clone();
        mapping.insert(subject.to_string(), user_id.clone());
        let mut patch = Map::new();
        patch.insert(
            "userMapping".into(),
            json!({"mappingType": "dynamic", "mapping": mapping}),
        );
        self.storage.update_node(network_id, &node.node_id, &patch)?;
        tracing::info!(network_id, node_id = %node.node_id, user_id, "auth: registered user for subject");
        Ok(user_id)
    }
}

fn check_timestamp(timestamp: i64, now: i64) -> Result<()> {
    if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        tracing::debug!(timestamp, now, "auth: timestamp outside tolerance");
        return Err(FederationError::Replay { timestamp, now });
    }
    Ok(())
}
