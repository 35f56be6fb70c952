//! Wire message types.
//!
//! One Rust type per concrete wire message, gathered under the
//! [`NetworkMessage`] sum type. Encoding and decoding live in
//! [`crate::codec`]; this module only holds the data and the invariants
//! enforced at construction.

use crate::header::NetworkMessageHeader;
use crate::model::{Network, Node};
use crate::ProtocolError;
use serde_json::{Map, Value};

/// Declares a string-valued wire enum with `as_str` and a checked parser.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            pub fn parse(value: &str) -> Result<Self, ProtocolError> {
                match value {
                    $($wire => Ok($name::$variant),)+
                    other => Err(ProtocolError::UnknownDiscriminator {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// Top-level discriminator (`messageType`).
    MessageType, "messageType" {
        Auth => "authMessage",
        Sync => "syncMessage",
        Data => "dataMessage",
        Relay => "relayMessage",
    }
);

wire_enum!(
    AuthMessageType, "authType" {
        Request => "request",
        Invite => "invite",
        Response => "response",
        Join => "join",
        Leave => "leave",
        Status => "status",
    }
);

wire_enum!(
    AuthMessageStatus, "status" {
        Sent => "sent",
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
    }
);

wire_enum!(
    SyncTarget, "targetType" {
        Node => "node",
        User => "user",
        Index => "index",
        Instance => "instance",
        FullSync => "fullSync",
        Poll => "poll",
    }
);

wire_enum!(
    DataMessageType, "dataType" {
        Query => "query",
        Response => "response",
    }
);

/// Hop budget given to relay envelopes built without an explicit TTL.
pub const DEFAULT_RELAY_TTL: u32 = 5;

// ============================================================================
// Common attributes
// ============================================================================

/// Identity attributes every message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub message_id: String,
    pub network_id: String,
    /// Sender.
    pub node_id: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
}

impl MessageMeta {
    /// Fresh random message ID, stamped now.
    pub fn new(network_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            network_id: network_id.into(),
            node_id: node_id.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

// ============================================================================
// Auth family
// ============================================================================

/// Join request (`request`) or invitation (`invite`).
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequestInvite {
    pub meta: MessageMeta,
    pub status: AuthMessageStatus,
    /// The party asking to join, or the inviting party.
    pub node: Node,
    pub target_url: String,
    pub challenge: Vec<String>,
    pub justification: String,
    network: Option<Network>,
}

impl AuthRequestInvite {
    pub fn request(
        meta: MessageMeta,
        node: Node,
        target_url: impl Into<String>,
        challenge: Vec<String>,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            meta,
            status: AuthMessageStatus::Sent,
            node,
            target_url: target_url.into(),
            challenge,
            justification: justification.into(),
            network: None,
        }
    }

    /// An invitation carries the inviting network, stripped of membership and
    /// instance identity. Its ID must match the message's `networkId`.
    pub fn invite(
        meta: MessageMeta,
        node: Node,
        target_url: impl Into<String>,
        challenge: Vec<String>,
        justification: impl Into<String>,
        network: &Network,
    ) -> Result<Self, ProtocolError> {
        if network.network_id != meta.network_id {
            return Err(ProtocolError::NetworkIdMismatch {
                declared: meta.network_id,
                found: network.network_id.clone(),
            });
        }
        Ok(Self {
            meta,
            status: AuthMessageStatus::Sent,
            node,
            target_url: target_url.into(),
            challenge,
            justification: justification.into(),
            network: Some(network.public_view()),
        })
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }
}

/// Answer to a request or invitation.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResponse {
    pub meta: MessageMeta,
    approved: bool,
    node: Option<Node>,
    network: Option<Network>,
}

impl AuthResponse {
    /// Approval must describe the responding node and the network joined.
    pub fn approved(meta: MessageMeta, node: Node, network: &Network) -> Result<Self, ProtocolError> {
        Self::build(meta, true, Some(node), Some(network.public_view()))
    }

    pub fn rejected(meta: MessageMeta) -> Self {
        Self {
            meta,
            approved: false,
            node: None,
            network: None,
        }
    }

    pub(crate) fn build(
        meta: MessageMeta,
        approved: bool,
        node: Option<Node>,
        network: Option<Network>,
    ) -> Result<Self, ProtocolError> {
        if approved {
            let node = node.as_ref().ok_or(ProtocolError::ApprovedWithoutNode)?;
            let network = network.as_ref().ok_or(ProtocolError::ApprovedWithoutNetwork)?;
            if node.node_id != meta.node_id {
                return Err(ProtocolError::NodeIdMismatch {
                    declared: meta.node_id,
                    found: node.node_id.clone(),
                });
            }
            if network.network_id != meta.network_id {
                return Err(ProtocolError::NetworkIdMismatch {
                    declared: meta.network_id,
                    found: network.network_id.clone(),
                });
            }
        }
        Ok(Self {
            meta,
            approved,
            node: if approved { node } else { None },
            network: if approved { network } else { None },
        })
    }

    pub fn is_approved(&self) -> bool {
        self.approved
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }
}

/// Announces a new member to existing members.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthJoin {
    pub meta: MessageMeta,
    pub node: Node,
}

/// Announces the sender's departure.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthLeave {
    pub meta: MessageMeta,
}

/// Polls (`status == None`) or reports a handshake outcome. The message ID
/// is that of the request being tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthStatus {
    pub meta: MessageMeta,
    pub status: Option<AuthMessageStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthMessage {
    Request(AuthRequestInvite),
    Invite(AuthRequestInvite),
    Response(AuthResponse),
    Join(AuthJoin),
    Leave(AuthLeave),
    Status(AuthStatus),
}

impl AuthMessage {
    pub fn auth_type(&self) -> AuthMessageType {
        match self {
            AuthMessage::Request(_) => AuthMessageType::Request,
            AuthMessage::Invite(_) => AuthMessageType::Invite,
            AuthMessage::Response(_) => AuthMessageType::Response,
            AuthMessage::Join(_) => AuthMessageType::Join,
            AuthMessage::Leave(_) => AuthMessageType::Leave,
            AuthMessage::Status(_) => AuthMessageType::Status,
        }
    }

    pub fn meta(&self) -> &MessageMeta {
        match self {
            AuthMessage::Request(m) | AuthMessage::Invite(m) => &m.meta,
            AuthMessage::Response(m) => &m.meta,
            AuthMessage::Join(m) => &m.meta,
            AuthMessage::Leave(m) => &m.meta,
            AuthMessage::Status(m) => &m.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut MessageMeta {
        match self {
            AuthMessage::Request(m) | AuthMessage::Invite(m) => &mut m.meta,
            AuthMessage::Response(m) => &mut m.meta,
            AuthMessage::Join(m) => &mut m.meta,
            AuthMessage::Leave(m) => &mut m.meta,
            AuthMessage::Status(m) => &mut m.meta,
        }
    }
}

// ============================================================================
// Sync
// ============================================================================

/// One element of a sync payload: a typed node, or any other record kept as
/// its raw JSON object.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncItem {
    Node(Node),
    Raw(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub meta: MessageMeta,
    pub target_type: SyncTarget,
    pub data: Option<Vec<SyncItem>>,
}

impl SyncMessage {
    pub fn new(meta: MessageMeta, target_type: SyncTarget, data: Option<Vec<SyncItem>>) -> Self {
        Self {
            meta,
            target_type,
            data,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.data.iter().flatten().filter_map(|item| match item {
            SyncItem::Node(n) => Some(n),
            SyncItem::Raw(_) => None,
        })
    }
}

// ============================================================================
// Data
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub meta: MessageMeta,
    pub data_type: DataMessageType,
    /// The user on whose behalf the query runs, or to whom the response is
    /// addressed.
    pub user_id: String,
    pub should_relay: bool,
    /// Opaque application payload. Response items may be sealed for the user.
    pub data: Value,
}

impl DataMessage {
    pub fn query(meta: MessageMeta, user_id: impl Into<String>, query: Value) -> Self {
        Self {
            meta,
            data_type: DataMessageType::Query,
            user_id: user_id.into(),
            should_relay: true,
            data: query,
        }
    }

    pub fn response(meta: MessageMeta, user_id: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            meta,
            data_type: DataMessageType::Response,
            user_id: user_id.into(),
            should_relay: true,
            data: Value::Array(items),
        }
    }

    /// Number of items in a response payload.
    pub fn record_count(&self) -> Option<u64> {
        match (&self.data_type, &self.data) {
            (DataMessageType::Response, Value::Array(items)) => Some(items.len() as u64),
            _ => None,
        }
    }
}

// ============================================================================
// Relay
// ============================================================================

/// One enveloped message and the recipients it is for.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayTarget {
    recipient_ids: Vec<String>,
    header: NetworkMessageHeader,
    message: Box<NetworkMessage>,
}

impl RelayTarget {
    /// Relays nest exactly one level: an envelope may not hold another relay.
    pub fn new(
        recipient_ids: Vec<String>,
        header: NetworkMessageHeader,
        message: NetworkMessage,
    ) -> Result<Self, ProtocolError> {
        if message.message_type() == MessageType::Relay {
            return Err(ProtocolError::EnvelopeTooDeep);
        }
        Ok(Self {
            recipient_ids,
            header,
            message: Box::new(message),
        })
    }

    pub fn recipient_ids(&self) -> &[String] {
        &self.recipient_ids
    }

    pub fn header(&self) -> &NetworkMessageHeader {
        &self.header
    }

    pub fn message(&self) -> &NetworkMessage {
        &self.message
    }

    pub fn is_for(&self, node_id: &str) -> bool {
        self.recipient_ids.iter().any(|r| r == node_id)
    }

    pub fn into_parts(self) -> (Vec<String>, NetworkMessageHeader, NetworkMessage) {
        (self.recipient_ids, self.header, *self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    pub meta: MessageMeta,
    ttl: u32,
    relay_targets: Vec<RelayTarget>,
}

impl RelayMessage {
    /// A relay with no hops left is dead on arrival.
    pub fn new(meta: MessageMeta, relay_targets: Vec<RelayTarget>, ttl: u32) -> Result<Self, ProtocolError> {
        if ttl == 0 {
            return Err(ProtocolError::RelayNotAlive { ttl: 0 });
        }
        Ok(Self {
            meta,
            ttl,
            relay_targets,
        })
    }

    /// Envelope for a single message addressed to `recipient_ids`.
    pub fn wrap(
        meta: MessageMeta,
        recipient_ids: Vec<String>,
        header: NetworkMessageHeader,
        message: NetworkMessage,
        ttl: u32,
    ) -> Result<Self, ProtocolError> {
        let target = RelayTarget::new(recipient_ids, header, message)?;
        Self::new(meta, vec![target], ttl)
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn relay_targets(&self) -> &[RelayTarget] {
        &self.relay_targets
    }

    pub fn into_targets(self) -> Vec<RelayTarget> {
        self.relay_targets
    }

    /// All recipients across targets, in order, without duplicates.
    pub fn recipient_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for id in self.relay_targets.iter().flat_map(|t| t.recipient_ids.iter()) {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }

    /// Same envelope narrowed to `keep`. Targets left without recipients
    /// are dropped.
    pub fn only_for(&self, keep: &[String]) -> Result<Self, ProtocolError> {
        let mut targets = Vec::new();
        for target in &self.relay_targets {
            let recipients: Vec<String> = target.recipient_ids.iter().filter(|r| keep.contains(r)).cloned().collect();
            if !recipients.is_empty() {
                targets.push(RelayTarget::new(recipients, target.header.clone(), (*target.message).clone())?);
            }
        }
        Self::new(self.meta.clone(), targets, self.ttl)
    }

    /// The envelope as re-sent by `node_id` one hop further on.
    pub fn forwarded(&self, node_id: &str, relay_targets: Vec<RelayTarget>) -> Result<Self, ProtocolError> {
        let ttl = self.ttl.saturating_sub(1);
        if ttl == 0 {
            return Err(ProtocolError::RelayNotAlive { ttl: 0 });
        }
        let mut meta = MessageMeta::new(self.meta.network_id.clone(), node_id);
        meta.message_id = self.meta.message_id.clone();
        Self::new(meta, relay_targets, ttl)
    }
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    Auth(AuthMessage),
    Sync(SyncMessage),
    Data(DataMessage),
    Relay(RelayMessage),
}

impl NetworkMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            NetworkMessage::Auth(_) => MessageType::Auth,
            NetworkMessage::Sync(_) => MessageType::Sync,
            NetworkMessage::Data(_) => MessageType::Data,
            NetworkMessage::Relay(_) => MessageType::Relay,
        }
    }

    pub fn meta(&self) -> &MessageMeta {
        match self {
            NetworkMessage::Auth(m) => m.meta(),
            NetworkMessage::Sync(m) => &m.meta,
            NetworkMessage::Data(m) => &m.meta,
            NetworkMessage::Relay(m) => &m.meta,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.meta().message_id
    }

    pub fn network_id(&self) -> &str {
        &self.meta().network_id
    }

    pub fn node_id(&self) -> &str {
        &self.meta().node_id
    }

    pub fn timestamp(&self) -> i64 {
        self.meta().timestamp
    }

    /// The only mutation allowed after construction: giving each recipient of
    /// a broadcast a distinct message ID.
    pub fn set_message_id(&mut self, message_id: impl Into<String>) {
        let meta = match self {
            NetworkMessage::Auth(m) => m.meta_mut(),
            NetworkMessage::Sync(m) => &mut m.meta,
            NetworkMessage::Data(m) => &mut m.meta,
            NetworkMessage::Relay(m) => &mut m.meta,
        };
        meta.message_id = message_id.into();
    }

    /// Data messages carry their own relay permission; every other family
    /// may always be relayed.
    pub fn should_relay(&self) -> bool {
        match self {
            NetworkMessage::Data(m) => m.should_relay,
            _ => true,
        }
    }
}

impl From<AuthMessage> for NetworkMessage {
    fn from(m: AuthMessage) -> Self {
        NetworkMessage::Auth(m)
    }
}

impl From<SyncMessage> for NetworkMessage {
    fn from(m: SyncMessage) -> Self {
        NetworkMessage::Sync(m)
    }
}

impl From<DataMessage> for NetworkMessage {
    fn from(m: DataMessage) -> Self {
        NetworkMessage::Data(m)
    }
}

impl From<RelayMessage> for NetworkMessage {
    fn from(m: RelayMessage) -> Self {
        NetworkMessage::Relay(m)
    }
}
