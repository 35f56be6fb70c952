//! JSON wire codec.
//!
//! Wire format:
//! `{"messageType", "messageAttributes": {...}, "messageData": ..., "timestamp"}`.
//! Key order is insertion order and is part of the contract: the canonical
//! payload that gets signed is the compact serialisation of [`encode`].

use serde_json::{Map, Value};

use crate::header::NetworkMessageHeader;
use crate::messages::*;
use crate::model::{Network, Node};
use crate::ProtocolError;

pub const MESSAGE_TYPE: &str = "messageType";
pub const MESSAGE_ATTRIBUTES: &str = "messageAttributes";
pub const MESSAGE_DATA: &str = "messageData";
pub const TIMESTAMP: &str = "timestamp";

/// Maximum accepted body size (8 MiB); the HTTP body limit uses it too.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

type Result<T> = std::result::Result<T, ProtocolError>;

// ============================================================================
// Encode
// ============================================================================

pub fn encode(message: &NetworkMessage) -> Value {
    let meta = message.meta();
    let mut root = Map::new();
    root.insert(MESSAGE_TYPE.into(), message.message_type().as_str().into());

    let mut attrs = Map::new();
    attrs.insert("messageId".into(), meta.message_id.clone().into());
    attrs.insert("networkId".into(), meta.network_id.clone().into());
    attrs.insert("nodeId".into(), meta.node_id.clone().into());

    let data = match message {
        NetworkMessage::Auth(m) => encode_auth(m, &mut attrs),
        NetworkMessage::Sync(m) => {
            attrs.insert("targetType".into(), m.target_type.as_str().into());
            m.data.as_ref().map(|items| {
                Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            SyncItem::Node(n) => node_value(n),
                            SyncItem::Raw(raw) => Value::Object(raw.clone()),
                        })
                        .collect(),
                )
            })
        }
        NetworkMessage::Data(m) => {
            attrs.insert("dataType".into(), m.data_type.as_str().into());
            attrs.insert("shouldRelay".into(), m.should_relay.into());
            attrs.insert("userId".into(), m.user_id.clone().into());
            Some(m.data.clone())
        }
        NetworkMessage::Relay(m) => {
            attrs.insert("ttl".into(), m.ttl().into());
            let targets: Vec<Value> = m
                .relay_targets()
                .iter()
                .map(|t| {
                    let mut target = Map::new();
                    target.insert("recipientIds".into(), t.recipient_ids().to_vec().into());
                    target.insert("header".into(), Value::Object(t.header().to_map()));
                    target.insert("message".into(), encode(t.message()));
                    Value::Object(target)
                })
                .collect();
            let mut data = Map::new();
            data.insert("relayTargets".into(), Value::Array(targets));
            Some(Value::Object(data))
        }
    };

    root.insert(MESSAGE_ATTRIBUTES.into(), Value::Object(attrs));
    if let Some(data) = data {
        root.insert(MESSAGE_DATA.into(), data);
    }
    root.insert(TIMESTAMP.into(), meta.timestamp.into());
    Value::Object(root)
}

fn encode_auth(message: &AuthMessage, attrs: &mut Map<String, Value>) -> Option<Value> {
    attrs.insert("authType".into(), message.auth_type().as_str().into());
    match message {
        AuthMessage::Request(m) | AuthMessage::Invite(m) => {
            attrs.insert("targetUrl".into(), m.target_url.clone().into());
            attrs.insert("status".into(), m.status.as_str().into());
            let mut data = Map::new();
            data.insert("node".into(), node_value(&m.node));
            data.insert("challenge".into(), m.challenge.clone().into());
            if let Some(network) = m.network() {
                data.insert("network".into(), network.to_public_value());
            }
            if !m.justification.is_empty() {
                data.insert("justification".into(), m.justification.clone().into());
            }
            Some(Value::Object(data))
        }
        AuthMessage::Response(m) => {
            attrs.insert("approved".into(), m.is_approved().into());
            let mut data = Map::new();
            if let Some(node) = m.node() {
                data.insert("node".into(), node_value(node));
            }
            if let Some(network) = m.network() {
                data.insert("network".into(), network.to_public_value());
            }
            if data.is_empty() {
                None
            } else {
                Some(Value::Object(data))
            }
        }
        AuthMessage::Join(m) => {
            let mut data = Map::new();
            data.insert("node".into(), node_value(&m.node));
            Some(Value::Object(data))
        }
        AuthMessage::Leave(_) => None,
        AuthMessage::Status(m) => {
            if let Some(status) = m.status {
                attrs.insert("status".into(), status.as_str().into());
            }
            None
        }
    }
}

fn node_value(node: &Node) -> Value {
    serde_json::to_value(node).unwrap_or(Value::Null)
}

/// Bytes that get signed and verified.
pub fn canonical_payload(message: &NetworkMessage) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&encode(message))?)
}

pub fn to_vec(message: &NetworkMessage) -> Result<Vec<u8>> {
    canonical_payload(message)
}

// ============================================================================
// Decode
// ============================================================================

/// Decode a body received off the wire.
pub fn from_slice(bytes: &[u8]) -> Result<NetworkMessage> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let value: Value = serde_json::from_slice(bytes)?;
    decode(&value)
}

/// Discriminator chain: `messageType` picks the family, then `authType` or
/// `dataType` picks the concrete variant. Unknown values are errors.
pub fn decode(value: &Value) -> Result<NetworkMessage> {
    let root = as_object(value, "message")?;
    let message_type = MessageType::parse(&required_str(root, MESSAGE_TYPE)?)?;
    let attrs = as_object(required(root, MESSAGE_ATTRIBUTES)?, MESSAGE_ATTRIBUTES)?;
    let data = root.get(MESSAGE_DATA);

    let meta = MessageMeta {
        message_id: required_str(attrs, "messageId")?,
        network_id: required_str(attrs, "networkId")?,
        node_id: required_str(attrs, "nodeId")?,
        timestamp: required_i64(root, TIMESTAMP)?,
    };

    let message = match message_type {
        MessageType::Auth => NetworkMessage::Auth(decode_auth(meta, attrs, data)?),
        MessageType::Sync => {
            let target_type = SyncTarget::parse(&required_str(attrs, "targetType")?)?;
            let items = match data {
                None | Some(Value::Null) => None,
                Some(Value::Array(items)) => Some(
                    items
                        .iter()
                        .map(decode_sync_item)
                        .collect::<Result<Vec<_>>>()?,
                ),
                Some(_) => return Err(invalid(MESSAGE_DATA, "expected an array")),
            };
            NetworkMessage::Sync(SyncMessage::new(meta, target_type, items))
        }
        MessageType::Data => {
            let data_type = DataMessageType::parse(&required_str(attrs, "dataType")?)?;
            NetworkMessage::Data(DataMessage {
                meta,
                data_type,
                user_id: required_str(attrs, "userId")?,
                should_relay: required_bool(attrs, "shouldRelay")?,
                data: data.cloned().unwrap_or(Value::Null),
            })
        }
        MessageType::Relay => {
            let ttl = required_i64(attrs, "ttl")?;
            if ttl <= 0 {
                return Err(ProtocolError::RelayNotAlive { ttl });
            }
            let ttl = u32::try_from(ttl).map_err(|_| invalid("ttl", "out of range"))?;
            let data = as_object(required_data(data)?, MESSAGE_DATA)?;
            let targets = match required(data, "relayTargets")? {
                Value::Array(items) => items
                    .iter()
                    .map(decode_relay_target)
                    .collect::<Result<Vec<_>>>()?,
                _ => return Err(invalid("relayTargets", "expected an array")),
            };
            NetworkMessage::Relay(RelayMessage::new(meta, targets, ttl)?)
        }
    };

    tracing::trace!(
        message_id = %message.message_id(),
        message_type = %message.message_type(),
        "proto: decoded message"
    );
    Ok(message)
}

fn decode_auth(meta: MessageMeta, attrs: &Map<String, Value>, data: Option<&Value>) -> Result<AuthMessage> {
    let auth_type = AuthMessageType::parse(&required_str(attrs, "authType")?)?;
    match auth_type {
        AuthMessageType::Request | AuthMessageType::Invite => {
            let data = as_object(required_data(data)?, MESSAGE_DATA)?;
            let status = AuthMessageStatus::parse(&required_str(attrs, "status")?)?;
            let target_url = required_str(attrs, "targetUrl")?;
            let node = decode_node(required(data, "node")?)?;
            let challenge = match required(data, "challenge")? {
                Value::Array(words) => words
                    .iter()
                    .map(|w| {
                        w.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| invalid("challenge", "expected strings"))
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => return Err(invalid("challenge", "expected an array")),
            };
            let justification = optional_str(data, "justification")?.unwrap_or_default();
            let network = data.get("network").map(decode_network).transpose()?;

            let mut message = match (auth_type, network) {
                (AuthMessageType::Invite, Some(network)) => {
                    AuthRequestInvite::invite(meta, node, target_url, challenge, justification, &network)?
                }
                (AuthMessageType::Invite, None) => return Err(missing("network")),
                (_, Some(_)) => return Err(invalid("network", "only invitations carry a network")),
                (_, None) => AuthRequestInvite::request(meta, node, target_url, challenge, justification),
            };
            message.status = status;
            Ok(match auth_type {
                AuthMessageType::Invite => AuthMessage::Invite(message),
                _ => AuthMessage::Request(message),
            })
        }
        AuthMessageType::Response => {
            let approved = required_bool(attrs, "approved")?;
            let data = match data {
                Some(Value::Object(map)) => Some(map),
                None | Some(Value::Null) => None,
                Some(_) => return Err(invalid(MESSAGE_DATA, "expected an object")),
            };
            let node = data
                .and_then(|d| d.get("node"))
                .map(decode_node)
                .transpose()?;
            let network = data
                .and_then(|d| d.get("network"))
                .map(decode_network)
                .transpose()?;
            Ok(AuthMessage::Response(AuthResponse::build(meta, approved, node, network)?))
        }
        AuthMessageType::Join => {
            let data = as_object(required_data(data)?, MESSAGE_DATA)?;
            let node = decode_node(required(data, "node")?)?;
            Ok(AuthMessage::Join(AuthJoin { meta, node }))
        }
        AuthMessageType::Leave => Ok(AuthMessage::Leave(AuthLeave { meta })),
        AuthMessageType::Status => {
            let status = optional_str(attrs, "status")?
                .map(|s| AuthMessageStatus::parse(&s))
                .transpose()?;
            Ok(AuthMessage::Status(AuthStatus { meta, status }))
        }
    }
}

/// Objects with a `nodeId` are nodes; everything else stays raw.
fn decode_sync_item(value: &Value) -> Result<SyncItem> {
    let map = as_object(value, "sync item")?;
    if map.contains_key("nodeId") {
        Ok(SyncItem::Node(decode_node(value)?))
    } else {
        Ok(SyncItem::Raw(map.clone()))
    }
}

fn decode_relay_target(value: &Value) -> Result<RelayTarget> {
    let map = as_object(value, "relay target")?;
    let recipient_ids = match required(map, "recipientIds")? {
        Value::Array(ids) => ids
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid("recipientIds", "expected strings"))
            })
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(invalid("recipientIds", "expected an array")),
    };
    let header = NetworkMessageHeader::from_map(as_object(required(map, "header")?, "header")?);
    let message = decode(required(map, "message")?)?;
    RelayTarget::new(recipient_ids, header, message)
}

fn decode_node(value: &Value) -> Result<Node> {
    serde_json::from_value(value.clone()).map_err(|e| invalid("node", &e.to_string()))
}

fn decode_network(value: &Value) -> Result<Network> {
    serde_json::from_value(value.clone()).map_err(|e| invalid("network", &e.to_string()))
}

// ============================================================================
// Field helpers
// ============================================================================

fn missing(field: &str) -> ProtocolError {
    ProtocolError::MissingField(field.to_string())
}

fn invalid(field: &str, reason: &str) -> ProtocolError {
    ProtocolError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| invalid(what, "expected an object"))
}

fn required<'a>(map: &'a Map<String, Value>, field: &str) -> Result<&'a Value> {
    map.get(field).ok_or_else(|| missing(field))
}

fn required_data(data: Option<&Value>) -> Result<&Value> {
    match data {
        None | Some(Value::Null) => Err(missing(MESSAGE_DATA)),
        Some(v) => Ok(v),
    }
}

fn required_str(map: &Map<String, Value>, field: &str) -> Result<String> {
    required(map, field)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(field, "expected a string"))
}

fn optional_str(map: &Map<String, Value>, field: &str) -> Result<Option<String>> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(field, "expected a string")),
    }
}

fn required_bool(map: &Map<String, Value>, field: &str) -> Result<bool> {
    required(map, field)?
        .as_bool()
        .ok_or_else(|| invalid(field, "expected a boolean"))
}

fn required_i64(map: &Map<String, Value>, field: &str) -> Result<i64> {
    required(map, field)?
        .as_i64()
        .ok_or_else(|| invalid(field, "expected an integer"))
}
