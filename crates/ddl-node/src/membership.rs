//! Handlers the node installs by default.
//!
//! Auth messages keep the member list: a join request parks the caller as
//! an unapproved node for the operator to review, an approval of one of our
//! own requests stores the responder, `join` and `leave` add and drop
//! members. Sync messages
//! exchange member lists, data indexes and the public network record.
//! This instance holds no data of its own, so queries get empty answers.

use async_trait::async_trait;
use ddl_federation::{
    vote_from_responses, AuthHandler, DataHandler, Handlers, NetworkInterface, PendingSync, Result,
    SendOptions, SyncHandler,
};
use ddl_protocol::{
    AuthMessage, AuthMessageStatus, AuthStatus, DataIndex, DataMessage, DataMessageType, NetworkMessage,
    NetworkMessageHeader, Node, SyncItem, SyncMessage, SyncTarget, UserMapping,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Handler set used by `ddl-node run`.
pub fn node_handlers() -> Handlers {
    Handlers {
        auth: Arc::new(MembershipAuth),
        sync: Arc::new(PendingSync::new(Arc::new(MembershipSync))),
        data: Arc::new(EmptyData),
        ..Handlers::default()
    }
}

/// What another member may learn about a node from us: local policy and
/// our opinion of it stay here.
pub fn shareable(node: &Node) -> Node {
    Node {
        score: 0.0,
        authentication_enabled: false,
        user_mapping: UserMapping::default(),
        client_id: String::new(),
        ..node.clone()
    }
}

// ============================================================================
// Auth
// ============================================================================

pub struct MembershipAuth;

impl MembershipAuth {
    fn status_reply(iface: &NetworkInterface, message_id: &str, status: AuthMessageStatus) -> NetworkMessage {
        AuthMessage::Status(AuthStatus {
            meta: iface.new_meta().with_id(message_id),
            status: Some(status),
        })
        .into()
    }

    /// Where the handshake with `node_id` stands from this side.
    fn standing(iface: &NetworkInterface, node_id: &str) -> Result<AuthMessageStatus> {
        match iface.storage().load_node(iface.network_id(), node_id) {
            Ok(node) if node.approved => Ok(AuthMessageStatus::Accepted),
            Ok(_) => Ok(AuthMessageStatus::Pending),
            Err(e) if e.is_not_found() => Ok(AuthMessageStatus::Rejected),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AuthHandler for MembershipAuth {
    async fn handle_auth(
        &self,
        iface: &NetworkInterface,
        message: AuthMessage,
        _header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>> {
        let network_id = iface.network_id();
        let storage = iface.storage();
        match message {
            AuthMessage::Request(request) => {
                let node_id = request.node.node_id.clone();
                let status = match Self::standing(iface, &node_id)? {
                    AuthMessageStatus::Rejected => {
                        let node = Node {
                            approved: false,
                            ..shareable(&request.node)
                        };
                        storage.store_node(network_id, &node)?;
                        tracing::info!(
                            network_id,
                            node_id,
                            challenge = %request.challenge.join(" "),
                            justification = %request.justification,
                            "node: join request awaiting approval"
                        );
                        AuthMessageStatus::Pending
                    }
                    standing => standing,
                };
                Ok(Some(Self::status_reply(iface, &request.meta.message_id, status)))
            }
            AuthMessage::Invite(invite) => {
                tracing::info!(
                    network_id,
                    from = %invite.meta.node_id,
                    challenge = %invite.challenge.join(" "),
                    "node: invitation received"
                );
                Ok(None)
            }
            AuthMessage::Response(response) => {
                let message_id = response.meta.message_id.as_str();
                let from = response.meta.node_id.as_str();
                let handshake = match storage.load_handshake(message_id) {
                    Ok(handshake) if handshake.network_id == network_id => handshake,
                    Ok(_) => {
                        tracing::warn!(network_id, from, message_id, "node: response for another network");
                        return Ok(None);
                    }
                    Err(e) if e.is_not_found() => {
                        tracing::warn!(network_id, from, message_id, "node: unsolicited response ignored");
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };
                match response.node() {
                    Some(node) if response.is_approved() => {
                        if !handshake.answered_by(node) {
                            tracing::warn!(network_id, from, message_id, "node: response from a node we did not ask");
                            return Ok(None);
                        }
                        let node = match storage.load_node(network_id, &node.node_id) {
                            Ok(known) => Node { approved: true, ..known },
                            Err(e) if e.is_not_found() => Node {
                                approved: true,
                                ..shareable(node)
                            },
                            Err(e) => return Err(e.into()),
                        };
                        storage.store_node(network_id, &node)?;
                        tracing::info!(network_id, node_id = %node.node_id, "node: join approved");
                    }
                    _ => tracing::info!(network_id, from, "node: join rejected"),
                }
                storage.delete_handshake(message_id)?;
                Ok(None)
            }
            AuthMessage::Join(join) => {
                let announcer = storage.load_node(network_id, &join.meta.node_id)?;
                if !announcer.approved {
                    tracing::warn!(network_id, from = %announcer.node_id, "node: join announced by unapproved node");
                    return Ok(None);
                }
                if join.node.node_id == iface.instance_id() {
                    return Ok(None);
                }
                let node = Node {
                    approved: true,
                    score: 0.0,
                    ..join.node
                };
                storage.store_node(network_id, &node)?;
                tracing::info!(network_id, node_id = %node.node_id, "node: member joined");
                Ok(None)
            }
            AuthMessage::Leave(leave) => {
                if storage.delete_node(network_id, &leave.meta.node_id)? {
                    tracing::info!(network_id, node_id = %leave.meta.node_id, "node: member left");
                }
                Ok(None)
            }
            AuthMessage::Status(status) => match status.status {
                None => {
                    let standing = Self::standing(iface, &status.meta.node_id)?;
                    Ok(Some(Self::status_reply(iface, &status.meta.message_id, standing)))
                }
                Some(reported) => {
                    tracing::info!(network_id, from = %status.meta.node_id, status = %reported, "node: handshake status");
                    Ok(None)
                }
            },
        }
    }
}

// ============================================================================
// Sync
// ============================================================================

pub struct MembershipSync;

fn raw(key: &str, value: Value) -> SyncItem {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    SyncItem::Raw(map)
}

#[async_trait]
impl SyncHandler for MembershipSync {
    async fn handle_sync(
        &self,
        iface: &NetworkInterface,
        message: SyncMessage,
        _header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>> {
        let network_id = iface.network_id();
        let reply = |items: Vec<SyncItem>| -> Option<NetworkMessage> {
            let meta = iface.new_meta().with_id(message.meta.message_id.clone());
            Some(SyncMessage::new(meta, message.target_type, Some(items)).into())
        };

        match (message.target_type, &message.data) {
            (SyncTarget::Node, None) => {
                let items = iface
                    .storage()
                    .approved_nodes(network_id)?
                    .iter()
                    .filter(|n| n.node_id != message.meta.node_id)
                    .map(|n| SyncItem::Node(shareable(n)))
                    .collect();
                Ok(reply(items))
            }
            (SyncTarget::Node, Some(_)) => {
                let mut learned = 0;
                for node in message.nodes() {
                    if node.node_id == iface.instance_id() {
                        continue;
                    }
                    match iface.storage().load_node(network_id, &node.node_id) {
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {
                            let candidate = Node {
                                approved: false,
                                ..shareable(node)
                            };
                            iface.storage().store_node(network_id, &candidate)?;
                            learned += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                tracing::debug!(network_id, from = %message.meta.node_id, learned, "node: member list received");
                Ok(None)
            }
            (SyncTarget::Index, None) => {
                let index = serde_json::to_value(iface.network_data_index()?).unwrap_or(Value::Null);
                Ok(reply(vec![raw("dataIndex", index)]))
            }
            (SyncTarget::Index, Some(items)) => {
                let index = items.iter().find_map(|item| match item {
                    SyncItem::Raw(map) => map.get("dataIndex").cloned(),
                    SyncItem::Node(_) => None,
                });
                if let Some(index) = index.filter(|v| serde_json::from_value::<DataIndex>(v.clone()).is_ok()) {
                    let mut patch = Map::new();
                    patch.insert("dataIndex".into(), index);
                    iface.storage().update_node(network_id, &message.meta.node_id, &patch)?;
                }
                Ok(None)
            }
            (SyncTarget::Instance, None) => {
                let network = iface.storage().load_network(network_id)?;
                Ok(reply(vec![raw("network", network.to_public_value())]))
            }
            (target, _) => {
                tracing::debug!(network_id, target = %target, "node: sync target not served");
                Ok(None)
            }
        }
    }
}

/// Ask every reachable member for its member list and take in the nodes we
/// do not know yet. A node is adopted in the form most members agree on,
/// and unapproved: the operator decides who joins.
pub async fn sync_members(iface: &NetworkInterface) -> Result<usize> {
    let opts = SendOptions {
        should_relay: false,
        ..SendOptions::default()
    };
    let mut lists: Vec<Vec<Node>> = Vec::new();
    for member in iface.storage().approved_nodes(iface.network_id())? {
        if member.node_id == iface.instance_id() {
            continue;
        }
        let request: NetworkMessage = SyncMessage::new(iface.new_meta(), SyncTarget::Node, None).into();
        match iface.send_message(&member, &request, &opts).await {
            Ok(Some((NetworkMessage::Sync(sync), _))) => lists.push(sync.nodes().cloned().collect()),
            Ok(_) => {}
            Err(e) => tracing::debug!(node_id = %member.node_id, error = %e, "node: member list unavailable"),
        }
    }
    let candidates: BTreeSet<String> = lists.iter().flatten().map(|n| n.node_id.clone()).collect();

    let mut adopted = 0;
    for node_id in candidates {
        if node_id == iface.instance_id() {
            continue;
        }
        match iface.storage().load_node(iface.network_id(), &node_id) {
            Ok(_) => continue,
            Err(e) if !e.is_not_found() => return Err(e.into()),
            Err(_) => {}
        }
        let Some(winner) = vote_from_responses(&lists, "nodeId", &Value::String(node_id)) else {
            continue;
        };
        let node = Node {
            approved: false,
            ..shareable(&winner)
        };
        iface.storage().store_node(iface.network_id(), &node)?;
        tracing::info!(network_id = iface.network_id(), node_id = %node.node_id, "node: member learned from peers");
        adopted += 1;
    }
    Ok(adopted)
}

// ============================================================================
// Data
// ============================================================================

/// Answers queries with no records.
pub struct EmptyData;

#[async_trait]
impl DataHandler for EmptyData {
    async fn handle_data(
        &self,
        iface: &NetworkInterface,
        message: DataMessage,
        header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>> {
        if message.data_type != DataMessageType::Query {
            return Ok(None);
        }
        let meta = iface.new_meta().with_id(message.meta.message_id);
        let user_id = header.user_id.clone().unwrap_or(message.user_id);
        Ok(Some(DataMessage::response(meta, user_id, Vec::new()).into()))
    }
}
