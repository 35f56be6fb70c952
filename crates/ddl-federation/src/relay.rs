//! Default relay and poll handling.

use async_trait::async_trait;
use ddl_protocol::{
    MessageType, NetworkMessage, NetworkMessageHeader, RelayMessage, RelayTarget, SyncItem, SyncMessage, SyncTarget,
};
use serde_json::Value;
use std::sync::Arc;

use crate::handlers::{RelayHandler, RelayReceipt, SyncHandler};
use crate::interface::{BroadcastOptions, Exchange, NetworkInterface};
use crate::Result;

/// Delivers relay targets addressed to this instance, forwards the ones it
/// can reach directly and re-broadcasts the rest with one hop less. The
/// receipt lists every recipient reached here or further on.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardingRelay;

#[async_trait]
impl RelayHandler for ForwardingRelay {
    async fn handle_relay(
        &self,
        iface: &NetworkInterface,
        message: RelayMessage,
        _header: &NetworkMessageHeader,
    ) -> Result<Option<RelayReceipt>> {
        let message_id = message.meta.message_id.clone();
        let sender = message.meta.node_id.clone();
        let mut delivered_to: Vec<String> = Vec::new();
        let mut first_reply: Option<Exchange> = None;
        let mut onward = Vec::new();

        for target in message.relay_targets() {
            let mut remaining = Vec::new();
            for recipient in target.recipient_ids() {
                let outcome = if recipient == iface.instance_id() {
                    iface
                        .receive_relayed(target.message().clone(), target.header().clone(), true)
                        .await
                        .map(Some)
                } else {
                    forward_if_reachable(iface, recipient, target).await
                };
                match outcome {
                    Ok(Some(reply)) => {
                        if !delivered_to.contains(recipient) {
                            delivered_to.push(recipient.clone());
                        }
                        if first_reply.is_none() {
                            first_reply = reply;
                        }
                    }
                    Ok(None) => remaining.push(recipient.clone()),
                    Err(e) => {
                        tracing::warn!(message_id, recipient, error = %e, "relay: delivery failed");
                        if recipient != iface.instance_id() {
                            remaining.push(recipient.clone());
                        }
                    }
                }
            }
            if !remaining.is_empty() {
                onward.push(RelayTarget::new(remaining, target.header().clone(), target.message().clone())?);
            }
        }

        if !onward.is_empty() {
            if message.ttl() > 1 {
                let next = message.forwarded(iface.instance_id(), onward)?;
                tracing::debug!(message_id, ttl = next.ttl(), "relay: forwarding onwards");
                let responses = iface
                    .broadcast_message(&NetworkMessage::Relay(next), &BroadcastOptions::default(), &[sender.clone()])
                    .await?;
                for id in responses.into_iter().flat_map(|(_, h)| h.delivered_to) {
                    if !delivered_to.contains(&id) {
                        delivered_to.push(id);
                    }
                }
            } else {
                tracing::debug!(message_id, "relay: ttl exhausted");
            }
        }

        if delivered_to.is_empty() {
            return Ok(None);
        }
        // Replies are never envelopes themselves.
        let targets = match first_reply {
            Some((reply, header)) if reply.message_type() != MessageType::Relay => {
                vec![RelayTarget::new(vec![sender], header, reply)?]
            }
            _ => Vec::new(),
        };
        let reply = RelayMessage::new(iface.new_meta().with_id(message_id), targets, 1)?;
        Ok(Some(RelayReceipt { reply, delivered_to }))
    }
}

/// `Ok(Some(reply))` once the recipient took the message, `Ok(None)` when
/// it cannot be reached from here.
async fn forward_if_reachable(
    iface: &NetworkInterface,
    recipient: &str,
    target: &RelayTarget,
) -> Result<Option<Option<Exchange>>> {
    let node = match iface.storage().load_node(iface.network_id(), recipient) {
        Ok(node) => node,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !iface.check_connectivity(&node.url).await {
        return Ok(None);
    }
    let reply = iface
        .forward_message(&node, target.message(), target.header().clone())
        .await?;
    Ok(Some(reply))
}

/// Answers `poll` sync requests with the pending relays that name the
/// poller; every other sync message goes to `inner`.
pub struct PendingSync {
    inner: Arc<dyn SyncHandler>,
}

impl PendingSync {
    pub fn new(inner: Arc<dyn SyncHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SyncHandler for PendingSync {
    async fn handle_sync(
        &self,
        iface: &NetworkInterface,
        message: SyncMessage,
        header: &NetworkMessageHeader,
    ) -> Result<Option<NetworkMessage>> {
        if message.target_type != SyncTarget::Poll || message.data.is_some() {
            return self.inner.handle_sync(iface, message, header).await;
        }

        let poller = message.meta.node_id.as_str();
        let storage = iface.storage();
        let mut items = Vec::new();
        for mut record in storage.list_pending(iface.network_id())? {
            if !record.is_for(poller) {
                continue;
            }
            if let Value::Object(map) = &record.body {
                items.push(SyncItem::Raw(map.clone()));
            }
            record.recipient_ids.retain(|r| r != poller);
            if record.recipient_ids.is_empty() {
                storage.delete_pending(&record.message_id)?;
            } else {
                storage.store_pending(&record)?;
            }
        }
        tracing::debug!(poller, items = items.len(), "relay: answering poll");

        let reply = SyncMessage::new(iface.new_meta().with_id(message.meta.message_id.clone()), SyncTarget::Poll, Some(items));
        Ok(Some(reply.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{DataHandler, Handlers};
    use crate::testkit::{mesh, LoopbackNet, TestNode, NET};
    use ddl_protocol::{codec, DataMessage, DataMessageType};
    use ddl_storage::{PendingRelay, Storage};
    use serde_json::json;

    struct Answer;

    #[async_trait]
    impl DataHandler for Answer {
        async fn handle_data(
            &self,
            iface: &NetworkInterface,
            message: DataMessage,
            _header: &NetworkMessageHeader,
        ) -> Result<Option<NetworkMessage>> {
            if message.data_type != DataMessageType::Query {
                return Ok(None);
            }
            let meta = iface.new_meta().with_id(message.meta.message_id);
            Ok(Some(DataMessage::response(meta, message.user_id, vec![json!(1)]).into()))
        }
    }

    /// Replies to any sync message with an empty node list.
    struct Nodes;

    #[async_trait]
    impl SyncHandler for Nodes {
        async fn handle_sync(
            &self,
            iface: &NetworkInterface,
            message: SyncMessage,
            _header: &NetworkMessageHeader,
        ) -> Result<Option<NetworkMessage>> {
            let meta = iface.new_meta().with_id(message.meta.message_id);
            Ok(Some(SyncMessage::new(meta, SyncTarget::Node, Some(Vec::new())).into()))
        }
    }

    fn handlers() -> Handlers {
        Handlers {
            data: Arc::new(Answer),
            sync: Arc::new(PendingSync::new(Arc::new(Nodes))),
            ..Handlers::default()
        }
    }

    fn nodes(ids: &[&str]) -> (Arc<LoopbackNet>, Vec<TestNode>) {
        let net = Arc::new(LoopbackNet::default());
        let nodes: Vec<TestNode> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| TestNode::spawn(&net, id, i, handlers()))
            .collect();
        mesh(&nodes.iter().collect::<Vec<_>>());
        (net, nodes)
    }

    /// Relay from `sender` carrying a query for `recipients`, and its header.
    fn envelope(sender: &TestNode, recipients: &[&str], ttl: u32) -> (NetworkMessage, NetworkMessageHeader) {
        let iface = sender.iface();
        let inner: NetworkMessage = DataMessage::query(iface.new_meta(), "u1", json!({})).into();
        let inner_header = iface.sign_header(&inner).unwrap();
        let recipients = recipients.iter().map(|r| r.to_string()).collect();
        let relay: NetworkMessage = RelayMessage::wrap(iface.new_meta(), recipients, inner_header, inner, ttl)
            .unwrap()
            .into();
        let header = iface.sign_header(&relay).unwrap();
        (relay, header)
    }

    #[tokio::test]
    async fn test_relay_addressed_to_self() {
        let (_net, nodes) = nodes(&["a", "b"]);
        let (relay, header) = envelope(&nodes[0], &["b"], 3);

        let (reply, reply_header) = nodes[1]
            .iface()
            .receive_message(relay.clone(), header, true)
            .await
            .unwrap()
            .unwrap();
        assert!(reply_header.delivered);
        assert_eq!(reply_header.delivered_to, ["b"]);
        let NetworkMessage::Relay(reply) = reply else {
            panic!("expected relay reply");
        };
        assert_eq!(reply.meta.message_id, relay.message_id());
        assert_eq!(reply.meta.node_id, "b");
        let target = &reply.relay_targets()[0];
        assert_eq!(target.recipient_ids(), ["a"]);
        assert_eq!(target.message().node_id(), "b");
        assert_eq!(target.message().message_type(), MessageType::Data);
        assert!(nodes[1].transport.posts().is_empty());
    }

    #[tokio::test]
    async fn test_relay_forwards_to_reachable_recipient() {
        let (_net, nodes) = nodes(&["a", "b", "c"]);
        let (relay, header) = envelope(&nodes[0], &["c"], 3);

        let reply = nodes[1].iface().receive_message(relay, header, true).await.unwrap();
        let (NetworkMessage::Relay(reply), _) = reply.unwrap() else {
            panic!("expected relay reply");
        };
        assert_eq!(reply.relay_targets()[0].message().node_id(), "c");
        assert_eq!(nodes[1].transport.posts(), vec!["http://c.test/federation/"]);
    }

    #[tokio::test]
    async fn test_relay_ttl_exhausted() {
        let (_net, nodes) = nodes(&["a", "b", "c", "d"]);
        nodes[1].transport.block("c");
        let (relay, header) = envelope(&nodes[0], &["c"], 1);

        let reply = nodes[1].iface().receive_message(relay, header, true).await.unwrap();
        assert!(reply.is_none());
        assert!(nodes[1].transport.posts().is_empty());
        assert!(nodes[1].storage.list_pending(NET).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relay_goes_another_hop() {
        let (_net, nodes) = nodes(&["a", "b", "c", "d"]);
        // b can only get to d through c.
        nodes[1].transport.block("d");
        let (relay, header) = envelope(&nodes[0], &["d"], 3);

        let reply = nodes[1].iface().receive_message(relay, header, true).await.unwrap();
        let (NetworkMessage::Relay(reply), reply_header) = reply.unwrap() else {
            panic!("expected relay reply");
        };
        assert!(reply_header.delivered);
        assert_eq!(reply_header.delivered_to, ["d"]);
        // Replies gathered by the onward broadcast are not passed back.
        assert!(reply.relay_targets().is_empty());
        assert!(nodes[1].transport.posts().contains(&"http://c.test/federation/".to_string()));
        assert_eq!(nodes[2].transport.posts(), vec!["http://d.test/federation/"]);
    }

    #[tokio::test]
    async fn test_poll_keeps_other_recipients() {
        let (_net, nodes) = nodes(&["a", "c", "d"]);
        let (relay, _) = envelope(&nodes[0], &["c", "d"], 3);
        let record = PendingRelay::new(
            format!("p-{}", relay.message_id()),
            NET,
            vec!["c".into(), "d".into()],
            codec::encode(&relay),
        );
        nodes[0].storage.store_pending(&record).unwrap();

        let d = &nodes[2];
        assert_eq!(d.iface().poll_pending(&d.stored("a")).await.unwrap(), 1);
        let left = nodes[0].storage.load_pending(&record.message_id).unwrap();
        assert_eq!(left.recipient_ids, ["c"]);

        let c = &nodes[1];
        assert_eq!(c.iface().poll_pending(&c.stored("a")).await.unwrap(), 1);
        assert!(nodes[0].storage.list_pending(NET).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_sync_goes_to_inner_handler() {
        let (_net, nodes) = nodes(&["a", "b"]);
        let a = nodes[0].iface();
        let msg: NetworkMessage = SyncMessage::new(a.new_meta(), SyncTarget::Node, None).into();
        let (reply, _) = a
            .send_message(&nodes[0].stored("b"), &msg, &crate::SendOptions::default())
            .await
            .unwrap()
            .unwrap();
        let NetworkMessage::Sync(reply) = reply else {
            panic!("expected sync reply");
        };
        assert_eq!(reply.target_type, SyncTarget::Node);
        assert_eq!(reply.data, Some(Vec::new()));
    }
}
