//! Multi-node scenarios over real HTTP.

use std::sync::Arc;

use ddl_federation::{BroadcastOptions, SendOptions};
use ddl_node::maintenance::retry_once;
use ddl_node::membership::sync_members;
use ddl_protocol::{
    challenge, AuthMessage, AuthMessageStatus, AuthRequestInvite, AuthStatus, DataMessage, DataMessageType,
    NetworkMessage,
};
use ddl_storage::Storage;
use serde_json::json;

use crate::harness::{mesh, url_of, Directory, TestNode, NET};

fn query(node: &TestNode) -> NetworkMessage {
    DataMessage::query(node.iface().new_meta(), "u1", json!({"q": "anything"})).into()
}

fn expect_response(reply: Option<(NetworkMessage, ddl_protocol::NetworkMessageHeader)>) -> DataMessage {
    match reply {
        Some((NetworkMessage::Data(data), _)) if data.data_type == DataMessageType::Response => data,
        other => panic!("expected data response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let directory = Arc::new(Directory::default());
    let a = TestNode::spawn(&directory, "a", 0).await;

    let body: serde_json::Value = reqwest::get(a.api_url("/api")).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "OK");
    assert_eq!(body["name"], "A");

    let b = TestNode::spawn(&directory, "b", 1).await;
    assert!(b.iface().check_connectivity(&url_of("a")).await);
    b.block("a");
    assert!(!b.iface().check_connectivity(&url_of("a")).await);
}

#[tokio::test]
async fn test_query_over_http() {
    let directory = Arc::new(Directory::default());
    let a = TestNode::spawn(&directory, "a", 0).await;
    let b = TestNode::spawn(&directory, "b", 1).await;
    mesh(&[&a, &b]);

    let message = query(&a);
    let reply = a
        .iface()
        .send_message(&a.stored("b"), &message, &SendOptions::default())
        .await
        .unwrap();
    let response = expect_response(reply);
    assert_eq!(response.meta.message_id, message.message_id());
    assert_eq!(response.meta.node_id, "b");
    assert_eq!(response.user_id, "anonymous");
    assert_eq!(response.record_count(), Some(0));
    assert!(a.stored("b").score > 0.0);
}

#[tokio::test]
async fn test_unsigned_request_is_refused() {
    let directory = Arc::new(Directory::default());
    let a = TestNode::spawn(&directory, "a", 0).await;
    let b = TestNode::spawn(&directory, "b", 1).await;
    mesh(&[&a, &b]);

    let body = ddl_protocol::codec::to_vec(&query(&b)).unwrap();
    let response = reqwest::Client::new()
        .post(a.api_url("/federation/"))
        .header("X-Node-ID", "b")
        .header("X-Network-ID", NET)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn test_relay_over_http() {
    let directory = Arc::new(Directory::default());
    let a = TestNode::spawn(&directory, "a", 0).await;
    let b = TestNode::spawn(&directory, "b", 1).await;
    let c = TestNode::spawn(&directory, "c", 2).await;
    mesh(&[&a, &b, &c]);
    a.block("c");

    let message = query(&a);
    let reply = a
        .iface()
        .send_message(&a.stored("c"), &message, &SendOptions::default())
        .await
        .unwrap();
    let response = expect_response(reply);
    assert_eq!(response.meta.node_id, "c");
    assert_eq!(response.meta.message_id, message.message_id());
}

/// a knows b, c and d; each of them knows only a. a cannot reach d.
async fn isolated_d(directory: &Arc<Directory>) -> [TestNode; 4] {
    let a = TestNode::spawn(directory, "a", 0).await;
    let b = TestNode::spawn(directory, "b", 1).await;
    let c = TestNode::spawn(directory, "c", 2).await;
    let d = TestNode::spawn(directory, "d", 3).await;
    for other in [&b, &c, &d] {
        mesh(&[&a, other]);
    }
    a.block("d");
    [a, b, c, d]
}

#[tokio::test]
async fn test_broadcast_parks_and_retries() {
    let directory = Arc::new(Directory::default());
    let [a, b, c, d] = isolated_d(&directory).await;

    let replies = a
        .iface()
        .broadcast_message(&query(&a), &BroadcastOptions::default(), &[])
        .await
        .unwrap();
    assert_eq!(replies.len(), 2);
    let pending = a.storage.list_pending(NET).unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].message_id.starts_with("p-"));
    assert_eq!(pending[0].recipient_ids, vec!["d".to_string()]);

    assert_eq!(retry_once(&a.federation, false).await, 0);
    assert_eq!(a.storage.list_pending(NET).unwrap().len(), 1);

    a.unblock("d");
    assert_eq!(retry_once(&a.federation, false).await, 1);
    assert!(a.storage.list_pending(NET).unwrap().is_empty());
    for node in [b, c, d] {
        assert!(node.storage.list_pending(NET).unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_parked_relay_pulled_by_recipient() {
    let directory = Arc::new(Directory::default());
    let [a, _b, _c, d] = isolated_d(&directory).await;

    a.iface()
        .broadcast_message(&query(&a), &BroadcastOptions::default(), &[])
        .await
        .unwrap();
    assert_eq!(a.storage.list_pending(NET).unwrap().len(), 1);

    assert_eq!(retry_once(&d.federation, true).await, 1);
    assert!(a.storage.list_pending(NET).unwrap().is_empty());
    assert_eq!(retry_once(&d.federation, true).await, 0);
}

#[tokio::test]
async fn test_join_handshake() {
    let directory = Arc::new(Directory::default());
    let a = TestNode::spawn(&directory, "a", 0).await;
    let e = TestNode::spawn(&directory, "e", 4).await;
    e.knows(&a);

    let request = AuthRequestInvite::request(
        e.iface().new_meta(),
        e.record(),
        url_of("a"),
        challenge::default_challenge(),
        "joining the test network",
    );
    let request_id = request.meta.message_id.clone();
    let reply = e
        .iface()
        .send_message(&e.stored("a"), &AuthMessage::Request(request).into(), &SendOptions::default())
        .await
        .unwrap();
    let status = |reply: Option<(NetworkMessage, _)>| match reply {
        Some((NetworkMessage::Auth(AuthMessage::Status(s)), _)) => (s.meta.message_id, s.status),
        other => panic!("expected status, got {other:?}"),
    };
    assert_eq!(status(reply), (request_id.clone(), Some(AuthMessageStatus::Pending)));
    assert!(!a.stored("e").approved);

    let mut patch = serde_json::Map::new();
    patch.insert("approved".into(), true.into());
    a.storage.update_node(NET, "e", &patch).unwrap();

    let poll = AuthMessage::Status(AuthStatus {
        meta: e.iface().new_meta().with_id(&request_id),
        status: None,
    });
    let reply = e
        .iface()
        .send_message(&e.stored("a"), &poll.into(), &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(status(reply), (request_id, Some(AuthMessageStatus::Accepted)));
}

#[tokio::test]
async fn test_member_sync_learns_unknown_nodes() {
    let directory = Arc::new(Directory::default());
    let a = TestNode::spawn(&directory, "a", 0).await;
    let b = TestNode::spawn(&directory, "b", 1).await;
    let c = TestNode::spawn(&directory, "c", 2).await;
    mesh(&[&a, &b, &c]);
    b.storage.delete_node(NET, "c").unwrap();

    assert_eq!(sync_members(&b.iface()).await.unwrap(), 1);
    let learned = b.stored("c");
    assert!(!learned.approved);
    assert_eq!(learned.public_key, c.record().public_key);
    assert_eq!(sync_members(&b.iface()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_serving() {
    let directory = Arc::new(Directory::default());
    let a = TestNode::spawn(&directory, "a", 0).await;
    let b = TestNode::spawn(&directory, "b", 1).await;
    mesh(&[&a, &b]);

    b.shutdown().await;
    assert!(!a.iface().check_connectivity(&url_of("b")).await);
}
