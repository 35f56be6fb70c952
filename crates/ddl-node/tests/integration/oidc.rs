//! HttpOidcDriver against a mock identity provider, and token validation
//! between two nodes sharing it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use ddl_federation::{OidcDriver, OidcError, OidcRegistry, SendOptions};
use ddl_node::oidc::HttpOidcDriver;
use ddl_protocol::{DataMessage, MessageMeta, NetworkMessage, SyncMessage, SyncTarget};
use ddl_storage::Storage;
use serde_json::json;

use crate::harness::{mesh, Directory, TestNode, NET};

struct Idp {
    base: String,
    service_tokens: AtomicUsize,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "))
}

async fn discovery(State(idp): State<Arc<Idp>>) -> Json<serde_json::Value> {
    Json(json!({
        "issuer": idp.base,
        "token_endpoint": format!("{}/token", idp.base),
        "introspection_endpoint": format!("{}/introspect", idp.base),
    }))
}

async fn token(State(idp): State<Arc<Idp>>, headers: HeaderMap, Form(form): Form<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match form.get("grant_type").map(String::as_str) {
        Some("client_credentials") => {
            let n = idp.service_tokens.fetch_add(1, Ordering::SeqCst);
            Json(json!({"access_token": format!("svc-{n}"), "expires_in": 300})).into_response()
        }
        Some("urn:ietf:params:oauth:grant-type:token-exchange")
            if form.get("subject_token").map(String::as_str) == Some("ext-good") =>
        {
            Json(json!({"access_token": "local-good"})).into_response()
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn introspect(headers: HeaderMap, Form(form): Form<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let token = form.get("token").cloned().unwrap_or_default();
    let body = if token.starts_with("svc-") {
        json!({
            "active": true,
            "sub": "svc-alpha",
            "client_id": "alpha",
            "preferred_username": "service-account-alpha",
        })
    } else if token == "local-good" {
        json!({"active": true, "sub": "alice", "client_id": "alpha", "preferred_username": "alice"})
    } else {
        json!({"active": false})
    };
    Json(body).into_response()
}

async fn spawn_idp() -> Arc<Idp> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let idp = Arc::new(Idp {
        base: format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port()),
        service_tokens: AtomicUsize::new(0),
    });
    let router = Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/token", post(token))
        .route("/introspect", post(introspect))
        .with_state(idp.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    idp
}

fn driver(idp: &Idp) -> HttpOidcDriver {
    HttpOidcDriver::new(
        reqwest::Client::new(),
        idp.base.clone(),
        format!("{}/.well-known/openid-configuration", idp.base),
        "alpha",
        "secret",
    )
}

#[tokio::test]
async fn test_service_token_is_cached() {
    let idp = spawn_idp().await;
    let driver = driver(&idp);
    let first = driver.service_token().await.unwrap();
    let second = driver.service_token().await.unwrap();
    assert_eq!(first, "svc-0");
    assert_eq!(first, second);
    assert_eq!(idp.service_tokens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exchange_and_introspect() {
    let idp = spawn_idp().await;
    let driver = driver(&idp);
    assert_eq!(driver.exchange_token("ext-good").await.unwrap(), "local-good");
    assert!(matches!(driver.exchange_token("ext-bad").await, Err(OidcError::Request(_))));

    let info = driver.introspect_token("local-good").await.unwrap();
    assert!(info.active);
    assert_eq!(info.sub.as_deref(), Some("alice"));
    assert!(!driver.introspect_token("nonsense").await.unwrap().active);

    assert_eq!(driver.validate_external("ext-good", "alpha").await.unwrap(), "alice");
    assert!(driver.validate_external("ext-bad", "alpha").await.is_err());
}

#[tokio::test]
async fn test_unreachable_discovery() {
    let driver = HttpOidcDriver::new(
        reqwest::Client::new(),
        "http://127.0.0.1:9",
        "http://127.0.0.1:9/.well-known/openid-configuration",
        "alpha",
        "secret",
    );
    assert!(matches!(driver.service_token().await, Err(OidcError::Request(_))));
}

/// Two nodes trusting the same IdP; b knows a as client `alpha`.
async fn idp_pair(directory: &Arc<Directory>, idp: &Arc<Idp>) -> (TestNode, TestNode) {
    let with_idp = |f: ddl_federation::Federation| f.with_oidc(OidcRegistry::with_default(Arc::new(driver(idp))));
    let a = TestNode::spawn_with(directory, "a", 0, with_idp).await;
    let b = TestNode::spawn_with(directory, "b", 1, with_idp).await;
    mesh(&[&a, &b]);
    let mut patch = serde_json::Map::new();
    patch.insert("clientId".into(), "alpha".into());
    b.storage.update_node(NET, "a", &patch).unwrap();
    (a, b)
}

#[tokio::test]
async fn test_service_token_enables_authentication() {
    let idp = spawn_idp().await;
    let directory = Arc::new(Directory::default());
    let (a, b) = idp_pair(&directory, &idp).await;
    assert!(!b.stored("a").authentication_enabled);

    let request: NetworkMessage = SyncMessage::new(a.iface().new_meta(), SyncTarget::Index, None).into();
    let reply = a
        .iface()
        .send_message(&a.stored("b"), &request, &SendOptions::default())
        .await
        .unwrap();
    assert!(matches!(reply, Some((NetworkMessage::Sync(_), _))));
    assert!(b.stored("a").authentication_enabled);
}

#[tokio::test]
async fn test_service_token_refused_for_data() {
    let idp = spawn_idp().await;
    let directory = Arc::new(Directory::default());
    let (a, _b) = idp_pair(&directory, &idp).await;

    let query: NetworkMessage = DataMessage::query(MessageMeta::new(NET, "a"), "u1", json!({})).into();
    let opts = SendOptions {
        should_raise: true,
        ..SendOptions::default()
    };
    let result = a.iface().send_message(&a.stored("b"), &query, &opts).await;
    assert!(result.is_err());

    let user_token = SendOptions {
        access_token: Some("local-good".into()),
        ..opts
    };
    let query: NetworkMessage = DataMessage::query(MessageMeta::new(NET, "a"), "u1", json!({})).into();
    let reply = a
        .iface()
        .send_message(&a.stored("b"), &query, &user_token)
        .await
        .unwrap();
    let Some((NetworkMessage::Data(response), _)) = reply else {
        panic!("expected data response");
    };
    assert_eq!(response.user_id, "alice");
}
