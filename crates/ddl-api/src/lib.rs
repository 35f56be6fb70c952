//! DDL API -- HTTP surface of a federation instance.
//!
//! Two routes:
//! - `POST <federation path>` (default `/federation/`): one wire message in
//!   the body, its identity in the transport headers. Answered with the
//!   handler's reply and a signed header, or 204 when there is none.
//! - `GET /api`: health endpoint used by other nodes' connectivity checks.
//!
//! Rejections carry `{"error": "..."}` with a status picked from the error
//! kind: 400 undecodable or invalid envelope, 401 signature, replay or
//! credentials, 404 unknown network, 502 onward delivery, 500 otherwise.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ddl_federation::{ErrorKind, Federation, FederationError, HEALTH_PATH};
use ddl_protocol::{codec, NetworkMessageHeader, MAX_MESSAGE_SIZE};
use serde_json::json;
use std::sync::Arc;

/// Shared state for all API handlers.
pub struct AppState {
    pub federation: Arc<Federation>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(federation: Arc<Federation>) -> Self {
        Self {
            federation,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    let federation_path = state.federation.federation_path().to_string();
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(&federation_path, post(receive))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_SIZE))
        .with_state(state)
}

// ============================================================================
// Status mapping
// ============================================================================

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Decode | ErrorKind::RelayInvariant => StatusCode::BAD_REQUEST,
        ErrorKind::Crypto | ErrorKind::Replay | ErrorKind::AuthStatus => StatusCode::UNAUTHORIZED,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Storage | ErrorKind::Cancelled | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

fn with_header(mut response: Response, header: &NetworkMessageHeader) -> Response {
    for (name, value) in header.headers() {
        let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) else {
            tracing::warn!(header = name, "api: header value not representable");
            continue;
        };
        response.headers_mut().insert(name, value);
    }
    response
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "OK",
        "name": state.federation.config().name,
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

async fn receive(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let header = NetworkMessageHeader::from_lookup(|name| headers.get(name).and_then(|v| v.to_str().ok()));

    let message = match codec::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "api: undecodable message");
            return rejection(StatusCode::BAD_REQUEST, e);
        }
    };

    let iface = match state.federation.interface(message.network_id()) {
        Ok(iface) => iface,
        Err(FederationError::Storage(e)) if e.is_not_found() => {
            tracing::debug!(network_id = message.network_id(), "api: unknown network");
            return rejection(StatusCode::NOT_FOUND, e);
        }
        Err(e) => return rejection(status_for(e.kind()), e),
    };

    let message_id = message.message_id().to_string();
    match iface.receive_message(message, header, true).await {
        Ok(Some((reply, reply_header))) => with_header(Json(codec::encode(&reply)).into_response(), &reply_header),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            let status = status_for(e.kind());
            tracing::warn!(message_id, status = status.as_u16(), error = %e, "api: message rejected");
            rejection(status, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ddl_crypto::NetworkKeyPair;
    use ddl_federation::{
        DataHandler, DdlConfig, Handlers, NetworkInterface, Transport, TransportError, TransportResponse,
    };
    use ddl_protocol::{
        canonical_payload, DataMessage, DataMessageType, MessageMeta, Network, NetworkMessage, Node, SyncMessage,
        SyncTarget,
    };
    use ddl_storage::{MemoryStorage, Storage};
    use serde_json::Value;
    use std::sync::OnceLock;
    use tower::ServiceExt;

    const NET: &str = "net-1";

    fn keys() -> &'static (NetworkKeyPair, NetworkKeyPair) {
        static KEYS: OnceLock<(NetworkKeyPair, NetworkKeyPair)> = OnceLock::new();
        KEYS.get_or_init(|| {
            (
                NetworkKeyPair::generate_with_bits(1024).unwrap(),
                NetworkKeyPair::generate_with_bits(1024).unwrap(),
            )
        })
    }

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn get_json(&self, _url: &str) -> Result<Value, TransportError> {
            Err(TransportError::Connect("offline".into()))
        }

        async fn post(
            &self,
            _url: &str,
            _header: &NetworkMessageHeader,
            _body: Vec<u8>,
        ) -> Result<TransportResponse, TransportError> {
            Err(TransportError::Connect("offline".into()))
        }
    }

    struct Echo;

    #[async_trait]
    impl DataHandler for Echo {
        async fn handle_data(
            &self,
            iface: &NetworkInterface,
            message: DataMessage,
            header: &NetworkMessageHeader,
        ) -> ddl_federation::Result<Option<NetworkMessage>> {
            if message.data_type != DataMessageType::Query {
                return Ok(None);
            }
            let meta = iface.new_meta().with_id(message.meta.message_id);
            let user = header.user_id.clone().unwrap_or_default();
            Ok(Some(DataMessage::response(meta, user, vec![message.data]).into()))
        }
    }

    /// Instance "local" in NET, knowing "peer".
    fn app() -> Router {
        let (local, peer) = keys();
        let storage = Arc::new(MemoryStorage::new());
        storage.store_network(&Network::new(NET, "Test", "local")).unwrap();
        storage.store_network_key(NET, &local.private_key_pem().unwrap()).unwrap();
        let mut node = Node::new("peer", "Peer", "http://peer.test");
        node.public_key = Some(peer.public_key_pem().unwrap());
        node.approved = true;
        storage.store_node(NET, &node).unwrap();

        let config = DdlConfig {
            anonymous_access: true,
            ..DdlConfig::default()
        };
        let handlers = Handlers {
            data: Arc::new(Echo),
            ..Handlers::default()
        };
        let federation = Federation::new(config, storage, Arc::new(Offline)).with_handlers(handlers);
        router(Arc::new(AppState::new(Arc::new(federation))))
    }

    fn request(message: &NetworkMessage, sign: bool) -> Request<Body> {
        let (_, peer) = keys();
        let mut header = NetworkMessageHeader::new(message.node_id(), message.network_id());
        if sign {
            header.server_signature = Some(peer.sign(&canonical_payload(message).unwrap()).unwrap());
        }
        let mut builder = Request::post("/federation/");
        for (name, value) in header.headers() {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(codec::to_vec(message).unwrap()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn query() -> NetworkMessage {
        DataMessage::query(MessageMeta::new(NET, "peer"), "u1", json!({"q": 1})).into()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "OK");
    }

    #[tokio::test]
    async fn test_reply_carries_signed_header() {
        let message = query();
        let response = app().oneshot(request(&message, true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers["x-node-id"], "local");
        assert_eq!(headers["x-network-id"], NET);
        assert!(headers.get("x-delivered").is_none());

        let reply = codec::decode(&json_body(response).await).unwrap();
        assert_eq!(reply.message_id(), message.message_id());
        let (local, _) = keys();
        let signature = headers["x-server-signature"].to_str().unwrap();
        ddl_crypto::verify(
            &local.public_key_pem().unwrap(),
            signature,
            &canonical_payload(&reply).unwrap(),
        )
        .unwrap();
        let NetworkMessage::Data(reply) = reply else {
            panic!("expected data response");
        };
        assert_eq!(reply.user_id, "anonymous");
    }

    #[tokio::test]
    async fn test_no_reply_is_no_content() {
        let message: NetworkMessage = SyncMessage::new(MessageMeta::new(NET, "peer"), SyncTarget::Node, None).into();
        let response = app().oneshot(request(&message, true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_rejections() {
        let garbage = Request::post("/federation/")
            .body(Body::from("{\"messageType\": \"nonsense\"}"))
            .unwrap();
        let response = app().oneshot(garbage).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());

        let response = app().oneshot(request(&query(), false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut stale = DataMessage::query(MessageMeta::new(NET, "peer"), "u1", json!({}));
        stale.meta.timestamp -= 3600;
        let response = app().oneshot(request(&stale.into(), true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let stranger: NetworkMessage = DataMessage::query(MessageMeta::new(NET, "stranger"), "u1", json!({})).into();
        let response = app().oneshot(request(&stranger, true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let elsewhere: NetworkMessage = DataMessage::query(MessageMeta::new("net-9", "peer"), "u1", json!({})).into();
        let response = app().oneshot(request(&elsewhere, true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_body_limit_matches_codec() {
        let padding = "x".repeat(2 * 1024 * 1024);
        let large: NetworkMessage =
            DataMessage::query(MessageMeta::new(NET, "peer"), "u1", json!({ "pad": padding })).into();
        let response = app().oneshot(request(&large, true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let oversized = Request::post("/federation/")
            .body(Body::from(vec![b' '; MAX_MESSAGE_SIZE + 1]))
            .unwrap();
        let response = app().oneshot(oversized).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::RelayInvariant), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Replay), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::Transport), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::Cancelled), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
