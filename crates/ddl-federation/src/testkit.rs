//! In-process fakes shared by the unit tests: an identity provider, a
//! transport that routes POSTs straight into another federation, and a
//! helper that stands up a node in a test network.

use async_trait::async_trait;
use ddl_crypto::NetworkKeyPair;
use ddl_protocol::{canonical_payload, codec, Network, NetworkMessage, NetworkMessageHeader, Node};
use ddl_storage::{MemoryStorage, Storage};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use crate::handlers::Handlers;
use crate::interface::{Federation, NetworkInterface};
use crate::oidc::{Introspection, OidcDriver, OidcError};
use crate::transport::{Transport, TransportError, TransportResponse};
use crate::{DdlConfig, ErrorKind};

pub const NET: &str = "net-1";

/// Small keys generated once per test binary.
pub fn key(index: usize) -> &'static NetworkKeyPair {
    static KEYS: OnceLock<Vec<NetworkKeyPair>> = OnceLock::new();
    &KEYS.get_or_init(|| {
        (0..6)
            .map(|_| NetworkKeyPair::generate_with_bits(1024).unwrap())
            .collect()
    })[index]
}

pub fn url_of(id: &str) -> String {
    format!("http://{id}.test")
}

/// Approved node record whose public key is test key `key_index`.
pub fn peer_record(id: &str, key_index: usize) -> Node {
    let mut node = Node::new(id, id.to_uppercase(), url_of(id));
    node.public_key = Some(key(key_index).public_key_pem().unwrap());
    node.approved = true;
    node
}

pub fn signed_header(message: &NetworkMessage, key_index: usize) -> NetworkMessageHeader {
    let payload = canonical_payload(message).unwrap();
    let mut header = NetworkMessageHeader::new(message.node_id(), message.network_id());
    header.server_signature = Some(key(key_index).sign(&payload).unwrap());
    header
}

// ============================================================================
// Identity provider
// ============================================================================

pub struct FakeIdp {
    issuer: String,
    tokens: Mutex<HashMap<String, Introspection>>,
    exchanges: Mutex<HashMap<String, String>>,
}

impl FakeIdp {
    pub fn new(issuer: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            tokens: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
        }
    }

    pub fn token(&self, token: &str, info: Introspection) {
        self.tokens.lock().unwrap().insert(token.to_string(), info);
    }

    pub fn exchange(&self, external: &str, local: &str) {
        self.exchanges
            .lock()
            .unwrap()
            .insert(external.to_string(), local.to_string());
    }
}

#[async_trait]
impl OidcDriver for FakeIdp {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn service_token(&self) -> Result<String, OidcError> {
        Ok("service-token".to_string())
    }

    async fn exchange_token(&self, external_token: &str) -> Result<String, OidcError> {
        self.exchanges
            .lock()
            .unwrap()
            .get(external_token)
            .cloned()
            .ok_or_else(|| OidcError::Request("exchange refused".into()))
    }

    async fn introspect_token(&self, token: &str) -> Result<Introspection, OidcError> {
        Ok(self.tokens.lock().unwrap().get(token).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Hosts reachable through [`LoopbackTransport`], keyed by base URL.
#[derive(Default)]
pub struct LoopbackNet {
    hosts: Mutex<HashMap<String, Arc<Federation>>>,
}

impl LoopbackNet {
    pub fn attach(&self, base_url: &str, federation: Arc<Federation>) {
        self.hosts
            .lock()
            .unwrap()
            .insert(base_url.to_string(), federation);
    }

    fn host(&self, base_url: &str) -> Option<Arc<Federation>> {
        self.hosts.lock().unwrap().get(base_url).cloned()
    }
}

/// One node's view of the loopback network.
pub struct LoopbackTransport {
    net: Arc<LoopbackNet>,
    blocked: Mutex<HashSet<String>>,
    posts: Mutex<Vec<String>>,
    fail_posts: Mutex<bool>,
    stall_posts: Mutex<bool>,
}

impl LoopbackTransport {
    pub fn new(net: Arc<LoopbackNet>) -> Self {
        Self {
            net,
            blocked: Mutex::new(HashSet::new()),
            posts: Mutex::new(Vec::new()),
            fail_posts: Mutex::new(false),
            stall_posts: Mutex::new(false),
        }
    }

    pub fn block(&self, id: &str) {
        self.blocked.lock().unwrap().insert(url_of(id));
    }

    pub fn unblock(&self, id: &str) {
        self.blocked.lock().unwrap().remove(&url_of(id));
    }

    /// Health checks still succeed, POSTs fail.
    pub fn fail_posts(&self) {
        *self.fail_posts.lock().unwrap() = true;
    }

    /// POSTs never complete.
    pub fn stall_posts(&self) {
        *self.stall_posts.lock().unwrap() = true;
    }

    /// URLs POSTed to so far.
    pub fn posts(&self) -> Vec<String> {
        self.posts.lock().unwrap().clone()
    }

    fn route(&self, url: &str) -> Result<Arc<Federation>, TransportError> {
        let base = base_of(url);
        if self.blocked.lock().unwrap().contains(base) {
            return Err(TransportError::Connect(format!("{base} unreachable")));
        }
        self.net
            .host(base)
            .ok_or_else(|| TransportError::Connect(format!("{base} unknown")))
    }
}

fn base_of(url: &str) -> &str {
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[after_scheme..].find('/') {
        Some(i) => &url[..after_scheme + i],
        None => url,
    }
}

fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::Decode | ErrorKind::RelayInvariant => 400,
        ErrorKind::Crypto | ErrorKind::Replay | ErrorKind::AuthStatus => 401,
        ErrorKind::Transport => 502,
        _ => 500,
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn get_json(&self, url: &str) -> Result<Value, TransportError> {
        self.route(url)?;
        Ok(json!({"status": "OK"}))
    }

    async fn post(
        &self,
        url: &str,
        header: &NetworkMessageHeader,
        body: Vec<u8>,
    ) -> Result<TransportResponse, TransportError> {
        let host = self.route(url)?;
        self.posts.lock().unwrap().push(url.to_string());
        if *self.fail_posts.lock().unwrap() {
            return Err(TransportError::Connect("connection reset".into()));
        }
        if *self.stall_posts.lock().unwrap() {
            std::future::pending::<()>().await;
        }

        let refused = |status: u16, error: String| TransportResponse {
            status,
            header: NetworkMessageHeader::default(),
            body: Some(json!({ "error": error })),
        };
        let message = match codec::from_slice(&body) {
            Ok(message) => message,
            Err(e) => return Ok(refused(400, e.to_string())),
        };
        let iface = match host.interface(message.network_id()) {
            Ok(iface) => iface,
            Err(e) => return Ok(refused(404, e.to_string())),
        };
        Ok(match iface.receive_message(message, header.clone(), true).await {
            Ok(Some((reply, header))) => TransportResponse {
                status: 200,
                header,
                body: Some(codec::encode(&reply)),
            },
            Ok(None) => TransportResponse {
                status: 204,
                header: NetworkMessageHeader::default(),
                body: None,
            },
            Err(e) => refused(status_for(e.kind()), e.to_string()),
        })
    }
}

// ============================================================================
// Test nodes
// ============================================================================

pub struct TestNode {
    pub id: String,
    pub key_index: usize,
    pub federation: Arc<Federation>,
    pub storage: Arc<MemoryStorage>,
    pub transport: Arc<LoopbackTransport>,
}

impl TestNode {
    /// A member of [`NET`] signing with test key `key_index`, reachable at
    /// `http://<id>.test` through `net`.
    pub fn spawn(net: &Arc<LoopbackNet>, id: &str, key_index: usize, handlers: Handlers) -> Self {
        Self::spawn_with(net, id, key_index, |f| f.with_handlers(handlers))
    }

    pub fn spawn_with(
        net: &Arc<LoopbackNet>,
        id: &str,
        key_index: usize,
        build: impl FnOnce(Federation) -> Federation,
    ) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        storage.store_network(&Network::new(NET, "Test network", id)).unwrap();
        storage
            .store_network_key(NET, &key(key_index).private_key_pem().unwrap())
            .unwrap();
        let transport = Arc::new(LoopbackTransport::new(Arc::clone(net)));
        let config = DdlConfig {
            url: url_of(id),
            anonymous_access: true,
            ..DdlConfig::default()
        };
        let federation = Arc::new(build(Federation::new(config, storage.clone(), transport.clone())));
        net.attach(&url_of(id), Arc::clone(&federation));
        Self {
            id: id.to_string(),
            key_index,
            federation,
            storage,
            transport,
        }
    }

    pub fn iface(&self) -> NetworkInterface {
        self.federation.interface(NET).unwrap()
    }

    pub fn record(&self) -> Node {
        peer_record(&self.id, self.key_index)
    }

    /// Make `other` an approved member in this node's store.
    pub fn knows(&self, other: &TestNode) {
        self.storage.store_node(NET, &other.record()).unwrap();
    }

    pub fn stored(&self, id: &str) -> Node {
        self.storage.load_node(NET, id).unwrap()
    }
}

/// Every node approves every other.
pub fn mesh(nodes: &[&TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.id != b.id {
                a.knows(b);
            }
        }
    }
}
