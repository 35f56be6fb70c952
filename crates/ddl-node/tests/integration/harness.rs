//! Test harness for in-process ddl-node integration tests.
//!
//! Every TestNode serves the real API router on an ephemeral loopback port.
//! Nodes address each other as `http://<id>.test`; a shared Directory maps
//! those names to ports and each node's RoutedTransport can be told to
//! treat peers as unreachable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use ddl_api::AppState;
use ddl_crypto::NetworkKeyPair;
use ddl_federation::{DdlConfig, Federation, NetworkInterface, Transport, TransportError, TransportResponse};
use ddl_node::http::HttpTransport;
use ddl_node::membership::node_handlers;
use ddl_protocol::{Network, NetworkMessageHeader, Node};
use ddl_storage::{MemoryStorage, Storage};
use serde_json::Value;
use tokio::sync::broadcast;

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

/// `.test` names to loopback ports.
#[derive(Default)]
pub struct Directory {
    ports: Mutex<HashMap<String, u16>>,
}

impl Directory {
    fn register(&self, id: &str, port: u16) {
        self.ports.lock().unwrap().insert(id.to_string(), port);
    }

    fn port(&self, id: &str) -> Option<u16> {
        self.ports.lock().unwrap().get(id).copied()
    }
}

/// HttpTransport that resolves `.test` names through the Directory.
pub struct RoutedTransport {
    inner: HttpTransport,
    directory: Arc<Directory>,
    blocked: Mutex<HashSet<String>>,
}

impl RoutedTransport {
    fn new(directory: Arc<Directory>) -> Self {
        Self {
            inner: HttpTransport::new(Duration::from_secs(5)).unwrap(),
            directory,
            blocked: Mutex::new(HashSet::new()),
        }
    }

    fn resolve(&self, url: &str) -> Result<String, TransportError> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| TransportError::Connect(format!("{url}: unsupported scheme")))?;
        let (host, path) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
        let id = host
            .strip_suffix(".test")
            .ok_or_else(|| TransportError::Connect(format!("{host}: unknown host")))?;
        if self.blocked.lock().unwrap().contains(id) {
            return Err(TransportError::Connect(format!("{host}: unreachable")));
        }
        let port = self
            .directory
            .port(id)
            .ok_or_else(|| TransportError::Connect(format!("{host}: not listening")))?;
        Ok(format!("http://127.0.0.1:{port}{path}"))
    }
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn get_json(&self, url: &str) -> Result<Value, TransportError> {
        self.inner.get_json(&self.resolve(url)?).await
    }

    async fn post(
        &self,
        url: &str,
        header: &NetworkMessageHeader,
        body: Vec<u8>,
    ) -> Result<TransportResponse, TransportError> {
        self.inner.post(&self.resolve(url)?, header, body).await
    }
}

/// A node serving the federation API on a loopback port.
pub struct TestNode {
    pub id: String,
    pub key_index: usize,
    pub port: u16,
    pub federation: Arc<Federation>,
    pub storage: Arc<MemoryStorage>,
    pub transport: Arc<RoutedTransport>,
    shutdown_tx: broadcast::Sender<()>,
    _handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestNode {
    /// Member of [`NET`] with the default node handlers.
    pub async fn spawn(directory: &Arc<Directory>, id: &str, key_index: usize) -> Self {
        Self::spawn_with(directory, id, key_index, |f| f).await
    }

    pub async fn spawn_with(
        directory: &Arc<Directory>,
        id: &str,
        key_index: usize,
        build: impl FnOnce(Federation) -> Federation,
    ) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        storage.store_network(&Network::new(NET, "Test network", id)).unwrap();
        storage
            .store_network_key(NET, &key(key_index).private_key_pem().unwrap())
            .unwrap();
        let transport = Arc::new(RoutedTransport::new(Arc::clone(directory)));
        let config = DdlConfig {
            name: id.to_uppercase(),
            url: url_of(id),
            anonymous_access: true,
            ..DdlConfig::default()
        };
        let federation = Federation::new(config, storage.clone(), transport.clone()).with_handlers(node_handlers());
        let federation = Arc::new(build(federation));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        directory.register(id, port);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let router = ddl_api::router(Arc::new(AppState::new(federation.clone())));
        let mut shutdown = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
                .ok();
        });

        Self {
            id: id.to_string(),
            key_index,
            port,
            federation,
            storage,
            transport,
            shutdown_tx,
            _handle: handle,
        }
    }

    pub async fn shutdown(self) {
        self.federation.shutdown();
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub fn iface(&self) -> NetworkInterface {
        self.federation.interface(NET).unwrap()
    }

    /// How other members store this node.
    pub fn record(&self) -> Node {
        let mut node = Node::new(&self.id, self.id.to_uppercase(), url_of(&self.id));
        node.public_key = Some(key(self.key_index).public_key_pem().unwrap());
        node.approved = true;
        node
    }

    pub fn knows(&self, other: &TestNode) {
        self.storage.store_node(NET, &other.record()).unwrap();
    }

    pub fn stored(&self, id: &str) -> Node {
        self.storage.load_node(NET, id).unwrap()
    }

    pub fn block(&self, id: &str) {
        self.transport.blocked.lock().unwrap().insert(id.to_string());
    }

    pub fn unblock(&self, id: &str) {
        self.transport.blocked.lock().unwrap().remove(id);
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
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
