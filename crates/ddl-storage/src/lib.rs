//! DDL Storage -- persistence for networks, nodes, users, network keys,
//! pending relay envelopes and outstanding join handshakes.
//!
//! Records are stored as their JSON wire form, keyed by identity. Nodes are
//! scoped per network: the same node may belong to several networks with a
//! different score and approval state in each.

use ddl_protocol::{Network, Node, User};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A relay envelope that could not be delivered, held for polling/retry.
/// Keyed by a `p-`-prefixed message ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRelay {
    pub message_id: String,
    pub network_id: String,
    pub recipient_ids: Vec<String>,
    /// Encoded relay message.
    pub body: Value,
    pub created_at: String,
}

impl PendingRelay {
    pub fn new(message_id: impl Into<String>, network_id: impl Into<String>, recipient_ids: Vec<String>, body: Value) -> Self {
        Self {
            message_id: message_id.into(),
            network_id: network_id.into(),
            recipient_ids,
            body,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_for(&self, node_id: &str) -> bool {
        self.recipient_ids.iter().any(|r| r == node_id)
    }
}

/// A join request or invitation this instance sent and has not seen
/// answered. Keyed by the request's message ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub message_id: String,
    pub network_id: String,
    /// Node the request went to, as we knew it then.
    pub node_id: String,
    pub url: String,
    pub created_at: String,
}

impl Handshake {
    pub fn new(message_id: impl Into<String>, network_id: impl Into<String>, target: &Node) -> Self {
        Self {
            message_id: message_id.into(),
            network_id: network_id.into(),
            node_id: target.node_id.clone(),
            url: target.url.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Whether `node` is the party the request was sent to.
    pub fn answered_by(&self, node: &Node) -> bool {
        node.node_id == self.node_id || node.url.trim_end_matches('/') == self.url.trim_end_matches('/')
    }
}

/// Store collaborator used by the federation layer.
///
/// `update_*` applies a partial JSON object (wire field names) on top of the
/// stored record and returns the result. Identity fields cannot be changed.
pub trait Storage: Send + Sync {
    fn load_network(&self, network_id: &str) -> Result<Network>;
    fn list_networks(&self) -> Result<Vec<Network>>;
    fn store_network(&self, network: &Network) -> Result<()>;
    fn update_network(&self, network_id: &str, patch: &Map<String, Value>) -> Result<Network>;
    fn delete_network(&self, network_id: &str) -> Result<bool>;

    fn load_node(&self, network_id: &str, node_id: &str) -> Result<Node>;
    fn list_nodes(&self, network_id: &str) -> Result<Vec<Node>>;
    fn store_node(&self, network_id: &str, node: &Node) -> Result<()>;
    fn update_node(&self, network_id: &str, node_id: &str, patch: &Map<String, Value>) -> Result<Node>;
    fn delete_node(&self, network_id: &str, node_id: &str) -> Result<bool>;
    /// Read, change and write back one node while holding the store's lock.
    fn modify_node(&self, network_id: &str, node_id: &str, change: &mut dyn FnMut(&mut Node)) -> Result<Node>;

    fn load_user(&self, user_id: &str) -> Result<User>;
    fn list_users(&self) -> Result<Vec<User>>;
    fn store_user(&self, user: &User) -> Result<()>;
    fn update_user(&self, user_id: &str, patch: &Map<String, Value>) -> Result<User>;
    fn delete_user(&self, user_id: &str) -> Result<bool>;

    /// PKCS#8 PEM private key the instance signs with in this network.
    fn store_network_key(&self, network_id: &str, private_key_pem: &str) -> Result<()>;
    fn load_network_key(&self, network_id: &str) -> Result<Option<String>>;

    fn store_pending(&self, pending: &PendingRelay) -> Result<()>;
    fn load_pending(&self, message_id: &str) -> Result<PendingRelay>;
    fn list_pending(&self, network_id: &str) -> Result<Vec<PendingRelay>>;
    fn delete_pending(&self, message_id: &str) -> Result<bool>;

    fn store_handshake(&self, handshake: &Handshake) -> Result<()>;
    fn load_handshake(&self, message_id: &str) -> Result<Handshake>;
    fn delete_handshake(&self, message_id: &str) -> Result<bool>;

    /// Approved members of a network.
    fn approved_nodes(&self, network_id: &str) -> Result<Vec<Node>> {
        Ok(self
            .list_nodes(network_id)?
            .into_iter()
            .filter(|n| n.approved)
            .collect())
    }
}

/// Merge `patch` into the JSON form of `record`. The `id_key` field must
/// be absent from the patch or unchanged.
pub(crate) fn apply_patch<T>(record: &T, patch: &Map<String, Value>, id_key: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(record)?;
    let Value::Object(map) = &mut value else {
        return Err(StorageError::InvalidUpdate("record is not an object".into()));
    };
    if let Some(new_id) = patch.get(id_key) {
        if map.get(id_key) != Some(new_id) {
            return Err(StorageError::InvalidUpdate(format!("{id_key} cannot change")));
        }
    }
    for (k, v) in patch {
        map.insert(k.clone(), v.clone());
    }
    Ok(serde_json::from_value(value)?)
}

pub(crate) fn not_found(kind: &'static str, id: &str) -> StorageError {
    StorageError::NotFound {
        kind,
        id: id.to_string(),
    }
}
