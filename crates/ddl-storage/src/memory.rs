//! In-memory storage for tests and ephemeral nodes.

use ddl_protocol::{Network, Node, User};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::{apply_patch, not_found, Handshake, PendingRelay, Result, Storage, StorageError};

#[derive(Default)]
struct Tables {
    networks: BTreeMap<String, Network>,
    nodes: BTreeMap<(String, String), Node>,
    users: BTreeMap<String, User>,
    keys: BTreeMap<String, String>,
    pending: BTreeMap<String, PendingRelay>,
    handshakes: BTreeMap<String, Handshake>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn node_key(network_id: &str, node_id: &str) -> (String, String) {
    (network_id.to_string(), node_id.to_string())
}

impl Storage for MemoryStorage {
    fn load_network(&self, network_id: &str) -> Result<Network> {
        self.db()?
            .networks
            .get(network_id)
            .cloned()
            .ok_or_else(|| not_found("network", network_id))
    }

    fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.db()?.networks.values().cloned().collect())
    }

    fn store_network(&self, network: &Network) -> Result<()> {
        self.db()?
            .networks
            .insert(network.network_id.clone(), network.clone());
        Ok(())
    }

    fn update_network(&self, network_id: &str, patch: &Map<String, Value>) -> Result<Network> {
        let mut db = self.db()?;
        let current = db
            .networks
            .get_mut(network_id)
            .ok_or_else(|| not_found("network", network_id))?;
        *current = apply_patch(&*current, patch, "networkId")?;
        Ok(current.clone())
    }

    fn delete_network(&self, network_id: &str) -> Result<bool> {
        Ok(self.db()?.networks.remove(network_id).is_some())
    }

    fn load_node(&self, network_id: &str, node_id: &str) -> Result<Node> {
        self.db()?
            .nodes
            .get(&node_key(network_id, node_id))
            .cloned()
            .ok_or_else(|| not_found("node", node_id))
    }

    fn list_nodes(&self, network_id: &str) -> Result<Vec<Node>> {
        Ok(self
            .db()?
            .nodes
            .iter()
            .filter(|((net, _), _)| net == network_id)
            .map(|(_, n)| n.clone())
            .collect())
    }

    fn store_node(&self, network_id: &str, node: &Node) -> Result<()> {
        self.db()?
            .nodes
            .insert(node_key(network_id, &node.node_id), node.clone());
        Ok(())
    }

    fn update_node(&self, network_id: &str, node_id: &str, patch: &Map<String, Value>) -> Result<Node> {
        let mut db = self.db()?;
        let current = db
            .nodes
            .get_mut(&node_key(network_id, node_id))
            .ok_or_else(|| not_found("node", node_id))?;
        *current = apply_patch(&*current, patch, "nodeId")?;
        Ok(current.clone())
    }

    fn delete_node(&self, network_id: &str, node_id: &str) -> Result<bool> {
        Ok(self.db()?.nodes.remove(&node_key(network_id, node_id)).is_some())
    }

    fn modify_node(&self, network_id: &str, node_id: &str, change: &mut dyn FnMut(&mut Node)) -> Result<Node> {
        let mut db = self.db()?;
        let current = db
            .nodes
            .get_mut(&node_key(network_id, node_id))
            .ok_or_else(|| not_found("node", node_id))?;
        change(current);
        Ok(current.clone())
    }

    fn load_user(&self, user_id: &str) -> Result<User> {
        self.db()?
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| not_found("user", user_id))
    }

    fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.db()?.users.values().cloned().collect())
    }

    fn store_user(&self, user: &User) -> Result<()> {
        self.db()?.users.insert(user.user_id.clone(), user.clone());
        Ok(())
    }

    fn update_user(&self, user_id: &str, patch: &Map<String, Value>) -> Result<User> {
        let mut db = self.db()?;
        let current = db
            .users
            .get_mut(user_id)
            .ok_or_else(|| not_found("user", user_id))?;
        *current = apply_patch(&*current, patch, "userId")?;
        Ok(current.clone())
    }

    fn delete_user(&self, user_id: &str) -> Result<bool> {
        Ok(self.db()?.users.remove(user_id).is_some())
    }

    fn store_network_key(&self, network_id: &str, private_key_pem: &str) -> Result<()> {
        self.db()?
            .keys
            .insert(network_id.to_string(), private_key_pem.to_string());
        Ok(())
    }

    fn load_network_key(&self, network_id: &str) -> Result<Option<String>> {
        Ok(self.db()?.keys.get(network_id).cloned())
    }

    fn store_pending(&self, pending: &PendingRelay) -> Result<()> {
        self.db()?
            .pending
            .insert(pending.message_id.clone(), pending.clone());
        Ok(())
    }

    fn load_pending(&self, message_id: &str) -> Result<PendingRelay> {
        self.db()?
            .pending
            .get(message_id)
            .cloned()
            .ok_or_else(|| not_found("pending relay", message_id))
    }

    fn list_pending(&self, network_id: &str) -> Result<Vec<PendingRelay>> {
        Ok(self
            .db()?
            .pending
            .values()
            .filter(|p| p.network_id == network_id)
            .cloned()
            .collect())
    }

    fn delete_pending(&self, message_id: &str) -> Result<bool> {
        Ok(self.db()?.pending.remove(message_id).is_some())
    }

    fn store_handshake(&self, handshake: &Handshake) -> Result<()> {
        self.db()?
            .handshakes
            .insert(handshake.message_id.clone(), handshake.clone());
        Ok(())
    }

    fn load_handshake(&self, message_id: &str) -> Result<Handshake> {
        self.db()?
            .handshakes
            .get(message_id)
            .cloned()
            .ok_or_else(|| not_found("handshake", message_id))
    }

    fn delete_handshake(&self, message_id: &str) -> Result<bool> {
        Ok(self.db()?.handshakes.remove(message_id).is_some())
    }
}
