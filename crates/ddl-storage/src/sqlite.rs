//! SQLite-backed storage.
//!
//! WAL mode + busy_timeout. One JSON body column per record; identity
//! columns are duplicated out of the body for keyed lookup.

use ddl_protocol::{Network, Node, User};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;

use crate::{apply_patch, not_found, Handshake, PendingRelay, Result, Storage, StorageError};

const SCHEMA_VERSION: u32 = 1;

/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        let storage = Self::init(conn)?;
        tracing::info!(path = %db_path.display(), "store: opened sqlite database");
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?
            .unwrap_or(0);
        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_body<T: DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<T>> {
        let body: Option<String> = conn.query_row(sql, params, |row| row.get(0)).optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    fn read_bodies<T: DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StorageError::from))
            .collect()
    }

    fn write_network(conn: &Connection, network: &Network) -> Result<()> {
        conn.execute(
            "INSERT INTO networks (network_id, body, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(network_id) DO UPDATE SET
               body = excluded.body,
               updated_at = datetime('now')",
            params![network.network_id, serde_json::to_string(network)?],
        )?;
        Ok(())
    }

    fn write_node(conn: &Connection, network_id: &str, node: &Node) -> Result<()> {
        conn.execute(
            "INSERT INTO nodes (network_id, node_id, body, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(network_id, node_id) DO UPDATE SET
               body = excluded.body,
               updated_at = datetime('now')",
            params![network_id, node.node_id, serde_json::to_string(node)?],
        )?;
        Ok(())
    }

    fn write_user(conn: &Connection, user: &User) -> Result<()> {
        conn.execute(
            "INSERT INTO users (user_id, body, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(user_id) DO UPDATE SET
               body = excluded.body,
               updated_at = datetime('now')",
            params![user.user_id, serde_json::to_string(user)?],
        )?;
        Ok(())
    }

    fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn pending_from_columns(cols: (String, String, String, String, String)) -> Result<PendingRelay> {
        let (message_id, network_id, recipients, body, created_at) = cols;
        Ok(PendingRelay {
            message_id,
            network_id,
            recipient_ids: serde_json::from_str(&recipients)?,
            body: serde_json::from_str(&body)?,
            created_at,
        })
    }
}

impl Storage for SqliteStorage {
    fn load_network(&self, network_id: &str) -> Result<Network> {
        let conn = self.db()?;
        Self::read_body(&conn, "SELECT body FROM networks WHERE network_id = ?1", params![network_id])?
            .ok_or_else(|| not_found("network", network_id))
    }

    fn list_networks(&self) -> Result<Vec<Network>> {
        let conn = self.db()?;
        Self::read_bodies(&conn, "SELECT body FROM networks ORDER BY network_id", [])
    }

    fn store_network(&self, network: &Network) -> Result<()> {
        let conn = self.db()?;
        Self::write_network(&conn, network)
    }

    fn update_network(&self, network_id: &str, patch: &Map<String, Value>) -> Result<Network> {
        let conn = self.db()?;
        let current: Network =
            Self::read_body(&conn, "SELECT body FROM networks WHERE network_id = ?1", params![network_id])?
                .ok_or_else(|| not_found("network", network_id))?;
        let updated = apply_patch(&current, patch, "networkId")?;
        Self::write_network(&conn, &updated)?;
        Ok(updated)
    }

    fn delete_network(&self, network_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute("DELETE FROM networks WHERE network_id = ?1", params![network_id])?;
        Ok(changes > 0)
    }

    fn load_node(&self, network_id: &str, node_id: &str) -> Result<Node> {
        let conn = self.db()?;
        Self::read_body(
            &conn,
            "SELECT body FROM nodes WHERE network_id = ?1 AND node_id = ?2",
            params![network_id, node_id],
        )?
        .ok_or_else(|| not_found("node", node_id))
    }

    fn list_nodes(&self, network_id: &str) -> Result<Vec<Node>> {
        let conn = self.db()?;
        Self::read_bodies(
            &conn,
            "SELECT body FROM nodes WHERE network_id = ?1 ORDER BY node_id",
            params![network_id],
        )
    }

    fn store_node(&self, network_id: &str, node: &Node) -> Result<()> {
        let conn = self.db()?;
        Self::write_node(&conn, network_id, node)
    }

    fn update_node(&self, network_id: &str, node_id: &str, patch: &Map<String, Value>) -> Result<Node> {
        let conn = self.db()?;
        let current: Node = Self::read_body(
            &conn,
            "SELECT body FROM nodes WHERE network_id = ?1 AND node_id = ?2",
            params![network_id, node_id],
        )?
        .ok_or_else(|| not_found("node", node_id))?;
        let updated = apply_patch(&current, patch, "nodeId")?;
        Self::write_node(&conn, network_id, &updated)?;
        Ok(updated)
    }

    fn modify_node(&self, network_id: &str, node_id: &str, change: &mut dyn FnMut(&mut Node)) -> Result<Node> {
        let conn = self.db()?;
        let mut node: Node = Self::read_body(
            &conn,
            "SELECT body FROM nodes WHERE network_id = ?1 AND node_id = ?2",
            params![network_id, node_id],
        )?
        .ok_or_else(|| not_found("node", node_id))?;
        change(&mut node);
        Self::write_node(&conn, network_id, &node)?;
        Ok(node)
    }

    fn delete_node(&self, network_id: &str, node_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "DELETE FROM nodes WHERE network_id = ?1 AND node_id = ?2",
            params![network_id, node_id],
        )?;
        Ok(changes > 0)
    }

    fn load_user(&self, user_id: &str) -> Result<User> {
        let conn = self.db()?;
        Self::read_body(&conn, "SELECT body FROM users WHERE user_id = ?1", params![user_id])?
            .ok_or_else(|| not_found("user", user_id))
    }

    fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.db()?;
        Self::read_bodies(&conn, "SELECT body FROM users ORDER BY user_id", [])
    }

    fn store_user(&self, user: &User) -> Result<()> {
        let conn = self.db()?;
        Self::write_user(&conn, user)
    }

    fn update_user(&self, user_id: &str, patch: &Map<String, Value>) -> Result<User> {
        let conn = self.db()?;
        let current: User = Self::read_body(&conn, "SELECT body FROM users WHERE user_id = ?1", params![user_id])?
            .ok_or_else(|| not_found("user", user_id))?;
        let updated = apply_patch(&current, patch, "userId")?;
        Self::write_user(&conn, &updated)?;
        Ok(updated)
    }

    fn delete_user(&self, user_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
        Ok(changes > 0)
    }

    fn store_network_key(&self, network_id: &str, private_key_pem: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO network_keys (network_id, private_key_pem) VALUES (?1, ?2)
             ON CONFLICT(network_id) DO UPDATE SET private_key_pem = excluded.private_key_pem",
            params![network_id, private_key_pem],
        )?;
        Ok(())
    }

    fn load_network_key(&self, network_id: &str) -> Result<Option<String>> {
        let conn = self.db()?;
        let pem = conn
            .query_row(
                "SELECT private_key_pem FROM network_keys WHERE network_id = ?1",
                params![network_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pem)
    }

    fn store_pending(&self, pending: &PendingRelay) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO pending_relays (message_id, network_id, recipient_ids, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(message_id) DO UPDATE SET
               recipient_ids = excluded.recipient_ids,
               body = excluded.body",
            params![
                pending.message_id,
                pending.network_id,
                serde_json::to_string(&pending.recipient_ids)?,
                serde_json::to_string(&pending.body)?,
                pending.created_at,
            ],
        )?;
        Ok(())
    }

    fn load_pending(&self, message_id: &str) -> Result<PendingRelay> {
        let conn = self.db()?;
        let cols = conn
            .query_row(
                "SELECT message_id, network_id, recipient_ids, body, created_at
                 FROM pending_relays WHERE message_id = ?1",
                params![message_id],
                Self::row_to_pending,
            )
            .optional()?
            .ok_or_else(|| not_found("pending relay", message_id))?;
        Self::pending_from_columns(cols)
    }

    fn list_pending(&self, network_id: &str) -> Result<Vec<PendingRelay>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, network_id, recipient_ids, body, created_at
             FROM pending_relays WHERE network_id = ?1 ORDER BY created_at, message_id",
        )?;
        let rows = stmt
            .query_map(params![network_id], Self::row_to_pending)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::pending_from_columns).collect()
    }

    fn delete_pending(&self, message_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute("DELETE FROM pending_relays WHERE message_id = ?1", params![message_id])?;
        Ok(changes > 0)
    }

    fn store_handshake(&self, handshake: &Handshake) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR REPLACE INTO handshakes (message_id, network_id, body) VALUES (?1, ?2, ?3)",
            params![handshake.message_id, handshake.network_id, serde_json::to_string(handshake)?],
        )?;
        Ok(())
    }

    fn load_handshake(&self, message_id: &str) -> Result<Handshake> {
        let conn = self.db()?;
        Self::read_body(&conn, "SELECT body FROM handshakes WHERE message_id = ?1", params![message_id])?
            .ok_or_else(|| not_found("handshake", message_id))
    }

    fn delete_handshake(&self, message_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute("DELETE FROM handshakes WHERE message_id = ?1", params![message_id])?;
        Ok(changes > 0)
    }
}
