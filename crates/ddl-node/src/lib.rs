//! DDL Node -- library crate behind the `ddl-node` binary.
//!
//! Wires configuration into a running [`Federation`]: storage, transport,
//! identity providers and the default handlers. Integration tests build
//! nodes through the same helpers.

pub mod config;
pub mod http;
pub mod maintenance;
pub mod membership;
pub mod oidc;

use ddl_crypto::NetworkKeyPair;
use ddl_federation::{Federation, OidcRegistry};
use ddl_storage::{SqliteStorage, Storage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{discovery_url_for, NodeConfig, NodeSection, OidcSection};
use crate::http::HttpTransport;
use crate::oidc::HttpOidcDriver;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// SQLite store named by `[node] database`.
pub fn open_storage(node: &NodeSection) -> anyhow::Result<Arc<dyn Storage>> {
    if node.database == ":memory:" {
        return Ok(Arc::new(SqliteStorage::open_in_memory()?));
    }
    let path = expand_tilde(&node.database);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %path.display(), "node: opening database");
    Ok(Arc::new(SqliteStorage::open(&path)?))
}

/// Write a private key readable only by its owner.
pub fn write_private_key(path: &Path, pem: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "node: private key written");
    Ok(())
}

/// Give every stored network without a signing key the one at `path`,
/// generating it on first use. Returns how many networks got the key.
pub fn install_network_key(storage: &dyn Storage, path: &Path) -> anyhow::Result<usize> {
    let mut missing = Vec::new();
    for network in storage.list_networks()? {
        if storage.load_network_key(&network.network_id)?.is_none() {
            missing.push(network.network_id);
        }
    }
    if missing.is_empty() {
        return Ok(0);
    }
    let pem = NetworkKeyPair::load_or_create(path)?.private_key_pem()?;
    for network_id in &missing {
        storage.store_network_key(network_id, &pem)?;
        tracing::info!(network_id, "node: network key installed");
    }
    Ok(missing.len())
}

/// Default driver for the configured issuer plus one per trusted issuer.
pub fn build_oidc(oidc: &OidcSection, http: &reqwest::Client) -> OidcRegistry {
    let mut registry = OidcRegistry::new();
    let Some(issuer) = oidc.issuer.as_deref() else {
        return registry;
    };
    let driver = |issuer: &str, discovery: Option<&str>| {
        Arc::new(HttpOidcDriver::new(
            http.clone(),
            issuer,
            discovery_url_for(issuer, discovery),
            oidc.client_id.clone(),
            oidc.client_secret.clone(),
        ))
    };
    registry.register(driver(issuer, oidc.discovery_url.as_deref()), true);
    for trusted in &oidc.trusted {
        registry.register(driver(&trusted.issuer, trusted.discovery_url.as_deref()), false);
    }
    tracing::info!(issuer, trusted = oidc.trusted.len(), "node: identity providers configured");
    registry
}

/// Federation with the HTTP transport, configured identity providers and
/// the default membership handlers.
pub fn build_federation(cfg: &NodeConfig, storage: Arc<dyn Storage>) -> anyhow::Result<Federation> {
    let timeout = Duration::from_secs(cfg.node.request_timeout_secs);
    let transport = HttpTransport::new(timeout)?;
    let http = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Federation::new(cfg.ddl.clone(), storage, Arc::new(transport))
        .with_oidc(build_oidc(&cfg.oidc, &http))
        .with_handlers(membership::node_handlers())
        .with_federation_path(cfg.node.federation_path.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddl_protocol::Network;
    use ddl_storage::MemoryStorage;

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/etc/ddl.toml"), PathBuf::from("/etc/ddl.toml"));
        if let Some(home) = dirs_or_home() {
            assert_eq!(expand_tilde("~/.ddl/ddl.db"), home.join(".ddl/ddl.db"));
        }
    }

    #[test]
    fn test_install_network_key_fills_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.pem");
        let existing = NetworkKeyPair::generate_with_bits(1024).unwrap();
        std::fs::write(&path, existing.private_key_pem().unwrap()).unwrap();

        let storage = MemoryStorage::new();
        storage.store_network(&Network::new("net-1", "One", "a")).unwrap();
        storage.store_network(&Network::new("net-2", "Two", "a")).unwrap();
        storage.store_network_key("net-2", "already-there").unwrap();

        assert_eq!(install_network_key(&storage, &path).unwrap(), 1);
        assert_eq!(
            storage.load_network_key("net-1").unwrap(),
            Some(existing.private_key_pem().unwrap())
        );
        assert_eq!(storage.load_network_key("net-2").unwrap().as_deref(), Some("already-there"));
        assert_eq!(install_network_key(&storage, &path).unwrap(), 0);
    }

    #[test]
    fn test_write_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("network.pem");
        let keys = NetworkKeyPair::generate_with_bits(1024).unwrap();
        write_private_key(&path, &keys.private_key_pem().unwrap()).unwrap();
        let loaded = NetworkKeyPair::from_file(&path).unwrap();
        assert_eq!(loaded.public_key_pem().unwrap(), keys.public_key_pem().unwrap());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_build_oidc() {
        let http = reqwest::Client::new();
        assert!(build_oidc(&OidcSection::default(), &http).is_empty());

        let cfg: NodeConfig = toml::from_str(
            r#"
[oidc]
issuer = "https://idp.a.example"
client_id = "a"

[[oidc.trusted]]
issuer = "https://idp.b.example"
"#,
        )
        .unwrap();
        let registry = build_oidc(&cfg.oidc, &http);
        assert_eq!(registry.default_issuer(), Some("https://idp.a.example"));
        assert!(registry.resolve(Some("https://idp.b.example")).is_some());
        assert!(registry.resolve(Some("https://idp.c.example")).is_none());
    }

    #[test]
    fn test_open_storage_in_memory() {
        let node = NodeSection {
            database: ":memory:".into(),
            ..NodeSection::default()
        };
        let storage = open_storage(&node).unwrap();
        assert!(storage.list_networks().unwrap().is_empty());
    }
}
