//! Process-wide node name → ClientConnection map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use cluster_core::ClusterError;

use crate::connection::ClientConnection;
use crate::options::ClientOptions;

struct NodeEntry {
    address: String,
    conn: Arc<ClientConnection>,
}

pub struct ClusterRegistry {
    nodes: RwLock<HashMap<String, NodeEntry>>,
    log: slog::Logger,
}

impl ClusterRegistry {
    pub fn new(log: slog::Logger) -> Self {
        ClusterRegistry { nodes: RwLock::new(HashMap::new()), log }
    }

    /// No-op if an entry already exists with the same address; otherwise marks
    /// any existing connection closing (grace-period teardown) and replaces
    /// it. Creation never dials, connecting stays lazy on first invoke.
    pub fn register(&self, name: impl Into<String>, address: impl Into<String>, options: ClientOptions) -> Arc<ClientConnection> {
        let name = name.into();
        let address = address.into();

        if let Some(existing) = self.nodes.read().get(&name) {
            if existing.address == address {
                return Arc::clone(&existing.conn);
            }
        }

        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&name) {
            if existing.address == address {
                return Arc::clone(&existing.conn);
            }
        }

        if let Some(stale) = nodes.remove(&name) {
            stale.conn.close();
        }

        let conn = ClientConnection::new(address.clone(), options, self.log.clone());
        nodes.insert(name, NodeEntry { address, conn: Arc::clone(&conn) });
        conn
    }

    pub fn remove(&self, name: &str) {
        if let Some(entry) = self.nodes.write().remove(name) {
            entry.conn.close();
        }
    }

    pub fn query(&self, name: &str) -> Option<Arc<ClientConnection>> {
        let nodes = self.nodes.read();
        nodes.get(name).and_then(|entry| if entry.conn.is_closing() { None } else { Some(Arc::clone(&entry.conn)) })
    }

    /// Bulk register; returns per-node errors (empty on full success).
    pub fn reload(&self, addresses: &HashMap<String, String>, options: ClientOptions) -> HashMap<String, ClusterError> {
        let mut errors = HashMap::new();
        for (name, address) in addresses {
            if address.trim().is_empty() {
                errors.insert(name.clone(), ClusterError::validation("node address must not be empty"));
                continue;
            }
            self.register(name.clone(), address.clone(), options.clone());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_for_the_same_address() {
        let registry = ClusterRegistry::new(cluster_core::logging::discard());
        let a = registry.register("db", "127.0.0.1:9", ClientOptions::default());
        let b = registry.register("db", "127.0.0.1:9", ClientOptions::default());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn register_replaces_and_closes_on_address_change() {
        let registry = ClusterRegistry::new(cluster_core::logging::discard());
        let a = registry.register("db", "127.0.0.1:9", ClientOptions::default());
        let b = registry.register("db", "127.0.0.1:10", ClientOptions::default());
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(a.is_closing());
    }

    #[test]
    fn query_hides_a_closing_connection() {
        let registry = ClusterRegistry::new(cluster_core::logging::discard());
        registry.register("db", "127.0.0.1:9", ClientOptions::default());
        registry.remove("db");
        assert!(registry.query("db").is_none());
    }

    #[test]
    fn reload_reports_empty_addresses_as_errors() {
        let registry = ClusterRegistry::new(cluster_core::logging::discard());
        let mut addresses = HashMap::new();
        addresses.insert("bad".to_string(), "".to_string());
        addresses.insert("good".to_string(), "127.0.0.1:9".to_string());
        let errors = registry.reload(&addresses, ClientOptions::default());
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key("bad"));
        assert!(registry.query("good").is_some());
    }
}
