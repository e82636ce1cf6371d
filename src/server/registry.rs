use std::collections::HashMap;

use tokio::sync::Mutex;

use super::connection::{ConnectionHandle, ConnectionId};

/// A registered client: its write handle and chosen display name.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub connection: ConnectionHandle,
    pub name: String,
}

/// The shared table of active connections.
///
/// Every operation takes the single mutex exactly once, so insert, remove and
/// snapshot are totally ordered with respect to each other. The lock is never
/// held across a network write: `snapshot` copies handles out and the caller
/// writes after the guard is dropped.
#[derive(Debug, Default)]
pub struct Registry {
    clients: Mutex<HashMap<ConnectionId, ClientEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a client. Returns `false` (and leaves the existing entry alone)
    /// if this connection is already registered.
    pub async fn register(&self, connection: ConnectionHandle, name: impl Into<String>) -> bool {
        let mut clients = self.clients.lock().await;
        let id = connection.id();
        if clients.contains_key(&id) {
            return false;
        }
        clients.insert(
            id,
            ClientEntry {
                connection,
                name: name.into(),
            },
        );
        true
    }

    /// Remove a client, returning its display name. A second call for the same
    /// id, or a call for a connection that never registered, returns `None`.
    pub async fn unregister(&self, id: ConnectionId) -> Option<String> {
        self.clients.lock().await.remove(&id).map(|entry| entry.name)
    }

    /// Every registered connection except `excluding`, taken at one instant.
    pub async fn snapshot(&self, excluding: Option<ConnectionId>) -> Vec<ConnectionHandle> {
        let clients = self.clients.lock().await;
        clients
            .values()
            .filter(|entry| Some(entry.connection.id()) != excluding)
            .map(|entry| entry.connection.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.clients.lock().await.contains_key(&id)
    }

    /// Display names currently registered, sorted. Names may repeat.
    pub async fn names(&self) -> Vec<String> {
        let clients = self.clients.lock().await;
        let mut names: Vec<String> = clients.values().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    /// Empty the table, returning what was in it. Used at server stop.
    pub async fn drain(&self) -> Vec<ClientEntry> {
        self.clients.lock().await.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new(ConnectionId::next(), "test", tokio::io::sink())
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let registry = Registry::new();
        let alice = handle();

        assert!(registry.register(alice.clone(), "alice").await);
        assert!(registry.contains(alice.id()).await);
        assert_eq!(registry.unregister(alice.id()).await.as_deref(), Some("alice"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_register_keeps_first_entry() {
        let registry = Registry::new();
        let alice = handle();

        assert!(registry.register(alice.clone(), "alice").await);
        assert!(!registry.register(alice.clone(), "mallory").await);
        assert_eq!(registry.names().await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn second_unregister_is_noop() {
        let registry = Registry::new();
        let alice = handle();
        let bob = handle();
        registry.register(alice.clone(), "alice").await;
        registry.register(bob.clone(), "bob").await;

        assert!(registry.unregister(bob.id()).await.is_some());
        assert!(registry.unregister(bob.id()).await.is_none());
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(alice.id()).await);
    }

    #[tokio::test]
    async fn unregister_unknown_is_noop() {
        let registry = Registry::new();
        assert!(registry.unregister(ConnectionId::next()).await.is_none());
    }

    #[tokio::test]
    async fn snapshot_excludes_given_connection() {
        let registry = Registry::new();
        let handles: Vec<_> = (0..4).map(|_| handle()).collect();
        for (i, h) in handles.iter().enumerate() {
            registry.register(h.clone(), format!("user{}", i)).await;
        }

        let snap = registry.snapshot(Some(handles[2].id())).await;
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().all(|h| h.id() != handles[2].id()));

        assert_eq!(registry.snapshot(None).await.len(), 4);
    }

    #[tokio::test]
    async fn unregistered_connection_never_in_later_snapshot() {
        let registry = Registry::new();
        let alice = handle();
        registry.register(alice.clone(), "alice").await;
        registry.unregister(alice.id()).await;

        assert!(registry.snapshot(None).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_are_all_kept() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for i in 0..200 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register(handle(), format!("user{}", i)).await
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }

        assert_eq!(registry.len().await, 200);
    }

    #[tokio::test]
    async fn same_name_registers_twice() {
        let registry = Registry::new();
        registry.register(handle(), "alice").await;
        registry.register(handle(), "alice").await;

        assert_eq!(registry.names().await, vec!["alice", "alice"]);
    }

    #[tokio::test]
    async fn drain_empties_table() {
        let registry = Registry::new();
        registry.register(handle(), "a").await;
        registry.register(handle(), "b").await;

        assert_eq!(registry.drain().await.len(), 2);
        assert!(registry.is_empty().await);
    }
}
