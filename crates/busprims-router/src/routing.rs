use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use busprims_core::client_name;
use serde::Serialize;

/// What [`RoutingTable::register`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// First identity seen for this client.
    New,
    /// The client was already mapped to the same identity.
    Unchanged,
    /// The client moved; carries the identity it replaced.
    Replaced(Bytes),
}

/// One routing table entry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub client_id: i32,
    pub client: String,
    pub identity: String,
}

/// Map from logical client id to the last identity it was observed on.
///
/// Guarded by its own lock so diagnostics can read it while the bus thread
/// writes.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Mutex<HashMap<i32, Bytes>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `client_id` to `identity`. Last writer wins.
    pub fn register(&self, client_id: i32, identity: Bytes) -> Registration {
        match self.lock().insert(client_id, identity.clone()) {
            None => Registration::New,
            Some(previous) if previous == identity => Registration::Unchanged,
            Some(previous) => Registration::Replaced(previous),
        }
    }

    pub fn lookup(&self, client_id: i32) -> Option<Bytes> {
        self.lock().get(&client_id).cloned()
    }

    /// Remove the entry for `client_id`, returning its identity.
    pub fn evict(&self, client_id: i32) -> Option<Bytes> {
        self.lock().remove(&client_id)
    }

    /// Remove every entry pointing at `identity`, returning the evicted ids.
    pub fn evict_identity(&self, identity: &[u8]) -> Vec<i32> {
        let mut routes = self.lock();
        let mut evicted: Vec<i32> = routes
            .iter()
            .filter(|(_, bound)| bound.as_ref() == identity)
            .map(|(id, _)| *id)
            .collect();
        for id in &evicted {
            routes.remove(id);
        }
        evicted.sort_unstable();
        evicted
    }

    /// Entries ordered by client id.
    pub fn snapshot(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self
            .lock()
            .iter()
            .map(|(id, identity)| Route {
                client_id: *id,
                client: client_name(*id),
                identity: String::from_utf8_lossy(identity).into_owned(),
            })
            .collect();
        routes.sort_by_key(|route| route.client_id);
        routes
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i32, Bytes>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use busprims_core::ClientId;

    use super::*;

    #[test]
    fn register_then_lookup() {
        let table = RoutingTable::new();
        assert!(table.is_empty());
        assert_eq!(
            table.register(ClientId::Manager.as_i32(), Bytes::from_static(b"manager")),
            Registration::New
        );
        assert_eq!(
            table.lookup(ClientId::Manager.as_i32()),
            Some(Bytes::from_static(b"manager"))
        );
        assert_eq!(table.lookup(ClientId::Ui.as_i32()), None);
    }

    #[test]
    fn last_writer_wins() {
        let table = RoutingTable::new();
        let peer = ClientId::Peer.as_i32();
        table.register(peer, Bytes::from_static(b"peer-a"));
        assert_eq!(
            table.register(peer, Bytes::from_static(b"peer-a")),
            Registration::Unchanged
        );
        assert_eq!(
            table.register(peer, Bytes::from_static(b"peer-b")),
            Registration::Replaced(Bytes::from_static(b"peer-a"))
        );
        assert_eq!(table.lookup(peer), Some(Bytes::from_static(b"peer-b")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn evict_by_identity_removes_all_aliases() {
        let table = RoutingTable::new();
        table.register(0, Bytes::from_static(b"shared"));
        table.register(2, Bytes::from_static(b"shared"));
        table.register(1, Bytes::from_static(b"other"));

        assert_eq!(table.evict_identity(b"shared"), vec![0, 2]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.evict(1), Some(Bytes::from_static(b"other")));
        assert!(table.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_and_named() {
        let table = RoutingTable::new();
        table.register(ClientId::Ui.as_i32(), Bytes::from_static(b"uixxxxx"));
        table.register(ClientId::Manager.as_i32(), Bytes::from_static(b"manager"));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].client_id, 0);
        assert_eq!(snapshot[0].identity, "manager");
        assert_eq!(snapshot[1].client, client_name(ClientId::Ui.as_i32()));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json[1]["identity"], "uixxxxx");
    }
}
