// Process-wide table of live vehicle connections, keyed by device id.
// Register-or-displace is a single atomic map insert; the listener marks
// the displaced predecessor draining.
use dashmap::DashMap;
use std::sync::Arc;

use crate::connection::ConnectionHandle;

#[derive(Default)]
pub struct ConnectionRegistry {
    conns: DashMap<String, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the handle, returning the displaced connection when the
    /// vehicle already had a live one (last-writer-wins).
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let displaced = self
            .conns
            .insert(handle.device_id().to_string(), Arc::clone(&handle));
        metrics::gauge!("fleetline_connections_active").set(self.conns.len() as f64);
        displaced
    }

    /// Remove the handle only if the slot still holds this exact
    /// connection; a replacement registered in the meantime stays.
    pub fn unregister(&self, handle: &Arc<ConnectionHandle>) {
        self.conns
            .remove_if(handle.device_id(), |_, current| {
                Arc::ptr_eq(current, handle)
            });
        metrics::gauge!("fleetline_connections_active").set(self.conns.len() as f64);
    }

    pub fn lookup(&self, device_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.conns.get(device_id).map(|entry| Arc::clone(&entry))
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Snapshot of the live handles, used by the ack-expiry sweeper and
    /// by process shutdown.
    pub fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.conns
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnState;
    use crate::identity::VehicleIdentity;

    fn handle(device_id: &str, id: u64) -> Arc<ConnectionHandle> {
        let identity = VehicleIdentity::from_device_id(device_id).expect("identity");
        let (handle, _rx) =
            ConnectionHandle::new(identity, "127.0.0.1:4000".parse().unwrap(), id, 8);
        handle
    }

    #[test]
    fn register_displaces_existing_connection() {
        let registry = ConnectionRegistry::new();
        let first = handle("d1", 1);
        let second = handle("d1", 2);

        assert!(registry.register(Arc::clone(&first)).is_none());
        let displaced = registry.register(Arc::clone(&second)).expect("displaced");
        assert_eq!(displaced.id(), 1);

        // The caller drains the displaced connection; afterwards the slot
        // must still resolve to the replacement.
        displaced.begin_drain();
        assert_eq!(displaced.state(), ConnState::Draining);
        assert_eq!(registry.lookup("d1").expect("lookup").id(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_ignores_replaced_handles() {
        let registry = ConnectionRegistry::new();
        let first = handle("d1", 1);
        let second = handle("d1", 2);
        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));

        // The displaced connection's teardown must not evict its
        // replacement.
        registry.unregister(&first);
        assert_eq!(registry.lookup("d1").expect("lookup").id(), 2);

        registry.unregister(&second);
        assert!(registry.lookup("d1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn handles_snapshots_all_connections() {
        let registry = ConnectionRegistry::new();
        registry.register(handle("d1", 1));
        registry.register(handle("d2", 2));
        assert_eq!(registry.handles().len(), 2);
    }
}
