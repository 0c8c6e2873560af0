use dashmap::DashMap;
use heronmq_protocol::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mqtt::ConnectionId;

/// The registry of live connections, keyed by client id.
///
/// Each entry hands out the connection's outbound packet channel. The channel
/// is drained by the owning connection task, which serializes all writes to
/// that socket, so packets queued here reach a given subscriber in order.
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<String, ConnectionHandle>,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub sender: mpsc::UnboundedSender<Packet>,
    /// Cancelling this token makes the owning task close its socket.
    pub token: CancellationToken,
}

impl ConnectionManager {
    pub fn new() -> ConnectionManager {
        ConnectionManager::default()
    }

    /// Register a connection for `client_id`.
    ///
    /// If another connection is already registered the new one wins: the old
    /// handle is returned so the caller can cancel it, and no further packets
    /// will reach it through the registry [MQTT-3.1.4-2].
    pub fn register(&self, client_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(client_id.to_owned(), handle)
    }

    /// Deregister, but only if `connection_id` still owns the registration.
    ///
    /// A connection that was taken over must not remove its successor.
    pub fn remove(&self, client_id: &str, connection_id: ConnectionId) {
        self.connections
            .remove_if(client_id, |_, handle| handle.id == connection_id);
    }

    /// Which connection currently holds the registration for `client_id`.
    pub fn owner(&self, client_id: &str) -> Option<ConnectionId> {
        self.connections.get(client_id).map(|entry| entry.id)
    }

    /// The outbound channel for a connected client, if any.
    pub fn sender(&self, client_id: &str) -> Option<mpsc::UnboundedSender<Packet>> {
        self.connections
            .get(client_id)
            .map(|entry| entry.sender.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: ConnectionId) -> (ConnectionHandle, mpsc::UnboundedReceiver<Packet>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            ConnectionHandle {
                id,
                sender,
                token: CancellationToken::new(),
            },
            receiver,
        )
    }

    #[test]
    fn register_returns_the_replaced_handle() {
        let manager = ConnectionManager::new();

        let (first, _rx1) = handle(1);
        assert!(manager.register("c1", first).is_none());

        let (second, _rx2) = handle(2);
        let replaced = manager.register("c1", second).expect("first handle");
        assert_eq!(replaced.id, 1);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn remove_only_applies_to_the_owning_connection() {
        let manager = ConnectionManager::new();

        let (first, _rx1) = handle(1);
        manager.register("c1", first);

        let (second, _rx2) = handle(2);
        manager.register("c1", second);

        // The replaced connection tears down late; it must not evict its successor.
        manager.remove("c1", 1);
        assert!(manager.sender("c1").is_some());

        manager.remove("c1", 2);
        assert!(manager.sender("c1").is_none());
        assert!(manager.is_empty());
    }
}
