use std::collections::HashMap;

use log::{info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::messages::ServerMessage;
use crate::models::UserId;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
}

type Outbound = mpsc::Sender<ServerMessage>;

/// Live realtime connections, keyed by user. Each connection is represented
/// by the sending half of its own bounded outbound queue, so a slow socket
/// only ever backs up its own queue.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, HashMap<ConnectionId, Outbound>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: UserId, outbound: Outbound) -> ConnectionHandle {
        let handle = ConnectionHandle {
            id: Uuid::new_v4(),
            user_id,
        };
        let mut connections = self.connections.write().await;
        let live = connections.entry(user_id).or_default();
        live.insert(handle.id, outbound);
        info!(
            "Registered connection {} for user {} ({} live)",
            handle.id,
            user_id,
            live.len()
        );
        handle
    }

    /// Removes one connection. Returns false if it was already gone.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        let Some(live) = connections.get_mut(&handle.user_id) else {
            return false;
        };
        let removed = live.remove(&handle.id).is_some();
        let remaining = live.len();
        if remaining == 0 {
            connections.remove(&handle.user_id);
        }
        if removed {
            info!(
                "Unregistered connection {} for user {} ({} live)",
                handle.id, handle.user_id, remaining
            );
        }
        removed
    }

    /// Queues `payload` on every live connection of `user_id` and returns how
    /// many accepted it. Connections whose queue is closed or full are evicted;
    /// the rest are unaffected.
    pub async fn send_to_user(&self, user_id: UserId, payload: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let connections = self.connections.read().await;
            let Some(live) = connections.get(&user_id) else {
                return 0;
            };
            for (id, outbound) in live {
                match outbound.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Connection {id} of user {user_id} is not keeping up, evicting");
                        failed.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!("Connection {id} of user {user_id} is closed, evicting");
                        failed.push(*id);
                    }
                }
            }
        }

        for id in failed {
            self.unregister(&ConnectionHandle { id, user_id }).await;
        }
        delivered
    }

    /// Queues `payload` on a single connection, evicting it on failure.
    pub async fn send_to_connection(
        &self,
        handle: &ConnectionHandle,
        payload: ServerMessage,
    ) -> bool {
        let outcome = {
            let connections = self.connections.read().await;
            connections
                .get(&handle.user_id)
                .and_then(|live| live.get(&handle.id))
                .map(|outbound| outbound.try_send(payload))
        };
        match outcome {
            Some(Ok(())) => true,
            Some(Err(_)) => {
                warn!("Dropping connection {} after a failed write", handle.id);
                self.unregister(handle).await;
                false
            }
            None => false,
        }
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }

    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.connections
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    pub async fn total_connections(&self) -> usize {
        self.connections.read().await.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_device_gets_one_copy() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = registry.register(42, tx_a).await;
        registry.register(42, tx_b).await;

        assert_eq!(registry.send_to_user(42, &ServerMessage::Pong).await, 2);
        assert_eq!(rx_a.recv().await, Some(ServerMessage::Pong));
        assert_eq!(rx_b.recv().await, Some(ServerMessage::Pong));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        assert!(registry.unregister(&a).await);
        assert_eq!(registry.send_to_user(42, &ServerMessage::Pong).await, 1);
        assert_eq!(rx_b.recv().await, Some(ServerMessage::Pong));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn last_unregister_drops_the_user_entry() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let handle = registry.register(7, tx).await;
        assert!(registry.is_online(7).await);

        assert!(registry.unregister(&handle).await);
        assert!(!registry.is_online(7).await);
        assert_eq!(registry.connection_count(7).await, 0);
        assert!(!registry.unregister(&handle).await);
    }

    #[tokio::test]
    async fn sending_to_an_offline_user_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.send_to_user(1, &ServerMessage::Pong).await, 0);
    }

    #[tokio::test]
    async fn broken_connection_is_evicted_without_affecting_others() {
        let registry = ConnectionRegistry::new();
        let (dead_tx, dead_rx) = mpsc::channel(4);
        let (live_tx, mut live_rx) = mpsc::channel(4);
        let (other_tx, mut other_rx) = mpsc::channel(4);
        registry.register(1, dead_tx).await;
        registry.register(1, live_tx).await;
        registry.register(2, other_tx).await;
        drop(dead_rx);

        assert_eq!(registry.send_to_user(1, &ServerMessage::Pong).await, 1);
        assert_eq!(registry.connection_count(1).await, 1);
        assert_eq!(live_rx.recv().await, Some(ServerMessage::Pong));

        assert_eq!(registry.send_to_user(2, &ServerMessage::Pong).await, 1);
        assert_eq!(other_rx.recv().await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn full_queue_counts_as_a_failed_write() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = registry.register(3, tx).await;

        assert_eq!(registry.send_to_user(3, &ServerMessage::Pong).await, 1);
        assert_eq!(registry.send_to_user(3, &ServerMessage::Pong).await, 0);
        assert!(!registry.is_online(3).await);
        assert!(!registry.send_to_connection(&handle, ServerMessage::Pong).await);

        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn concurrent_registration_is_consistent() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(1);
                let handle = registry.register(i % 4, tx).await;
                if i % 2 == 0 {
                    registry.unregister(&handle).await;
                }
                rx
            }));
        }
        let mut receivers = Vec::new();
        for task in tasks {
            receivers.push(task.await.unwrap());
        }
        assert_eq!(registry.total_connections().await, 16);
    }
}
