use std::future::Future;
use std::sync::Arc;

use log::{debug, error};
use tokio::sync::{mpsc, Mutex};

use crate::error::{CareError, CareResult};
use crate::message_store::MessageStore;
use crate::messages::ServerMessage;
use crate::models::{Message, UserId};
use crate::registry::ConnectionRegistry;

struct Dispatch {
    recipients: Vec<UserId>,
    payload: ServerMessage,
}

/// Single entry point for new messages. A message is persisted first and
/// only then handed to the fan-out worker, so a lost push never means a lost
/// message: history still has it.
pub struct DeliveryEngine {
    messages: MessageStore,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    // Held across persist + enqueue so fan-out order matches storage order.
    submit_order: Mutex<()>,
    max_message_len: usize,
}

impl DeliveryEngine {
    /// Builds the engine and spawns its fan-out worker on the current runtime.
    pub fn start(
        messages: MessageStore,
        registry: Arc<ConnectionRegistry>,
        max_message_len: usize,
    ) -> Arc<Self> {
        let (dispatch, queue) = mpsc::unbounded_channel();
        tokio::spawn(supervise(queue, move |queue| fan_out(queue, registry.clone())));
        Arc::new(DeliveryEngine {
            messages,
            dispatch,
            submit_order: Mutex::new(()),
            max_message_len,
        })
    }

    pub async fn submit(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        body: &str,
    ) -> CareResult<Message> {
        if body.trim().is_empty() {
            return Err(CareError::Validation("message text is empty".into()));
        }
        if body.chars().count() > self.max_message_len {
            return Err(CareError::Validation(format!(
                "message text exceeds {} characters",
                self.max_message_len
            )));
        }

        let _order = self.submit_order.lock().await;
        let message = self.messages.append(sender_id, recipient_id, body).await?;
        self.enqueue(
            vec![recipient_id, sender_id],
            ServerMessage::ReceiveMessage(message.clone()),
        );
        Ok(message)
    }

    /// Pushes an out-of-band event to every live connection of `recipients`.
    pub fn notify(&self, recipients: &[UserId], payload: ServerMessage) {
        self.enqueue(recipients.to_vec(), payload);
    }

    pub async fn history(&self, user_id: UserId, counterparty: UserId) -> Vec<Message> {
        self.messages.conversation(user_id, counterparty).await
    }

    fn enqueue(&self, mut recipients: Vec<UserId>, payload: ServerMessage) {
        recipients.sort_unstable();
        recipients.dedup();
        if self.dispatch.send(Dispatch { recipients, payload }).is_err() {
            error!("Fan-out worker is gone; live delivery skipped");
        }
    }
}

/// Runs `worker` over the shared `queue`, starting a fresh one whenever the
/// previous one panics. Items still queued are picked up by the replacement.
async fn supervise<T, W, Fut>(queue: mpsc::UnboundedReceiver<T>, worker: W)
where
    T: Send + 'static,
    W: Fn(Arc<Mutex<mpsc::UnboundedReceiver<T>>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let queue = Arc::new(Mutex::new(queue));
    loop {
        match tokio::spawn(worker(queue.clone())).await {
            Err(e) if e.is_panic() => error!("Fan-out worker panicked, restarting"),
            _ => break,
        }
    }
}

async fn fan_out(
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Dispatch>>>,
    registry: Arc<ConnectionRegistry>,
) {
    let mut queue = queue.lock().await;
    while let Some(dispatch) = queue.recv().await {
        for user_id in &dispatch.recipients {
            let delivered = registry.send_to_user(*user_id, &dispatch.payload).await;
            debug!("Fan-out to user {user_id}: {delivered} connection(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::store::Database;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn engine() -> (Arc<DeliveryEngine>, Arc<ConnectionRegistry>) {
        let db = Arc::new(Database::in_memory());
        for (id, role) in [(1, Role::Patient), (2, Role::Doctor), (3, Role::Volunteer)] {
            db.insert_user(id, &format!("{id}@example.org"), "x", role, &format!("t{id}"))
                .await
                .unwrap();
        }
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = DeliveryEngine::start(MessageStore::new(db), registry.clone(), 64);
        (engine, registry)
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("fan-out timed out")
            .expect("connection queue closed")
    }

    #[tokio::test]
    async fn submit_reaches_both_parties_and_history() {
        let (engine, registry) = engine().await;
        let (sender_tx, mut sender_rx) = mpsc::channel(8);
        let (recipient_tx, mut recipient_rx) = mpsc::channel(8);
        registry.register(1, sender_tx).await;
        registry.register(2, recipient_tx).await;

        let message = engine.submit(1, 2, "hello").await.unwrap();
        let expected = ServerMessage::ReceiveMessage(message.clone());
        assert_eq!(next(&mut recipient_rx).await, expected);
        assert_eq!(next(&mut sender_rx).await, expected);
        assert_eq!(engine.history(2, 1).await, vec![message]);
    }

    #[tokio::test]
    async fn offline_recipient_still_gets_history() {
        let (engine, _registry) = engine().await;
        let message = engine.submit(3, 1, "checking in").await.unwrap();
        assert_eq!(engine.history(1, 3).await, vec![message]);
    }

    #[tokio::test]
    async fn per_connection_order_matches_submission_order() {
        let (engine, registry) = engine().await;
        let (tx, mut rx) = mpsc::channel(64);
        registry.register(2, tx).await;

        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(engine.submit(1, 2, &format!("m{i}")).await.unwrap().id);
        }
        for id in ids {
            match next(&mut rx).await {
                ServerMessage::ReceiveMessage(message) => assert_eq!(message.id, id),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn self_addressed_message_is_pushed_once_per_connection() {
        let (engine, registry) = engine().await;
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(1, tx).await;
        engine.submit(1, 1, "note to self").await.unwrap();
        next(&mut rx).await;
        engine.notify(&[1], ServerMessage::Pong);
        assert_eq!(next(&mut rx).await, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn invalid_submissions_write_nothing() {
        let (engine, _registry) = engine().await;
        assert!(matches!(
            engine.submit(1, 2, "   ").await,
            Err(CareError::Validation(_))
        ));
        assert!(matches!(
            engine.submit(1, 2, &"x".repeat(65)).await,
            Err(CareError::Validation(_))
        ));
        assert!(matches!(
            engine.submit(1, 404, "hi").await,
            Err(CareError::NotFound(_))
        ));
        assert!(engine.history(1, 2).await.is_empty());
    }

    #[tokio::test]
    async fn dead_connection_does_not_fail_submit() {
        let (engine, registry) = engine().await;
        let (dead_tx, dead_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        registry.register(2, dead_tx).await;
        registry.register(2, live_tx).await;
        drop(dead_rx);

        let message = engine.submit(1, 2, "still here").await.unwrap();
        assert_eq!(next(&mut live_rx).await, ServerMessage::ReceiveMessage(message));
        timeout(Duration::from_secs(2), async {
            while registry.connection_count(2).await != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dead connection was not evicted");
    }

    #[tokio::test]
    async fn worker_restarts_after_a_panic() {
        let (queue_tx, queue) = mpsc::unbounded_channel::<u32>();
        let (out_tx, mut out) = mpsc::unbounded_channel();
        tokio::spawn(supervise(queue, move |queue| {
            let out_tx = out_tx.clone();
            async move {
                let mut queue = queue.lock().await;
                while let Some(item) = queue.recv().await {
                    assert_ne!(item, 0, "unprocessable dispatch");
                    let _ = out_tx.send(item);
                }
            }
        }));

        queue_tx.send(0).unwrap();
        queue_tx.send(7).unwrap();
        let delivered = timeout(Duration::from_secs(2), out.recv()).await.unwrap();
        assert_eq!(delivered, Some(7));
    }
}
