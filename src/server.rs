use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::timeout;
use warp::ws::{Message, WebSocket};

use crate::config::Config;
use crate::delivery::DeliveryEngine;
use crate::error::CareError;
use crate::messages::{ClientMessage, ServerMessage};
use crate::models::Identity;
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Drives realtime connections. The handshake credential has already been
/// resolved by the time a socket reaches [`Server::handle_connection`].
#[derive(Clone)]
pub struct Server {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<DeliveryEngine>,
    outbound_queue: usize,
    send_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl Server {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<DeliveryEngine>,
        config: &Config,
    ) -> Self {
        Server {
            registry,
            engine,
            outbound_queue: config.outbound_queue,
            send_timeout: config.send_timeout,
            idle_timeout: config.idle_timeout,
        }
    }

    pub async fn handle_connection(&self, ws: WebSocket, identity: Identity) {
        let (ws_tx, mut ws_rx) = ws.split();
        let (tx, rx) = mpsc::channel(self.outbound_queue);
        let handle = self.registry.register(identity.user_id, tx).await;

        self.registry
            .send_to_connection(
                &handle,
                ServerMessage::Connected {
                    user_id: identity.user_id,
                    role: identity.role,
                },
            )
            .await;

        let mut writer = tokio::spawn(pump_outbound(
            ws_tx,
            rx,
            self.registry.clone(),
            handle,
            self.send_timeout,
        ));
        let mut writer_done = false;

        // Either half ending ends the connection.
        loop {
            let idle = async {
                match self.idle_timeout {
                    Some(idle) => tokio::time::sleep(idle).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                result = &mut writer => {
                    writer_done = true;
                    if let Err(e) = result {
                        error!("Writer task for {} failed: {}", handle.id, e);
                    }
                    break;
                }
                () = idle => {
                    info!("Closing idle connection {} of user {}", handle.id, identity.user_id);
                    break;
                }
                next = ws_rx.next() => match next {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            break;
                        }
                        if let Ok(text) = msg.to_str() {
                            self.handle_client_frame(&identity, &handle, text).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", handle.id, e);
                        break;
                    }
                    None => break,
                },
            }
        }

        self.registry.unregister(&handle).await;
        if !writer_done {
            if let Err(e) = writer.await {
                error!("Writer task for {} failed: {}", handle.id, e);
            }
        }
        debug!("Connection {} closed", handle.id);
    }

    async fn handle_client_frame(
        &self,
        identity: &Identity,
        handle: &ConnectionHandle,
        text: &str,
    ) {
        let reply = match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::SendMessage {
                recipient_id,
                message,
            }) => match self
                .engine
                .submit(identity.user_id, recipient_id, &message)
                .await
            {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::from(&e)),
            },
            Ok(ClientMessage::Ping) => Some(ServerMessage::Pong),
            Err(e) => Some(ServerMessage::from(&CareError::Validation(format!(
                "unreadable frame: {e}"
            )))),
        };

        if let Some(reply) = reply {
            self.registry.send_to_connection(handle, reply).await;
        }
    }
}

/// Drains one connection's outbound queue into its socket. Ends when the
/// registry drops the queue's sender, or when a write fails or stalls past
/// `send_timeout`. Closing the socket is bounded by the same timeout.
async fn pump_outbound<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ServerMessage>,
    registry: Arc<ConnectionRegistry>,
    handle: ConnectionHandle,
    send_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(payload) = rx.recv().await {
        let text = match serde_json::to_string(&payload) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode frame for {}: {}", handle.id, e);
                continue;
            }
        };
        match timeout(send_timeout, sink.send(Message::text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Failed to send WebSocket message to {}: {}", handle.id, e);
                break;
            }
            Err(_) => {
                warn!("WebSocket write to {} timed out", handle.id);
                break;
            }
        }
    }
    registry.unregister(&handle).await;
    if timeout(send_timeout, sink.close()).await.is_err() {
        warn!("Closing {} timed out", handle.id);
    }
}
