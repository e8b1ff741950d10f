use std::sync::Arc;

use chrono::Utc;

use crate::error::{CareError, CareResult};
use crate::models::{Message, UserId};
use crate::store::Database;

#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        MessageStore { db }
    }

    /// Durably records a message. Both parties must exist. Ids increase
    /// strictly and timestamps never go backwards, even across clock steps.
    /// The cost of an append does not depend on how much history exists.
    pub async fn append(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        body: &str,
    ) -> CareResult<Message> {
        self.db
            .read(|tables| {
                tables.user(sender_id)?;
                tables
                    .user(recipient_id)
                    .map_err(|_| CareError::NotFound(format!("recipient {recipient_id}")))?;
                Ok::<_, CareError>(())
            })
            .await?;

        let body = body.to_string();
        self.db
            .append_message(move |id, newest| {
                let now = Utc::now();
                let created_at = match newest {
                    Some(last) if last.created_at > now => last.created_at,
                    _ => now,
                };
                Message {
                    id,
                    sender_id,
                    recipient_id,
                    body,
                    created_at,
                }
            })
            .await
    }

    /// Every message exchanged between `a` and `b`, oldest first.
    pub async fn conversation(&self, a: UserId, b: UserId) -> Vec<Message> {
        self.db
            .messages(|all| {
                let mut history: Vec<Message> = all
                    .iter()
                    .filter(|message| message.involves(a, b))
                    .cloned()
                    .collect();
                history.sort_by(|x, y| x.created_at.cmp(&y.created_at).then(x.id.cmp(&y.id)));
                history
            })
            .await
    }
}
