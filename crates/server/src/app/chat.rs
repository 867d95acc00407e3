use edgechat_storage::{Consistency, ConversationRow, MessageRecord, Storage, StorageError};
use std::sync::Arc;

/// The persistence contract the edge depends on: durable message ids,
/// per-conversation unread counters, and the offline drain.
pub struct ChatService {
    storage: Arc<Storage>,
    history_limit: i64,
}

impl ChatService {
    pub fn new(storage: Arc<Storage>, history_limit: i64) -> Self {
        ChatService {
            storage,
            history_limit,
        }
    }

    /// Appends a message and returns its server-assigned id. Atomic with
    /// the conversation-row updates on both sides.
    pub async fn save_message(
        &self,
        from: i64,
        to: i64,
        content: &str,
        timestamp: i64,
    ) -> Result<i64, StorageError> {
        self.storage.save_message(from, to, content, timestamp).await
    }

    /// History browsing tolerates replica lag.
    pub async fn history(
        &self,
        user: i64,
        peer: i64,
        limit: Option<i64>,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let limit = limit.unwrap_or(self.history_limit).clamp(1, 500);
        self.storage
            .history(user, peer, limit, Consistency::Eventual)
            .await
    }

    /// Recent conversations feed user-visible unread state: strong read.
    pub async fn recent_sessions(&self, user: i64) -> Result<Vec<ConversationRow>, StorageError> {
        self.storage.recent_sessions(user).await
    }

    /// The reconnect drain: every unread tail, merged and ordered so the
    /// session replays pushes in `(timestamp, msg_id)` order. Read-only;
    /// counters reset only through `ack`.
    pub async fn offline_messages(&self, user: i64) -> Result<Vec<MessageRecord>, StorageError> {
        let mut messages = self.storage.offline_messages(user).await?;
        sort_for_drain(&mut messages);
        Ok(messages)
    }

    pub async fn ack(&self, user: i64, peer: i64) -> Result<(), StorageError> {
        self.storage.ack_messages(user, peer).await
    }
}

fn sort_for_drain(messages: &mut [MessageRecord]) {
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.msg_id.cmp(&b.msg_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(msg_id: i64, timestamp: i64) -> MessageRecord {
        MessageRecord {
            msg_id,
            from_user_id: 1,
            to_user_id: 2,
            content: String::new(),
            timestamp,
        }
    }

    #[test]
    fn drain_orders_by_timestamp_then_id() {
        let mut messages = vec![record(5, 200), record(9, 100), record(3, 100), record(7, 150)];
        sort_for_drain(&mut messages);
        let order: Vec<i64> = messages.iter().map(|m| m.msg_id).collect();
        assert_eq!(order, vec![3, 9, 7, 5]);
    }
}
