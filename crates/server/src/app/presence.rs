use super::router::Router;
use crate::metrics::Metrics;
use crate::util::now_millis;
use edgechat_proto::Frame;
use edgechat_storage::{Consistency, Storage, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Tracks pending delayed logouts per user. Every login or newer logout
/// bumps the generation, invalidating the timer armed before it.
#[derive(Default)]
struct LogoutGate {
    generations: HashMap<i64, u64>,
}

impl LogoutGate {
    fn bump(&mut self, user_id: i64) -> u64 {
        let counter = self.generations.entry(user_id).or_insert(0);
        *counter += 1;
        *counter
    }

    fn is_current(&self, user_id: i64, generation: u64) -> bool {
        self.generations.get(&user_id) == Some(&generation)
    }
}

/// The authoritative source of the per-user online flag, and the broadcast
/// protocol announcing transitions to friends.
pub struct PresenceService {
    storage: Arc<Storage>,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    grace: Duration,
    gate: Mutex<LogoutGate>,
}

impl PresenceService {
    pub fn new(
        storage: Arc<Storage>,
        router: Arc<Router>,
        metrics: Arc<Metrics>,
        grace: Duration,
    ) -> Self {
        PresenceService {
            storage,
            router,
            metrics,
            grace,
            gate: Mutex::new(LogoutGate::default()),
        }
    }

    /// Marks the user online and notifies every currently-online friend.
    /// Returns the online friends so the caller can show them immediately.
    pub async fn login(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        {
            // Cancels any pending delayed logout for this user.
            let mut gate = self.gate.lock().await;
            gate.bump(user_id);
        }
        self.storage.set_presence(user_id, true).await?;
        let online = self.broadcast_to_online_friends(user_id, true).await?;
        info!(
            user = user_id,
            online_friends = online.len(),
            "presence login"
        );
        Ok(online)
    }

    /// Marks the user offline and notifies online friends. With a grace
    /// period configured the offline write is held back and cancelled by a
    /// login arriving inside the window; the reply is then empty because
    /// the broadcast happens after the grace elapses.
    pub async fn logout(self: &Arc<Self>, user_id: i64) -> Result<Vec<i64>, StorageError> {
        if self.grace.is_zero() {
            return self.apply_logout(user_id).await;
        }
        let generation = {
            let mut gate = self.gate.lock().await;
            gate.bump(user_id)
        };
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(service.grace).await;
            let still_current = {
                let gate = service.gate.lock().await;
                gate.is_current(user_id, generation)
            };
            if !still_current {
                return;
            }
            if let Err(err) = service.apply_logout(user_id).await {
                warn!(user = user_id, "delayed logout failed: {}", err);
            }
        });
        Ok(Vec::new())
    }

    /// Resolves the online flag for a batch of users.
    pub async fn get_status(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, bool>, StorageError> {
        self.storage.presence_flags(user_ids).await
    }

    async fn apply_logout(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        self.storage.set_presence(user_id, false).await?;
        let online = self.broadcast_to_online_friends(user_id, false).await?;
        info!(
            user = user_id,
            online_friends = online.len(),
            "presence logout"
        );
        Ok(online)
    }

    // Friend reads are strong: the set gates who gets told about the
    // transition. Duplicate STATUS_UPDATE frames are harmless to receivers.
    async fn broadcast_to_online_friends(
        &self,
        user_id: i64,
        online: bool,
    ) -> Result<Vec<i64>, StorageError> {
        let friends = self.storage.friend_ids(user_id, Consistency::Strong).await?;
        let mut notified = Vec::new();
        let timestamp = now_millis();
        for friend_id in friends.into_iter() {
            if !self.storage.is_online(friend_id).await? {
                continue;
            }
            notified.push(friend_id);
            let frame = Frame::status_update(user_id, online, timestamp);
            self.router.send_to_user(friend_id, frame).await;
            self.metrics.mark_status_broadcast();
        }
        Ok(notified)
    }
}

#[cfg(test)]
mod tests {
    use super::LogoutGate;

    #[test]
    fn newer_generation_invalidates_pending_logout() {
        let mut gate = LogoutGate::default();
        let armed = gate.bump(7);
        assert!(gate.is_current(7, armed));
        // A login inside the grace window bumps the generation.
        gate.bump(7);
        assert!(!gate.is_current(7, armed));
    }

    #[test]
    fn generations_are_per_user() {
        let mut gate = LogoutGate::default();
        let first = gate.bump(1);
        let second = gate.bump(2);
        assert!(gate.is_current(1, first));
        assert!(gate.is_current(2, second));
        gate.bump(1);
        assert!(!gate.is_current(1, first));
        assert!(gate.is_current(2, second));
    }
}
