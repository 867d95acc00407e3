use crate::metrics::Metrics;
use edgechat_proto::{Frame, decode_bus_payload, encode_bus_payload};
use edgechat_storage::Storage;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

const RESUBSCRIBE_DELAY_SECS: u64 = 1;
const RECONCILE_INTERVAL_SECS: u64 = 60;

/// One registered client session on this edge. The outbound queue is FIFO;
/// the close channel tears the session loop down on displacement.
pub struct SessionEntry {
    pub session_id: String,
    pub sender: mpsc::Sender<Frame>,
    pub close: watch::Sender<bool>,
}

pub type SessionMap = Arc<RwLock<HashMap<i64, SessionEntry>>>;

/// The routing plane: local fan-out plus the directory and per-edge topics
/// that carry frames across the fleet.
pub struct Router {
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
    edge_id: String,
    sessions: SessionMap,
}

impl Router {
    pub fn new(
        storage: Arc<Storage>,
        metrics: Arc<Metrics>,
        edge_id: String,
        sessions: SessionMap,
    ) -> Self {
        Router {
            storage,
            metrics,
            edge_id,
            sessions,
        }
    }

    /// Enqueues a frame on the local session of a user, if any. The sender
    /// is cloned out of the map so no I/O happens under the lock.
    pub async fn deliver_local(&self, user_id: i64, frame: Frame) -> bool {
        let sender = {
            let sessions = self.sessions.read().await;
            sessions.get(&user_id).map(|entry| entry.sender.clone())
        };
        match sender {
            Some(sender) => {
                if sender.send(frame).await.is_err() {
                    debug!(user = user_id, "local session closed during delivery");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Fan-out: local sessions win, otherwise the directory names the edge
    /// to publish to. A missing entry means the user is offline and the
    /// message already rests in persistence.
    pub async fn send_to_user(&self, user_id: i64, frame: Frame) {
        if self.deliver_local(user_id, frame.clone()).await {
            return;
        }
        let target = match self.storage.lookup_directory(user_id).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(user = user_id, "directory lookup failed: {}", err);
                return;
            }
        };
        let Some(edge_id) = target else {
            debug!(user = user_id, "user offline, no directory entry");
            return;
        };
        let frame_bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(user = user_id, "frame encode for forwarding failed: {}", err);
                return;
            }
        };
        let payload = encode_bus_payload(user_id, &frame_bytes);
        match self.storage.publish_to_edge(&edge_id, &payload).await {
            Ok(()) => {
                self.metrics.mark_message_forwarded();
                debug!(user = user_id, edge = %edge_id, "frame forwarded to peer edge");
            }
            Err(err) => {
                // Persistence already holds the message; the receiver will
                // drain it on the next reconnect.
                warn!(user = user_id, edge = %edge_id, "bus publish failed: {}", err);
            }
        }
    }
}

/// Subscribes to this edge's topic on a dedicated connection and feeds
/// received frames to local sessions. Runs for the life of the process,
/// resubscribing after any stream failure.
pub fn spawn_subscriber(router: Arc<Router>) {
    tokio::spawn(async move {
        loop {
            match router.storage.edge_subscriber(&router.edge_id).await {
                Ok(mut pubsub) => {
                    info!(edge = %router.edge_id, "subscribed to edge topic");
                    let mut stream = pubsub.on_message();
                    while let Some(message) = stream.next().await {
                        let payload: Vec<u8> = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!("bus payload read failed: {}", err);
                                continue;
                            }
                        };
                        handle_bus_payload(&router, &payload).await;
                    }
                    warn!(edge = %router.edge_id, "edge topic stream ended");
                }
                Err(err) => {
                    warn!(edge = %router.edge_id, "edge topic subscribe failed: {}", err);
                }
            }
            tokio::time::sleep(Duration::from_secs(RESUBSCRIBE_DELAY_SECS)).await;
        }
    });
}

// Receiving edges deliver locally only; a frame is never re-published.
async fn handle_bus_payload(router: &Router, payload: &[u8]) {
    let (user_id, frame_bytes) = match decode_bus_payload(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("malformed bus payload dropped: {}", err);
            return;
        }
    };
    let frame = match Frame::decode(frame_bytes) {
        Ok((frame, _)) => frame,
        Err(err) => {
            warn!(user = user_id, "malformed frame on bus dropped: {}", err);
            return;
        }
    };
    if !router.deliver_local(user_id, frame).await {
        debug!(user = user_id, "bus frame for user without local session");
    }
}

/// Periodic sweep removing directory entries that name this edge but have
/// no local session behind them, e.g. after a crash left orphans.
pub fn spawn_reconciler(router: Arc<Router>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(RECONCILE_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let entries = match router.storage.directory_entries().await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("directory sweep read failed: {}", err);
                    continue;
                }
            };
            for (user_id, edge_id) in entries.into_iter() {
                if edge_id != router.edge_id {
                    continue;
                }
                let registered = {
                    let sessions = router.sessions.read().await;
                    sessions.contains_key(&user_id)
                };
                if registered {
                    continue;
                }
                match router
                    .storage
                    .release_directory(user_id, &router.edge_id)
                    .await
                {
                    Ok(()) => info!(user = user_id, "orphan directory entry removed"),
                    Err(err) => warn!(user = user_id, "orphan entry removal failed: {}", err),
                }
            }
        }
    });
}
