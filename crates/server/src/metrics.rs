use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    messages_persisted: AtomicU64,
    messages_forwarded: AtomicU64,
    offline_drained: AtomicU64,
    status_broadcasts: AtomicU64,
    http_requests: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_message_persisted(&self) {
        self.messages_persisted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_message_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_offline_drained(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.offline_drained.fetch_add(count, Ordering::SeqCst);
    }

    pub fn mark_status_broadcast(&self) {
        self.status_broadcasts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE edgechat_connections_active gauge\nedgechat_connections_active {}\n# TYPE edgechat_frames_ingress counter\nedgechat_frames_ingress {}\n# TYPE edgechat_frames_egress counter\nedgechat_frames_egress {}\n# TYPE edgechat_messages_persisted counter\nedgechat_messages_persisted {}\n# TYPE edgechat_messages_forwarded counter\nedgechat_messages_forwarded {}\n# TYPE edgechat_offline_drained counter\nedgechat_offline_drained {}\n# TYPE edgechat_status_broadcasts counter\nedgechat_status_broadcasts {}\n# TYPE edgechat_http_requests counter\nedgechat_http_requests {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.messages_persisted.load(Ordering::SeqCst),
            self.messages_forwarded.load(Ordering::SeqCst),
            self.offline_drained.load(Ordering::SeqCst),
            self.status_broadcasts.load(Ordering::SeqCst),
            self.http_requests.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_encoding_reflects_counters() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.mark_ingress();
        metrics.mark_ingress();
        metrics.mark_offline_drained(3);
        let payload = metrics.encode_prometheus();
        assert!(payload.contains("edgechat_connections_active 1"));
        assert!(payload.contains("edgechat_frames_ingress 2"));
        assert!(payload.contains("edgechat_offline_drained 3"));
    }
}
