use chrono::Utc;

/// Milliseconds since the Unix epoch, the timestamp unit of the protocol.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Extracts one parameter from a raw query string.
pub fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        if name == key {
            return Some(parts.next().unwrap_or_default().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_finds_value() {
        assert_eq!(
            query_param(Some("token=abc&peer_id=4"), "token").as_deref(),
            Some("abc")
        );
        assert_eq!(
            query_param(Some("token=abc&peer_id=4"), "peer_id").as_deref(),
            Some("4")
        );
    }

    #[test]
    fn query_param_handles_missing() {
        assert_eq!(query_param(None, "token"), None);
        assert_eq!(query_param(Some("a=b"), "token"), None);
        assert_eq!(query_param(Some("token"), "token"), None);
        assert_eq!(query_param(Some("token="), "token").as_deref(), Some(""));
    }

    #[test]
    fn clock_is_millisecond_scale() {
        let now = now_millis();
        assert!(now > 1_600_000_000_000);
    }
}
