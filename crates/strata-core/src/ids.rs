//! Session id and timestamp helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Opaque session identifier (UUID v4 string).
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Leading portion of a session id, sufficient for log correlation.
pub fn short_session_id(id: &str) -> &str {
    &id[..id.len().min(13)]
}

/// Seconds since the UNIX epoch, fractional.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_format() {
        let id = new_session_id();
        assert_eq!(id.len(), 36);
        assert_eq!(short_session_id(&id).len(), 13);
    }

    #[test]
    fn clock_advances() {
        let a = now_secs();
        assert!(a > 0.0);
    }
}
