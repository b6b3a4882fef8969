//! TCP listener and the process-wide session registry.
//!
//! Thread-per-session: each accepted connection gets its own worker, its
//! own database handle, and an idle read timeout. The registry maps live
//! `session_id → client` and enforces at-most-one running session per
//! client.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::session::serve_connection;
use crate::BackendConfig;

/// Live sessions, `session_id → client`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session_id: &str, client: &str) {
        self.sessions.insert(session_id.to_string(), client.to_string());
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn client_is_busy(&self, client: &str) -> bool {
        self.sessions.iter().any(|e| e.value() == client)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// The backup server: accepts connections and pins each to a worker.
pub struct Server {
    cfg: Arc<BackendConfig>,
    registry: Arc<SessionRegistry>,
}

impl Server {
    pub fn new(cfg: BackendConfig) -> Self {
        Self { cfg: Arc::new(cfg), registry: Arc::new(SessionRegistry::new()) }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept loop; runs until the listener fails.
    pub fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "server listening");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => self.spawn_session(stream),
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream) {
        let cfg = self.cfg.clone();
        let registry = self.registry.clone();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        thread::Builder::new()
            .name(format!("session-{peer}"))
            .spawn(move || {
                let timeout = Duration::from_secs(cfg.timeout_secs);
                if stream.set_read_timeout(Some(timeout)).is_err() {
                    error!(peer = %peer, "could not arm idle timeout");
                    return;
                }
                let _ = stream.set_nodelay(true);
                info!(peer = %peer, "connection accepted");
                match serve_connection(stream, &cfg, registry, peer.clone()) {
                    Ok(outcome) => info!(
                        peer = %peer,
                        client = %outcome.client,
                        completed = outcome.completed,
                        "session finished"
                    ),
                    Err(e) => warn!(peer = %peer, error = %e, "session aborted"),
                }
            })
            .map(|_| ())
            .unwrap_or_else(|e| error!(error = %e, "could not spawn session thread"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_busy_clients() {
        let r = SessionRegistry::new();
        assert!(r.is_empty());
        r.add("sess-1", "alice");
        assert!(r.contains_session("sess-1"));
        assert!(r.client_is_busy("alice"));
        assert!(!r.client_is_busy("bob"));
        r.add("sess-2", "bob");
        assert_eq!(r.len(), 2);
        r.remove("sess-1");
        assert!(!r.client_is_busy("alice"));
        assert!(r.client_is_busy("bob"));
    }
}
