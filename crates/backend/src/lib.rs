//! Server side of the backup engine.
//!
//! One [`session::Session`] per connection, pinned to one client: SRP
//! authentication, message dispatch against the metadata database and blob
//! store, delta regeneration, and end-of-session purge/reclaim. The
//! [`server`] module owns the listener and the process-wide registry that
//! enforces at-most-one running session per client.

#![deny(unsafe_code)]

pub mod naming;
pub mod reclaim;
pub mod regen;
pub mod server;
pub mod session;

use std::path::PathBuf;

/// Server-wide configuration, resolved per client against DB overrides.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Blob store root; one subdirectory per client.
    pub base_dir: PathBuf,
    /// Database root; one subdirectory per client.
    pub db_dir: PathBuf,
    /// Session journal filename (under the client's db dir); None disables.
    pub journal_name: Option<String>,
    /// Auto-naming strftime formats, tried in order.
    pub formats: Vec<String>,
    /// Priority assigned per format slot.
    pub priorities: Vec<i64>,
    /// Retention (days) per format slot.
    pub keep_days: Vec<i64>,
    /// Whether a slot forces a full backup.
    pub force_full: Vec<bool>,
    /// Materialize deltas into full blobs where possible.
    pub save_full: bool,
    /// Longest permitted delta chain.
    pub max_chain: i64,
    /// Allowed size-change ratio before a delta is refused (0.5 = ±50%).
    pub max_change: f64,
    /// Purge expired sets automatically after a completed session.
    pub auto_purge: bool,
    /// Capture client configuration for diagnostics.
    pub save_config: bool,
    /// Database backup generations kept on open.
    pub db_backups: u32,
    /// Accept clients that do not exist yet.
    pub allow_new: bool,
    /// Let per-client DB config override these values.
    pub allow_overrides: bool,
    /// Refuse clients without stored credentials.
    pub require_password: bool,
    /// Files above this size use checksum-first classification.
    pub cks_content_threshold: i64,
    /// Retain delta bases via hard links.
    pub link_basis: bool,
    /// Idle read timeout (seconds) on the transport.
    pub timeout_secs: u64,
    /// Identifier of this server process (recorded on each set).
    pub server_session: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/srv/strata/blobs"),
            db_dir: PathBuf::from("/srv/strata/db"),
            journal_name: Some("journal".to_string()),
            formats: vec![
                "Monthly-%Y-%m".to_string(),
                "Weekly-%Y-%U".to_string(),
                "Daily-%Y-%m-%d".to_string(),
            ],
            priorities: vec![40, 30, 20],
            keep_days: vec![365, 180, 30],
            force_full: vec![true, false, false],
            save_full: false,
            max_chain: 5,
            max_change: 0.5,
            auto_purge: false,
            save_config: false,
            db_backups: 2,
            allow_new: true,
            allow_overrides: true,
            require_password: false,
            cks_content_threshold: 65_536,
            link_basis: false,
            timeout_secs: 300,
            server_session: strata_core::ids::new_session_id(),
        }
    }
}
