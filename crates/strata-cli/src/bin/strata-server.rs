//! Backup server daemon.

use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::Context;
use backend::{server::Server, BackendConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "strata-server", about = "Deduplicating encrypted backup server")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:9123")]
    listen: String,

    /// Blob store root (one subdirectory per client).
    #[arg(long, default_value = "/srv/strata/blobs")]
    base_dir: PathBuf,

    /// Database root (one subdirectory per client).
    #[arg(long, default_value = "/srv/strata/db")]
    db_dir: PathBuf,

    /// Auto-naming strftime formats, most specific last.
    #[arg(long, value_delimiter = ',', default_value = "Monthly-%Y-%m,Weekly-%Y-%U,Daily-%Y-%m-%d")]
    formats: Vec<String>,

    /// Priority per format slot.
    #[arg(long, value_delimiter = ',', default_value = "40,30,20")]
    priorities: Vec<i64>,

    /// Retention days per format slot.
    #[arg(long, value_delimiter = ',', default_value = "365,180,30")]
    keep_days: Vec<i64>,

    /// Force a full backup per format slot (true/false list).
    #[arg(long, value_delimiter = ',', default_value = "true,false,false")]
    force_full: Vec<String>,

    /// Materialize deltas into full blobs where possible.
    #[arg(long)]
    save_full: bool,

    /// Longest permitted delta chain.
    #[arg(long, default_value_t = 5)]
    max_chain: i64,

    /// Allowed size-change percentage before refusing a delta.
    #[arg(long, default_value_t = 50)]
    max_change_percent: u32,

    /// Purge expired sets after each completed session.
    #[arg(long)]
    auto_purge: bool,

    /// Capture client configuration for diagnostics.
    #[arg(long)]
    save_config: bool,

    /// Database backup generations kept on open.
    #[arg(long, default_value_t = 2)]
    db_backups: u32,

    /// Refuse clients that do not exist yet.
    #[arg(long)]
    no_new_clients: bool,

    /// Refuse clients without stored credentials.
    #[arg(long)]
    require_password: bool,

    /// Size above which a checksum round-trip precedes content.
    #[arg(long, default_value_t = 65_536)]
    cks_content: i64,

    /// Retain delta bases via hard links.
    #[arg(long)]
    link_basis: bool,

    /// Idle read timeout in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    strata_core::logging::init("info");
    let args = Args::parse();

    let cfg = BackendConfig {
        base_dir: args.base_dir,
        db_dir: args.db_dir,
        formats: args.formats,
        priorities: args.priorities,
        keep_days: args.keep_days,
        force_full: args
            .force_full
            .iter()
            .map(|s| matches!(s.as_str(), "1" | "true" | "True"))
            .collect(),
        save_full: args.save_full,
        max_chain: args.max_chain,
        max_change: f64::from(args.max_change_percent) / 100.0,
        auto_purge: args.auto_purge,
        save_config: args.save_config,
        db_backups: args.db_backups,
        allow_new: !args.no_new_clients,
        require_password: args.require_password,
        cks_content_threshold: args.cks_content,
        link_basis: args.link_basis,
        timeout_secs: args.timeout,
        ..BackendConfig::default()
    };

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("cannot bind {}", args.listen))?;
    Server::new(cfg).run(listener)?;
    Ok(())
}
