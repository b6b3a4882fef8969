//! Backup client.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use strata_core::framing::{Encoding, TransportCompression};
use walker::{run_backup, WalkerConfig};

#[derive(Parser, Debug)]
#[command(name = "strata-backup", about = "Back a file tree up to a strata server")]
struct Args {
    /// Server address, host:port.
    #[arg(long, default_value = "localhost:9123")]
    server: String,

    /// Client identity on the server.
    #[arg(long)]
    client: String,

    /// Password (prefer --password-prompt; this lands in process lists).
    #[arg(long)]
    password: Option<String>,

    /// Prompt for the password on the terminal.
    #[arg(long)]
    password_prompt: bool,

    /// Create the client on the server (first backup).
    #[arg(long)]
    create: bool,

    /// Crypto scheme for a newly created client (0-4).
    #[arg(long)]
    scheme: Option<u8>,

    /// Explicit backup-set name (disables server auto-naming).
    #[arg(long)]
    name: Option<String>,

    /// Priority of this backup set.
    #[arg(long, default_value_t = 0)]
    priority: i64,

    /// Request a full (delta-free) backup.
    #[arg(long)]
    full: bool,

    /// Start even if the server believes a session is still running.
    #[arg(long)]
    force: bool,

    /// Wire encoding: JSON, MSGP, or BSON.
    #[arg(long, default_value = "MSGP")]
    encoding: String,

    /// Transport compression: none, zlib, zlibstream, or snappy.
    #[arg(long, default_value = "snappy")]
    compress: String,

    /// Disable content compression (zstd) before encryption.
    #[arg(long)]
    no_compress_content: bool,

    /// Messages per batch.
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Directory entries per DIR message.
    #[arg(long, default_value_t = 1000)]
    dirslice: usize,

    /// Clone requests queued before flushing (0 disables cloning).
    #[arg(long, default_value_t = 100)]
    clones: usize,

    /// Directories up to this size clone all-or-nothing.
    #[arg(long, default_value_t = 64)]
    clone_threshold: usize,

    /// Deltas above this percentage of the file size go as full content.
    #[arg(long, default_value_t = 66)]
    delta_threshold: u32,

    /// Exclusion pattern (repeatable).
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Directory to skip outright (repeatable).
    #[arg(long = "exclude-dir")]
    exclude_dirs: Vec<PathBuf>,

    /// Add CVS-style default exclusions.
    #[arg(long)]
    cvs_exclude: bool,

    /// Honor CACHEDIR.TAG markers.
    #[arg(long)]
    skip_caches: bool,

    /// Descend across filesystem boundaries.
    #[arg(long)]
    crossdev: bool,

    /// Collect extended attributes.
    #[arg(long)]
    xattrs: bool,

    /// Ask the server to purge per its retention policy afterwards.
    #[arg(long)]
    purge: bool,

    /// Transport idle timeout in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Directories to back up.
    #[arg(required = true)]
    roots: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    strata_core::logging::init("info");
    let args = Args::parse();

    let password = match (&args.password, args.password_prompt) {
        (Some(p), _) => Some(p.clone()),
        (None, true) => Some(rpassword::prompt_password("Password: ")?),
        (None, false) => None,
    };
    if args.create && args.scheme.unwrap_or(crypt::DEFAULT_SCHEME) > 0 && password.is_none() {
        bail!("creating an encrypted client requires --password-prompt (or --scheme 0)");
    }

    let mut cfg = WalkerConfig::new(&args.server, &args.client, args.roots.clone());
    cfg.password = password;
    cfg.crypto_scheme = args.scheme;
    cfg.create = args.create;
    cfg.name = args.name.clone();
    cfg.priority = args.priority;
    cfg.full = args.full;
    cfg.force = args.force;
    cfg.encoding = Encoding::from_token(&args.encoding)?;
    cfg.compress = TransportCompression::from_token(&args.compress)?;
    cfg.compress_content = !args.no_compress_content;
    cfg.batch_size = args.batch_size;
    cfg.dir_slice = args.dirslice;
    cfg.clones = args.clones;
    cfg.clone_threshold = args.clone_threshold;
    cfg.delta_threshold_pct = args.delta_threshold;
    cfg.exclude_patterns = args.excludes.clone();
    cfg.exclude_dirs = args.exclude_dirs.clone();
    cfg.cvs_excludes = args.cvs_exclude;
    cfg.skip_caches = args.skip_caches;
    cfg.cross_device = args.crossdev;
    cfg.xattrs = args.xattrs;
    cfg.purge = args.purge;
    cfg.timeout = Duration::from_secs(args.timeout);

    let (session, stats) = run_backup(&cfg)?;
    println!(
        "set {} ({}): {} dirs, {} files ({} bytes), {} new, {} deltas, {} cloned dirs, {} gone, {} denied",
        session.set_name,
        if session.new_client { "new client" } else { "existing client" },
        stats.dirs,
        stats.files,
        stats.backed_bytes,
        stats.new_files,
        stats.delta_files,
        stats.cloned_dirs,
        stats.gone,
        stats.denied,
    );
    Ok(())
}
