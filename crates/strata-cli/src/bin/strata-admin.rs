//! Administrative tool: client lifecycle, keys, retention, config.
//!
//! Operates directly on a client's database and blob store on the server
//! host. Exits zero on success; failures print a diagnostic as the last
//! line and exit nonzero.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use backend::reclaim;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use blob_store::BlobStore;
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use crypt::Crypto;
use meta_db::MetaDb;

/// Keys every client database carries.
const CONFIG_KEYS: &[&str] = &[
    "Formats",
    "Priorities",
    "KeepDays",
    "ForceFull",
    "SaveFull",
    "MaxDeltaChain",
    "MaxChangePercent",
    "VacuumInterval",
    "AutoPurge",
    "SaveConfig",
    "Disabled",
    "ClientID",
    "SchemaVersion",
    "CryptoScheme",
];

#[derive(Parser, Debug)]
#[command(name = "strata-admin", about = "Administer strata clients on this host")]
struct Args {
    /// Database root.
    #[arg(long, default_value = "/srv/strata/db")]
    db_dir: PathBuf,

    /// Blob store root.
    #[arg(long, default_value = "/srv/strata/blobs")]
    base_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a client database and store.
    Create {
        client: String,
        /// Crypto scheme (0-4); anything above 0 prompts for a password.
        #[arg(long, default_value_t = crypt::DEFAULT_SCHEME)]
        scheme: u8,
    },
    /// Add a password (and keys) to a client created without one.
    Setpass {
        client: String,
        #[arg(long, default_value_t = crypt::DEFAULT_SCHEME)]
        scheme: u8,
    },
    /// Change a client's password, re-wrapping its keys.
    Chpass { client: String },
    /// Export or import the wrapped key material.
    Keys {
        client: String,
        /// Write keys to this JSON file.
        #[arg(long, conflicts_with = "import")]
        export: Option<PathBuf>,
        /// Load keys from this JSON file.
        #[arg(long)]
        import: Option<PathBuf>,
    },
    /// List backup sets.
    List { client: String },
    /// Describe one backup set (or the most recent).
    Info {
        client: String,
        #[arg(long)]
        set: Option<String>,
    },
    /// Purge backup sets older than a cutoff.
    Purge {
        client: String,
        /// Purge sets at or below this priority.
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Cutoff, days before now.
        #[arg(long)]
        days: u32,
        /// Only purge sets that never completed.
        #[arg(long)]
        incomplete: bool,
        /// Skip the confirmation prompt.
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Delete one named backup set.
    Delete {
        client: String,
        set: String,
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Remove unreferenced blobs.
    Orphans { client: String },
    /// Print configuration values.
    Getconfig {
        client: String,
        /// Specific key; all keys when omitted.
        #[arg(long)]
        key: Option<String>,
    },
    /// Set a configuration value.
    Setconfig {
        client: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
}

fn main() {
    strata_core::logging::init("warn");
    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Create { client, scheme } => create(&args.db_dir, &args.base_dir, &client, scheme),
        Command::Setpass { client, scheme } => setpass(&args.db_dir, &client, scheme),
        Command::Chpass { client } => chpass(&args.db_dir, &client),
        Command::Keys { client, export, import } => keys(&args.db_dir, &client, export, import),
        Command::List { client } => list(&args.db_dir, &client),
        Command::Info { client, set } => info(&args.db_dir, &client, set),
        Command::Purge { client, priority, days, incomplete, yes } => {
            purge(&args.db_dir, &args.base_dir, &client, priority, days, incomplete, yes)
        }
        Command::Delete { client, set, yes } => {
            delete(&args.db_dir, &args.base_dir, &client, &set, yes)
        }
        Command::Orphans { client } => orphans(&args.db_dir, &args.base_dir, &client),
        Command::Getconfig { client, key } => getconfig(&args.db_dir, &client, key),
        Command::Setconfig { client, key, value } => setconfig(&args.db_dir, &client, &key, &value),
    }
}

fn open(db_dir: &Path, client: &str) -> anyhow::Result<MetaDb> {
    MetaDb::open(db_dir, client, false, 0, None).context("cannot open client database")
}

fn prompt_new_password() -> anyhow::Result<String> {
    let first = rpassword::prompt_password("New password: ")?;
    let second = rpassword::prompt_password("Confirm password: ")?;
    if first != second {
        bail!("passwords do not match");
    }
    if first.is_empty() {
        bail!("empty password refused");
    }
    Ok(first)
}

fn install_keys(db: &mut MetaDb, client: &str, scheme: u8, password: &str) -> anyhow::Result<()> {
    let mut crypto = Crypto::new(scheme, client, Some(password))?;
    crypto.gen_keys();
    let (fkey, ckey) = crypto.wrapped_keys()?;
    let (salt, vkey) = crypto.srp_values(password);
    db.set_keys(&B64.encode(salt), &B64.encode(vkey), &fkey, &ckey)?;
    db.set_config("CryptoScheme", &scheme.to_string())?;
    Ok(())
}

fn create(db_dir: &Path, base_dir: &Path, client: &str, scheme: u8) -> anyhow::Result<()> {
    let mut db = MetaDb::open(db_dir, client, true, 0, None).context("cannot create client")?;
    BlobStore::open(base_dir, client, true).context("cannot create blob store")?;
    if scheme > 0 {
        let password = prompt_new_password()?;
        install_keys(&mut db, client, scheme, &password)?;
    } else {
        db.set_config("CryptoScheme", "0")?;
    }
    let id = db.client_id()?;
    db.close(true)?;
    println!("created client {client} (id {id}, scheme {scheme})");
    Ok(())
}

fn setpass(db_dir: &Path, client: &str, scheme: u8) -> anyhow::Result<()> {
    if scheme == 0 {
        bail!("setpass needs an encrypting scheme (1-4)");
    }
    let mut db = open(db_dir, client)?;
    if db.needs_authentication()? {
        bail!("client {client} already has a password; use chpass");
    }
    let password = prompt_new_password()?;
    install_keys(&mut db, client, scheme, &password)?;
    db.close(true)?;
    println!("password set for {client}");
    Ok(())
}

fn chpass(db_dir: &Path, client: &str) -> anyhow::Result<()> {
    let mut db = open(db_dir, client)?;
    let scheme: u8 = db
        .get_config("CryptoScheme")?
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    if scheme == 0 {
        bail!("client {client} has no password");
    }
    let fkey = db.get_config("FilenameKey")?.context("no stored keys")?;
    let ckey = db.get_config("ContentKey")?.context("no stored keys")?;

    let old = rpassword::prompt_password("Current password: ")?;
    let mut crypto = Crypto::new(scheme, client, Some(&old))?;
    crypto
        .set_wrapped_keys(&fkey, &ckey)
        .context("current password does not unlock the stored keys")?;

    let new = prompt_new_password()?;
    let (fkey2, ckey2) = crypto.rewrap_keys(&new)?;
    let (salt, vkey) = crypto.srp_values(&new);
    db.set_keys(&B64.encode(salt), &B64.encode(vkey), &fkey2, &ckey2)?;
    db.close(true)?;
    println!("password changed for {client}");
    Ok(())
}

fn keys(
    db_dir: &Path,
    client: &str,
    export: Option<PathBuf>,
    import: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut db = open(db_dir, client)?;
    match (export, import) {
        (Some(path), None) => {
            let doc = serde_json::json!({
                "client": client,
                "cryptoScheme": db.get_config("CryptoScheme")?,
                "srpSalt": db.get_config("SrpSalt")?,
                "srpVkey": db.get_config("SrpVkey")?,
                "filenameKey": db.get_config("FilenameKey")?,
                "contentKey": db.get_config("ContentKey")?,
            });
            let mut f = std::fs::File::create(&path)?;
            f.write_all(serde_json::to_string_pretty(&doc)?.as_bytes())?;
            println!("keys exported to {}", path.display());
        }
        (None, Some(path)) => {
            let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
            let get = |k: &str| -> anyhow::Result<String> {
                doc.get(k)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .with_context(|| format!("key file missing {k}"))
            };
            db.set_keys(&get("srpSalt")?, &get("srpVkey")?, &get("filenameKey")?, &get("contentKey")?)?;
            if let Ok(scheme) = get("cryptoScheme") {
                db.set_config("CryptoScheme", &scheme)?;
            }
            println!("keys imported from {}", path.display());
        }
        _ => bail!("pass exactly one of --export or --import"),
    }
    db.close(true)?;
    Ok(())
}

fn fmt_time(secs: Option<f64>) -> String {
    secs.and_then(|s| Local.timestamp_opt(s as i64, 0).single())
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn list(db_dir: &Path, client: &str) -> anyhow::Result<()> {
    let db = open(db_dir, client)?;
    println!(
        "{:<6} {:<28} {:>4} {:<5} {:<20} {:<20}",
        "set", "name", "prio", "done", "started", "ended"
    );
    for set in db.list_backup_sets()? {
        println!(
            "{:<6} {:<28} {:>4} {:<5} {:<20} {:<20}",
            set.set_id,
            set.name,
            set.priority,
            if set.completed { "yes" } else { "no" },
            fmt_time(Some(set.start_time)),
            fmt_time(set.end_time),
        );
    }
    db.close(true)?;
    Ok(())
}

fn info(db_dir: &Path, client: &str, set: Option<String>) -> anyhow::Result<()> {
    let db = open(db_dir, client)?;
    let info = match set {
        Some(name) => db
            .get_backup_set_by_name(&name)?
            .with_context(|| format!("no backup set named {name}"))?,
        None => db.last_backup_set(false)?.context("no backup sets")?,
    };
    println!("name:           {}", info.name);
    println!("set id:         {}", info.set_id);
    println!("priority:       {}", info.priority);
    println!("completed:      {}", info.completed);
    println!("full:           {}", info.full);
    println!("started:        {}", fmt_time(Some(info.start_time)));
    println!("ended:          {}", fmt_time(info.end_time));
    println!("client version: {}", info.client_version.as_deref().unwrap_or("-"));
    println!("client address: {}", info.client_address.as_deref().unwrap_or("-"));
    println!("files full:     {}", info.files_full);
    println!("files delta:    {}", info.files_delta);
    println!("bytes received: {}", info.bytes_received);
    db.close(true)?;
    Ok(())
}

fn confirm(prompt: &str, yes: bool) -> anyhow::Result<bool> {
    if yes {
        return Ok(true);
    }
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn purge(
    db_dir: &Path,
    base_dir: &Path,
    client: &str,
    priority: i64,
    days: u32,
    incomplete: bool,
    yes: bool,
) -> anyhow::Result<()> {
    let cutoff = strata_core::ids::now_secs() - f64::from(days) * 86_400.0;
    let mut db = open(db_dir, client)?;
    let store = BlobStore::open(base_dir, client, false)?;

    let doomed: Vec<String> = db
        .list_backup_sets()?
        .into_iter()
        .filter(|s| {
            s.priority <= priority
                && s.end_time.map(|t| t < cutoff).unwrap_or(false)
                && (!incomplete || !s.completed)
        })
        .map(|s| s.name)
        .collect();
    if doomed.is_empty() {
        println!("nothing to purge");
        db.close(true)?;
        return Ok(());
    }
    if !confirm(&format!("purge {} sets ({})?", doomed.len(), doomed.join(", ")), yes)? {
        db.close(true)?;
        bail!("aborted");
    }

    let (files, sets) = if incomplete {
        db.purge_incomplete(priority, cutoff, None)?
    } else {
        db.purge_sets(priority, cutoff, None)?
    };
    let sweep = reclaim::remove_orphans(&mut db, &store)?;
    db.commit()?;
    db.close(true)?;
    println!(
        "purged {sets} sets ({files} file versions); reclaimed {} blobs, {} bytes",
        sweep.count, sweep.bytes
    );
    Ok(())
}

fn delete(
    db_dir: &Path,
    base_dir: &Path,
    client: &str,
    set: &str,
    yes: bool,
) -> anyhow::Result<()> {
    let mut db = open(db_dir, client)?;
    let store = BlobStore::open(base_dir, client, false)?;
    if db.get_backup_set_by_name(set)?.is_none() {
        db.close(true)?;
        bail!("no backup set named {set}");
    }
    if !confirm(&format!("delete backup set {set}?"), yes)? {
        db.close(true)?;
        bail!("aborted");
    }
    let (files, _) = db.delete_backup_set(set)?;
    let sweep = reclaim::remove_orphans(&mut db, &store)?;
    db.commit()?;
    db.close(true)?;
    println!(
        "deleted {set} ({files} file versions); reclaimed {} blobs, {} bytes",
        sweep.count, sweep.bytes
    );
    Ok(())
}

fn orphans(db_dir: &Path, base_dir: &Path, client: &str) -> anyhow::Result<()> {
    let mut db = open(db_dir, client)?;
    let store = BlobStore::open(base_dir, client, false)?;
    let sweep = reclaim::remove_orphans(&mut db, &store)?;
    db.commit()?;
    db.close(true)?;
    println!(
        "reclaimed {} blobs, {} bytes in {} rounds",
        sweep.count, sweep.bytes, sweep.rounds
    );
    Ok(())
}

fn getconfig(db_dir: &Path, client: &str, key: Option<String>) -> anyhow::Result<()> {
    let db = open(db_dir, client)?;
    let keys: Vec<&str> = match &key {
        Some(k) => vec![k.as_str()],
        None => CONFIG_KEYS.to_vec(),
    };
    for k in keys {
        println!("{k} = {}", db.get_config(k)?.unwrap_or_else(|| "-".to_string()));
    }
    db.close(true)?;
    Ok(())
}

fn setconfig(db_dir: &Path, client: &str, key: &str, value: &str) -> anyhow::Result<()> {
    if !CONFIG_KEYS.contains(&key) {
        bail!("unknown configuration key {key}");
    }
    let mut db = open(db_dir, client)?;
    db.set_config(key, value)?;
    db.close(true)?;
    println!("{key} = {value}");
    Ok(())
}
