//! Per-client metadata database.
//!
//! A single-writer SQLite store holding backup sets, file-version rows,
//! checksum records, interned filename ciphertexts, and string config.
//! Version rows span a range of backup sets (`first_set..last_set`); an
//! unchanged file is *extended* rather than re-inserted. Checksum records
//! form a basis DAG whose chain lengths are cached and bounded by policy.
//!
//! Each session keeps one open transaction; the caller commits on batch
//! boundaries. A JSONL write-ahead journal records mutations per session
//! and dooms (leaves incomplete) any session that did not close cleanly.

#![deny(unsafe_code)]

pub mod journal;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use crypt::auth::ServerAuth;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use journal::Journal;

/// Current schema generation.
pub const SCHEMA_VERSION: &str = "1";

const SCHEMA: &str = include_str!("schema.sql");

/// Database failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("constraint: {0}")]
    Constraint(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

type Result<T> = std::result::Result<T, DbError>;

/// One backup-set row.
#[derive(Debug, Clone)]
pub struct BackupSetInfo {
    pub set_id: i64,
    pub name: String,
    pub session: Option<String>,
    pub priority: i64,
    pub client_time: Option<f64>,
    pub client_version: Option<String>,
    pub client_address: Option<String>,
    pub full: bool,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub completed: bool,
    pub files_full: i64,
    pub files_delta: i64,
    pub bytes_received: i64,
}

/// One file-version row (joined with its name and checksum records).
#[derive(Debug, Clone)]
pub struct FileVersion {
    pub row_id: i64,
    pub first_set: i64,
    pub last_set: i64,
    pub name: String,
    pub parent_inode: u64,
    pub parent_device: u64,
    pub inode: u64,
    pub device: u64,
    pub dir: bool,
    pub link: bool,
    pub nlinks: u64,
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub ctime: Option<i64>,
    pub atime: Option<i64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub checksum: Option<String>,
    pub chain_length: i64,
    pub basis: Option<String>,
    pub xattr: Option<String>,
    pub acl: Option<String>,
}

/// One checksum/blob record.
#[derive(Debug, Clone)]
pub struct ChecksumInfo {
    pub checksum_id: i64,
    pub checksum: String,
    pub is_file: bool,
    pub encrypted: bool,
    pub compressed: Option<String>,
    pub size: i64,
    pub disk_size: i64,
    pub delta_size: Option<i64>,
    pub basis: Option<String>,
    pub chain_length: i64,
}

impl ChecksumInfo {
    /// A record with negative size reserves the identifier without bytes.
    pub fn is_placeholder(&self) -> bool {
        self.size < 0
    }
}

/// Extra attributes of a new checksum record.
#[derive(Debug, Clone, Default)]
pub struct ChecksumAttrs {
    pub is_file: bool,
    pub compressed: Option<String>,
    pub disk_size: i64,
    pub delta_size: Option<i64>,
    pub basis: Option<String>,
}

const FILE_SELECT: &str = "
    SELECT f.row_id, f.first_set, f.last_set, n.name, f.parent_inode, f.parent_device,
           f.inode, f.device, f.dir, f.link, f.nlinks, f.size, f.mtime, f.ctime, f.atime,
           f.mode, f.uid, f.gid, c.checksum, IFNULL(c.chain_length, 0), b.checksum,
           x.checksum, a.checksum
    FROM files f
    JOIN names n ON n.name_id = f.name_id
    LEFT JOIN checksums c ON c.checksum_id = f.checksum_id
    LEFT JOIN checksums b ON b.checksum_id = c.basis
    LEFT JOIN checksums x ON x.checksum_id = f.xattr_id
    LEFT JOIN checksums a ON a.checksum_id = f.acl_id
";

fn map_file(row: &Row<'_>) -> rusqlite::Result<FileVersion> {
    Ok(FileVersion {
        row_id: row.get(0)?,
        first_set: row.get(1)?,
        last_set: row.get(2)?,
        name: row.get(3)?,
        parent_inode: row.get::<_, i64>(4)? as u64,
        parent_device: row.get::<_, i64>(5)? as u64,
        inode: row.get::<_, i64>(6)? as u64,
        device: row.get::<_, i64>(7)? as u64,
        dir: row.get::<_, i64>(8)? != 0,
        link: row.get::<_, i64>(9)? != 0,
        nlinks: row.get::<_, i64>(10)? as u64,
        size: row.get(11)?,
        mtime: row.get(12)?,
        ctime: row.get(13)?,
        atime: row.get(14)?,
        mode: row.get(15)?,
        uid: row.get(16)?,
        gid: row.get(17)?,
        checksum: row.get(18)?,
        chain_length: row.get(19)?,
        basis: row.get(20)?,
        xattr: row.get(21)?,
        acl: row.get(22)?,
    })
}

fn map_set(row: &Row<'_>) -> rusqlite::Result<BackupSetInfo> {
    Ok(BackupSetInfo {
        set_id: row.get("set_id")?,
        name: row.get("name")?,
        session: row.get("session")?,
        priority: row.get("priority")?,
        client_time: row.get("client_time")?,
        client_version: row.get("client_version")?,
        client_address: row.get("client_address")?,
        full: row.get::<_, i64>("full")? != 0,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        completed: row.get::<_, i64>("completed")? != 0,
        files_full: row.get("files_full")?,
        files_delta: row.get("files_delta")?,
        bytes_received: row.get("bytes_received")?,
    })
}

fn map_checksum(row: &Row<'_>) -> rusqlite::Result<ChecksumInfo> {
    Ok(ChecksumInfo {
        checksum_id: row.get(0)?,
        checksum: row.get(1)?,
        is_file: row.get::<_, i64>(2)? != 0,
        encrypted: row.get::<_, i64>(3)? != 0,
        compressed: row.get(4)?,
        size: row.get(5)?,
        disk_size: row.get(6)?,
        delta_size: row.get(7)?,
        basis: row.get(8)?,
        chain_length: row.get(9)?,
    })
}

const CHECKSUM_SELECT: &str = "
    SELECT c.checksum_id, c.checksum, c.is_file, c.encrypted, c.compressed, c.size,
           c.disk_size, c.delta_size, b.checksum, c.chain_length
    FROM checksums c
    LEFT JOIN checksums b ON b.checksum_id = c.basis
";

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Handle on one client's database, pinned to one session.
pub struct MetaDb {
    conn: Connection,
    client: String,
    db_path: PathBuf,
    journal: Option<Journal>,
    doomed_prior_session: bool,
    srp: Option<ServerAuth>,
    current_set: Option<i64>,
    prev_set: Option<i64>,
    last_completed: Option<i64>,
    prev_date: f64,
    in_tx: bool,
}

impl MetaDb {
    /// Open (or create) the database at `<db_dir>/<client>/<client>.db`.
    /// Existing databases are rotated into up to `num_backups` generations
    /// first; a leftover journal dooms the prior session.
    pub fn open(
        db_dir: &Path,
        client: &str,
        create: bool,
        num_backups: u32,
        journal_name: Option<&str>,
    ) -> Result<Self> {
        let dir = db_dir.join(client);
        let db_path = dir.join(format!("{client}.db"));
        let fresh = !db_path.is_file();
        if create && !fresh {
            return Err(DbError::Constraint(format!("client {client} already exists")));
        }
        if !create && fresh {
            return Err(DbError::NotFound(format!("unknown client: {client}")));
        }
        fs::create_dir_all(&dir)?;
        if !fresh && num_backups > 0 {
            rotate_backups(&db_path, num_backups)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        let (journal, doomed) = match journal_name {
            Some(name) => {
                let (j, doomed) = Journal::open(&dir.join(name))?;
                (Some(j), doomed)
            }
            None => (None, false),
        };

        let mut db = Self {
            conn,
            client: client.to_string(),
            db_path,
            journal,
            doomed_prior_session: doomed,
            srp: None,
            current_set: None,
            prev_set: None,
            last_completed: None,
            prev_date: 0.0,
            in_tx: false,
        };
        db.begin()?;
        if fresh {
            db.set_config("ClientID", &uuid::Uuid::new_v4().to_string())?;
            db.set_config("SchemaVersion", SCHEMA_VERSION)?;
            info!(client, "initialized new client database");
        } else {
            db.upgrade_legacy_scheme()?;
        }
        Ok(db)
    }

    // Databases predating explicit scheme records are scheme 1; record it,
    // but never touch the stored keys.
    fn upgrade_legacy_scheme(&mut self) -> Result<()> {
        if self.get_config("CryptoScheme")?.is_none() {
            warn!(client = %self.client, "no CryptoScheme recorded; assuming legacy scheme 1");
            self.set_config("CryptoScheme", "1")?;
        }
        Ok(())
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// True when the last session against this database never closed.
    pub fn prior_session_doomed(&self) -> bool {
        self.doomed_prior_session
    }

    pub fn client_id(&self) -> Result<String> {
        self.get_config("ClientID")?
            .ok_or_else(|| DbError::NotFound("ClientID".into()))
    }

    // ---- transactions ----

    fn begin(&mut self) -> Result<()> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN")?;
            self.in_tx = true;
        }
        Ok(())
    }

    /// Commit the open transaction (journal first) and start the next one.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(j) = self.journal.as_mut() {
            j.sync()?;
        }
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
        }
        self.begin()
    }

    /// Roll back the open transaction and start the next one.
    pub fn rollback(&mut self) -> Result<()> {
        if self.in_tx {
            self.conn.execute_batch("ROLLBACK")?;
            self.in_tx = false;
        }
        self.begin()
    }

    /// Close cleanly: commit, clear the journal, optionally vacuum.
    pub fn close(mut self, completed: bool) -> Result<()> {
        self.commit()?;
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
        }
        if completed {
            if let Some(j) = self.journal.take() {
                j.close()?;
            }
        }
        Ok(())
    }

    /// VACUUM when `VacuumInterval` sets have elapsed since the last one.
    pub fn vacuum_if_due(&mut self) -> Result<bool> {
        let interval: i64 = self
            .get_config("VacuumInterval")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if interval <= 0 {
            return Ok(false);
        }
        let last: i64 = self
            .get_config("LastVacuum")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let current = self.current_set.unwrap_or(0);
        if current - last < interval {
            return Ok(false);
        }
        self.set_config("LastVacuum", &current.to_string())?;
        // VACUUM needs autocommit
        self.commit()?;
        self.conn.execute_batch("COMMIT")?;
        self.in_tx = false;
        self.conn.execute_batch("VACUUM")?;
        self.begin()?;
        debug!(set = current, "vacuumed database");
        Ok(true)
    }

    fn jrec(&mut self, entry: serde_json::Value) {
        if let Some(j) = self.journal.as_mut() {
            j.record(&entry);
        }
    }

    // ---- config ----

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    pub fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        self.jrec(json!({"op": "config", "key": key}));
        Ok(())
    }

    /// Atomic write of the full auth material.
    pub fn set_keys(
        &mut self,
        srp_salt: &str,
        srp_vkey: &str,
        filename_key: &str,
        content_key: &str,
    ) -> Result<()> {
        self.set_config("SrpSalt", srp_salt)?;
        self.set_config("SrpVkey", srp_vkey)?;
        self.set_config("FilenameKey", filename_key)?;
        self.set_config("ContentKey", content_key)?;
        self.jrec(json!({"op": "setkeys"}));
        Ok(())
    }

    // ---- SRP ----

    /// Whether this client's sessions must authenticate.
    pub fn needs_authentication(&self) -> Result<bool> {
        Ok(self.get_config("SrpVkey")?.is_some())
    }

    /// First SRP step: the client's `A` buys it `(salt, B)`.
    pub fn authenticate1(&mut self, name: &str, a_pub: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        if name != self.client {
            return Err(DbError::Auth(format!("unknown identity {name}")));
        }
        let salt_b64 = self
            .get_config("SrpSalt")?
            .ok_or_else(|| DbError::Auth("no credentials stored".into()))?;
        let vkey_b64 = self
            .get_config("SrpVkey")?
            .ok_or_else(|| DbError::Auth("no credentials stored".into()))?;
        let salt = B64
            .decode(salt_b64)
            .map_err(|_| DbError::Auth("stored salt unreadable".into()))?;
        let vkey = B64
            .decode(vkey_b64)
            .map_err(|_| DbError::Auth("stored verifier unreadable".into()))?;
        let (state, b_pub) = ServerAuth::start(&vkey, a_pub);
        self.srp = Some(state);
        Ok((salt, b_pub))
    }

    /// Second SRP step: verify `M1`; success yields HAMK.
    pub fn authenticate2(&mut self, m1: &[u8]) -> Result<Vec<u8>> {
        let state = self
            .srp
            .take()
            .ok_or_else(|| DbError::Auth("authentication not started".into()))?;
        state.verify(m1).map_err(|e| DbError::Auth(e.to_string()))
    }

    // ---- backup sets ----

    /// Open a new backup set and pin the session to it.
    #[allow(clippy::too_many_arguments)]
    pub fn new_backup_set(
        &mut self,
        name: &str,
        session: &str,
        priority: i64,
        client_time: f64,
        client_version: &str,
        client_address: &str,
        full: bool,
        server_session: Option<&str>,
    ) -> Result<i64> {
        let prev = self.last_backup_set(false)?;
        let prev_completed = self.last_backup_set(true)?;
        self.prev_set = prev.as_ref().map(|s| s.set_id);
        self.last_completed = prev_completed.as_ref().map(|s| s.set_id);
        self.prev_date = prev_completed.as_ref().map(|s| s.start_time).unwrap_or(0.0);

        let inserted = self.conn.execute(
            "INSERT INTO backupsets
                 (name, session, priority, client_time, client_version, client_address,
                  server_session, full, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                name,
                session,
                priority,
                client_time,
                client_version,
                client_address,
                server_session,
                full as i64,
                now_secs(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(DbError::Constraint(format!("backup set {name} already exists")));
            }
            Err(e) => return Err(e.into()),
        }
        let set_id = self.conn.last_insert_rowid();
        self.current_set = Some(set_id);
        self.jrec(json!({"op": "newset", "set": set_id, "name": name}));
        Ok(set_id)
    }

    /// Most recent set, excluding the session's own; optionally only
    /// completed ones.
    pub fn last_backup_set(&self, completed_only: bool) -> Result<Option<BackupSetInfo>> {
        let current = self.current_set.unwrap_or(i64::MAX);
        let sql = if completed_only {
            "SELECT * FROM backupsets WHERE completed = 1 AND set_id != ?1
             ORDER BY set_id DESC LIMIT 1"
        } else {
            "SELECT * FROM backupsets WHERE set_id != ?1 ORDER BY set_id DESC LIMIT 1"
        };
        Ok(self.conn.query_row(sql, [current], map_set).optional()?)
    }

    pub fn list_backup_sets(&self) -> Result<Vec<BackupSetInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM backupsets ORDER BY set_id")?;
        let rows = stmt.query_map([], map_set)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_backup_set_by_name(&self, name: &str) -> Result<Option<BackupSetInfo>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM backupsets WHERE name = ?1", [name], map_set)
            .optional()?)
    }

    /// Whether an auto-name candidate is still free.
    pub fn check_backup_set_name(&self, name: &str) -> Result<bool> {
        Ok(self.get_backup_set_by_name(name)?.is_none())
    }

    /// Rename the current set (server-side auto-naming after DONE).
    pub fn set_backup_set_name(&mut self, name: &str, priority: i64) -> Result<()> {
        let set = self.require_current()?;
        self.conn.execute(
            "UPDATE backupsets SET name = ?1, priority = ?2 WHERE set_id = ?3",
            params![name, priority, set],
        )?;
        self.jrec(json!({"op": "rename", "set": set, "name": name}));
        Ok(())
    }

    pub fn complete_backup(&mut self) -> Result<()> {
        let set = self.require_current()?;
        self.conn.execute(
            "UPDATE backupsets SET completed = 1 WHERE set_id = ?1",
            [set],
        )?;
        self.jrec(json!({"op": "complete", "set": set}));
        Ok(())
    }

    pub fn set_client_end_time(&mut self) -> Result<()> {
        let set = self.require_current()?;
        self.conn.execute(
            "UPDATE backupsets SET end_time = ?1 WHERE set_id = ?2",
            params![now_secs(), set],
        )?;
        Ok(())
    }

    /// Record why a session went down (diagnostic; the set stays incomplete).
    pub fn set_failure(&mut self, error: &str) -> Result<()> {
        self.set_config("LastFailure", error)
    }

    pub fn set_stats(&mut self, files_full: i64, files_delta: i64, bytes_received: i64) -> Result<()> {
        let set = self.require_current()?;
        self.conn.execute(
            "UPDATE backupsets SET files_full = ?1, files_delta = ?2, bytes_received = ?3
             WHERE set_id = ?4",
            params![files_full, files_delta, bytes_received, set],
        )?;
        Ok(())
    }

    pub fn current_set(&self) -> Option<i64> {
        self.current_set
    }

    pub fn prev_set(&self) -> Option<i64> {
        self.prev_set
    }

    pub fn last_completed(&self) -> Option<i64> {
        self.last_completed
    }

    /// Start time of the most recent completed set before this session.
    pub fn prev_backup_date(&self) -> f64 {
        self.prev_date
    }

    fn require_current(&self) -> Result<i64> {
        self.current_set
            .ok_or_else(|| DbError::Constraint("no backup set open".into()))
    }

    // ---- names ----

    fn intern_name(&mut self, name: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO names (name) VALUES (?1)",
            [name],
        )?;
        Ok(self
            .conn
            .query_row("SELECT name_id FROM names WHERE name = ?1", [name], |r| r.get(0))?)
    }

    // ---- file versions ----

    /// Walk a ciphertext path from the root, component by component.
    pub fn get_file_info_by_path(&self, path: &str, set: i64) -> Result<Option<FileVersion>> {
        let mut parent = (0u64, 0u64);
        let mut found = None;
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            match self.get_file_info_by_name(comp, parent, set)? {
                Some(row) => {
                    parent = (row.inode, row.device);
                    found = Some(row);
                }
                None => return Ok(None),
            }
        }
        Ok(found)
    }

    /// Directory-entry lookup by name ciphertext.
    pub fn get_file_info_by_name(
        &self,
        name: &str,
        parent: (u64, u64),
        set: i64,
    ) -> Result<Option<FileVersion>> {
        let sql = format!(
            "{FILE_SELECT} WHERE n.name = ?1 AND f.parent_inode = ?2 AND f.parent_device = ?3
             AND f.first_set <= ?4 AND f.last_set >= ?4"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![name, parent.0 as i64, parent.1 as i64, set],
                map_file,
            )
            .optional()?)
    }

    /// Any version row of this inode covering `set`.
    pub fn get_file_info_by_inode(&self, inode: (u64, u64), set: i64) -> Result<Option<FileVersion>> {
        let sql = format!(
            "{FILE_SELECT} WHERE f.inode = ?1 AND f.device = ?2
             AND f.first_set <= ?3 AND f.last_set >= ?3 LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![inode.0 as i64, inode.1 as i64, set], map_file)
            .optional()?)
    }

    /// Match by `(inode, device, size, mtime)` across sets; catches renames
    /// and moves without content change.
    pub fn get_file_info_by_similar(
        &self,
        inode: (u64, u64),
        size: i64,
        mtime: i64,
    ) -> Result<Option<FileVersion>> {
        let current = self.current_set.unwrap_or(i64::MAX);
        let sql = format!(
            "{FILE_SELECT} WHERE f.inode = ?1 AND f.device = ?2 AND f.size = ?3 AND f.mtime = ?4
             AND f.first_set < ?5 ORDER BY f.last_set DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![inode.0 as i64, inode.1 as i64, size, mtime, current],
                map_file,
            )
            .optional()?)
    }

    /// Similar-lookup restricted to incomplete sets (the "partial" path).
    pub fn get_file_from_partial_backup(
        &self,
        inode: (u64, u64),
        size: i64,
        mtime: i64,
    ) -> Result<Option<FileVersion>> {
        let current = self.current_set.unwrap_or(i64::MAX);
        let sql = format!(
            "{FILE_SELECT} WHERE f.inode = ?1 AND f.device = ?2 AND f.size = ?3 AND f.mtime = ?4
             AND f.last_set IN (SELECT set_id FROM backupsets WHERE completed = 0 AND set_id != ?5)
             ORDER BY f.last_set DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![inode.0 as i64, inode.1 as i64, size, mtime, current],
                map_file,
            )
            .optional()?)
    }

    /// Inode lookup restricted to incomplete sets.
    pub fn get_file_info_by_inode_from_partial(
        &self,
        inode: (u64, u64),
    ) -> Result<Option<FileVersion>> {
        let current = self.current_set.unwrap_or(i64::MAX);
        let sql = format!(
            "{FILE_SELECT} WHERE f.inode = ?1 AND f.device = ?2
             AND f.last_set IN (SELECT set_id FROM backupsets WHERE completed = 0 AND set_id != ?3)
             ORDER BY f.last_set DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![inode.0 as i64, inode.1 as i64, current], map_file)
            .optional()?)
    }

    /// Enumerate a directory's children at `set`.
    pub fn read_directory(&self, inode: (u64, u64), set: i64) -> Result<Vec<FileVersion>> {
        let sql = format!(
            "{FILE_SELECT} WHERE f.parent_inode = ?1 AND f.parent_device = ?2
             AND f.first_set <= ?3 AND f.last_set >= ?3 ORDER BY n.name"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![inode.0 as i64, inode.1 as i64, set], map_file)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Extend the version row of `(inode)` under `parent` into the current
    /// set. `old_set` overrides which prior set's row to extend (partial
    /// lookups). Returns false when there was nothing to extend.
    pub fn extend_file_inode(
        &mut self,
        parent: (u64, u64),
        inode: (u64, u64),
        old_set: Option<i64>,
    ) -> Result<bool> {
        let cur = self.require_current()?;
        let base = match old_set.or(self.prev_set) {
            Some(s) => s,
            None => return Ok(false),
        };
        let changed = self.conn.execute(
            "UPDATE files SET last_set = ?1
             WHERE parent_inode = ?2 AND parent_device = ?3 AND inode = ?4 AND device = ?5
               AND first_set <= ?6 AND last_set >= ?6 AND last_set < ?1",
            params![
                cur,
                parent.0 as i64,
                parent.1 as i64,
                inode.0 as i64,
                inode.1 as i64,
                base
            ],
        )?;
        Ok(changed > 0)
    }

    /// Insert a fresh version row for the current set.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_file(
        &mut self,
        name: &str,
        parent: (u64, u64),
        inode: (u64, u64),
        dir: bool,
        link: bool,
        nlinks: u64,
        size: i64,
        mtime: i64,
        ctime: i64,
        atime: i64,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        let cur = self.require_current()?;
        let name_id = self.intern_name(name)?;
        // A re-sent directory chunk may try to insert the same entry twice
        // within one set; refresh the row instead of duplicating it.
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT row_id FROM files
                 WHERE name_id = ?1 AND parent_inode = ?2 AND parent_device = ?3
                   AND first_set = ?4",
                params![name_id, parent.0 as i64, parent.1 as i64, cur],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(row_id) = existing {
            self.conn.execute(
                "UPDATE files SET inode = ?1, device = ?2, dir = ?3, link = ?4, nlinks = ?5,
                     size = ?6, mtime = ?7, ctime = ?8, atime = ?9, mode = ?10, uid = ?11,
                     gid = ?12
                 WHERE row_id = ?13",
                params![
                    inode.0 as i64,
                    inode.1 as i64,
                    dir as i64,
                    link as i64,
                    nlinks as i64,
                    size,
                    mtime,
                    ctime,
                    atime,
                    mode,
                    uid,
                    gid,
                    row_id
                ],
            )?;
            return Ok(());
        }
        self.conn.execute(
            "INSERT INTO files (first_set, last_set, name_id, parent_inode, parent_device,
                 inode, device, dir, link, nlinks, size, mtime, ctime, atime, mode, uid, gid)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                cur,
                name_id,
                parent.0 as i64,
                parent.1 as i64,
                inode.0 as i64,
                inode.1 as i64,
                dir as i64,
                link as i64,
                nlinks as i64,
                size,
                mtime,
                ctime,
                atime,
                mode,
                uid,
                gid
            ],
        )?;
        self.jrec(json!({"op": "insert", "name": name, "inode": [inode.0, inode.1]}));
        Ok(())
    }

    /// Attach a stored blob to this inode's version row in the current set.
    pub fn set_checksum(&mut self, inode: (u64, u64), ck: &str) -> Result<()> {
        let cur = self.require_current()?;
        let id = self.checksum_id(ck)?;
        let changed = self.conn.execute(
            "UPDATE files SET checksum_id = ?1
             WHERE inode = ?2 AND device = ?3 AND first_set <= ?4 AND last_set >= ?4",
            params![id, inode.0 as i64, inode.1 as i64, cur],
        )?;
        if changed == 0 {
            warn!(ck, inode = inode.0, "no version row to attach checksum to");
        }
        self.jrec(json!({"op": "setck", "ck": ck, "inode": [inode.0, inode.1]}));
        Ok(())
    }

    pub fn set_xattr(&mut self, inode: (u64, u64), ck: &str) -> Result<()> {
        let cur = self.require_current()?;
        let id = self.checksum_id(ck)?;
        self.conn.execute(
            "UPDATE files SET xattr_id = ?1
             WHERE inode = ?2 AND device = ?3 AND first_set <= ?4 AND last_set >= ?4",
            params![id, inode.0 as i64, inode.1 as i64, cur],
        )?;
        Ok(())
    }

    pub fn set_acl(&mut self, inode: (u64, u64), ck: &str) -> Result<()> {
        let cur = self.require_current()?;
        let id = self.checksum_id(ck)?;
        self.conn.execute(
            "UPDATE files SET acl_id = ?1
             WHERE inode = ?2 AND device = ?3 AND first_set <= ?4 AND last_set >= ?4",
            params![id, inode.0 as i64, inode.1 as i64, cur],
        )?;
        Ok(())
    }

    /// Checksum already attached to this inode in the current set (hard-link
    /// reuse inside one session).
    pub fn get_checksum_by_inode(&self, inode: (u64, u64)) -> Result<Option<String>> {
        let cur = self.require_current()?;
        Ok(self
            .conn
            .query_row(
                "SELECT c.checksum FROM files f JOIN checksums c ON c.checksum_id = f.checksum_id
                 WHERE f.inode = ?1 AND f.device = ?2 AND f.first_set <= ?3 AND f.last_set >= ?3
                 LIMIT 1",
                params![inode.0 as i64, inode.1 as i64, cur],
                |r| r.get(0),
            )
            .optional()?)
    }

    // ---- checksums ----

    fn checksum_id(&self, ck: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT checksum_id FROM checksums WHERE checksum = ?1",
                [ck],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("checksum {ck}")))
    }

    pub fn get_checksum_info(&self, ck: &str) -> Result<Option<ChecksumInfo>> {
        let sql = format!("{CHECKSUM_SELECT} WHERE c.checksum = ?1");
        Ok(self.conn.query_row(&sql, [ck], map_checksum).optional()?)
    }

    /// Cached delta-chain length; `None` for an unknown checksum.
    pub fn get_chain_length(&self, ck: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT chain_length FROM checksums WHERE checksum = ?1",
                [ck],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Create a checksum record. With a basis, the chain extends by one and
    /// a cycle through the basis relation is refused.
    pub fn insert_checksum(
        &mut self,
        ck: &str,
        encrypted: bool,
        size: i64,
        attrs: ChecksumAttrs,
    ) -> Result<i64> {
        if self.get_checksum_info(ck)?.is_some() {
            return Err(DbError::Constraint(format!("checksum {ck} already recorded")));
        }
        let (basis_id, chain) = match attrs.basis.as_deref() {
            None => (None, 0i64),
            Some(basis) => {
                let info = self
                    .get_checksum_info(basis)?
                    .ok_or_else(|| DbError::NotFound(format!("basis {basis}")))?;
                self.check_basis_cycle(ck, basis)?;
                (Some(info.checksum_id), info.chain_length + 1)
            }
        };
        self.conn.execute(
            "INSERT INTO checksums (checksum, is_file, encrypted, compressed, size, disk_size,
                 delta_size, basis, chain_length)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ck,
                attrs.is_file as i64,
                encrypted as i64,
                attrs.compressed,
                size,
                attrs.disk_size,
                attrs.delta_size,
                basis_id,
                chain
            ],
        )?;
        self.jrec(json!({"op": "insertck", "ck": ck, "size": size, "chain": chain}));
        Ok(self.conn.last_insert_rowid())
    }

    // The basis relation must stay a DAG: refuse a basis whose transitive
    // closure contains the target.
    fn check_basis_cycle(&self, target: &str, basis: &str) -> Result<()> {
        let mut cursor = Some(basis.to_string());
        let mut hops = 0;
        while let Some(ck) = cursor {
            if ck == target {
                return Err(DbError::Constraint(format!(
                    "basis cycle: {basis} reaches {target}"
                )));
            }
            hops += 1;
            if hops > 1024 {
                return Err(DbError::Constraint("basis chain unreasonably deep".into()));
            }
            cursor = self
                .get_checksum_info(&ck)?
                .and_then(|info| info.basis);
        }
        Ok(())
    }

    /// Fill in a placeholder (or refresh a full record) once content lands.
    pub fn update_checksum_file(
        &mut self,
        ck: &str,
        encrypted: bool,
        size: i64,
        compressed: Option<&str>,
        disk_size: i64,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE checksums SET encrypted = ?1, size = ?2, compressed = ?3, disk_size = ?4,
                 basis = NULL, delta_size = NULL, chain_length = 0
             WHERE checksum = ?5",
            params![encrypted as i64, size, compressed, disk_size, ck],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("checksum {ck}")));
        }
        self.jrec(json!({"op": "updateck", "ck": ck, "size": size}));
        Ok(())
    }

    /// Distinct stored file sizes above a threshold (drives the
    /// checksum-instead-of-content choice for large files).
    pub fn get_file_sizes(&self, threshold: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT size FROM files WHERE size IS NOT NULL AND size > ?1",
        )?;
        let rows = stmt.query_map([threshold], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ---- directory hash / clone ----

    /// Attach a directory-hash pseudo blob to the directory's version row.
    pub fn update_dir_checksum(&mut self, inode: (u64, u64), ck: &str) -> Result<()> {
        self.set_checksum(inode, ck)
    }

    /// Children of a directory at `set` (clone candidate comparison).
    pub fn get_directory_size(&self, inode: (u64, u64), set: i64) -> Result<Option<i64>> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM files
             WHERE parent_inode = ?1 AND parent_device = ?2 AND first_set <= ?3 AND last_set >= ?3",
            params![inode.0 as i64, inode.1 as i64, set],
            |r| r.get(0),
        )?;
        Ok(if n == 0 { None } else { Some(n) })
    }

    /// Delta-stored children at `set` (vetoes cloning on a full backup).
    pub fn get_num_deltas_in_directory(&self, inode: (u64, u64), set: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM files f JOIN checksums c ON c.checksum_id = f.checksum_id
             WHERE f.parent_inode = ?1 AND f.parent_device = ?2
               AND f.first_set <= ?3 AND f.last_set >= ?3 AND c.chain_length > 0",
            params![inode.0 as i64, inode.1 as i64, set],
            |r| r.get(0),
        )?)
    }

    /// Extend every child version row of a directory into the current set.
    pub fn clone_dir(&mut self, inode: (u64, u64), from_set: i64) -> Result<u64> {
        let cur = self.require_current()?;
        let changed = self.conn.execute(
            "UPDATE files SET last_set = ?1
             WHERE parent_inode = ?2 AND parent_device = ?3
               AND first_set <= ?4 AND last_set >= ?4 AND last_set < ?1",
            params![cur, inode.0 as i64, inode.1 as i64, from_set],
        )?;
        self.jrec(json!({"op": "clone", "inode": [inode.0, inode.1], "rows": changed}));
        Ok(changed as u64)
    }

    // ---- purge ----

    /// Delete sets with `priority <= max_priority` that ended before
    /// `before_time` (and, when given, sit below `before_set`). Version rows
    /// left covering no surviving set are dropped. Returns
    /// `(files_deleted, sets_deleted)`.
    pub fn purge_sets(
        &mut self,
        max_priority: i64,
        before_time: f64,
        before_set: Option<i64>,
    ) -> Result<(u64, u64)> {
        self.purge_impl(max_priority, before_time, before_set, false)
    }

    /// Purge restricted to incomplete sets.
    pub fn purge_incomplete(
        &mut self,
        max_priority: i64,
        before_time: f64,
        before_set: Option<i64>,
    ) -> Result<(u64, u64)> {
        self.purge_impl(max_priority, before_time, before_set, true)
    }

    fn purge_impl(
        &mut self,
        max_priority: i64,
        before_time: f64,
        before_set: Option<i64>,
        incomplete_only: bool,
    ) -> Result<(u64, u64)> {
        let current = self.current_set.unwrap_or(-1);
        let cursor = before_set.unwrap_or(i64::MAX);
        let completed_clause = if incomplete_only { "AND completed = 0" } else { "" };
        let sql = format!(
            "DELETE FROM backupsets
             WHERE priority <= ?1 AND set_id != ?2 AND set_id < ?3
               AND end_time IS NOT NULL AND end_time < ?4 {completed_clause}"
        );
        let sets = self
            .conn
            .execute(&sql, params![max_priority, current, cursor, before_time])?;
        let files = self.drop_uncovered_rows()?;
        if sets > 0 {
            info!(sets, files, "purged backup sets");
        }
        self.jrec(json!({"op": "purge", "sets": sets, "files": files}));
        Ok((files, sets as u64))
    }

    /// Delete one named set outright (admin path).
    pub fn delete_backup_set(&mut self, name: &str) -> Result<(u64, bool)> {
        let deleted = self
            .conn
            .execute("DELETE FROM backupsets WHERE name = ?1", [name])?;
        let files = self.drop_uncovered_rows()?;
        Ok((files, deleted > 0))
    }

    fn drop_uncovered_rows(&mut self) -> Result<u64> {
        let files = self.conn.execute(
            "DELETE FROM files WHERE NOT EXISTS (
                 SELECT 1 FROM backupsets b
                 WHERE b.set_id >= files.first_set AND b.set_id <= files.last_set)",
            [],
        )?;
        Ok(files as u64)
    }

    // ---- orphan reclamation ----

    /// Checksums referenced by no version row and serving as no one's basis.
    /// One round; deleting a delta record can orphan its basis, so callers
    /// loop until a round comes back empty.
    pub fn list_orphan_checksums(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT checksum FROM checksums c
             WHERE NOT EXISTS (SELECT 1 FROM files f
                               WHERE f.checksum_id = c.checksum_id
                                  OR f.xattr_id = c.checksum_id
                                  OR f.acl_id = c.checksum_id)
               AND NOT EXISTS (SELECT 1 FROM checksums d WHERE d.basis = c.checksum_id)
               AND NOT EXISTS (SELECT 1 FROM config WHERE value = c.checksum)",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_checksum(&mut self, ck: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM checksums WHERE checksum = ?1", [ck])?;
        Ok(n > 0)
    }
}

fn rotate_backups(db_path: &Path, generations: u32) -> std::io::Result<()> {
    for i in (1..generations).rev() {
        let from = db_path.with_extension(format!("db.{i}"));
        let to = db_path.with_extension(format!("db.{}", i + 1));
        if from.is_file() {
            fs::rename(&from, &to)?;
        }
    }
    let first = db_path.with_extension("db.1");
    fs::copy(db_path, first)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db(dir: &Path) -> MetaDb {
        MetaDb::open(dir, "alice", true, 0, Some("journal")).unwrap()
    }

    fn reopen_db(dir: &Path) -> MetaDb {
        MetaDb::open(dir, "alice", false, 0, Some("journal")).unwrap()
    }

    fn start_set(db: &mut MetaDb, name: &str) -> i64 {
        db.new_backup_set(name, &format!("sess-{name}"), 0, 1000.0, "0.1", "127.0.0.1", false, None)
            .unwrap()
    }

    fn finish_set(db: &mut MetaDb) {
        db.complete_backup().unwrap();
        db.set_client_end_time().unwrap();
        db.commit().unwrap();
        db.current_set = None;
    }

    fn insert_plain_file(db: &mut MetaDb, name: &str, parent: (u64, u64), inode: (u64, u64)) {
        db.insert_file(name, parent, inode, false, false, 1, 100, 5000, 5000, 5000, 0o644, 0, 0)
            .unwrap();
    }

    #[test]
    fn create_sets_identity_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        assert!(!db.client_id().unwrap().is_empty());
        assert_eq!(db.get_config("SchemaVersion").unwrap().as_deref(), Some(SCHEMA_VERSION));
        assert!(!db.needs_authentication().unwrap());
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        db.close(true).unwrap();
        assert!(matches!(
            MetaDb::open(dir.path(), "alice", true, 0, None),
            Err(DbError::Constraint(_))
        ));
        assert!(matches!(
            MetaDb::open(dir.path(), "ghost", false, 0, None),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn insert_lookup_extend_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        let set1 = start_set(&mut db, "set1");
        insert_plain_file(&mut db, "enc-root", (0, 0), (10, 1));
        db.insert_file("enc-a", (10, 1), (11, 1), false, false, 1, 100, 5000, 5000, 5000, 0o644, 0, 0)
            .unwrap();
        finish_set(&mut db);

        let set2 = start_set(&mut db, "set2");
        assert_eq!(db.prev_set(), Some(set1));
        let old = db.get_file_info_by_name("enc-a", (10, 1), set1).unwrap().unwrap();
        assert_eq!(old.size, Some(100));

        assert!(db.extend_file_inode((10, 1), (11, 1), None).unwrap());
        let now = db.get_file_info_by_name("enc-a", (10, 1), set2).unwrap().unwrap();
        assert_eq!(now.first_set, set1);
        assert_eq!(now.last_set, set2);

        // second extension is a no-op
        assert!(!db.extend_file_inode((10, 1), (11, 1), None).unwrap());
    }

    #[test]
    fn path_walk_by_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        let set = start_set(&mut db, "set1");
        db.insert_file("enc-root", (0, 0), (10, 1), true, false, 2, 0, 0, 0, 0, 0o755, 0, 0)
            .unwrap();
        db.insert_file("enc-sub", (10, 1), (20, 1), true, false, 2, 0, 0, 0, 0, 0o755, 0, 0)
            .unwrap();
        insert_plain_file(&mut db, "enc-file", (20, 1), (30, 1));

        let hit = db
            .get_file_info_by_path("/enc-root/enc-sub/enc-file", set)
            .unwrap()
            .unwrap();
        assert_eq!(hit.inode, 30);
        assert!(db.get_file_info_by_path("/enc-root/nope", set).unwrap().is_none());
    }

    #[test]
    fn checksum_records_and_chains() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        start_set(&mut db, "set1");

        db.insert_checksum("aa00", false, 1000, ChecksumAttrs { is_file: true, disk_size: 900, ..Default::default() })
            .unwrap();
        db.insert_checksum(
            "bb00",
            false,
            1100,
            ChecksumAttrs {
                is_file: true,
                disk_size: 60,
                delta_size: Some(64),
                basis: Some("aa00".into()),
                ..Default::default()
            },
        )
        .unwrap();
        db.insert_checksum(
            "cc00",
            false,
            1200,
            ChecksumAttrs { is_file: true, disk_size: 70, basis: Some("bb00".into()), ..Default::default() },
        )
        .unwrap();

        assert_eq!(db.get_chain_length("aa00").unwrap(), Some(0));
        assert_eq!(db.get_chain_length("bb00").unwrap(), Some(1));
        assert_eq!(db.get_chain_length("cc00").unwrap(), Some(2));
        let info = db.get_checksum_info("cc00").unwrap().unwrap();
        assert_eq!(info.basis.as_deref(), Some("bb00"));

        // duplicates and unknown bases are refused
        assert!(db.insert_checksum("aa00", false, 1, ChecksumAttrs::default()).is_err());
        assert!(db
            .insert_checksum("dd00", false, 1, ChecksumAttrs { basis: Some("9999".into()), ..Default::default() })
            .is_err());
    }

    #[test]
    fn placeholder_fill_resets_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        start_set(&mut db, "set1");
        db.insert_checksum("meta1", true, -1, ChecksumAttrs::default()).unwrap();
        assert!(db.get_checksum_info("meta1").unwrap().unwrap().is_placeholder());
        db.update_checksum_file("meta1", true, 345, Some("zstd"), 400).unwrap();
        let info = db.get_checksum_info("meta1").unwrap().unwrap();
        assert!(!info.is_placeholder());
        assert_eq!(info.size, 345);
        assert_eq!(info.chain_length, 0);
    }

    #[test]
    fn clone_extends_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        let set1 = start_set(&mut db, "set1");
        for i in 0..5u64 {
            insert_plain_file(&mut db, &format!("enc-{i}"), (10, 1), (100 + i, 1));
        }
        finish_set(&mut db);

        let set2 = start_set(&mut db, "set2");
        assert_eq!(db.get_directory_size((10, 1), set1).unwrap(), Some(5));
        assert_eq!(db.clone_dir((10, 1), set1).unwrap(), 5);
        assert_eq!(db.read_directory((10, 1), set2).unwrap().len(), 5);
    }

    #[test]
    fn similar_and_partial_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        start_set(&mut db, "set1");
        insert_plain_file(&mut db, "enc-a", (10, 1), (11, 1));
        // set1 never completes
        db.set_client_end_time().unwrap();
        db.commit().unwrap();
        db.current_set = None;

        start_set(&mut db, "set2");
        let similar = db.get_file_info_by_similar((11, 1), 100, 5000).unwrap();
        assert!(similar.is_some());
        let partial = db.get_file_from_partial_backup((11, 1), 100, 5000).unwrap();
        assert!(partial.is_some(), "incomplete set rows stay reachable");
        assert!(db.get_file_from_partial_backup((11, 1), 999, 5000).unwrap().is_none());
    }

    #[test]
    fn purge_drops_sets_and_uncovered_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        let _set1 = start_set(&mut db, "old");
        insert_plain_file(&mut db, "enc-a", (10, 1), (11, 1));
        insert_plain_file(&mut db, "enc-b", (10, 1), (12, 1));
        finish_set(&mut db);

        let set2 = start_set(&mut db, "newer");
        // extend only enc-a; enc-b stays confined to the old set
        db.extend_file_inode((10, 1), (11, 1), None).unwrap();
        finish_set(&mut db);

        let mut db = reopen_db(dir.path());
        start_set(&mut db, "work");
        let (files, sets) = db.purge_sets(10, now_secs() + 1.0, Some(set2)).unwrap();
        assert_eq!(sets, 1);
        assert_eq!(files, 1, "only the row with no surviving set goes");
        // idempotent
        let (files2, sets2) = db.purge_sets(10, now_secs() + 1.0, Some(set2)).unwrap();
        assert_eq!((files2, sets2), (0, 0));
    }

    #[test]
    fn purge_incomplete_leaves_completed_sets() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        start_set(&mut db, "good");
        finish_set(&mut db);

        // an aborted set: end time recorded, never completed
        start_set(&mut db, "aborted");
        db.set_client_end_time().unwrap();
        db.commit().unwrap();
        db.current_set = None;

        start_set(&mut db, "work");
        let (_, sets) = db.purge_incomplete(10, now_secs() + 1.0, None).unwrap();
        assert_eq!(sets, 1);
        assert!(db.get_backup_set_by_name("good").unwrap().is_some());
        assert!(db.get_backup_set_by_name("aborted").unwrap().is_none());
    }

    #[test]
    fn orphan_rounds_follow_basis_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        start_set(&mut db, "set1");
        db.insert_checksum("aa11", false, 10, ChecksumAttrs { is_file: true, ..Default::default() })
            .unwrap();
        db.insert_checksum(
            "bb11",
            false,
            10,
            ChecksumAttrs { is_file: true, basis: Some("aa11".into()), ..Default::default() },
        )
        .unwrap();

        // nothing references bb11, but aa11 is its basis
        let round1 = db.list_orphan_checksums().unwrap();
        assert_eq!(round1, vec!["bb11".to_string()]);
        db.delete_checksum("bb11").unwrap();
        let round2 = db.list_orphan_checksums().unwrap();
        assert_eq!(round2, vec!["aa11".to_string()]);
        db.delete_checksum("aa11").unwrap();
        assert!(db.list_orphan_checksums().unwrap().is_empty());
    }

    #[test]
    fn srp_round_trip_through_db() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        let crypto = crypt::Crypto::new(3, "alice", Some("p@ss")).unwrap();
        let (salt, vkey) = crypto.srp_values("p@ss");
        db.set_keys(&B64.encode(&salt), &B64.encode(&vkey), "fk", "ck").unwrap();
        assert!(db.needs_authentication().unwrap());

        let client = crypt::auth::ClientAuth::new("alice", "p@ss");
        let a_pub = client.public_a();
        let (got_salt, b_pub) = db.authenticate1("alice", &a_pub).unwrap();
        assert_eq!(got_salt, salt);
        let (m1, proof) = client.process_challenge(&got_salt, &b_pub).unwrap();
        let hamk = db.authenticate2(&m1).unwrap();
        proof.verify_server(&hamk).unwrap();

        // wrong password fails at step 2
        let bad = crypt::auth::ClientAuth::new("alice", "nope");
        let (s2, b2) = db.authenticate1("alice", &bad.public_a()).unwrap();
        let (m1_bad, _) = bad.process_challenge(&s2, &b2).unwrap();
        assert!(matches!(db.authenticate2(&m1_bad), Err(DbError::Auth(_))));
    }

    #[test]
    fn basis_cycle_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        start_set(&mut db, "set1");
        db.insert_checksum("aaaa", false, 10, ChecksumAttrs::default()).unwrap();
        let err = db
            .insert_checksum(
                "aaaa",
                false,
                10,
                ChecksumAttrs { basis: Some("aaaa".into()), ..Default::default() },
            )
            .unwrap_err();
        assert!(matches!(err, DbError::Constraint(_)));
    }

    #[test]
    fn legacy_db_without_scheme_reads_as_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_db(dir.path());
        db.conn.execute("DELETE FROM config WHERE key = 'CryptoScheme'", []).ok();
        db.close(true).unwrap();

        let db = reopen_db(dir.path());
        assert_eq!(db.get_config("CryptoScheme").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn db_backup_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        db.close(true).unwrap();
        let db = MetaDb::open(dir.path(), "alice", false, 2, None).unwrap();
        db.close(true).unwrap();
        assert!(dir.path().join("alice/alice.db.1").is_file());
    }
}
