//! Backup client.
//!
//! A single walker thread drives the traversal: per directory it loads
//! layered exclusions, stats the entries, hashes the listing, and decides
//! between cloning (nothing newer than the previous set's start time) and
//! sending `DIR` chunks. Server replies classify each file; queued content,
//! checksum, and delta transfers are pushed as the acknowledgements arrive.
//! Checksums for `CKS` replies are computed on a parallel pool.

#![deny(unsafe_code)]

pub mod exclude;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use crypt::{ContentHasher, Crypto};
use delta::SignatureBuilder;
use rayon::prelude::*;
use strata_core::framing::{Encoding, Transport, TransportCompression, DATA_CHUNK};
use strata_core::wire::{BulkTrailer, CksumEntry, CloneEntry, FileInfo, InodeId, Msg};
use strata_core::Error;
use tracing::{debug, info, warn};

use exclude::ExcludeSet;

/// Client-side configuration for one backup run.
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Server address, `host:port`.
    pub server: String,
    /// Client identity (the per-client store and database name).
    pub client: String,
    pub password: Option<String>,
    /// Crypto scheme used when creating a new client.
    pub crypto_scheme: Option<u8>,
    pub create: bool,
    /// Root directories to back up, in order.
    pub roots: Vec<PathBuf>,
    /// Explicit set name; disables server-side auto-naming.
    pub name: Option<String>,
    pub priority: i64,
    pub full: bool,
    pub force: bool,
    pub encoding: Encoding,
    pub compress: TransportCompression,
    /// Compress file content (zstd) before encryption.
    pub compress_content: bool,
    /// Files smaller than this are never compressed.
    pub min_compress_size: i64,
    /// Batched messages flushed at this count…
    pub batch_size: usize,
    /// …or this age.
    pub batch_duration: Duration,
    /// DIR messages carry at most this many entries.
    pub dir_slice: usize,
    /// Clone requests flushed at this count; 0 disables cloning.
    pub clones: usize,
    /// Directories up to this size clone all-or-nothing.
    pub clone_threshold: usize,
    /// A delta larger than this percentage of the file goes as full content.
    pub delta_threshold_pct: u32,
    pub exclude_patterns: Vec<String>,
    /// Per-directory exclude file pushed down the subtree.
    pub exclude_file_name: Option<String>,
    /// Per-directory exclude file applying only locally.
    pub local_exclude_file_name: Option<String>,
    /// Directories skipped outright.
    pub exclude_dirs: Vec<PathBuf>,
    pub cvs_excludes: bool,
    /// Honor CACHEDIR.TAG markers.
    pub skip_caches: bool,
    /// Directory marker file that suppresses a subtree.
    pub skip_file_name: Option<String>,
    /// Descend across device boundaries.
    pub cross_device: bool,
    /// Collect extended attributes.
    pub xattrs: bool,
    /// Ask the server to purge per its retention policy after this run.
    pub purge: bool,
    /// Send the client configuration for server-side diagnostics.
    pub send_config: Option<String>,
    pub timeout: Duration,
}

impl WalkerConfig {
    pub fn new(server: &str, client: &str, roots: Vec<PathBuf>) -> Self {
        Self {
            server: server.to_string(),
            client: client.to_string(),
            password: None,
            crypto_scheme: None,
            create: false,
            roots,
            name: None,
            priority: 0,
            full: false,
            force: false,
            encoding: Encoding::MsgPack,
            compress: TransportCompression::Snappy,
            compress_content: true,
            min_compress_size: 4096,
            batch_size: 100,
            batch_duration: Duration::from_secs(30),
            dir_slice: 1000,
            clones: 100,
            clone_threshold: 64,
            delta_threshold_pct: 66,
            exclude_patterns: Vec::new(),
            exclude_file_name: Some(".strata-exclude".to_string()),
            local_exclude_file_name: Some(".strata-local-exclude".to_string()),
            exclude_dirs: Vec::new(),
            cvs_excludes: false,
            skip_caches: false,
            skip_file_name: Some(".strata-skip".to_string()),
            cross_device: false,
            xattrs: false,
            purge: false,
            send_config: None,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub dirs: u64,
    pub files: u64,
    pub links: u64,
    pub backed_bytes: u64,
    pub new_files: u64,
    pub delta_files: u64,
    pub cloned_dirs: u64,
    pub gone: u64,
    pub denied: u64,
}

/// Details the server reported at session start.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub set_name: String,
    pub client_id: String,
    pub new_client: bool,
}

struct CloneContent {
    enc_path: String,
    files: Vec<FileInfo>,
}

/// Run a whole backup against the configured server.
pub fn run_backup(cfg: &WalkerConfig) -> Result<(SessionInfo, WalkStats), Error> {
    let mut client = BackupClient::connect(cfg)?;
    let result = client.run();
    match result {
        Ok(stats) => {
            let info = client.session.clone();
            Ok((info, stats))
        }
        Err(e) => {
            let _ = client.t.send(&Msg::Bye { error: Some(e.to_string()) });
            Err(e)
        }
    }
}

struct BackupClient<'a> {
    cfg: &'a WalkerConfig,
    t: Transport<TcpStream>,
    crypto: Crypto,
    session: SessionInfo,
    last_timestamp: f64,
    inode_db: HashMap<InodeId, (FileInfo, PathBuf)>,
    batch: Vec<Msg>,
    batch_started: Option<Instant>,
    clone_queue: Vec<CloneEntry>,
    clone_contents: HashMap<InodeId, CloneContent>,
    dir_hashes: HashMap<InodeId, (String, u64)>,
    meta_cache: HashMap<String, Vec<u8>>,
    new_meta: Vec<String>,
    stats: WalkStats,
}

impl<'a> BackupClient<'a> {
    // ---- session establishment ----

    fn connect(cfg: &'a WalkerConfig) -> Result<Self, Error> {
        let stream = TcpStream::connect(&cfg.server)?;
        stream.set_read_timeout(Some(cfg.timeout))?;
        stream.set_nodelay(true).ok();
        let mut t = Transport::client(stream, cfg.encoding, cfg.compress)?;

        let scheme = match (&cfg.password, cfg.crypto_scheme) {
            (None, _) => 0,
            (Some(_), Some(s)) => s,
            (Some(_), None) => crypt::DEFAULT_SCHEME,
        };
        let mut crypto = Crypto::new(scheme, &cfg.client, cfg.password.as_deref())
            .map_err(|e| Error::AuthFailed(e.to_string()))?;
        if cfg.create && crypto.encrypting() {
            crypto.gen_keys();
        }

        t.send(&Msg::Backup {
            host: cfg.client.clone(),
            time: strata_core::ids::now_secs(),
            version: strata_core::VERSION.to_string(),
            autoname: cfg.name.is_none(),
            name: cfg.name.clone(),
            full: cfg.full,
            priority: cfg.priority,
            force: cfg.force,
            create: cfg.create,
        })?;

        // NEEDKEYS → [SETKEYS] → [AUTH…] → INIT, in whatever subset the
        // server requires for this client.
        let mut sent_keys = false;
        let init = loop {
            match t.recv()? {
                Msg::NeedKeys {} => {
                    let keys = Self::key_material(&crypto, cfg)?;
                    t.send(&keys)?;
                    sent_keys = true;
                }
                Msg::AuthChallenge { crypto_scheme, .. } => {
                    let password = cfg
                        .password
                        .as_deref()
                        .ok_or_else(|| Error::AuthFailed("server requires a password".into()))?;
                    if crypto.scheme() != crypto_scheme {
                        crypto = Crypto::new(crypto_scheme, &cfg.client, Some(password))
                            .map_err(|e| Error::AuthFailed(e.to_string()))?;
                    }
                    Self::srp_exchange(&mut t, &cfg.client, password)?;
                }
                Msg::Init {
                    sessionid,
                    prev_date,
                    new,
                    name,
                    clientid,
                    filename_key,
                    content_key,
                    ..
                } => {
                    if let (Some(fk), Some(ck)) = (&filename_key, &content_key) {
                        crypto
                            .set_wrapped_keys(fk, ck)
                            .map_err(|e| Error::AuthFailed(e.to_string()))?;
                    }
                    break (sessionid, prev_date, new, name, clientid);
                }
                Msg::AuthFail { error, .. } => return Err(Error::AuthFailed(error)),
                Msg::Fail { error, .. } => return Err(Error::InitFailed(error)),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {} during session setup",
                        other.tag()
                    )))
                }
            }
        };
        let (session_id, prev_date, new, set_name, client_id) = init;
        info!(session = %session_id, set = %set_name, "session established");

        let mut client = Self {
            cfg,
            t,
            crypto,
            session: SessionInfo {
                session_id,
                set_name,
                client_id,
                new_client: new == "NEW",
            },
            last_timestamp: prev_date,
            inode_db: HashMap::new(),
            batch: Vec::new(),
            batch_started: None,
            clone_queue: Vec::new(),
            clone_contents: HashMap::new(),
            dir_hashes: HashMap::new(),
            meta_cache: HashMap::new(),
            new_meta: Vec::new(),
            stats: WalkStats::default(),
        };

        // Creating against a server that did not demand keys up front still
        // stores them: rotate them in as the first command.
        if cfg.create && client.crypto.encrypting() && !sent_keys {
            let keys = Self::key_material(&client.crypto, cfg)?;
            let resp = client.send_and_receive(keys)?;
            client.handle_response(resp)?;
        }
        Ok(client)
    }

    fn key_material(crypto: &Crypto, cfg: &WalkerConfig) -> Result<Msg, Error> {
        let password = cfg
            .password
            .as_deref()
            .ok_or_else(|| Error::AuthFailed("creating an encrypted client needs a password".into()))?;
        let (fkey, ckey) = crypto
            .wrapped_keys()
            .map_err(|e| Error::AuthFailed(e.to_string()))?;
        let (salt, vkey) = crypto.srp_values(password);
        Ok(Msg::SetKeys {
            crypto_scheme: crypto.scheme(),
            filename_key: fkey,
            content_key: ckey,
            srp_salt: B64.encode(salt),
            srp_vkey: B64.encode(vkey),
            msgid: None,
        })
    }

    fn srp_exchange(t: &mut Transport<TcpStream>, client: &str, password: &str) -> Result<(), Error> {
        let auth = crypt::auth::ClientAuth::new(client, password);
        t.send(&Msg::Auth1 {
            srp_uname: B64.encode(client.as_bytes()),
            srp_value_a: B64.encode(auth.public_a()),
        })?;
        let (salt, b_pub) = match t.recv()? {
            Msg::Auth1Ok { srp_value_s, srp_value_b } => {
                let salt = B64
                    .decode(srp_value_s)
                    .map_err(|_| Error::Protocol("bad AUTH1-OK encoding".into()))?;
                let b = B64
                    .decode(srp_value_b)
                    .map_err(|_| Error::Protocol("bad AUTH1-OK encoding".into()))?;
                (salt, b)
            }
            Msg::AuthFail { error, .. } => return Err(Error::AuthFailed(error)),
            other => return Err(Error::Protocol(format!("expected AUTH1-OK, got {}", other.tag()))),
        };
        let (m1, proof) = auth
            .process_challenge(&salt, &b_pub)
            .map_err(|e| Error::AuthFailed(e.to_string()))?;
        t.send(&Msg::Auth2 { srp_value_m: B64.encode(m1) })?;
        match t.recv()? {
            Msg::Auth2Ok { srp_value_hamk } => {
                let hamk = B64
                    .decode(srp_value_hamk)
                    .map_err(|_| Error::Protocol("bad AUTH2-OK encoding".into()))?;
                proof
                    .verify_server(&hamk)
                    .map_err(|e| Error::AuthFailed(e.to_string()))?;
                Ok(())
            }
            Msg::AuthFail { error, .. } => Err(Error::AuthFailed(error)),
            other => Err(Error::Protocol(format!("expected AUTH2-OK, got {}", other.tag()))),
        }
    }

    // ---- main drive ----

    fn run(&mut self) -> Result<WalkStats, Error> {
        let roots = self.cfg.roots.clone();
        for root in &roots {
            self.backup_root(root)?;
        }

        // Drain every queue; acknowledgements can enqueue further work
        // (clone rejections resend listings, checksum replies push content).
        loop {
            if !self.new_meta.is_empty() {
                self.flush_meta()?;
                continue;
            }
            if !self.clone_queue.is_empty() {
                self.flush_clones()?;
                continue;
            }
            if !self.batch.is_empty() {
                self.flush_batch()?;
                continue;
            }
            break;
        }

        if let Some(args) = &self.cfg.send_config {
            let msg = Msg::ClientConfig { args: args.clone(), msgid: None };
            let resp = self.send_and_receive(msg)?;
            self.handle_response(resp)?;
        }
        if self.cfg.purge {
            let resp = self.send_and_receive(Msg::Purge {
                time: None,
                relative: false,
                priority: None,
                msgid: None,
            })?;
            self.handle_response(resp)?;
        }

        let resp = self.send_and_receive(Msg::Done { msgid: None })?;
        self.handle_response(resp)?;
        self.t.send(&Msg::Bye { error: None })?;
        info!(stats = ?self.stats, "backup finished");
        Ok(self.stats)
    }

    fn backup_root(&mut self, root: &Path) -> Result<(), Error> {
        let meta = match std::fs::symlink_metadata(root) {
            Ok(m) if m.is_dir() => m,
            Ok(_) => {
                warn!(root = %root.display(), "backup root is not a directory");
                return Ok(());
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "cannot stat backup root");
                self.stats.gone += 1;
                return Ok(());
            }
        };
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let Some(finfo) = self.mk_file_info(root, &meta, &name)? else {
            return Ok(());
        };
        let enc_root = format!("/{}", finfo.name);
        let root_msg = Msg::Dir {
            path: "/".to_string(),
            inode: (0, 0),
            files: vec![finfo],
            last: true,
            msgid: None,
        };
        let resp = self.send_and_receive(root_msg)?;
        self.handle_response(resp)?;

        let mut patterns: Vec<String> = self.cfg.exclude_patterns.clone();
        if self.cfg.cvs_excludes {
            patterns.extend(exclude::CVS_DEFAULTS.iter().map(|s| s.to_string()));
        }
        let excludes = ExcludeSet::new(&patterns);
        self.recurse(root, root, &enc_root, &excludes)
    }

    fn recurse(
        &mut self,
        dir: &Path,
        root: &Path,
        enc_path: &str,
        excludes: &ExcludeSet,
    ) -> Result<(), Error> {
        use std::os::unix::fs::MetadataExt;

        let meta = match std::fs::symlink_metadata(dir) {
            Ok(m) if m.is_dir() => m,
            _ => return Ok(()),
        };
        if self.cfg.exclude_dirs.iter().any(|d| d == dir) {
            debug!(dir = %dir.display(), "directory excluded");
            return Ok(());
        }
        if let Some(skip) = &self.cfg.skip_file_name {
            if dir.join(skip).symlink_metadata().is_ok() {
                debug!(dir = %dir.display(), "skip marker found");
                return Ok(());
            }
        }
        if self.cfg.skip_caches && is_cache_dir(dir) {
            debug!(dir = %dir.display(), "cache directory tag found");
            return Ok(());
        }

        let dir_inode = (meta.ino(), meta.dev());
        let (files, subdirs, subexcludes) = self.dir_contents(dir, root, &meta, excludes)?;

        let hash = self.hash_dir(&files)?;
        self.dir_hashes.insert(dir_inode, hash.clone());

        let (new_files, old_files) = self.split_by_age(files);

        if !new_files.is_empty() {
            if !self.new_meta.is_empty() {
                self.flush_meta()?;
            }
            if !old_files.is_empty() {
                self.queue_clone(dir_inode, enc_path, old_files)?;
            }
            self.send_dir_chunks(enc_path, dir_inode, new_files)?;
        } else {
            self.queue_clone_with_hash(dir_inode, enc_path, old_files, hash)?;
        }

        for sub in subdirs {
            let name = sub
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let enc_child = format!(
                "{}/{}",
                enc_path,
                self.crypto
                    .encrypt_name(&name)
                    .map_err(|e| Error::Integrity(e.to_string()))?
            );
            self.recurse(&sub, root, &enc_child, &subexcludes)?;
        }
        Ok(())
    }

    fn split_by_age(&self, files: Vec<FileInfo>) -> (Vec<FileInfo>, Vec<FileInfo>) {
        if files.is_empty() || self.cfg.clones == 0 {
            return (files, Vec::new());
        }
        let cutoff = self.last_timestamp;
        if files.len() > self.cfg.clone_threshold {
            files
                .into_iter()
                .partition(|f| (f.mtime.max(f.ctime) as f64) >= cutoff)
        } else {
            let newest = files.iter().map(|f| f.mtime.max(f.ctime)).max().unwrap_or(0);
            if (newest as f64) < cutoff {
                (Vec::new(), files)
            } else {
                (files, Vec::new())
            }
        }
    }

    fn dir_contents(
        &mut self,
        dir: &Path,
        root: &Path,
        dirstat: &std::fs::Metadata,
        excludes: &ExcludeSet,
    ) -> Result<(Vec<FileInfo>, Vec<PathBuf>, ExcludeSet), Error> {
        use std::os::unix::fs::MetadataExt;

        self.stats.dirs += 1;
        let mut pushed = Vec::new();
        if let Some(name) = &self.cfg.exclude_file_name {
            pushed.extend(exclude::load_exclude_file(&dir.join(name)));
        }
        let subexcludes = excludes.extended(&pushed);
        let mut local_patterns = Vec::new();
        if let Some(name) = &self.cfg.local_exclude_file_name {
            local_patterns.extend(exclude::load_exclude_file(&dir.join(name)));
        }
        let local = subexcludes.extended(&local_patterns);

        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(it) => it.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read directory");
                self.stats.denied += 1;
                return Ok((files, subdirs, subexcludes));
            }
        };
        entries.sort();

        for path in entries {
            let rel = format!(
                "/{}",
                path.strip_prefix(root).unwrap_or(&path).to_string_lossy()
            );
            if local.is_excluded(&rel) {
                continue;
            }
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(_) => {
                    self.stats.gone += 1;
                    continue;
                }
            };
            let ftype = meta.file_type();
            if !(ftype.is_file() || ftype.is_dir() || ftype.is_symlink()) {
                debug!(path = %path.display(), "skipping special file");
                continue;
            }
            if !self.cfg.cross_device && meta.dev() != dirstat.dev() {
                debug!(path = %path.display(), "not crossing device boundary");
                continue;
            }
            let name = match path.file_name() {
                Some(n) => n.to_string_lossy().into_owned(),
                None => continue,
            };
            let Some(finfo) = self.mk_file_info(&path, &meta, &name)? else {
                continue;
            };
            if ftype.is_dir() {
                if self.cfg.exclude_dirs.iter().any(|d| d == &path) {
                    continue;
                }
                subdirs.push(path);
            } else if ftype.is_symlink() {
                self.stats.links += 1;
            } else {
                self.stats.files += 1;
                self.stats.backed_bytes += meta.len();
            }
            files.push(finfo);
        }
        Ok((files, subdirs, subexcludes))
    }

    fn mk_file_info(
        &mut self,
        path: &Path,
        meta: &std::fs::Metadata,
        name: &str,
    ) -> Result<Option<FileInfo>, Error> {
        use std::os::unix::fs::MetadataExt;

        let cipher = self
            .crypto
            .encrypt_name(name)
            .map_err(|e| Error::Integrity(e.to_string()))?;
        let mut finfo = FileInfo {
            name: cipher,
            inode: meta.ino(),
            dev: meta.dev(),
            dir: meta.is_dir(),
            link: meta.file_type().is_symlink(),
            nlinks: meta.nlink(),
            size: meta.size() as i64,
            mtime: meta.mtime(),
            ctime: meta.ctime(),
            atime: meta.atime(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            xattr: None,
            acl: None,
        };
        if self.cfg.xattrs && !finfo.link {
            if let Some(digest) = self.collect_xattrs(path)? {
                finfo.xattr = Some(digest);
            }
        }
        self.inode_db
            .insert(finfo.inode_id(), (finfo.clone(), path.to_path_buf()));
        Ok(Some(finfo))
    }

    // Serialize extended attributes the way the metadata store expects:
    // a sorted name → base64(value) JSON object.
    fn collect_xattrs(&mut self, path: &Path) -> Result<Option<String>, Error> {
        let names = match xattr::list(path) {
            Ok(n) => n,
            Err(_) => return Ok(None),
        };
        let mut map = std::collections::BTreeMap::new();
        for name in names {
            if let Ok(Some(value)) = xattr::get(path, &name) {
                map.insert(name.to_string_lossy().into_owned(), B64.encode(value));
            }
        }
        if map.is_empty() {
            return Ok(None);
        }
        let body = serde_json::to_vec(&map).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(Some(self.add_meta(body)?))
    }

    fn add_meta(&mut self, body: Vec<u8>) -> Result<String, Error> {
        let mut hasher = self
            .crypto
            .hasher()
            .map_err(|e| Error::Integrity(e.to_string()))?;
        hasher.update(&body);
        let digest = hasher.hexdigest();
        if !self.meta_cache.contains_key(&digest) {
            self.meta_cache.insert(digest.clone(), body);
            self.new_meta.push(digest.clone());
        }
        Ok(digest)
    }

    // Stable digest over the listing: sorted ciphertext names with the
    // sizes and mtimes the client can know without reading content.
    fn hash_dir(&self, files: &[FileInfo]) -> Result<(String, u64), Error> {
        let mut entries: Vec<&FileInfo> = files.iter().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let mut hasher = self
            .crypto
            .hasher()
            .map_err(|e| Error::Integrity(e.to_string()))?;
        for f in &entries {
            hasher.update(f.name.as_bytes());
            hasher.update(&f.size.to_le_bytes());
            hasher.update(&f.mtime.to_le_bytes());
        }
        hasher.update(&(entries.len() as u64).to_le_bytes());
        Ok((hasher.hexdigest(), entries.len() as u64))
    }

    // ---- clones ----

    fn queue_clone(
        &mut self,
        inode: InodeId,
        enc_path: &str,
        files: Vec<FileInfo>,
    ) -> Result<(), Error> {
        let (hash, count) = self.hash_dir(&files)?;
        self.push_clone(inode, enc_path, files, hash, count)
    }

    fn queue_clone_with_hash(
        &mut self,
        inode: InodeId,
        enc_path: &str,
        files: Vec<FileInfo>,
        hash: (String, u64),
    ) -> Result<(), Error> {
        self.push_clone(inode, enc_path, files, hash.0, hash.1)
    }

    fn push_clone(
        &mut self,
        inode: InodeId,
        enc_path: &str,
        files: Vec<FileInfo>,
        cksum: String,
        numfiles: u64,
    ) -> Result<(), Error> {
        self.clone_queue.push(CloneEntry { inode: inode.0, dev: inode.1, numfiles, cksum });
        self.clone_contents
            .insert(inode, CloneContent { enc_path: enc_path.to_string(), files });
        if self.clone_queue.len() >= self.cfg.clones.max(1) {
            self.flush_clones()?;
        }
        Ok(())
    }

    fn flush_clones(&mut self) -> Result<(), Error> {
        if self.clone_queue.is_empty() {
            return Ok(());
        }
        debug!(count = self.clone_queue.len(), "flushing clone requests");
        let clones = std::mem::take(&mut self.clone_queue);
        let resp = self.send_and_receive(Msg::Clone { clones, msgid: None })?;
        self.handle_response(resp)
    }

    // ---- DIR chunks ----

    fn send_dir_chunks(
        &mut self,
        enc_path: &str,
        inode: InodeId,
        files: Vec<FileInfo>,
    ) -> Result<(), Error> {
        let slice = self.cfg.dir_slice.max(1);
        let total = files.len();
        let mut sent = 0usize;
        let mut chunks = files.chunks(slice).peekable();
        loop {
            let chunk = match chunks.next() {
                Some(c) => c.to_vec(),
                None if total == 0 => Vec::new(),
                None => break,
            };
            sent += chunk.len();
            let small = chunk.len() < slice;
            let msg = Msg::Dir {
                path: enc_path.to_string(),
                inode,
                files: chunk,
                last: sent >= total,
                msgid: None,
            };
            if small {
                self.batch_message(msg)?;
            } else {
                let resp = self.send_and_receive(msg)?;
                self.handle_response(resp)?;
            }
            if total == 0 || chunks.peek().is_none() {
                break;
            }
        }
        self.send_dir_hash(inode)
    }

    fn send_dir_hash(&mut self, inode: InodeId) -> Result<(), Error> {
        if let Some((hash, size)) = self.dir_hashes.remove(&inode) {
            self.batch_message(Msg::DirHash { inode, hash, size, msgid: None })?;
        }
        Ok(())
    }

    // ---- batching ----

    fn batch_message(&mut self, msg: Msg) -> Result<(), Error> {
        if self.batch.is_empty() {
            self.batch_started = Some(Instant::now());
        }
        self.batch.push(msg);
        let aged = self
            .batch_started
            .map(|s| s.elapsed() >= self.cfg.batch_duration)
            .unwrap_or(false);
        if self.batch.len() >= self.cfg.batch_size || aged {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<(), Error> {
        if self.batch.is_empty() {
            return Ok(());
        }
        // Take the queue before sending: processing the responses can
        // enqueue new messages, which belong to the next batch.
        let mut msgs = std::mem::take(&mut self.batch);
        self.batch_started = None;
        let resp = if msgs.len() == 1 {
            self.send_and_receive(msgs.pop().expect("len checked"))?
        } else {
            debug!(count = msgs.len(), "sending batch");
            for m in &mut msgs {
                let id = self.t.next_msgid();
                m.set_msgid(id);
            }
            self.send_and_receive(Msg::Batch { batch: msgs, msgid: None })?
        };
        self.handle_response(resp)
    }

    fn send_and_receive(&mut self, mut msg: Msg) -> Result<Msg, Error> {
        let id = self.t.next_msgid();
        msg.set_msgid(id);
        self.t.send(&msg)?;
        self.t.recv()
    }

    // ---- response handling ----

    fn handle_response(&mut self, msg: Msg) -> Result<(), Error> {
        match msg {
            Msg::AckDir { done, cksum, content, delta, refresh, .. } => {
                self.push_files(done, content, cksum, delta, refresh)
            }
            Msg::AckSum { done, content, delta, .. } => {
                for inode in done {
                    self.inode_db.remove(&inode);
                }
                for inode in content {
                    self.send_content(inode)?;
                }
                self.process_deltas(delta)
            }
            Msg::AckClone { done, content, .. } => self.handle_ack_clone(done, content),
            Msg::AckMeta { content, .. } => self.handle_ack_meta(content),
            Msg::AckBatch { responses, .. } => {
                for r in responses {
                    self.handle_response(r)?;
                }
                Ok(())
            }
            Msg::AckDirHash { .. }
            | Msg::AckPurge { .. }
            | Msg::AckSetKeys { .. }
            | Msg::AckClientConfig { .. }
            | Msg::AckCommandLine { .. }
            | Msg::AckDone { .. } => Ok(()),
            Msg::Fail { error, .. } => {
                warn!(error = %error, "server rejected a message");
                Ok(())
            }
            other => Err(Error::Protocol(format!("unexpected response {}", other.tag()))),
        }
    }

    fn push_files(
        &mut self,
        done: Vec<InodeId>,
        content: Vec<InodeId>,
        cksum: Vec<InodeId>,
        delta: Vec<InodeId>,
        refresh: Vec<InodeId>,
    ) -> Result<(), Error> {
        for inode in done {
            self.inode_db.remove(&inode);
        }
        for inode in content.into_iter().chain(refresh) {
            self.send_content(inode)?;
        }
        if !cksum.is_empty() {
            self.process_checksums(cksum)?;
        }
        if !delta.is_empty() {
            if self.cfg.full {
                for inode in delta {
                    self.send_content(inode)?;
                }
            } else {
                self.process_deltas(delta)?;
            }
        }
        Ok(())
    }

    fn handle_ack_clone(&mut self, done: Vec<InodeId>, content: Vec<InodeId>) -> Result<(), Error> {
        for inode in done {
            if let Some(cc) = self.clone_contents.remove(&inode) {
                for f in &cc.files {
                    self.inode_db.remove(&f.inode_id());
                }
                self.stats.cloned_dirs += 1;
            }
            self.inode_db.remove(&inode);
            self.dir_hashes.remove(&inode);
        }
        for inode in content {
            match self.clone_contents.remove(&inode) {
                Some(cc) => {
                    debug!(inode = inode.0, "clone rejected; sending listing");
                    self.send_dir_chunks(&cc.enc_path, inode, cc.files)?;
                }
                None => warn!(inode = inode.0, "clone response for unknown directory"),
            }
        }
        Ok(())
    }

    // ---- checksums ----

    fn process_checksums(&mut self, inodes: Vec<InodeId>) -> Result<(), Error> {
        let jobs: Vec<(InodeId, FileInfo, PathBuf)> = inodes
            .iter()
            .filter_map(|i| self.inode_db.get(i).map(|(f, p)| (*i, f.clone(), p.clone())))
            .collect();
        let crypto = &self.crypto;
        let results: Vec<(InodeId, Option<String>)> = jobs
            .par_iter()
            .map(|(inode, finfo, path)| (*inode, compute_checksum(crypto, finfo, path).ok()))
            .collect();

        let mut files = Vec::new();
        for (inode, ck) in results {
            match ck {
                Some(checksum) => files.push(CksumEntry { inode, checksum }),
                None => {
                    self.stats.gone += 1;
                    self.inode_db.remove(&inode);
                }
            }
        }
        if !files.is_empty() {
            self.batch_message(Msg::Checksums { files, msgid: None })?;
        }
        Ok(())
    }

    // ---- deltas ----

    fn process_deltas(&mut self, inodes: Vec<InodeId>) -> Result<(), Error> {
        if inodes.is_empty() {
            return Ok(());
        }
        let sigs = self.prefetch_sigs(&inodes)?;
        for inode in inodes {
            match sigs.get(&inode) {
                Some(Some((sig, basis))) => {
                    let sig = sig.clone();
                    let basis = basis.clone();
                    self.send_delta(inode, &sig, &basis)?;
                }
                _ => self.send_content(inode)?,
            }
            self.inode_db.remove(&inode);
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn prefetch_sigs(
        &mut self,
        inodes: &[InodeId],
    ) -> Result<HashMap<InodeId, Option<(Vec<u8>, String)>>, Error> {
        debug!(count = inodes.len(), "prefetching signatures");
        let mut msg = Msg::SigsRequest { inodes: inodes.to_vec(), msgid: None };
        let id = self.t.next_msgid();
        msg.set_msgid(id);
        self.t.send(&msg)?;

        let mut sigs = HashMap::new();
        loop {
            match self.t.recv()? {
                Msg::Sig { status, inode, checksum, .. } => {
                    if status == "DONE" {
                        break;
                    }
                    let inode =
                        inode.ok_or_else(|| Error::Protocol("SIG without inode".into()))?;
                    if status == "OK" {
                        let mut sig = Vec::new();
                        let _ = self.t.recv_bulk(&mut sig)?;
                        let basis = checksum
                            .ok_or_else(|| Error::Protocol("SIG without checksum".into()))?;
                        sigs.insert(inode, Some((sig, basis)));
                    } else {
                        sigs.insert(inode, None);
                    }
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "expected SIG stream, got {}",
                        other.tag()
                    )))
                }
            }
        }
        Ok(sigs)
    }

    fn send_delta(&mut self, inode: InodeId, sig: &[u8], basis: &str) -> Result<(), Error> {
        let Some((_finfo, path)) = self.inode_db.get(&inode).cloned() else {
            return Ok(());
        };
        let index = match delta::SignatureIndex::parse(std::io::Cursor::new(sig)) {
            Ok(i) => i,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unusable signature; sending full");
                return self.send_content(inode);
            }
        };
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => return self.note_open_error(&path, e),
        };

        let mut observed = ObservedReader::new(
            file,
            self.crypto
                .hasher()
                .map_err(|e| Error::Integrity(e.to_string()))?,
            self.crypto.encrypting(),
        );
        let (mut delta_stream, delta_size) = match delta::delta(&mut observed, &index) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "delta generation failed; sending full");
                return self.send_content(inode);
            }
        };
        let (checksum, new_sig, file_size) = observed.finish();

        if delta_size >= file_size * u64::from(self.cfg.delta_threshold_pct) / 100 {
            debug!(path = %path.display(), delta_size, file_size, "delta too large; sending full");
            return self.send_content(inode);
        }

        self.t.send(&Msg::Delta {
            checksum: checksum.clone(),
            basis: basis.to_string(),
            inode,
            size: file_size,
            deltasize: Some(delta_size),
            encrypted: self.crypto.encrypting(),
        })?;
        self.stream_payload(&mut delta_stream, file_size, &checksum, false)?;
        if let Some(sig_bytes) = new_sig {
            self.upload_signature(&checksum, &sig_bytes)?;
        }
        self.stats.delta_files += 1;
        debug!(path = %path.display(), checksum = %checksum, delta_size, "delta sent");
        Ok(())
    }

    // ---- content ----

    fn send_content(&mut self, inode: InodeId) -> Result<(), Error> {
        let Some((finfo, path)) = self.inode_db.get(&inode).cloned() else {
            return Ok(());
        };
        if finfo.dir {
            return Ok(());
        }

        let data: Box<dyn Read> = if finfo.link {
            match std::fs::read_link(&path) {
                Ok(target) => Box::new(std::io::Cursor::new(
                    target.to_string_lossy().into_owned().into_bytes(),
                )),
                Err(e) => return self.note_open_error(&path, e),
            }
        } else {
            match std::fs::File::open(&path) {
                Ok(f) => Box::new(f),
                Err(e) => return self.note_open_error(&path, e),
            }
        };

        self.t.send(&Msg::Content {
            inode,
            checksum: None,
            encrypted: self.crypto.encrypting(),
        })?;

        let compress = self.cfg.compress_content && finfo.size > self.cfg.min_compress_size;
        let make_sig = self.crypto.encrypting();
        let (checksum, sig, plain_size) = self.stream_hashed_payload(data, compress, make_sig)?;
        if let Some(sig_bytes) = sig {
            self.upload_signature(&checksum, &sig_bytes)?;
        }
        self.inode_db.remove(&inode);
        self.stats.new_files += 1;
        debug!(path = %path.display(), checksum = %checksum, plain_size, "content sent");
        Ok(())
    }

    fn note_open_error(&mut self, path: &Path, e: std::io::Error) -> Result<(), Error> {
        match e.kind() {
            std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "disappeared before backup");
                self.stats.gone += 1;
            }
            std::io::ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), "permission denied");
                self.stats.denied += 1;
            }
            _ => {
                warn!(path = %path.display(), error = %e, "cannot open");
                self.stats.denied += 1;
            }
        }
        Ok(())
    }

    // Stream plaintext through hash/signature/compression/encryption into
    // a bulk transfer; returns (checksum, signature, plaintext size).
    fn stream_hashed_payload(
        &mut self,
        mut data: Box<dyn Read>,
        compress: bool,
        make_sig: bool,
    ) -> Result<(String, Option<Vec<u8>>, u64), Error> {
        let iv = self.crypto.new_iv();
        let mut enc = self
            .crypto
            .encryptor(&iv)
            .map_err(|e| Error::Integrity(e.to_string()))?;
        let mut hasher = self
            .crypto
            .hasher()
            .map_err(|e| Error::Integrity(e.to_string()))?;
        let mut sig = make_sig.then(SignatureBuilder::new);
        let mut packer = if compress {
            Some(
                zstd::stream::write::Encoder::new(Vec::new(), 3)
                    .map_err(|e| Error::Storage(e))?,
            )
        } else {
            None
        };

        if !iv.is_empty() {
            self.t.send_bulk_chunk(&iv)?;
        }
        let mut plain_size = 0u64;
        let mut buf = vec![0u8; DATA_CHUNK];
        loop {
            let n = data.read(&mut buf)?;
            if n == 0 {
                break;
            }
            plain_size += n as u64;
            hasher.update(&buf[..n]);
            if let Some(s) = sig.as_mut() {
                s.update(&buf[..n]);
            }
            let staged: Vec<u8> = match packer.as_mut() {
                Some(enc_z) => {
                    enc_z.write_all(&buf[..n])?;
                    std::mem::take(enc_z.get_mut())
                }
                None => buf[..n].to_vec(),
            };
            if !staged.is_empty() {
                let ct = enc.encrypt(&staged);
                if !ct.is_empty() {
                    self.t.send_bulk_chunk(&ct)?;
                }
            }
        }
        if let Some(enc_z) = packer.take() {
            let rest = enc_z.finish()?;
            if !rest.is_empty() {
                let ct = enc.encrypt(&rest);
                if !ct.is_empty() {
                    self.t.send_bulk_chunk(&ct)?;
                }
            }
        }
        let tail = enc.finish();
        if !tail.is_empty() {
            self.t.send_bulk_chunk(&tail)?;
        }
        let tag = enc.digest();
        if !tag.is_empty() {
            self.t.send_bulk_chunk(&tag)?;
        }

        let checksum = hasher.hexdigest();
        self.t.finish_bulk(&BulkTrailer {
            status: "OK".into(),
            size: plain_size,
            checksum: Some(checksum.clone()),
            compressed: compress.then(|| "zstd".to_string()),
        })?;
        Ok((checksum, sig.map(|s| s.finish()), plain_size))
    }

    // Stream an already-produced payload (a delta) through encryption only.
    fn stream_payload(
        &mut self,
        data: &mut dyn Read,
        logical_size: u64,
        checksum: &str,
        compress: bool,
    ) -> Result<(), Error> {
        debug_assert!(!compress, "deltas travel uncompressed");
        let iv = self.crypto.new_iv();
        let mut enc = self
            .crypto
            .encryptor(&iv)
            .map_err(|e| Error::Integrity(e.to_string()))?;
        if !iv.is_empty() {
            self.t.send_bulk_chunk(&iv)?;
        }
        let mut buf = vec![0u8; DATA_CHUNK];
        loop {
            let n = data.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let ct = enc.encrypt(&buf[..n]);
            if !ct.is_empty() {
                self.t.send_bulk_chunk(&ct)?;
            }
        }
        let tail = enc.finish();
        if !tail.is_empty() {
            self.t.send_bulk_chunk(&tail)?;
        }
        let tag = enc.digest();
        if !tag.is_empty() {
            self.t.send_bulk_chunk(&tag)?;
        }
        self.t.finish_bulk(&BulkTrailer {
            status: "OK".into(),
            size: logical_size,
            checksum: Some(checksum.to_string()),
            compressed: None,
        })?;
        Ok(())
    }

    fn upload_signature(&mut self, checksum: &str, sig: &[u8]) -> Result<(), Error> {
        self.t.send(&Msg::Sig {
            status: "OK".into(),
            inode: None,
            checksum: Some(checksum.to_string()),
            size: Some(sig.len() as u64),
            respid: None,
        })?;
        self.t.send_bulk_from(&mut &sig[..])?;
        self.t.finish_bulk(&BulkTrailer {
            status: "OK".into(),
            size: sig.len() as u64,
            checksum: Some(checksum.to_string()),
            compressed: None,
        })?;
        Ok(())
    }

    // ---- metadata ----

    fn flush_meta(&mut self) -> Result<(), Error> {
        if self.new_meta.is_empty() {
            return Ok(());
        }
        let metadata = std::mem::take(&mut self.new_meta);
        self.batch_message(Msg::Meta {
            metadata,
            encrypted: self.crypto.encrypting(),
            msgid: None,
        })
    }

    fn handle_ack_meta(&mut self, content: Vec<String>) -> Result<(), Error> {
        for ck in content {
            let Some(body) = self.meta_cache.get(&ck).cloned() else {
                warn!(checksum = %ck, "metadata requested but not cached");
                continue;
            };
            self.t.send(&Msg::MetaData {
                checksum: ck.clone(),
                encrypted: self.crypto.encrypting(),
            })?;
            let size = body.len() as u64;
            let mut cursor = std::io::Cursor::new(body);
            self.stream_payload(&mut cursor, size, &ck, false)?;
        }
        Ok(())
    }
}

// Reader adapter that hashes (and optionally builds a signature over) every
// byte pulled through it.
struct ObservedReader<R: Read> {
    inner: R,
    hasher: Option<ContentHasher>,
    sig: Option<SignatureBuilder>,
    size: u64,
}

impl<R: Read> ObservedReader<R> {
    fn new(inner: R, hasher: ContentHasher, make_sig: bool) -> Self {
        Self {
            inner,
            hasher: Some(hasher),
            sig: make_sig.then(SignatureBuilder::new),
            size: 0,
        }
    }

    fn finish(self) -> (String, Option<Vec<u8>>, u64) {
        let checksum = self.hasher.expect("finish called once").hexdigest();
        (checksum, self.sig.map(|s| s.finish()), self.size)
    }
}

impl<R: Read> Read for ObservedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(h) = self.hasher.as_mut() {
                h.update(&buf[..n]);
            }
            if let Some(s) = self.sig.as_mut() {
                s.update(&buf[..n]);
            }
            self.size += n as u64;
        }
        Ok(n)
    }
}

fn compute_checksum(crypto: &Crypto, finfo: &FileInfo, path: &Path) -> Result<String, Error> {
    let mut hasher = crypto
        .hasher()
        .map_err(|e| Error::Integrity(e.to_string()))?;
    if finfo.link {
        let target = std::fs::read_link(path)?;
        hasher.update(target.to_string_lossy().as_bytes());
        return Ok(hasher.hexdigest());
    }
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; DATA_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.hexdigest())
}

fn is_cache_dir(dir: &Path) -> bool {
    const TAG_SIGNATURE: &str = "Signature: 8a477f597d28d172789f06886806bc55";
    match std::fs::read_to_string(dir.join("CACHEDIR.TAG")) {
        Ok(text) => text.lines().next().map(|l| l.starts_with(TAG_SIGNATURE)).unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_dir_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_cache_dir(dir.path()));
        std::fs::write(
            dir.path().join("CACHEDIR.TAG"),
            "Signature: 8a477f597d28d172789f06886806bc55\n# comment\n",
        )
        .unwrap();
        assert!(is_cache_dir(dir.path()));
        std::fs::write(dir.path().join("CACHEDIR.TAG"), "not a tag").unwrap();
        assert!(!is_cache_dir(dir.path()));
    }

    #[test]
    fn observed_reader_reports_what_flowed() {
        let crypto = Crypto::new(0, "c", None).unwrap();
        let data = vec![5u8; 10_000];
        let mut r = ObservedReader::new(
            std::io::Cursor::new(data.clone()),
            crypto.hasher().unwrap(),
            true,
        );
        let mut sink = Vec::new();
        r.read_to_end(&mut sink).unwrap();
        let (ck, sig, size) = r.finish();
        assert_eq!(size, 10_000);
        assert_eq!(sink, data);
        assert!(sig.is_some());

        let mut h = crypto.hasher().unwrap();
        h.update(&data);
        assert_eq!(ck, h.hexdigest());
    }

    #[test]
    fn checksum_matches_streaming_hasher() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"stable bytes").unwrap();
        let crypto = Crypto::new(0, "c", None).unwrap();
        let finfo = FileInfo {
            name: "x".into(),
            inode: 1,
            dev: 1,
            dir: false,
            link: false,
            nlinks: 1,
            size: 12,
            mtime: 0,
            ctime: 0,
            atime: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            xattr: None,
            acl: None,
        };
        let ck = compute_checksum(&crypto, &finfo, &path).unwrap();
        let mut h = crypto.hasher().unwrap();
        h.update(b"stable bytes");
        assert_eq!(ck, h.hexdigest());
    }

    #[test]
    fn config_defaults_are_sane() {
        let cfg = WalkerConfig::new("localhost:9123", "alice", vec![PathBuf::from("/tmp")]);
        assert_eq!(cfg.encoding, Encoding::MsgPack);
        assert!(cfg.delta_threshold_pct < 100);
        assert!(cfg.batch_size > 1);
    }
}
