//! Per-connection session: establishment, message dispatch, teardown.
//!
//! `Init → Awaiting-Backup → [NeedKeys] → [Auth1 → Auth2] → Running →
//! Closing → Done`. Each handler returns `(response, commit)`; a BATCH
//! dispatches its elements in order inside one transaction. Recoverable
//! handler errors become FAIL responses and roll the transaction back;
//! authentication and protocol errors end the session.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;

use blob_store::{BlobMeta, BlobStore};
use meta_db::{ChecksumAttrs, FileVersion, MetaDb};
use strata_core::framing::Transport;
use strata_core::wire::{BulkTrailer, CksumEntry, CloneEntry, FileInfo, InodeId, Msg};
use strata_core::{Error, FileAction};
use tracing::{debug, info, warn};

use crate::naming::{self, AutoName};
use crate::reclaim;
use crate::regen::Regenerator;
use crate::server::SessionRegistry;
use crate::BackendConfig;

/// How a finished connection left the world.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub client: String,
    pub completed: bool,
    pub purged_blobs: u64,
    pub reclaimed_bytes: u64,
}

// Per-client policy: server defaults overridden by DB config.
#[derive(Debug, Clone)]
struct Policy {
    formats: Vec<String>,
    priorities: Vec<i64>,
    keep_days: Vec<i64>,
    force_full: Vec<bool>,
    save_full: bool,
    max_chain: i64,
    max_change: f64,
    auto_purge: bool,
    save_config: bool,
    link_basis: bool,
    cks_content_threshold: i64,
}

impl Policy {
    fn resolve(cfg: &BackendConfig, db: &MetaDb) -> Self {
        let mut p = Self {
            formats: cfg.formats.clone(),
            priorities: cfg.priorities.clone(),
            keep_days: cfg.keep_days.clone(),
            force_full: cfg.force_full.clone(),
            save_full: cfg.save_full,
            max_chain: cfg.max_chain,
            max_change: cfg.max_change,
            auto_purge: cfg.auto_purge,
            save_config: cfg.save_config,
            link_basis: cfg.link_basis,
            cks_content_threshold: cfg.cks_content_threshold,
        };
        if !cfg.allow_overrides {
            return p;
        }
        let get = |key: &str| db.get_config(key).ok().flatten();
        if let Some(v) = get("Formats") {
            p.formats = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = get("Priorities") {
            p.priorities = naming::parse_list(&v);
        }
        if let Some(v) = get("KeepDays") {
            p.keep_days = naming::parse_list(&v);
        }
        if let Some(v) = get("ForceFull") {
            p.force_full = v
                .split(',')
                .map(|s| matches!(s.trim(), "1" | "true" | "True"))
                .collect();
        }
        if let Some(v) = get("SaveFull").and_then(|v| v.parse().ok()) {
            p.save_full = v;
        }
        if let Some(v) = get("MaxDeltaChain").and_then(|v| v.parse().ok()) {
            p.max_chain = v;
        }
        if let Some(v) = get("MaxChangePercent").and_then(|v| v.parse::<f64>().ok()) {
            p.max_change = v / 100.0;
        }
        if let Some(v) = get("AutoPurge").and_then(|v| v.parse().ok()) {
            p.auto_purge = v;
        }
        if let Some(v) = get("SaveConfig").and_then(|v| v.parse().ok()) {
            p.save_config = v;
        }
        p
    }
}

/// One running session over an established transport.
pub struct Session<S: Read + Write> {
    t: Transport<S>,
    registry: Arc<SessionRegistry>,
    session_id: String,
    client: String,
    db: MetaDb,
    store: BlobStore,
    policy: Policy,
    full: bool,
    autoname: bool,
    auto: Option<AutoName>,
    config_keep_secs: Option<f64>,
    config_priority: Option<i64>,
    done: bool,
    purged: bool,
    stat_new_files: i64,
    stat_upd_files: i64,
    stat_bytes_received: i64,
    commands: HashMap<&'static str, u64>,
    sizes: Option<HashSet<i64>>,
    last_dir_node: Option<InodeId>,
    last_dir_hash: HashMap<String, FileVersion>,
    seq: u64,
}

/// Serve one accepted connection end to end.
pub fn serve_connection<S: Read + Write>(
    stream: S,
    cfg: &BackendConfig,
    registry: Arc<SessionRegistry>,
    address: String,
) -> Result<SessionOutcome, Error> {
    let transport = Transport::server(stream)?;
    let mut session = Session::establish(transport, cfg, registry, address)?;
    let run_result = session.run();
    session.finalize(run_result)
}

impl<S: Read + Write> Session<S> {
    /// Drive the exchange from BACKUP up to (and including) the INIT reply.
    pub fn establish(
        mut t: Transport<S>,
        cfg: &BackendConfig,
        registry: Arc<SessionRegistry>,
        address: String,
    ) -> Result<Self, Error> {
        let session_id = strata_core::ids::new_session_id();
        let first = t.recv()?;
        let (client, client_time, version, autoname, name, full, priority, force, create) =
            match first {
                Msg::Backup {
                    host,
                    time,
                    version,
                    autoname,
                    name,
                    full,
                    priority,
                    force,
                    create,
                } => (host, time, version, autoname, name, full, priority, force, create),
                other => {
                    let e = Error::Protocol(format!("expected BACKUP, got {}", other.tag()));
                    let _ = t.send(&Msg::fail(e.to_string()));
                    return Err(e);
                }
            };
        info!(
            conn = %strata_core::ids::short_session_id(&session_id),
            client = %client,
            version = %version,
            create,
            full,
            "backup session requested"
        );

        // At most one running session per client, enforced up front.
        if registry.client_is_busy(&client) && !force {
            let e = Error::InitFailed(format!("previous backup for {client} still running"));
            let _ = t.send(&Msg::fail(e.to_string()));
            return Err(e);
        }

        // Creation is refused up front when the client already exists (and
        // vice versa), before any key material changes hands.
        let db_file = cfg.db_dir.join(&client).join(format!("{client}.db"));
        if create && db_file.is_file() {
            let e = Error::InitFailed(format!("client {client} already exists"));
            let _ = t.send(&Msg::fail(e.to_string()));
            return Err(e);
        }
        if !create && !db_file.is_file() {
            let e = Error::InitFailed(format!("unknown client: {client}"));
            let _ = t.send(&Msg::fail(e.to_string()));
            return Err(e);
        }

        // Password-required servers collect keys before the database exists.
        let mut pending_keys = None;
        if create && cfg.require_password && cfg.allow_new {
            t.send(&Msg::NeedKeys {})?;
            match t.recv()? {
                Msg::SetKeys {
                    crypto_scheme,
                    filename_key,
                    content_key,
                    srp_salt,
                    srp_vkey,
                    ..
                } => {
                    pending_keys =
                        Some((crypto_scheme, filename_key, content_key, srp_salt, srp_vkey));
                }
                other => {
                    let e = Error::Protocol(format!("expected SETKEYS, got {}", other.tag()));
                    let _ = t.send(&Msg::fail(e.to_string()));
                    return Err(e);
                }
            }
        }

        if create && !cfg.allow_new {
            let e = Error::Policy("server does not accept new clients".into());
            let _ = t.send(&Msg::fail(e.to_string()));
            return Err(e);
        }

        let busy = registry.client_is_busy(&client);
        let opened = (|| -> Result<(MetaDb, BlobStore, String), Error> {
            let store = BlobStore::open(&cfg.base_dir, &client, create)
                .map_err(|e| Error::InitFailed(e.to_string()))?;
            if !busy {
                // a forced concurrent session may still own scratch files
                store.cleanup_tmp().ok();
            }
            let db = MetaDb::open(
                &cfg.db_dir,
                &client,
                create,
                cfg.db_backups,
                cfg.journal_name.as_deref(),
            )
            .map_err(|e| Error::InitFailed(e.to_string()))?;
            let newness = if create { "NEW" } else { "EXISTING" };
            Ok((db, store, newness.to_string()))
        })();
        let (mut db, store, newness) = match opened {
            Ok(v) => v,
            Err(e) => {
                let _ = t.send(&Msg::fail(e.to_string()));
                return Err(e);
            }
        };

        if create {
            if let Some((scheme, fkey, ckey, salt, vkey)) = pending_keys {
                db.set_keys(&salt, &vkey, &fkey, &ckey)
                    .map_err(|e| Error::Db(e.to_string()))?;
                db.set_config("CryptoScheme", &scheme.to_string())
                    .map_err(|e| Error::Db(e.to_string()))?;
                info!(client = %client, scheme, "client keys installed");
            } else {
                db.set_config("CryptoScheme", "0")
                    .map_err(|e| Error::Db(e.to_string()))?;
            }
        }

        let needs_auth = db.needs_authentication().map_err(|e| Error::Db(e.to_string()))?;
        if cfg.require_password && !needs_auth {
            let e = Error::Policy(
                "passwords are required on this server; set one with strata-admin setpass".into(),
            );
            let _ = t.send(&Msg::fail(e.to_string()));
            return Err(e);
        }
        if needs_auth {
            Self::srp_exchange(&mut t, &mut db)?;
        }

        if let Some(disabled) = db.get_config("Disabled").ok().flatten() {
            if disabled != "0" && !disabled.is_empty() {
                let e = Error::Policy(format!("client {client} is disabled"));
                let _ = t.send(&Msg::fail(e.to_string()));
                return Err(e);
            }
        }

        let policy = Policy::resolve(cfg, &db);

        // Prior incomplete session warning / refusal.
        if let Ok(Some(prev)) = db.last_backup_set(false) {
            let live = prev
                .session
                .as_deref()
                .map(|s| registry.contains_session(s))
                .unwrap_or(false);
            if prev.end_time.is_none() || live {
                if live && !force {
                    let e = Error::InitFailed(format!(
                        "previous backup {} still running; use force to override",
                        prev.name
                    ));
                    let _ = t.send(&Msg::fail(e.to_string()));
                    return Err(e);
                }
                warn!(client = %client, prev = %prev.name, "previous session did not complete");
            }
        }

        // Auto-naming decides name, priority, retention and full-ness.
        let mut auto = None;
        let mut config_keep_secs = None;
        let mut config_priority = None;
        let mut server_full = false;
        let set_name = if autoname {
            let a = naming::calc_auto_info(
                &db,
                &policy.formats,
                &policy.priorities,
                &policy.keep_days,
                &policy.force_full,
                client_time,
            )
            .map_err(|e| Error::Db(e.to_string()))?;
            config_keep_secs = Some(a.keep_days as f64 * 86_400.0);
            config_priority = Some(a.priority);
            server_full = a.force_full;
            let n = a.name.clone();
            auto = Some(a);
            n
        } else {
            name.unwrap_or_else(|| format!("Backup_{}", session_id))
        };

        let full = full || server_full;
        let set_result = db.new_backup_set(
            &set_name,
            &session_id,
            priority,
            client_time,
            &version,
            &address,
            full,
            Some(&cfg.server_session),
        );
        if let Err(e) = set_result {
            let e = Error::InitFailed(e.to_string());
            let _ = t.send(&Msg::fail(e.to_string()));
            return Err(e);
        }

        let (filename_key, content_key) = if needs_auth {
            (
                db.get_config("FilenameKey").ok().flatten(),
                db.get_config("ContentKey").ok().flatten(),
            )
        } else {
            (None, None)
        };
        let clientid = db.client_id().map_err(|e| Error::Db(e.to_string()))?;
        t.send(&Msg::Init {
            status: "OK".into(),
            sessionid: session_id.clone(),
            prev_date: db.prev_backup_date(),
            new: newness,
            name: set_name,
            clientid,
            filename_key,
            content_key,
        })?;
        registry.add(&session_id, &client);

        Ok(Self {
            t,
            registry,
            session_id,
            client,
            db,
            store,
            policy,
            full,
            autoname,
            auto,
            config_keep_secs,
            config_priority,
            done: false,
            purged: false,
            stat_new_files: 0,
            stat_upd_files: 0,
            stat_bytes_received: 0,
            commands: HashMap::new(),
            sizes: None,
            last_dir_node: None,
            last_dir_hash: HashMap::new(),
            seq: 0,
        })
    }

    fn srp_exchange(t: &mut Transport<S>, db: &mut MetaDb) -> Result<(), Error> {
        use base64::engine::general_purpose::STANDARD as B64;
        use base64::Engine;

        let scheme = db
            .get_config("CryptoScheme")
            .ok()
            .flatten()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1u8);
        let clientid = db.client_id().map_err(|e| Error::Db(e.to_string()))?;
        t.send(&Msg::AuthChallenge { status: "AUTH".into(), crypto_scheme: scheme, client: clientid })?;

        let (uname, a_pub) = match t.recv()? {
            Msg::Auth1 { srp_uname, srp_value_a } => (srp_uname, srp_value_a),
            other => return Err(Error::Protocol(format!("expected AUTH1, got {}", other.tag()))),
        };
        let uname = B64
            .decode(uname)
            .map_err(|_| Error::Protocol("bad AUTH1 encoding".into()))?;
        let a_pub = B64
            .decode(a_pub)
            .map_err(|_| Error::Protocol("bad AUTH1 encoding".into()))?;
        let uname = String::from_utf8(uname)
            .map_err(|_| Error::Protocol("bad AUTH1 identity".into()))?;

        let (salt, b_pub) = match db.authenticate1(&uname, &a_pub) {
            Ok(v) => v,
            Err(e) => {
                let e = Error::AuthFailed(e.to_string());
                let _ = t.send(&Msg::auth_fail(e.to_string()));
                return Err(e);
            }
        };
        t.send(&Msg::Auth1Ok {
            srp_value_s: B64.encode(salt),
            srp_value_b: B64.encode(b_pub),
        })?;

        let m1 = match t.recv()? {
            Msg::Auth2 { srp_value_m } => B64
                .decode(srp_value_m)
                .map_err(|_| Error::Protocol("bad AUTH2 encoding".into()))?,
            other => return Err(Error::Protocol(format!("expected AUTH2, got {}", other.tag()))),
        };
        match db.authenticate2(&m1) {
            Ok(hamk) => {
                t.send(&Msg::Auth2Ok { srp_value_hamk: B64.encode(hamk) })?;
                Ok(())
            }
            Err(e) => {
                let e = Error::AuthFailed(e.to_string());
                let _ = t.send(&Msg::auth_fail(e.to_string()));
                Err(e)
            }
        }
    }

    /// Pump messages until BYE (or a fatal error).
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            let msg = self.t.recv()?;
            if let Msg::Bye { error } = msg {
                return match error {
                    Some(err) => Err(Error::Interrupted(err)),
                    None => Ok(()),
                };
            }
            let msgid = msg.msgid();
            let (response, flush) = self.process_message(msg)?;
            if let Some(mut resp) = response {
                if let Some(id) = msgid {
                    resp.set_respid(id);
                }
                self.t.send(&resp)?;
            }
            if flush {
                self.db.commit().map_err(|e| Error::Db(e.to_string()))?;
            }
        }
    }

    /// Dispatch one message; recoverable failures become FAIL responses.
    pub fn process_message(&mut self, msg: Msg) -> Result<(Option<Msg>, bool), Error> {
        *self.commands.entry(msg.tag()).or_insert(0) += 1;
        let tag = msg.tag();
        match self.dispatch(msg) {
            Ok(out) => Ok(out),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(command = tag, error = %e, "message failed; rolling back");
                self.db.rollback().map_err(|e| Error::Db(e.to_string()))?;
                Ok((Some(Msg::fail(e.to_string())), false))
            }
        }
    }

    fn dispatch(&mut self, msg: Msg) -> Result<(Option<Msg>, bool), Error> {
        match msg {
            Msg::Dir { path, inode, files, last, .. } => self.handle_dir(path, inode, files, last),
            Msg::DirHash { inode, hash, size, .. } => self.handle_dir_hash(inode, &hash, size),
            Msg::SigRequest { inode, .. } => self.handle_sig_request(inode),
            Msg::SigsRequest { inodes, .. } => self.handle_sigs_request(inodes),
            Msg::Sig { checksum, .. } => self.handle_sig_upload(checksum),
            Msg::Delta { checksum, basis, inode, size, deltasize, encrypted } => {
                self.handle_delta(&checksum, &basis, inode, size, deltasize, encrypted)
            }
            Msg::Content { inode, checksum, encrypted } => {
                self.handle_content(inode, checksum, encrypted)
            }
            Msg::Checksums { files, .. } => self.handle_checksums(files),
            Msg::Clone { clones, .. } => self.handle_clone(clones),
            Msg::Meta { metadata, encrypted, .. } => self.handle_meta(metadata, encrypted),
            Msg::MetaData { checksum, encrypted } => self.handle_metadata(&checksum, encrypted),
            Msg::Batch { batch, .. } => self.handle_batch(batch),
            Msg::Purge { time, relative, priority, .. } => {
                self.handle_purge(time, relative, priority)
            }
            Msg::SetKeys { crypto_scheme, filename_key, content_key, srp_salt, srp_vkey, .. } => {
                self.handle_set_keys(crypto_scheme, filename_key, content_key, srp_salt, srp_vkey)
            }
            Msg::ClientConfig { args, .. } => self.handle_client_config(&args),
            Msg::CommandLine { hash, line, size, encrypted, .. } => {
                self.handle_command_line(&hash, &line, size, encrypted)
            }
            Msg::Done { .. } => {
                self.done = true;
                Ok((Some(Msg::AckDone { respid: None }), true))
            }
            other => Err(Error::Protocol(format!("unexpected message {}", other.tag()))),
        }
    }

    // ---- DIR ----

    fn handle_dir(
        &mut self,
        path: String,
        parent: InodeId,
        files: Vec<FileInfo>,
        last: bool,
    ) -> Result<(Option<Msg>, bool), Error> {
        let prev = self.db.prev_set().unwrap_or(-1);

        if self.last_dir_node != Some(parent) {
            // Same directory may arrive in several chunks; look the prior
            // version up once. A moved directory is found by path.
            let mut dir_inode = parent;
            if !path.is_empty() {
                if let Ok(Some(old_dir)) = self.db.get_file_info_by_path(&path, prev) {
                    if old_dir.dir {
                        dir_inode = (old_dir.inode, old_dir.device);
                    }
                }
            }
            let children = self
                .db
                .read_directory(dir_inode, prev)
                .map_err(|e| Error::Db(e.to_string()))?;
            self.last_dir_hash = children.into_iter().map(|c| (c.name.clone(), c)).collect();
            self.last_dir_node = Some(parent);
        }

        let mut done = Vec::new();
        let mut cksum = Vec::new();
        let mut content = Vec::new();
        let mut delta = Vec::new();
        let mut refresh = Vec::new();
        let mut xattrs = Vec::new();

        for f in &files {
            let file_id = f.inode_id();
            let action = self.check_file(parent, f)?;
            match action {
                FileAction::Done => done.push(file_id),
                FileAction::Content => content.push(file_id),
                FileAction::Cksum => cksum.push(file_id),
                FileAction::Delta => delta.push(file_id),
                FileAction::Refresh => refresh.push(file_id),
                FileAction::Linked => {
                    // handled as a link unless some queue already wants it
                    let queued = [&done, &cksum, &content, &delta, &refresh]
                        .iter()
                        .any(|q| q.contains(&file_id));
                    if !queued {
                        done.push(file_id);
                    }
                }
            }
            if let Some(x) = &f.xattr {
                let info = self
                    .db
                    .get_checksum_info(x)
                    .map_err(|e| Error::Db(e.to_string()))?;
                if info.map(|i| i.is_placeholder()).unwrap_or(true) {
                    xattrs.push(x.clone());
                }
            }
        }

        let resp = Msg::AckDir {
            status: "OK".into(),
            path,
            inode: parent,
            last,
            done,
            cksum,
            content,
            delta,
            refresh,
            xattrs,
            respid: None,
        };
        Ok((Some(resp), true))
    }

    // The file-diff policy. Decides how each presented file reaches the
    // store, updating version rows on the way.
    fn check_file(&mut self, parent: InodeId, f: &FileInfo) -> Result<FileAction, Error> {
        let inode = f.inode_id();
        let db = |e: meta_db::DbError| Error::Db(e.to_string());

        let mut old = self.last_dir_hash.get(&f.name).cloned();
        let mut from_partial = None;

        if f.dir {
            let matches = old
                .as_ref()
                .map(|o| o.inode == f.inode && o.device == f.dev && o.mtime == Some(f.mtime))
                .unwrap_or(false);
            if matches {
                self.db.extend_file_inode(parent, inode, None).map_err(db)?;
            } else {
                self.insert_version(f, parent)?;
            }
            return Ok(FileAction::Done);
        }

        if old.is_none() && self.db.last_completed().is_none() {
            // No completed prior set: an interrupted run may still hold
            // this file.
            if let Some(partial) = self
                .db
                .get_file_from_partial_backup(inode, f.size, f.mtime)
                .map_err(db)?
            {
                from_partial = Some(partial.last_set);
                old = Some(partial);
            }
        }

        if let Some(old) = old {
            let same_main = old.inode == f.inode
                && old.device == f.dev
                && old.size == Some(f.size)
                && old.mtime == Some(f.mtime);
            if same_main {
                if let Some(ck) = &old.checksum {
                    let meta_same = old.mode == Some(f.mode)
                        && old.ctime == Some(f.ctime)
                        && old.xattr == f.xattr
                        && old.acl == f.acl;
                    if meta_same {
                        self.db
                            .extend_file_inode(parent, inode, from_partial)
                            .map_err(db)?;
                    } else {
                        self.insert_version(f, parent)?;
                        self.db.set_checksum(inode, ck).map_err(db)?;
                    }
                    if self.full && old.chain_length != 0 {
                        return Ok(FileAction::Refresh);
                    }
                    return Ok(FileAction::Done);
                }
                self.insert_version(f, parent)?;
                return Ok(FileAction::Content);
            }

            if old.size == Some(f.size) && old.checksum.is_some() {
                // size unchanged, something else moved; a hash may settle it
                self.insert_version(f, parent)?;
                return Ok(FileAction::Cksum);
            }

            let old_size = old.size;
            // a change of exactly the limit still deltas; only outside the
            // window forces a refresh
            let within_window = old_size
                .map(|os| {
                    let lo = os as f64 * (1.0 - self.policy.max_change);
                    let hi = os as f64 * (1.0 + self.policy.max_change);
                    (f.size as f64) >= lo && (f.size as f64) <= hi
                })
                .unwrap_or(false);
            let chain_full = old.basis.is_some() && old.chain_length >= self.policy.max_chain;
            if f.size < 4096 || old_size.is_none() || !within_window || chain_full {
                self.insert_version(f, parent)?;
                return Ok(FileAction::Refresh);
            }

            self.insert_version(f, parent)?;
            if self.full {
                return Ok(FileAction::Content);
            }
            return Ok(FileAction::Delta);
        }

        // Nothing at this path before.
        self.insert_version(f, parent)?;
        if f.nlinks > 1 {
            // another name of this inode may already carry content
            if let Some(ck) = self.db.get_checksum_by_inode(inode).map_err(db)? {
                self.db.set_checksum(inode, &ck).map_err(db)?;
                return Ok(FileAction::Linked);
            }
            return self.check_for_size(f.size);
        }

        if let Some(similar) = self
            .db
            .get_file_info_by_similar(inode, f.size, f.mtime)
            .map_err(db)?
        {
            let same_place = similar.name == f.name
                && similar.parent_inode == parent.0
                && similar.parent_device == parent.1;
            if same_place {
                if let Some(ck) = &similar.checksum {
                    self.db.set_checksum(inode, ck).map_err(db)?;
                    return Ok(FileAction::Done);
                }
                return self.check_for_size(f.size);
            }
            // moved or copied; confirm by hash
            return Ok(FileAction::Cksum);
        }
        self.check_for_size(f.size)
    }

    fn insert_version(&mut self, f: &FileInfo, parent: InodeId) -> Result<(), Error> {
        self.db
            .insert_file(
                &f.name,
                parent,
                f.inode_id(),
                f.dir,
                f.link,
                f.nlinks,
                f.size,
                f.mtime,
                f.ctime,
                f.atime,
                f.mode,
                f.uid,
                f.gid,
            )
            .map_err(|e| Error::Db(e.to_string()))?;
        if let Some(x) = &f.xattr {
            if self
                .db
                .get_checksum_info(x)
                .map_err(|e| Error::Db(e.to_string()))?
                .is_some()
            {
                self.db.set_xattr(f.inode_id(), x).ok();
            }
        }
        if let Some(a) = &f.acl {
            if self
                .db
                .get_checksum_info(a)
                .map_err(|e| Error::Db(e.to_string()))?
                .is_some()
            {
                self.db.set_acl(f.inode_id(), a).ok();
            }
        }
        Ok(())
    }

    // Large files whose exact size already exists are worth a checksum
    // round-trip before shipping content.
    fn check_for_size(&mut self, size: i64) -> Result<FileAction, Error> {
        if self.sizes.is_none() {
            let loaded = self
                .db
                .get_file_sizes(self.policy.cks_content_threshold)
                .map_err(|e| Error::Db(e.to_string()))?;
            debug!(count = loaded.len(), "size set loaded");
            self.sizes = Some(loaded.into_iter().collect());
        }
        let sizes = self.sizes.as_ref().expect("just loaded");
        if size > self.policy.cks_content_threshold && sizes.contains(&size) {
            Ok(FileAction::Cksum)
        } else {
            Ok(FileAction::Content)
        }
    }

    // ---- DHSH ----

    fn handle_dir_hash(
        &mut self,
        inode: InodeId,
        hash: &str,
        size: u64,
    ) -> Result<(Option<Msg>, bool), Error> {
        let info = self
            .db
            .get_checksum_info(hash)
            .map_err(|e| Error::Db(e.to_string()))?;
        if info.is_none() {
            self.db
                .insert_checksum(
                    hash,
                    false,
                    size as i64,
                    ChecksumAttrs { is_file: false, ..Default::default() },
                )
                .map_err(|e| Error::Db(e.to_string()))?;
        }
        self.db
            .update_dir_checksum(inode, hash)
            .map_err(|e| Error::Db(e.to_string()))?;
        Ok((Some(Msg::AckDirHash { status: "OK".into(), respid: None }), false))
    }

    // ---- signatures ----

    fn handle_sig_request(&mut self, inode: InodeId) -> Result<(Option<Msg>, bool), Error> {
        self.send_signature(inode)?;
        Ok((None, false))
    }

    fn handle_sigs_request(&mut self, inodes: Vec<InodeId>) -> Result<(Option<Msg>, bool), Error> {
        for inode in inodes {
            self.send_signature(inode)?;
        }
        let done = Msg::Sig { status: "DONE".into(), inode: None, checksum: None, size: None, respid: None };
        Ok((Some(done), true))
    }

    fn send_signature(&mut self, inode: InodeId) -> Result<(), Error> {
        let prev = self.db.prev_set().unwrap_or(-1);
        let ck = self
            .db
            .get_file_info_by_inode(inode, prev)
            .map_err(|e| Error::Db(e.to_string()))?
            .and_then(|f| f.checksum);
        let Some(ck) = ck else {
            warn!(inode = inode.0, "no checksum for signature request");
            self.t.send(&Msg::Sig {
                status: "FAIL".into(),
                inode: Some(inode),
                checksum: None,
                size: None,
                respid: None,
            })?;
            return Ok(());
        };

        let sig = if self.store.has_sig(&ck) {
            self.store
                .read_sig(&ck)
                .map_err(|e| Error::Storage(std::io::Error::other(e.to_string())))?
        } else {
            let regen = Regenerator::new(&self.store, &self.db, None);
            let reader = regen.recover(&ck, false)?;
            let sig = delta::signature(reader)
                .map_err(|e| Error::Integrity(format!("signature of {ck}: {e}")))?;
            // cache for the next session
            self.store.write_sig(&ck, &sig).ok();
            sig
        };

        self.t.send(&Msg::Sig {
            status: "OK".into(),
            inode: Some(inode),
            checksum: Some(ck.clone()),
            size: Some(sig.len() as u64),
            respid: None,
        })?;
        self.t.send_bulk_from(&mut &sig[..])?;
        self.t.finish_bulk(&BulkTrailer {
            status: "OK".into(),
            size: sig.len() as u64,
            checksum: Some(ck),
            compressed: None,
        })?;
        Ok(())
    }

    // Client uploads a fresh signature after sending content or a delta.
    fn handle_sig_upload(&mut self, checksum: Option<String>) -> Result<(Option<Msg>, bool), Error> {
        let ck = checksum.ok_or_else(|| Error::Protocol("SIG without checksum".into()))?;
        let mut sig = Vec::new();
        let (_, _trailer) = self.t.recv_bulk(&mut sig)?;
        if !self.store.has_sig(&ck) {
            self.store
                .write_sig(&ck, &sig)
                .map_err(|e| Error::Storage(std::io::Error::other(e.to_string())))?;
        }
        Ok((None, false))
    }

    // ---- DEL ----

    fn handle_delta(
        &mut self,
        checksum: &str,
        basis: &str,
        inode: InodeId,
        size: u64,
        deltasize: Option<u64>,
        encrypted: bool,
    ) -> Result<(Option<Msg>, bool), Error> {
        let dbm = |e: meta_db::DbError| Error::Db(e.to_string());
        let stm = |e: blob_store::StoreError| Error::Storage(std::io::Error::other(e.to_string()));

        if self.store.exists(checksum) {
            debug!(checksum, "delta for known blob; draining");
            let mut sink = std::io::sink();
            let (received, _) = self.t.recv_bulk(&mut sink)?;
            self.stat_bytes_received += received as i64;
            if self
                .db
                .get_checksum_info(checksum)
                .map_err(dbm)?
                .map(|i| !i.is_placeholder())
                .unwrap_or(false)
            {
                self.db.set_checksum(inode, checksum).map_err(dbm)?;
            }
            return Ok((None, false));
        }

        let chain = self.db.get_chain_length(basis).map_err(dbm)?.unwrap_or(0);
        // Materializing a full copy needs plaintext; encrypted deltas can
        // only ever be stored as deltas.
        let save_full = (self.policy.save_full || chain >= self.policy.max_chain) && !encrypted;

        let (received, trailer, scratch) = {
            let (path, mut file) = self.store.scratch("delta").map_err(stm)?;
            let (received, trailer) = self.t.recv_bulk(&mut file)?;
            (received, trailer, (path, file))
        };
        self.stat_bytes_received += received as i64;
        let deltasize = deltasize.or(Some(received));

        if save_full {
            let (path, mut file) = scratch;
            use std::io::Seek;
            file.seek(std::io::SeekFrom::Start(0))?;
            let delta_reader: Box<dyn std::io::Read> =
                if trailer.compressed.as_deref() == Some("zstd") {
                    Box::new(zstd::stream::read::Decoder::new(&mut file)?)
                } else {
                    Box::new(&mut file)
                };
            let regen = Regenerator::new(&self.store, &self.db, None);
            let basis_reader = regen.recover(basis, false)?;
            let mut patched = delta::patch(basis_reader, delta_reader)
                .map_err(|e| Error::Integrity(format!("patch onto {basis}: {e}")))?;
            let disk = self.store.put(checksum, &mut patched).map_err(stm)?;
            let _ = std::fs::remove_file(path);
            // the materialized blob holds raw patched bytes
            self.db
                .insert_checksum(
                    checksum,
                    encrypted,
                    size as i64,
                    ChecksumAttrs {
                        is_file: true,
                        disk_size: disk as i64,
                        ..Default::default()
                    },
                )
                .map_err(dbm)?;
            self.store
                .write_meta(
                    checksum,
                    &BlobMeta {
                        size: size as i64,
                        disk_size: disk,
                        basis: None,
                        compressed: None,
                        encrypted,
                    },
                )
                .map_err(stm)?;
        } else {
            let (path, _file) = scratch;
            let disk = self.store.insert_file(checksum, &path).map_err(stm)?;
            if self.policy.link_basis {
                self.store.link_basis(checksum, basis).ok();
            }
            self.db
                .insert_checksum(
                    checksum,
                    encrypted,
                    size as i64,
                    ChecksumAttrs {
                        is_file: true,
                        compressed: trailer.compressed.clone(),
                        disk_size: disk as i64,
                        delta_size: deltasize.map(|d| d as i64),
                        basis: Some(basis.to_string()),
                    },
                )
                .map_err(dbm)?;
            self.store
                .write_meta(
                    checksum,
                    &BlobMeta {
                        size: size as i64,
                        disk_size: disk,
                        basis: Some(basis.to_string()),
                        compressed: trailer.compressed,
                        encrypted,
                    },
                )
                .map_err(stm)?;
        }

        if let Some(sizes) = self.sizes.as_mut() {
            sizes.insert(size as i64);
        }
        self.stat_upd_files += 1;
        self.db.set_checksum(inode, checksum).map_err(dbm)?;

        Ok((None, size > 1_000_000))
    }

    // ---- CON ----

    fn handle_content(
        &mut self,
        inode: InodeId,
        checksum: Option<String>,
        encrypted: bool,
    ) -> Result<(Option<Msg>, bool), Error> {
        let dbm = |e: meta_db::DbError| Error::Db(e.to_string());
        let stm = |e: blob_store::StoreError| Error::Storage(std::io::Error::other(e.to_string()));

        let (path, mut file) = self.store.scratch(&format!("con-{}", self.seq)).map_err(stm)?;
        self.seq += 1;
        let (received, trailer) = self.t.recv_bulk(&mut file)?;
        drop(file);
        self.stat_bytes_received += received as i64;

        let ck = checksum
            .or_else(|| trailer.checksum.clone())
            .ok_or_else(|| Error::Protocol("content without checksum".into()))?;
        let size = trailer.size as i64;

        if self.store.exists(&ck) {
            let known = self.db.get_checksum_info(&ck).map_err(dbm)?;
            match known {
                None => {
                    // file landed once without its record; restore both
                    warn!(checksum = %ck, "blob present but unrecorded; reinserting");
                    let disk = self.store.insert_file(&ck, &path).map_err(stm)?;
                    self.insert_full_record(&ck, encrypted, size, &trailer, disk)?;
                }
                Some(_) if self.full => {
                    debug!(checksum = %ck, "full backup refreshes existing blob");
                    self.store.remove(&ck).map_err(stm)?;
                    let disk = self.store.insert_file(&ck, &path).map_err(stm)?;
                    self.db
                        .update_checksum_file(&ck, encrypted, size, trailer.compressed.as_deref(), disk as i64)
                        .map_err(dbm)?;
                    self.write_full_meta(&ck, encrypted, size, &trailer, disk)?;
                }
                Some(_) => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        } else {
            let disk = self.store.insert_file(&ck, &path).map_err(stm)?;
            match self.db.get_checksum_info(&ck).map_err(dbm)? {
                None => self.insert_full_record(&ck, encrypted, size, &trailer, disk)?,
                Some(k) if k.is_placeholder() => {
                    self.db
                        .update_checksum_file(&ck, encrypted, size, trailer.compressed.as_deref(), disk as i64)
                        .map_err(dbm)?;
                    self.write_full_meta(&ck, encrypted, size, &trailer, disk)?;
                }
                Some(_) => {}
            }
        }

        self.db.set_checksum(inode, &ck).map_err(dbm)?;
        if let Some(sizes) = self.sizes.as_mut() {
            sizes.insert(size);
        }
        self.stat_new_files += 1;
        Ok((None, received > 1_000_000))
    }

    fn insert_full_record(
        &mut self,
        ck: &str,
        encrypted: bool,
        size: i64,
        trailer: &BulkTrailer,
        disk: u64,
    ) -> Result<(), Error> {
        self.db
            .insert_checksum(
                ck,
                encrypted,
                size,
                ChecksumAttrs {
                    is_file: true,
                    compressed: trailer.compressed.clone(),
                    disk_size: disk as i64,
                    ..Default::default()
                },
            )
            .map_err(|e| Error::Db(e.to_string()))?;
        self.write_full_meta(ck, encrypted, size, trailer, disk)
    }

    fn write_full_meta(
        &mut self,
        ck: &str,
        encrypted: bool,
        size: i64,
        trailer: &BulkTrailer,
        disk: u64,
    ) -> Result<(), Error> {
        self.store
            .write_meta(
                ck,
                &BlobMeta {
                    size,
                    disk_size: disk,
                    basis: None,
                    compressed: trailer.compressed.clone(),
                    encrypted,
                },
            )
            .map_err(|e| Error::Storage(std::io::Error::other(e.to_string())))
    }

    // ---- CKS ----

    fn handle_checksums(&mut self, files: Vec<CksumEntry>) -> Result<(Option<Msg>, bool), Error> {
        let dbm = |e: meta_db::DbError| Error::Db(e.to_string());
        let mut done = Vec::new();
        let mut content = Vec::new();
        let mut delta = Vec::new();
        let prev = self.db.prev_set().unwrap_or(-1);

        for f in files {
            let info = self.db.get_checksum_info(&f.checksum).map_err(dbm)?;
            match info {
                Some(i) if i.is_file && i.size >= 0 => {
                    self.db.set_checksum(f.inode, &f.checksum).map_err(dbm)?;
                    done.push(f.inode);
                }
                _ => {
                    let old = self.db.get_file_info_by_inode(f.inode, prev).map_err(dbm)?;
                    let chainable = old
                        .map(|o| o.checksum.is_some() && o.chain_length < self.policy.max_chain)
                        .unwrap_or(false);
                    if chainable && !self.full {
                        delta.push(f.inode);
                    } else {
                        content.push(f.inode);
                    }
                }
            }
        }
        let resp = Msg::AckSum { status: "OK".into(), done, content, delta, respid: None };
        Ok((Some(resp), false))
    }

    // ---- CLN ----

    fn handle_clone(&mut self, clones: Vec<CloneEntry>) -> Result<(Option<Msg>, bool), Error> {
        let dbm = |e: meta_db::DbError| Error::Db(e.to_string());
        let mut done = Vec::new();
        let mut content = Vec::new();
        let prev = self.db.prev_set().unwrap_or(-1);

        for c in clones {
            let inode = (c.inode, c.dev);
            let mut info = self.db.get_file_info_by_inode(inode, prev).map_err(dbm)?;
            if info.is_none() && self.db.last_completed().is_none() {
                info = self.db.get_file_info_by_inode_from_partial(inode).map_err(dbm)?;
            }
            let clonable = match &info {
                Some(i) if i.checksum.is_some() => {
                    let from_set = i.last_set.min(prev);
                    let num = self.db.get_directory_size(inode, from_set).map_err(dbm)?;
                    num == Some(c.numfiles as i64)
                        && i.checksum.as_deref() == Some(c.cksum.as_str())
                }
                _ => false,
            };
            if !clonable {
                content.push(inode);
                continue;
            }
            let from_set = info.expect("checked above").last_set.min(prev);
            self.db.clone_dir(inode, from_set).map_err(dbm)?;
            // also carry the directory's own row forward
            if let Some(dir_row) = self.db.get_file_info_by_inode(inode, from_set).map_err(dbm)? {
                self.db
                    .extend_file_inode(
                        (dir_row.parent_inode, dir_row.parent_device),
                        inode,
                        Some(from_set),
                    )
                    .map_err(dbm)?;
            }
            if self.full {
                let deltas = self.db.get_num_deltas_in_directory(inode, from_set).map_err(dbm)?;
                if deltas > 0 {
                    content.push(inode);
                    continue;
                }
            }
            done.push(inode);
        }
        Ok((Some(Msg::AckClone { done, content, respid: None }), true))
    }

    // ---- META / METADATA ----

    fn handle_meta(
        &mut self,
        metadata: Vec<String>,
        encrypted: bool,
    ) -> Result<(Option<Msg>, bool), Error> {
        let dbm = |e: meta_db::DbError| Error::Db(e.to_string());
        let mut done = Vec::new();
        let mut content = Vec::new();
        for ck in metadata {
            let info = self.db.get_checksum_info(&ck).map_err(dbm)?;
            match info {
                Some(i) if !i.is_placeholder() => done.push(ck),
                Some(_) => content.push(ck),
                None => {
                    self.db
                        .insert_checksum(
                            &ck,
                            encrypted,
                            -1,
                            ChecksumAttrs { is_file: false, ..Default::default() },
                        )
                        .map_err(dbm)?;
                    content.push(ck);
                }
            }
        }
        Ok((Some(Msg::AckMeta { done, content, respid: None }), false))
    }

    fn handle_metadata(
        &mut self,
        checksum: &str,
        encrypted: bool,
    ) -> Result<(Option<Msg>, bool), Error> {
        let stm = |e: blob_store::StoreError| Error::Storage(std::io::Error::other(e.to_string()));
        if self.store.exists(checksum) {
            let mut sink = std::io::sink();
            let (received, _) = self.t.recv_bulk(&mut sink)?;
            self.stat_bytes_received += received as i64;
            return Ok((None, false));
        }
        let mut w = self.store.writer(checksum).map_err(stm)?;
        let (received, trailer) = self.t.recv_bulk(&mut w)?;
        let disk = w.commit().map_err(stm)?;
        self.stat_bytes_received += received as i64;
        self.db
            .update_checksum_file(
                checksum,
                encrypted,
                trailer.size as i64,
                trailer.compressed.as_deref(),
                disk as i64,
            )
            .map_err(|e| Error::Db(e.to_string()))?;
        self.stat_new_files += 1;
        Ok((None, false))
    }

    // ---- BATCH ----

    fn handle_batch(&mut self, batch: Vec<Msg>) -> Result<(Option<Msg>, bool), Error> {
        let mut responses = Vec::new();
        for msg in batch {
            let msgid = msg.msgid();
            let (response, _) = self.process_message(msg)?;
            if let Some(mut resp) = response {
                if let Some(id) = msgid {
                    resp.set_respid(id);
                }
                responses.push(resp);
            }
        }
        self.push_stats()?;
        Ok((Some(Msg::AckBatch { responses, respid: None }), true))
    }

    // ---- PRG ----

    fn handle_purge(
        &mut self,
        time: Option<f64>,
        relative: bool,
        priority: Option<i64>,
    ) -> Result<(Option<Msg>, bool), Error> {
        let before_time = match time {
            Some(t) if relative => Some(self.db.prev_backup_date() - t),
            Some(t) => Some(t),
            None => self
                .config_keep_secs
                .map(|keep| self.db.prev_backup_date() - keep),
        };
        let priority = priority.or(self.config_priority).unwrap_or(0);

        let Some(before_time) = before_time else {
            return Ok((Some(Msg::AckPurge { status: "FAIL".into(), respid: None }), true));
        };
        let (files, sets) = self
            .db
            .purge_sets(priority, before_time, None)
            .map_err(|e| Error::Db(e.to_string()))?;
        if sets > 0 {
            info!(files, sets, "purged backup sets");
            self.purged = true;
        }
        Ok((Some(Msg::AckPurge { status: "OK".into(), respid: None }), true))
    }

    // ---- SETKEYS (rotation) ----

    fn handle_set_keys(
        &mut self,
        crypto_scheme: u8,
        filename_key: String,
        content_key: String,
        srp_salt: String,
        srp_vkey: String,
    ) -> Result<(Option<Msg>, bool), Error> {
        self.db
            .set_keys(&srp_salt, &srp_vkey, &filename_key, &content_key)
            .map_err(|e| Error::Db(e.to_string()))?;
        self.db
            .set_config("CryptoScheme", &crypto_scheme.to_string())
            .map_err(|e| Error::Db(e.to_string()))?;
        info!(scheme = crypto_scheme, "client keys rotated");
        Ok((Some(Msg::AckSetKeys { status: "OK".into(), respid: None }), true))
    }

    // ---- diagnostics ----

    fn handle_client_config(&mut self, args: &str) -> Result<(Option<Msg>, bool), Error> {
        let saved = self.policy.save_config;
        if saved {
            self.db
                .set_config("ClientConfig", args)
                .map_err(|e| Error::Db(e.to_string()))?;
        }
        Ok((Some(Msg::AckClientConfig { saved, respid: None }), false))
    }

    fn handle_command_line(
        &mut self,
        hash: &str,
        line: &str,
        size: u64,
        encrypted: bool,
    ) -> Result<(Option<Msg>, bool), Error> {
        let dbm = |e: meta_db::DbError| Error::Db(e.to_string());
        if self.db.get_checksum_info(hash).map_err(dbm)?.is_none() {
            let mut bytes = line.as_bytes();
            let disk = self
                .store
                .put(hash, &mut bytes)
                .map_err(|e| Error::Storage(std::io::Error::other(e.to_string())))?;
            self.db
                .insert_checksum(
                    hash,
                    encrypted,
                    size as i64,
                    ChecksumAttrs { is_file: false, disk_size: disk as i64, ..Default::default() },
                )
                .map_err(dbm)?;
        }
        self.db.set_config("CommandLine", hash).map_err(dbm)?;
        Ok((Some(Msg::AckCommandLine { respid: None }), false))
    }

    fn push_stats(&mut self) -> Result<(), Error> {
        self.db
            .set_stats(self.stat_new_files, self.stat_upd_files, self.stat_bytes_received)
            .map_err(|e| Error::Db(e.to_string()))
    }

    /// Seal the session: set completion state, auto-purge, reclaim orphans.
    pub fn finalize(mut self, run_result: Result<(), Error>) -> Result<SessionOutcome, Error> {
        let dbm = |e: meta_db::DbError| Error::Db(e.to_string());
        let completed = run_result.is_ok() && self.done;

        if let Err(e) = &run_result {
            warn!(client = %self.client, error = %e, "session ended abnormally");
            self.db.rollback().ok();
            self.db.set_failure(&e.to_string()).ok();
        }

        self.push_stats().ok();
        if completed {
            self.db.complete_backup().map_err(dbm)?;
            if self.autoname {
                if let Some(auto) = &self.auto {
                    self.db
                        .set_backup_set_name(&auto.name, auto.priority)
                        .map_err(dbm)?;
                }
            }
        }
        self.db.set_client_end_time().map_err(dbm)?;

        if self.policy.auto_purge && !self.purged && completed {
            let _ = self.handle_purge(None, false, None);
        }

        let sweep = reclaim::remove_orphans(&mut self.db, &self.store).unwrap_or_default();
        self.db.commit().map_err(dbm)?;
        self.db.vacuum_if_due().ok();

        self.registry.remove(&self.session_id);
        debug!(commands = ?self.commands, "session command tally");
        info!(
            client = %self.client,
            completed,
            new_files = self.stat_new_files,
            delta_files = self.stat_upd_files,
            bytes = self.stat_bytes_received,
            "session closed"
        );
        let client = self.client.clone();
        self.db.close(completed).map_err(dbm)?;

        match run_result {
            Ok(()) => Ok(SessionOutcome {
                client,
                completed,
                purged_blobs: sweep.count,
                reclaimed_bytes: sweep.bytes,
            }),
            Err(e) => Err(e),
        }
    }
}
