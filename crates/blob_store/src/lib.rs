//! Blob store (sharded content-addressed files + sidecars)
//!
//! Overview
//! - One store per client, rooted at `<base>/<client>/`.
//! - Blobs are named by their (hex) content address and sharded by the two
//!   leading hex pairs: `ab/cd/abcdef…`.
//! - Each blob may carry two sidecars: `<ck>.sig` (cached rolling signature
//!   for delta-base reuse) and `<ck>.meta` (JSON: sizes, basis, flags).
//! - Atomicity: writes go to a scratch file under `tmp/`, are fsynced, and
//!   renamed into place. Readers never observe partial blobs. Duplicate
//!   writers collapse: the second rename loses and the first file stays.
//!
//! The store holds ciphertext as delivered by the client; it neither hashes
//! nor decrypts content. Consistency with the metadata database (a record
//! exists iff the blob does) is maintained by the session layer and restored
//! by the orphan sweep.

#![deny(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Sidecar suffix for cached signatures.
pub const SIG_SUFFIX: &str = ".sig";
/// Sidecar suffix for blob metadata.
pub const META_SUFFIX: &str = ".meta";
/// Sidecar suffix for retained delta bases (hard links).
pub const BASIS_SUFFIX: &str = ".basis";

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("invalid content address: {0}")]
    BadAddress(String),
    #[error("corrupt sidecar for {0}")]
    CorruptMeta(String),
}

/// Metadata sidecar contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobMeta {
    /// Original (plaintext) size; -1 marks a metadata reservation.
    pub size: i64,
    /// Bytes on disk.
    pub disk_size: u64,
    /// Content address of the delta basis, if this blob is a delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<String>,
    /// Content-level compression codec, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<String>,
    pub encrypted: bool,
}

/// One client's sharded blob tree.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (or create) the store for one client under `base`.
    pub fn open(base: &Path, client: &str, create: bool) -> Result<Self, StoreError> {
        let root = base.join(client);
        if !root.is_dir() {
            if !create {
                return Err(StoreError::NotFound(format!(
                    "no blob store for client {client}"
                )));
            }
            fs::create_dir_all(&root)?;
        }
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sharded path for a content address (`ab/cd/abcd…`).
    pub fn path_for(&self, ck: &str) -> Result<PathBuf, StoreError> {
        if ck.len() < 4 || !ck.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::BadAddress(ck.to_string()));
        }
        Ok(self.root.join(&ck[0..2]).join(&ck[2..4]).join(ck))
    }

    pub fn exists(&self, ck: &str) -> bool {
        self.path_for(ck).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Open a blob for reading.
    pub fn open_blob(&self, ck: &str) -> Result<File, StoreError> {
        let path = self.path_for(ck)?;
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(ck.to_string())
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Size on disk of a stored blob.
    pub fn blob_size(&self, ck: &str) -> Result<u64, StoreError> {
        let path = self.path_for(ck)?;
        match fs::metadata(&path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(ck.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Streaming writer committing to `ck` on success.
    pub fn writer(&self, ck: &str) -> Result<BlobWriter, StoreError> {
        let final_path = self.path_for(ck)?;
        let (tmp_path, file) = self.scratch("put")?;
        Ok(BlobWriter { tmp_path, file, final_path, bytes: 0 })
    }

    /// Store a whole reader under `ck`; returns bytes written.
    pub fn put(&self, ck: &str, reader: &mut dyn Read) -> Result<u64, StoreError> {
        let mut w = self.writer(ck)?;
        io::copy(reader, &mut w)?;
        w.commit()
    }

    /// Move an existing scratch file into place under `ck`.
    pub fn insert_file(&self, ck: &str, path: &Path) -> Result<u64, StoreError> {
        let len = fs::metadata(path)?.len();
        let final_path = self.path_for(ck)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(path, &final_path) {
            Ok(()) => Ok(len),
            Err(_) if final_path.is_file() => {
                // lost the race; the first writer's blob stands
                let _ = fs::remove_file(path);
                Ok(len)
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Hard-link one stored name to another (basis retention).
    pub fn link(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        let from = self.path_for(src)?;
        let to = self.path_for(dst)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::hard_link(&from, &to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Retain a delta's basis by hard-linking it next to the delta as
    /// `<ck>.basis`.
    pub fn link_basis(&self, ck: &str, basis: &str) -> Result<(), StoreError> {
        let from = self.path_for(basis)?;
        let to = sidecar(&self.path_for(ck)?, BASIS_SUFFIX);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::hard_link(&from, &to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Remove a blob and its sidecars; returns bytes reclaimed.
    pub fn remove(&self, ck: &str) -> Result<u64, StoreError> {
        let path = self.path_for(ck)?;
        let mut freed = 0u64;
        for p in [
            path.clone(),
            sidecar(&path, SIG_SUFFIX),
            sidecar(&path, META_SUFFIX),
            sidecar(&path, BASIS_SUFFIX),
        ] {
            match fs::metadata(&p) {
                Ok(m) => {
                    freed += m.len();
                    fs::remove_file(&p)?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
        Ok(freed)
    }

    // ---- signature sidecars ----

    pub fn has_sig(&self, ck: &str) -> bool {
        self.path_for(ck)
            .map(|p| sidecar(&p, SIG_SUFFIX).is_file())
            .unwrap_or(false)
    }

    pub fn read_sig(&self, ck: &str) -> Result<Vec<u8>, StoreError> {
        let path = sidecar(&self.path_for(ck)?, SIG_SUFFIX);
        match fs::read(&path) {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("{ck}{SIG_SUFFIX}")))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    pub fn write_sig(&self, ck: &str, sig: &[u8]) -> Result<(), StoreError> {
        let final_path = sidecar(&self.path_for(ck)?, SIG_SUFFIX);
        self.atomic_write(&final_path, sig)
    }

    // ---- metadata sidecars ----

    pub fn read_meta(&self, ck: &str) -> Result<Option<BlobMeta>, StoreError> {
        let path = sidecar(&self.path_for(ck)?, META_SUFFIX);
        let raw = match fs::read(&path) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|_| StoreError::CorruptMeta(ck.to_string()))
    }

    pub fn write_meta(&self, ck: &str, meta: &BlobMeta) -> Result<(), StoreError> {
        let final_path = sidecar(&self.path_for(ck)?, META_SUFFIX);
        let raw = serde_json::to_vec(meta).expect("meta serializes");
        self.atomic_write(&final_path, &raw)
    }

    // ---- scratch space ----

    /// A unique scratch file under `tmp/`.
    pub fn scratch(&self, label: &str) -> Result<(PathBuf, File), StoreError> {
        let tmp_dir = self.root.join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        let mut i = 0u64;
        loop {
            let candidate = tmp_dir.join(format!("{label}-{i}.tmp"));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(f) => return Ok((candidate, f)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    i = i.wrapping_add(1);
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
    }

    /// Clear stale scratch files (crashed sessions leave them behind).
    pub fn cleanup_tmp(&self) -> Result<usize, StoreError> {
        let tmp_dir = self.root.join("tmp");
        let mut removed = 0usize;
        if tmp_dir.is_dir() {
            for entry in fs::read_dir(&tmp_dir)? {
                let entry = entry?;
                if entry.path().is_file() && fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "cleared stale scratch files");
        }
        Ok(removed)
    }

    /// Enumerate all stored content addresses with their on-disk sizes.
    pub fn enumerate(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let mut out = Vec::new();
        for shard1 in read_dir_sorted(&self.root)? {
            if !shard1.path().is_dir() || shard1.file_name() == "tmp" {
                continue;
            }
            for shard2 in read_dir_sorted(&shard1.path())? {
                if !shard2.path().is_dir() {
                    continue;
                }
                for blob in read_dir_sorted(&shard2.path())? {
                    let name = blob.file_name().to_string_lossy().into_owned();
                    if name.ends_with(SIG_SUFFIX)
                        || name.ends_with(META_SUFFIX)
                        || name.ends_with(BASIS_SUFFIX)
                    {
                        continue;
                    }
                    match blob.metadata() {
                        Ok(m) if m.is_file() => out.push((name, m.len())),
                        Ok(_) => {}
                        Err(e) => warn!(blob = %name, error = %e, "unreadable blob"),
                    }
                }
            }
        }
        Ok(out)
    }

    fn atomic_write(&self, final_path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let (tmp_path, mut file) = self.scratch("sidecar")?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&tmp_path, final_path) {
            Ok(()) => Ok(()),
            Err(_) if final_path.is_file() => {
                let _ = fs::remove_file(&tmp_path);
                Ok(())
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// In-flight blob write; nothing is visible until [`BlobWriter::commit`].
pub struct BlobWriter {
    tmp_path: PathBuf,
    file: File,
    final_path: PathBuf,
    bytes: u64,
}

impl BlobWriter {
    /// Fsync and rename into place; a concurrent winner's file is kept.
    pub fn commit(mut self) -> Result<u64, StoreError> {
        self.file.flush()?;
        self.file.sync_all()?;
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&self.tmp_path, &self.final_path) {
            Ok(()) => Ok(self.bytes),
            Err(_) if self.final_path.is_file() => {
                let _ = fs::remove_file(&self.tmp_path);
                Ok(self.bytes)
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Drop the scratch file without committing.
    pub fn abort(self) {
        let _ = fs::remove_file(&self.tmp_path);
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<fs::DirEntry>, StoreError> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CK: &str = "ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12";

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = BlobStore::open(dir.path(), "alice", true).unwrap();
        (dir, s)
    }

    #[test]
    fn put_shards_and_reads_back() {
        let (_dir, s) = store();
        let data = b"ciphertext bytes".to_vec();
        let n = s.put(CK, &mut Cursor::new(&data)).unwrap();
        assert_eq!(n, data.len() as u64);
        assert!(s.exists(CK));

        let path = s.path_for(CK).unwrap();
        assert!(path.ends_with(format!("ab/12/{CK}")));

        let mut got = Vec::new();
        s.open_blob(CK).unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, data);
        assert_eq!(s.blob_size(CK).unwrap(), data.len() as u64);
    }

    #[test]
    fn duplicate_put_keeps_first_file() {
        let (_dir, s) = store();
        s.put(CK, &mut Cursor::new(b"first".to_vec())).unwrap();
        s.put(CK, &mut Cursor::new(b"second".to_vec())).unwrap();
        let mut got = Vec::new();
        s.open_blob(CK).unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, b"first");
    }

    #[test]
    fn aborted_writer_leaves_nothing() {
        let (_dir, s) = store();
        let mut w = s.writer(CK).unwrap();
        w.write_all(b"partial").unwrap();
        w.abort();
        assert!(!s.exists(CK));
        assert_eq!(s.enumerate().unwrap().len(), 0);
    }

    #[test]
    fn sidecars_round_trip() {
        let (_dir, s) = store();
        s.put(CK, &mut Cursor::new(b"blob".to_vec())).unwrap();
        s.write_sig(CK, b"signature bytes").unwrap();
        assert!(s.has_sig(CK));
        assert_eq!(s.read_sig(CK).unwrap(), b"signature bytes");

        let meta = BlobMeta {
            size: 4,
            disk_size: 4,
            basis: Some("ff00".into()),
            compressed: Some("zstd".into()),
            encrypted: true,
        };
        s.write_meta(CK, &meta).unwrap();
        assert_eq!(s.read_meta(CK).unwrap(), Some(meta));
        assert_eq!(s.read_meta("ffff").unwrap(), None);
    }

    #[test]
    fn remove_reclaims_blob_and_sidecars() {
        let (_dir, s) = store();
        s.put(CK, &mut Cursor::new(vec![0u8; 100])).unwrap();
        s.write_sig(CK, &[1u8; 20]).unwrap();
        let freed = s.remove(CK).unwrap();
        assert_eq!(freed, 120);
        assert!(!s.exists(CK));
        assert!(!s.has_sig(CK));
    }

    #[test]
    fn enumerate_skips_sidecars_and_tmp() {
        let (_dir, s) = store();
        s.put(CK, &mut Cursor::new(vec![9u8; 10])).unwrap();
        s.write_sig(CK, &[0u8; 5]).unwrap();
        let (_, mut f) = s.scratch("stale").unwrap();
        f.write_all(b"junk").unwrap();
        let listed = s.enumerate().unwrap();
        assert_eq!(listed, vec![(CK.to_string(), 10)]);
    }

    #[test]
    fn cleanup_tmp_removes_stale_scratch() {
        let (_dir, s) = store();
        let _ = s.scratch("a").unwrap();
        let _ = s.scratch("b").unwrap();
        assert_eq!(s.cleanup_tmp().unwrap(), 2);
        assert_eq!(s.cleanup_tmp().unwrap(), 0);
    }

    #[test]
    fn link_retains_basis() {
        let (_dir, s) = store();
        s.put(CK, &mut Cursor::new(b"base".to_vec())).unwrap();
        let other = "cd34ab12cd34ab12cd34ab12cd34ab12cd34ab12cd34ab12cd34ab12cd34ab12";
        s.link(CK, other).unwrap();
        let mut got = Vec::new();
        s.open_blob(other).unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, b"base");
    }

    #[test]
    fn bad_addresses_rejected() {
        let (_dir, s) = store();
        assert!(matches!(s.path_for("xyz"), Err(StoreError::BadAddress(_))));
        assert!(matches!(s.path_for("ab"), Err(StoreError::BadAddress(_))));
        assert!(matches!(
            s.put("zz/../escape", &mut Cursor::new(b"x".to_vec())),
            Err(StoreError::BadAddress(_))
        ));
    }

    #[test]
    fn missing_client_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            BlobStore::open(dir.path(), "ghost", false),
            Err(StoreError::NotFound(_))
        ));
    }
}
