//! Regenerator: rehydrate stored content by walking the delta chain.
//!
//! A stored blob is either full or a delta against a basis; the chain is
//! bounded and acyclic. Recovery walks to the full blob, then patches
//! forward through each delta. Every layer is optionally decrypted and
//! verified (when keys are available) and decompressed per its recorded
//! metadata. Output never surfaces before the whole pipeline is built;
//! failures discard the in-flight scratch.

use std::io::Read;

use blob_store::{BlobMeta, BlobStore};
use crypt::Crypto;
use meta_db::MetaDb;
use strata_core::Error;
use thiserror::Error;
use tracing::{error, warn};

/// Regeneration failures.
#[derive(Debug, Error)]
pub enum RegenError {
    #[error("unknown checksum {0}")]
    Unknown(String),
    #[error("integrity failure in {checksum}: {reason}")]
    Integrity { checksum: String, reason: String },
    #[error("storage: {0}")]
    Storage(#[from] blob_store::StoreError),
    #[error("database: {0}")]
    Db(#[from] meta_db::DbError),
    #[error("delta: {0}")]
    Delta(#[from] delta::DeltaError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RegenError> for Error {
    fn from(e: RegenError) -> Self {
        match e {
            RegenError::Integrity { checksum, reason } => {
                Error::Integrity(format!("{checksum}: {reason}"))
            }
            other => Error::Storage(std::io::Error::other(other.to_string())),
        }
    }
}

/// Rehydrates file content at any point of its delta chain.
pub struct Regenerator<'a> {
    store: &'a BlobStore,
    db: &'a MetaDb,
    crypto: Option<&'a Crypto>,
}

impl<'a> Regenerator<'a> {
    /// `crypto` carries the client's working keys; without it only
    /// unencrypted blobs can be recovered.
    pub fn new(store: &'a BlobStore, db: &'a MetaDb, crypto: Option<&'a Crypto>) -> Self {
        Self { store, db, crypto }
    }

    /// Plaintext reader for `checksum`. With `authenticate`, every layer's
    /// tag is verified; a mismatch aborts with no partial output.
    pub fn recover(
        &self,
        checksum: &str,
        authenticate: bool,
    ) -> Result<Box<dyn Read + Send>, RegenError> {
        // Walk basis pointers down to the full blob.
        let mut chain: Vec<(String, BlobMeta)> = Vec::new();
        let mut cursor = checksum.to_string();
        loop {
            let meta = self.layer_meta(&cursor)?;
            let basis = meta.basis.clone();
            chain.push((cursor.clone(), meta));
            match basis {
                Some(b) => cursor = b,
                None => break,
            }
        }

        // Bottom of the chain is the full blob; patch forward through each
        // delta on the way back up.
        let (full_ck, full_meta) = chain.last().expect("chain is never empty");
        let mut reader = self.open_layer(full_ck, full_meta, authenticate)?;
        for (ck, meta) in chain.iter().rev().skip(1) {
            let delta_reader = self.open_layer(ck, meta, authenticate)?;
            let patched = delta::patch(reader, delta_reader).map_err(|e| match e {
                delta::DeltaError::BasisMismatch => {
                    error!(checksum = %ck, "delta chain suspect: basis mismatch");
                    RegenError::Integrity {
                        checksum: ck.clone(),
                        reason: "delta basis mismatch".into(),
                    }
                }
                other => RegenError::Delta(other),
            })?;
            reader = Box::new(patched);
        }
        Ok(reader)
    }

    fn layer_meta(&self, ck: &str) -> Result<BlobMeta, RegenError> {
        if let Some(meta) = self.store.read_meta(ck)? {
            return Ok(meta);
        }
        // Fall back to the database record when the sidecar is missing.
        let info = self
            .db
            .get_checksum_info(ck)?
            .ok_or_else(|| RegenError::Unknown(ck.to_string()))?;
        if info.is_placeholder() {
            return Err(RegenError::Unknown(format!("{ck} (placeholder)")));
        }
        warn!(checksum = %ck, "missing .meta sidecar; using database record");
        Ok(BlobMeta {
            size: info.size,
            disk_size: info.disk_size as u64,
            basis: info.basis,
            compressed: info.compressed,
            encrypted: info.encrypted,
        })
    }

    // Open one blob as plaintext: decrypt then decompress. The decrypting
    // reader verifies the tag at EOF regardless of `authenticate`; the flag
    // only governs whether a missing key is fatal here.
    fn open_layer(
        &self,
        ck: &str,
        meta: &BlobMeta,
        authenticate: bool,
    ) -> Result<Box<dyn Read + Send>, RegenError> {
        let file = self.store.open_blob(ck)?;
        let mut reader: Box<dyn Read + Send> = if meta.encrypted {
            let crypto = self.crypto.ok_or_else(|| RegenError::Integrity {
                checksum: ck.to_string(),
                reason: if authenticate {
                    "encrypted blob but no keys loaded".into()
                } else {
                    "encrypted blob cannot be regenerated without keys".into()
                },
            })?;
            Box::new(crypto.decrypt_reader(file).map_err(|e| RegenError::Integrity {
                checksum: ck.to_string(),
                reason: e.to_string(),
            })?)
        } else {
            Box::new(file)
        };
        if meta.compressed.as_deref() == Some("zstd") {
            reader = Box::new(zstd::stream::read::Decoder::new(reader)?);
        }
        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;

    fn setup(dir: &Path) -> (BlobStore, MetaDb) {
        let store = BlobStore::open(dir, "alice", true).unwrap();
        let mut db = MetaDb::open(dir, "alice", true, 0, None).unwrap();
        db.new_backup_set("set1", "s1", 0, 0.0, "v", "a", false, None).unwrap();
        (store, db)
    }

    fn put_full(store: &BlobStore, db: &mut MetaDb, ck: &str, data: &[u8]) {
        store.put(ck, &mut Cursor::new(data.to_vec())).unwrap();
        store
            .write_meta(
                ck,
                &BlobMeta {
                    size: data.len() as i64,
                    disk_size: data.len() as u64,
                    basis: None,
                    compressed: None,
                    encrypted: false,
                },
            )
            .unwrap();
        db.insert_checksum(
            ck,
            false,
            data.len() as i64,
            meta_db::ChecksumAttrs { is_file: true, disk_size: data.len() as i64, ..Default::default() },
        )
        .unwrap();
    }

    fn put_delta(store: &BlobStore, db: &mut MetaDb, ck: &str, basis: &str, basis_data: &[u8], target: &[u8]) {
        let sig = delta::signature(Cursor::new(basis_data.to_vec())).unwrap();
        let index = delta::SignatureIndex::parse(Cursor::new(&sig)).unwrap();
        let (mut d, dsize) = delta::delta(Cursor::new(target.to_vec()), &index).unwrap();
        let mut raw = Vec::new();
        d.read_to_end(&mut raw).unwrap();
        store.put(ck, &mut Cursor::new(raw.clone())).unwrap();
        store
            .write_meta(
                ck,
                &BlobMeta {
                    size: target.len() as i64,
                    disk_size: raw.len() as u64,
                    basis: Some(basis.to_string()),
                    compressed: None,
                    encrypted: false,
                },
            )
            .unwrap();
        db.insert_checksum(
            ck,
            false,
            target.len() as i64,
            meta_db::ChecksumAttrs {
                is_file: true,
                disk_size: raw.len() as i64,
                delta_size: Some(dsize as i64),
                basis: Some(basis.to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn recovers_through_two_delta_hops() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut db) = setup(dir.path());

        let v1: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
        let mut v2 = v1.clone();
        v2.extend_from_slice(&[1u8; 5_000]);
        let mut v3 = v2.clone();
        v3[100..200].fill(9);

        put_full(&store, &mut db, "aa01", &v1);
        put_delta(&store, &mut db, "bb02", "aa01", &v1, &v2);
        put_delta(&store, &mut db, "cc03", "bb02", &v2, &v3);
        assert_eq!(db.get_chain_length("cc03").unwrap(), Some(2));

        let regen = Regenerator::new(&store, &db, None);
        for (ck, want) in [("aa01", &v1), ("bb02", &v2), ("cc03", &v3)] {
            let mut got = Vec::new();
            regen.recover(ck, true).unwrap().read_to_end(&mut got).unwrap();
            assert_eq!(&got, want, "{ck}");
        }
    }

    #[test]
    fn unknown_checksum_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, db) = setup(dir.path());
        let regen = Regenerator::new(&store, &db, None);
        assert!(matches!(regen.recover("dead", false), Err(RegenError::Unknown(_))));
    }

    #[test]
    fn compressed_layer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut db) = setup(dir.path());
        let plain = vec![7u8; 50_000];
        let packed = zstd::stream::encode_all(Cursor::new(&plain), 3).unwrap();
        store.put("dd04", &mut Cursor::new(packed.clone())).unwrap();
        store
            .write_meta(
                "dd04",
                &BlobMeta {
                    size: plain.len() as i64,
                    disk_size: packed.len() as u64,
                    basis: None,
                    compressed: Some("zstd".into()),
                    encrypted: false,
                },
            )
            .unwrap();
        db.insert_checksum(
            "dd04",
            false,
            plain.len() as i64,
            meta_db::ChecksumAttrs { is_file: true, disk_size: packed.len() as i64, ..Default::default() },
        )
        .unwrap();

        let regen = Regenerator::new(&store, &db, None);
        let mut got = Vec::new();
        regen.recover("dd04", false).unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, plain);
    }

    #[test]
    fn encrypted_without_keys_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut db) = setup(dir.path());
        store.put("ee05", &mut Cursor::new(vec![0u8; 64])).unwrap();
        let meta = BlobMeta {
            size: 64,
            disk_size: 64,
            basis: None,
            compressed: None,
            encrypted: true,
        };
        store.write_meta("ee05", &meta).unwrap();
        db.insert_checksum("ee05", true, 64, meta_db::ChecksumAttrs { is_file: true, disk_size: 64, ..Default::default() })
            .unwrap();

        let regen = Regenerator::new(&store, &db, None);
        assert!(matches!(
            regen.recover("ee05", true),
            Err(RegenError::Integrity { .. })
        ));
    }
}
