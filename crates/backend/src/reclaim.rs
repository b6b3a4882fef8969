//! Orphan reclamation.
//!
//! After a purge, checksum records that no version row references and that
//! serve as no delta's basis are dead. Deleting one can orphan its own
//! basis, so the sweep runs in rounds until a round finds nothing. A final
//! pass removes on-disk blobs that lost their database record entirely
//! (crash leftovers).

use blob_store::BlobStore;
use meta_db::MetaDb;
use strata_core::Error;
use tracing::{info, warn};

/// Result of one reclamation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub count: u64,
    pub bytes: u64,
    pub rounds: u32,
}

/// Remove all unreferenced checksum records and their blobs.
pub fn remove_orphans(db: &mut MetaDb, store: &BlobStore) -> Result<SweepStats, Error> {
    let mut stats = SweepStats::default();
    loop {
        let orphans = db
            .list_orphan_checksums()
            .map_err(|e| Error::Db(e.to_string()))?;
        if orphans.is_empty() {
            break;
        }
        stats.rounds += 1;
        for ck in orphans {
            db.delete_checksum(&ck).map_err(|e| Error::Db(e.to_string()))?;
            match store.remove(&ck) {
                Ok(freed) => {
                    stats.count += 1;
                    stats.bytes += freed;
                }
                Err(blob_store::StoreError::BadAddress(_)) => {
                    // directory-hash pseudo blobs have no file behind them
                    stats.count += 1;
                }
                Err(e) => warn!(checksum = %ck, error = %e, "could not remove orphan blob"),
            }
        }
    }

    // Blobs on disk without any record (e.g. a crash between store write
    // and commit) are unreachable; clear them too.
    for (ck, size) in store.enumerate().map_err(|e| Error::Storage(std::io::Error::other(e.to_string())))? {
        let known = db
            .get_checksum_info(&ck)
            .map_err(|e| Error::Db(e.to_string()))?
            .is_some();
        if !known {
            if let Ok(freed) = store.remove(&ck) {
                stats.count += 1;
                stats.bytes += freed.max(size);
                if stats.rounds == 0 {
                    stats.rounds = 1;
                }
            }
        }
    }

    if stats.count > 0 {
        info!(count = stats.count, bytes = stats.bytes, rounds = stats.rounds, "orphan sweep");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meta_db::ChecksumAttrs;
    use std::io::Cursor;

    #[test]
    fn sweep_follows_delta_chains_and_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), "alice", true).unwrap();
        let mut db = MetaDb::open(dir.path(), "alice", true, 0, None).unwrap();
        db.new_backup_set("set1", "s1", 0, 0.0, "v", "a", false, None).unwrap();

        store.put("aa01", &mut Cursor::new(vec![1u8; 100])).unwrap();
        store.put("bb02", &mut Cursor::new(vec![2u8; 40])).unwrap();
        db.insert_checksum("aa01", false, 100, ChecksumAttrs { is_file: true, disk_size: 100, ..Default::default() })
            .unwrap();
        db.insert_checksum(
            "bb02",
            false,
            110,
            ChecksumAttrs { is_file: true, disk_size: 40, basis: Some("aa01".into()), ..Default::default() },
        )
        .unwrap();

        let stats = remove_orphans(&mut db, &store).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.bytes, 140);
        assert_eq!(stats.rounds, 2, "basis only orphans after its delta goes");
        assert!(!store.exists("aa01"));
        assert!(!store.exists("bb02"));

        // idempotent
        let again = remove_orphans(&mut db, &store).unwrap();
        assert_eq!(again, SweepStats::default());
    }

    #[test]
    fn referenced_blobs_survive() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), "alice", true).unwrap();
        let mut db = MetaDb::open(dir.path(), "alice", true, 0, None).unwrap();
        db.new_backup_set("set1", "s1", 0, 0.0, "v", "a", false, None).unwrap();

        store.put("cc03", &mut Cursor::new(vec![3u8; 10])).unwrap();
        db.insert_checksum("cc03", false, 10, ChecksumAttrs { is_file: true, disk_size: 10, ..Default::default() })
            .unwrap();
        db.insert_file("enc-f", (0, 0), (5, 1), false, false, 1, 10, 1, 1, 1, 0o644, 0, 0)
            .unwrap();
        db.set_checksum((5, 1), "cc03").unwrap();

        let stats = remove_orphans(&mut db, &store).unwrap();
        assert_eq!(stats.count, 0);
        assert!(store.exists("cc03"));
    }

    #[test]
    fn recordless_blobs_are_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), "alice", true).unwrap();
        let mut db = MetaDb::open(dir.path(), "alice", true, 0, None).unwrap();
        db.new_backup_set("set1", "s1", 0, 0.0, "v", "a", false, None).unwrap();

        store.put("dd04", &mut Cursor::new(vec![4u8; 25])).unwrap();
        let stats = remove_orphans(&mut db, &store).unwrap();
        assert_eq!(stats.count, 1);
        assert!(!store.exists("dd04"));
    }
}
