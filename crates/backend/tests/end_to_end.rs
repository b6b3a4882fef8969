//! Full client/server exercises over a loopback socket: incremental sets,
//! hard links, renames, delta chains up to the limit, cloning, and purge
//! with orphan reclamation.

use std::net::TcpListener;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backend::{server::Server, BackendConfig};
use blob_store::BlobStore;
use meta_db::MetaDb;
use walker::{run_backup, WalkStats, WalkerConfig};

const PASSWORD: &str = "p@ss";
const MAX_CHAIN: i64 = 2;

struct Harness {
    _root: tempfile::TempDir,
    base_dir: PathBuf,
    db_dir: PathBuf,
    src: PathBuf,
    addr: String,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let base_dir = root.path().join("blobs");
        let db_dir = root.path().join("db");
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();

        let cfg = BackendConfig {
            base_dir: base_dir.clone(),
            db_dir: db_dir.clone(),
            max_chain: MAX_CHAIN,
            db_backups: 0,
            auto_purge: false,
            ..BackendConfig::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            let _ = Server::new(cfg).run(listener);
        });

        Self { _root: root, base_dir, db_dir, src, addr }
    }

    fn backup(&self, set_name: &str, create: bool) -> WalkStats {
        // let the previous session finish its teardown before reconnecting
        std::thread::sleep(Duration::from_millis(300));
        let mut cfg = WalkerConfig::new(&self.addr, "alice", vec![self.src.clone()]);
        cfg.password = Some(PASSWORD.to_string());
        cfg.crypto_scheme = Some(3);
        cfg.create = create;
        cfg.name = Some(set_name.to_string());
        cfg.batch_size = 1;
        let (_info, stats) = run_backup(&cfg).expect("backup run");
        std::thread::sleep(Duration::from_millis(300));
        stats
    }

    fn db(&self) -> MetaDb {
        MetaDb::open(&self.db_dir, "alice", false, 0, None).unwrap()
    }

    fn store(&self) -> BlobStore {
        BlobStore::open(&self.base_dir, "alice", false).unwrap()
    }

    fn blob_count(&self) -> usize {
        self.store().enumerate().unwrap().len()
    }
}

fn pseudo(len: usize, seed: u32) -> Vec<u8> {
    let mut v = Vec::with_capacity(len);
    let mut x = seed;
    for _ in 0..len {
        x = x.wrapping_mul(1103515245).wrapping_add(12345);
        v.push((x >> 16) as u8);
    }
    v
}

fn inode_of(path: &Path) -> (u64, u64) {
    let m = std::fs::metadata(path).unwrap();
    (m.ino(), m.dev())
}

#[test]
fn incremental_backup_lifecycle() {
    let h = Harness::new();

    // --- set 1: fresh client, full content, one hard link ---
    std::fs::write(h.src.join("a"), pseudo(1024, 1)).unwrap();
    std::fs::write(h.src.join("b"), pseudo(1_048_576, 2)).unwrap();
    std::fs::write(h.src.join("solo"), pseudo(2048, 3)).unwrap();
    std::fs::create_dir(h.src.join("dir")).unwrap();
    std::fs::hard_link(h.src.join("a"), h.src.join("dir/c")).unwrap();

    let stats = h.backup("set1", true);
    assert_eq!(stats.new_files, 3, "a, b, solo; the hard link rides along");
    assert_eq!(stats.delta_files, 0);

    {
        let db = h.db();
        assert_eq!(db.get_config("CryptoScheme").unwrap().as_deref(), Some("3"));
        assert!(db.get_config("SrpVkey").unwrap().is_some());
        assert!(db.get_config("FilenameKey").unwrap().is_some());
        assert!(db.get_config("ContentKey").unwrap().is_some());
        assert!(!db.client_id().unwrap().is_empty());
        let last = db.last_backup_set(true).unwrap().unwrap();
        assert_eq!(last.name, "set1");
        assert!(last.completed);
        assert!(last.end_time.is_some());
        assert!(last.bytes_received > 0);

        // both names of the linked inode resolve to the same checksum
        let set = last.set_id;
        let a = db.get_file_info_by_inode(inode_of(&h.src.join("a")), set).unwrap().unwrap();
        assert!(a.checksum.is_some());
        db.close(true).unwrap();
    }

    // --- set 2: rename without content change; nothing new lands ---
    std::fs::rename(h.src.join("solo"), h.src.join("solo2")).unwrap();
    let blobs_before = h.blob_count();
    let stats = h.backup("set2", false);
    assert_eq!(stats.new_files, 0, "rename resolves via similar lookup");
    assert_eq!(stats.delta_files, 0);
    assert_eq!(h.blob_count(), blobs_before, "no new blobs for a rename");
    {
        let db = h.db();
        let set = db.last_backup_set(true).unwrap().unwrap().set_id;
        let solo = db
            .get_file_info_by_inode(inode_of(&h.src.join("solo2")), set)
            .unwrap()
            .expect("renamed file present in new set");
        assert!(solo.checksum.is_some(), "old content was attached to the new name");
        db.close(true).unwrap();
    }

    // --- sets 3..4: appends become deltas until the chain limit ---
    let b_inode = inode_of(&h.src.join("b"));
    let mut contents = pseudo(1_048_576, 2);
    let mut expected_chain = 0i64;
    let mut prior_checksum = None;
    for (i, set_name) in ["set3", "set4"].iter().enumerate() {
        contents.extend(pseudo(65_536, 10 + i as u32));
        std::fs::write(h.src.join("b"), &contents).unwrap();
        let stats = h.backup(set_name, false);
        assert_eq!(stats.delta_files, 1, "{set_name}: append travels as a delta");
        assert_eq!(stats.new_files, 0);
        expected_chain += 1;

        let db = h.db();
        let set = db.last_backup_set(true).unwrap().unwrap().set_id;
        let b = db.get_file_info_by_inode(b_inode, set).unwrap().unwrap();
        let ck = b.checksum.clone().unwrap();
        assert_eq!(db.get_chain_length(&ck).unwrap(), Some(expected_chain), "{set_name}");
        if let Some(prev) = prior_checksum.replace(ck.clone()) {
            assert_eq!(b.basis.as_deref(), Some(prev.as_str()));
            assert!(h.store().exists(&prev), "the basis blob stays on disk");
        }
        db.close(true).unwrap();
    }

    // --- set 5: chain is at the limit; the next change is a full rewrite ---
    contents.extend(pseudo(65_536, 42));
    std::fs::write(h.src.join("b"), &contents).unwrap();
    let stats = h.backup("set5", false);
    assert_eq!(stats.new_files, 1, "refresh, not another delta");
    assert_eq!(stats.delta_files, 0);
    {
        let db = h.db();
        let set = db.last_backup_set(true).unwrap().unwrap().set_id;
        let b = db.get_file_info_by_inode(b_inode, set).unwrap().unwrap();
        assert_eq!(db.get_chain_length(&b.checksum.unwrap()).unwrap(), Some(0));
        db.close(true).unwrap();
    }

    // --- set 6: an unchanged tree makes one set row and nothing else ---
    let blobs_before = h.blob_count();
    let sets_before = {
        let db = h.db();
        let n = db.list_backup_sets().unwrap().len();
        db.close(true).unwrap();
        n
    };
    let stats = h.backup("set6", false);
    assert_eq!(stats.new_files, 0);
    assert_eq!(stats.delta_files, 0);
    assert!(stats.cloned_dirs >= 1, "unchanged directories clone");
    assert_eq!(h.blob_count(), blobs_before, "idempotent: zero new blobs");
    {
        let db = h.db();
        assert_eq!(db.list_backup_sets().unwrap().len(), sets_before + 1);
        db.close(true).unwrap();
    }

    // --- purge everything but the last two sets; sweep the leftovers ---
    {
        let mut db = h.db();
        let store = h.store();
        let sets = db.list_backup_sets().unwrap();
        let cutoff_set = sets[sets.len() - 2].set_id;
        let (files, purged_sets) = db
            .purge_sets(100, strata_core::ids::now_secs() + 1.0, Some(cutoff_set))
            .unwrap();
        assert!(purged_sets >= 4);
        assert!(files > 0);
        let sweep = backend::reclaim::remove_orphans(&mut db, &store).unwrap();
        assert!(sweep.count >= 2, "old delta chain blobs are reclaimed");
        assert!(sweep.bytes > 0);

        // purge of an already purged range is a no-op
        let (files2, sets2) = db
            .purge_sets(100, strata_core::ids::now_secs() + 1.0, Some(cutoff_set))
            .unwrap();
        assert_eq!((files2, sets2), (0, 0));

        // invariant: every surviving sized record is backed by a blob
        for (ck, _) in store.enumerate().unwrap() {
            assert!(db.get_checksum_info(&ck).unwrap().is_some(), "{ck} has a record");
        }
        db.commit().unwrap();
        db.close(true).unwrap();
    }

    // the surviving sets still resolve files
    {
        let db = h.db();
        let last = db.last_backup_set(true).unwrap().unwrap();
        let b = db.get_file_info_by_inode(b_inode, last.set_id).unwrap().unwrap();
        assert!(b.checksum.is_some());
        db.close(true).unwrap();
    }
}

#[test]
fn create_twice_is_refused() {
    let h = Harness::new();
    std::fs::write(h.src.join("f"), b"data").unwrap();
    h.backup("first", true);

    std::thread::sleep(Duration::from_millis(300));
    let mut cfg = WalkerConfig::new(&h.addr, "alice", vec![h.src.clone()]);
    cfg.password = Some(PASSWORD.to_string());
    cfg.crypto_scheme = Some(3);
    cfg.create = true;
    cfg.name = Some("again".to_string());
    let err = run_backup(&cfg).unwrap_err();
    assert!(err.to_string().contains("exists"), "got: {err}");
}

#[test]
fn wrong_password_fails_authentication() {
    let h = Harness::new();
    std::fs::write(h.src.join("f"), b"data").unwrap();
    h.backup("first", true);

    std::thread::sleep(Duration::from_millis(300));
    let mut cfg = WalkerConfig::new(&h.addr, "alice", vec![h.src.clone()]);
    cfg.password = Some("not-the-password".to_string());
    cfg.name = Some("second".to_string());
    let err = run_backup(&cfg).unwrap_err();
    assert!(
        matches!(err, strata_core::Error::AuthFailed(_)),
        "got: {err}"
    );
}
