//! Tests for M6: Rollback to Stable
//! Covers TC-6.1 through TC-6.6
//!
//! Run individual tests with:
//! cargo test tc_6_1 -- --nocapture
//! cargo test m6_rollback_to_stable -- --nocapture

use lapis::{
    BeginConfig, CommitConfig, EngineConfig, LapisDB, LapisError, RtsChecker, RtsConfig, RtsEvent, TableConfig,
    TimestampConfig, WalConfig, WalMode,
};
use tempfile::TempDir;

fn config() -> EngineConfig {
    EngineConfig::default().eviction_threads(0).hs_cleanup_interval_ms(0)
}

fn setup_db() -> (LapisDB, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = LapisDB::open(dir.path(), config()).unwrap();
    db.create_table("t", TableConfig::default()).unwrap();
    (db, dir)
}

fn put_at(db: &LapisDB, table: &str, key: &[u8], value: &[u8], ts: u64) {
    let mut s = db.session();
    s.begin(&BeginConfig::default()).unwrap();
    s.insert(table, key, value).unwrap();
    s.commit(&CommitConfig::default().commit_timestamp(ts)).unwrap();
}

fn get_at(db: &LapisDB, table: &str, key: &[u8], ts: u64) -> Option<Vec<u8>> {
    let mut s = db.session();
    s.begin(&BeginConfig::default().read_timestamp(ts)).unwrap();
    let v = s.get(table, key).unwrap();
    s.rollback().unwrap();
    v
}

fn stable(db: &LapisDB, ts: u64) {
    db.set_timestamp(&TimestampConfig::default().stable(ts)).unwrap();
}

mod tc_6_1_in_memory_rollback {
    use super::*;

    #[test]
    fn test_unstable_updates_are_aborted() {
        let (db, _dir) = setup_db();
        put_at(&db, "t", b"k", b"v10", 10);
        put_at(&db, "t", b"k", b"v20", 20);
        put_at(&db, "t", b"k", b"v30", 30);
        stable(&db, 10);

        let report = db.rollback_to_stable(&RtsConfig::default()).unwrap();
        assert_eq!(report.stable, 10);
        assert_eq!(report.upd_aborted, 2);
        assert_eq!(report.trees_visited, 1);
        assert!(report.changed());
        assert_eq!(get_at(&db, "t", b"k", 30), Some(b"v10".to_vec()));
        assert_eq!(db.stats().rts_upd_aborted, 2);

        // Already at stable: nothing more to do
        let again = db.rollback_to_stable(&RtsConfig::default()).unwrap();
        assert!(!again.changed());
    }

    #[test]
    fn test_key_born_after_stable_disappears() {
        let (db, _dir) = setup_db();
        put_at(&db, "t", b"old", b"v", 10);
        put_at(&db, "t", b"new", b"v", 20);
        stable(&db, 15);

        db.rollback_to_stable(&RtsConfig::default()).unwrap();
        assert_eq!(get_at(&db, "t", b"old", 20), Some(b"v".to_vec()));
        assert_eq!(get_at(&db, "t", b"new", 20), None);
    }

    #[test]
    fn test_dryrun_changes_nothing() {
        let (db, _dir) = setup_db();
        put_at(&db, "t", b"k", b"v10", 10);
        put_at(&db, "t", b"k", b"v20", 20);
        stable(&db, 10);

        let report = db.rollback_to_stable(&RtsConfig::default().dryrun(true)).unwrap();
        assert!(report.dryrun);
        assert_eq!(report.upd_aborted, 1);
        assert_eq!(get_at(&db, "t", b"k", 20), Some(b"v20".to_vec()));

        let report = db.rollback_to_stable(&RtsConfig::default()).unwrap();
        assert_eq!(report.upd_aborted, 1);
        assert_eq!(get_at(&db, "t", b"k", 20), Some(b"v10".to_vec()));
    }

    #[test]
    fn test_requires_no_active_transactions() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        assert!(matches!(
            db.rollback_to_stable(&RtsConfig::default()),
            Err(LapisError::InvalidArgument(_))
        ));
        s.rollback().unwrap();
        db.rollback_to_stable(&RtsConfig::default()).unwrap();
    }
}

mod tc_6_2_on_disk_rollback {
    use super::*;

    #[test]
    fn test_on_disk_cell_restored_from_history() {
        let (db, _dir) = setup_db();
        put_at(&db, "t", b"k", b"v10", 10);
        put_at(&db, "t", b"k", b"v20", 20);
        put_at(&db, "t", b"j", b"v20", 20);
        db.evict_all().unwrap();
        assert_eq!(db.engine().hs.len(), 1);
        stable(&db, 10);

        let report = db.rollback_to_stable(&RtsConfig::default()).unwrap();
        assert_eq!(report.keys_restored, 1);
        assert_eq!(report.keys_removed, 1);
        assert_eq!(report.hs_removed, 1);
        assert!(report.pages_visited >= 1);

        assert_eq!(get_at(&db, "t", b"k", 20), Some(b"v10".to_vec()));
        assert_eq!(get_at(&db, "t", b"j", 20), None);
        assert!(db.engine().hs.is_empty());

        // The restored state survives another eviction
        db.evict_all().unwrap();
        assert_eq!(get_at(&db, "t", b"k", 20), Some(b"v10".to_vec()));
        assert_eq!(get_at(&db, "t", b"j", 20), None);
    }

    #[test]
    fn test_unstable_delete_is_undone() {
        let (db, _dir) = setup_db();
        put_at(&db, "t", b"k", b"v10", 10);
        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.remove("t", b"k").unwrap();
        s.commit(&CommitConfig::default().commit_timestamp(20)).unwrap();
        db.evict_all().unwrap();
        stable(&db, 15);

        let report = db.rollback_to_stable(&RtsConfig::default()).unwrap();
        assert_eq!(report.keys_restored, 1);
        assert_eq!(get_at(&db, "t", b"k", 20), Some(b"v10".to_vec()));
    }
}

mod tc_6_3_logged_tables {
    use super::*;

    fn setup_logged() -> (LapisDB, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = LapisDB::open(dir.path(), config().wal(WalConfig::new(WalMode::Sync))).unwrap();
        db.create_table("t", TableConfig::default()).unwrap();
        db.create_table("logged", TableConfig::default().logged(true)).unwrap();
        (db, dir)
    }

    #[test]
    fn test_logged_table_is_skipped() {
        let (db, _dir) = setup_logged();
        put_at(&db, "t", b"k", b"v20", 20);
        put_at(&db, "logged", b"k", b"v20", 20);
        stable(&db, 10);

        let report = db.rollback_to_stable(&RtsConfig::default()).unwrap();
        assert_eq!(report.trees_skipped_logged, 1);
        assert_eq!(get_at(&db, "t", b"k", 20), None);
        assert_eq!(get_at(&db, "logged", b"k", 20), Some(b"v20".to_vec()));
    }

    #[test]
    fn test_logged_table_replayed_after_crash() {
        let dir = TempDir::new().unwrap();
        {
            let db = LapisDB::open(dir.path(), config().wal(WalConfig::new(WalMode::Sync))).unwrap();
            db.create_table("t", TableConfig::default()).unwrap();
            db.create_table("logged", TableConfig::default().logged(true)).unwrap();
            db.session().insert("t", b"k", b"plain").unwrap();
            db.session().insert("logged", b"k", b"kept").unwrap();
            put_at(&db, "logged", b"j", b"kept-ts", 20);
            // Dropped without close
        }

        let db = LapisDB::open(dir.path(), config().wal(WalConfig::new(WalMode::Sync))).unwrap();
        let mut s = db.session();
        assert_eq!(s.get("t", b"k").unwrap(), None);
        assert_eq!(s.get("logged", b"k").unwrap(), Some(b"kept".to_vec()));
        assert_eq!(s.get("logged", b"j").unwrap(), Some(b"kept-ts".to_vec()));
        assert!(db.stats().wal_records_replayed >= 2);
    }
}

mod tc_6_4_event_trace {
    use super::*;

    #[test]
    fn test_trace_passes_checker() {
        let (db, _dir) = setup_db();
        db.create_table("untouched", TableConfig::default()).unwrap();
        put_at(&db, "t", b"k", b"v10", 10);
        put_at(&db, "t", b"k", b"v20", 20);
        db.evict_all().unwrap();
        put_at(&db, "t", b"k", b"v30", 30);
        stable(&db, 10);

        let report = db.rollback_to_stable(&RtsConfig::default()).unwrap();
        assert!(matches!(report.events.first(), Some(RtsEvent::Init { stable: 10 })));
        RtsChecker::check(false, &report.events).unwrap();
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, RtsEvent::UpdateAbort { start_ts: 30, .. })));

        let json = report.to_json();
        assert!(json.contains("\"upd_aborted\": 1"));
        assert!(json.contains("UpdateAbort"));
    }

    #[test]
    fn test_checker_rejects_reordered_trace() {
        let (db, _dir) = setup_db();
        put_at(&db, "t", b"k", b"v20", 20);
        stable(&db, 10);
        let report = db.rollback_to_stable(&RtsConfig::default()).unwrap();

        let mut events = report.events.clone();
        events.remove(0);
        assert!(RtsChecker::check(false, &events).is_err());
    }
}

mod tc_6_5_recovery_rollback {
    use super::*;
    use lapis::block::MemBlockManager;
    use lapis::wal::NoOpWAL;
    use lapis::CheckpointConfig;
    use std::sync::Arc;

    #[test]
    fn test_recovery_discards_versions_after_checkpoint_stable() {
        let block = Arc::new(MemBlockManager::new());
        let db = LapisDB::open_with(config(), block.clone(), Arc::new(NoOpWAL::new())).unwrap();
        db.create_table("t", TableConfig::default()).unwrap();
        put_at(&db, "t", b"k", b"v10", 10);
        put_at(&db, "t", b"k", b"v20", 20);
        stable(&db, 10);
        // Without timestamps the checkpoint writes v20 too
        db.checkpoint(&CheckpointConfig::default().use_timestamp(false)).unwrap();
        db.checkpoint(&CheckpointConfig::default()).unwrap();
        drop(db);

        let db = LapisDB::open_with(config(), block, Arc::new(NoOpWAL::new())).unwrap();
        assert_eq!(get_at(&db, "t", b"k", 20), Some(b"v10".to_vec()));
        assert!(db.stats().rts_runs >= 1);
    }
}

mod tc_6_6_commit_flush_failure {
    use super::*;
    use lapis::block::MemBlockManager;
    use lapis::wal::{LogRecord, Lsn, WriteAheadLog};
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    /// Accepts appends but fails every commit flush.
    #[derive(Default)]
    struct FailingFlushWAL {
        records: Mutex<Vec<LogRecord>>,
    }

    impl WriteAheadLog for FailingFlushWAL {
        fn append(&self, record: &LogRecord) -> io::Result<Lsn> {
            let mut records = self.records.lock();
            records.push(record.clone());
            Ok(records.len() as Lsn - 1)
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }

        fn flush_commit(&self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn replay_from(&self, _lsn: Lsn) -> io::Result<Vec<LogRecord>> {
            Ok(vec![])
        }

        fn truncate_before(&self, _lsn: Lsn) -> io::Result<()> {
            Ok(())
        }

        fn size_bytes(&self) -> u64 {
            0
        }

        fn current_lsn(&self) -> Lsn {
            self.records.lock().len() as Lsn
        }

        fn is_enabled(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_failed_flush_does_not_publish_commit() {
        let wal = Arc::new(FailingFlushWAL::default());
        let db = LapisDB::open_with(config(), Arc::new(MemBlockManager::new()), wal.clone()).unwrap();
        db.create_table("t", TableConfig::default()).unwrap();
        db.create_table("logged", TableConfig::default().logged(true)).unwrap();
        // Nothing is appended for unlogged tables, so nothing is flushed
        put_at(&db, "t", b"k", b"v10", 10);

        let mut reader = db.session();
        reader.begin(&BeginConfig::default()).unwrap();

        let before = db.stats();
        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.insert("logged", b"k", b"v20").unwrap();
        assert!(matches!(
            s.commit(&CommitConfig::default().commit_timestamp(20)),
            Err(LapisError::Panic(_))
        ));
        assert!(!s.in_transaction());
        assert_eq!(wal.records.lock().len(), 1);

        let after = db.stats();
        assert_eq!(after.txn_commit, before.txn_commit);
        assert_eq!(after.txn_rollback, before.txn_rollback + 1);
        assert!(matches!(reader.get("logged", b"k"), Err(LapisError::Panic(_))));
    }
}
