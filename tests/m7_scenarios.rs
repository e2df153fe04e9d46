//! Tests for M7: End-to-end scenarios
//! Covers TC-7.1 through TC-7.4
//!
//! Run individual tests with:
//! cargo test tc_7_1 -- --nocapture
//! cargo test m7_scenarios -- --nocapture

use lapis::block::MemBlockManager;
use lapis::wal::NoOpWAL;
use lapis::{
    BeginConfig, CheckpointConfig, CommitConfig, EngineConfig, LapisDB, LapisError, TableConfig, TimestampConfig,
    TimestampQuery,
};
use std::sync::Arc;
use std::thread;

fn config() -> EngineConfig {
    EngineConfig::default().eviction_threads(0).hs_cleanup_interval_ms(0)
}

fn setup_db(block: &Arc<MemBlockManager>) -> LapisDB {
    let db = reopen(block);
    db.create_table("t", TableConfig::default()).unwrap();
    db
}

fn reopen(block: &Arc<MemBlockManager>) -> LapisDB {
    LapisDB::open_with(config(), block.clone(), Arc::new(NoOpWAL::new())).unwrap()
}

fn put_at(db: &LapisDB, key: &[u8], value: &[u8], ts: u64) {
    let mut s = db.session();
    s.begin(&BeginConfig::default()).unwrap();
    s.insert("t", key, value).unwrap();
    s.commit(&CommitConfig::default().commit_timestamp(ts)).unwrap();
}

fn get_at(db: &LapisDB, key: &[u8], ts: u64) -> Option<Vec<u8>> {
    let mut s = db.session();
    s.begin(&BeginConfig::default().read_timestamp(ts)).unwrap();
    let v = s.get("t", key).unwrap();
    s.rollback().unwrap();
    v
}

mod tc_7_1_crash_after_unstable_update {
    use super::*;

    #[test]
    fn test_unstable_update_lost_in_memory() {
        let block = Arc::new(MemBlockManager::new());
        let db = setup_db(&block);
        put_at(&db, b"K", b"old", 10);
        db.set_timestamp(&TimestampConfig::default().stable(10)).unwrap();
        db.checkpoint(&CheckpointConfig::default()).unwrap();
        put_at(&db, b"K", b"new", 20);
        drop(db);

        let db = reopen(&block);
        assert_eq!(db.query_timestamp(TimestampQuery::Stable), 10);
        assert_eq!(get_at(&db, b"K", 20), Some(b"old".to_vec()));
    }

    #[test]
    fn test_unstable_update_written_to_disk() {
        let block = Arc::new(MemBlockManager::new());
        let db = setup_db(&block);
        put_at(&db, b"K", b"old", 10);
        db.set_timestamp(&TimestampConfig::default().stable(10)).unwrap();
        db.checkpoint(&CheckpointConfig::default()).unwrap();
        put_at(&db, b"K", b"new", 20);
        db.evict_all().unwrap();
        // Without timestamps the unstable "new" reaches the checkpoint
        db.checkpoint(&CheckpointConfig::default().use_timestamp(false)).unwrap();
        drop(db);

        let db = reopen(&block);
        assert_eq!(db.query_timestamp(TimestampQuery::Stable), 10);
        assert_eq!(get_at(&db, b"K", 20), Some(b"old".to_vec()));
        assert!(db.stats().rts_keys_restored >= 1);
    }
}

mod tc_7_2_read_from_history {
    use super::*;

    #[test]
    fn test_old_version_served_by_history_store() {
        let db = LapisDB::open_in_memory(config()).unwrap();
        db.create_table("t", TableConfig::default()).unwrap();
        put_at(&db, b"K", b"V1", 10);
        put_at(&db, b"K", b"V2", 20);

        db.evict_all().unwrap();
        assert_eq!(db.engine().hs.len(), 1);
        assert_eq!(get_at(&db, b"K", 15), Some(b"V1".to_vec()));
        assert_eq!(get_at(&db, b"K", 20), Some(b"V2".to_vec()));
    }
}

mod tc_7_3_write_write_conflict {
    use super::*;

    #[test]
    fn test_second_committer_rolls_back() {
        let db = LapisDB::open_in_memory(config()).unwrap();
        db.create_table("t", TableConfig::default()).unwrap();
        put_at(&db, b"K", b"base", 5);

        for first_is_a in [true, false] {
            let mut a = db.session();
            let mut b = db.session();
            a.begin(&BeginConfig::default()).unwrap();
            b.begin(&BeginConfig::default()).unwrap();
            a.insert("t", b"K", b"A").unwrap();
            b.insert("t", b"K", b"B").unwrap();

            let (first, second, winner) = if first_is_a {
                (&mut a, &mut b, b"A")
            } else {
                (&mut b, &mut a, b"B")
            };
            first.commit(&CommitConfig::default()).unwrap();
            assert!(matches!(
                second.commit(&CommitConfig::default()),
                Err(LapisError::RollbackConflict { .. })
            ));
            assert!(!second.in_transaction());
            assert_eq!(db.session().get("t", b"K").unwrap(), Some(winner.to_vec()));
        }
    }
}

mod tc_7_4_concurrent_counters {
    use super::*;

    fn increment(db: &LapisDB) -> u32 {
        let mut s = db.session();
        let mut retries = 0;
        loop {
            s.begin(&BeginConfig::default()).unwrap();
            let current = s
                .get("t", b"counter")
                .unwrap()
                .map(|v| u32::from_be_bytes(v.try_into().unwrap()))
                .unwrap_or(0);
            s.insert("t", b"counter", &(current + 1).to_be_bytes()).unwrap();
            match s.commit(&CommitConfig::default()) {
                Ok(()) => return retries,
                Err(e) if e.is_retryable() => {
                    if s.in_transaction() {
                        s.rollback().unwrap();
                    }
                    retries += 1;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[test]
    fn test_no_lost_updates() {
        let db = Arc::new(LapisDB::open_in_memory(config()).unwrap());
        db.create_table("t", TableConfig::default()).unwrap();

        let threads = 4;
        let per_thread = 25;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || (0..per_thread).map(|_| increment(&db)).sum::<u32>())
            })
            .collect();
        let retries: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let value = db.session().get("t", b"counter").unwrap().unwrap();
        assert_eq!(u32::from_be_bytes(value.try_into().unwrap()), threads * per_thread);
        assert_eq!(db.stats().txn_conflict, retries as u64);
    }
}
