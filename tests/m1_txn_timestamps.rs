//! Tests for M1: Transactions and Timestamps
//! Covers TC-1.1 through TC-1.7
//!
//! Run individual tests with:
//! cargo test tc_1_1 -- --nocapture
//! cargo test m1_txn_timestamps -- --nocapture

use lapis::{
    BeginConfig, CommitConfig, EngineConfig, IsolationLevel, LapisDB, LapisError, Modify, ModifyEntry, TableConfig,
    TimestampConfig, TimestampQuery,
};
use tempfile::TempDir;

fn setup_db() -> (LapisDB, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::default().eviction_threads(0).hs_cleanup_interval_ms(0);
    let db = LapisDB::open(dir.path(), config).unwrap();
    db.create_table("t", TableConfig::default()).unwrap();
    (db, dir)
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

mod tc_1_1_begin_commit_rollback {
    use super::*;

    #[test]
    fn test_commit_makes_writes_visible() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.insert("t", b"a", b"1").unwrap();
        // Own writes are visible before commit
        assert_eq!(s.get("t", b"a").unwrap(), Some(b"1".to_vec()));
        s.commit(&CommitConfig::default()).unwrap();

        let mut reader = db.session();
        assert_eq!(reader.get("t", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.stats().txn_commit, 1);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.insert("t", b"a", b"1").unwrap();
        s.rollback().unwrap();
        assert!(!s.in_transaction());
        assert_eq!(s.get("t", b"a").unwrap(), None);
    }

    #[test]
    fn test_dropped_session_rolls_back() {
        let (db, _dir) = setup_db();
        {
            let mut s = db.session();
            s.begin(&BeginConfig::default()).unwrap();
            s.insert("t", b"a", b"1").unwrap();
        }
        assert_eq!(db.session().get("t", b"a").unwrap(), None);
        assert_eq!(db.stats().txn_rollback, 1);
    }

    #[test]
    fn test_autocommit_and_lifecycle_errors() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        s.insert("t", b"k", b"v").unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"v".to_vec()));

        assert!(matches!(s.commit(&CommitConfig::default()), Err(LapisError::InvalidArgument(_))));
        assert!(matches!(s.rollback(), Err(LapisError::InvalidArgument(_))));

        s.begin(&BeginConfig::default()).unwrap();
        assert!(s.begin(&BeginConfig::default()).is_err());
        s.rollback().unwrap();

        assert!(matches!(s.get("missing", b"k"), Err(LapisError::NotFound(_))));
    }
}

mod tc_1_2_global_timestamps {
    use super::*;

    #[test]
    fn test_oldest_and_stable_move_forward_only() {
        let (db, _dir) = setup_db();
        db.set_timestamp(&TimestampConfig::default().oldest(10).stable(20)).unwrap();
        assert_eq!(db.query_timestamp(TimestampQuery::Oldest), 10);
        assert_eq!(db.query_timestamp(TimestampQuery::Stable), 20);

        db.set_timestamp(&TimestampConfig::default().stable(15)).unwrap();
        assert_eq!(db.query_timestamp(TimestampQuery::Stable), 20);

        let err = db.set_timestamp(&TimestampConfig::default().oldest(30)).unwrap_err();
        assert!(matches!(err, LapisError::InvalidArgument(_)));
        assert_eq!(db.query_timestamp(TimestampQuery::Oldest), 10);

        assert!(db.set_timestamp(&TimestampConfig::default().commit(5)).is_err());
    }

    #[test]
    fn test_commit_at_or_before_stable_is_rejected() {
        let (db, _dir) = setup_db();
        db.set_timestamp(&TimestampConfig::default().stable(20)).unwrap();

        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.insert("t", b"k", b"late").unwrap();
        let err = s.commit(&CommitConfig::default().commit_timestamp(20)).unwrap_err();
        assert!(matches!(err, LapisError::InvalidArgument(_)));
        assert!(!s.in_transaction());
        assert_eq!(s.get("t", b"k").unwrap(), None);
    }

    #[test]
    fn test_all_durable_follows_commits() {
        let (db, _dir) = setup_db();
        put_at(&db, b"k", b"v", 25);
        assert_eq!(db.query_timestamp(TimestampQuery::AllDurable), 25);
        put_at(&db, b"j", b"v", 30);
        assert_eq!(db.query_timestamp(TimestampQuery::AllDurable), 30);
    }

    #[test]
    fn test_timestamp_query_names() {
        assert_eq!(TimestampQuery::from_str("stable_timestamp").unwrap(), TimestampQuery::Stable);
        assert_eq!(TimestampQuery::from_str("all_durable").unwrap(), TimestampQuery::AllDurable);
        assert!(TimestampQuery::from_str("bogus").is_err());
    }
}

mod tc_1_3_read_timestamps {
    use super::*;

    #[test]
    fn test_read_timestamp_selects_version() {
        let (db, _dir) = setup_db();
        put_at(&db, b"k", b"v10", 10);
        put_at(&db, b"k", b"v20", 20);

        assert_eq!(get_at(&db, b"k", 5), None);
        assert_eq!(get_at(&db, b"k", 10), Some(b"v10".to_vec()));
        assert_eq!(get_at(&db, b"k", 19), Some(b"v10".to_vec()));
        assert_eq!(get_at(&db, b"k", 20), Some(b"v20".to_vec()));
        assert_eq!(db.session().get("t", b"k").unwrap(), Some(b"v20".to_vec()));
    }

    #[test]
    fn test_read_before_oldest() {
        let (db, _dir) = setup_db();
        db.set_timestamp(&TimestampConfig::default().oldest(10).stable(10)).unwrap();
        let mut s = db.session();
        assert!(matches!(
            s.begin(&BeginConfig::default().read_timestamp(5)),
            Err(LapisError::InvalidArgument(_))
        ));
        s.begin(&BeginConfig::default().read_timestamp(5).round_to_oldest(true)).unwrap();
        s.rollback().unwrap();
    }

    #[test]
    fn test_read_timestamp_set_once() {
        let (db, _dir) = setup_db();
        put_at(&db, b"k", b"v10", 10);
        put_at(&db, b"k", b"v20", 20);

        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.timestamp_transaction(&TimestampConfig::default().read(15)).unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"v10".to_vec()));
        assert!(s.timestamp_transaction(&TimestampConfig::default().read(18)).is_err());
        assert!(s.timestamp_transaction(&TimestampConfig::default().stable(18)).is_err());
        s.rollback().unwrap();
    }

    #[test]
    fn test_commit_timestamp_set_on_running_transaction() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.insert("t", b"k", b"v").unwrap();
        s.timestamp_transaction(&TimestampConfig::default().commit(30)).unwrap();
        s.commit(&CommitConfig::default()).unwrap();

        assert_eq!(get_at(&db, b"k", 29), None);
        assert_eq!(get_at(&db, b"k", 30), Some(b"v".to_vec()));
    }
}

mod tc_1_4_prepared_transactions {
    use super::*;

    #[test]
    fn test_prepared_update_blocks_readers_at_or_after_prepare() {
        let (db, _dir) = setup_db();
        put_at(&db, b"k", b"v1", 10);

        let mut writer = db.session();
        writer.begin(&BeginConfig::default()).unwrap();
        writer.insert("t", b"k", b"v2").unwrap();
        writer.prepare(20).unwrap();

        let mut reader = db.session();
        reader.begin(&BeginConfig::default().read_timestamp(25)).unwrap();
        assert!(matches!(reader.get("t", b"k"), Err(LapisError::PreparedConflict)));
        reader.rollback().unwrap();
        assert_eq!(get_at(&db, b"k", 15), Some(b"v1".to_vec()));
        assert!(db.stats().prepared_conflict >= 1);

        writer
            .commit(&CommitConfig::default().commit_timestamp(22).durable_timestamp(22))
            .unwrap();
        assert_eq!(get_at(&db, b"k", 21), Some(b"v1".to_vec()));
        assert_eq!(get_at(&db, b"k", 25), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_prepared_transaction_rules() {
        let (db, _dir) = setup_db();
        db.set_timestamp(&TimestampConfig::default().stable(10)).unwrap();

        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.insert("t", b"k", b"v").unwrap();
        assert!(matches!(s.prepare(10), Err(LapisError::InvalidArgument(_))));
        assert!(s.in_transaction());

        s.prepare(20).unwrap();
        assert!(s.insert("t", b"j", b"v").is_err());
        assert!(s.prepare(21).is_err());
        // Durable timestamp is required
        assert!(s.commit(&CommitConfig::default().commit_timestamp(25)).is_err());
        assert!(!s.in_transaction());
        assert_eq!(db.session().get("t", b"k").unwrap(), None);
    }

    #[test]
    fn test_write_over_prepared_dooms_transaction() {
        let (db, _dir) = setup_db();
        put_at(&db, b"k", b"v1", 10);
        let mut writer = db.session();
        writer.begin(&BeginConfig::default()).unwrap();
        writer.insert("t", b"k", b"v2").unwrap();
        writer.prepare(20).unwrap();

        let mut other = db.session();
        other.begin(&BeginConfig::default().read_timestamp(25)).unwrap();
        assert!(matches!(other.remove("t", b"k"), Err(LapisError::PreparedConflict)));
        assert!(matches!(
            other.commit(&CommitConfig::default().commit_timestamp(30)),
            Err(LapisError::RollbackConflict { .. })
        ));
        writer.rollback().unwrap();
        assert_eq!(get_at(&db, b"k", 30), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_prepared_rollback() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.insert("t", b"k", b"v").unwrap();
        s.timestamp_transaction(&TimestampConfig::default().prepare(15)).unwrap();
        s.prepare(0).unwrap();
        s.rollback().unwrap();
        assert_eq!(get_at(&db, b"k", 20), None);
    }
}

mod tc_1_5_write_conflicts {
    use super::*;

    #[test]
    fn test_second_committer_conflicts() {
        let (db, _dir) = setup_db();
        let mut a = db.session();
        let mut b = db.session();
        a.begin(&BeginConfig::default()).unwrap();
        b.begin(&BeginConfig::default()).unwrap();
        a.insert("t", b"k", b"from-a").unwrap();
        b.insert("t", b"k", b"from-b").unwrap();
        a.commit(&CommitConfig::default()).unwrap();

        let err = b.commit(&CommitConfig::default()).unwrap_err();
        assert!(matches!(err, LapisError::RollbackConflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(db.session().get("t", b"k").unwrap(), Some(b"from-a".to_vec()));
        assert_eq!(db.stats().txn_conflict, 1);
    }

    #[test]
    fn test_write_over_commit_outside_snapshot() {
        let (db, _dir) = setup_db();
        let mut a = db.session();
        a.begin(&BeginConfig::default()).unwrap();

        db.session().insert("t", b"k", b"other").unwrap();

        a.insert("t", b"k", b"mine").unwrap();
        assert!(matches!(
            a.commit(&CommitConfig::default()),
            Err(LapisError::RollbackConflict { .. })
        ));
        assert_eq!(db.session().get("t", b"k").unwrap(), Some(b"other".to_vec()));
    }

    #[test]
    fn test_commit_older_than_replaced_version() {
        let (db, _dir) = setup_db();
        put_at(&db, b"k", b"v20", 20);

        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        s.insert("t", b"k", b"v15").unwrap();
        let err = s.commit(&CommitConfig::default().commit_timestamp(15)).unwrap_err();
        assert!(matches!(err, LapisError::InvalidArgument(_)));
        assert_eq!(db.session().get("t", b"k").unwrap(), Some(b"v20".to_vec()));
    }

    #[test]
    fn test_disjoint_keys_do_not_conflict() {
        let (db, _dir) = setup_db();
        let mut a = db.session();
        let mut b = db.session();
        a.begin(&BeginConfig::default()).unwrap();
        b.begin(&BeginConfig::default()).unwrap();
        a.insert("t", b"a", b"1").unwrap();
        b.insert("t", b"b", b"2").unwrap();
        a.commit(&CommitConfig::default()).unwrap();
        b.commit(&CommitConfig::default()).unwrap();
        let mut r = db.session();
        assert_eq!(r.get("t", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(r.get("t", b"b").unwrap(), Some(b"2".to_vec()));
    }
}

mod tc_1_6_isolation_levels {
    use super::*;

    #[test]
    fn test_snapshot_is_repeatable() {
        let (db, _dir) = setup_db();
        db.session().insert("t", b"k", b"old").unwrap();

        let mut s = db.session();
        s.begin(&BeginConfig::default()).unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"old".to_vec()));
        db.session().insert("t", b"k", b"new").unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"old".to_vec()));
        s.rollback().unwrap();
    }

    #[test]
    fn test_read_committed_sees_later_commits() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        s.begin(&BeginConfig::default().isolation(IsolationLevel::ReadCommitted))
            .unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), None);
        db.session().insert("t", b"k", b"v").unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"v".to_vec()));
        s.rollback().unwrap();
    }

    #[test]
    fn test_read_uncommitted_sees_running_writers() {
        let (db, _dir) = setup_db();
        let mut w = db.session();
        w.begin(&BeginConfig::default()).unwrap();
        w.insert("t", b"k", b"dirty").unwrap();

        let mut r = db.session();
        r.begin(&BeginConfig::default().isolation(IsolationLevel::ReadUncommitted))
            .unwrap();
        assert_eq!(r.get("t", b"k").unwrap(), Some(b"dirty".to_vec()));
        r.rollback().unwrap();

        assert_eq!(db.session().get("t", b"k").unwrap(), None);
        w.rollback().unwrap();
    }
}

mod tc_1_7_remove_and_modify {
    use super::*;

    #[test]
    fn test_remove() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        assert!(matches!(s.remove("t", b"k"), Err(LapisError::NotFound(_))));
        s.insert("t", b"k", b"v").unwrap();
        s.remove("t", b"k").unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), None);
        assert!(matches!(s.remove("t", b"k"), Err(LapisError::NotFound(_))));
    }

    #[test]
    fn test_modify_applies_partial_updates() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        assert!(matches!(
            s.modify("t", b"k", Modify::new([ModifyEntry::new(0, 1, b"x".to_vec())])),
            Err(LapisError::NotFound(_))
        ));

        s.insert("t", b"k", b"hello world").unwrap();
        s.modify("t", b"k", Modify::new([ModifyEntry::new(0, 5, b"HELLO".to_vec())]))
            .unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"HELLO world".to_vec()));

        s.begin(&BeginConfig::default()).unwrap();
        s.modify("t", b"k", Modify::new([ModifyEntry::new(6, 5, b"there".to_vec())]))
            .unwrap();
        s.modify("t", b"k", Modify::new([ModifyEntry::new(11, 0, b"!".to_vec())]))
            .unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"HELLO there!".to_vec()));
        s.commit(&CommitConfig::default()).unwrap();
        assert_eq!(db.session().get("t", b"k").unwrap(), Some(b"HELLO there!".to_vec()));
    }

    #[test]
    fn test_modify_with_invalid_range_is_rejected() {
        let (db, _dir) = setup_db();
        let mut s = db.session();
        s.insert("t", b"k", b"abc").unwrap();
        assert!(matches!(
            s.modify("t", b"k", Modify::new([ModifyEntry::new(1, usize::MAX, b"X".to_vec())])),
            Err(LapisError::InvalidArgument(_))
        ));
        assert!(matches!(
            s.modify("t", b"k", Modify::new([ModifyEntry::new(usize::MAX, 0, b"X".to_vec())])),
            Err(LapisError::InvalidArgument(_))
        ));
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"abc".to_vec()));

        db.evict_all().unwrap();
        assert_eq!(s.get("t", b"k").unwrap(), Some(b"abc".to_vec()));
    }
}
