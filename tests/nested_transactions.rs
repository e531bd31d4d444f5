//! # Nested Transaction Tests
//!
//! Children of a write transaction: their changes merge into the parent on
//! commit and leave the parent exactly as it was on abort.

use std::path::Path;

use tempfile::tempdir;
use turkv::{DatabaseOptions, Environment, ErrorKind, Transaction, TxnState, WriteFlags};

fn open_env(path: &Path) -> Environment {
    Environment::builder()
        .page_size(4096)
        .map_size(8 * 1024 * 1024)
        .open(path)
        .unwrap()
}

mod abort {
    use super::*;

    #[test]
    fn child_abort_keeps_parent_writes() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"parent", b"1", WriteFlags::empty()).unwrap();

        let mut child = txn.begin_nested().unwrap();
        child.put(&db, b"child", b"2", WriteFlags::empty()).unwrap();
        child.put(&db, b"parent", b"overwritten", WriteFlags::empty()).unwrap();
        assert_eq!(child.get(&db, b"parent").unwrap(), Some(&b"overwritten"[..]));
        child.abort();

        assert_eq!(txn.get(&db, b"parent").unwrap(), Some(&b"1"[..]));
        assert_eq!(txn.get(&db, b"child").unwrap(), None);
        txn.commit().unwrap();

        let reader = env.begin_read().unwrap();
        assert_eq!(reader.get(&db, b"parent").unwrap(), Some(&b"1"[..]));
        assert_eq!(reader.get(&db, b"child").unwrap(), None);
        assert_eq!(reader.stat(&db).unwrap().entries, 1);
    }

    #[test]
    fn dropped_child_aborts() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        {
            let mut child = txn.begin_nested().unwrap();
            for i in 0..200u32 {
                child.put(&db, &i.to_be_bytes(), &[7u8; 100], WriteFlags::empty()).unwrap();
            }
        }

        assert_eq!(txn.stat(&db).unwrap().entries, 0);
        txn.put(&db, b"after", b"ok", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let reader = env.begin_read().unwrap();
        assert_eq!(reader.stat(&db).unwrap().entries, 1);
    }

    #[test]
    fn database_created_in_aborted_child_is_gone() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let kept = txn.create_database(Some("kept"), DatabaseOptions::new()).unwrap();
        let mut child = txn.begin_nested().unwrap();
        let temp = child.create_database(Some("temp"), DatabaseOptions::new()).unwrap();
        child.put(&temp, b"k", b"v", WriteFlags::empty()).unwrap();
        child.rename_database(&kept, "renamed").unwrap();
        child.abort();

        assert_eq!(
            txn.open_database(Some("temp"), DatabaseOptions::new()).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(txn.get(&temp, b"k").is_err(), "the child's handle SHOULD be closed");
        txn.commit().unwrap();

        let reader = env.begin_read().unwrap();
        assert_eq!(reader.list_databases().unwrap(), ["kept"]);
    }

    #[test]
    fn failed_child_abort_reactivates_parent() {
        let dir = tempdir().unwrap();
        let env = Environment::builder()
            .page_size(4096)
            .map_size(64 * 1024)
            .growth_increment(4096)
            .open(dir.path())
            .unwrap();

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"small", b"v", WriteFlags::empty()).unwrap();

        let mut child = txn.begin_nested().unwrap();
        let big = vec![1u8; 3 * 4096];
        let err = (0..16u32)
            .find_map(|i| child.put(&db, &i.to_be_bytes(), &big, WriteFlags::empty()).err())
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::OutOfSpace);
        assert_eq!(child.state(), TxnState::Failed);
        child.abort();

        assert_eq!(txn.state(), TxnState::Active);
        txn.commit().unwrap();
        let reader = env.begin_read().unwrap();
        assert_eq!(reader.get(&db, b"small").unwrap(), Some(&b"v"[..]));
        assert_eq!(reader.stat(&db).unwrap().entries, 1);
    }
}

mod commit {
    use super::*;

    #[test]
    fn child_commit_is_visible_to_parent_and_persists() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        let mut child = txn.begin_nested().unwrap();
        child.put(&db, b"k", b"from child", WriteFlags::empty()).unwrap();
        child.commit().unwrap();

        assert_eq!(txn.get(&db, b"k").unwrap(), Some(&b"from child"[..]));
        let reader = env.begin_read().unwrap();
        assert_eq!(reader.get(&db, b"k").unwrap(), None, "SHOULD wait for the parent");
        drop(reader);
        txn.commit().unwrap();

        let reader = env.begin_read().unwrap();
        assert_eq!(reader.get(&db, b"k").unwrap(), Some(&b"from child"[..]));
    }

    #[test]
    fn committed_child_is_discarded_with_its_parent() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        let mut child = txn.begin_nested().unwrap();
        child.put(&db, b"k", b"v", WriteFlags::empty()).unwrap();
        child.commit().unwrap();
        txn.abort();

        let reader = env.begin_read().unwrap();
        assert_eq!(reader.get(&db, b"k").unwrap(), None);
    }

    #[test]
    fn grandchild_commit_rolls_back_with_child() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"a", b"1", WriteFlags::empty()).unwrap();
        {
            let mut child = txn.begin_nested().unwrap();
            child.put(&db, b"b", b"2", WriteFlags::empty()).unwrap();
            let mut grandchild = child.begin_nested().unwrap();
            grandchild.put(&db, b"c", b"3", WriteFlags::empty()).unwrap();
            grandchild.delete(&db, b"a", None).unwrap();
            grandchild.commit().unwrap();
            assert_eq!(child.get(&db, b"c").unwrap(), Some(&b"3"[..]));
            child.abort();
        }

        assert_eq!(txn.get(&db, b"a").unwrap(), Some(&b"1"[..]));
        assert_eq!(txn.get(&db, b"b").unwrap(), None);
        assert_eq!(txn.get(&db, b"c").unwrap(), None);
    }

    #[test]
    fn pages_freed_by_aborted_child_are_not_leaked() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let value = vec![9u8; 3 * 4096];

        for round in 0..30u32 {
            let mut txn = env.begin_write().unwrap();
            let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
            txn.put(&db, b"k", &value, WriteFlags::empty()).unwrap();
            let mut child = txn.begin_nested().unwrap();
            child.put(&db, &round.to_be_bytes(), &value, WriteFlags::empty()).unwrap();
            child.abort();
            txn.commit().unwrap();
        }

        assert!(
            env.info().last_page < 64,
            "aborted children SHOULD not grow the file, got {}",
            env.info().last_page
        );
    }
}
