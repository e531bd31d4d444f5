//! # Snapshot Isolation Tests
//!
//! Readers pin the snapshot they began on. These tests check that writers
//! never leak uncommitted or later-committed data into an older snapshot,
//! that concurrent readers each see a consistent prefix of the commit
//! history, and that the writer lock behaves as configured.
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test snapshots --release -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tempfile::tempdir;
use turkv::{
    DatabaseOptions, Environment, ErrorKind, Transaction, TxnState, WriteFlags,
};

fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_module("turkv", log::LevelFilter::Debug)
        .try_init();
}

fn open_env(path: &std::path::Path) -> Environment {
    init_logging();
    Environment::builder()
        .page_size(4096)
        .map_size(64 * 1024 * 1024)
        .open(path)
        .unwrap()
}

fn put_one(env: &Environment, key: &[u8], value: &[u8]) {
    let mut txn = env.begin_write().unwrap();
    let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
    txn.put(&db, key, value, WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

mod isolation {
    use super::*;

    #[test]
    fn reader_never_sees_later_commit() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        put_one(&env, b"k", b"old");

        let reader = env.begin_read().unwrap();
        let db = reader.open_database(None, DatabaseOptions::new()).unwrap();

        let mut writer = env.begin_write().unwrap();
        writer.put(&db, b"k", b"new", WriteFlags::empty()).unwrap();
        writer.put(&db, b"extra", b"x", WriteFlags::empty()).unwrap();
        assert_eq!(reader.get(&db, b"k").unwrap(), Some(&b"old"[..]));
        writer.commit().unwrap();

        assert_eq!(
            reader.get(&db, b"k").unwrap(),
            Some(&b"old"[..]),
            "old snapshot SHOULD keep its value after the writer commits"
        );
        assert_eq!(reader.get(&db, b"extra").unwrap(), None);

        let fresh = env.begin_read().unwrap();
        assert_eq!(fresh.get(&db, b"k").unwrap(), Some(&b"new"[..]));
        assert_eq!(fresh.id(), reader.id() + 1);
    }

    #[test]
    fn old_snapshot_survives_heavy_rewrites() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        for i in 0u32..1000 {
            txn.put(&db, &i.to_be_bytes(), &i.to_le_bytes(), WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        let reader = env.begin_read().unwrap();

        for round in 0u32..10 {
            let mut txn = env.begin_write().unwrap();
            for i in 0u32..1000 {
                if i % 3 == 0 {
                    txn.delete(&db, &i.to_be_bytes(), None).unwrap();
                } else {
                    txn.put(&db, &i.to_be_bytes(), &round.to_le_bytes(), WriteFlags::empty())
                        .unwrap();
                }
            }
            txn.commit().unwrap();
        }

        let mut cursor = reader.cursor(&db).unwrap();
        let mut expected = 0u32;
        while let Some((key, value)) = cursor.next(&reader).unwrap() {
            assert_eq!(key, expected.to_be_bytes());
            assert_eq!(value, expected.to_le_bytes(), "pinned pages SHOULD not be reused");
            expected += 1;
        }
        assert_eq!(expected, 1000);
    }

    #[test]
    fn aborted_writer_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        put_one(&env, b"k", b"v");
        let before = env.info();

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"k", b"changed", WriteFlags::empty()).unwrap();
        txn.put(&db, b"other", b"x", WriteFlags::empty()).unwrap();
        drop(txn);

        let txn = env.begin_read().unwrap();
        assert_eq!(txn.get(&db, b"k").unwrap(), Some(&b"v"[..]));
        assert_eq!(txn.get(&db, b"other").unwrap(), None);
        assert_eq!(env.info().last_txn_id, before.last_txn_id);
    }

    #[test]
    fn empty_commit_keeps_snapshot_id() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        put_one(&env, b"k", b"v");

        let txn = env.begin_write().unwrap();
        assert_eq!(txn.state(), TxnState::Active);
        let id = txn.commit().unwrap();

        assert_eq!(id, 1);
        assert_eq!(env.info().last_txn_id, 1);
    }
}

mod concurrency {
    use super::*;

    const KEYS_PER_TXN: u64 = 50;
    const TXNS: u64 = 40;

    #[test]
    fn concurrent_readers_count_committed_prefix() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let done = AtomicBool::new(false);

        thread::scope(|scope| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut checked = 0u32;
                        loop {
                            let finished = done.load(Ordering::Acquire);
                            let txn = env.begin_read().unwrap();
                            let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
                            let entries = txn.stat(&db).unwrap().entries;
                            assert_eq!(
                                entries,
                                txn.id() * KEYS_PER_TXN,
                                "snapshot {} SHOULD hold exactly the keys committed before it",
                                txn.id()
                            );

                            let mut cursor = txn.cursor(&db).unwrap();
                            let mut walked = 0u64;
                            while cursor.next(&txn).unwrap().is_some() {
                                walked += 1;
                            }
                            assert_eq!(walked, entries);
                            checked += 1;
                            if finished {
                                break;
                            }
                        }
                        checked
                    })
                })
                .collect();

            for t in 0..TXNS {
                let mut txn = env.begin_write().unwrap();
                let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
                for k in 0..KEYS_PER_TXN {
                    let key = (t * KEYS_PER_TXN + k).to_be_bytes();
                    txn.put(&db, &key, &[t as u8; 100], WriteFlags::empty()).unwrap();
                }
                txn.commit().unwrap();
            }
            done.store(true, Ordering::Release);

            for reader in readers {
                assert!(reader.join().unwrap() > 0);
            }
        });

        assert_eq!(env.stat().unwrap().entries, TXNS * KEYS_PER_TXN);
        assert_eq!(env.info().num_readers, 0, "every reader slot SHOULD be released");
    }

    #[test]
    fn reader_table_limit_is_enforced() {
        let dir = tempdir().unwrap();
        let env = Environment::builder()
            .page_size(4096)
            .map_size(1 << 20)
            .max_readers(2)
            .open(dir.path())
            .unwrap();

        let first = env.begin_read().unwrap();
        let _second = env.begin_read().unwrap();
        assert_eq!(env.begin_read().unwrap_err().kind(), ErrorKind::ReadersFull);

        drop(first);
        assert!(env.begin_read().is_ok(), "a released slot SHOULD be reusable");
    }

    #[test]
    fn blocked_writer_proceeds_after_commit() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        thread::scope(|scope| {
            let mut txn = env.begin_write().unwrap();
            let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
            txn.put(&db, b"first", b"1", WriteFlags::empty()).unwrap();

            let waiter = scope.spawn(|| {
                let mut txn = env.begin_write().unwrap();
                let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
                let seen = txn.get(&db, b"first").unwrap().map(<[u8]>::to_vec);
                txn.put(&db, b"second", b"2", WriteFlags::empty()).unwrap();
                txn.commit().unwrap();
                seen
            });

            txn.commit().unwrap();
            assert_eq!(
                waiter.join().unwrap(),
                Some(b"1".to_vec()),
                "the waiting writer SHOULD start from the committed state"
            );
        });

        assert_eq!(env.stat().unwrap().entries, 2);
    }
}

mod reset_renew {
    use super::*;

    #[test]
    fn renewed_reader_sees_new_snapshot() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        put_one(&env, b"k", b"v1");

        let txn = env.begin_read().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        assert_eq!(txn.get(&db, b"k").unwrap(), Some(&b"v1"[..]));

        let inactive = txn.reset();
        assert_eq!(env.info().num_readers, 0);
        put_one(&env, b"k", b"v2");

        let txn = inactive.renew().unwrap();
        assert_eq!(txn.get(&db, b"k").unwrap(), Some(&b"v2"[..]));
    }

    #[test]
    fn cursor_from_reset_transaction_is_stale_until_renewed() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        put_one(&env, b"a", b"1");

        let txn = env.begin_read().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        let mut cursor = txn.cursor(&db).unwrap();
        cursor.first(&txn).unwrap();

        let txn = txn.reset().renew().unwrap();
        assert_eq!(cursor.next(&txn).unwrap_err().kind(), ErrorKind::StaleCursor);

        cursor.renew(&txn).unwrap();
        assert_eq!(cursor.first(&txn).unwrap(), Some((&b"a"[..], &b"1"[..])));
    }
}
