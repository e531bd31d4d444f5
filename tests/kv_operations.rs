//! # Key/Value Operation Tests
//!
//! End-to-end checks of the write path through the public API: puts,
//! overwrites, deletes, large values spilling into overflow pages, and the
//! free-list reuse that keeps a fixed map size sufficient.
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test kv_operations
//! ```

use std::collections::BTreeMap;

use tempfile::tempdir;
use turkv::{DatabaseOptions, Environment, ErrorKind, Transaction, WriteFlags};

fn open_env(path: &std::path::Path) -> Environment {
    Environment::builder()
        .page_size(4096)
        .map_size(16 * 1024 * 1024)
        .growth_increment(64 * 1024)
        .open(path)
        .unwrap()
}

/// Deterministic pseudo-random sequence for workload generation.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

mod last_writer_wins {
    use super::*;

    #[test]
    fn lookups_match_net_effect_of_committed_operations() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = Lcg(7);

        for round in 0..20 {
            let mut txn = env.begin_write().unwrap();
            let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
            for _ in 0..200 {
                let key = format!("key{:05}", rng.next() % 500).into_bytes();
                if rng.next() % 4 == 0 {
                    let removed = txn.delete(&db, &key, None).unwrap();
                    assert_eq!(removed, model.remove(&key).is_some());
                } else {
                    let value = format!("value-{round}-{}", rng.next()).into_bytes();
                    txn.put(&db, &key, &value, WriteFlags::empty()).unwrap();
                    model.insert(key, value);
                }
            }
            txn.commit().unwrap();
        }

        let txn = env.begin_read().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        for i in 0..500 {
            let key = format!("key{i:05}").into_bytes();
            assert_eq!(
                txn.get(&db, &key).unwrap(),
                model.get(&key).map(Vec::as_slice),
                "lookup of {:?} SHOULD reflect the last committed write",
                String::from_utf8_lossy(&key)
            );
        }
        assert_eq!(txn.stat(&db).unwrap().entries, model.len() as u64);
    }

    #[test]
    fn cursor_traversal_is_strictly_ascending() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let mut rng = Lcg(42);

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        for _ in 0..3000 {
            let key = (rng.next() as u32).to_be_bytes();
            txn.put(&db, &key, b"v", WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        let txn = env.begin_read().unwrap();
        let mut cursor = txn.cursor(&db).unwrap();
        let mut previous: Option<Vec<u8>> = None;
        let mut count = 0u64;
        while let Some((key, _)) = cursor.next(&txn).unwrap() {
            if let Some(prev) = &previous {
                assert!(prev.as_slice() < key, "keys SHOULD be strictly ascending");
            }
            previous = Some(key.to_vec());
            count += 1;
        }

        assert_eq!(count, txn.stat(&db).unwrap().entries);
    }

    #[test]
    fn overwrite_in_same_transaction_is_visible() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"k", b"first", WriteFlags::empty()).unwrap();
        txn.put(&db, b"k", b"second", WriteFlags::empty()).unwrap();

        assert_eq!(txn.get(&db, b"k").unwrap(), Some(&b"second"[..]));
        assert_eq!(txn.stat(&db).unwrap().entries, 1);
    }
}

mod values {
    use super::*;

    #[test]
    fn values_round_trip_from_empty_to_multi_page() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let sizes = [0usize, 1, 100, 1000, 2000, 2100, 4096, 3 * 4096 + 17, 40_000];

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        for (i, size) in sizes.iter().enumerate() {
            let value: Vec<u8> = (0..*size).map(|b| (b * 31 + i) as u8).collect();
            txn.put(&db, &[i as u8], &value, WriteFlags::empty()).unwrap();
            assert_eq!(txn.get(&db, &[i as u8]).unwrap(), Some(value.as_slice()));
        }
        txn.commit().unwrap();

        let txn = env.begin_read().unwrap();
        for (i, size) in sizes.iter().enumerate() {
            let value: Vec<u8> = (0..*size).map(|b| (b * 31 + i) as u8).collect();
            assert_eq!(
                txn.get(&db, &[i as u8]).unwrap(),
                Some(value.as_slice()),
                "value of {size} bytes SHOULD round-trip"
            );
        }
        assert!(txn.stat(&db).unwrap().overflow_pages > 0);
    }

    #[test]
    fn empty_key_is_valid() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"", b"empty", WriteFlags::empty()).unwrap();
        txn.put(&db, b"a", b"a", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let txn = env.begin_read().unwrap();
        let mut cursor = txn.cursor(&db).unwrap();
        assert_eq!(cursor.first(&txn).unwrap(), Some((&b""[..], &b"empty"[..])));
    }

    #[test]
    fn oversized_key_is_rejected_without_failing_txn() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let max = env.max_key_size();

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        let err = txn
            .put(&db, &vec![b'k'; max + 1], b"v", WriteFlags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyTooLarge);

        txn.put(&db, &vec![b'k'; max], b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let txn = env.begin_read().unwrap();
        assert_eq!(txn.get(&db, &vec![b'k'; max]).unwrap(), Some(&b"v"[..]));
    }
}

mod deletes {
    use super::*;

    #[test]
    fn deleting_missing_key_twice_is_not_an_error() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"present", b"v", WriteFlags::empty()).unwrap();

        assert!(!txn.delete(&db, b"absent", None).unwrap());
        assert!(!txn.delete(&db, b"absent", None).unwrap());
        assert!(txn.delete(&db, b"present", None).unwrap());
        assert!(!txn.delete(&db, b"present", None).unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn delete_everything_leaves_empty_tree() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        for i in 0u32..2000 {
            txn.put(&db, &i.to_be_bytes(), &[7u8; 64], WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        let mut txn = env.begin_write().unwrap();
        for i in (0u32..2000).rev() {
            assert!(txn.delete(&db, &i.to_be_bytes(), None).unwrap());
        }
        txn.commit().unwrap();

        let stat = env.stat().unwrap();
        assert_eq!(stat.entries, 0);
        assert_eq!(stat.total_pages(), 0, "an empty tree SHOULD own no pages");
    }

    #[test]
    fn two_page_values_inserted_and_deleted_fit_in_fixed_map() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let value = vec![0x5Au8; 2 * 4096];

        for key in 1u64..=100 {
            let mut txn = env.begin_write().unwrap();
            let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
            txn.put(&db, &key.to_be_bytes(), &value, WriteFlags::empty()).unwrap();
            assert!(txn.delete(&db, &key.to_be_bytes(), None).unwrap());
            txn.commit().unwrap();
        }

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        for key in 1u64..=100 {
            txn.put(&db, &key.to_be_bytes(), &value, WriteFlags::empty()).unwrap();
            txn.delete(&db, &key.to_be_bytes(), None).unwrap();
        }
        txn.commit().unwrap();

        assert_eq!(env.stat().unwrap().entries, 0);
    }

    #[test]
    fn churn_reuses_freed_pages() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());
        let value = vec![1u8; 3 * 4096];

        let mut high_water = Vec::new();
        for round in 0..40u32 {
            let mut txn = env.begin_write().unwrap();
            let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
            txn.put(&db, b"big", &value, WriteFlags::empty()).unwrap();
            txn.put(&db, &round.to_be_bytes(), b"small", WriteFlags::empty()).unwrap();
            txn.delete(&db, &round.to_be_bytes(), None).unwrap();
            txn.commit().unwrap();
            high_water.push(env.info().last_page);
        }

        let last = high_water.last().copied().unwrap();
        assert!(
            last < 64,
            "steady-state churn SHOULD reuse pages instead of growing: {high_water:?}"
        );
    }
}

mod flags {
    use super::*;

    #[test]
    fn no_overwrite_reports_existing_key() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"k", b"v1", WriteFlags::NO_OVERWRITE).unwrap();
        let err = txn.put(&db, b"k", b"v2", WriteFlags::NO_OVERWRITE).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::KeyExists);
        assert_eq!(txn.get(&db, b"k").unwrap(), Some(&b"v1"[..]));
        txn.commit().unwrap();
    }

    #[test]
    fn append_requires_ascending_keys() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        for i in 0u32..500 {
            txn.put(&db, &i.to_be_bytes(), b"v", WriteFlags::APPEND).unwrap();
        }
        let err = txn.put(&db, &10u32.to_be_bytes(), b"v", WriteFlags::APPEND).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::KeyExists);
        assert_eq!(txn.stat(&db).unwrap().entries, 500);
    }

    #[test]
    fn replace_returns_previous_value() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();

        assert_eq!(txn.replace(&db, b"k", b"one").unwrap(), None);
        assert_eq!(txn.replace(&db, b"k", b"two").unwrap(), Some(b"one".to_vec()));
        assert_eq!(txn.get(&db, b"k").unwrap(), Some(&b"two"[..]));
    }

    #[test]
    fn get_or_next_finds_successor() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.put(&db, b"b", b"2", WriteFlags::empty()).unwrap();
        txn.put(&db, b"d", b"4", WriteFlags::empty()).unwrap();

        assert_eq!(txn.get_or_next(&db, b"c").unwrap(), Some((&b"d"[..], &b"4"[..])));
        assert_eq!(txn.get_or_next(&db, b"b").unwrap(), Some((&b"b"[..], &b"2"[..])));
        assert_eq!(txn.get_or_next(&db, b"e").unwrap(), None);
    }
}

mod sequence {
    use super::*;

    #[test]
    fn sequence_persists_across_commits() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.create_database(Some("ids"), DatabaseOptions::new()).unwrap();
        assert_eq!(txn.get_sequence(&db, 5).unwrap(), 0);
        assert_eq!(txn.get_sequence(&db, 1).unwrap(), 5);
        txn.commit().unwrap();

        let txn = env.begin_read().unwrap();
        assert_eq!(txn.get_sequence(&db, 0).unwrap(), 6);
        assert_eq!(txn.get_sequence(&db, 1).unwrap_err().kind(), ErrorKind::Incompatible);
    }

    #[test]
    fn aborted_increment_is_discarded() {
        let dir = tempdir().unwrap();
        let env = open_env(dir.path());

        let mut txn = env.begin_write().unwrap();
        let db = txn.open_database(None, DatabaseOptions::new()).unwrap();
        txn.get_sequence(&db, 10).unwrap();
        txn.abort();

        let mut txn = env.begin_write().unwrap();
        assert_eq!(txn.get_sequence(&db, 0).unwrap(), 0);
    }
}
