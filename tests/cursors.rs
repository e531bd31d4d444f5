//! # Cursor Tests
//!
//! Navigation over plain and dup-sort databases, cursor writes inside a
//! write transaction, and cursor binding rules.
//!
//! ## Fixture
//!
//! ```text
//! plain: "1".."9" -> "v1".."v9"
//! dups:  a -> {1, 2, 3}
//!        b -> {x}
//!        c -> {p, q}
//! ```

use tempfile::tempdir;
use turkv::{
    Database, DatabaseFlags, DatabaseOptions, Entry, Environment, ErrorKind, Transaction,
    WriteFlags,
};

struct Fixture {
    _dir: tempfile::TempDir,
    env: Environment,
}

fn fixture() -> (Fixture, Database, Database) {
    let dir = tempdir().unwrap();
    let env = Environment::builder()
        .page_size(4096)
        .map_size(8 * 1024 * 1024)
        .open(dir.path())
        .unwrap();

    let mut txn = env.begin_write().unwrap();
    let plain = txn.create_database(Some("plain"), DatabaseOptions::new()).unwrap();
    for i in 1..=9 {
        txn.put(&plain, format!("{i}").as_bytes(), format!("v{i}").as_bytes(), WriteFlags::empty())
            .unwrap();
    }

    let dups = txn
        .create_database(Some("dups"), DatabaseOptions::new().dup_sort())
        .unwrap();
    for (key, value) in [("a", "3"), ("a", "1"), ("b", "x"), ("c", "q"), ("a", "2"), ("c", "p")] {
        txn.put(&dups, key.as_bytes(), value.as_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    (Fixture { _dir: dir, env }, plain, dups)
}

fn pair(key: &'static str, value: &'static str) -> Option<Entry<'static>> {
    Some((key.as_bytes(), value.as_bytes()))
}

mod navigation {
    use super::*;

    #[test]
    fn walks_forward_and_backward() {
        let (fx, plain, _) = fixture();
        let txn = fx.env.begin_read().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();

        assert_eq!(cursor.first(&txn).unwrap(), pair("1", "v1"));
        assert_eq!(cursor.next(&txn).unwrap(), pair("2", "v2"));
        assert_eq!(cursor.prev(&txn).unwrap(), pair("1", "v1"));
        assert_eq!(cursor.prev(&txn).unwrap(), None);

        assert_eq!(cursor.last(&txn).unwrap(), pair("9", "v9"));
        assert_eq!(cursor.next(&txn).unwrap(), None);
    }

    #[test]
    fn unpositioned_cursor_starts_at_the_ends() {
        let (fx, plain, _) = fixture();
        let txn = fx.env.begin_read().unwrap();

        let mut forward = txn.cursor(&plain).unwrap();
        assert_eq!(forward.current(&txn).unwrap(), None);
        assert_eq!(forward.next(&txn).unwrap(), pair("1", "v1"));

        let mut backward = txn.cursor(&plain).unwrap();
        assert_eq!(backward.prev(&txn).unwrap(), pair("9", "v9"));
    }

    #[test]
    fn seek_variants() {
        let (fx, plain, _) = fixture();
        let txn = fx.env.begin_read().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();

        assert_eq!(cursor.seek(&txn, b"45").unwrap(), pair("5", "v5"));
        assert_eq!(cursor.current(&txn).unwrap(), pair("5", "v5"));
        assert_eq!(cursor.seek_range(&txn, b"7").unwrap(), pair("7", "v7"));
        assert_eq!(cursor.seek(&txn, b"99").unwrap(), None);

        assert_eq!(cursor.seek_exact(&txn, b"3").unwrap(), pair("3", "v3"));
        assert_eq!(cursor.seek_exact(&txn, b"35").unwrap(), None);
        assert_eq!(cursor.current(&txn).unwrap(), None, "a miss SHOULD unposition");

        assert_eq!(cursor.get_both(&txn, b"4", b"v4").unwrap(), pair("4", "v4"));
        assert_eq!(cursor.get_both(&txn, b"4", b"nope").unwrap(), None);
    }

    #[test]
    fn count_on_plain_database_is_one() {
        let (fx, plain, _) = fixture();
        let txn = fx.env.begin_read().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();

        assert_eq!(cursor.count(&txn).unwrap_err().kind(), ErrorKind::Incompatible);
        cursor.first(&txn).unwrap();
        assert_eq!(cursor.count(&txn).unwrap(), 1);
    }

    #[test]
    fn dup_navigation_needs_dup_sort() {
        let (fx, plain, _) = fixture();
        let txn = fx.env.begin_read().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();
        cursor.first(&txn).unwrap();

        assert_eq!(cursor.next_dup(&txn).unwrap_err().kind(), ErrorKind::Incompatible);
        assert_eq!(
            cursor.seek_dup(&txn, b"1", b"v").unwrap_err().kind(),
            ErrorKind::Incompatible
        );
    }
}

mod duplicates {
    use super::*;

    #[test]
    fn next_visits_every_duplicate_in_value_order() {
        let (fx, _, dups) = fixture();
        let txn = fx.env.begin_read().unwrap();
        let mut cursor = txn.cursor(&dups).unwrap();

        let mut seen = Vec::new();
        while let Some((key, value)) = cursor.next(&txn).unwrap() {
            seen.push(format!(
                "{}{}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ));
        }

        assert_eq!(seen, ["a1", "a2", "a3", "bx", "cp", "cq"]);
        assert_eq!(txn.stat(&dups).unwrap().entries, 6);
    }

    #[test]
    fn dup_moves_stay_on_key() {
        let (fx, _, dups) = fixture();
        let txn = fx.env.begin_read().unwrap();
        let mut cursor = txn.cursor(&dups).unwrap();

        assert_eq!(cursor.seek_exact(&txn, b"c").unwrap(), pair("c", "p"));
        assert_eq!(cursor.count(&txn).unwrap(), 2);
        assert_eq!(cursor.last_dup(&txn).unwrap(), pair("c", "q"));
        assert_eq!(cursor.prev_dup(&txn).unwrap(), pair("c", "p"));
        assert_eq!(cursor.prev_dup(&txn).unwrap(), None);

        assert_eq!(cursor.seek_exact(&txn, b"a").unwrap(), pair("a", "1"));
        assert_eq!(cursor.next_dup(&txn).unwrap(), pair("a", "2"));
        assert_eq!(cursor.first_dup(&txn).unwrap(), pair("a", "1"));
    }

    #[test]
    fn nodup_moves_skip_remaining_duplicates() {
        let (fx, _, dups) = fixture();
        let txn = fx.env.begin_read().unwrap();
        let mut cursor = txn.cursor(&dups).unwrap();

        assert_eq!(cursor.first(&txn).unwrap(), pair("a", "1"));
        assert_eq!(cursor.next_nodup(&txn).unwrap(), pair("b", "x"));
        assert_eq!(cursor.next_nodup(&txn).unwrap(), pair("c", "p"));
        assert_eq!(cursor.next_nodup(&txn).unwrap(), None);

        assert_eq!(cursor.seek_exact(&txn, b"b").unwrap(), pair("b", "x"));
        assert_eq!(
            cursor.prev_nodup(&txn).unwrap(),
            pair("a", "3"),
            "prev_nodup SHOULD land on the last duplicate of the previous key"
        );
    }

    #[test]
    fn seek_dup_finds_first_value_at_or_after() {
        let (fx, _, dups) = fixture();
        let txn = fx.env.begin_read().unwrap();
        let mut cursor = txn.cursor(&dups).unwrap();

        assert_eq!(cursor.seek_dup(&txn, b"a", b"15").unwrap(), pair("a", "2"));
        assert_eq!(cursor.get_both_range(&txn, b"a", b"3").unwrap(), pair("a", "3"));
        assert_eq!(cursor.seek_dup(&txn, b"a", b"4").unwrap(), None);
        assert_eq!(cursor.get_both(&txn, b"c", b"q").unwrap(), pair("c", "q"));
        assert_eq!(cursor.get_both(&txn, b"c", b"r").unwrap(), None);
    }

    #[test]
    fn no_dup_data_keeps_count() {
        let (fx, _, dups) = fixture();
        let mut txn = fx.env.begin_write().unwrap();

        assert!(txn.put(&dups, b"k", b"A", WriteFlags::NO_DUP_DATA).unwrap());
        assert!(txn.put(&dups, b"k", b"B", WriteFlags::NO_DUP_DATA).unwrap());
        assert!(txn.put(&dups, b"k", b"C", WriteFlags::NO_DUP_DATA).unwrap());
        assert!(
            !txn.put(&dups, b"k", b"B", WriteFlags::NO_DUP_DATA).unwrap(),
            "repeating an existing pair SHOULD be a no-op"
        );

        assert_eq!(txn.count_dups(&dups, b"k").unwrap(), 3);
        txn.commit().unwrap();

        let txn = fx.env.begin_read().unwrap();
        assert_eq!(txn.count_dups(&dups, b"k").unwrap(), 3);
        assert_eq!(txn.get(&dups, b"k").unwrap(), Some(&b"A"[..]));
    }

    #[test]
    fn many_duplicates_span_nested_pages() {
        let (fx, _, dups) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        for i in 0u32..2000 {
            txn.put(&dups, b"many", &i.to_be_bytes(), WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        let txn = fx.env.begin_read().unwrap();
        assert_eq!(txn.count_dups(&dups, b"many").unwrap(), 2000);

        let mut cursor = txn.cursor(&dups).unwrap();
        cursor.seek_exact(&txn, b"many").unwrap();
        let mut expected = 1u32;
        while let Some((_, value)) = cursor.next_dup(&txn).unwrap() {
            assert_eq!(value, expected.to_be_bytes());
            expected += 1;
        }
        assert_eq!(expected, 2000);
    }
}

mod writes {
    use super::*;

    #[test]
    fn delete_then_next_and_prev() {
        let (fx, plain, _) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();

        assert_eq!(cursor.seek_exact(&txn, b"3").unwrap(), pair("3", "v3"));
        cursor.delete(&mut txn, false).unwrap();
        assert_eq!(cursor.current(&txn).unwrap(), None);
        assert_eq!(cursor.next(&txn).unwrap(), pair("4", "v4"));

        cursor.seek_exact(&txn, b"6").unwrap();
        cursor.delete(&mut txn, false).unwrap();
        assert_eq!(
            cursor.prev(&txn).unwrap(),
            pair("5", "v5"),
            "prev after delete SHOULD yield the predecessor"
        );

        assert_eq!(txn.get(&plain, b"3").unwrap(), None);
        assert_eq!(txn.get(&plain, b"6").unwrap(), None);
    }

    #[test]
    fn delete_last_entry() {
        let (fx, plain, _) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();

        cursor.last(&txn).unwrap();
        cursor.delete(&mut txn, false).unwrap();

        assert_eq!(cursor.next(&txn).unwrap(), None);
        assert_eq!(cursor.prev(&txn).unwrap(), pair("8", "v8"));
    }

    #[test]
    fn delete_every_entry_through_cursor() {
        let (fx, plain, _) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();

        let mut deleted = 0;
        while cursor.next(&txn).unwrap().is_some() {
            cursor.delete(&mut txn, false).unwrap();
            deleted += 1;
        }

        assert_eq!(deleted, 9);
        assert_eq!(txn.stat(&plain).unwrap().entries, 0);
    }

    #[test]
    fn delete_single_duplicate_or_all() {
        let (fx, _, dups) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let mut cursor = txn.cursor(&dups).unwrap();

        assert_eq!(cursor.get_both(&txn, b"a", b"2").unwrap(), pair("a", "2"));
        cursor.delete(&mut txn, false).unwrap();
        assert_eq!(txn.count_dups(&dups, b"a").unwrap(), 2);
        assert_eq!(cursor.next(&txn).unwrap(), pair("a", "3"));

        cursor.seek_exact(&txn, b"c").unwrap();
        cursor.delete(&mut txn, true).unwrap();
        assert_eq!(txn.count_dups(&dups, b"c").unwrap(), 0);
        assert_eq!(txn.stat(&dups).unwrap().entries, 3);
    }

    #[test]
    fn put_positions_cursor_on_new_entry() {
        let (fx, plain, _) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();

        assert!(cursor.put(&mut txn, b"55", b"new", WriteFlags::empty()).unwrap());
        assert_eq!(cursor.current(&txn).unwrap(), pair("55", "new"));
        assert_eq!(cursor.next(&txn).unwrap(), pair("6", "v6"));
    }

    #[test]
    fn put_current_replaces_value_under_cursor() {
        let (fx, plain, dups) = fixture();
        let mut txn = fx.env.begin_write().unwrap();

        let mut cursor = txn.cursor(&plain).unwrap();
        cursor.seek_exact(&txn, b"2").unwrap();
        cursor.put(&mut txn, b"2", b"changed", WriteFlags::CURRENT).unwrap();
        assert_eq!(cursor.current(&txn).unwrap(), pair("2", "changed"));

        let err = cursor.put(&mut txn, b"3", b"x", WriteFlags::CURRENT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Incompatible);

        let mut cursor = txn.cursor(&dups).unwrap();
        cursor.get_both(&txn, b"c", b"p").unwrap();
        cursor.put(&mut txn, b"c", b"r", WriteFlags::CURRENT).unwrap();
        assert_eq!(txn.count_dups(&dups, b"c").unwrap(), 2);
        assert_eq!(txn.get(&dups, b"c").unwrap(), Some(&b"q"[..]));
    }

    #[test]
    fn cursor_follows_other_writes_in_same_txn() {
        let (fx, plain, _) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let mut cursor = txn.cursor(&plain).unwrap();
        cursor.seek_exact(&txn, b"2").unwrap();

        for i in 0..300u32 {
            txn.put(&plain, format!("2{i:04}").as_bytes(), b"filler", WriteFlags::empty())
                .unwrap();
        }

        assert_eq!(cursor.current(&txn).unwrap(), pair("2", "v2"));
        assert_eq!(cursor.next(&txn).unwrap(), pair("20000", "filler"));
    }

    #[test]
    fn read_transaction_cursor_is_stale_in_write_txn() {
        let (fx, plain, _) = fixture();
        let mut cursor = {
            let txn = fx.env.begin_read().unwrap();
            txn.cursor(&plain).unwrap()
        };

        let txn = fx.env.begin_write().unwrap();
        assert_eq!(cursor.first(&txn).unwrap_err().kind(), ErrorKind::StaleCursor);
        cursor.renew(&txn).unwrap();
        assert_eq!(cursor.first(&txn).unwrap(), pair("1", "v1"));
    }
}

mod orderings {
    use super::*;
    use std::sync::Arc;
    use turkv::FnComparator;

    #[test]
    fn integer_keys_sort_numerically() {
        let (fx, _, _) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let options = DatabaseOptions::new().flags(DatabaseFlags::INTEGER_KEY);
        let db = txn.create_database(Some("ints"), options).unwrap();
        for n in [300u32, 2, 70_000, 1] {
            txn.put(&db, &n.to_ne_bytes(), b"", WriteFlags::empty()).unwrap();
        }

        let mut cursor = txn.cursor(&db).unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next(&txn).unwrap() {
            seen.push(u32::from_ne_bytes(key.try_into().unwrap()));
        }
        assert_eq!(seen, [1, 2, 300, 70_000]);
    }

    #[test]
    fn reverse_keys_compare_from_the_end() {
        let (fx, _, _) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let options = DatabaseOptions::new().flags(DatabaseFlags::REVERSE_KEY);
        let db = txn.create_database(Some("rev"), options).unwrap();
        for key in ["ab", "ba", "ca"] {
            txn.put(&db, key.as_bytes(), b"", WriteFlags::empty()).unwrap();
        }

        let mut cursor = txn.cursor(&db).unwrap();
        assert_eq!(cursor.first(&txn).unwrap(), pair("ba", ""));
        assert_eq!(cursor.next(&txn).unwrap(), pair("ca", ""));
        assert_eq!(cursor.next(&txn).unwrap(), pair("ab", ""));
    }

    #[test]
    fn custom_comparator_orders_keys() {
        let (fx, _, _) = fixture();
        let descending = Arc::new(FnComparator::new("descending", |a: &[u8], b: &[u8]| b.cmp(a)));
        let mut txn = fx.env.begin_write().unwrap();
        let db = txn
            .create_database(Some("desc"), DatabaseOptions::new().key_comparator(descending))
            .unwrap();
        for i in 0u8..100 {
            txn.put(&db, &[i], b"", WriteFlags::empty()).unwrap();
        }

        let mut cursor = txn.cursor(&db).unwrap();
        assert_eq!(cursor.first(&txn).unwrap().map(|(k, _)| k), Some(&[99u8][..]));
        assert_eq!(cursor.last(&txn).unwrap().map(|(k, _)| k), Some(&[0u8][..]));
        assert_eq!(txn.get(&db, &[42]).unwrap(), Some(&b""[..]));
    }

    #[test]
    fn fixed_size_duplicates_reject_other_sizes() {
        let (fx, _, _) = fixture();
        let mut txn = fx.env.begin_write().unwrap();
        let options =
            DatabaseOptions::new().flags(DatabaseFlags::DUP_SORT | DatabaseFlags::DUP_FIXED);
        let db = txn.create_database(Some("fixed"), options).unwrap();

        txn.put(&db, b"k", &1u32.to_be_bytes(), WriteFlags::empty()).unwrap();
        txn.put(&db, b"k", &2u32.to_be_bytes(), WriteFlags::empty()).unwrap();
        let err = txn.put(&db, b"k", &3u64.to_be_bytes(), WriteFlags::empty()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BadValueSize);
        assert_eq!(txn.state(), turkv::TxnState::Active);
        assert_eq!(txn.count_dups(&db, b"k").unwrap(), 2);
    }
}
