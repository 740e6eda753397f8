//! Transactions: read-your-writes, conflicts, abort, merged cursors.

use burrow::{
    CursorFlags, DbConfig, EnvConfig, EnvFlags, Environment, ErrorCode, FindFlags, InsertFlags,
};
use tempfile::tempdir;

fn txn_env(dir: &tempfile::TempDir, name: &str) -> Environment {
    let path = dir.path().join(name);
    let mut config = EnvConfig::new(path.to_str().unwrap());
    config.flags = EnvFlags::ENABLE_TRANSACTIONS;
    Environment::create(config).unwrap()
}

#[test]
fn test_read_your_writes() {
    let dir = tempdir().unwrap();
    let env = txn_env(&dir, "ryw.db");
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();

    // the writer sees its own write, outsiders do not
    assert_eq!(db.get(Some(&txn), b"k").unwrap(), b"v");
    assert_eq!(db.get(None, b"k").unwrap_err().code(), ErrorCode::KeyNotFound);

    txn.commit().unwrap();
    assert_eq!(db.get(None, b"k").unwrap(), b"v");
}

#[test]
fn test_erase_inside_txn_hides_key() {
    let dir = tempdir().unwrap();
    let env = txn_env(&dir, "hide.db");
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let txn = env.txn_begin().unwrap();
    db.erase(Some(&txn), b"k").unwrap();
    assert_eq!(
        db.get(Some(&txn), b"k").unwrap_err().code(),
        ErrorCode::KeyNotFound
    );
    // not yet visible outside
    assert_eq!(db.get(None, b"k").unwrap(), b"v");

    txn.commit().unwrap();
    assert_eq!(db.get(None, b"k").unwrap_err().code(), ErrorCode::KeyNotFound);
}

#[test]
fn test_conflict_between_two_txns() {
    // S6: both transactions write key 7
    let dir = tempdir().unwrap();
    let env = txn_env(&dir, "conflict.db");
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn1 = env.txn_begin().unwrap();
    let txn2 = env.txn_begin().unwrap();

    db.insert(Some(&txn1), b"7", b"one", InsertFlags::empty()).unwrap();
    let err = db
        .insert(Some(&txn2), b"7", b"two", InsertFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TxnConflict);

    txn1.commit().unwrap();
    txn2.abort().unwrap();

    // retried outside a transaction the insert now hits the existing key
    let err = db.insert(None, b"7", b"two", InsertFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateKey);
    db.insert(None, b"7", b"two", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.get(None, b"7").unwrap(), b"two");
}

#[test]
fn test_abort_discards_writes() {
    let dir = tempdir().unwrap();
    let env = txn_env(&dir, "abort.db");
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(Some(&txn), b"b", b"2", InsertFlags::empty()).unwrap();
    txn.abort().unwrap();

    assert_eq!(db.get(None, b"a").unwrap_err().code(), ErrorCode::KeyNotFound);
    assert_eq!(db.count(None, true).unwrap(), 0);

    // a dropped transaction aborts implicitly
    {
        let txn = env.txn_begin().unwrap();
        db.insert(Some(&txn), b"c", b"3", InsertFlags::empty()).unwrap();
    }
    assert_eq!(db.get(None, b"c").unwrap_err().code(), ErrorCode::KeyNotFound);
}

#[test]
fn test_cursor_merges_txn_and_btree() {
    let dir = tempdir().unwrap();
    let env = txn_env(&dir, "merge.db");
    let db = env.create_db(1, DbConfig::default()).unwrap();

    // "b" and "d" are flushed into the btree, "a"/"c"/"e" pending
    db.insert(None, b"b", b"btree", InsertFlags::empty()).unwrap();
    db.insert(None, b"d", b"btree", InsertFlags::empty()).unwrap();
    env.flush().unwrap();

    let txn = env.txn_begin().unwrap();
    for key in [b"a", b"c", b"e"] {
        db.insert(Some(&txn), key, b"txn", InsertFlags::empty()).unwrap();
    }

    let mut cursor = db.cursor(Some(&txn)).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    let mut keys = vec![cursor.key().unwrap()];
    while cursor.move_to(CursorFlags::NEXT).is_ok() {
        keys.push(cursor.key().unwrap());
    }
    let expected: Vec<Vec<u8>> = [b"a", b"b", b"c", b"d", b"e"].iter().map(|k| k.to_vec()).collect();
    assert_eq!(keys, expected);

    // reverse walk visits the same keys backwards
    cursor.move_to(CursorFlags::LAST).unwrap();
    let mut reversed = vec![cursor.key().unwrap()];
    while cursor.move_to(CursorFlags::PREVIOUS).is_ok() {
        reversed.push(cursor.key().unwrap());
    }
    reversed.reverse();
    assert_eq!(reversed, expected);

    txn.commit().unwrap();
}

#[test]
fn test_txn_overwrite_supersedes_btree_record() {
    let dir = tempdir().unwrap();
    let env = txn_env(&dir, "supersede.db");
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"k", b"old", InsertFlags::empty()).unwrap();
    env.flush().unwrap();

    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), b"k", b"new", InsertFlags::OVERWRITE).unwrap();

    let mut cursor = db.cursor(Some(&txn)).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    assert_eq!(cursor.record().unwrap(), b"new");
    txn.commit().unwrap();
    assert_eq!(db.get(None, b"k").unwrap(), b"new");
}

#[test]
fn test_merged_count() {
    let dir = tempdir().unwrap();
    let env = txn_env(&dir, "count.db");
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(None, b"b", b"2", InsertFlags::empty()).unwrap();
    env.flush().unwrap();

    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), b"c", b"3", InsertFlags::empty()).unwrap();
    db.erase(Some(&txn), b"a").unwrap();

    assert_eq!(db.count(Some(&txn), true).unwrap(), 2, "b and c remain");
    txn.commit().unwrap();
    assert_eq!(db.count(None, true).unwrap(), 2);
}

#[test]
fn test_erased_key_stepped_over_by_cursor() {
    let dir = tempdir().unwrap();
    let env = txn_env(&dir, "stepover.db");
    let db = env.create_db(1, DbConfig::default()).unwrap();

    for key in [b"a", b"b", b"c"] {
        db.insert(None, key, b"v", InsertFlags::empty()).unwrap();
    }
    env.flush().unwrap();

    let txn = env.txn_begin().unwrap();
    db.erase(Some(&txn), b"b").unwrap();

    let mut cursor = db.cursor(Some(&txn)).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    assert_eq!(cursor.key().unwrap(), b"a");
    cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.key().unwrap(), b"c", "the erased key is skipped");
    txn.abort().unwrap();
}
