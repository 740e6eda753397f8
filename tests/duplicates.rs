//! Duplicate keys: insertion order, counting, cursor traversal.

use burrow::{
    CursorFlags, DbConfig, DbFlags, EnvConfig, EnvFlags, Environment, ErrorCode, FindFlags,
    InsertFlags,
};

fn dup_db(env: &Environment) -> burrow::Database {
    let mut config = DbConfig::default();
    config.flags = DbFlags::ENABLE_DUPLICATES;
    env.create_db(1, config).unwrap()
}

fn in_memory_env() -> Environment {
    let mut config = EnvConfig::new("");
    config.flags = EnvFlags::IN_MEMORY;
    Environment::create(config).unwrap()
}

#[test]
fn test_five_duplicates_in_order() {
    // S3: five duplicates under one key, traversed in insertion order
    let env = in_memory_env();
    let db = dup_db(&env);

    for value in [b"a", b"b", b"c", b"d", b"e"] {
        db.insert(None, b"1", value, InsertFlags::DUPLICATE).unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"1", FindFlags::empty()).unwrap();
    assert_eq!(cursor.duplicate_count().unwrap(), 5);

    assert_eq!(cursor.record().unwrap(), b"a");
    for expected in [b"b", b"c", b"d", b"e"] {
        cursor
            .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
            .unwrap();
        assert_eq!(cursor.record().unwrap(), expected);
    }
    assert_eq!(
        cursor
            .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
            .unwrap_err()
            .code(),
        ErrorCode::KeyNotFound
    );
}

#[test]
fn test_count_distinct_vs_total() {
    let env = in_memory_env();
    let db = dup_db(&env);

    for key in [b"x", b"y"] {
        for value in 0u8..4 {
            db.insert(None, key, &[value], InsertFlags::DUPLICATE).unwrap();
        }
    }
    db.insert(None, b"z", b"solo", InsertFlags::empty()).unwrap();

    assert_eq!(db.count(None, true).unwrap(), 3);
    assert_eq!(db.count(None, false).unwrap(), 9);
    assert!(db.count(None, true).unwrap() <= db.count(None, false).unwrap());
}

#[test]
fn test_duplicate_positions() {
    let env = in_memory_env();
    let db = dup_db(&env);

    db.insert(None, b"k", b"middle", InsertFlags::DUPLICATE).unwrap();
    db.insert(
        None,
        b"k",
        b"first",
        InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_FIRST,
    )
    .unwrap();
    db.insert(
        None,
        b"k",
        b"last",
        InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_LAST,
    )
    .unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    let mut records = vec![cursor.record().unwrap()];
    while cursor
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .is_ok()
    {
        records.push(cursor.record().unwrap());
    }
    assert_eq!(records, vec![b"first".to_vec(), b"middle".to_vec(), b"last".to_vec()]);
}

#[test]
fn test_cursor_erase_single_duplicate() {
    let env = in_memory_env();
    let db = dup_db(&env);

    for value in 0u8..5 {
        db.insert(None, b"k", &[value], InsertFlags::DUPLICATE).unwrap();
    }

    // erase the second duplicate through a cursor
    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    cursor
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .unwrap();
    cursor.erase().unwrap();

    let mut check = db.cursor(None).unwrap();
    check.find(b"k", FindFlags::empty()).unwrap();
    assert_eq!(check.duplicate_count().unwrap(), 4);
    let mut records = vec![check.record().unwrap()];
    while check
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .is_ok()
    {
        records.push(check.record().unwrap());
    }
    assert_eq!(records, vec![vec![0], vec![2], vec![3], vec![4]]);
}

#[test]
fn test_cursor_overwrite_current_duplicate() {
    let env = in_memory_env();
    let db = dup_db(&env);

    for value in [b"a", b"b", b"c"] {
        db.insert(None, b"k", value, InsertFlags::DUPLICATE).unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    cursor
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .unwrap();
    cursor.overwrite(b"BB").unwrap();

    assert_eq!(cursor.record().unwrap(), b"BB");
    assert_eq!(cursor.record_size().unwrap(), 2);
    assert_eq!(cursor.duplicate_count().unwrap(), 3);

    // neighbours are untouched
    let mut check = db.cursor(None).unwrap();
    check.find(b"k", FindFlags::empty()).unwrap();
    assert_eq!(check.record().unwrap(), b"a");
}

#[test]
fn test_erase_key_drops_all_duplicates() {
    let env = in_memory_env();
    let db = dup_db(&env);

    for value in 0u8..10 {
        db.insert(None, b"k", &[value], InsertFlags::DUPLICATE).unwrap();
    }
    db.erase(None, b"k").unwrap();
    assert_eq!(db.get(None, b"k").unwrap_err().code(), ErrorCode::KeyNotFound);
    assert_eq!(db.count(None, false).unwrap(), 0);
    db.check_integrity().unwrap();
}

#[test]
fn test_skip_duplicates_iteration() {
    let env = in_memory_env();
    let db = dup_db(&env);

    for key in [b"a", b"b", b"c"] {
        for value in 0u8..3 {
            db.insert(None, key, &[value], InsertFlags::DUPLICATE).unwrap();
        }
    }

    let mut cursor = db.cursor(None).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    let mut keys = vec![cursor.key().unwrap()];
    while cursor
        .move_to(CursorFlags::NEXT | CursorFlags::SKIP_DUPLICATES)
        .is_ok()
    {
        keys.push(cursor.key().unwrap());
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}
