//! Basic insert/find/erase behavior, in memory and on disk.

use burrow::{
    CursorFlags, DbConfig, EnvConfig, EnvFlags, Environment, ErrorCode, FindFlags, InsertFlags,
};
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn in_memory_env() -> Environment {
    let mut config = EnvConfig::new("");
    config.flags = EnvFlags::IN_MEMORY;
    Environment::create(config).unwrap()
}

#[test]
fn test_insert_find_cursor_walk() {
    // S1: three keys, point lookup, forward cursor walk
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"1", b"a", InsertFlags::empty()).unwrap();
    db.insert(None, b"2", b"b", InsertFlags::empty()).unwrap();
    db.insert(None, b"3", b"c", InsertFlags::empty()).unwrap();

    assert_eq!(db.get(None, b"2").unwrap(), b"b");

    let mut cursor = db.cursor(None).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    assert_eq!(cursor.key().unwrap(), b"1");
    cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.key().unwrap(), b"2");
    cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.key().unwrap(), b"3");
    assert_eq!(
        cursor.move_to(CursorFlags::NEXT).unwrap_err().code(),
        ErrorCode::KeyNotFound
    );
}

#[test]
fn test_find_returns_last_inserted_value() {
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    for round in 0u32..4 {
        for key in 0u32..50 {
            let value = format!("{}-{}", key, round);
            db.insert(
                None,
                &key.to_be_bytes(),
                value.as_bytes(),
                InsertFlags::OVERWRITE,
            )
            .unwrap();
        }
    }
    for key in 0u32..50 {
        let expected = format!("{}-3", key);
        assert_eq!(db.get(None, &key.to_be_bytes()).unwrap(), expected.as_bytes());
    }
    db.check_integrity().unwrap();
}

#[test]
fn test_duplicate_key_rejected_without_overwrite() {
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"k", b"v1", InsertFlags::empty()).unwrap();
    let err = db.insert(None, b"k", b"v2", InsertFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateKey);
    assert_eq!(db.get(None, b"k").unwrap(), b"v1");

    db.insert(None, b"k", b"v2", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.get(None, b"k").unwrap(), b"v2");
}

#[test]
fn test_erase_and_not_found() {
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"gone", b"soon", InsertFlags::empty()).unwrap();
    db.erase(None, b"gone").unwrap();
    assert_eq!(db.get(None, b"gone").unwrap_err().code(), ErrorCode::KeyNotFound);
    assert_eq!(db.erase(None, b"gone").unwrap_err().code(), ErrorCode::KeyNotFound);
}

#[test]
fn test_large_record_roundtrip() {
    // binary-identical read-back of single- and multi-page blobs
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let sizes = [0usize, 7, 8, 9, 100, 4000, 70_000, 1_500_000];
    for (i, &size) in sizes.iter().enumerate() {
        let record: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        db.insert(None, &(i as u32).to_be_bytes(), &record, InsertFlags::empty())
            .unwrap();
        assert_eq!(db.get(None, &(i as u32).to_be_bytes()).unwrap(), record);
    }
    db.check_integrity().unwrap();
}

#[test]
fn test_on_disk_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.db");
    let path = path.to_str().unwrap();

    {
        let env = Environment::create(EnvConfig::new(path)).unwrap();
        let db = env.create_db(7, DbConfig::default()).unwrap();
        for i in 0u32..500 {
            db.insert(
                None,
                &i.to_be_bytes(),
                format!("value-{}", i).as_bytes(),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        // env closes on drop
    }

    let env = Environment::open(EnvConfig::new(path)).unwrap();
    assert_eq!(env.database_names().unwrap(), vec![7]);
    let db = env.open_db(7).unwrap();
    assert_eq!(db.count(None, true).unwrap(), 500);
    for i in (0u32..500).step_by(31) {
        assert_eq!(
            db.get(None, &i.to_be_bytes()).unwrap(),
            format!("value-{}", i).as_bytes()
        );
    }
    db.check_integrity().unwrap();
}

#[test]
fn test_typed_keys_sort_numerically() {
    let env = in_memory_env();
    let mut config = DbConfig::default();
    config.key_type = burrow::KeyType::UInt32;
    let db = env.create_db(1, config).unwrap();

    // lexicographic order of the little-endian bytes would be wrong
    for key in [300u32, 2, 70000, 1, 256] {
        db.insert(None, &key.to_le_bytes(), b"x", InsertFlags::empty())
            .unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    let mut keys = Vec::new();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    loop {
        keys.push(u32::from_le_bytes(cursor.key().unwrap().try_into().unwrap()));
        if cursor.move_to(CursorFlags::NEXT).is_err() {
            break;
        }
    }
    assert_eq!(keys, vec![1, 2, 256, 300, 70000]);
}

#[test]
fn test_find_approx_exposes_actual_key() {
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"bb", b"2", InsertFlags::empty()).unwrap();

    let result = db.find(None, b"aa", FindFlags::GEQ_MATCH).unwrap();
    assert_eq!(result.key, b"bb");
    assert_eq!(result.record, b"2");
}
