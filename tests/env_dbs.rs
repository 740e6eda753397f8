//! Environment-level database management and structural invariants.

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
fn test_create_open_erase_rename() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("admin.db");
    let config = EnvConfig::new(path.to_str().unwrap());

    {
        let env = Environment::create(config.clone()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
        let db2 = env.create_db(2, DbConfig::default()).unwrap();
        db2.insert(None, b"x", b"y", InsertFlags::empty()).unwrap();

        assert_eq!(
            env.create_db(1, DbConfig::default()).unwrap_err().code(),
            ErrorCode::DatabaseAlreadyOpen
        );
        env.close(burrow::CloseFlags::empty()).unwrap();
    }

    let env = Environment::open(config).unwrap();
    let mut names = env.database_names().unwrap();
    names.sort_unstable();
    assert_eq!(names, vec![1, 2]);

    env.rename_db(2, 5).unwrap();
    assert_eq!(
        env.open_db(2).unwrap_err().code(),
        ErrorCode::DatabaseNotFound
    );
    let db = env.open_db(5).unwrap();
    assert_eq!(db.get(None, b"x").unwrap(), b"y");
    drop(db);

    env.erase_db(1).unwrap();
    assert_eq!(
        env.open_db(1).unwrap_err().code(),
        ErrorCode::DatabaseNotFound
    );
    let mut names = env.database_names().unwrap();
    names.sort_unstable();
    assert_eq!(names, vec![5]);
}

#[test]
fn test_erase_db_refuses_open_cursors() {
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let cursor = db.cursor(None).unwrap();
    assert_eq!(
        env.erase_db(1).unwrap_err().code(),
        ErrorCode::CursorStillOpen
    );
    drop(cursor);
    env.erase_db(1).unwrap();
}

#[test]
fn test_integrity_after_random_operations() {
    // integrity holds after any sequence of legal operations
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let mut live: Vec<u32> = Vec::new();
    for _ in 0..3000 {
        if live.is_empty() || rng.gen_bool(0.7) {
            let key: u32 = rng.gen_range(0..5000);
            let len = rng.gen_range(0..200);
            let record: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let _ = db.insert(None, &key.to_be_bytes(), &record, InsertFlags::OVERWRITE);
            if !live.contains(&key) {
                live.push(key);
            }
        } else {
            let index = rng.gen_range(0..live.len());
            let key = live.swap_remove(index);
            db.erase(None, &key.to_be_bytes()).unwrap();
        }
    }
    db.check_integrity().unwrap();

    live.sort_unstable();
    assert_eq!(db.count(None, true).unwrap(), live.len() as u64);

    // forward iteration visits each live key exactly once, in order
    let mut cursor = db.cursor(None).unwrap();
    let mut seen = Vec::new();
    if cursor.move_to(CursorFlags::FIRST).is_ok() {
        seen.push(u32::from_be_bytes(cursor.key().unwrap().try_into().unwrap()));
        while cursor.move_to(CursorFlags::NEXT).is_ok() {
            seen.push(u32::from_be_bytes(cursor.key().unwrap().try_into().unwrap()));
        }
    }
    assert_eq!(seen, live);
}

#[test]
fn test_cursor_survives_splits() {
    // a positioned cursor keeps its logical position while the tree is
    // restructured underneath it
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    db.insert(None, b"anchor", b"v", InsertFlags::empty()).unwrap();
    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"anchor", FindFlags::empty()).unwrap();

    for i in 0u32..3000 {
        db.insert(
            None,
            format!("key-{:06}", i).as_bytes(),
            b"filler",
            InsertFlags::empty(),
        )
        .unwrap();
    }

    assert_eq!(cursor.key().unwrap(), b"anchor");
    assert_eq!(cursor.record().unwrap(), b"v");
    db.check_integrity().unwrap();
}

#[test]
fn test_cursor_clone_is_independent() {
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    for key in [b"a", b"b", b"c"] {
        db.insert(None, key, key, InsertFlags::empty()).unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    let mut clone = cursor.try_clone().unwrap();
    cursor.move_to(CursorFlags::NEXT).unwrap();

    assert_eq!(clone.key().unwrap(), b"a");
    assert_eq!(cursor.key().unwrap(), b"b");
    clone.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(clone.key().unwrap(), b"b");
}

#[test]
fn test_bulk_operations() {
    use burrow::{BulkOperation, BulkResult};
    let env = in_memory_env();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let results = db
        .bulk(
            None,
            &[
                BulkOperation::Insert {
                    key: b"a".to_vec(),
                    record: b"1".to_vec(),
                    flags: InsertFlags::empty(),
                },
                BulkOperation::Insert {
                    key: b"b".to_vec(),
                    record: b"2".to_vec(),
                    flags: InsertFlags::empty(),
                },
                BulkOperation::Find { key: b"a".to_vec() },
                BulkOperation::Erase { key: b"b".to_vec() },
                BulkOperation::Find { key: b"b".to_vec() },
            ],
        )
        .unwrap();

    assert!(matches!(results[0], BulkResult::Ok));
    assert!(matches!(results[1], BulkResult::Ok));
    match &results[2] {
        BulkResult::Found(found) => assert_eq!(found.record, b"1"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(results[3], BulkResult::Ok));
    assert!(matches!(results[4], BulkResult::Failed(ErrorCode::KeyNotFound)));
}

#[test]
fn test_crc_protected_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crc.db");
    let mut config = EnvConfig::new(path.to_str().unwrap());
    config.flags = EnvFlags::ENABLE_CRC32;

    {
        let env = Environment::create(config.clone()).unwrap();
        let db = env.create_db(1, DbConfig::default()).unwrap();
        for i in 0u32..200 {
            db.insert(None, &i.to_be_bytes(), b"crc", InsertFlags::empty()).unwrap();
        }
        env.close(burrow::CloseFlags::empty()).unwrap();
    }

    let env = Environment::open(config).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(None, true).unwrap(), 200);
    db.check_integrity().unwrap();
}

#[test]
fn test_open_rejects_bad_files() {
    let dir = tempdir().unwrap();

    // empty file
    let empty = dir.path().join("empty.db");
    std::fs::File::create(&empty).unwrap();
    assert_eq!(
        Environment::open(EnvConfig::new(empty.to_str().unwrap()))
            .unwrap_err()
            .code(),
        ErrorCode::IoError
    );

    // garbage magic
    let garbage = dir.path().join("garbage.db");
    std::fs::write(&garbage, vec![0xabu8; 4096]).unwrap();
    assert_eq!(
        Environment::open(EnvConfig::new(garbage.to_str().unwrap()))
            .unwrap_err()
            .code(),
        ErrorCode::InvFileHeader
    );
}
