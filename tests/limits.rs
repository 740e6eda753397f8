//! File-size limits and capacity errors.

use burrow::{DbConfig, EnvConfig, EnvFlags, Environment, ErrorCode, InsertFlags};
use tempfile::tempdir;

#[test]
fn test_file_size_limit() {
    // S4: 16 KiB pages, 32 KiB limit -> header page + one leaf
    let dir = tempdir().unwrap();
    let path = dir.path().join("limited.db");
    let mut config = EnvConfig::new(path.to_str().unwrap());
    config.page_size = 16 * 1024;
    config.file_size_limit = 32 * 1024;
    let env = Environment::create(config).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let mut inserted = 0u64;
    for i in 0u32..100_000 {
        match db.insert(None, &i.to_be_bytes(), b"payload", InsertFlags::empty()) {
            Ok(()) => inserted += 1,
            Err(err) => {
                assert_eq!(err.code(), ErrorCode::LimitsReached);
                break;
            }
        }
    }
    assert!(inserted > 0, "the root leaf holds at least some records");
    assert_eq!(db.count(None, true).unwrap(), inserted);
    db.check_integrity().unwrap();
    drop(db);
    env.close(burrow::CloseFlags::empty()).unwrap();

    let size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(size, 32 * 1024);
}

#[test]
fn test_in_memory_limit() {
    let mut config = EnvConfig::new("");
    config.flags = EnvFlags::IN_MEMORY;
    config.page_size = 1024;
    config.file_size_limit = 8 * 1024;
    let env = Environment::create(config).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let mut result = Ok(());
    for i in 0u32..10_000 {
        result = db.insert(None, &i.to_be_bytes(), &[0u8; 64], InsertFlags::empty());
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result.unwrap_err().code(), ErrorCode::LimitsReached);
    db.check_integrity().unwrap();
}

#[test]
fn test_oversized_key_rejected() {
    let mut config = EnvConfig::new("");
    config.flags = EnvFlags::IN_MEMORY;
    let env = Environment::create(config).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let key = vec![1u8; 100 * 1024];
    let err = db.insert(None, &key, b"v", InsertFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvKeySize);
}

#[test]
fn test_fixed_sizes_enforced() {
    let mut config = EnvConfig::new("");
    config.flags = EnvFlags::IN_MEMORY;
    let env = Environment::create(config).unwrap();

    let mut db_config = DbConfig::default();
    db_config.key_size = 4;
    db_config.record_size = 8;
    let db = env.create_db(1, db_config).unwrap();

    db.insert(None, b"abcd", b"12345678", InsertFlags::empty()).unwrap();
    assert_eq!(
        db.insert(None, b"abc", b"12345678", InsertFlags::empty())
            .unwrap_err()
            .code(),
        ErrorCode::InvKeySize
    );
    assert_eq!(
        db.insert(None, b"wxyz", b"123", InsertFlags::empty())
            .unwrap_err()
            .code(),
        ErrorCode::InvRecordSize
    );
}

#[test]
fn test_max_databases_bounded_by_header_page() {
    let mut config = EnvConfig::new("");
    config.flags = EnvFlags::IN_MEMORY;
    config.page_size = 1024;
    config.max_databases = 10_000;
    assert_eq!(
        Environment::create(config).unwrap_err().code(),
        ErrorCode::InvParameter
    );

    let mut config = EnvConfig::new("");
    config.flags = EnvFlags::IN_MEMORY;
    config.page_size = 1024;
    config.max_databases = 4;
    let env = Environment::create(config).unwrap();
    for name in 1..=4u16 {
        env.create_db(name, DbConfig::default()).unwrap();
    }
    assert_eq!(
        env.create_db(5, DbConfig::default()).unwrap_err().code(),
        ErrorCode::LimitsReached
    );
}

#[test]
fn test_would_block_on_second_opener() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("locked.db");
    let config = EnvConfig::new(path.to_str().unwrap());
    let _env = Environment::create(config.clone()).unwrap();

    assert_eq!(
        Environment::open(config).unwrap_err().code(),
        ErrorCode::WouldBlock
    );
}
