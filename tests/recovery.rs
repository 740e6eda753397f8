//! Crash recovery from the journal files.

use burrow::{
    CloseFlags, DbConfig, EnvConfig, EnvFlags, Environment, ErrorCode, InsertFlags,
};
use tempfile::tempdir;

fn copy_env_files(dir: &tempfile::TempDir, from: &str, to: &str) {
    for suffix in ["", ".jrn0", ".jrn1"] {
        let src = dir.path().join(format!("{}{}", from, suffix));
        let dst = dir.path().join(format!("{}{}", to, suffix));
        if src.exists() {
            std::fs::copy(&src, &dst).unwrap();
        }
    }
}

fn txn_config(dir: &tempfile::TempDir, name: &str, extra: EnvFlags) -> EnvConfig {
    let path = dir.path().join(name);
    let mut config = EnvConfig::new(path.to_str().unwrap());
    config.flags = EnvFlags::ENABLE_TRANSACTIONS | extra;
    config
}

#[test]
fn test_committed_txn_survives_crash() {
    // S2: txn1 committed, txn2 open; the files are copied aside before a
    // clean close, simulating a crash with the journal intact
    let dir = tempdir().unwrap();
    let env = Environment::create(txn_config(&dir, "crash.db", EnvFlags::empty())).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn1 = env.txn_begin().unwrap();
    db.insert(Some(&txn1), b"1", b"x", InsertFlags::empty()).unwrap();
    txn1.commit().unwrap();

    let txn2 = env.txn_begin().unwrap();
    db.insert(Some(&txn2), b"2", b"y", InsertFlags::empty()).unwrap();
    // txn2 is never committed

    // the journal holds txn1's ops; the btree pages were not flushed yet
    copy_env_files(&dir, "crash.db", "copy.db");

    drop(txn2);
    env.close(CloseFlags::DONT_CLEAR_LOG).unwrap();

    let env = Environment::open(txn_config(&dir, "copy.db", EnvFlags::AUTO_RECOVERY)).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.get(None, b"1").unwrap(), b"x");
    assert_eq!(db.get(None, b"2").unwrap_err().code(), ErrorCode::KeyNotFound);
    db.check_integrity().unwrap();
}

#[test]
fn test_recovery_is_equivalent_to_clean_run() {
    // the recovered state matches applying the same ops without a crash
    let dir = tempdir().unwrap();
    let env = Environment::create(txn_config(&dir, "equiv.db", EnvFlags::empty())).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    for i in 0u32..50 {
        let txn = env.txn_begin().unwrap();
        db.insert(
            Some(&txn),
            &i.to_be_bytes(),
            format!("v{}", i).as_bytes(),
            InsertFlags::empty(),
        )
        .unwrap();
        txn.commit().unwrap();
    }
    // a few erases on top
    for i in (0u32..50).step_by(7) {
        let txn = env.txn_begin().unwrap();
        db.erase(Some(&txn), &i.to_be_bytes()).unwrap();
        txn.commit().unwrap();
    }

    copy_env_files(&dir, "equiv.db", "equiv-copy.db");
    env.close(CloseFlags::DONT_CLEAR_LOG).unwrap();

    let env = Environment::open(txn_config(&dir, "equiv-copy.db", EnvFlags::AUTO_RECOVERY)).unwrap();
    let db = env.open_db(1).unwrap();
    for i in 0u32..50 {
        let result = db.get(None, &i.to_be_bytes());
        if i % 7 == 0 {
            assert_eq!(result.unwrap_err().code(), ErrorCode::KeyNotFound);
        } else {
            assert_eq!(result.unwrap(), format!("v{}", i).as_bytes());
        }
    }
    db.check_integrity().unwrap();
}

#[test]
fn test_recovery_after_changeset_flush_is_idempotent() {
    // flushed transactions leave changesets in the journal; replaying
    // them on reopen must not duplicate their effects
    let dir = tempdir().unwrap();
    let config = txn_config(
        &dir,
        "idem.db",
        EnvFlags::FLUSH_TRANSACTIONS_IMMEDIATELY,
    );
    let env = Environment::create(config).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    for i in 0u32..30 {
        let txn = env.txn_begin().unwrap();
        db.insert(Some(&txn), &i.to_be_bytes(), b"v", InsertFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    copy_env_files(&dir, "idem.db", "idem-copy.db");
    env.close(CloseFlags::DONT_CLEAR_LOG).unwrap();

    let env = Environment::open(txn_config(&dir, "idem-copy.db", EnvFlags::AUTO_RECOVERY)).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.count(None, true).unwrap(), 30);
    db.check_integrity().unwrap();
}

#[test]
fn test_reopen_without_recovery_flag() {
    // a cleanly closed environment opens fine without AUTO_RECOVERY
    let dir = tempdir().unwrap();
    let env = Environment::create(txn_config(&dir, "clean.db", EnvFlags::empty())).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
    env.close(CloseFlags::empty()).unwrap();

    let env = Environment::open(txn_config(&dir, "clean.db", EnvFlags::empty())).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.get(None, b"k").unwrap(), b"v");
}

#[test]
fn test_compressed_journal_recovery() {
    let dir = tempdir().unwrap();
    let mut config = txn_config(&dir, "zlib.db", EnvFlags::FLUSH_TRANSACTIONS_IMMEDIATELY);
    config.journal_compression = 1;
    let env = Environment::create(config).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();

    let txn = env.txn_begin().unwrap();
    db.insert(Some(&txn), b"k", &vec![0u8; 4096], InsertFlags::empty()).unwrap();
    txn.commit().unwrap();

    copy_env_files(&dir, "zlib.db", "zlib-copy.db");
    env.close(CloseFlags::DONT_CLEAR_LOG).unwrap();

    let env = Environment::open(txn_config(&dir, "zlib-copy.db", EnvFlags::AUTO_RECOVERY)).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.get(None, b"k").unwrap(), vec![0u8; 4096]);
}

#[test]
fn test_journal_files_removed_on_clean_close() {
    let dir = tempdir().unwrap();
    let env = Environment::create(txn_config(&dir, "tidy.db", EnvFlags::empty())).unwrap();
    let db = env.create_db(1, DbConfig::default()).unwrap();
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
    env.close(CloseFlags::empty()).unwrap();

    assert!(!dir.path().join("tidy.db.jrn0").exists());
    assert!(!dir.path().join("tidy.db.jrn1").exists());
    assert!(dir.path().join("tidy.db").exists());
}
