//! burrow - an embeddable, transactional, ordered key/value storage engine
//!
//! An environment is one file on disk (or an in-memory arena) holding up
//! to a few hundred named databases. Each database is a B+tree with
//! optional duplicate keys; transactions buffer their writes in an
//! in-memory index and reach the tree through a write-ahead journal.
//!
//! ```no_run
//! use burrow::{Environment, EnvConfig, EnvFlags, DbConfig, FindFlags};
//!
//! let mut config = EnvConfig::new("test.db");
//! config.flags = EnvFlags::ENABLE_TRANSACTIONS;
//! let env = Environment::create(config)?;
//! let db = env.create_db(1, DbConfig::default())?;
//!
//! db.insert(None, b"hello", b"world", burrow::InsertFlags::empty())?;
//! assert_eq!(db.get(None, b"hello")?, b"world");
//! # Ok::<(), burrow::Error>(())
//! ```

pub mod compressor;
pub mod cursor;
pub mod db;
pub mod env;
pub mod error;
pub mod journal;
pub mod os;
pub mod storage;
pub mod txn;
pub mod types;

// Re-export the public surface
pub use cursor::Cursor;
pub use db::{BulkOperation, BulkResult, Database, FindResult};
pub use env::{Environment, Txn};
pub use error::{Error, ErrorCode, Result};
pub use types::{
    ApproxMatch, CloseFlags, CursorFlags, DbConfig, DbFlags, EnvConfig, EnvFlags, FindFlags,
    InsertFlags, KeyType,
};
