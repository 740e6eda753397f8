//! Environment: the root object owning device, pager, journal and the
//! open databases.
//!
//! File layout: page 0 is the header page (magic `ham\0`, version tuple,
//! page size, max databases, journal compression tag, pager-state blob
//! id) followed by one fixed-size btree header record per database slot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::Database;
use crate::error::{Error, ErrorCode, Result};
use crate::journal::recovery::{analyze, RecoveredOp};
use crate::journal::Journal;
use crate::os::{Device, DiskDevice, InMemoryDevice};
use crate::storage::btree::cursor::{CursorRegistry, CursorRegistryRef};
use crate::storage::btree::keylist::KeyListKind;
use crate::storage::btree::node::BtreeLayout;
use crate::storage::btree::recordlist::RecordListKind;
use crate::storage::btree::BtreeIndex;
use crate::storage::changeset::Context;
use crate::storage::page::{PageType, PAGE_HEADER_SIZE};
use crate::storage::pager::{AllocFlags, FetchFlags, PageManager, PagerConfig};
use crate::storage::worker::{Message, Worker};
use crate::txn::index::TxnIndex;
use crate::txn::{OpKind, TxnManager, TxnStatus};
use crate::types::{
    comparator_for, CloseFlags, CompareFn, DbConfig, DbName, EnvConfig, EnvFlags, InsertFlags,
    KeyType, Lsn, PageAddr, TxnId, KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED,
};

/// File magic, `"ham\0"`.
pub const MAGIC: [u8; 4] = [0x68, 0x61, 0x6d, 0x00];

/// Version tuple: major, minor, revision, file version.
pub const VERSION: [u8; 4] = [1, 0, 0, 4];

/// Offset of the database records inside the header page payload.
const DB_RECORDS_OFFSET: usize = 32;

/// Size of one persisted database record.
const DB_RECORD_SIZE: usize = 32;

/// Records above this size stop being stored inline in fixed slots.
const INLINE_FIXED_LIMIT: u32 = 64;

// ----------------------------------------------------------------------
// Internal state
// ----------------------------------------------------------------------

/// One open database.
pub(crate) struct DbState {
    pub name: DbName,
    pub config: DbConfig,
    pub btree: BtreeIndex,
    pub txn_index: TxnIndex,
    pub cursors: CursorRegistryRef,
    pub header_slot: usize,
    /// Root address as currently written in the header record
    pub recorded_root: PageAddr,
}

pub(crate) struct EnvState {
    pub lsn: Lsn,
    pub txns: TxnManager,
    pub journal: Option<Journal>,
    pub databases: HashMap<DbName, DbState>,
    pub closed: bool,
    /// The pager state blob was already decoded
    state_loaded: bool,
}

impl EnvState {
    pub fn next_lsn(&mut self) -> Lsn {
        self.lsn += 1;
        self.lsn
    }
}

pub(crate) struct EnvInner {
    pub config: EnvConfig,
    pub pm: Arc<PageManager>,
    pub header_addr: PageAddr,
    pub max_databases: u16,
    pub state: Mutex<EnvState>,
    pub worker: Mutex<Option<Worker>>,
}

/// An environment: one backing file (or in-memory arena) holding up to
/// `max_databases` named databases.
pub struct Environment {
    pub(crate) inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish()
    }
}

impl EnvInner {
    /// Hand the cache a chance to shed cold pages, off the caller's path.
    pub fn kick_purge(&self) {
        if self.pm.needs_purge() {
            if let Some(worker) = &*self.worker.lock() {
                worker.post(Message::PurgeCache);
            }
        }
    }

    pub fn locked_state(&self) -> Result<parking_lot::MutexGuard<'_, EnvState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::new(ErrorCode::NotReady));
        }
        Ok(state)
    }
}

impl Environment {
    // ==================================================================
    // Creation / opening
    // ==================================================================

    /// Create a fresh environment, truncating any existing file.
    pub fn create(config: EnvConfig) -> Result<Environment> {
        config.validate()?;
        let in_memory = config.flags.contains(EnvFlags::IN_MEMORY);

        let mut device: Box<dyn Device> = if in_memory {
            Box::new(InMemoryDevice::new(config.page_size, config.file_size_limit))
        } else {
            Box::new(DiskDevice::new(
                &config.path,
                config.flags,
                config.page_size,
                config.file_size_limit,
            ))
        };
        device.create()?;
        let device = Arc::new(Mutex::new(device));
        let pm = Arc::new(PageManager::new(pager_config(&config), device));

        let max_databases = resolve_max_databases(&config)?;

        // header page; address 0 on disk, first arena slot in memory
        let mut ctx = Context::new(None);
        let header = pm.alloc(&mut ctx, PageType::Header, AllocFlags::CLEAR_WITH_ZERO)?;
        let header_addr = {
            let mut guard = header.lock();
            let payload = guard.payload_mut();
            payload[0..4].copy_from_slice(&MAGIC);
            payload[4..8].copy_from_slice(&VERSION);
            payload[16..20].copy_from_slice(&config.page_size.to_le_bytes());
            payload[20..22].copy_from_slice(&max_databases.to_le_bytes());
            payload[22] = config.journal_compression << 4;
            guard.address()
        };

        let journal = if wants_journal(&config) {
            Some(Journal::create(
                &journal_stem(&config),
                config.journal_compression,
            )?)
        } else {
            None
        };

        pm.flush_all(false)?;

        let inner = Arc::new(EnvInner {
            config,
            pm: pm.clone(),
            header_addr,
            max_databases,
            state: Mutex::new(EnvState {
                lsn: 0,
                txns: TxnManager::new(),
                journal,
                databases: HashMap::new(),
                closed: false,
                state_loaded: true,
            }),
            worker: Mutex::new(Some(Worker::spawn(pm))),
        });
        Ok(Environment { inner })
    }

    /// Open an existing environment file.
    pub fn open(config: EnvConfig) -> Result<Environment> {
        if config.flags.contains(EnvFlags::IN_MEMORY) {
            return Err(Error::with_message(
                ErrorCode::InvParameter,
                "in-memory environments cannot be reopened",
            ));
        }

        // bootstrap: the real page size lives in the header
        let (page_size, max_databases, compression) = {
            let mut probe = DiskDevice::new(&config.path, config.flags, 1024, 0);
            probe.open()?;
            let mut buf = vec![0u8; 1024];
            probe.read(0, &mut buf)?;
            probe.close()?;

            let payload = &buf[PAGE_HEADER_SIZE..];
            if payload[0..4] != MAGIC {
                return Err(Error::new(ErrorCode::InvFileHeader));
            }
            if payload[7] != VERSION[3] {
                return Err(Error::new(ErrorCode::InvFileVersion));
            }
            let page_size = u32::from_le_bytes(payload[16..20].try_into().unwrap());
            if page_size < 1024 || !page_size.is_power_of_two() {
                return Err(Error::new(ErrorCode::InvFileHeader));
            }
            let max_databases = u16::from_le_bytes(payload[20..22].try_into().unwrap());
            (page_size, max_databases, payload[22] >> 4)
        };

        let mut config = config;
        config.page_size = page_size;
        config.journal_compression = compression;

        let mut device: Box<dyn Device> = Box::new(DiskDevice::new(
            &config.path,
            config.flags,
            page_size,
            config.file_size_limit,
        ));
        device.open()?;
        if device.file_size()? < page_size as u64 {
            return Err(Error::new(ErrorCode::InvFileHeader));
        }
        let device = Arc::new(Mutex::new(device));
        let pm = Arc::new(PageManager::new(pager_config(&config), device));

        let journal = if wants_journal(&config) {
            Some(Journal::open(
                &journal_stem(&config),
                config.journal_compression,
            )?)
        } else {
            None
        };

        let inner = Arc::new(EnvInner {
            config,
            pm: pm.clone(),
            header_addr: 0,
            max_databases,
            state: Mutex::new(EnvState {
                lsn: 0,
                txns: TxnManager::new(),
                journal,
                databases: HashMap::new(),
                closed: false,
                state_loaded: false,
            }),
            worker: Mutex::new(None),
        });
        let env = Environment { inner };

        if env.inner.config.flags.contains(EnvFlags::AUTO_RECOVERY) {
            env.recover()?;
        }
        env.load_pager_state()?;

        *env.inner.worker.lock() = Some(Worker::spawn(pm));
        Ok(env)
    }

    /// Decode the freelist and blob back-link; a no-op after the first
    /// call. Must run after recovery's changeset redo, never before.
    fn load_pager_state(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.state_loaded {
                return Ok(());
            }
            state.state_loaded = true;
        }
        let mut ctx = Context::new(None);
        let state_addr = self.read_header_field(&mut ctx, 24)?;
        if state_addr != 0 {
            self.inner.pm.load_state(&mut ctx, state_addr)?;
        }
        let header = self
            .inner
            .pm
            .fetch(&mut ctx, self.inner.header_addr, FetchFlags::READ_ONLY)?;
        let header_lsn = header.lock().lsn();
        let mut state = self.inner.state.lock();
        state.lsn = state.lsn.max(header_lsn);
        Ok(())
    }

    fn read_header_field(&self, ctx: &mut Context, offset: usize) -> Result<u64> {
        let header = self
            .inner
            .pm
            .fetch(ctx, self.inner.header_addr, FetchFlags::READ_ONLY)?;
        let guard = header.lock();
        Ok(u64::from_le_bytes(
            guard.payload()[offset..offset + 8].try_into().unwrap(),
        ))
    }

    // ==================================================================
    // Recovery
    // ==================================================================

    fn recover(&self) -> Result<()> {
        let entries = {
            let mut state = self.inner.state.lock();
            match &mut state.journal {
                Some(journal) => journal.read_entries()?,
                None => return Ok(()),
            }
        };
        if entries.is_empty() {
            return Ok(());
        }
        let plan = analyze(&entries);

        // phase 1: redo page images newer than the header page
        let header_lsn = {
            let mut buf = vec![0u8; self.inner.config.page_size as usize];
            self.inner
                .pm
                .device()
                .lock()
                .read(self.inner.header_addr, &mut buf)?;
            u64::from_le_bytes(buf[0..8].try_into().unwrap())
        };
        let mut redone = 0usize;
        let mut last_blob_page = 0;
        for (lsn, blob_page, pages) in &plan.changesets {
            if *lsn <= header_lsn {
                continue;
            }
            for (address, raw) in pages {
                self.inner.pm.device().lock().write(*address, raw)?;
            }
            last_blob_page = *blob_page;
            redone += pages.len();
        }
        if redone > 0 {
            log::info!("recovery redid {} page image(s)", redone);
            self.inner.pm.flush_all(true)?;
            if last_blob_page != 0 {
                self.inner.pm.set_last_blob_page(last_blob_page);
            }
        }

        // the freelist must be live before replay allocates pages
        self.load_pager_state()?;

        // phase 2: replay committed ops that did not make it into a page
        {
            let mut state = self.inner.state.lock();
            state.lsn = state.lsn.max(plan.max_lsn).max(header_lsn);
            state.txns.reseed(plan.max_txn_id + 1);
        }
        for op in &plan.ops {
            self.replay_op(op)?;
        }

        // checkpoint the recovered state
        self.flush_internal()?;
        let mut state = self.inner.state.lock();
        if let Some(journal) = &mut state.journal {
            journal.clear()?;
        }
        log::info!("recovery complete, lsn {}", state.lsn);
        Ok(())
    }

    fn replay_op(&self, op: &RecoveredOp) -> Result<()> {
        let mut state = self.inner.state.lock();
        let state = &mut *state;
        if !state.databases.contains_key(&op.dbname) {
            match open_db_state(&self.inner, state, op.dbname, None) {
                Ok(db_state) => {
                    state.databases.insert(op.dbname, db_state);
                }
                Err(err) if err.code() == ErrorCode::DatabaseNotFound => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        let db = state.databases.get_mut(&op.dbname).expect("opened above");

        let mut ctx = Context::new(None);

        // idempotence: skip ops already reflected in the target leaf
        if db.btree.root != 0 {
            let (leaf, _, _) = db.btree.find_leaf(&mut ctx, &op.key, true)?;
            if leaf.lock().lsn() >= op.lsn {
                return Ok(());
            }
        }

        let result = if op.erase {
            let dup = if op.duplicate > 0 {
                Some(op.duplicate as usize - 1)
            } else {
                None
            };
            db.btree.erase(&mut ctx, &op.key, dup)
        } else {
            let flags = InsertFlags::from_bits_truncate(op.flags);
            db.btree
                .insert(&mut ctx, &op.key, &op.record, flags, None)
        };
        match result {
            Ok(()) => {}
            Err(err)
                if err.code() == ErrorCode::KeyNotFound
                    || err.code() == ErrorCode::DuplicateKey => {}
            Err(err) => return Err(err),
        }
        sync_root(&self.inner, &mut ctx, db)?;
        Ok(())
    }

    // ==================================================================
    // Databases
    // ==================================================================

    /// Create a database under `name`.
    pub fn create_db(&self, name: DbName, db_config: DbConfig) -> Result<Database> {
        if name == 0 {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        validate_db_config(&db_config)?;
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;

        if state.databases.contains_key(&name) {
            return Err(Error::new(ErrorCode::DatabaseAlreadyOpen));
        }

        let mut ctx = Context::new(None);
        let mut free_slot = None;
        for slot in 0..self.inner.max_databases as usize {
            let record = self.read_db_record(&mut ctx, slot)?;
            if record.dbname == name {
                return Err(Error::new(ErrorCode::DatabaseAlreadyOpen));
            }
            if record.dbname == 0 && free_slot.is_none() {
                free_slot = Some(slot);
            }
        }
        let slot = free_slot.ok_or_else(|| Error::new(ErrorCode::LimitsReached))?;

        let cmp = comparator_for(db_config.key_type, db_config.custom_compare.clone())?;
        let layout = make_layout(&db_config, self.inner.config.page_size);
        // a node must hold at least two slots or splits cannot make room
        if layout.geometry(true).capacity < 2 || layout.geometry(false).capacity < 2 {
            return Err(Error::new(ErrorCode::InvKeySize));
        }
        let cursors: CursorRegistryRef = Arc::new(Mutex::new(CursorRegistry::new()));
        let mut btree = BtreeIndex::new(layout, cmp.clone(), self.inner.pm.clone(), cursors.clone(), 0);
        btree.create(&mut ctx)?;

        let record = DbRecord {
            root: btree.root,
            dbname: name,
            flags: db_config.flags.bits(),
            key_type: db_config.key_type as u16,
            key_size: db_config.key_size,
            record_size: db_config.record_size,
        };
        self.write_db_record(&mut ctx, slot, &record)?;
        // the new database must survive a crash before the first commit
        flush_changeset(&self.inner, state, &mut ctx)?;

        state.databases.insert(
            name,
            DbState {
                name,
                config: db_config,
                txn_index: TxnIndex::new(cmp),
                recorded_root: btree.root,
                btree,
                cursors,
                header_slot: slot,
            },
        );
        self.inner.kick_purge();
        Ok(Database::new(self.inner.clone(), name))
    }

    /// Open an existing database.
    pub fn open_db(&self, name: DbName) -> Result<Database> {
        self.open_db_with(name, None)
    }

    /// Open a database that was created with a custom comparator.
    pub fn open_db_with(&self, name: DbName, custom: Option<CompareFn>) -> Result<Database> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;
        if state.databases.contains_key(&name) {
            return Err(Error::new(ErrorCode::DatabaseAlreadyOpen));
        }
        let db_state = open_db_state(&self.inner, state, name, custom)?;
        state.databases.insert(name, db_state);
        Ok(Database::new(self.inner.clone(), name))
    }

    /// Remove a database and free all of its pages and blobs.
    pub fn erase_db(&self, name: DbName) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;

        let mut db = match state.databases.remove(&name) {
            Some(db) => {
                if db.cursors.lock().open_count() > 0 {
                    state.databases.insert(name, db);
                    return Err(Error::new(ErrorCode::CursorStillOpen));
                }
                db
            }
            None => open_db_state(&self.inner, state, name, None)?,
        };

        let mut ctx = Context::new(None);
        db.btree.drop_tree(&mut ctx)?;
        self.write_db_record(&mut ctx, db.header_slot, &DbRecord::empty())?;
        flush_changeset(&self.inner, state, &mut ctx)?;
        self.inner.kick_purge();
        Ok(())
    }

    /// Rename a database.
    pub fn rename_db(&self, old: DbName, new: DbName) -> Result<()> {
        if new == 0 || old == new {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;
        if state.databases.contains_key(&old) {
            return Err(Error::new(ErrorCode::DatabaseAlreadyOpen));
        }

        let mut ctx = Context::new(None);
        let mut found = None;
        for slot in 0..self.inner.max_databases as usize {
            let record = self.read_db_record(&mut ctx, slot)?;
            if record.dbname == new {
                return Err(Error::new(ErrorCode::DatabaseAlreadyOpen));
            }
            if record.dbname == old {
                found = Some((slot, record));
            }
        }
        let (slot, mut record) = found.ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        record.dbname = new;
        self.write_db_record(&mut ctx, slot, &record)?;
        flush_changeset(&self.inner, state, &mut ctx)?;
        Ok(())
    }

    /// Names of all databases in the environment.
    pub fn database_names(&self) -> Result<Vec<DbName>> {
        let _state = self.inner.locked_state()?;
        let mut ctx = Context::new(None);
        let mut names = Vec::new();
        for slot in 0..self.inner.max_databases as usize {
            let record = self.read_db_record(&mut ctx, slot)?;
            if record.dbname != 0 {
                names.push(record.dbname);
            }
        }
        Ok(names)
    }

    fn read_db_record(&self, ctx: &mut Context, slot: usize) -> Result<DbRecord> {
        read_db_record(&self.inner, ctx, slot)
    }

    fn write_db_record(&self, ctx: &mut Context, slot: usize, record: &DbRecord) -> Result<()> {
        write_db_record(&self.inner, ctx, slot, record)
    }

    // ==================================================================
    // Transactions
    // ==================================================================

    /// Begin an explicit transaction.
    pub fn txn_begin(&self) -> Result<Txn> {
        if !self
            .inner
            .config
            .flags
            .contains(EnvFlags::ENABLE_TRANSACTIONS)
        {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        let mut state = self.inner.locked_state()?;
        let begin_lsn = state.next_lsn();
        let id = state.txns.begin(begin_lsn, false);
        Ok(Txn {
            inner: self.inner.clone(),
            id,
            finished: false,
        })
    }

    /// Flush committed transactions, the pager state and all dirty pages.
    pub fn flush(&self) -> Result<()> {
        self.flush_internal()
    }

    fn flush_internal(&self) -> Result<()> {
        let mut state = self.inner.locked_state()?;
        let state = &mut *state;
        flush_committed_txns(&self.inner, state)?;
        checkpoint(&self.inner, state)?;
        Ok(())
    }

    // ==================================================================
    // Closing
    // ==================================================================

    /// Close the environment. `DONT_CLEAR_LOG` keeps the journal files
    /// for a later recovery run.
    pub fn close(self, flags: CloseFlags) -> Result<()> {
        close_inner(&self.inner, flags)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let _ = close_inner(&self.inner, CloseFlags::empty());
    }
}

// ----------------------------------------------------------------------
// Transactions (public handle)
// ----------------------------------------------------------------------

/// An explicit transaction. Dropping an unfinished transaction aborts it.
pub struct Txn {
    pub(crate) inner: Arc<EnvInner>,
    pub(crate) id: TxnId,
    finished: bool,
}

impl Txn {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        commit_txn(&self.inner, self.id)
    }

    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        abort_txn(&self.inner, self.id)
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.finished {
            let _ = abort_txn(&self.inner, self.id);
        }
    }
}

// ----------------------------------------------------------------------
// Shared internals (used by db.rs and cursor.rs)
// ----------------------------------------------------------------------

pub(crate) fn commit_txn(inner: &EnvInner, id: TxnId) -> Result<()> {
    let mut state = inner.locked_state()?;
    commit_txn_locked(inner, &mut state, id)?;
    Ok(())
}

pub(crate) fn commit_txn_locked(inner: &EnvInner, state: &mut EnvState, id: TxnId) -> Result<()> {
    if state.txns.status(id) != Some(TxnStatus::Active) {
        return Err(Error::new(ErrorCode::InvParameter));
    }

    // journal begin + ops + commit as one batch
    let is_temporary = state.txns.txn(id)?.is_temporary;
    let begin_lsn = state.txns.txn(id)?.begin_lsn;
    let op_ids = state.txns.ops_of(id);
    let commit_lsn = state.next_lsn();

    if let Some(journal) = &mut state.journal {
        if !is_temporary {
            journal.append_txn_begin(id, begin_lsn)?;
        }
        for op_id in &op_ids {
            let op = state.txns.op(*op_id);
            match op.kind {
                OpKind::Erase => journal.append_erase(
                    op.dbname,
                    id,
                    op.lsn,
                    &op.key,
                    op.original_flags,
                    op.referenced_duplicate,
                )?,
                OpKind::Nop => {}
                _ => journal.append_insert(
                    op.dbname,
                    id,
                    op.lsn,
                    &op.key,
                    &op.record,
                    op.original_flags,
                )?,
            }
        }
        if !is_temporary {
            journal.append_txn_commit(id, commit_lsn)?;
        }
        if inner
            .config
            .flags
            .contains(EnvFlags::FLUSH_TRANSACTIONS_IMMEDIATELY)
        {
            journal.flush()?;
        }
    }

    state.txns.commit(id)?;

    let flags = inner.config.flags;
    let threshold = inner.config.journal_switch_threshold as usize;
    if !flags.contains(EnvFlags::DONT_FLUSH_TRANSACTIONS)
        && (flags.contains(EnvFlags::FLUSH_TRANSACTIONS_IMMEDIATELY)
            || state.txns.committed_unflushed().len() >= threshold)
    {
        flush_committed_txns(inner, state)?;
    }
    inner.kick_purge();
    Ok(())
}

pub(crate) fn abort_txn(inner: &EnvInner, id: TxnId) -> Result<()> {
    let mut state = inner.locked_state()?;
    abort_txn_locked(&mut state, id)
}

pub(crate) fn abort_txn_locked(state: &mut EnvState, id: TxnId) -> Result<()> {
    if state.txns.status(id) != Some(TxnStatus::Active) {
        return Err(Error::new(ErrorCode::InvParameter));
    }
    state.txns.abort(id)?;
    cleanup_released_ops(state);
    Ok(())
}

/// Drop released ops out of the per-database indexes and detach cursors.
fn cleanup_released_ops(state: &mut EnvState) {
    let released = state.txns.release_closed_txns();
    for (op_id, op) in released {
        if let Some(db) = state.databases.get_mut(&op.dbname) {
            db.txn_index.remove_op(op.node, op_id);
            db.cursors.lock().detach_from_op(op_id);
        }
    }
    for db in state.databases.values_mut() {
        if db.txn_index.total_ops() == 0 && !db.txn_index.is_empty() {
            db.txn_index.clear();
        }
    }
}

/// Replay every committed transaction into the btree, journal the
/// changeset, then write the pages.
pub(crate) fn flush_committed_txns(inner: &EnvInner, state: &mut EnvState) -> Result<()> {
    let batch = state.txns.committed_unflushed();
    if batch.is_empty() {
        return Ok(());
    }

    let mut ctx = Context::new(None);
    for txn_id in &batch {
        for op_id in state.txns.ops_of(*txn_id) {
            let op = state.txns.op(op_id).clone();
            let db = match state.databases.get_mut(&op.dbname) {
                Some(db) => db,
                None => continue,
            };
            let result = apply_op_to_btree(db, &mut ctx, &op);
            match result {
                Ok(()) => {}
                Err(err)
                    if err.code() == ErrorCode::KeyNotFound
                        || err.code() == ErrorCode::DuplicateKey =>
                {
                    log::warn!("flush skipped op on db {}: {}", op.dbname, err);
                }
                Err(err) => return Err(err),
            }
            state.txns.op_mut(op_id).is_flushed = true;
        }
        state.txns.mark_flushed(*txn_id)?;
    }

    // roots may have moved; keep the header records current
    for db in state.databases.values_mut() {
        sync_root(inner, &mut ctx, db)?;
    }

    let pages = ctx.changeset.len();
    flush_changeset(inner, state, &mut ctx)?;

    cleanup_released_ops(state);

    if let Some(journal) = &mut state.journal {
        journal.maybe_switch(state.txns.has_active_txns())?;
    }
    log::debug!(
        "flushed {} transaction(s), changeset of {} page(s)",
        batch.len(),
        pages
    );
    Ok(())
}

/// Atomically persist one top-level operation's changeset: journal entry
/// first, then the pages in place, then fsync.
pub(crate) fn flush_changeset(
    inner: &EnvInner,
    state: &mut EnvState,
    ctx: &mut Context,
) -> Result<()> {
    if ctx.changeset.is_empty() {
        return Ok(());
    }
    let lsn = state.next_lsn();

    if let Some(journal) = &mut state.journal {
        let mut images = Vec::with_capacity(ctx.changeset.len());
        for page in ctx.changeset.pages() {
            let mut guard = page.lock();
            guard.set_lsn(lsn);
            if inner.pm.config().crc_enabled {
                guard.update_crc();
            }
            images.push((guard.address(), guard.raw_data().to_vec()));
        }
        journal.append_changeset(&images, inner.pm.last_blob_page(), lsn)?;
        journal.flush()?;
    }

    for page in ctx.changeset.pages() {
        inner.pm.flush_page(page, lsn)?;
    }
    inner.pm.device().lock().flush()?;
    ctx.changeset.clear();
    Ok(())
}

fn apply_op_to_btree(
    db: &mut DbState,
    ctx: &mut Context,
    op: &crate::txn::TxnOperation,
) -> Result<()> {
    match op.kind {
        OpKind::Nop => Ok(()),
        OpKind::Erase => {
            let dup = if op.referenced_duplicate > 0 {
                Some(op.referenced_duplicate as usize - 1)
            } else {
                None
            };
            db.btree.erase(ctx, &op.key, dup)
        }
        OpKind::Insert => db
            .btree
            .insert(ctx, &op.key, &op.record, InsertFlags::empty(), None),
        OpKind::InsertOverwrite => {
            db.btree
                .insert(ctx, &op.key, &op.record, InsertFlags::OVERWRITE, None)
        }
        OpKind::InsertDuplicate => {
            let original = InsertFlags::from_bits_truncate(op.original_flags);
            let position = duplicate_position(original, op.referenced_duplicate);
            db.btree
                .insert(ctx, &op.key, &op.record, InsertFlags::DUPLICATE, position)
        }
    }
}

/// Map the caller's duplicate-position flags to a table position.
pub(crate) fn duplicate_position(
    flags: InsertFlags,
    referenced_duplicate: u32,
) -> Option<crate::storage::btree::recordlist::DupPosition> {
    use crate::storage::btree::recordlist::DupPosition;
    let reference = referenced_duplicate.saturating_sub(1) as usize;
    if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
        Some(DupPosition::First)
    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
        Some(DupPosition::Before(reference))
    } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
        Some(DupPosition::After(reference))
    } else {
        // DUPLICATE_INSERT_LAST is the default
        Some(DupPosition::Last)
    }
}

/// Write back a database's root address if it moved.
pub(crate) fn sync_root(inner: &EnvInner, ctx: &mut Context, db: &mut DbState) -> Result<()> {
    if db.btree.root == db.recorded_root {
        return Ok(());
    }
    let mut record = read_db_record(inner, ctx, db.header_slot)?;
    record.root = db.btree.root;
    write_db_record(inner, ctx, db.header_slot, &record)?;
    db.recorded_root = db.btree.root;
    Ok(())
}

/// Persist the pager state and the header page, then write everything.
fn checkpoint(inner: &EnvInner, state: &mut EnvState) -> Result<()> {
    let mut ctx = Context::new(None);
    let state_addr = inner.pm.store_state(&mut ctx)?;

    let lsn = state.lsn;
    let header = inner
        .pm
        .fetch(&mut ctx, inner.header_addr, FetchFlags::empty())?;
    {
        let mut guard = header.lock();
        guard.set_lsn(lsn);
        guard.payload_mut()[24..32].copy_from_slice(&state_addr.to_le_bytes());
        guard.set_dirty(true);
    }
    inner.pm.flush_all(false)?;

    if let Some(journal) = &mut state.journal {
        if !state.txns.has_active_txns() && state.txns.committed_unflushed().is_empty() {
            journal.clear()?;
        }
    }
    Ok(())
}

fn close_inner(inner: &Arc<EnvInner>, flags: CloseFlags) -> Result<()> {
    {
        let mut state = inner.state.lock();
        if state.closed {
            return Ok(());
        }
        let state = &mut *state;

        // abort whatever is still active, then flush the committed tail
        let open_txns: Vec<TxnId> = (1..state.txns.next_txn_id())
            .filter(|id| state.txns.is_active(*id))
            .collect();
        if !open_txns.is_empty() {
            log::warn!("close aborts {} open transaction(s)", open_txns.len());
        }
        for id in open_txns {
            state.txns.abort(id)?;
        }
        cleanup_released_ops(state);

        flush_committed_txns(inner, state)?;

        // write roots and trim the file tail before the final checkpoint
        let mut ctx = Context::new(None);
        for db in state.databases.values_mut() {
            sync_root(inner, &mut ctx, db)?;
        }
        if !inner.config.flags.contains(EnvFlags::IN_MEMORY) {
            inner.pm.truncate_tail()?;
        }
        checkpoint(inner, state)?;

        if let Some(journal) = state.journal.take() {
            journal.close(flags.contains(CloseFlags::DONT_CLEAR_LOG))?;
        }
        state.closed = true;
        state.databases.clear();
    }

    // stop the worker, then the device
    inner.worker.lock().take();
    inner.pm.device().lock().close()?;
    Ok(())
}

// ----------------------------------------------------------------------
// Header records
// ----------------------------------------------------------------------

pub(crate) struct DbRecord {
    pub root: PageAddr,
    pub dbname: DbName,
    pub flags: u32,
    pub key_type: u16,
    pub key_size: u16,
    pub record_size: u32,
}

impl DbRecord {
    fn empty() -> Self {
        DbRecord {
            root: 0,
            dbname: 0,
            flags: 0,
            key_type: 0,
            key_size: 0,
            record_size: 0,
        }
    }
}

pub(crate) fn read_db_record(
    inner: &EnvInner,
    ctx: &mut Context,
    slot: usize,
) -> Result<DbRecord> {
    let header = inner
        .pm
        .fetch(ctx, inner.header_addr, FetchFlags::READ_ONLY)?;
    let guard = header.lock();
    let base = DB_RECORDS_OFFSET + slot * DB_RECORD_SIZE;
    let raw = &guard.payload()[base..base + DB_RECORD_SIZE];
    Ok(DbRecord {
        root: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
        dbname: u16::from_le_bytes(raw[8..10].try_into().unwrap()),
        flags: u32::from_le_bytes(raw[10..14].try_into().unwrap()),
        key_type: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
        key_size: u16::from_le_bytes(raw[16..18].try_into().unwrap()),
        record_size: u32::from_le_bytes(raw[18..22].try_into().unwrap()),
    })
}

pub(crate) fn write_db_record(
    inner: &EnvInner,
    ctx: &mut Context,
    slot: usize,
    record: &DbRecord,
) -> Result<()> {
    let header = inner.pm.fetch(ctx, inner.header_addr, FetchFlags::empty())?;
    let mut guard = header.lock();
    let base = DB_RECORDS_OFFSET + slot * DB_RECORD_SIZE;
    let raw = &mut guard.payload_mut()[base..base + DB_RECORD_SIZE];
    raw.fill(0);
    raw[0..8].copy_from_slice(&record.root.to_le_bytes());
    raw[8..10].copy_from_slice(&record.dbname.to_le_bytes());
    raw[10..14].copy_from_slice(&record.flags.to_le_bytes());
    raw[14..16].copy_from_slice(&record.key_type.to_le_bytes());
    raw[16..18].copy_from_slice(&record.key_size.to_le_bytes());
    raw[18..22].copy_from_slice(&record.record_size.to_le_bytes());
    guard.set_dirty(true);
    Ok(())
}

fn open_db_state(
    inner: &Arc<EnvInner>,
    _state: &mut EnvState,
    name: DbName,
    custom: Option<CompareFn>,
) -> Result<DbState> {
    let mut ctx = Context::new(None);
    let mut found = None;
    for slot in 0..inner.max_databases as usize {
        let record = read_db_record(inner, &mut ctx, slot)?;
        if record.dbname == name {
            found = Some((slot, record));
            break;
        }
    }
    let (slot, record) = found.ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;

    let key_type = KeyType::from_u16(record.key_type)?;
    let db_config = DbConfig {
        flags: crate::types::DbFlags::from_bits_truncate(record.flags),
        key_type,
        key_size: record.key_size,
        record_size: record.record_size,
        custom_compare: custom.clone(),
    };
    let cmp = comparator_for(key_type, custom)?;
    let layout = make_layout(&db_config, inner.config.page_size);
    let cursors: CursorRegistryRef = Arc::new(Mutex::new(CursorRegistry::new()));
    let btree = BtreeIndex::new(
        layout,
        cmp.clone(),
        inner.pm.clone(),
        cursors.clone(),
        record.root,
    );

    Ok(DbState {
        name,
        config: db_config,
        txn_index: TxnIndex::new(cmp),
        recorded_root: record.root,
        btree,
        cursors,
        header_slot: slot,
    })
}

// ----------------------------------------------------------------------
// Configuration helpers
// ----------------------------------------------------------------------

fn pager_config(config: &EnvConfig) -> PagerConfig {
    let capacity = (config.cache_size / config.page_size as u64).max(16) as usize;
    PagerConfig {
        page_size: config.page_size,
        cache_capacity: capacity,
        cache_unlimited: config.flags.contains(EnvFlags::CACHE_UNLIMITED),
        crc_enabled: config.flags.contains(EnvFlags::ENABLE_CRC32),
    }
}

fn wants_journal(config: &EnvConfig) -> bool {
    config.flags.contains(EnvFlags::ENABLE_TRANSACTIONS)
        && !config.flags.contains(EnvFlags::DISABLE_RECOVERY)
        && !config.flags.contains(EnvFlags::IN_MEMORY)
        && !config.flags.contains(EnvFlags::READ_ONLY)
}

fn journal_stem(config: &EnvConfig) -> PathBuf {
    if config.log_directory.is_empty() {
        PathBuf::from(&config.path)
    } else {
        let file = Path::new(&config.path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "env".to_string());
        Path::new(&config.log_directory).join(file)
    }
}

fn resolve_max_databases(config: &EnvConfig) -> Result<u16> {
    let usable = config.page_size as usize - PAGE_HEADER_SIZE;
    let fit = ((usable - DB_RECORDS_OFFSET) / DB_RECORD_SIZE) as u16;
    if config.max_databases == 0 {
        Ok(fit)
    } else if config.max_databases <= fit {
        Ok(config.max_databases)
    } else {
        Err(Error::with_message(
            ErrorCode::InvParameter,
            format!("at most {} databases fit the header page", fit),
        ))
    }
}

fn validate_db_config(config: &DbConfig) -> Result<()> {
    if config.key_type == KeyType::Custom && config.custom_compare.is_none() {
        return Err(Error::new(ErrorCode::InvParameter));
    }
    if let Some(fixed) = config.key_type.fixed_size() {
        if config.key_size != KEY_SIZE_UNLIMITED && config.key_size != fixed {
            return Err(Error::new(ErrorCode::InvKeySize));
        }
    }
    if config.key_size != KEY_SIZE_UNLIMITED && config.key_size == 0 {
        return Err(Error::new(ErrorCode::InvKeySize));
    }
    if config.record_size != RECORD_SIZE_UNLIMITED
        && config.flags.contains(crate::types::DbFlags::ENABLE_DUPLICATES)
        && config.record_size > INLINE_FIXED_LIMIT
    {
        // fixed oversized records with duplicates would not fit a slot
        return Err(Error::new(ErrorCode::InvRecordSize));
    }
    Ok(())
}

pub(crate) fn make_layout(config: &DbConfig, page_size: u32) -> BtreeLayout {
    let key_kind = match config.key_type.fixed_size() {
        Some(size) => KeyListKind::Fixed(size),
        None => {
            if config.key_size != KEY_SIZE_UNLIMITED {
                KeyListKind::Fixed(config.key_size)
            } else {
                KeyListKind::Variable
            }
        }
    };
    let leaf_records = if config.flags.contains(crate::types::DbFlags::ENABLE_DUPLICATES) {
        RecordListKind::Duplicate
    } else if config.record_size != RECORD_SIZE_UNLIMITED && config.record_size <= INLINE_FIXED_LIMIT
    {
        RecordListKind::InlineFixed(config.record_size)
    } else {
        RecordListKind::Default
    };
    BtreeLayout {
        key_kind,
        leaf_records,
        page_size,
    }
}
