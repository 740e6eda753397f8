//! Write-ahead journal: per-operation logging and changeset persistence.
//!
//! Two files rotate (`<name>.jrn0` / `<name>.jrn1`); once the active file
//! crosses the size threshold and no transaction is still open, writes
//! switch to the other file, whose committed tail is truncated first.
//!
//! Every entry starts with a fixed 32-byte little-endian header
//! `{lsn, followup_size, txn_id, type, dbname, reserved}`; the follow-up
//! body carries its own CRC32.

pub mod recovery;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::compressor::{compressor_for, Compressor};
use crate::error::{Error, ErrorCode, Result};
use crate::types::{DbName, Lsn, PageAddr, TxnId};

/// Size of the fixed entry header.
pub const ENTRY_HEADER_SIZE: usize = 32;

/// Default switch threshold for one journal file.
pub const SWITCH_THRESHOLD: u64 = 1024 * 1024;

// Entry types
pub const ENTRY_TXN_BEGIN: u32 = 1;
pub const ENTRY_TXN_ABORT: u32 = 2;
pub const ENTRY_TXN_COMMIT: u32 = 3;
pub const ENTRY_INSERT: u32 = 4;
pub const ENTRY_ERASE: u32 = 5;
pub const ENTRY_CHANGESET: u32 = 6;

/// A parsed journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    TxnBegin {
        txn_id: TxnId,
        lsn: Lsn,
    },
    TxnCommit {
        txn_id: TxnId,
        lsn: Lsn,
    },
    TxnAbort {
        txn_id: TxnId,
        lsn: Lsn,
    },
    Insert {
        txn_id: TxnId,
        lsn: Lsn,
        dbname: DbName,
        key: Vec<u8>,
        record: Vec<u8>,
        flags: u32,
    },
    Erase {
        txn_id: TxnId,
        lsn: Lsn,
        dbname: DbName,
        key: Vec<u8>,
        flags: u32,
        duplicate: u32,
    },
    Changeset {
        lsn: Lsn,
        last_blob_page: PageAddr,
        pages: Vec<(PageAddr, Vec<u8>)>,
    },
}

impl JournalEntry {
    pub fn lsn(&self) -> Lsn {
        match self {
            JournalEntry::TxnBegin { lsn, .. }
            | JournalEntry::TxnCommit { lsn, .. }
            | JournalEntry::TxnAbort { lsn, .. }
            | JournalEntry::Insert { lsn, .. }
            | JournalEntry::Erase { lsn, .. }
            | JournalEntry::Changeset { lsn, .. } => *lsn,
        }
    }
}

/// The journal of one environment.
pub struct Journal {
    paths: [PathBuf; 2],
    files: [Option<File>; 2],
    /// Index of the file currently appended to
    current: usize,
    threshold: u64,
    compression: u8,
}

impl Journal {
    fn journal_paths(stem: &Path) -> [PathBuf; 2] {
        let base = stem.to_string_lossy();
        [
            PathBuf::from(format!("{}.jrn0", base)),
            PathBuf::from(format!("{}.jrn1", base)),
        ]
    }

    /// Create fresh (truncated) journal files.
    pub fn create(stem: &Path, compression: u8) -> Result<Self> {
        let paths = Self::journal_paths(stem);
        let mut files = [None, None];
        for (i, path) in paths.iter().enumerate() {
            files[i] = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?,
            );
        }
        Ok(Journal {
            paths,
            files,
            current: 0,
            threshold: SWITCH_THRESHOLD,
            compression,
        })
    }

    /// Open existing journal files, creating missing ones empty.
    pub fn open(stem: &Path, compression: u8) -> Result<Self> {
        let paths = Self::journal_paths(stem);
        let mut files = [None, None];
        for (i, path) in paths.iter().enumerate() {
            files[i] = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?,
            );
        }
        let mut journal = Journal {
            paths,
            files,
            current: 0,
            threshold: SWITCH_THRESHOLD,
            compression,
        };
        // continue appending to the larger file
        if journal.file_size(1)? > journal.file_size(0)? {
            journal.current = 1;
        }
        Ok(journal)
    }

    fn file(&mut self, index: usize) -> Result<&mut File> {
        self.files[index]
            .as_mut()
            .ok_or_else(|| Error::new(ErrorCode::NotReady))
    }

    fn file_size(&mut self, index: usize) -> Result<u64> {
        Ok(self.file(index)?.metadata()?.len())
    }

    // ------------------------------------------------------------------
    // Appending
    // ------------------------------------------------------------------

    fn append(&mut self, header: &EntryHeader, body: &[u8]) -> Result<()> {
        let current = self.current;
        let file = self.file(current)?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&header.to_bytes())?;
        if !body.is_empty() {
            file.write_all(body)?;
        }
        Ok(())
    }

    pub fn append_txn_begin(&mut self, txn_id: TxnId, lsn: Lsn) -> Result<()> {
        self.append(&EntryHeader::bare(lsn, txn_id, ENTRY_TXN_BEGIN), &[])
    }

    pub fn append_txn_commit(&mut self, txn_id: TxnId, lsn: Lsn) -> Result<()> {
        self.append(&EntryHeader::bare(lsn, txn_id, ENTRY_TXN_COMMIT), &[])
    }

    pub fn append_txn_abort(&mut self, txn_id: TxnId, lsn: Lsn) -> Result<()> {
        self.append(&EntryHeader::bare(lsn, txn_id, ENTRY_TXN_ABORT), &[])
    }

    pub fn append_insert(
        &mut self,
        dbname: DbName,
        txn_id: TxnId,
        lsn: Lsn,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> Result<()> {
        // {key_size u16, ckey_size u16, record_size u32, crecord_size u32,
        //  insert_flags u32, crc32 u32, key..., record...}
        let mut body = Vec::with_capacity(20 + key.len() + record.len());
        body.extend_from_slice(&(key.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(record.len() as u32).to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        hasher.update(record);
        body.extend_from_slice(&hasher.finalize().to_le_bytes());
        body.extend_from_slice(key);
        body.extend_from_slice(record);

        let mut header = EntryHeader::bare(lsn, txn_id, ENTRY_INSERT);
        header.dbname = dbname;
        header.followup_size = body.len() as u64;
        self.append(&header, &body)
    }

    pub fn append_erase(
        &mut self,
        dbname: DbName,
        txn_id: TxnId,
        lsn: Lsn,
        key: &[u8],
        flags: u32,
        duplicate: u32,
    ) -> Result<()> {
        // {key_size u16, ckey_size u16, erase_flags u32, duplicate u32,
        //  crc32 u32, key...}
        let mut body = Vec::with_capacity(16 + key.len());
        body.extend_from_slice(&(key.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&duplicate.to_le_bytes());
        body.extend_from_slice(&crc32fast::hash(key).to_le_bytes());
        body.extend_from_slice(key);

        let mut header = EntryHeader::bare(lsn, txn_id, ENTRY_ERASE);
        header.dbname = dbname;
        header.followup_size = body.len() as u64;
        self.append(&header, &body)
    }

    /// Append the changeset of a flushed transaction batch: every touched
    /// page's full image, optionally compressed.
    pub fn append_changeset(
        &mut self,
        pages: &[(PageAddr, Vec<u8>)],
        last_blob_page: PageAddr,
        lsn: Lsn,
    ) -> Result<()> {
        let mut compressor = compressor_for(self.compression)?;

        let mut body = Vec::new();
        body.extend_from_slice(&(pages.len() as u32).to_le_bytes());
        body.extend_from_slice(&last_blob_page.to_le_bytes());
        for (address, raw) in pages {
            // {address u64, compressed_size u32, size u32, crc32 u32, data}
            let crc = crc32fast::hash(raw);
            let (compressed_size, data) = match &mut compressor {
                Some(z) => {
                    let packed = z.compress(raw)?;
                    if packed.len() < raw.len() {
                        (packed.len() as u32, packed)
                    } else {
                        (0, raw.clone())
                    }
                }
                None => (0, raw.clone()),
            };
            body.extend_from_slice(&address.to_le_bytes());
            body.extend_from_slice(&compressed_size.to_le_bytes());
            body.extend_from_slice(&(raw.len() as u32).to_le_bytes());
            body.extend_from_slice(&crc.to_le_bytes());
            body.extend_from_slice(&data);
        }

        let mut header = EntryHeader::bare(lsn, 0, ENTRY_CHANGESET);
        header.followup_size = body.len() as u64;
        self.append(&header, &body)
    }

    /// fsync the active file.
    pub fn flush(&mut self) -> Result<()> {
        let current = self.current;
        self.file(current)?.sync_all()?;
        Ok(())
    }

    /// Switch to the other file once the threshold is crossed. Only legal
    /// while no transaction is active (an active txn's begin entry must
    /// stay replayable).
    pub fn maybe_switch(&mut self, has_active_txns: bool) -> Result<()> {
        if has_active_txns {
            return Ok(());
        }
        let current = self.current;
        if self.file_size(current)? < self.threshold {
            return Ok(());
        }
        let other = 1 - current;
        self.file(other)?.set_len(0)?;
        self.current = other;
        log::debug!("journal switched to {}", self.paths[other].display());
        Ok(())
    }

    /// Truncate both files; everything up to the given point is durable
    /// in the backing file.
    pub fn clear(&mut self) -> Result<()> {
        for index in 0..2 {
            self.file(index)?.set_len(0)?;
            self.file(index)?.sync_all()?;
        }
        self.current = 0;
        Ok(())
    }

    /// Close the journal; unless `keep_files`, the files are removed.
    pub fn close(mut self, keep_files: bool) -> Result<()> {
        self.flush()?;
        self.files = [None, None];
        if !keep_files {
            for path in &self.paths {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reading (recovery)
    // ------------------------------------------------------------------

    /// Parse every entry of both files, ordered by lsn.
    pub fn read_entries(&mut self) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        for index in 0..2 {
            let compression = self.compression;
            let mut raw = Vec::new();
            let file = self.file(index)?;
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut raw)?;
            parse_entries(&raw, compression, &mut entries)?;
        }
        entries.sort_by_key(|e| e.lsn());
        Ok(entries)
    }
}

// ----------------------------------------------------------------------
// Entry header
// ----------------------------------------------------------------------

struct EntryHeader {
    lsn: Lsn,
    followup_size: u64,
    txn_id: TxnId,
    entry_type: u32,
    dbname: DbName,
}

impl EntryHeader {
    fn bare(lsn: Lsn, txn_id: TxnId, entry_type: u32) -> Self {
        EntryHeader {
            lsn,
            followup_size: 0,
            txn_id,
            entry_type,
            dbname: 0,
        }
    }

    fn to_bytes(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[8..16].copy_from_slice(&self.followup_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[24..28].copy_from_slice(&self.entry_type.to_le_bytes());
        buf[28..30].copy_from_slice(&self.dbname.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        EntryHeader {
            lsn: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            followup_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            txn_id: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            entry_type: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            dbname: u16::from_le_bytes(buf[28..30].try_into().unwrap()),
        }
    }
}

fn parse_entries(raw: &[u8], compression: u8, out: &mut Vec<JournalEntry>) -> Result<()> {
    let mut compressor = compressor_for(compression)?;
    let mut pos = 0usize;

    while pos + ENTRY_HEADER_SIZE <= raw.len() {
        let header = EntryHeader::from_bytes(&raw[pos..pos + ENTRY_HEADER_SIZE]);
        pos += ENTRY_HEADER_SIZE;
        if header.entry_type == 0 {
            // zeroed tail of a truncated file
            break;
        }
        let body_len = header.followup_size as usize;
        if pos + body_len > raw.len() {
            log::warn!("journal entry at lsn {} is truncated, stopping scan", header.lsn);
            break;
        }
        let body = &raw[pos..pos + body_len];
        pos += body_len;

        let entry = match header.entry_type {
            ENTRY_TXN_BEGIN => JournalEntry::TxnBegin {
                txn_id: header.txn_id,
                lsn: header.lsn,
            },
            ENTRY_TXN_COMMIT => JournalEntry::TxnCommit {
                txn_id: header.txn_id,
                lsn: header.lsn,
            },
            ENTRY_TXN_ABORT => JournalEntry::TxnAbort {
                txn_id: header.txn_id,
                lsn: header.lsn,
            },
            ENTRY_INSERT => parse_insert(&header, body)?,
            ENTRY_ERASE => parse_erase(&header, body)?,
            ENTRY_CHANGESET => parse_changeset(&header, body, &mut compressor)?,
            other => {
                return Err(Error::with_message(
                    ErrorCode::IntegrityViolated,
                    format!("unknown journal entry type {}", other),
                ));
            }
        };
        out.push(entry);
    }
    Ok(())
}

fn parse_insert(header: &EntryHeader, body: &[u8]) -> Result<JournalEntry> {
    if body.len() < 20 {
        return Err(Error::new(ErrorCode::IntegrityViolated));
    }
    let key_size = u16::from_le_bytes(body[0..2].try_into().unwrap()) as usize;
    let record_size = u32::from_le_bytes(body[4..8].try_into().unwrap()) as usize;
    let flags = u32::from_le_bytes(body[12..16].try_into().unwrap());
    let crc = u32::from_le_bytes(body[16..20].try_into().unwrap());
    if body.len() < 20 + key_size + record_size {
        return Err(Error::new(ErrorCode::IntegrityViolated));
    }
    let key = body[20..20 + key_size].to_vec();
    let record = body[20 + key_size..20 + key_size + record_size].to_vec();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key);
    hasher.update(&record);
    if hasher.finalize() != crc {
        return Err(Error::with_message(
            ErrorCode::IntegrityViolated,
            "journal insert entry crc mismatch",
        ));
    }

    Ok(JournalEntry::Insert {
        txn_id: header.txn_id,
        lsn: header.lsn,
        dbname: header.dbname,
        key,
        record,
        flags,
    })
}

fn parse_erase(header: &EntryHeader, body: &[u8]) -> Result<JournalEntry> {
    if body.len() < 16 {
        return Err(Error::new(ErrorCode::IntegrityViolated));
    }
    let key_size = u16::from_le_bytes(body[0..2].try_into().unwrap()) as usize;
    let flags = u32::from_le_bytes(body[4..8].try_into().unwrap());
    let duplicate = u32::from_le_bytes(body[8..12].try_into().unwrap());
    let crc = u32::from_le_bytes(body[12..16].try_into().unwrap());
    if body.len() < 16 + key_size {
        return Err(Error::new(ErrorCode::IntegrityViolated));
    }
    let key = body[16..16 + key_size].to_vec();
    if crc32fast::hash(&key) != crc {
        return Err(Error::with_message(
            ErrorCode::IntegrityViolated,
            "journal erase entry crc mismatch",
        ));
    }

    Ok(JournalEntry::Erase {
        txn_id: header.txn_id,
        lsn: header.lsn,
        dbname: header.dbname,
        key,
        flags,
        duplicate,
    })
}

fn parse_changeset(
    header: &EntryHeader,
    body: &[u8],
    compressor: &mut Option<Box<dyn Compressor>>,
) -> Result<JournalEntry> {
    if body.len() < 12 {
        return Err(Error::new(ErrorCode::IntegrityViolated));
    }
    let num_pages = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
    let last_blob_page = u64::from_le_bytes(body[4..12].try_into().unwrap());
    let mut pos = 12usize;

    let mut pages = Vec::with_capacity(num_pages);
    for _ in 0..num_pages {
        if pos + 20 > body.len() {
            return Err(Error::new(ErrorCode::IntegrityViolated));
        }
        let address = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
        let compressed_size = u32::from_le_bytes(body[pos + 8..pos + 12].try_into().unwrap());
        let size = u32::from_le_bytes(body[pos + 12..pos + 16].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(body[pos + 16..pos + 20].try_into().unwrap());
        pos += 20;

        let stored = if compressed_size > 0 {
            compressed_size as usize
        } else {
            size
        };
        if pos + stored > body.len() {
            return Err(Error::new(ErrorCode::IntegrityViolated));
        }
        let data = &body[pos..pos + stored];
        pos += stored;

        let raw = if compressed_size > 0 {
            match compressor {
                Some(z) => z.decompress(data, size)?,
                None => {
                    return Err(Error::with_message(
                        ErrorCode::NotImplemented,
                        "journal is compressed but no compressor is configured",
                    ));
                }
            }
        } else {
            data.to_vec()
        };

        if crc32fast::hash(&raw) != crc {
            return Err(Error::with_message(
                ErrorCode::IntegrityViolated,
                "journal page image crc mismatch",
            ));
        }
        pages.push((address, raw));
    }

    Ok(JournalEntry::Changeset {
        lsn: header.lsn,
        last_blob_page,
        pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::COMPRESSOR_ZLIB;
    use tempfile::tempdir;

    #[test]
    fn test_entry_roundtrip() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("env.db");
        let mut journal = Journal::create(&stem, 0).unwrap();

        journal.append_txn_begin(1, 10).unwrap();
        journal
            .append_insert(7, 1, 11, b"key", b"record", 0x20)
            .unwrap();
        journal.append_erase(7, 1, 12, b"gone", 0, 3).unwrap();
        journal.append_txn_commit(1, 13).unwrap();
        journal
            .append_changeset(&[(0x4000, vec![9u8; 128])], 0x8000, 14)
            .unwrap();
        journal.flush().unwrap();

        let entries = journal.read_entries().unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0], JournalEntry::TxnBegin { txn_id: 1, lsn: 10 });
        assert_eq!(
            entries[1],
            JournalEntry::Insert {
                txn_id: 1,
                lsn: 11,
                dbname: 7,
                key: b"key".to_vec(),
                record: b"record".to_vec(),
                flags: 0x20,
            }
        );
        assert_eq!(
            entries[2],
            JournalEntry::Erase {
                txn_id: 1,
                lsn: 12,
                dbname: 7,
                key: b"gone".to_vec(),
                flags: 0,
                duplicate: 3,
            }
        );
        match &entries[4] {
            JournalEntry::Changeset {
                lsn,
                last_blob_page,
                pages,
            } => {
                assert_eq!(*lsn, 14);
                assert_eq!(*last_blob_page, 0x8000);
                assert_eq!(pages, &[(0x4000, vec![9u8; 128])]);
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_compressed_changeset_roundtrip() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("env.db");
        let mut journal = Journal::create(&stem, COMPRESSOR_ZLIB).unwrap();

        let page = vec![0u8; 4096];
        journal.append_changeset(&[(0x4000, page.clone())], 0, 5).unwrap();
        journal.flush().unwrap();

        let entries = journal.read_entries().unwrap();
        match &entries[0] {
            JournalEntry::Changeset { pages, .. } => assert_eq!(pages[0].1, page),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_switch_and_clear() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("env.db");
        let mut journal = Journal::create(&stem, 0).unwrap();
        journal.threshold = 64;

        journal.append_insert(1, 1, 1, b"k", &vec![0u8; 128], 0).unwrap();
        assert_eq!(journal.current, 0);
        journal.maybe_switch(true).unwrap();
        assert_eq!(journal.current, 0, "active txns block the switch");
        journal.maybe_switch(false).unwrap();
        assert_eq!(journal.current, 1);

        journal.clear().unwrap();
        assert_eq!(journal.current, 0);
        assert!(journal.read_entries().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("env.db");
        let mut journal = Journal::create(&stem, 0).unwrap();
        journal.append_txn_begin(1, 1).unwrap();
        journal.append_insert(1, 1, 2, b"k", b"v", 0).unwrap();

        // chop the last entry in half
        let len = journal.file_size(0).unwrap();
        journal.file(0).unwrap().set_len(len - 4).unwrap();

        let entries = journal.read_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], JournalEntry::TxnBegin { txn_id: 1, lsn: 1 });
    }
}
