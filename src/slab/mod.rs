// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Append-only, multi-file record log ("slab store").
//!
//! A store directory holds files `data_0`, `data_1`, ... Each file starts
//! with an `'S'` record whose payload is the logical offset at which the
//! slab begins; one 64-bit logical offset space is shared across all slabs.
//! Node (`'N'`) and root (`'R'`) records are appended to the current slab;
//! once a slab reaches the goal size, the next write opens a new file.
//!
//! Records are framed as `tag:u8 | length:varint | payload`.
//!
//! The slab is the unit of truncation: `clear_before` unlinks whole files
//! that lie entirely before a given logical offset.

use crate::coding::DecodeError;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};
use varint_rs::{VarintReader, VarintWriter};

/// Slab header record; payload is the slab's logical start offset
pub const TAG_SLAB_HEADER: u8 = b'S';

/// Node record; payload is opaque to the store
pub const TAG_NODE: u8 = b'N';

/// Root record; payload is opaque to the store
pub const TAG_ROOT: u8 = b'R';

/// Default slab goal size (10 MiB)
pub const DEFAULT_SLAB_GOAL_SIZE: u64 = 10 * 1_024 * 1_024;

const SLAB_FILE_PREFIX: &str = "data_";

fn lock_poisoned() -> crate::Error {
    crate::Error::Io(std::io::Error::other("slab store lock is poisoned"))
}

#[cfg(not(target_os = "windows"))]
fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}

struct Slab {
    path: PathBuf,
    file: File,
}

struct SlabStoreInner {
    /// All slabs, keyed by logical start offset
    slabs: BTreeMap<u64, Slab>,

    /// Logical end of the log; the next record lands here
    end: u64,

    /// Logical offset of the most recent root record
    root: Option<u64>,

    /// Number of the next slab file to create
    next_slab_no: u64,
}

/// The append-only record log backing a store directory.
pub(crate) struct SlabStore {
    dir: PathBuf,
    goal_slab_size: u64,
    inner: Mutex<SlabStoreInner>,
}

impl SlabStore {
    /// Opens (or creates) the slab store in `dir` and recovers the most
    /// recent well-formed root record.
    pub fn open(dir: &Path, create: bool, goal_slab_size: u64) -> crate::Result<Self> {
        if !dir.try_exists()? {
            if !create {
                return Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("store directory {dir:?} does not exist"),
                )));
            }

            log::info!("Creating store directory {dir:?}");
            std::fs::create_dir_all(dir)?;
            fsync_directory(dir)?;
        }

        let store = Self {
            dir: dir.into(),
            goal_slab_size,
            inner: Mutex::new(SlabStoreInner {
                slabs: BTreeMap::new(),
                end: 0,
                root: None,
                next_slab_no: 0,
            }),
        };

        {
            let mut inner = store.inner.lock().map_err(|_| lock_poisoned())?;
            store.recover(&mut inner)?;

            if inner.slabs.is_empty() {
                store.next_file(&mut inner)?;
            } else {
                inner.root = store.find_root(&mut inner)?;
            }
        }

        Ok(store)
    }

    /// Appends a node record, returning its logical offset.
    pub fn write_node(&self, payload: &[u8]) -> crate::Result<u64> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned())?;
        self.write_record(&mut inner, TAG_NODE, payload)
    }

    /// Appends a root record and makes it the current root pointer.
    pub fn write_root(&self, payload: &[u8]) -> crate::Result<u64> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned())?;
        let offset = self.write_record(&mut inner, TAG_ROOT, payload)?;
        inner.root = Some(offset);
        Ok(offset)
    }

    /// Reads the node record at the given logical offset.
    pub fn read_node(&self, offset: u64) -> crate::Result<Vec<u8>> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned())?;
        read_record_at(&mut inner, offset, TAG_NODE)
    }

    /// Reads the current root record, if any.
    pub fn read_root(&self) -> crate::Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned())?;

        match inner.root {
            Some(offset) => Ok(Some(read_record_at(&mut inner, offset, TAG_ROOT)?)),
            None => Ok(None),
        }
    }

    /// Unlinks every slab that lies entirely before the slab containing
    /// `offset`. The slab holding `offset` is never deleted.
    pub fn clear_before(&self, offset: u64) -> crate::Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned())?;

        let Some((&keep_from, _)) = inner.slabs.range(..=offset).next_back() else {
            return Ok(());
        };

        let stale: Vec<u64> = inner.slabs.range(..keep_from).map(|(&start, _)| start).collect();

        if stale.is_empty() {
            return Ok(());
        }

        for start in stale {
            if let Some(slab) = inner.slabs.remove(&start) {
                log::debug!("Unlinking stale slab {:?} (logical start {start})", slab.path);

                // Close before unlink
                drop(slab.file);
                std::fs::remove_file(&slab.path)?;
            }
        }

        fsync_directory(&self.dir)?;

        Ok(())
    }

    /// Fsyncs the current slab file and the store directory.
    pub fn persist(&self) -> crate::Result<()> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned())?;

        if let Some(slab) = inner.slabs.values().next_back() {
            slab.file.sync_all()?;
        }

        fsync_directory(&self.dir)?;

        Ok(())
    }

    /// Number of slab files currently on disk.
    pub fn slab_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.slabs.len()).unwrap_or_default()
    }

    fn write_record(&self, inner: &mut SlabStoreInner, tag: u8, payload: &[u8]) -> crate::Result<u64> {
        let (&slab_start, slab) = inner
            .slabs
            .iter_mut()
            .next_back()
            .ok_or_else(|| crate::Error::Io(std::io::Error::other("slab store has no open slab")))?;

        let pos = slab.file.seek(SeekFrom::End(0))?;

        let mut buf = Vec::with_capacity(1 + 5 + payload.len());
        buf.write_u8(tag)?;
        buf.write_u64_varint(payload.len() as u64)?;
        buf.extend_from_slice(payload);

        slab.file.write_all(&buf)?;

        let offset = slab_start + pos;
        inner.end = slab_start + pos + buf.len() as u64;

        if inner.end - slab_start >= self.goal_slab_size {
            self.next_file(inner)?;
        }

        Ok(offset)
    }

    /// Seals the current slab and opens the next one, writing its header.
    fn next_file(&self, inner: &mut SlabStoreInner) -> crate::Result<()> {
        if let Some(slab) = inner.slabs.values().next_back() {
            slab.file.sync_all()?;
        }

        let slab_no = inner.next_slab_no;
        inner.next_slab_no += 1;

        let path = self.dir.join(format!("{SLAB_FILE_PREFIX}{slab_no}"));

        log::debug!("Opening new slab {path:?} at logical offset {}", inner.end);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let start = inner.end;
        inner.slabs.insert(start, Slab { path, file });

        let mut header = vec![];
        header.write_u64_varint(start)?;
        self.write_record(inner, TAG_SLAB_HEADER, &header)?;

        fsync_directory(&self.dir)?;

        Ok(())
    }

    /// Scans the store directory and registers all slab files.
    fn recover(&self, inner: &mut SlabStoreInner) -> crate::Result<()> {
        let mut files: Vec<(u64, PathBuf)> = vec![];

        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let name = name.to_string_lossy();

            if let Some(no) = name.strip_prefix(SLAB_FILE_PREFIX) {
                if let Ok(no) = no.parse::<u64>() {
                    files.push((no, dirent.path()));
                }
            }
        }

        files.sort_by_key(|(no, _)| *no);

        let newest_no = files.last().map(|(no, _)| *no);

        for (no, path) in files {
            match self.add_file(inner, &path) {
                Ok(()) => {
                    inner.next_slab_no = inner.next_slab_no.max(no + 1);
                }
                Err(e) if Some(no) == newest_no => {
                    // A crash can leave a freshly-created slab without a
                    // complete header; it holds no reachable data yet.
                    log::warn!("Dropping torn slab {path:?}: {e}");
                    std::fs::remove_file(&path)?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn add_file(&self, inner: &mut SlabStoreInner, path: &Path) -> crate::Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        file.seek(SeekFrom::Start(0))?;

        let (tag, payload) = read_record(&mut file)?
            .ok_or(crate::Error::Decode(DecodeError::InvalidHeader("slab file is empty")))?;

        if tag != TAG_SLAB_HEADER {
            return Err(crate::Error::Decode(DecodeError::InvalidTag(("slab header", tag))));
        }

        let start = (&mut &payload[..]).read_u64_varint()?;
        let len = file.metadata()?.len();

        log::trace!("Recovered slab {path:?}: logical range [{start}, {})", start + len);

        inner.end = inner.end.max(start + len);
        inner.slabs.insert(start, Slab { path: path.into(), file });

        Ok(())
    }

    /// Finds the most recent well-formed root record, newest slab first.
    ///
    /// The newest slab may end in a partial record after a crash; it is
    /// truncated back to the last well-formed record boundary so appends
    /// land after valid data. A torn record in an older (sealed) slab is
    /// surfaced as corruption instead.
    fn find_root(&self, inner: &mut SlabStoreInner) -> crate::Result<Option<u64>> {
        let newest_start = inner.slabs.keys().next_back().copied();
        let starts: Vec<u64> = inner.slabs.keys().rev().copied().collect();

        let mut root = None;

        for start in starts {
            let is_newest = Some(start) == newest_start;

            let slab = inner
                .slabs
                .get_mut(&start)
                .ok_or(crate::Error::Decode(DecodeError::InvalidHeader("slab vanished during scan")))?;

            let found = match scan_slab_for_root(slab, start) {
                Ok(found) => found,
                Err(ScanError::Io(e)) => return Err(e.into()),
                Err(ScanError::Torn { good_end, found }) => {
                    if !is_newest {
                        return Err(crate::Error::Decode(DecodeError::UnexpectedEof(
                            "torn record in sealed slab",
                        )));
                    }

                    log::warn!(
                        "Truncating torn tail of slab starting at {start} back to logical offset {}",
                        start + good_end,
                    );

                    slab.file.set_len(good_end)?;
                    slab.file.sync_all()?;
                    inner.end = start + good_end;

                    found
                }
            };

            if found.is_some() {
                root = found;
                break;
            }
        }

        Ok(root)
    }
}

enum ScanError {
    Io(std::io::Error),
    /// Scan hit a partial or malformed record; `good_end` is the file
    /// position of the last well-formed record boundary.
    Torn { good_end: u64, found: Option<u64> },
}

/// Scans one slab front to back, returning the logical offset of the last
/// root record in it, if any.
fn scan_slab_for_root(slab: &mut Slab, slab_start: u64) -> Result<Option<u64>, ScanError> {
    let len = slab.file.metadata().map_err(ScanError::Io)?.len();
    slab.file.seek(SeekFrom::Start(0)).map_err(ScanError::Io)?;

    let mut pos = 0u64;
    let mut found = None;

    loop {
        match scan_record(&mut slab.file, len, pos) {
            Ok(None) => return Ok(found),
            Ok(Some((tag, next_pos))) => {
                if tag == TAG_ROOT {
                    found = Some(slab_start + pos);
                }
                pos = next_pos;
            }
            Err(ScanError::Io(e)) => return Err(ScanError::Io(e)),
            Err(ScanError::Torn { .. }) => return Err(ScanError::Torn { good_end: pos, found }),
        }
    }
}

/// Reads one record frame at `pos`, skipping the payload.
///
/// Returns `None` at a clean end-of-slab boundary.
fn scan_record(file: &mut File, len: u64, pos: u64) -> Result<Option<(u8, u64)>, ScanError> {
    if pos == len {
        return Ok(None);
    }

    let torn = || ScanError::Torn { good_end: 0, found: None };

    let tag = file.read_u8().map_err(|_| torn())?;

    if !matches!(tag, TAG_SLAB_HEADER | TAG_NODE | TAG_ROOT) {
        return Err(torn());
    }

    let payload_len = file.read_u64_varint().map_err(|_| torn())?;

    let data_start = file.stream_position().map_err(ScanError::Io)?;
    let next_pos = data_start + payload_len;

    if next_pos > len {
        return Err(torn());
    }

    file.seek(SeekFrom::Start(next_pos)).map_err(ScanError::Io)?;

    Ok(Some((tag, next_pos)))
}

/// Reads one full record (tag + payload) from the current file position.
///
/// Returns `None` at a clean end-of-file boundary.
fn read_record(file: &mut File) -> crate::Result<Option<(u8, Vec<u8>)>> {
    let mut tag = [0u8; 1];

    if std::io::Read::read(file, &mut tag)? == 0 {
        return Ok(None);
    }

    let payload_len = file.read_u64_varint()?;

    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            crate::Error::Decode(DecodeError::UnexpectedEof("record payload"))
        } else {
            crate::Error::Io(e)
        }
    })?;

    Ok(Some((tag[0], payload)))
}

fn read_record_at(inner: &mut SlabStoreInner, offset: u64, expected_tag: u8) -> crate::Result<Vec<u8>> {
    if offset >= inner.end {
        return Err(crate::Error::Decode(DecodeError::UnexpectedEof("read past end of log")));
    }

    let (&slab_start, slab) = inner
        .slabs
        .range_mut(..=offset)
        .next_back()
        .ok_or(crate::Error::Decode(DecodeError::InvalidHeader("offset before first slab")))?;

    slab.file.seek(SeekFrom::Start(offset - slab_start))?;

    let (tag, payload) = read_record(&mut slab.file)?
        .ok_or(crate::Error::Decode(DecodeError::UnexpectedEof("record truncated")))?;

    if tag != expected_tag {
        return Err(crate::Error::Decode(DecodeError::InvalidTag(("record", tag))));
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn slab_store_missing_dir() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let path = dir.path().join("nope");

        assert!(SlabStore::open(&path, false, DEFAULT_SLAB_GOAL_SIZE).is_err());
        assert!(SlabStore::open(&path, true, DEFAULT_SLAB_GOAL_SIZE).is_ok());
    }

    #[test]
    fn slab_store_node_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let store = SlabStore::open(dir.path(), true, DEFAULT_SLAB_GOAL_SIZE)?;

        let a = store.write_node(b"hello")?;
        let b = store.write_node(b"world!")?;

        assert_eq!(b"hello", &*store.read_node(a)?);
        assert_eq!(b"world!", &*store.read_node(b)?);
        assert!(store.read_root()?.is_none());

        Ok(())
    }

    #[test]
    fn slab_store_tag_mismatch() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let store = SlabStore::open(dir.path(), true, DEFAULT_SLAB_GOAL_SIZE)?;
        let off = store.write_root(b"root")?;

        assert!(matches!(
            store.read_node(off),
            Err(crate::Error::Decode(DecodeError::InvalidTag(_)))
        ));

        Ok(())
    }

    #[test]
    fn slab_store_root_recovery() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let store = SlabStore::open(dir.path(), true, DEFAULT_SLAB_GOAL_SIZE)?;
            store.write_node(b"node 1")?;
            store.write_root(b"root 1")?;
            store.write_node(b"node 2")?;
            store.write_root(b"root 2")?;
            store.write_node(b"node 3")?;
        }

        {
            let store = SlabStore::open(dir.path(), false, DEFAULT_SLAB_GOAL_SIZE)?;
            assert_eq!(Some(b"root 2".to_vec()), store.read_root()?);
        }

        Ok(())
    }

    #[test]
    fn slab_store_rotation_and_clear_before() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        // Tiny goal size so every record seals a slab
        let store = SlabStore::open(dir.path(), true, 64)?;

        let mut offsets = vec![];
        for i in 0..20u8 {
            offsets.push(store.write_node(&[i; 48])?);
        }
        assert!(store.slab_count() > 1);

        let last = *offsets.last().expect("should have offsets");
        store.clear_before(last)?;

        // Only the slab holding `last` (plus a possibly fresh empty one)
        assert!(store.slab_count() <= 2);
        assert_eq!(vec![19u8; 48], store.read_node(last)?);

        // Everything older is gone
        assert!(store.read_node(offsets[0]).is_err());

        Ok(())
    }

    #[test]
    fn slab_store_torn_tail_truncated() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let (root_off, torn_len) = {
            let store = SlabStore::open(dir.path(), true, DEFAULT_SLAB_GOAL_SIZE)?;
            store.write_node(b"node 1")?;
            let root_off = store.write_root(b"root 1")?;

            // Simulate a crash mid-append: a dangling tag + partial length
            let path = dir.path().join("data_0");
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(&[TAG_NODE, 0xFF])?;

            (root_off, file.metadata()?.len())
        };

        {
            let store = SlabStore::open(dir.path(), false, DEFAULT_SLAB_GOAL_SIZE)?;
            assert_eq!(Some(b"root 1".to_vec()), store.read_root()?);

            // The torn tail was cut off and appends continue cleanly
            let path = dir.path().join("data_0");
            assert!(std::fs::metadata(&path)?.len() < torn_len);

            let off = store.write_node(b"node 2")?;
            assert!(off > root_off);
            assert_eq!(b"node 2".to_vec(), store.read_node(off)?);
        }

        Ok(())
    }
}
