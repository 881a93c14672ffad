//! The filesystem's namespace: a mutex-protected arena of Content indexed by
//! stable identifier, shared by every connection in the process.
//!
//! The registry is an explicit instance passed to every operation, not a
//! process-wide singleton, so multiple independent filesystems can coexist,
//! one per registered VFS name. Handles hold a `ContentId` (arena index plus
//! generation) rather than a pointer, so a stale identifier can never resolve
//! to a recycled slot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::content::{Content, FileKind};
use crate::error::{Result, VfsError};
use crate::format::{frame_commit_size, frame_page_number, JOURNAL_SUFFIX, WAL_SUFFIX};
use crate::handle::FileHandle;
use crate::wal::{last_commit_cutoff, WalFrame};

/// Stable identifier for a Content slot: arena index plus a generation
/// counter bumped on every reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId {
    index: u32,
    gen: u32,
}

#[derive(Debug)]
struct Slot {
    gen: u32,
    content: Option<Content>,
}

#[derive(Debug)]
pub(crate) struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, ContentId>,
    next_handle: u64,
    temp_counter: u64,
    last_error: Option<VfsError>,
}

impl RegistryInner {
    fn get(&self, id: ContentId) -> Option<&Content> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.content.as_ref()
    }

    fn get_mut(&mut self, id: ContentId) -> Option<&mut Content> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.content.as_mut()
    }

    fn insert(&mut self, content: Content) -> ContentId {
        let name = content.filename().to_string();
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.content = Some(content);
                ContentId {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    content: Some(content),
                });
                ContentId { index, gen: 0 }
            }
        };
        self.by_name.insert(name, id);
        id
    }

    fn destroy(&mut self, id: ContentId) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.gen != id.gen {
            return;
        }
        if let Some(content) = slot.content.take() {
            self.by_name.remove(content.filename());
            debug!("destroyed content for {}", content.filename());
        }
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.index);
    }

    /// The destruction predicate, evaluated at every close: free when the
    /// refcount is zero, unless this is the WAL paired to a still-open
    /// database. Destroying a file also re-evaluates its pairing partner.
    fn maybe_destroy(&mut self, id: ContentId) {
        let Some(content) = self.get(id) else {
            return;
        };
        if content.refcount > 0 {
            return;
        }
        if content.kind() == FileKind::WriteAheadLog {
            if let Some(db_id) = content.db {
                if self.get(db_id).is_some_and(|db| db.refcount > 0) {
                    return;
                }
            }
        }
        let wal = content.wal;
        let db = content.db;
        self.destroy(id);
        if let Some(wal_id) = wal {
            self.maybe_destroy(wal_id);
        }
        if let Some(db_id) = db {
            self.maybe_destroy(db_id);
        }
    }

    fn record(&mut self, err: &VfsError) {
        self.last_error = Some(err.clone());
    }
}

/// How to open a file.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Create the file if it does not exist.
    pub create: bool,
    /// With `create`, fail `Busy` if the file already exists.
    pub exclusive: bool,
    /// Remove the file from the namespace when its last handle closes.
    pub delete_on_close: bool,
    /// Override the kind inferred from the filename suffix.
    pub kind: Option<FileKind>,
}

impl OpenOptions {
    /// Open an existing file.
    pub fn read() -> Self {
        OpenOptions::default()
    }

    /// Open, creating the file if missing.
    pub fn create() -> Self {
        OpenOptions {
            create: true,
            ..OpenOptions::default()
        }
    }
}

/// Point-in-time view of one file's bookkeeping, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct ContentStats {
    pub kind: FileKind,
    pub refcount: usize,
    pub page_size: Option<usize>,
    pub page_count: usize,
    pub synced_frames: usize,
    pub tx_refcount: usize,
    pub shm_regions: usize,
    pub shm_refcount: usize,
    pub size: u64,
}

/// Root of the volatile filesystem.
///
/// Cheap to clone: clones share the same namespace. Handles keep their
/// registry alive, so the namespace outlives any open file.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn infer_kind(name: &str) -> FileKind {
    if name.ends_with(WAL_SUFFIX) {
        FileKind::WriteAheadLog
    } else if name.ends_with(JOURNAL_SUFFIX) {
        FileKind::Other
    } else {
        FileKind::MainDatabase
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Arc::new(Mutex::new(RegistryInner {
                slots: Vec::new(),
                free: Vec::new(),
                by_name: HashMap::new(),
                next_handle: 1,
                temp_counter: 0,
                last_error: None,
            })),
        }
    }

    /// Open a file, creating it per `opts`.
    ///
    /// Opening a `-wal` file links it to its main database Content, creating
    /// the main Content first if needed.
    pub fn open(&self, name: &str, opts: OpenOptions) -> Result<FileHandle> {
        let mut inner = self.inner.lock();
        match Self::do_open(&mut inner, name, &opts) {
            Ok(id) => {
                let handle_id = inner.next_handle;
                inner.next_handle += 1;
                let content = inner.get_mut(id).expect("content just resolved");
                content.refcount += 1;
                debug!("opened {} as handle {}", name, handle_id);
                Ok(FileHandle::new(self.clone(), id, handle_id))
            }
            Err(err) => {
                inner.record(&err);
                Err(err)
            }
        }
    }

    /// Open an anonymous temp file (engine spill files). Always created,
    /// always removed when the last handle closes.
    pub fn open_anonymous(&self) -> Result<FileHandle> {
        let name = {
            let mut inner = self.inner.lock();
            inner.temp_counter += 1;
            format!("mirage-temp-{}", inner.temp_counter)
        };
        self.open(
            &name,
            OpenOptions {
                create: true,
                exclusive: true,
                delete_on_close: true,
                kind: Some(FileKind::Other),
            },
        )
    }

    fn do_open(inner: &mut RegistryInner, name: &str, opts: &OpenOptions) -> Result<ContentId> {
        if let Some(&id) = inner.by_name.get(name) {
            if opts.create && opts.exclusive {
                return Err(VfsError::Busy(format!("{} already exists", name)));
            }
            return Ok(id);
        }
        if !opts.create {
            return Err(VfsError::NotFound(name.to_string()));
        }
        let kind = opts.kind.unwrap_or_else(|| infer_kind(name));
        let mut content = Content::new(name.to_string(), kind);
        content.delete_on_close = opts.delete_on_close;
        let id = inner.insert(content);
        if kind == FileKind::WriteAheadLog {
            if let Some(base) = name.strip_suffix(WAL_SUFFIX) {
                let db_id = match inner.by_name.get(base).copied() {
                    Some(db_id) => db_id,
                    None => inner.insert(Content::new(base.to_string(), FileKind::MainDatabase)),
                };
                inner
                    .get_mut(db_id)
                    .expect("database content just resolved")
                    .wal = Some(id);
                inner.get_mut(id).expect("WAL content just inserted").db = Some(db_id);
            }
        }
        Ok(id)
    }

    /// Whether `name` currently exists in the namespace.
    pub fn exists(&self, name: &str) -> bool {
        self.inner.lock().by_name.contains_key(name)
    }

    /// Remove a file. Fails `Busy` while any handle is open on it.
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let res = Self::do_delete(&mut inner, name);
        if let Err(err) = &res {
            inner.record(err);
        }
        res
    }

    fn do_delete(inner: &mut RegistryInner, name: &str) -> Result<()> {
        let id = *inner
            .by_name
            .get(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        let content = inner.get(id).expect("named content resolves");
        if content.refcount > 0 {
            return Err(VfsError::Busy(format!(
                "{} has {} open handles",
                name, content.refcount
            )));
        }
        let wal = content.wal;
        let db = content.db;
        inner.destroy(id);
        if let Some(wal_id) = wal {
            inner.maybe_destroy(wal_id);
        }
        // A deleted WAL unlinks from its database; reopening the WAL name
        // re-pairs it.
        if let Some(db_id) = db {
            if let Some(db) = inner.get_mut(db_id) {
                db.wal = None;
            }
        }
        debug!("deleted {}", name);
        Ok(())
    }

    /// Last error recorded by any operation on this registry. Diagnostic
    /// mirror only; never a substitute for the returned result.
    pub fn last_error(&self) -> Option<VfsError> {
        self.inner.lock().last_error.clone()
    }

    /// Bookkeeping snapshot for `name`, if it exists.
    pub fn content_stats(&self, name: &str) -> Option<ContentStats> {
        let inner = self.inner.lock();
        let id = *inner.by_name.get(name)?;
        let c = inner.get(id)?;
        Some(ContentStats {
            kind: c.kind(),
            refcount: c.refcount,
            page_size: c.page_size(),
            page_count: c.page_count(),
            synced_frames: c.synced_frames(),
            tx_refcount: c.tx_refcount,
            shm_regions: c.shm_region_count(),
            shm_refcount: c.shm_refcount(),
            size: c.size(),
        })
    }

    /// Resolve an identifier back to its filename, if still live.
    pub fn filename_of(&self, id: ContentId) -> Option<String> {
        let inner = self.inner.lock();
        inner.get(id).map(|c| c.filename().to_string())
    }

    pub(crate) fn with_content<R>(
        &self,
        id: ContentId,
        f: impl FnOnce(&Content) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        let res = match inner.get(id) {
            Some(content) => f(content),
            None => Err(VfsError::Corrupt("stale content identifier".into())),
        };
        if let Err(err) = &res {
            inner.record(err);
        }
        res
    }

    pub(crate) fn with_content_mut<R>(
        &self,
        id: ContentId,
        f: impl FnOnce(&mut Content) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        let res = match inner.get_mut(id) {
            Some(content) => f(content),
            None => Err(VfsError::Corrupt("stale content identifier".into())),
        };
        if let Err(err) = &res {
            inner.record(err);
        }
        res
    }

    pub(crate) fn close_handle(&self, id: ContentId, handle_id: u64) {
        let mut inner = self.inner.lock();
        let Some(content) = inner.get_mut(id) else {
            return;
        };
        content.locks.release_all(handle_id);
        content.shm_locks.release_all(handle_id);
        content.shm_unmap(handle_id, false);
        content.refcount = content.refcount.saturating_sub(1);
        debug!(
            "closed handle {} on {} (refcount {})",
            handle_id,
            content.filename(),
            content.refcount
        );
        if content.delete_on_close && content.refcount == 0 {
            inner.destroy(id);
            return;
        }
        inner.maybe_destroy(id);
    }

    /// Merge the paired WAL into the database and reset the WAL.
    ///
    /// Fails `Busy` while write transactions are in flight; this gate is the
    /// single highest-value invariant of the subsystem. Frames merge in frame
    /// order through the last commit frame, so every touched page ends up
    /// with the last writer's content. Returns the number of merged frames.
    pub(crate) fn checkpoint(&self, id: ContentId) -> Result<usize> {
        let mut inner = self.inner.lock();
        let res = Self::do_checkpoint(&mut inner, id);
        match &res {
            Ok(n) => debug!("checkpoint merged {} frames", n),
            Err(err) => inner.record(err),
        }
        res
    }

    fn do_checkpoint(inner: &mut RegistryInner, id: ContentId) -> Result<usize> {
        let db = inner
            .get(id)
            .ok_or_else(|| VfsError::Corrupt("stale content identifier".into()))?;
        if db.kind() != FileKind::MainDatabase {
            return Err(VfsError::InvalidArgument(
                "checkpoint target is not a database file".into(),
            ));
        }
        if db.tx_refcount > 0 {
            return Err(VfsError::Busy(format!(
                "{} write transactions in flight",
                db.tx_refcount
            )));
        }
        let Some(wal_id) = db.wal else {
            return Ok(0);
        };
        let wal = inner
            .get(wal_id)
            .ok_or_else(|| VfsError::Corrupt("database paired with destroyed WAL".into()))?;
        if wal.frame_count() == 0 {
            return Ok(0);
        }
        let frames = wal.all_frame_snapshots()?;
        let merged = last_commit_cutoff(frames.iter().map(|(header, _)| header));
        let db = inner.get_mut(id).expect("database content just resolved");
        for (header, payload) in frames.iter().take(merged) {
            db.apply_page(frame_page_number(header), payload)?;
        }
        inner
            .get_mut(wal_id)
            .expect("WAL content just resolved")
            .reset_wal();
        Ok(merged)
    }

    /// Ordered committed frames with index ≥ `since`, per §6: stable and
    /// append-only until the next checkpoint, never past the sync watermark.
    pub(crate) fn committed_frames(&self, id: ContentId, since: u64) -> Result<Vec<WalFrame>> {
        let mut inner = self.inner.lock();
        let res = Self::do_committed_frames(&mut inner, id, since);
        if let Err(err) = &res {
            inner.record(err);
        }
        res
    }

    fn do_committed_frames(
        inner: &mut RegistryInner,
        id: ContentId,
        since: u64,
    ) -> Result<Vec<WalFrame>> {
        let content = inner
            .get(id)
            .ok_or_else(|| VfsError::Corrupt("stale content identifier".into()))?;
        let wal = match content.kind() {
            FileKind::WriteAheadLog => content,
            FileKind::MainDatabase => match content.wal {
                Some(wal_id) => inner
                    .get(wal_id)
                    .ok_or_else(|| VfsError::Corrupt("database paired with destroyed WAL".into()))?,
                None => return Ok(Vec::new()),
            },
            FileKind::Other => {
                return Err(VfsError::InvalidArgument(
                    "file has no write-ahead log".into(),
                ))
            }
        };
        let since = usize::try_from(since)
            .map_err(|_| VfsError::InvalidArgument(format!("frame index {} out of range", since)))?;
        let snaps = wal.synced_frame_snapshots(since)?;
        let mut frames: Vec<WalFrame> = snaps
            .into_iter()
            .enumerate()
            .map(|(i, (header, data))| WalFrame {
                frame_index: (since + i) as u64,
                page_number: frame_page_number(&header),
                commit: frame_commit_size(&header) != 0,
                data,
            })
            .collect();
        // Trailing frames of an unfinished transaction are not committed
        // yet, synced or not; replication must never see them.
        let cutoff = frames
            .iter()
            .rposition(|frame| frame.commit)
            .map(|at| at + 1)
            .unwrap_or(0);
        frames.truncate(cutoff);
        Ok(frames)
    }
}
