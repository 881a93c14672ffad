//! Per-open file handles.
//!
//! A handle is a lightweight object bound to one Content; it owns no storage
//! of its own. Every operation resolves the Content through the registry
//! under its mutex, so refcount, lock-state, and transaction transitions stay
//! atomic. Dropping a handle closes it: locks and shared-memory state are
//! released and the Content's destruction predicate is re-evaluated.

use std::ptr::NonNull;

use crate::content::FileKind;
use crate::error::{Result, VfsError};
use crate::lock::LockLevel;
use crate::registry::{ContentId, Registry};
use crate::wal::WalFrame;

/// An open file in the volatile filesystem.
#[derive(Debug)]
pub struct FileHandle {
    registry: Registry,
    id: ContentId,
    handle_id: u64,
}

impl FileHandle {
    pub(crate) fn new(registry: Registry, id: ContentId, handle_id: u64) -> Self {
        FileHandle {
            registry,
            id,
            handle_id,
        }
    }

    /// Identifier of the Content this handle is bound to.
    pub fn content_id(&self) -> ContentId {
        self.id
    }

    /// Name of the file this handle was opened on.
    pub fn filename(&self) -> Option<String> {
        self.registry.filename_of(self.id)
    }

    /// Read bytes at `offset` into `dst`, returning how many of them exist.
    /// The remainder of `dst` is zero-filled; a short count is the engine's
    /// read-past-end signal, not an error.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        self.registry
            .with_content(self.id, |content| content.read_at(offset, dst))
    }

    /// Write bytes at `offset`, extending the file as needed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.registry
            .with_content_mut(self.id, |content| content.write_at(offset, data))
    }

    /// Drop content beyond `size` bytes.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.registry
            .with_content_mut(self.id, |content| content.truncate_bytes(size))
    }

    /// Durability point. For a WAL this publishes newly written frames to the
    /// replication watermark; there is no disk to flush.
    pub fn sync(&self) -> Result<()> {
        self.registry.with_content_mut(self.id, |content| {
            content.sync();
            Ok(())
        })
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.registry
            .with_content(self.id, |content| Ok(content.size()))
    }

    /// Raise this handle's advisory lock. Fails `Busy` on conflict, leaving
    /// the held level unchanged.
    pub fn lock(&self, level: LockLevel) -> Result<()> {
        let handle_id = self.handle_id;
        self.registry
            .with_content_mut(self.id, |content| content.locks.lock(handle_id, level))
    }

    /// Lower this handle's advisory lock. Never fails.
    pub fn unlock(&self, level: LockLevel) {
        let handle_id = self.handle_id;
        let _ = self.registry.with_content_mut(self.id, |content| {
            content.locks.unlock(handle_id, level);
            Ok(())
        });
    }

    /// Whether any handle on this file holds `Reserved` or stronger.
    pub fn check_reserved(&self) -> Result<bool> {
        self.registry
            .with_content(self.id, |content| Ok(content.locks.reserved_or_stronger()))
    }

    fn require_database(kind: FileKind, what: &str) -> Result<()> {
        if kind == FileKind::MainDatabase {
            Ok(())
        } else {
            Err(VfsError::InvalidArgument(format!(
                "{} applies to database files only",
                what
            )))
        }
    }

    /// Note a write transaction starting on this database.
    pub fn begin_write(&self) -> Result<()> {
        self.registry.with_content_mut(self.id, |content| {
            Self::require_database(content.kind(), "begin_write")?;
            content.tx_refcount += 1;
            Ok(())
        })
    }

    /// Note a write transaction ending (commit or rollback).
    pub fn end_write(&self) -> Result<()> {
        self.registry.with_content_mut(self.id, |content| {
            Self::require_database(content.kind(), "end_write")?;
            content.tx_refcount = content.tx_refcount.checked_sub(1).ok_or_else(|| {
                VfsError::InvalidArgument("end_write without a matching begin_write".into())
            })?;
            Ok(())
        })
    }

    /// Merge the paired WAL into this database and reset the WAL. Fails
    /// `Busy` (retryable) while write transactions are in flight. Returns
    /// the number of frames merged.
    pub fn checkpoint(&self) -> Result<usize> {
        self.registry.checkpoint(self.id)
    }

    /// Committed frames with index ≥ `since`, in commit order. Callable on a
    /// database handle (via its paired WAL) or directly on a WAL handle.
    pub fn committed_frames(&self, since: u64) -> Result<Vec<WalFrame>> {
        self.registry.committed_frames(self.id, since)
    }

    /// Map a shared-memory region, allocating it when `extend` is set.
    /// Returns `None` for an absent region without `extend`. The pointer
    /// stays valid until the last unmap frees the regions or the Content is
    /// destroyed; concurrent mappers share the same bytes.
    pub fn shm_map(
        &self,
        region: usize,
        region_size: usize,
        extend: bool,
    ) -> Result<Option<NonNull<u8>>> {
        let handle_id = self.handle_id;
        self.registry.with_content_mut(self.id, |content| {
            content.shm_map(handle_id, region, region_size, extend)
        })
    }

    /// Acquire shared locks on shared-memory slots `offset..offset+count`.
    pub fn shm_lock_shared(&self, offset: usize, count: usize) -> Result<()> {
        let handle_id = self.handle_id;
        self.registry.with_content_mut(self.id, |content| {
            content.shm_locks.lock_shared(handle_id, offset, count)
        })
    }

    /// Acquire exclusive locks on shared-memory slots `offset..offset+count`.
    pub fn shm_lock_exclusive(&self, offset: usize, count: usize) -> Result<()> {
        let handle_id = self.handle_id;
        self.registry.with_content_mut(self.id, |content| {
            content.shm_locks.lock_exclusive(handle_id, offset, count)
        })
    }

    /// Release whatever this handle holds on slots `offset..offset+count`.
    pub fn shm_unlock(&self, offset: usize, count: usize) -> Result<()> {
        let handle_id = self.handle_id;
        self.registry.with_content_mut(self.id, |content| {
            content.shm_locks.unlock(handle_id, offset, count)
        })
    }

    /// Memory barrier pairing with the engine's WAL-index access protocol.
    pub fn shm_barrier(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// Drop this handle's shared-memory mapping; with `delete_on_last`, the
    /// last unmap frees the regions.
    pub fn shm_unmap(&self, delete_on_last: bool) -> Result<()> {
        let handle_id = self.handle_id;
        self.registry.with_content_mut(self.id, |content| {
            content.shm_unmap(handle_id, delete_on_last);
            Ok(())
        })
    }

    /// Copy bytes out of a shared-memory region without mapping it.
    pub fn shm_read(&self, region: usize, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.registry
            .with_content(self.id, |content| content.shm_read(region, offset, dst))
    }

    /// Copy bytes into a shared-memory region without mapping it.
    pub fn shm_write(&self, region: usize, offset: usize, data: &[u8]) -> Result<()> {
        self.registry
            .with_content_mut(self.id, |content| content.shm_write(region, offset, data))
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.registry.close_handle(self.id, self.handle_id);
    }
}
