//! In-memory representation of one named file: an ordered sequence of pages,
//! a refcount of open handles, the shared-memory-region table for the WAL
//! index, and transaction/checkpoint bookkeeping.

use std::collections::HashSet;
use std::ptr::NonNull;

use tracing::trace;

use crate::error::{Result, VfsError};
use crate::format::{
    self, frame_size, FRAME_HEADER_SIZE, WAL_HEADER_SIZE,
};
use crate::lock::{FileLockTable, ShmLockTable};
use crate::page::{try_zeroed, Page};
use crate::registry::ContentId;

/// What a file holds, inferred at open time from flags and the filename
/// suffix conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A database file: fixed-size pages, page size pinned by the header.
    MainDatabase,
    /// A write-ahead log: a 32-byte header followed by frames.
    WriteAheadLog,
    /// Rollback-journal and temp files the engine creates around journal-mode
    /// changes; stored as one growable buffer.
    Other,
}

/// Content of a single file in the volatile filesystem.
#[derive(Debug)]
pub struct Content {
    filename: String,
    kind: FileKind,
    /// File-level header bytes (WAL files only).
    header: Option<[u8; WAL_HEADER_SIZE]>,
    /// Pages in index order; index 0 is the first page or frame.
    pages: Vec<Page>,
    /// Fixed once the first page is written.
    page_size: Option<usize>,
    /// Number of open handles referencing this content.
    pub(crate) refcount: usize,
    /// Shared-memory regions; grow on demand, never shrink while mapped.
    shm_regions: Vec<Box<[u8]>>,
    shm_region_size: usize,
    /// Handles that currently have the shared memory mapped.
    shm_mappers: HashSet<u64>,
    /// Paired WAL content (database files only, created lazily).
    pub(crate) wal: Option<ContentId>,
    /// Back-link to the paired database (WAL files only). Lookup key, never
    /// an owning reference.
    pub(crate) db: Option<ContentId>,
    /// In-flight write transactions across all connections on this database.
    /// A checkpoint may proceed only at zero.
    pub(crate) tx_refcount: usize,
    /// Frames made visible to replication by the last sync.
    synced_frames: usize,
    /// Remove from the namespace when the last handle closes.
    pub(crate) delete_on_close: bool,
    pub(crate) locks: FileLockTable,
    pub(crate) shm_locks: ShmLockTable,
}

impl Content {
    pub fn new(filename: String, kind: FileKind) -> Self {
        Content {
            filename,
            kind,
            header: None,
            pages: Vec::new(),
            page_size: None,
            refcount: 0,
            shm_regions: Vec::new(),
            shm_region_size: 0,
            shm_mappers: HashSet::new(),
            wal: None,
            db: None,
            tx_refcount: 0,
            synced_frames: 0,
            delete_on_close: false,
            locks: FileLockTable::default(),
            shm_locks: ShmLockTable::default(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn page_size(&self) -> Option<usize> {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Frames written so far (WAL files).
    pub fn frame_count(&self) -> usize {
        self.pages.len()
    }

    /// Frames visible to replication.
    pub fn synced_frames(&self) -> usize {
        self.synced_frames
    }

    pub fn shm_refcount(&self) -> usize {
        self.shm_mappers.len()
    }

    pub fn shm_region_count(&self) -> usize {
        self.shm_regions.len()
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        match self.kind {
            FileKind::MainDatabase => match self.page_size {
                Some(ps) => (self.pages.len() * ps) as u64,
                None => 0,
            },
            FileKind::WriteAheadLog => {
                if self.header.is_none() && self.pages.is_empty() {
                    0
                } else {
                    let ps = self.page_size.unwrap_or(0);
                    (WAL_HEADER_SIZE + self.pages.len() * frame_size(ps)) as u64
                }
            }
            FileKind::Other => self.pages.first().map(|p| p.len() as u64).unwrap_or(0),
        }
    }

    /// Read bytes at `offset` into `dst`.
    ///
    /// Returns the number of bytes that exist at that offset; the remainder
    /// of `dst` is zero-filled, matching the engine's expectation of reading
    /// an unwritten region as zeros rather than an error.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        dst.fill(0);
        let size = self.size();
        if dst.is_empty() || offset >= size {
            return Ok(0);
        }
        let avail = ((size - offset) as usize).min(dst.len());
        let offset = offset as usize;
        match self.kind {
            FileKind::Other => {
                if let Some(page) = self.pages.first() {
                    page.read_into(offset, &mut dst[..avail]);
                }
            }
            FileKind::MainDatabase => {
                let ps = self
                    .page_size
                    .ok_or_else(|| VfsError::Corrupt("sized database without page size".into()))?;
                let mut filled = 0;
                while filled < avail {
                    let pos = offset + filled;
                    let (idx, off) = (pos / ps, pos % ps);
                    let n = (ps - off).min(avail - filled);
                    self.pages[idx].read_into(off, &mut dst[filled..filled + n]);
                    filled += n;
                }
            }
            FileKind::WriteAheadLog => {
                self.read_wal(offset, &mut dst[..avail])?;
            }
        }
        trace!("read {} of {} bytes at offset {}", avail, dst.len(), offset);
        Ok(avail)
    }

    fn read_wal(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let ps = self
            .page_size
            .ok_or_else(|| VfsError::Corrupt("sized WAL without page size".into()))?;
        let fsz = frame_size(ps);
        let mut filled = 0;
        while filled < dst.len() {
            let pos = offset + filled;
            let n;
            if pos < WAL_HEADER_SIZE {
                n = (WAL_HEADER_SIZE - pos).min(dst.len() - filled);
                if let Some(h) = &self.header {
                    dst[filled..filled + n].copy_from_slice(&h[pos..pos + n]);
                }
            } else {
                let rel = pos - WAL_HEADER_SIZE;
                let (idx, within) = (rel / fsz, rel % fsz);
                if within < FRAME_HEADER_SIZE {
                    n = (FRAME_HEADER_SIZE - within).min(dst.len() - filled);
                    if let Some(h) = self.pages[idx].frame_header() {
                        dst[filled..filled + n].copy_from_slice(&h[within..within + n]);
                    }
                } else {
                    let off = within - FRAME_HEADER_SIZE;
                    n = (ps - off).min(dst.len() - filled);
                    self.pages[idx].read_into(off, &mut dst[filled..filled + n]);
                }
            }
            filled += n;
        }
        Ok(())
    }

    /// Write bytes at `offset`, appending zero-initialized pages as needed so
    /// the file never has gaps.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| VfsError::InvalidArgument(format!("offset {} out of range", offset)))?;
        trace!(
            "write {} bytes at offset {} to {}",
            data.len(),
            offset,
            self.filename
        );
        match self.kind {
            FileKind::Other => {
                if self.pages.is_empty() {
                    self.pages.push(Page::new_growable());
                }
                self.pages[0].write_extend(offset, data)
            }
            FileKind::MainDatabase => self.write_db(offset, data),
            FileKind::WriteAheadLog => self.write_wal(offset, data),
        }
    }

    fn write_db(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset == 0 && self.pages.is_empty() {
            self.page_size = Some(format::db_page_size(data)?);
        }
        let ps = self.page_size.ok_or_else(|| {
            VfsError::InvalidArgument("first database write must start with the header".into())
        })?;
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| VfsError::InvalidArgument("write range overflows".into()))?;
        let needed = end.div_ceil(ps);
        self.reserve_pages(needed)?;
        while self.pages.len() < needed {
            self.pages.push(Page::new_db(ps)?);
        }
        let mut written = 0;
        while written < data.len() {
            let pos = offset + written;
            let (idx, off) = (pos / ps, pos % ps);
            let n = (ps - off).min(data.len() - written);
            self.pages[idx].write(off, &data[written..written + n])?;
            written += n;
        }
        Ok(())
    }

    fn write_wal(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset == 0 {
            if data.len() != WAL_HEADER_SIZE {
                return Err(VfsError::InvalidArgument(format!(
                    "WAL header write must be {} bytes, got {}",
                    WAL_HEADER_SIZE,
                    data.len()
                )));
            }
            let header: [u8; WAL_HEADER_SIZE] = data.try_into().expect("length checked");
            let ps = format::wal_page_size(&header)?;
            // A header rewrite restarts the log: the engine overwrites
            // frames from index 0 without truncating, so frames of the
            // previous generation are dead and must not stay visible.
            if !self.pages.is_empty() {
                self.pages.clear();
                self.synced_frames = 0;
            }
            self.page_size = Some(ps);
            self.header = Some(header);
            return Ok(());
        }
        if offset < WAL_HEADER_SIZE {
            return Err(VfsError::InvalidArgument(format!(
                "WAL write at offset {} overlaps the file header",
                offset
            )));
        }
        let ps = self.page_size.ok_or_else(|| {
            VfsError::InvalidArgument("WAL frame write before the header".into())
        })?;
        let fsz = frame_size(ps);
        let rel = offset - WAL_HEADER_SIZE;
        let (idx, within) = (rel / fsz, rel % fsz);
        self.ensure_frames(idx + 1, ps)?;

        if within == 0 && data.len() == FRAME_HEADER_SIZE {
            let header: [u8; FRAME_HEADER_SIZE] = data.try_into().expect("length checked");
            self.pages[idx].set_frame_header(header)
        } else if within == 0 && data.len() == fsz {
            // Header and payload in one write.
            let (header, payload) = data.split_at(FRAME_HEADER_SIZE);
            self.pages[idx].write_payload(0, payload)?;
            self.pages[idx]
                .set_frame_header(header.try_into().expect("length checked"))
        } else if within >= FRAME_HEADER_SIZE {
            let off = within - FRAME_HEADER_SIZE;
            if off + data.len() > ps {
                return Err(VfsError::InvalidArgument(
                    "WAL write spans a frame boundary".into(),
                ));
            }
            self.pages[idx].write_payload(off, data)
        } else {
            Err(VfsError::InvalidArgument(format!(
                "WAL write at offset {} lands inside a frame header",
                offset
            )))
        }
    }

    fn reserve_pages(&mut self, total: usize) -> Result<()> {
        if total > self.pages.len() {
            self.pages
                .try_reserve(total - self.pages.len())
                .map_err(|_| VfsError::OutOfMemory(format!("growing to {} pages", total)))?;
        }
        Ok(())
    }

    fn ensure_frames(&mut self, total: usize, page_size: usize) -> Result<()> {
        self.reserve_pages(total)?;
        while self.pages.len() < total {
            self.pages.push(Page::new_wal(page_size)?);
        }
        Ok(())
    }

    /// Drop trailing content beyond `size` bytes.
    pub fn truncate_bytes(&mut self, size: u64) -> Result<()> {
        let size = usize::try_from(size)
            .map_err(|_| VfsError::InvalidArgument(format!("size {} out of range", size)))?;
        if size as u64 > self.size() {
            return Err(VfsError::InvalidArgument(format!(
                "cannot truncate {} to {} bytes, current size is {}",
                self.filename,
                size,
                self.size()
            )));
        }
        match self.kind {
            FileKind::Other => {
                if let Some(page) = self.pages.first_mut() {
                    page.truncate(size);
                }
            }
            FileKind::MainDatabase => {
                if size == 0 {
                    self.pages.clear();
                } else {
                    let ps = self.page_size.ok_or_else(|| {
                        VfsError::Corrupt("sized database without page size".into())
                    })?;
                    if size % ps != 0 {
                        return Err(VfsError::InvalidArgument(format!(
                            "truncate to {} is not page-aligned",
                            size
                        )));
                    }
                    self.pages.truncate(size / ps);
                }
            }
            FileKind::WriteAheadLog => {
                if size == 0 {
                    self.reset_wal();
                } else {
                    let ps = self
                        .page_size
                        .ok_or_else(|| VfsError::Corrupt("sized WAL without page size".into()))?;
                    let rel = size
                        .checked_sub(WAL_HEADER_SIZE)
                        .filter(|r| r % frame_size(ps) == 0)
                        .ok_or_else(|| {
                            VfsError::InvalidArgument(format!(
                                "truncate to {} is not a frame boundary",
                                size
                            ))
                        })?;
                    let frames = rel / frame_size(ps);
                    self.pages.truncate(frames);
                    self.synced_frames = self.synced_frames.min(frames);
                }
            }
        }
        Ok(())
    }

    /// Durability point. There is no disk; for a WAL this is where newly
    /// written frames flip from in-flight to committed for the replication
    /// hook.
    pub fn sync(&mut self) {
        if self.kind == FileKind::WriteAheadLog {
            self.synced_frames = self.pages.len();
            trace!(
                "synced {}: {} frames visible",
                self.filename,
                self.synced_frames
            );
        }
    }

    /// Clear the WAL back to empty, keeping allocations for reuse.
    pub fn reset_wal(&mut self) {
        self.header = None;
        self.pages.clear();
        self.synced_frames = 0;
    }

    /// Frame headers and merged payloads for frames `since..` up to the
    /// synced watermark, in frame order, without mutating WAL state.
    pub fn synced_frame_snapshots(
        &self,
        since: usize,
    ) -> Result<Vec<([u8; FRAME_HEADER_SIZE], Vec<u8>)>> {
        let upto = self.synced_frames.min(self.pages.len());
        let mut out = Vec::new();
        for page in self.pages.iter().take(upto).skip(since) {
            let header = *page.frame_header().ok_or_else(|| {
                VfsError::Corrupt("synced frame is missing its frame header".into())
            })?;
            out.push((header, page.snapshot()?));
        }
        Ok(out)
    }

    /// Headers and merged payloads for every frame written, in frame order
    /// (checkpoint source side).
    pub fn all_frame_snapshots(&self) -> Result<Vec<([u8; FRAME_HEADER_SIZE], Vec<u8>)>> {
        let mut out = Vec::new();
        for page in &self.pages {
            let header = *page
                .frame_header()
                .ok_or_else(|| VfsError::Corrupt("frame is missing its frame header".into()))?;
            out.push((header, page.snapshot()?));
        }
        Ok(out)
    }

    /// Overwrite or append the page at 1-based `page_number` with `data`
    /// (checkpoint merge target side).
    pub fn apply_page(&mut self, page_number: u32, data: &[u8]) -> Result<()> {
        if page_number == 0 {
            return Err(VfsError::Corrupt("frame targets page number zero".into()));
        }
        let ps = match self.page_size {
            Some(ps) => ps,
            None => {
                self.page_size = Some(data.len());
                data.len()
            }
        };
        if data.len() != ps {
            return Err(VfsError::Corrupt(format!(
                "frame payload of {} bytes does not match page size {}",
                data.len(),
                ps
            )));
        }
        let idx = page_number as usize - 1;
        self.reserve_pages(idx + 1)?;
        while self.pages.len() <= idx {
            self.pages.push(Page::new_db(ps)?);
        }
        self.pages[idx].write(0, data)
    }

    /// Map a shared-memory region, allocating and zero-filling it (and any
    /// missing intermediate regions) when `extend` is set. Returns `None`
    /// when the region does not exist and `extend` is not set.
    pub fn shm_map(
        &mut self,
        handle: u64,
        region: usize,
        region_size: usize,
        extend: bool,
    ) -> Result<Option<NonNull<u8>>> {
        if region_size == 0 {
            return Err(VfsError::InvalidArgument("zero-sized shm region".into()));
        }
        if self.shm_region_size == 0 {
            self.shm_region_size = region_size;
        } else if self.shm_region_size != region_size {
            return Err(VfsError::InvalidArgument(format!(
                "shm region size {} does not match established size {}",
                region_size, self.shm_region_size
            )));
        }
        if region >= self.shm_regions.len() {
            if !extend {
                return Ok(None);
            }
            self.shm_regions
                .try_reserve(region + 1 - self.shm_regions.len())
                .map_err(|_| VfsError::OutOfMemory("growing shm region table".into()))?;
            while self.shm_regions.len() <= region {
                self.shm_regions
                    .push(try_zeroed(region_size)?.into_boxed_slice());
            }
        }
        self.shm_mappers.insert(handle);
        let ptr = self.shm_regions[region].as_mut_ptr();
        Ok(Some(NonNull::new(ptr).expect("boxed region is non-null")))
    }

    /// Drop `handle`'s mapping; when the last mapping goes and
    /// `delete_on_last` is set, all regions are freed.
    pub fn shm_unmap(&mut self, handle: u64, delete_on_last: bool) {
        self.shm_mappers.remove(&handle);
        if self.shm_mappers.is_empty() && delete_on_last {
            self.shm_regions.clear();
            self.shm_region_size = 0;
            self.shm_locks = ShmLockTable::default();
        }
    }

    /// Copy bytes out of a shared-memory region (diagnostic/test access; the
    /// engine goes through the mapped pointer).
    pub fn shm_read(&self, region: usize, offset: usize, dst: &mut [u8]) -> Result<()> {
        let buf = self
            .shm_regions
            .get(region)
            .ok_or_else(|| VfsError::NotFound(format!("shm region {}", region)))?;
        let end = offset + dst.len();
        if end > buf.len() {
            return Err(VfsError::InvalidArgument("shm read out of bounds".into()));
        }
        dst.copy_from_slice(&buf[offset..end]);
        Ok(())
    }

    /// Copy bytes into a shared-memory region.
    pub fn shm_write(&mut self, region: usize, offset: usize, data: &[u8]) -> Result<()> {
        let buf = self
            .shm_regions
            .get_mut(region)
            .ok_or_else(|| VfsError::NotFound(format!("shm region {}", region)))?;
        let end = offset + data.len();
        if end > buf.len() {
            return Err(VfsError::InvalidArgument("shm write out of bounds".into()));
        }
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }
}
