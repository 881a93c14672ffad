//! Fixed-size byte buffers representing one page of a database file or one
//! frame of a WAL file.
//!
//! WAL pages carry an optional frame header and a sparse dirty-byte overlay.
//! The overlay models the engine's two-phase commit sequence (payload then
//! frame header, or vice versa) without a full-page rewrite on each phase,
//! and lets the replication hook observe the minimal changed byte ranges.

use crate::error::{Result, VfsError};
use crate::format::FRAME_HEADER_SIZE;

/// Allocate a zero-filled buffer, reporting allocation failure instead of
/// aborting.
pub(crate) fn try_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| VfsError::OutOfMemory(format!("allocating {} bytes", len)))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Sparse record of which bytes of a page were modified since the page was
/// last written in full, and their new values.
///
/// The mask holds one bit per page byte; `bytes` holds one value per set bit,
/// in bit order. The two are kept in lockstep; a mismatch is a `Corrupt`
/// condition.
#[derive(Debug, Default)]
pub struct DirtyOverlay {
    mask: Vec<u8>,
    bytes: Vec<u8>,
}

impl DirtyOverlay {
    pub fn new(page_size: usize) -> Result<Self> {
        Ok(DirtyOverlay {
            mask: try_zeroed(page_size.div_ceil(8))?,
            bytes: Vec::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn bit(&self, at: usize) -> bool {
        self.mask[at / 8] & (1 << (at % 8)) != 0
    }

    /// Number of set bits strictly below `at`: the index of `at`'s byte in
    /// `bytes`.
    fn rank(&self, at: usize) -> usize {
        let whole = at / 8;
        let mut n: usize = self.mask[..whole]
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum();
        let partial = self.mask[whole] & ((1u16 << (at % 8)) - 1) as u8;
        n += partial.count_ones() as usize;
        n
    }

    /// Record a modified byte.
    pub fn record(&mut self, at: usize, value: u8) {
        let rank = self.rank(at);
        if self.bit(at) {
            self.bytes[rank] = value;
        } else {
            self.mask[at / 8] |= 1 << (at % 8);
            self.bytes.insert(rank, value);
        }
    }

    fn check(&self) -> Result<()> {
        let set: usize = self.mask.iter().map(|b| b.count_ones() as usize).sum();
        if set == self.bytes.len() {
            Ok(())
        } else {
            Err(VfsError::Corrupt(format!(
                "dirty mask has {} set bits but {} overlay bytes",
                set,
                self.bytes.len()
            )))
        }
    }

    /// Lay the recorded bytes over `dst`, which views the page starting at
    /// byte `page_off`.
    pub fn overlay_into(&self, page_off: usize, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            let at = page_off + i;
            if at / 8 < self.mask.len() && self.bit(at) {
                *slot = self.bytes[self.rank(at)];
            }
        }
    }

    /// Fold the overlay into `buf` and clear it.
    pub fn commit_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check()?;
        let mut rank = 0;
        for at in 0..buf.len() {
            if self.bit(at) {
                buf[at] = self.bytes[rank];
                rank += 1;
            }
        }
        self.clear();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.mask.fill(0);
        self.bytes.clear();
    }
}

/// Content of a single page or frame in a volatile file.
#[derive(Debug)]
pub struct Page {
    /// Full page content. Fixed at the file's page size for database and WAL
    /// files; growable for journal-style files that live in one buffer.
    buf: Vec<u8>,
    /// Frame header, WAL pages only. Holds the commit/salt/checksum metadata
    /// the engine manages; this layer treats all but the page number and
    /// commit marker as opaque.
    frame_header: Option<[u8; FRAME_HEADER_SIZE]>,
    /// Dirty-byte overlay, WAL pages only.
    dirty: Option<DirtyOverlay>,
    /// Whether the page has received a direct write. A page that exists only
    /// as zero fill for a gap takes its first partial write directly rather
    /// than through the overlay.
    populated: bool,
}

impl Page {
    /// A database page: fixed size, no frame header, no overlay.
    pub fn new_db(page_size: usize) -> Result<Self> {
        Ok(Page {
            buf: try_zeroed(page_size)?,
            frame_header: None,
            dirty: None,
            populated: false,
        })
    }

    /// A WAL frame page: fixed size, with overlay tracking.
    pub fn new_wal(page_size: usize) -> Result<Self> {
        Ok(Page {
            buf: try_zeroed(page_size)?,
            frame_header: None,
            dirty: Some(DirtyOverlay::new(page_size)?),
            populated: false,
        })
    }

    /// A growable page holding an entire journal-style file.
    pub fn new_growable() -> Self {
        Page {
            buf: Vec::new(),
            frame_header: None,
            dirty: None,
            populated: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn frame_header(&self) -> Option<&[u8; FRAME_HEADER_SIZE]> {
        self.frame_header.as_ref()
    }

    /// Install the frame header. Per the commit protocol, a header write also
    /// folds any pending dirty overlay into the page content.
    pub fn set_frame_header(&mut self, header: [u8; FRAME_HEADER_SIZE]) -> Result<()> {
        if let Some(dirty) = self.dirty.as_mut() {
            if !dirty.is_empty() {
                dirty.commit_into(&mut self.buf)?;
            }
        }
        self.frame_header = Some(header);
        Ok(())
    }

    /// Write bytes directly into the page (database pages, or the first
    /// population of a WAL page).
    pub fn write(&mut self, off: usize, data: &[u8]) -> Result<()> {
        let end = off
            .checked_add(data.len())
            .ok_or_else(|| VfsError::InvalidArgument("write range overflows".into()))?;
        if end > self.buf.len() {
            return Err(VfsError::InvalidArgument(format!(
                "write of {} bytes at page offset {} exceeds page size {}",
                data.len(),
                off,
                self.buf.len()
            )));
        }
        self.buf[off..end].copy_from_slice(data);
        self.populated = true;
        Ok(())
    }

    /// Write bytes into the page, extending it as needed (journal-style files
    /// only).
    pub fn write_extend(&mut self, off: usize, data: &[u8]) -> Result<()> {
        let end = off
            .checked_add(data.len())
            .ok_or_else(|| VfsError::InvalidArgument("write range overflows".into()))?;
        if end > self.buf.len() {
            let grow = end - self.buf.len();
            self.buf
                .try_reserve(grow)
                .map_err(|_| VfsError::OutOfMemory(format!("growing file buffer to {}", end)))?;
            self.buf.resize(end, 0);
        }
        self.buf[off..end].copy_from_slice(data);
        self.populated = true;
        Ok(())
    }

    /// Write a WAL frame's page payload.
    ///
    /// A write covering the whole page replaces the content and clears the
    /// overlay. A partial write to a previously-written page is recorded in
    /// the overlay instead of touching `buf`, so the change becomes visible
    /// in `buf` only when committed by a frame-header write.
    pub fn write_payload(&mut self, off: usize, data: &[u8]) -> Result<()> {
        if off == 0 && data.len() == self.buf.len() {
            self.buf.copy_from_slice(data);
            if let Some(dirty) = self.dirty.as_mut() {
                dirty.clear();
            }
            self.populated = true;
            return Ok(());
        }
        if !self.populated {
            return self.write(off, data);
        }
        let end = off
            .checked_add(data.len())
            .ok_or_else(|| VfsError::InvalidArgument("write range overflows".into()))?;
        if end > self.buf.len() {
            return Err(VfsError::InvalidArgument(format!(
                "partial write of {} bytes at frame offset {} exceeds page size {}",
                data.len(),
                off,
                self.buf.len()
            )));
        }
        let dirty = self
            .dirty
            .as_mut()
            .ok_or_else(|| VfsError::Corrupt("partial overlay write to a non-WAL page".into()))?;
        for (i, &b) in data.iter().enumerate() {
            dirty.record(off + i, b);
        }
        Ok(())
    }

    /// Copy page bytes starting at `off` into `dst`, with any dirty overlay
    /// merged over the stored content so partial writes read back exactly as
    /// written.
    pub fn read_into(&self, off: usize, dst: &mut [u8]) {
        let avail = self.buf.len().saturating_sub(off);
        let n = dst.len().min(avail);
        dst[..n].copy_from_slice(&self.buf[off..off + n]);
        if let Some(dirty) = self.dirty.as_ref() {
            dirty.overlay_into(off, &mut dst[..n]);
        }
        dst[n..].fill(0);
    }

    /// Shrink the page buffer (journal-style files only).
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Owned copy of the page content with the overlay merged.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut out = try_zeroed(self.buf.len())?;
        self.read_into(0, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_records_in_bit_order() {
        let mut d = DirtyOverlay::new(64).unwrap();
        d.record(10, 0xAA);
        d.record(3, 0xBB);
        d.record(10, 0xCC); // overwrite keeps a single entry

        let mut buf = vec![0u8; 64];
        d.commit_into(&mut buf).unwrap();
        assert_eq!(buf[3], 0xBB);
        assert_eq!(buf[10], 0xCC);
        assert!(d.is_empty());
    }

    #[test]
    fn test_overlay_read_merge() {
        let mut page = Page::new_wal(32).unwrap();
        page.write_payload(0, &[1u8; 32]).unwrap();
        page.write_payload(4, &[9, 9]).unwrap();

        let mut out = [0u8; 32];
        page.read_into(0, &mut out);
        assert_eq!(out[3], 1);
        assert_eq!(out[4], 9);
        assert_eq!(out[5], 9);
        assert_eq!(out[6], 1);
    }

    #[test]
    fn test_overlay_committed_by_header_write() {
        let mut page = Page::new_wal(32).unwrap();
        page.write_payload(0, &[1u8; 32]).unwrap();
        page.write_payload(0, &[7, 7]).unwrap();

        page.set_frame_header([0u8; FRAME_HEADER_SIZE]).unwrap();
        // After the commit the overlay is gone and buf carries the merge.
        let snap = page.snapshot().unwrap();
        assert_eq!(&snap[..3], &[7, 7, 1]);
        assert!(page.dirty.as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_full_write_clears_overlay() {
        let mut page = Page::new_wal(16).unwrap();
        page.write_payload(0, &[1u8; 16]).unwrap();
        page.write_payload(2, &[5]).unwrap();
        page.write_payload(0, &[2u8; 16]).unwrap();

        let snap = page.snapshot().unwrap();
        assert_eq!(snap, vec![2u8; 16]);
    }

    #[test]
    fn test_first_partial_write_goes_direct() {
        let mut page = Page::new_wal(16).unwrap();
        page.write_payload(4, &[3, 3]).unwrap();
        assert!(page.dirty.as_ref().unwrap().is_empty());
        let snap = page.snapshot().unwrap();
        assert_eq!(snap[4], 3);
        assert_eq!(snap[5], 3);
    }

    #[test]
    fn test_read_past_end_zero_fills() {
        let mut page = Page::new_growable();
        page.write_extend(0, b"abc").unwrap();
        let mut out = [0xFFu8; 6];
        page.read_into(1, &mut out);
        assert_eq!(&out, b"bc\0\0\0\0");
    }

    #[test]
    fn test_write_beyond_fixed_page_rejected() {
        let mut page = Page::new_db(16).unwrap();
        assert!(matches!(
            page.write(10, &[0u8; 10]),
            Err(VfsError::InvalidArgument(_))
        ));
    }
}
