//! # Mirage - Volatile VFS for Replicated SQLite
//!
//! `mirage-vfs` is the storage substrate for a replicated embedded SQL
//! database: an in-memory virtual filesystem standing in for the operating
//! system's file I/O beneath SQLite. The engine believes it is reading and
//! writing ordinary database and write-ahead-log files; in reality every
//! byte lives in managed memory, and the accumulated WAL frames are what a
//! replication layer ships to other cluster nodes.
//!
//! - **Full filesystem contract**: atomic opens, byte-range reads and
//!   writes, fsync-equivalent durability points, advisory locking, and the
//!   shared-memory WAL-index regions WAL mode requires
//! - **Replication hooks**: committed frames are extractable in commit
//!   order after each sync, and a checkpoint gate refuses to merge the WAL
//!   while write transactions are in flight
//! - **Explicitly volatile**: durability comes from replication, not disk;
//!   a file lives exactly as long as something holds it open
//!
//! ## Quick Start
//!
//! ```rust
//! use mirage_vfs::{OpenOptions, Registry, Result};
//!
//! # fn main() -> Result<()> {
//! let registry = Registry::new();
//!
//! // Open a file and write through it. A file lives as long as a handle
//! // pins it; clones of the registry share the same namespace.
//! let db = registry.open("app.db", OpenOptions::create())?;
//! # drop(db);
//! # Ok(())
//! # }
//! ```
//!
//! ## Serving SQLite
//!
//! ```rust,no_run
//! use mirage_vfs::{register_vfs, Registry, VFS_NAME};
//!
//! # fn main() -> mirage_vfs::Result<()> {
//! let registry = Registry::new();
//! register_vfs(VFS_NAME, registry.clone())?;
//! // Connections opened with `file:app.db?vfs=mirage` now live in memory;
//! // poll committed frames off a pinned handle after each commit.
//! # Ok(())
//! # }
//! ```

pub mod content;
pub mod error;
pub mod format;
pub mod handle;
pub mod lock;
pub mod page;
pub mod registry;
pub mod vfs;
pub mod wal;

pub use content::FileKind;
pub use error::{Result, VfsError};
pub use handle::FileHandle;
pub use lock::LockLevel;
pub use registry::{ContentId, ContentStats, OpenOptions, Registry};
pub use vfs::{register_vfs, unregister_vfs, VFS_NAME};
pub use wal::WalFrame;
