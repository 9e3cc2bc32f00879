//! Arbor - An embedded, ordered key-value storage engine
//!
//! This crate stores byte-string keys and values in single-file databases
//! organized as a disk-backed B+tree. Pages are cached in a buffer pool that
//! is either private to one file or shared by every database opened inside an
//! [`Environment`].
//!
//! # Architecture
//!
//! The system is organized into several layers:
//!
//! - **Storage Layer** (`storage`): Handles disk I/O and page organization
//!   - `DiskManager`: Reads and writes fixed-size pages of one file
//!   - `PageStore`: Meta page, page allocation and the free-page list
//!
//! - **Buffer Pool** (`buffer`): Memory management for database pages
//!   - `BufferPoolManager`: Caches pages of any number of files, keyed by
//!     (file, page number)
//!   - `LruKReplacer`: LRU-K page replacement policy
//!   - `FrameHeader`: Per-frame metadata and data storage
//!   - `ReadPageGuard`/`WritePageGuard`: RAII guards for thread-safe page access
//!
//! - **Index** (`index`): The B+tree over variable-length keys, with
//!   byte-measured splits, merge-or-redistribute on delete and leaf chaining
//!
//! - **Handles** (`db`): `Database`, `Cursor` and `Environment`, the public
//!   lifecycle and per-file reader/writer locking
//!
//! # Example
//!
//! ```rust,no_run
//! use arbor::{CursorMode, Database, DbType, OpenFlags};
//!
//! let db = Database::open("fruit.db", None, DbType::BTree, OpenFlags::CREATE)?;
//! db.put(b"apple", b"red")?;
//! db.put(b"banana", b"yellow")?;
//!
//! let mut cursor = db.cursor()?;
//! while let Some((key, value)) = cursor.get(CursorMode::Next)? {
//!     println!("{:?} => {:?}", key, value);
//! }
//!
//! db.close()?;
//! # Ok::<(), arbor::ArborError>(())
//! ```

pub mod buffer;
pub mod common;
pub mod db;
pub mod index;
pub mod storage;

use std::path::Path;

// Re-export commonly used types at the crate root
pub use common::{
    ArborError, CursorMode, DbConfig, DbType, EnvConfig, EnvFlags, OpenFlags, PageId, Result,
};
pub use db::{Cursor, Database, DbStat, Environment, Iter};
pub use index::{BytewiseComparator, KeyComparator};

/// Opens a standalone database. Shorthand for [`Database::open`].
pub fn open(
    path: impl AsRef<Path>,
    name: Option<&str>,
    db_type: DbType,
    flags: OpenFlags,
) -> Result<Database> {
    Database::open(path, name, db_type, flags)
}

/// Deletes a database file that is not open in this process.
pub fn remove(path: impl AsRef<Path>) -> Result<()> {
    Database::remove(path)
}

/// Renames a database file that is not open in this process.
pub fn rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    Database::rename(from, to)
}

/// Engine name and crate version, e.g. `"arbor 0.1.0"`.
pub fn version() -> String {
    format!("arbor {}", env!("CARGO_PKG_VERSION"))
}
