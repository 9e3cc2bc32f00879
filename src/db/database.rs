use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::buffer::BufferPoolManager;
use crate::common::{
    ArborError, DbConfig, DbType, OpenFlags, Result, DEFAULT_FILE_MODE, DEFAULT_PAGE_SIZE,
};
use crate::index::BTreeIndex;
use crate::storage::PageStore;

use super::cursor::{Cursor, Iter};
use super::environment::EnvShared;
use super::registry::{missing_as_not_found, normalize, OpenFiles, SharedFile};

/// Snapshot of a database file's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStat {
    pub page_size: usize,
    /// Pages in the file, the meta page included
    pub page_count: u32,
    /// Pages on the free list
    pub free_pages: u32,
    /// Tree levels, 1 for a lone root leaf
    pub height: u32,
    /// Live key/value pairs
    pub entries: u64,
}

/// Where a newly opened file gets its buffer pool.
#[derive(Clone)]
pub(crate) enum PoolSource {
    Private { cache_pages: usize, lru_k: usize },
    Shared(Arc<BufferPoolManager>),
}

impl PoolSource {
    fn into_pool(self) -> Arc<BufferPoolManager> {
        match self {
            PoolSource::Private { cache_pages, lru_k } => {
                Arc::new(BufferPoolManager::new(cache_pages, lru_k))
            }
            PoolSource::Shared(pool) => pool,
        }
    }
}

pub(crate) struct OpenRequest<'a> {
    pub(crate) path: PathBuf,
    pub(crate) name: Option<&'a str>,
    pub(crate) db_type: DbType,
    pub(crate) flags: OpenFlags,
    pub(crate) config: &'a DbConfig,
    pub(crate) pool: PoolSource,
    pub(crate) mode: u32,
    pub(crate) env: Option<Arc<EnvShared>>,
}

/// State behind a [`Database`] and the cursors it hands out.
pub(crate) struct DbHandle {
    path: PathBuf,
    flags: OpenFlags,
    file: RwLock<Option<Arc<SharedFile>>>,
    env: Option<Arc<EnvShared>>,
}

impl DbHandle {
    /// The open file, or `InvalidArgument` once the handle is closed.
    pub(crate) fn file(&self) -> Result<Arc<SharedFile>> {
        self.file
            .read()
            .clone()
            .ok_or_else(|| ArborError::invalid("database handle is closed"))
    }

    fn writable_file(&self) -> Result<Arc<SharedFile>> {
        let file = self.file()?;
        if self.flags.contains(OpenFlags::READ_ONLY) {
            return Err(ArborError::invalid(format!(
                "{} is opened read-only",
                self.path.display()
            )));
        }
        Ok(file)
    }

    fn is_open(&self) -> bool {
        self.file.read().is_some()
    }

    fn close(&self) -> Result<()> {
        let Some(shared) = self.file.write().take() else {
            return Ok(());
        };
        let result = OpenFiles::lock().release(&shared);
        if let Some(env) = &self.env {
            env.handle_closed();
        }
        info!(path = %self.path.display(), "db.close");
        result
    }
}

/// Handle to one ordered key/value file.
///
/// Handles are cheap to share across threads. Every handle opened on the same
/// path in this process shares one tree, so readers and writers on different
/// handles see each other's changes and serialize on the same lock.
///
/// # Example
///
/// ```no_run
/// use arbor::{Database, DbType, OpenFlags};
///
/// let db = Database::open("data.db", None, DbType::BTree, OpenFlags::CREATE)?;
/// db.put(b"apple", b"red")?;
/// assert_eq!(&db.get(b"apple")?[..], b"red");
/// db.close()?;
/// # Ok::<(), arbor::ArborError>(())
/// ```
pub struct Database {
    inner: Arc<DbHandle>,
}

impl Database {
    /// Opens or creates a database file with the default configuration.
    pub fn open(
        path: impl AsRef<Path>,
        name: Option<&str>,
        db_type: DbType,
        flags: OpenFlags,
    ) -> Result<Self> {
        Self::open_with_config(path, name, db_type, flags, DbConfig::default())
    }

    /// Opens or creates a database file with a private buffer pool sized by
    /// `config`.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        name: Option<&str>,
        db_type: DbType,
        flags: OpenFlags,
        config: DbConfig,
    ) -> Result<Self> {
        let pool = PoolSource::Private {
            cache_pages: config.cache_pages,
            lru_k: config.lru_k,
        };
        Self::open_in(OpenRequest {
            path: path.as_ref().to_path_buf(),
            name,
            db_type,
            flags,
            config: &config,
            pool,
            mode: DEFAULT_FILE_MODE,
            env: None,
        })
    }

    pub(crate) fn open_in(request: OpenRequest<'_>) -> Result<Self> {
        validate_open(&request)?;
        let path = normalize(&request.path)?;

        let mut open_files = OpenFiles::lock();
        let shared = match open_files.get(&path) {
            Some(shared) => {
                join_open_file(&shared, &request)?;
                shared
            }
            None => {
                let shared = Arc::new(open_file(&path, &request)?);
                open_files.insert(&shared);
                shared
            }
        };
        open_files.acquire(&shared);
        drop(open_files);

        if let Some(env) = &request.env {
            env.handle_opened();
        }
        info!(path = %path.display(), flags = ?request.flags, "db.open");
        Ok(Self {
            inner: Arc::new(DbHandle {
                path,
                flags: request.flags,
                file: RwLock::new(Some(shared)),
                env: request.env,
            }),
        })
    }

    /// Inserts `key` or replaces its value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let file = self.inner.writable_file()?;
        file.run_write(|tree| tree.insert(key, value))
    }

    /// Returns the value stored under `key`, or [`ArborError::NotFound`].
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        if key.is_empty() {
            return Err(ArborError::invalid("key must not be empty"));
        }
        let file = self.inner.file()?;
        file.run_read(|tree| tree.get(key))?
            .ok_or(ArborError::NotFound)
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let file = self.inner.writable_file()?;
        file.run_write(|tree| tree.delete(key))
    }

    /// Opens an unpositioned cursor.
    pub fn cursor(&self) -> Result<Cursor> {
        self.inner.file()?;
        Ok(Cursor::new(Arc::clone(&self.inner)))
    }

    /// Iterates every pair in key order.
    pub fn iter(&self) -> Result<Iter> {
        Ok(self.cursor()?.into_iter())
    }

    /// Writes dirty pages and the meta page to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.file()?.sync()
    }

    pub fn len(&self) -> Result<u64> {
        self.inner.file()?.run_read(|tree| Ok(tree.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stat(&self) -> Result<DbStat> {
        self.inner.file()?.run_read(|tree| {
            let meta = tree.store().meta();
            Ok(DbStat {
                page_size: meta.page_size,
                page_count: meta.page_count,
                free_pages: meta.free_count,
                height: meta.height,
                entries: meta.entry_count,
            })
        })
    }

    /// Walks the whole tree and verifies its structural invariants.
    pub fn check(&self) -> Result<()> {
        self.inner.file()?.run_read(BTreeIndex::check)
    }

    pub fn flags(&self) -> OpenFlags {
        self.inner.flags
    }

    /// Normalized path of the file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Flushes and releases the handle. Closing twice is a no-op; cursors
    /// opened from this handle fail afterwards.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Deletes a database file that no handle in this process has open.
    pub fn remove(path: impl AsRef<Path>) -> Result<()> {
        let path = normalize(path.as_ref())?;
        let mut open_files = OpenFiles::lock();
        if open_files.is_open(&path) {
            return Err(ArborError::busy(format!("{} is open", path.display())));
        }
        fs::remove_file(&path).map_err(missing_as_not_found)?;
        info!(path = %path.display(), "db.remove");
        Ok(())
    }

    /// Renames a database file that no handle in this process has open.
    pub fn rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let from = normalize(from.as_ref())?;
        let to = normalize(to.as_ref())?;
        let mut open_files = OpenFiles::lock();
        for path in [&from, &to] {
            if open_files.is_open(path) {
                return Err(ArborError::busy(format!("{} is open", path.display())));
            }
        }
        fs::metadata(&from).map_err(missing_as_not_found)?;
        if fs::symlink_metadata(&to).is_ok() {
            return Err(ArborError::AlreadyExists);
        }
        fs::rename(&from, &to)?;
        info!(from = %from.display(), to = %to.display(), "db.rename");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.inner.path.display(), error = %err, "db.drop.close_failed");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("flags", &self.inner.flags)
            .field("open", &self.is_open())
            .finish()
    }
}

fn validate_open(request: &OpenRequest<'_>) -> Result<()> {
    request.config.validate()?;

    let flags = request.flags;
    if flags.contains(OpenFlags::READ_ONLY)
        && (flags.contains(OpenFlags::CREATE) || flags.contains(OpenFlags::TRUNCATE))
    {
        return Err(ArborError::invalid(
            "READ_ONLY cannot be combined with CREATE or TRUNCATE",
        ));
    }
    if flags.contains(OpenFlags::EXCLUSIVE) && !flags.contains(OpenFlags::CREATE) {
        return Err(ArborError::invalid("EXCLUSIVE requires CREATE"));
    }
    if let Some(name) = request.name.filter(|name| !name.is_empty()) {
        return Err(ArborError::invalid(format!(
            "named sub-database {:?} is not supported",
            name
        )));
    }
    match request.db_type {
        DbType::BTree | DbType::Unknown => Ok(()),
        other => Err(ArborError::invalid(format!(
            "{:?} access method is not supported",
            other
        ))),
    }
}

/// Checks that another handle may join a file this process already has open.
fn join_open_file(shared: &SharedFile, request: &OpenRequest<'_>) -> Result<()> {
    let flags = request.flags;
    if flags.contains(OpenFlags::TRUNCATE) {
        return Err(ArborError::busy(format!(
            "cannot truncate {} while it is open",
            shared.path().display()
        )));
    }
    if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
        return Err(ArborError::AlreadyExists);
    }
    if shared.is_read_only() && !flags.contains(OpenFlags::READ_ONLY) {
        return Err(ArborError::busy(format!(
            "{} is open read-only",
            shared.path().display()
        )));
    }
    shared.check_usable()?;

    let config = request.config;
    let (page_size, comparator, min_fill_percent, pool) = shared.inspect(|tree| {
        (
            tree.store().page_size(),
            tree.comparator().name().to_string(),
            tree.min_fill_percent(),
            Arc::clone(tree.store().pool()),
        )
    });
    if let Some(requested) = config.page_size {
        if requested != page_size {
            return Err(ArborError::corruption(format!(
                "page size {} requested but {} stores {}",
                requested,
                shared.path().display(),
                page_size
            )));
        }
    }
    if config.comparator.name() != comparator {
        return Err(ArborError::invalid(format!(
            "{} is open with comparator {}, not {}",
            shared.path().display(),
            comparator,
            config.comparator.name()
        )));
    }
    if config.min_fill_percent != min_fill_percent {
        return Err(ArborError::invalid(format!(
            "{} is open with min fill {}%, not {}%",
            shared.path().display(),
            min_fill_percent,
            config.min_fill_percent
        )));
    }
    // A private request takes whatever pool the file already has; a shared
    // one must find the file in that same pool.
    if let PoolSource::Shared(requested) = &request.pool {
        if !Arc::ptr_eq(requested, &pool) {
            return Err(ArborError::busy(format!(
                "{} is open outside this environment's buffer pool",
                shared.path().display()
            )));
        }
    }
    debug!(path = %shared.path().display(), "db.open.join");
    Ok(())
}

/// Opens the file at `path`, formatting it first when it is new or truncated.
fn open_file(path: &Path, request: &OpenRequest<'_>) -> Result<SharedFile> {
    let flags = request.flags;
    let exists = match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => true,
        Ok(_) => {
            return Err(ArborError::invalid(format!(
                "{} is not a regular file",
                path.display()
            )))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => return Err(err.into()),
    };
    if exists && flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
        return Err(ArborError::AlreadyExists);
    }
    if !exists && !flags.contains(OpenFlags::CREATE) {
        return Err(ArborError::NotFound);
    }
    if !exists && request.db_type == DbType::Unknown {
        return Err(ArborError::invalid(
            "creating a database requires an explicit access method",
        ));
    }

    let read_only = flags.contains(OpenFlags::READ_ONLY);
    let mut options = OpenOptions::new();
    options.read(true).write(!read_only).create(!read_only);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(request.mode);
    }
    let file = options.open(path).map_err(missing_as_not_found)?;

    if exists && flags.contains(OpenFlags::TRUNCATE) {
        file.set_len(0)?;
        info!(path = %path.display(), "db.truncate");
    }

    let config = request.config;
    let pool = request.pool.clone().into_pool();

    let store = if file.metadata()?.len() == 0 {
        if read_only {
            return Err(ArborError::corruption(format!(
                "{} is empty",
                path.display()
            )));
        }
        if request.db_type == DbType::Unknown {
            return Err(ArborError::invalid(
                "formatting an empty file requires an explicit access method",
            ));
        }
        let page_size = config.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        PageStore::create(pool, file, path.to_path_buf(), page_size, DbType::BTree)?
    } else {
        PageStore::open(pool, file, path.to_path_buf(), config.page_size, read_only)?
    };

    let stored = store.meta().db_type;
    if stored != DbType::BTree {
        return Err(ArborError::invalid(format!(
            "{} uses the unsupported {:?} access method",
            path.display(),
            stored
        )));
    }
    if request.db_type != DbType::Unknown && request.db_type != stored {
        return Err(ArborError::invalid(format!(
            "{} is a {:?} database, not {:?}",
            path.display(),
            stored,
            request.db_type
        )));
    }

    let tree = BTreeIndex::open(
        Arc::new(store),
        Arc::clone(&config.comparator),
        config.min_fill_percent,
    )?;
    if !read_only {
        tree.store().sync()?;
    }
    Ok(SharedFile::new(path.to_path_buf(), tree, read_only))
}
