use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::buffer::BufferPoolManager;
use crate::common::{
    ArborError, DbConfig, DbType, EnvConfig, EnvFlags, OpenFlags, Result, DEFAULT_FILE_MODE,
};

use super::database::{Database, OpenRequest, PoolSource};
use super::registry::missing_as_not_found;

struct EnvState {
    home: PathBuf,
    flags: EnvFlags,
    mode: u32,
    pool: Option<Arc<BufferPoolManager>>,
}

impl EnvState {
    fn resolve(&self, filename: &Path) -> PathBuf {
        if filename.is_absolute() {
            filename.to_path_buf()
        } else {
            self.home.join(filename)
        }
    }
}

/// Shared between an [`Environment`] and the handles opened through it.
pub(crate) struct EnvShared {
    config: EnvConfig,
    state: RwLock<Option<EnvState>>,
    open_handles: AtomicUsize,
}

impl EnvShared {
    pub(crate) fn handle_opened(&self) {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn handle_closed(&self) {
        self.open_handles.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A home directory plus one buffer pool shared by every database opened
/// through it.
///
/// ```no_run
/// use arbor::{DbType, EnvFlags, Environment, OpenFlags};
///
/// let env = Environment::new();
/// env.open("/var/lib/app", EnvFlags::CREATE | EnvFlags::INIT_MPOOL, 0)?;
/// let users = env.open_database("users.db", None, DbType::BTree, OpenFlags::CREATE)?;
/// users.put(b"alice", b"1")?;
/// users.close()?;
/// env.close()?;
/// # Ok::<(), arbor::ArborError>(())
/// ```
pub struct Environment {
    inner: Arc<EnvShared>,
}

impl Environment {
    pub fn new() -> Self {
        Self::with_config(EnvConfig::default())
    }

    pub fn with_config(config: EnvConfig) -> Self {
        Self {
            inner: Arc::new(EnvShared {
                config,
                state: RwLock::new(None),
                open_handles: AtomicUsize::new(0),
            }),
        }
    }

    /// Binds the environment to the `home` directory, creating it first when
    /// `flags` has `CREATE`. `mode` is the permission set for files created
    /// later; 0 picks 0o644.
    pub fn open(&self, home: impl AsRef<Path>, flags: EnvFlags, mode: u32) -> Result<()> {
        self.inner.config.validate()?;
        let mut state = self.inner.state.write();
        if state.is_some() {
            return Err(ArborError::invalid("environment is already open"));
        }

        let home = home.as_ref();
        if flags.contains(EnvFlags::CREATE) {
            match fs::create_dir(home) {
                Ok(()) => info!(home = %home.display(), "env.create_home"),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(missing_as_not_found(err)),
            }
        }
        let metadata = fs::metadata(home).map_err(missing_as_not_found)?;
        if !metadata.is_dir() {
            return Err(ArborError::invalid(format!(
                "{} is not a directory",
                home.display()
            )));
        }
        let home = fs::canonicalize(home)?;

        let pool = flags.contains(EnvFlags::INIT_MPOOL).then(|| {
            Arc::new(BufferPoolManager::new(
                self.inner.config.cache_pages,
                self.inner.config.lru_k,
            ))
        });
        let mode = if mode == 0 { DEFAULT_FILE_MODE } else { mode };

        info!(
            home = %home.display(),
            flags = ?flags,
            cache_pages = pool.as_ref().map(|pool| pool.pool_size()),
            "env.open"
        );
        *state = Some(EnvState {
            home,
            flags,
            mode,
            pool,
        });
        Ok(())
    }

    /// Flushes the shared pool and unbinds the home directory. Fails with
    /// `ResourceBusy` while databases opened here are still open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        let Some(current) = state.as_ref() else {
            return Err(ArborError::invalid("environment is not open"));
        };
        let open = self.inner.open_handles.load(Ordering::Acquire);
        if open > 0 {
            return Err(ArborError::busy(format!(
                "{} database handle(s) still open",
                open
            )));
        }
        if let Some(pool) = &current.pool {
            pool.flush_all_pages()?;
        }
        info!(home = %current.home.display(), "env.close");
        *state = None;
        Ok(())
    }

    /// Opens a database whose relative `filename` resolves against the home
    /// directory.
    pub fn open_database(
        &self,
        filename: impl AsRef<Path>,
        name: Option<&str>,
        db_type: DbType,
        flags: OpenFlags,
    ) -> Result<Database> {
        self.open_database_with_config(filename, name, db_type, flags, DbConfig::default())
    }

    /// Like [`Environment::open_database`]. The cache fields of `config` are
    /// ignored in favour of the shared pool.
    pub fn open_database_with_config(
        &self,
        filename: impl AsRef<Path>,
        name: Option<&str>,
        db_type: DbType,
        flags: OpenFlags,
        config: DbConfig,
    ) -> Result<Database> {
        let state = self.inner.state.read();
        let state = state
            .as_ref()
            .ok_or_else(|| ArborError::invalid("environment is not open"))?;
        let pool = state.pool.clone().ok_or_else(|| {
            ArborError::invalid("environment was opened without INIT_MPOOL")
        })?;

        Database::open_in(OpenRequest {
            path: state.resolve(filename.as_ref()),
            name,
            db_type,
            flags,
            config: &config,
            pool: PoolSource::Shared(pool),
            mode: state.mode,
            env: Some(Arc::clone(&self.inner)),
        })
    }

    /// Removes a database file, resolving `filename` against the home directory.
    pub fn remove_database(&self, filename: impl AsRef<Path>) -> Result<()> {
        let path = self.resolve(filename.as_ref())?;
        Database::remove(path)
    }

    /// Renames a database file, resolving both names against the home directory.
    pub fn rename_database(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let from = self.resolve(from.as_ref())?;
        let to = self.resolve(to.as_ref())?;
        Database::rename(from, to)
    }

    fn resolve(&self, filename: &Path) -> Result<PathBuf> {
        self.inner
            .state
            .read()
            .as_ref()
            .map(|state| state.resolve(filename))
            .ok_or_else(|| ArborError::invalid("environment is not open"))
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.read().is_some()
    }

    pub fn home(&self) -> Option<PathBuf> {
        self.inner
            .state
            .read()
            .as_ref()
            .map(|state| state.home.clone())
    }

    pub fn flags(&self) -> Option<EnvFlags> {
        self.inner.state.read().as_ref().map(|state| state.flags)
    }

    /// Databases opened through this environment and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::Acquire)
    }

    /// Frames in the shared pool, if one was set up.
    pub fn cache_pages(&self) -> Option<usize> {
        self.inner
            .state
            .read()
            .as_ref()
            .and_then(|state| state.pool.as_ref().map(|pool| pool.pool_size()))
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                warn!(error = %err, "env.drop.close_failed");
            }
        }
    }
}
