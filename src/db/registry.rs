use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::common::{ArborError, Result};
use crate::index::BTreeIndex;

/// State shared by every handle open on one database file: the tree, its
/// page store and the file's reader/writer lock.
pub(crate) struct SharedFile {
    path: PathBuf,
    tree: RwLock<BTreeIndex>,
    read_only: bool,
    /// Handles currently open on the file, changed under the registry lock
    handles: AtomicUsize,
    /// Message of the first corruption seen; later operations repeat it
    poison: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl SharedFile {
    pub(crate) fn new(path: PathBuf, tree: BTreeIndex, read_only: bool) -> Self {
        Self {
            path,
            tree: RwLock::new(tree),
            read_only,
            handles: AtomicUsize::new(0),
            poison: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Runs `f` against the tree without the usability checks, for reading
    /// settings fixed at open.
    pub(crate) fn inspect<T>(&self, f: impl FnOnce(&BTreeIndex) -> T) -> T {
        f(&self.tree.read())
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poison.lock().is_some()
    }

    /// Fails if the file was shut down or poisoned.
    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ArborError::invalid(format!(
                "{} has been closed",
                self.path.display()
            )));
        }
        if let Some(message) = self.poison.lock().as_ref() {
            return Err(ArborError::Corruption(message.clone()));
        }
        Ok(())
    }

    /// Runs `f` under the shared lock.
    pub(crate) fn run_read<T>(&self, f: impl FnOnce(&BTreeIndex) -> Result<T>) -> Result<T> {
        self.check_usable()?;
        let tree = self.tree.read();
        self.observe(f(&tree))
    }

    /// Runs `f` under the exclusive lock.
    pub(crate) fn run_write<T>(&self, f: impl FnOnce(&BTreeIndex) -> Result<T>) -> Result<T> {
        self.check_usable()?;
        let tree = self.tree.write();
        self.observe(f(&tree))
    }

    /// Poisons the file on the first corruption error.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ArborError::Corruption(message)) = &result {
            let mut poison = self.poison.lock();
            if poison.is_none() {
                warn!(path = %self.path.display(), error = %message, "db.poisoned");
                *poison = Some(message.clone());
            }
        }
        result
    }

    pub(crate) fn sync(&self) -> Result<()> {
        if self.read_only || self.is_poisoned() {
            return Ok(());
        }
        self.run_write(|tree| tree.store().sync())
    }

    /// Closes the page store once the last handle is gone.
    fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let tree = self.tree.write();
        let result = tree.store().close();
        match result {
            Err(err) if self.is_poisoned() => {
                warn!(path = %self.path.display(), error = %err, "db.shutdown.poisoned");
                Ok(())
            }
            other => other,
        }
    }
}

type OpenFileMap = HashMap<PathBuf, Weak<SharedFile>>;

static OPEN_FILES: OnceLock<Mutex<OpenFileMap>> = OnceLock::new();

/// Locked view of the database files open in this process, keyed by
/// normalized path. Holding it serializes open, close, rename and remove.
pub(crate) struct OpenFiles {
    files: MutexGuard<'static, OpenFileMap>,
}

impl OpenFiles {
    pub(crate) fn lock() -> Self {
        Self {
            files: OPEN_FILES.get_or_init(Default::default).lock(),
        }
    }

    pub(crate) fn get(&mut self, path: &Path) -> Option<Arc<SharedFile>> {
        match self.files.get(path).and_then(Weak::upgrade) {
            Some(shared) if !shared.closed.load(Ordering::Acquire) => Some(shared),
            Some(_) => None,
            None => {
                self.files.remove(path);
                None
            }
        }
    }

    pub(crate) fn is_open(&mut self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Registers a newly opened file.
    pub(crate) fn insert(&mut self, shared: &Arc<SharedFile>) {
        self.files.insert(shared.path.clone(), Arc::downgrade(shared));
    }

    /// Counts another handle on `shared`.
    pub(crate) fn acquire(&mut self, shared: &SharedFile) {
        let handles = shared.handles.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(path = %shared.path.display(), handles, "db.registry.acquire");
    }

    /// Drops one handle. The last one shuts the file down; the others only
    /// flush.
    pub(crate) fn release(&mut self, shared: &SharedFile) -> Result<()> {
        let remaining = shared.handles.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        debug!(path = %shared.path.display(), handles = remaining, "db.registry.release");
        if remaining > 0 {
            return shared.sync();
        }
        self.files.remove(&shared.path);
        shared.shutdown()
    }
}

/// Maps `path` to the key used for the open-file registry: the canonical
/// path of an existing file, or the canonical parent joined with the file
/// name for one that does not exist yet.
pub(crate) fn normalize(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let file_name = path.file_name().ok_or_else(|| {
                ArborError::invalid(format!("{} does not name a file", path.display()))
            })?;
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let parent = std::fs::canonicalize(parent).map_err(missing_as_not_found)?;
            Ok(parent.join(file_name))
        }
        Err(err) => Err(err.into()),
    }
}

/// Reports a missing file as [`ArborError::NotFound`] instead of an I/O error.
pub(crate) fn missing_as_not_found(err: io::Error) -> ArborError {
    if err.kind() == ErrorKind::NotFound {
        ArborError::NotFound
    } else {
        ArborError::Io(err)
    }
}
