use bitflags::bitflags;

bitflags! {
    /// Flags accepted by [`crate::Database::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        /// Create the file if it does not exist.
        const CREATE = 0x1;
        /// With `CREATE`, fail if the file already exists.
        const EXCLUSIVE = 0x2;
        /// Open for reading only; puts and deletes are rejected.
        const READ_ONLY = 0x4;
        /// Discard any existing content and start from an empty tree.
        const TRUNCATE = 0x8;
    }
}

bitflags! {
    /// Flags accepted by [`crate::Environment::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        /// Create the home directory if it does not exist. Its parent must.
        const CREATE = 0x1;
        /// Set up the shared buffer pool. Databases can only be opened in an
        /// environment that has one.
        const INIT_MPOOL = 0x2;
    }
}

/// Access method of a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbType {
    BTree,
    Hash,
    Recno,
    Queue,
    /// Open an existing file with whatever access method it records.
    Unknown,
}

impl DbType {
    /// Tag persisted in the meta page.
    pub fn tag(&self) -> u32 {
        match self {
            DbType::BTree => 1,
            DbType::Hash => 2,
            DbType::Recno => 3,
            DbType::Queue => 4,
            DbType::Unknown => 0,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(DbType::BTree),
            2 => Some(DbType::Hash),
            3 => Some(DbType::Recno),
            4 => Some(DbType::Queue),
            _ => None,
        }
    }
}

/// Positional moves understood by [`crate::Cursor::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorMode {
    First,
    Next,
    Prev,
    Last,
    /// Re-read the entry under the cursor.
    Current,
}
