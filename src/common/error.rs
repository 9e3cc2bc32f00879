use thiserror::Error;

/// Database error types
#[derive(Error, Debug)]
pub enum ArborError {
    /// A key, file or entry that was asked for does not exist.
    #[error("Not found")]
    NotFound,

    #[error("Already exists")]
    AlreadyExists,

    /// The on-disk structure is malformed. Terminal for the affected file.
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Buffer pool is full, no evictable frames available")]
    BufferPoolFull,
}

impl ArborError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        ArborError::Corruption(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ArborError::InvalidArgument(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        ArborError::ResourceBusy(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ArborError::NotFound)
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, ArborError::Corruption(_))
    }
}

pub type Result<T> = std::result::Result<T, ArborError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))?;
            Ok(())
        }

        let err = fails().unwrap_err();
        assert!(matches!(err, ArborError::Io(_)));
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn test_error_predicates() {
        assert!(ArborError::NotFound.is_not_found());
        assert!(ArborError::corruption("bad magic").is_corruption());
        assert!(!ArborError::busy("open").is_corruption());
    }
}
