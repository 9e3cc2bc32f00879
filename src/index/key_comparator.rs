use std::cmp::Ordering;

/// Total order over keys. A file must always be opened with the comparator
/// it was built with; the order is not recorded on disk.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Short name used in logs and `Debug` output.
    fn name(&self) -> &str;
}

/// Byte-lexicographic order, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "bytewise"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_is_lexicographic() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp.compare(b"ab", b"a"), Ordering::Greater);
        assert_eq!(cmp.compare(b"\x00", b""), Ordering::Greater);
        assert_eq!(cmp.compare(b"same", b"same"), Ordering::Equal);
        assert_eq!(cmp.name(), "bytewise");
    }
}
