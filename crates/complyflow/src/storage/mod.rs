//! Key-addressed object storage for source documents and report artifacts.

pub mod filesystem;

pub use filesystem::FsObjectStore;

use crate::error::StorageError;

/// Durable key-addressed storage.
///
/// Keys are `/`-separated relative paths such as
/// `reports/doc-1/<generation>/<report>.md`.
pub trait ObjectStore: Send + Sync {
    /// Writes `content` under `key`, replacing any previous object atomically.
    fn put(&self, key: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Reads the object under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Rejects keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason| {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    if key.is_empty() {
        return invalid("empty");
    }
    if key.starts_with('/') || key.contains('\\') {
        return invalid("must be a relative '/'-separated path");
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return invalid("contains an empty, '.' or '..' segment");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("uploads/doc-1/report.pdf").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("uploads/../secrets").is_err());
        assert!(validate_key("uploads//x").is_err());
    }
}
