//! Error kinds for the index core.
//!
//! Every fallible operation returns [`Result`]. I/O and mmap failures carry
//! their `std::io::Error` source; the remaining kinds are protocol-level.
//! `Lock` and `Atomic` are reserved for a future atomic-update mode and are
//! not produced by the current code.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BltError>;

#[derive(Debug, Error)]
pub enum BltError {
    /// Structural inconsistency found during descent: a free page reachable
    /// from the tree, a killed page with no redirect, or a level mismatch
    /// away from the root. Fatal for the operation.
    #[error("structural inconsistency: {0}")]
    Struct(&'static str),

    /// The target page could not be located or the key cannot fit the page
    /// format.
    #[error("page could not be located or key overflows the page format")]
    Overflow,

    #[error("lock protocol failure")]
    Lock,

    #[error("memory map failure: {0}")]
    Map(#[source] io::Error),

    #[error("page read failed: {0}")]
    Read(#[source] io::Error),

    #[error("page write failed: {0}")]
    Write(#[source] io::Error),

    #[error("atomic update failure")]
    Atomic,

    /// Invalid open parameters (page-size bits out of range is clamped, but
    /// a buffer pool below the minimum is refused).
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BltError>();
    }

    #[test]
    fn io_kinds_expose_source() {
        use std::error::Error;

        let err = BltError::Read(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("page read failed"));
    }

    #[test]
    fn struct_kind_carries_context() {
        let err = BltError::Struct("free page in tree");
        assert_eq!(
            err.to_string(),
            "structural inconsistency: free page in tree"
        );
    }
}
