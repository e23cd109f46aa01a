//! Error types for quemar-core.

use thiserror::Error;

use crate::queue::PageKind;

/// Errors that can occur while setting up or driving a burn-in run.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected before any worker started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Test arena could not be allocated by any strategy.
    #[error("memory allocation failed: {0}")]
    Allocation(String),

    /// A page queue search exhausted every slot without a match.
    #[error("no {0:?} page available in the queue")]
    NoPageAvailable(PageKind),

    /// A page queue invariant was broken. Fatal to the run.
    #[error("page queue corrupt: {0}")]
    QueueCorrupt(String),

    /// Checksum input exceeds the supported length.
    #[error("checksum input too large: {words} words (limit 2^19)")]
    ChecksumLength {
        /// Number of 64-bit words in the rejected input.
        words: usize,
    },

    /// An OS interface call failed (pagemap, msr, sysfs).
    #[error("{op} failed: {source}")]
    Os {
        /// The operation that failed.
        op: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A probe cannot run on this machine (missing CPU capability).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Internal invariant breach (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn os(op: &'static str, source: std::io::Error) -> Self {
        Self::Os { op, source }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("page size must be a power of two".to_string());
        assert!(err.to_string().contains("invalid configuration"));
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_error_display_checksum_length() {
        let err = Error::ChecksumLength { words: 1 << 20 };
        let msg = err.to_string();
        assert!(msg.contains("1048576"));
        assert!(msg.contains("2^19"));
    }

    #[test]
    fn test_error_display_no_page() {
        let err = Error::NoPageAvailable(PageKind::Empty);
        assert!(err.to_string().contains("Empty"));
    }

    #[test]
    fn test_error_implements_std_error() {
        fn assert_std_error<T: std::error::Error>() {}
        assert_std_error::<Error>();
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }

    #[test]
    fn test_os_error_carries_source() {
        let err = Error::os("pagemap read", std::io::Error::from_raw_os_error(13));
        assert!(err.to_string().contains("pagemap read"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
