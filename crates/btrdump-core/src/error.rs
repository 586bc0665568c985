/// Error taxonomy shared by the dump and restore engines
///
/// Every variant is terminal for the run that produced it. Nothing here is
/// retried: a metadump is either complete and self-consistent or it fails.
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadumpError {
    /// Bad magic, unexpected cluster offset, or an index that cannot be valid.
    #[error("corrupt container at offset {offset}: {reason}")]
    CorruptContainer { offset: u64, reason: String },

    /// Short read/write or device error, with the operation that failed.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// An on-disk structure did not have the shape we rely on.
    #[error("unexpected on-disk format: {0}")]
    BadFormat(String),

    #[error("compression failed for item at {start}: {reason}")]
    Compression { start: u64, reason: String },

    #[error("decompression failed for item at {start}: {reason}")]
    Decompression { start: u64, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MetadumpError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        MetadumpError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        MetadumpError::CorruptContainer {
            offset,
            reason: reason.into(),
        }
    }

    pub fn is_corrupt_container(&self) -> bool {
        matches!(self, MetadumpError::CorruptContainer { .. })
    }
}

pub type Result<T, E = MetadumpError> = std::result::Result<T, E>;

/// Attach operation context to raw I/O errors.
pub trait IoContext<T> {
    fn context_io<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn context_io<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| MetadumpError::io(context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_context_message() {
        let err: io::Result<()> = Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        let err = err
            .context_io(|| format!("reading cluster at {}", 2048))
            .unwrap_err();
        assert_eq!(err.to_string(), "I/O error while reading cluster at 2048: short");
        assert!(!err.is_corrupt_container());
    }

    #[test]
    fn test_corrupt_container_message() {
        let err = MetadumpError::corrupt(1024, "bad magic");
        assert!(err.is_corrupt_container());
        assert_eq!(err.to_string(), "corrupt container at offset 1024: bad magic");
    }
}
