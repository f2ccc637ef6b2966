//! Error taxonomy shared by every fallible operation in the crate.
//!
//! Errors fall into seven kinds:
//! - [`ZipError::Io`]          — an OS call failed; wraps the `io::Error` with context
//! - [`ZipError::Format`]      — the archive violates a ZIP/ZIP64 invariant
//! - [`ZipError::Codec`]       — zlib/liblzma initialisation or stepping failed
//! - [`ZipError::Integrity`]   — CRC-32 mismatch while unpacking
//! - [`ZipError::Unsupported`] — valid input the engine deliberately refuses
//! - [`ZipError::Misuse`]      — API called out of order (reserve after start,
//!   push after shutdown, create twice)
//! - [`ZipError::Stopped`]     — the task was cancelled via `TaskControl::stop`
//!
//! Inside one entry's pack/unpack the orchestrators convert any of these to a
//! "FAIL: …" log line and move on; only constructors propagate errors to the
//! caller.

use std::fmt;
use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ZipError>;

/// All failure modes of the pack and unpack engines.
#[derive(Debug)]
pub enum ZipError {
    /// An operating-system call failed.
    Io {
        /// What the engine was doing when the call failed.
        context: String,
        source: io::Error,
    },
    /// The archive does not satisfy a ZIP/ZIP64 structural invariant.
    Format(String),
    /// A compression codec could not be initialised or stepped.
    Codec(String),
    /// Decompressed data did not match the stored CRC-32.
    Integrity {
        name: String,
        expected: u32,
        actual: u32,
    },
    /// Well-formed input that this engine refuses to process.
    Unsupported(String),
    /// An API contract was violated by the caller.
    Misuse(String),
    /// The operation was cancelled.
    Stopped,
}

impl ZipError {
    /// Wrap an `io::Error` with a short description of the failed action.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ZipError::Io {
            context: context.into(),
            source,
        }
    }

    /// Shorthand for a [`ZipError::Format`] with a formatted message.
    pub fn format(msg: impl Into<String>) -> Self {
        ZipError::Format(msg.into())
    }
}

impl fmt::Display for ZipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZipError::Io { context, source } => write!(f, "{context}: {source}"),
            ZipError::Format(msg) => write!(f, "invalid archive: {msg}"),
            ZipError::Codec(msg) => write!(f, "codec error: {msg}"),
            ZipError::Integrity {
                name,
                expected,
                actual,
            } => write!(
                f,
                "CRC-32 mismatch in {name}: stored {expected:#010x}, computed {actual:#010x}"
            ),
            ZipError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            ZipError::Misuse(msg) => write!(f, "api misuse: {msg}"),
            ZipError::Stopped => write!(f, "stopped by request"),
        }
    }
}

impl std::error::Error for ZipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ZipError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ZipError {
    fn from(e: io::Error) -> Self {
        ZipError::Io {
            context: "I/O error".to_string(),
            source: e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = ZipError::io(
            "could not open input file",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        let msg = e.to_string();
        assert!(msg.contains("could not open input file"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn integrity_formats_both_checksums() {
        let e = ZipError::Integrity {
            name: "a.txt".into(),
            expected: 0xDEADBEEF,
            actual: 0x12345678,
        };
        let msg = e.to_string();
        assert!(msg.contains("0xdeadbeef"));
        assert!(msg.contains("0x12345678"));
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(ZipError::Io { .. })));
    }
}
