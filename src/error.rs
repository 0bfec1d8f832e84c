//! Error types for the differencing engine and its ambient codec layer.
//!
//! Three severities are distinguished, matching the failure model the engine
//! is specified against: [`Error::Internal`] for invariant violations that
//! should never happen given well-formed input, [`Error::DiffFatal`] for
//! input-level disagreements between base and patched that make a diff
//! impossible, and advisories, which are not errors at all and go through
//! [`crate::logger::Logger`] instead of `Result`.

use core::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Unexpected invariant violation: malformed or internally inconsistent
    /// state that the engine should never produce on its own.
    Internal(String),
    /// Recoverable-at-the-source-level input mismatch between base and
    /// patched, or an unsupported kind of change.
    DiffFatal(String),
    /// I/O failure reading or writing an object file.
    Io(io::Error),
    /// Malformed bytes encountered while decoding an ELF structure.
    Scroll(scroll::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::DiffFatal(msg) => write!(f, "{}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Scroll(err) => write!(f, "malformed object: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Scroll(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Self {
        Error::Scroll(err)
    }
}

/// Shorthand for an internal-invariant error, mirroring the original
/// `ERROR(...)` macro's call sites.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Internal(format!($($arg)*)))
    };
}

/// Shorthand for a `DIFF_FATAL` error.
#[macro_export]
macro_rules! diff_fatal {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::DiffFatal(format!($($arg)*)))
    };
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes for the three terminal outcomes the CLI can report,
/// plus the "no changes" early return.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const INTERNAL_ERROR: i32 = 1;
    pub const DIFF_FATAL: i32 = 2;
    pub const NO_CHANGES: i32 = 3;
}
