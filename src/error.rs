use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested key does not exist.
    NotFound,
    /// Invalid on-disk data: decoding failures, checksum mismatches, bad
    /// magic numbers, truncated records.
    Corruption(String),
    /// The operation is not supported by this build or format version.
    NotSupported(String),
    /// Invalid caller input, typically an argument that violates an
    /// ordering or size constraint.
    InvalidArgument(String),
    /// An IO error.
    Io(String),
    /// A memory budget was exceeded.
    MemoryLimit(String),
    /// A write was attempted on a read-only structure (frozen memtable,
    /// finished SSTable, closed WAL segment).
    ReadOnly,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::MemoryLimit(msg) => write!(f, "memory limit: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! invalid_argument {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
