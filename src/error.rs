use std::fmt;
use std::io;

/// Custom error type for epochdb operations
#[derive(Debug)]
pub enum Error {
    /// I/O error from underlying file operations
    Io(io::Error),
    /// On-disk data failed validation (bad magic, CRC mismatch, short record)
    Corrupted(String),
    /// The storage directory is locked by another process
    Locked(String),
    /// Rejected configuration value
    Config(&'static str),
    /// Error when key exceeds the 65 535 byte limit
    KeyTooLarge(usize),
    /// Error when value exceeds the 4 GiB limit
    ValueTooLarge(usize),
    /// Mutation or transaction control attempted with an open cursor
    OpenCursor(&'static str),
    /// `commit` or `rollback` outside a multi-statement transaction
    NoTransaction(&'static str),
    /// `begin` while a multi-statement transaction is already open
    TransactionActive,
    /// Write attempted on a read-only database
    ReadOnly,
    /// Forced merge while the background merger thread is configured
    MergerActive,
    /// The engine hit an unrecoverable failure and rejects further calls
    Fatal,
    /// Other database errors
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Corrupted(msg) => write!(f, "database corrupted: {msg}"),
            Error::Locked(msg) => write!(f, "database directory is locked: {msg}"),
            Error::Config(msg) => write!(f, "{msg}"),
            Error::KeyTooLarge(size) => write!(f, "key size limit reached: {size} bytes"),
            Error::ValueTooLarge(size) => write!(f, "value size limit reached: {size} bytes"),
            Error::OpenCursor(op) => write!(f, "{op} with open cursor"),
            Error::NoTransaction(op) => write!(f, "no active transaction to {op}"),
            Error::TransactionActive => write!(f, "transaction already in progress"),
            Error::ReadOnly => write!(f, "database is read-only"),
            Error::MergerActive => {
                write!(f, "force merge doesn't work with merger thread active")
            }
            Error::Fatal => write!(f, "database is in a fatal error state"),
            Error::Other(msg) => write!(f, "database error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Result type for epochdb operations
pub type Result<T> = std::result::Result<T, Error>;
