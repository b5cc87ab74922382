//! Flat result-code taxonomy shared by every engine operation.
//!
//! Lower layers return the first failure immediately; mid layers abort
//! eagerly without partial rollback. `Internal` is never retried — it means
//! a bug or an on-disk structure that contradicts itself, as opposed to
//! `Disk` which is a device transfer failure the caller may retry.

/// Result codes for all engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A read or write on the underlying device failed.
    Disk,
    /// Assertion failure: corrupted structure or engine bug.
    Internal,
    /// The device reported it is not ready.
    NotReady,
    /// No file matched the last path segment.
    NoFile,
    /// An intermediate path segment is missing or not a directory.
    NoPath,
    /// The path contains a name the on-disk format cannot store.
    InvalidName,
    /// Access denied: read-only object, non-empty directory, root removal,
    /// or the directory table cannot grow.
    Denied,
    /// The object already exists.
    Exist,
    /// Stale handle: the volume was remounted since the handle was opened.
    InvalidObject,
    /// The device is write-protected.
    WriteProtected,
    /// No FAT or exFAT volume could be found on the device.
    NoFilesystem,
    /// The formatter could not derive a valid geometry.
    MkfsAborted,
    /// A parameter is outside the accepted range.
    InvalidParameter,
    /// A scratch allocation failed (fixed buffers exceeded).
    NotEnoughMemory,
}

pub type Result<T> = core::result::Result<T, Error>;
