//! One error type for both halves of the crate.  The flatten engine
//! additionally latches the first error it sees into a sticky slot (see
//! `Flattener`); the loader returns these directly.
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The dump arena or the host allocator refused an allocation.
    #[error("out of memory in the dump arena")]
    OutOfMemory,

    /// The host oracle rejected a required memory access.
    #[error("source address {addr:#x} ({size} bytes) is not readable")]
    AddressUnreadable { addr: usize, size: usize },

    /// A chunk requested an alignment above 128 or not a power of two.
    #[error("invalid chunk alignment {0}")]
    InvalidAlignment(usize),

    /// Two incompatible pointers were recorded for the same site.
    #[error("conflicting fix-up targets for source address {addr:#x}")]
    FixupConflict { addr: usize },

    /// A fix-up site did not match its prior reservation.
    #[error("fix-up at {addr:#x} does not match its reservation")]
    InvariantViolated { addr: usize },

    /// The wall-clock budget for a dump was exhausted.
    #[error("flattening exceeded the configured time budget")]
    Timeout,

    /// Arithmetic on a size field would wrap.
    #[error("size arithmetic overflow")]
    Overflow,

    /// A root name or reservation was registered twice.
    #[error("entry already exists")]
    AlreadyExists,

    #[error("image is truncated")]
    TruncatedImage,

    #[error("invalid magic in image header")]
    InvalidMagic,

    #[error("unsupported image version {0}")]
    UnsupportedVersion(u32),

    /// The section sizes declared by the header exceed the image itself.
    #[error("declared memory size exceeds image size")]
    MemorySizeBiggerThanImage,

    #[error("memory fragment does not fit in the payload")]
    MemoryFragmentDoesNotFit,

    /// A fix-up entry points at bytes outside the payload.
    #[error("fix-up location {0:#x} lies outside the payload")]
    InvalidFixLocation(usize),

    /// A pointer value decoded from the payload does not land in it.
    #[error("fix-up destination {0:#x} lies outside the payload")]
    InvalidFixDestination(usize),

    /// Could not acquire the file lock required by the open strategy.
    #[error("image file is locked by another process")]
    FileLocked,

    /// An operation is not valid in the loader's current open mode.
    #[error("operation not permitted in the current open mode")]
    UnexpectedOpenMode,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// The engine keeps the first error it sees in a sticky slot and still
// reports it from `write`; that needs a duplicate.  `io::Error` is not
// `Clone`, so the copy keeps the kind and message only.
impl Clone for Error {
    fn clone(&self) -> Error {
        use Error::*;

        match self {
            OutOfMemory => OutOfMemory,
            AddressUnreadable { addr, size } => AddressUnreadable {
                addr: *addr,
                size: *size,
            },
            InvalidAlignment(a) => InvalidAlignment(*a),
            FixupConflict { addr } => FixupConflict { addr: *addr },
            InvariantViolated { addr } => InvariantViolated { addr: *addr },
            Timeout => Timeout,
            Overflow => Overflow,
            AlreadyExists => AlreadyExists,
            TruncatedImage => TruncatedImage,
            InvalidMagic => InvalidMagic,
            UnsupportedVersion(v) => UnsupportedVersion(*v),
            MemorySizeBiggerThanImage => MemorySizeBiggerThanImage,
            MemoryFragmentDoesNotFit => MemoryFragmentDoesNotFit,
            InvalidFixLocation(o) => InvalidFixLocation(*o),
            InvalidFixDestination(o) => InvalidFixDestination(*o),
            FileLocked => FileLocked,
            UnexpectedOpenMode => UnexpectedOpenMode,
            Io(e) => Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}
