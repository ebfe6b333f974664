//! Error taxonomy for the block-blob store.
//!
//! The store exposes one error enumeration at its public boundary (mirroring
//! the `blobstore_error_t` of the original C library) instead of leaking the
//! various `std::io::Error`/`anyhow::Error` shapes that its internals juggle.
//! Plumbing code is free to use `anyhow` for context-rich propagation; at the
//! point where a result crosses back out to a caller it is folded into one of
//! the variants below.

use std::cell::Cell;
use std::path::PathBuf;

use thiserror::Error;

/// The single error surface for every public operation in this crate.
#[derive(Error, Debug)]
pub enum BlobstoreError {
    #[error("no such entry: {0}")]
    NoEntry(String),

    #[error("out of memory")]
    NoMemory,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("no space left (limit reached)")]
    NoSpace,

    #[error("resource temporarily unavailable (timed out or in use)")]
    Again,

    #[error("too many concurrently open descriptors for {0}")]
    TooManyOpen(PathBuf),

    #[error("bad or already-closed descriptor")]
    BadFd,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, BlobstoreError>;

impl BlobstoreError {
    /// Maps a raw OS errno the way `propagate_system_errno()` does in the
    /// original: a fixed table, with everything else falling back to a
    /// caller-supplied default.
    pub fn from_errno(errno: i32, default: BlobstoreError) -> BlobstoreError {
        match errno {
            libc::ENOENT => BlobstoreError::NoEntry(String::new()),
            libc::ENOMEM => BlobstoreError::NoMemory,
            libc::EACCES => BlobstoreError::AccessDenied(String::new()),
            libc::EEXIST => BlobstoreError::Exists(String::new()),
            libc::EINVAL => BlobstoreError::Invalid(String::new()),
            libc::ENOSPC => BlobstoreError::NoSpace,
            libc::EAGAIN => BlobstoreError::Again,
            _ => default,
        }
    }

    pub fn from_io(err: &std::io::Error, default: BlobstoreError) -> BlobstoreError {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno, default),
            None => default,
        }
    }
}

impl From<std::io::Error> for BlobstoreError {
    fn from(err: std::io::Error) -> Self {
        BlobstoreError::from_io(&err, BlobstoreError::Unknown(err.to_string()))
    }
}

impl From<anyhow::Error> for BlobstoreError {
    fn from(err: anyhow::Error) -> Self {
        BlobstoreError::Unknown(format!("{:#}", err))
    }
}

thread_local! {
    // Mirrors the original's thread-local `_blobstore_errno`: the kind of the
    // last error produced by this thread, readable until the next call.
    static LAST_ERROR_KIND: Cell<Option<&'static str>> = Cell::new(None);
}

/// Process-wide toggle for whether errors are also logged at `warn` level as
/// they are produced (the original's `_do_print_errors` / `err()` pair).
static PRINT_ERRORS: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

pub fn set_print_errors(enabled: bool) {
    PRINT_ERRORS.store(enabled, std::sync::atomic::Ordering::Relaxed);
}

pub(crate) fn note(err: &BlobstoreError) {
    LAST_ERROR_KIND.with(|slot| slot.set(Some(kind_name(err))));
    if PRINT_ERRORS.load(std::sync::atomic::Ordering::Relaxed) {
        log::warn!("blobstore error: {}", err);
    }
}

/// Returns the kind of the last error recorded on this thread by `note()`,
/// i.e. the thread-local analogue of `blobstore_get_error()`.
pub fn last_error_kind() -> Option<&'static str> {
    LAST_ERROR_KIND.with(|slot| slot.get())
}

fn kind_name(err: &BlobstoreError) -> &'static str {
    match err {
        BlobstoreError::NoEntry(_) => "NoEntry",
        BlobstoreError::NoMemory => "NoMemory",
        BlobstoreError::AccessDenied(_) => "AccessDenied",
        BlobstoreError::Exists(_) => "Exists",
        BlobstoreError::Invalid(_) => "Invalid",
        BlobstoreError::NoSpace => "NoSpace",
        BlobstoreError::Again => "Again",
        BlobstoreError::TooManyOpen(_) => "TooManyOpen",
        BlobstoreError::BadFd => "BadFd",
        BlobstoreError::SignatureMismatch => "SignatureMismatch",
        BlobstoreError::Unknown(_) => "Unknown",
    }
}
