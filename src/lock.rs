//! Process-global registry of combined intra-process / inter-process file
//! locks.
//!
//! This is the Rust analogue of `open_and_lock()`/`close_and_unlock()` from
//! the original C library. The two layers it stacks are:
//!
//! - an **intra-process** reader/writer lock, so two threads in the same
//!   process that open the same path see the same contention a separate
//!   process would, even though POSIX advisory (`fcntl`) locks are a no-op
//!   between threads of one process;
//! - an **inter-process** advisory lock taken with `fcntl(F_SETLK)` on the
//!   whole file, which is what actually keeps two different processes out of
//!   each other's way.
//!
//! The subtle invariant this module exists to protect: a `fcntl` record lock
//! is associated with the *(process, inode)* pair, not with a particular file
//! descriptor. Closing *any* descriptor your process holds on a file drops
//! *all* record locks your process holds on it, even if other descriptors to
//! that same file remain open. So descriptors handed out by this registry are
//! never closed individually as their holder releases them -- they are
//! retired into a holding pen and only actually closed, all at once, when the
//! last holder for that path releases it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{BlobstoreError, Result};

/// Maximum number of concurrently live acquisitions of one path.
pub const MAX_CONCURRENT: usize = 99;
/// Poll interval while waiting on a contended lock.
pub const SLEEP_INTERVAL: Duration = Duration::from_millis(99);

/// How a path is being opened and what kind of lock that implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// `O_RDONLY`, shared (reader) lock.
    ReadOnly,
    /// `O_RDWR`, exclusive (writer) lock. File must already exist.
    ReadWrite,
    /// `O_RDWR | O_CREAT`, exclusive (writer) lock. `must_not_exist` adds
    /// `O_EXCL`.
    Create { must_not_exist: bool },
}

impl LockMode {
    fn is_exclusive(self) -> bool {
        !matches!(self, LockMode::ReadOnly)
    }
}

/// Deadline for lock acquisition.
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    Forever,
    NoWait,
    Micros(u64),
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Forever => None,
            Timeout::NoWait => Some(Instant::now()),
            Timeout::Micros(us) => Some(Instant::now() + Duration::from_micros(us)),
        }
    }
}

/// A simple, explicitly acquire/release reader-writer lock.
///
/// `std::sync::RwLock`'s guards are scoped (RAII) to the call that acquired
/// them, but here acquisition happens in `open_and_lock` and release happens
/// later, from an entirely different call (`close_and_unlock`) possibly on a
/// different stack -- there is no lexical scope to tie a guard to. A small
/// hand-rolled primitive with explicit `try_acquire`/`release` models that
/// directly, mirroring how the original uses `pthread_rwlock_trywrlock` /
/// `pthread_rwlock_tryrdlock` followed by an unlock call much later.
struct IntraLock {
    state: Mutex<IntraState>,
}

struct IntraState {
    writer: bool,
    readers: u32,
}

impl IntraLock {
    fn new() -> Self {
        IntraLock {
            state: Mutex::new(IntraState { writer: false, readers: 0 }),
        }
    }

    fn try_acquire(&self, exclusive: bool) -> bool {
        let mut st = self.state.lock().unwrap();
        if exclusive {
            if st.writer || st.readers > 0 {
                false
            } else {
                st.writer = true;
                true
            }
        } else if st.writer {
            false
        } else {
            st.readers += 1;
            true
        }
    }

    fn release(&self, exclusive: bool) {
        let mut st = self.state.lock().unwrap();
        if exclusive {
            st.writer = false;
        } else {
            st.readers = st.readers.saturating_sub(1);
        }
    }
}

struct LockEntry {
    kind_exclusive: bool,
    intra: IntraLock,
    bookkeeping: Mutex<Bookkeeping>,
}

struct Bookkeeping {
    /// Number of currently live acquisitions for this path.
    open_count: usize,
    /// Descriptors whose holder has released them but which cannot be
    /// `close()`d yet because other holders for the same path remain live.
    retired: Vec<File>,
}

static REGISTRY: once_cell::sync::Lazy<Mutex<HashMap<PathBuf, Arc<LockEntry>>>> =
    once_cell::sync::Lazy::new(|| Mutex::new(HashMap::new()));

/// A lock held on a path, returned by `open_and_lock`.
///
/// Dropping this without calling `close_and_unlock` still releases the lock
/// correctly (the `Drop` impl performs the same teardown) -- `close_and_unlock`
/// exists mainly so call sites can observe and propagate a release error, and
/// so the point of release is explicit in code that mirrors the original's
/// `open_and_lock`/`close_and_unlock` pairing.
pub struct LockHandle {
    path: PathBuf,
    exclusive: bool,
    file: Option<File>,
    entry: Arc<LockEntry>,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        self.file.as_ref().expect("file present on a live LockHandle")
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("file present on a live LockHandle")
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            release_held(&self.path, &self.entry, file, self.exclusive);
        }
    }
}

/// Explicitly releases a lock, the named counterpart to `open_and_lock`.
/// Equivalent to `drop(handle)` -- provided so call sites that mirror the
/// original's `open_and_lock`/`close_and_unlock` pairing can spell the
/// release step out and observe its result. Since `LockHandle` is consumed
/// by value, there is no way to pass the same handle twice: the double-close
/// bug class the original guards against with a `BadFd` error is ruled out
/// structurally rather than detected at runtime.
pub fn close_and_unlock(mut handle: LockHandle) -> Result<()> {
    let file = handle.file.take().ok_or(BlobstoreError::BadFd)?;
    release_held(&handle.path, &handle.entry, file, handle.exclusive);
    Ok(())
}

/// Opens (and, for `Create`, possibly creates) `path` and acquires both the
/// intra-process and the inter-process lock implied by `mode`, waiting up to
/// `timeout`.
pub fn open_and_lock(path: &Path, mode: LockMode, timeout: Timeout, file_mode: u32) -> Result<LockHandle> {
    open_and_lock_impl(path, mode, timeout, file_mode).map_err(|e| {
        crate::error::note(&e);
        e
    })
}

fn open_and_lock_impl(path: &Path, mode: LockMode, timeout: Timeout, file_mode: u32) -> Result<LockHandle> {
    let exclusive = mode.is_exclusive();
    let deadline = timeout.deadline();

    let entry = {
        let mut reg = REGISTRY.lock().unwrap();
        let entry = reg
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                Arc::new(LockEntry {
                    kind_exclusive: exclusive,
                    intra: IntraLock::new(),
                    bookkeeping: Mutex::new(Bookkeeping { open_count: 0, retired: Vec::new() }),
                })
            })
            .clone();
        if entry.kind_exclusive != exclusive {
            return Err(BlobstoreError::Invalid(format!(
                "lock kind mismatch with existing lock on {}",
                path.display()
            )));
        }
        {
            let mut bk = entry.bookkeeping.lock().unwrap();
            if bk.open_count >= MAX_CONCURRENT {
                return Err(BlobstoreError::TooManyOpen(path.to_path_buf()));
            }
            bk.open_count += 1;
        }
        entry
    };

    match acquire(path, mode, file_mode, &entry, exclusive, deadline) {
        Ok(file) => Ok(LockHandle { path: path.to_path_buf(), exclusive, file: Some(file), entry }),
        Err(e) => {
            // Undo the `open_count` reservation made above; no file was ever
            // produced, so no intra-lock acquisition is outstanding here --
            // every `acquire()` error path has already released its own, if
            // any (see `acquire`'s `WouldBlock`/`Failed` handling below).
            release_reservation(path, &entry);
            Err(e)
        }
    }
}

fn acquire(
    path: &Path,
    mode: LockMode,
    file_mode: u32,
    entry: &Arc<LockEntry>,
    exclusive: bool,
    deadline: Option<Instant>,
) -> Result<File> {
    let file = open_with_mode(path, mode, file_mode)?;

    let mut intra_acquired = false;
    loop {
        if !intra_acquired {
            intra_acquired = entry.intra.try_acquire(exclusive);
        }
        if intra_acquired {
            match try_os_lock(&file, exclusive) {
                LockAttempt::Acquired => return Ok(file),
                LockAttempt::WouldBlock => {}
                LockAttempt::Failed(e) => {
                    entry.intra.release(exclusive);
                    return Err(e);
                }
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                if intra_acquired {
                    entry.intra.release(exclusive);
                }
                return Err(BlobstoreError::Again);
            }
        }
        std::thread::sleep(SLEEP_INTERVAL);
    }
}

fn open_with_mode(path: &Path, mode: LockMode, file_mode: u32) -> std::io::Result<File> {
    let mut opts = OpenOptions::new();
    match mode {
        LockMode::ReadOnly => {
            opts.read(true);
        }
        LockMode::ReadWrite => {
            opts.read(true).write(true);
        }
        LockMode::Create { must_not_exist: true } => {
            opts.read(true).write(true).create_new(true);
        }
        LockMode::Create { must_not_exist: false } => {
            opts.read(true).write(true).create(true);
        }
    }
    opts.mode(file_mode);
    opts.open(path)
}

enum LockAttempt {
    Acquired,
    WouldBlock,
    Failed(BlobstoreError),
}

fn try_os_lock(file: &File, exclusive: bool) -> LockAttempt {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = if exclusive { libc::F_WRLCK as _ } else { libc::F_RDLCK as _ };
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = 0;
    fl.l_len = 0;

    match nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&fl)) {
        Ok(_) => LockAttempt::Acquired,
        Err(nix::Error::Sys(errno))
            if errno == nix::errno::Errno::EAGAIN || errno == nix::errno::Errno::EACCES =>
        {
            LockAttempt::WouldBlock
        }
        Err(e) => LockAttempt::Failed(BlobstoreError::Unknown(format!("fcntl(F_SETLK) failed: {}", e))),
    }
}

/// Releases a lock actually held -- both the intra-process lock and (by
/// retiring `file`) the OS advisory lock -- called from `close_and_unlock`
/// and `LockHandle::drop`.
fn release_held(path: &Path, entry: &Arc<LockEntry>, file: File, exclusive: bool) {
    entry.intra.release(exclusive);
    finish_release(path, entry, Some(file));
}

/// Undoes the `open_count` reservation `open_and_lock_impl` makes before
/// attempting acquisition, for the case where acquisition never succeeded.
/// Must NOT touch `entry.intra`: every `acquire()` error path has already
/// released its own intra-lock acquisition if it held one, so doing it again
/// here would drop a live holder's reader/writer count.
fn release_reservation(path: &Path, entry: &Arc<LockEntry>) {
    finish_release(path, entry, None);
}

/// Common bookkeeping tail shared by both release paths above: retires
/// `file` (if any) into the holding pen, decrements `open_count`, and once it
/// reaches zero, unlinks the entry from the registry and drops it -- which
/// closes every retired descriptor in one batch, the point at which the OS
/// advisory lock is actually released.
fn finish_release(path: &Path, entry: &Arc<LockEntry>, file: Option<File>) {
    let now_empty = {
        let mut bk = entry.bookkeeping.lock().unwrap();
        if let Some(file) = file {
            bk.retired.push(file);
        }
        bk.open_count = bk.open_count.saturating_sub(1);
        bk.open_count == 0
    };

    if now_empty {
        let mut reg = REGISTRY.lock().unwrap();
        // Only remove the entry we actually released; a newer entry may
        // already have replaced it if it was recreated in between.
        if let Some(current) = reg.get(path) {
            if Arc::ptr_eq(current, entry) {
                reg.remove(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tmp_path(name: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("blobstore-lock-test-{}-{}-{}", std::process::id(), n, name))
    }

    #[test]
    fn shared_readers_coexist() {
        let path = tmp_path("shared");
        let _ = std::fs::remove_file(&path);
        let h1 = open_and_lock(&path, LockMode::Create { must_not_exist: false }, Timeout::Forever, 0o600).unwrap();
        drop(h1);
        let h2 = open_and_lock(&path, LockMode::ReadOnly, Timeout::Forever, 0).unwrap();
        let h3 = open_and_lock(&path, LockMode::ReadOnly, Timeout::Forever, 0).unwrap();
        drop(h2);
        drop(h3);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn exclusive_excludes_further_opens_within_timeout() {
        let path = tmp_path("excl");
        let _ = std::fs::remove_file(&path);
        let _writer = open_and_lock(&path, LockMode::Create { must_not_exist: false }, Timeout::Forever, 0o600).unwrap();
        let err = open_and_lock(&path, LockMode::ReadWrite, Timeout::NoWait, 0).unwrap_err();
        assert!(matches!(err, BlobstoreError::Again));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let path = tmp_path("mismatch");
        let _ = std::fs::remove_file(&path);
        let _reader = open_and_lock(&path, LockMode::Create { must_not_exist: false }, Timeout::Forever, 0o600).unwrap();
        drop(_reader);
        let _h = open_and_lock(&path, LockMode::ReadOnly, Timeout::Forever, 0).unwrap();
        let err = open_and_lock(&path, LockMode::ReadWrite, Timeout::NoWait, 0).unwrap_err();
        assert!(matches!(err, BlobstoreError::Again) || matches!(err, BlobstoreError::Invalid(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn capacity_is_enforced_and_recovers_on_release() {
        let path = tmp_path("capacity");
        let _ = std::fs::remove_file(&path);
        let _seed = open_and_lock(&path, LockMode::Create { must_not_exist: false }, Timeout::Forever, 0o600).unwrap();
        drop(_seed);

        let mut handles = Vec::new();
        for _ in 0..MAX_CONCURRENT {
            handles.push(open_and_lock(&path, LockMode::ReadOnly, Timeout::Forever, 0).unwrap());
        }
        let err = open_and_lock(&path, LockMode::ReadOnly, Timeout::NoWait, 0).unwrap_err();
        assert!(matches!(err, BlobstoreError::TooManyOpen(_)));

        handles.pop();
        let _reopened = open_and_lock(&path, LockMode::ReadOnly, Timeout::NoWait, 0).unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
