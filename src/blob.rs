//! Create/open/close/delete of a single blob: loopback attachment, sidecar
//! bookkeeping, and the LRU-triggered allocation path.

use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;

use crate::adapters::{BlockCopyAdapter, DmAdapter, LoopDeviceAdapter};
use crate::error::{BlobstoreError, Result};
use crate::lock::{self, LockHandle, LockMode, Timeout};
use crate::metadata;
use crate::path::{self, Kind};
use crate::scan;
use crate::store::GenericBlobstore;

/// Creation flags, mirroring `BLOBSTORE_FLAG_CREAT`/`BLOBSTORE_FLAG_EXCL`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlobFlags {
    pub create: bool,
    pub exclusive: bool,
}

/// An open handle on a single blob. Holds the `blocks` file's lock for as
/// long as the handle is live; `close`/`delete` consume it.
pub struct Blob {
    pub id: String,
    pub size_blocks: u64,
    pub device_path: PathBuf,
    lock: LockHandle,
}

impl Blob {
    pub fn device_path(&self) -> &PathBuf {
        &self.device_path
    }

    pub fn blocks_file(&self) -> &std::fs::File {
        self.lock.file()
    }
}

/// Computes the sidecar path set for a blob id without requiring an open
/// handle, used by the scanner and by delete's cross-reference cleanup.
fn exposed_device_path<L, D, C>(store: &GenericBlobstore<L, D, C>, id: &str) -> Result<PathBuf>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let dm_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Dm);
    let dm_entries = metadata::read_list(&dm_path)?;
    if let Some(last) = dm_entries.last() {
        return Ok(PathBuf::from(format!("/dev/mapper/{}", last)));
    }
    let loopback_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Loopback);
    let loopback_entries = metadata::read_list(&loopback_path)?;
    Ok(loopback_entries.into_iter().next().map(PathBuf::from).unwrap_or_default())
}

pub fn device_path_of<L, D, C>(store: &GenericBlobstore<L, D, C>, id: &str) -> Result<PathBuf>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    exposed_device_path(store, id)
}

/// Creates a new blob or opens an existing one. See §4.6 for the full
/// procedure; this is a direct translation with the same step numbering in
/// comments.
pub fn create_or_open<L, D, C>(
    store: &GenericBlobstore<L, D, C>,
    id: Option<&str>,
    size_blocks: u64,
    flags: BlobFlags,
    sig: Option<&[u8]>,
    timeout: Timeout,
) -> Result<Blob>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    create_or_open_impl(store, id, size_blocks, flags, sig, timeout).map_err(|e| {
        crate::error::note(&e);
        e
    })
}

fn create_or_open_impl<L, D, C>(
    store: &GenericBlobstore<L, D, C>,
    id: Option<&str>,
    size_blocks: u64,
    flags: BlobFlags,
    sig: Option<&[u8]>,
    timeout: Timeout,
) -> Result<Blob>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    if !flags.create && id.is_none() {
        return Err(BlobstoreError::Invalid("id is required unless creating".into()));
    }
    if flags.create && size_blocks == 0 {
        return Err(BlobstoreError::Invalid("size_blocks must be non-zero when creating".into()));
    }
    if flags.create && store.limit_blocks() > 0 && size_blocks > store.limit_blocks() {
        return Err(BlobstoreError::NoSpace);
    }

    let id = id.map(|s| s.to_string()).unwrap_or_else(crate::id::gen_id);

    // Step 2: acquire the store lock.
    let store_lock = store.lock(timeout)?;

    let result = create_or_open_locked(store, &id, size_blocks, flags, sig, timeout);

    // Step 9: release the store lock regardless of outcome, preserving the
    // primary result.
    if let Err(unlock_err) = store.unlock(store_lock) {
        log::warn!("failed to release store lock after create_or_open({}): {}", id, unlock_err);
    }
    result
}

fn create_or_open_locked<L, D, C>(
    store: &GenericBlobstore<L, D, C>,
    id: &str,
    size_blocks: u64,
    flags: BlobFlags,
    sig: Option<&[u8]>,
    timeout: Timeout,
) -> Result<Blob>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    // Step 3: ensure intermediate directories exist (Directory format).
    let blocks_path = path::sidecar_path(store.root(), store.format(), id, Kind::Blocks)?;

    // Step 4: open `blocks`, always write-locked.
    let mode = if flags.create {
        LockMode::Create { must_not_exist: flags.exclusive }
    } else {
        LockMode::ReadWrite
    };
    let mut blob_lock = match lock::open_and_lock(&blocks_path, mode, timeout, 0o600) {
        Ok(h) => h,
        Err(e) => return Err(e),
    };

    let created_here = blob_lock.file().metadata()?.len() == 0;
    let resolved_size;

    if created_here {
        match allocate_space(store, size_blocks, timeout) {
            Ok(()) => {}
            Err(e) => {
                let _ = lock::close_and_unlock(blob_lock);
                let _ = teardown_files(store, id);
                return Err(e);
            }
        }

        if let Err(e) = blob_lock.file_mut().seek(SeekFrom::Start(size_blocks * 512 - 1)) {
            let _ = lock::close_and_unlock(blob_lock);
            let _ = teardown_files(store, id);
            return Err(e.into());
        }
        if let Err(e) = blob_lock.file_mut().write_all(&[0u8]) {
            let _ = lock::close_and_unlock(blob_lock);
            let _ = teardown_files(store, id);
            return Err(e.into());
        }

        if let Some(sig) = sig {
            let sig_path = path::sidecar_path(store.root(), store.format(), id, Kind::Sig)?;
            if let Err(e) = metadata::write_bytes(&sig_path, sig) {
                let _ = lock::close_and_unlock(blob_lock);
                let _ = teardown_files(store, id);
                return Err(e);
            }
        }
        resolved_size = size_blocks;
    } else {
        let stored_size = blob_lock.file().metadata()?.len() / 512;
        if size_blocks != 0 && size_blocks != stored_size {
            let _ = lock::close_and_unlock(blob_lock);
            return Err(BlobstoreError::Invalid("size_blocks does not match existing blob".into()));
        }
        if let Some(sig) = sig {
            let sig_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Sig);
            let stored_sig = metadata::read_bytes(&sig_path)?;
            if stored_sig != sig {
                let _ = lock::close_and_unlock(blob_lock);
                return Err(BlobstoreError::SignatureMismatch);
            }
        }
        resolved_size = stored_size;
    }

    // Step 7: ensure a loopback device is attached.
    let loopback_path = path::sidecar_path(store.root(), store.format(), id, Kind::Loopback)?;
    let existing_loopback = metadata::read_list(&loopback_path)?.into_iter().next();
    let loopback_valid = existing_loopback
        .as_ref()
        .map(|p| std::fs::metadata(p).map(|m| m.file_type().is_block_device()).unwrap_or(false))
        .unwrap_or(false);

    if !loopback_valid {
        match store.loop_adapter.attach(&blocks_path) {
            Ok(device) => {
                if let Err(e) = metadata::write_list(&loopback_path, &[device.to_string_lossy().into_owned()]) {
                    let _ = lock::close_and_unlock(blob_lock);
                    if created_here {
                        let _ = teardown_files(store, id);
                    }
                    return Err(e);
                }
            }
            Err(e) => {
                let _ = lock::close_and_unlock(blob_lock);
                if created_here {
                    let _ = teardown_files(store, id);
                }
                return Err(e);
            }
        }
    }

    // Step 8: populate device_path from `dm` (if any) else `loopback`.
    let device_path = exposed_device_path(store, id)?;

    Ok(Blob { id: id.to_string(), size_blocks: resolved_size, device_path, lock: blob_lock })
}

/// Runs the scanner, computes free space, and invokes LRU revocation if the
/// policy permits and there is purgeable material. Fails `NoSpace` if the
/// request still cannot be satisfied.
fn allocate_space<L, D, C>(store: &GenericBlobstore<L, D, C>, need_blocks: u64, _timeout: Timeout) -> Result<()>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let mut summaries = scan::scan(store)?;
    let occ = scan::occupancy(&summaries, store.limit_blocks());
    if occ.free >= need_blocks as i64 {
        return Ok(());
    }

    if store.revocation_policy() != metadata::RevocationPolicy::Lru || occ.purgeable.is_empty() {
        return Err(BlobstoreError::NoSpace);
    }

    let shortfall = (need_blocks as i64 - occ.free).max(0) as u64;
    let mut order = occ.purgeable.clone();
    let reclaimed = scan::purge_lru(store, &mut summaries, &mut order, shortfall);

    if occ.free + reclaimed as i64 >= need_blocks as i64 {
        Ok(())
    } else {
        Err(BlobstoreError::NoSpace)
    }
}

/// Closes a blob handle: if nothing maps or depends on it, detaches the
/// loopback device (best-effort) and unlinks the sidecar; always releases
/// the OS lock on `blocks`.
pub fn close<L, D, C>(store: &GenericBlobstore<L, D, C>, blob: Blob) -> Result<()>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let refs_path = path::sidecar_path_readonly(store.root(), store.format(), &blob.id, Kind::Refs);
    let deps_path = path::sidecar_path_readonly(store.root(), store.format(), &blob.id, Kind::Deps);
    let mapped = !metadata::read_list(&refs_path)?.is_empty();
    let backed = !metadata::read_list(&deps_path)?.is_empty();

    if !mapped && !backed {
        detach_loopback_best_effort(store, &blob.id);
    }

    lock::close_and_unlock(blob.lock)
}

fn detach_loopback_best_effort<L, D, C>(store: &GenericBlobstore<L, D, C>, id: &str)
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let loopback_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Loopback);
    if let Ok(entries) = metadata::read_list(&loopback_path) {
        if let Some(device) = entries.first() {
            if let Err(e) = store.loop_adapter.detach(&PathBuf::from(device)) {
                log::warn!("best-effort loopback detach of {} for blob {} failed: {}", device, id, e);
            }
        }
    }
    let _ = std::fs::remove_file(&loopback_path);
}

/// Deletes a blob: tears down its dm devices, cleans up the bidirectional
/// `deps`/`refs` graph, detaches its loopback, and unlinks every sidecar.
pub fn delete<L, D, C>(store: &GenericBlobstore<L, D, C>, blob: Blob, timeout: Timeout) -> Result<()>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    delete_impl(store, blob, timeout).map_err(|e| {
        crate::error::note(&e);
        e
    })
}

fn delete_impl<L, D, C>(store: &GenericBlobstore<L, D, C>, blob: Blob, timeout: Timeout) -> Result<()>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let store_lock = store.lock(timeout)?;
    let id = blob.id.clone();

    let refs_path = path::sidecar_path_readonly(store.root(), store.format(), &id, Kind::Refs);
    let mapped = !metadata::read_list(&refs_path)?.is_empty();
    if mapped {
        let _ = lock::close_and_unlock(blob.lock);
        let _ = store.unlock(store_lock);
        return Err(BlobstoreError::Again);
    }

    // The blob's own OS lock must go before its sidecar files are unlinked
    // (closing any descriptor to `blocks` releases the process's fcntl
    // lock on it regardless, but we want a clean, observable release point).
    if let Err(e) = lock::close_and_unlock(blob.lock) {
        let _ = store.unlock(store_lock);
        return Err(e);
    }

    let result = teardown_files(store, &id);
    if let Err(e) = store.unlock(store_lock) {
        log::warn!("failed to release store lock after delete({}): {}", id, e);
    }
    result
}

/// Tears down dm devices, cleans up cross-references, detaches the
/// loopback, and unlinks every sidecar for `id`. Used both by `delete`
/// (which has already verified the blob is idle and released its own OS
/// lock) and by LRU revocation (acting on blobs already known `purgeable`,
/// so no OS lock is held and none needs to be acquired here).
pub fn teardown_files<L, D, C>(store: &GenericBlobstore<L, D, C>, id: &str) -> Result<u64>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let blocks_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Blocks);
    let size_blocks = std::fs::metadata(&blocks_path).map(|m| m.len() / 512).unwrap_or(0);

    // Step 3: remove dm devices, reverse creation order, duplicates collapsed.
    let dm_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Dm);
    let dm_entries = metadata::read_list(&dm_path)?;
    let mut removed = std::collections::HashSet::new();
    for name in dm_entries.iter().rev() {
        if removed.insert(name.clone()) {
            if let Err(e) = store.dm_adapter.remove(name) {
                log::warn!("failed to remove dm device {} for blob {}: {}", name, id, e);
            }
        }
    }

    // Step 4: clean up this blob's entry in each dependency's `refs`.
    let deps_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Deps);
    let deps = metadata::read_list(&deps_path)?;
    for line in &deps {
        if let Err(e) = cleanup_dependency_ref(store, id, line) {
            log::warn!("reference cleanup for blob {} dependency '{}' failed: {}", id, line, e);
        }
    }

    // Step 5: detach this blob's loopback, unlink every sidecar.
    detach_loopback_best_effort(store, id);

    let mut unlinked_any = false;
    for kind in Kind::ALL {
        let p = path::sidecar_path_readonly(store.root(), store.format(), id, kind);
        match std::fs::remove_file(&p) {
            Ok(()) => unlinked_any = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to unlink {:?} for blob {}: {}", p, id, e),
        }
    }

    if store.format() == path::Format::Directory {
        let dir = store.root().join(id);
        let _ = remove_empty_ancestors(&dir, store.root());
    }

    if !unlinked_any {
        return Err(BlobstoreError::NoEntry(id.to_string()));
    }

    Ok(size_blocks)
}

fn remove_empty_ancestors(start: &std::path::Path, stop_at: &std::path::Path) -> std::io::Result<()> {
    let mut dir = start.to_path_buf();
    while dir != stop_at && dir.starts_with(stop_at) {
        match std::fs::remove_dir(&dir) {
            Ok(()) => {}
            Err(_) => break,
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => break,
        }
    }
    Ok(())
}

/// Removes `"<this store> <id>"` from the referenced dependency's `refs`
/// sidecar, opening the dependency's store if it differs from this one.
/// Best-effort: if the dependency is now fully idle, its loopback is also
/// detached.
fn cleanup_dependency_ref<L, D, C>(store: &GenericBlobstore<L, D, C>, id: &str, dep_line: &str) -> Result<()>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let (dep_store_path, dep_id) = dep_line
        .split_once(' ')
        .ok_or_else(|| BlobstoreError::Invalid(format!("malformed deps entry: {}", dep_line)))?;

    let self_entry = format!("{} {}", store.root().display(), id);

    if std::path::Path::new(dep_store_path) == store.root() {
        let dep_refs_path = path::sidecar_path_readonly(store.root(), store.format(), dep_id, Kind::Refs);
        metadata::update_entry(&dep_refs_path, &self_entry, true)?;
        let dep_deps_path = path::sidecar_path_readonly(store.root(), store.format(), dep_id, Kind::Deps);
        let still_backed = !metadata::read_list(&dep_deps_path)?.is_empty();
        let still_mapped = !metadata::read_list(&dep_refs_path)?.is_empty();
        if !still_backed && !still_mapped {
            detach_loopback_best_effort(store, dep_id);
        }
        Ok(())
    } else {
        // The dependency lives in a different store directory. Reopening it
        // always goes through the real system adapters, matching the
        // original's plain `blobstore_open(store_path, 0, ANY, ANY, ANY)`.
        use crate::adapters::{SystemCopy, SystemDm, SystemLoop};
        use crate::store::GenericBlobstore as Store;
        let dep_store = Store::open(
            dep_store_path,
            metadata::OpenParams::default(),
            SystemLoop,
            SystemDm,
            SystemCopy,
        )?;
        let dep_refs_path = path::sidecar_path_readonly(dep_store.root(), dep_store.format(), dep_id, Kind::Refs);
        metadata::update_entry(&dep_refs_path, &self_entry, true)?;
        let dep_deps_path = path::sidecar_path_readonly(dep_store.root(), dep_store.format(), dep_id, Kind::Deps);
        let still_backed = !metadata::read_list(&dep_deps_path)?.is_empty();
        let still_mapped = !metadata::read_list(&dep_refs_path)?.is_empty();
        if !still_backed && !still_mapped {
            detach_loopback_best_effort(&dep_store, dep_id);
        }
        dep_store.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeCopy, FakeDm, FakeLoop};
    use crate::metadata::OpenParams;
    use crate::path::Format;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path, limit: u64) -> GenericBlobstore<FakeLoop, FakeDm, FakeCopy> {
        GenericBlobstore::open(
            dir,
            OpenParams { limit_blocks: Some(limit), format: Some(Format::Files), revocation_policy: Some(metadata::RevocationPolicy::None), ..Default::default() },
            FakeLoop::default(),
            FakeDm::default(),
            FakeCopy,
        )
        .unwrap()
    }

    #[test]
    fn create_then_reopen_with_matching_sig() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), 30);
        let b = create_or_open(&bs, Some("b1"), 10, BlobFlags { create: true, exclusive: false }, Some(b"sig"), Timeout::Forever).unwrap();
        assert_eq!(b.size_blocks, 10);
        close(&bs, b).unwrap();

        let b2 = create_or_open(&bs, Some("b1"), 0, BlobFlags::default(), Some(b"sig"), Timeout::Forever).unwrap();
        assert_eq!(b2.size_blocks, 10);
        close(&bs, b2).unwrap();
    }

    #[test]
    fn sig_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), 30);
        let b = create_or_open(&bs, Some("b1"), 10, BlobFlags { create: true, exclusive: false }, Some(b"B1"), Timeout::Forever).unwrap();
        close(&bs, b).unwrap();

        let err = create_or_open(&bs, Some("b1"), 0, BlobFlags::default(), Some(b"foo"), Timeout::Forever).unwrap_err();
        assert!(matches!(err, BlobstoreError::SignatureMismatch));
    }

    #[test]
    fn create_with_zero_size_is_invalid() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), 30);
        let err = create_or_open(&bs, Some("b1"), 0, BlobFlags { create: true, exclusive: false }, None, Timeout::Forever).unwrap_err();
        assert!(matches!(err, BlobstoreError::Invalid(_)));
    }

    #[test]
    fn create_over_limit_fails_nospace() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), 30);
        let err = create_or_open(&bs, Some("big"), 40, BlobFlags { create: true, exclusive: false }, None, Timeout::Forever).unwrap_err();
        assert!(matches!(err, BlobstoreError::NoSpace));
    }

    #[test]
    fn delete_removes_all_sidecars() {
        let dir = tempdir().unwrap();
        let bs = open(dir.path(), 30);
        let b = create_or_open(&bs, Some("b1"), 10, BlobFlags { create: true, exclusive: false }, None, Timeout::Forever).unwrap();
        delete(&bs, b, Timeout::Forever).unwrap();

        for kind in Kind::ALL {
            let p = path::sidecar_path_readonly(bs.root(), bs.format(), "b1", kind);
            assert!(!p.exists(), "{:?} should have been removed", p);
        }
    }

    #[test]
    fn lru_eviction_makes_room_for_new_blob() {
        let dir = tempdir().unwrap();
        let bs = GenericBlobstore::open(
            dir.path(),
            OpenParams {
                limit_blocks: Some(30),
                format: Some(Format::Files),
                revocation_policy: Some(metadata::RevocationPolicy::Lru),
                ..Default::default()
            },
            FakeLoop::default(),
            FakeDm::default(),
            FakeCopy,
        )
        .unwrap();

        let b2 = create_or_open(&bs, Some("b2"), 10, BlobFlags { create: true, exclusive: false }, None, Timeout::Forever).unwrap();
        close(&bs, b2).unwrap();
        let b3 = create_or_open(&bs, Some("b3"), 10, BlobFlags { create: true, exclusive: false }, None, Timeout::Forever).unwrap();
        close(&bs, b3).unwrap();
        let b1 = create_or_open(&bs, Some("b1"), 10, BlobFlags { create: true, exclusive: false }, None, Timeout::Forever).unwrap();

        // Store is now full (b1 open, b2/b3 closed-but-present); a further
        // create must evict one of the purgeable blobs.
        let b4 = create_or_open(&bs, Some("b4"), 10, BlobFlags { create: true, exclusive: false }, None, Timeout::Forever).unwrap();
        close(&bs, b4).unwrap();
        close(&bs, b1).unwrap();
    }
}
