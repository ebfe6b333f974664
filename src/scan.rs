//! Directory scan, derived in-use status, and LRU-driven space reclamation.

use std::path::PathBuf;
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::adapters::{BlockCopyAdapter, DmAdapter, LoopDeviceAdapter};
use crate::blob;
use crate::error::Result;
use crate::lock::Timeout;
use crate::metadata;
use crate::path::{self, Kind};
use crate::store::GenericBlobstore;

/// The three derived in-use bits from §3. `opened` is only meaningful when
/// produced by a probe that actually attempted the lock; callers that only
/// care about `mapped`/`backed` (e.g. `Blob::close`) read those directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InUse {
    pub opened: bool,
    pub mapped: bool,
    pub backed: bool,
}

impl InUse {
    /// `in_use & ~BACKED == 0`: no holder, nothing depends on it.
    pub fn purgeable(&self) -> bool {
        !self.opened && !self.mapped
    }
}

pub struct BlobSummary {
    pub id: String,
    pub blocks_path: PathBuf,
    pub size_blocks: u64,
    pub last_modified: SystemTime,
    pub device_path: PathBuf,
    pub in_use: InUse,
}

/// Reads `refs`/`deps` to determine `mapped`/`backed`, and optionally probes
/// the `blocks` lock for `opened`. The scanner always probes with a zero
/// timeout so a single slow holder cannot stall a full directory walk;
/// `delete` passes its own caller-supplied timeout (§10).
pub fn check_in_use<L, D, C>(store: &GenericBlobstore<L, D, C>, id: &str, open_probe_timeout: Timeout) -> Result<InUse>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let refs_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Refs);
    let deps_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Deps);
    let mapped = !metadata::read_list(&refs_path)?.is_empty();
    let backed = !metadata::read_list(&deps_path)?.is_empty();

    let blocks_path = path::sidecar_path_readonly(store.root(), store.format(), id, Kind::Blocks);
    let opened = match crate::lock::open_and_lock(&blocks_path, crate::lock::LockMode::ReadWrite, open_probe_timeout, 0) {
        Ok(handle) => {
            crate::lock::close_and_unlock(handle)?;
            false
        }
        Err(crate::error::BlobstoreError::Again) => true,
        Err(e) => return Err(e),
    };

    Ok(InUse { opened, mapped, backed })
}

/// Walks the store directory depth-first, building one summary per blob
/// whose `blocks` file is found. Ignores the descriptor file and anything
/// that does not classify as `Kind::Blocks`.
pub fn scan<L, D, C>(store: &GenericBlobstore<L, D, C>) -> Result<Vec<BlobSummary>>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    let mut summaries = Vec::new();
    for entry in WalkDir::new(store.root()).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let (id, kind) = match path::classify(store.root(), store.format(), path) {
            Some(v) => v,
            None => continue,
        };
        if kind != Kind::Blocks {
            continue;
        }

        let meta = std::fs::metadata(path)?;
        let size_blocks = meta.len() / 512;
        let last_modified = meta.modified()?;
        let in_use = check_in_use(store, &id, Timeout::NoWait)?;
        let device_path = blob::device_path_of(store, &id)?;

        summaries.push(BlobSummary { id, blocks_path: path.to_path_buf(), size_blocks, last_modified, device_path, in_use });
    }
    Ok(summaries)
}

pub struct Occupancy {
    pub free: i64,
    pub purgeable: Vec<usize>,
    pub pinned: Vec<usize>,
}

/// Partitions `summaries` into purgeable/pinned and computes free space
/// against `limit_blocks`. `free` may be negative if the store is already
/// over budget (e.g. after a policy change); callers treat that as zero
/// available headroom.
pub fn occupancy(summaries: &[BlobSummary], limit_blocks: u64) -> Occupancy {
    let mut purgeable = Vec::new();
    let mut pinned = Vec::new();
    let mut used: u64 = 0;
    for (i, s) in summaries.iter().enumerate() {
        used += s.size_blocks;
        if s.in_use.purgeable() {
            purgeable.push(i);
        } else {
            pinned.push(i);
        }
    }
    let free = limit_blocks as i64 - used as i64;
    Occupancy { free, purgeable, pinned }
}

/// Stably sorts purgeable summaries oldest-`last_modified`-first and deletes
/// them one at a time until `need_blocks` has been reclaimed or the
/// purgeable set is exhausted. Individual deletion failures are logged and
/// swallowed; only the total reclaimed matters to the caller.
pub fn purge_lru<L, D, C>(store: &GenericBlobstore<L, D, C>, summaries: &mut [BlobSummary], order: &mut [usize], need_blocks: u64) -> u64
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    order.sort_by_key(|&i| summaries[i].last_modified);

    let mut reclaimed = 0u64;
    for &i in order.iter() {
        if reclaimed >= need_blocks {
            break;
        }
        let id = summaries[i].id.clone();
        let size = summaries[i].size_blocks;
        match blob::teardown_files(store, &id) {
            Ok(_) => {
                reclaimed += size;
                log::info!("purged blob {} ({} blocks) under LRU revocation", id, size);
            }
            Err(e) => {
                log::warn!("LRU purge of blob {} failed, skipping: {}", id, e);
            }
        }
    }
    reclaimed
}
