//! Opens or creates a store directory, validates configuration against an
//! existing descriptor, and issues the store-wide lock that serializes
//! scanning, LRU revocation, and allocation.

use std::path::{Path, PathBuf};

use crate::adapters::{BlockCopyAdapter, DmAdapter, LoopDeviceAdapter, SystemCopy, SystemDm, SystemLoop};
use crate::error::{BlobstoreError, Result};
use crate::id;
use crate::lock::{self, LockHandle, LockMode, Timeout};
use crate::metadata::{self, Descriptor, OpenParams, RevocationPolicy, SnapshotPolicy};
use crate::path::Format;

pub const DESCRIPTOR_FILE_NAME: &str = ".blobstore";

/// `BLOBSTORE_METADATA_TIMEOUT` from §4.9: how long the shared re-open that
/// follows a create attempt waits for a competing writer to finish.
const STORE_OPEN_TIMEOUT: Timeout = Timeout::Micros(1_000_000);

/// A block-blob store rooted at a directory, generic over the adapters used
/// for loopback, device-mapper, and block-copy operations. Most callers want
/// the [`Blobstore`] alias, which wires up the real, shelling-out
/// implementations; tests substitute fakes to exercise lifecycle and
/// composition logic without root privileges.
pub struct GenericBlobstore<L, D, C> {
    root: PathBuf,
    descriptor: Descriptor,
    pub(crate) loop_adapter: L,
    pub(crate) dm_adapter: D,
    pub(crate) copy_adapter: C,
}

/// The default, production-facing store: real loopback/dm/dd adapters.
pub type Blobstore = GenericBlobstore<SystemLoop, SystemDm, SystemCopy>;

impl<L, D, C> GenericBlobstore<L, D, C>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    /// Opens `root`, creating the store descriptor if this is the first
    /// caller to do so. Any non-`None` field of `params` that disagrees with
    /// an existing descriptor is rejected with `Invalid`.
    pub fn open(root: impl Into<PathBuf>, params: OpenParams, loop_adapter: L, dm_adapter: D, copy_adapter: C) -> Result<Self> {
        Self::open_impl(root.into(), params, loop_adapter, dm_adapter, copy_adapter).map_err(|e| {
            crate::error::note(&e);
            e
        })
    }

    fn open_impl(root: PathBuf, params: OpenParams, loop_adapter: L, dm_adapter: D, copy_adapter: C) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let descriptor_path = root.join(DESCRIPTOR_FILE_NAME);

        match lock::open_and_lock(&descriptor_path, LockMode::Create { must_not_exist: true }, Timeout::NoWait, 0o600) {
            Ok(handle) => {
                let descriptor = Descriptor {
                    id: id::gen_id(),
                    limit_blocks: params.limit_blocks.unwrap_or(0),
                    format: params.format.unwrap_or(Format::Files),
                    revocation_policy: params.revocation_policy.unwrap_or(RevocationPolicy::None),
                    snapshot_policy: params.snapshot_policy.unwrap_or(SnapshotPolicy::DeviceMapper),
                };
                metadata::write_descriptor(&descriptor_path, &descriptor)?;
                lock::close_and_unlock(handle)?;
            }
            // Another caller won the race to create it, or is still holding
            // the exclusive lock while doing so -- both are expected.
            Err(BlobstoreError::Exists(_)) | Err(BlobstoreError::Again) => {}
            Err(e) => return Err(e),
        }

        let handle = lock::open_and_lock(&descriptor_path, LockMode::ReadOnly, STORE_OPEN_TIMEOUT, 0)?;
        let descriptor = metadata::read_descriptor(&descriptor_path)?;
        lock::close_and_unlock(handle)?;

        if let Some(limit) = params.limit_blocks {
            if limit != 0 && limit != descriptor.limit_blocks {
                return Err(BlobstoreError::Invalid("'limit_blocks' does not match existing blobstore".into()));
            }
        }
        if let Some(format) = params.format {
            if format != descriptor.format {
                return Err(BlobstoreError::Invalid("'format' does not match existing blobstore".into()));
            }
        }
        if let Some(snapshot_policy) = params.snapshot_policy {
            if snapshot_policy != descriptor.snapshot_policy {
                return Err(BlobstoreError::Invalid("'snapshot_policy' does not match existing blobstore".into()));
            }
        }
        if let Some(revocation_policy) = params.revocation_policy {
            if revocation_policy != descriptor.revocation_policy {
                return Err(BlobstoreError::Invalid("'revocation_policy' does not match existing blobstore".into()));
            }
        }

        log::debug!("opened blobstore {} at {}", descriptor.id, root.display());
        Ok(GenericBlobstore { root, descriptor, loop_adapter, dm_adapter, copy_adapter })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn limit_blocks(&self) -> u64 {
        self.descriptor.limit_blocks
    }

    pub fn format(&self) -> Format {
        self.descriptor.format
    }

    pub fn revocation_policy(&self) -> RevocationPolicy {
        self.descriptor.revocation_policy
    }

    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        self.descriptor.snapshot_policy
    }

    pub(crate) fn descriptor_path(&self) -> PathBuf {
        self.root.join(DESCRIPTOR_FILE_NAME)
    }

    /// Acquires the store-wide exclusive lock, serializing scan/LRU/allocation
    /// against every other opener of this store.
    pub fn lock(&self, timeout: Timeout) -> Result<LockHandle> {
        lock::open_and_lock(&self.descriptor_path(), LockMode::ReadWrite, timeout, 0)
    }

    pub fn unlock(&self, handle: LockHandle) -> Result<()> {
        lock::close_and_unlock(handle)
    }

    /// Releases the in-memory handle. Never touches disk: like the
    /// original's `blobstore_close`, this is a pure free.
    pub fn close(self) {}

    /// Carried forward from the original for API parity. The original
    /// leaves store-level deletion unimplemented (`return -1`); this does
    /// too.
    pub fn delete_store(self) -> Result<()> {
        Err(BlobstoreError::Unknown("not implemented".into()))
    }
}

impl GenericBlobstore<SystemLoop, SystemDm, SystemCopy> {
    /// Convenience constructor wiring up the real, shelling-out adapters.
    pub fn open_system(root: impl Into<PathBuf>, params: OpenParams) -> Result<Self> {
        Self::open(root, params, SystemLoop, SystemDm, SystemCopy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeCopy, FakeDm, FakeLoop};
    use tempfile::tempdir;

    fn open_fake(root: &Path, params: OpenParams) -> Result<GenericBlobstore<FakeLoop, FakeDm, FakeCopy>> {
        GenericBlobstore::open(root, params, FakeLoop::default(), FakeDm::default(), FakeCopy)
    }

    #[test]
    fn open_creates_then_reopens() {
        let dir = tempdir().unwrap();
        let params = OpenParams { limit_blocks: Some(30), format: Some(Format::Files), ..Default::default() };
        let bs = open_fake(dir.path(), params.clone()).unwrap();
        assert_eq!(bs.limit_blocks(), 30);
        let id = bs.id().to_string();
        bs.close();

        let bs2 = open_fake(dir.path(), params).unwrap();
        assert_eq!(bs2.id(), id);
    }

    #[test]
    fn mismatched_limit_is_rejected() {
        let dir = tempdir().unwrap();
        let params = OpenParams { limit_blocks: Some(30), ..Default::default() };
        open_fake(dir.path(), params).unwrap().close();

        let err = open_fake(dir.path(), OpenParams { limit_blocks: Some(31), ..Default::default() }).unwrap_err();
        assert!(matches!(err, BlobstoreError::Invalid(_)));
    }

    #[test]
    fn delete_store_is_inert() {
        let dir = tempdir().unwrap();
        let bs = open_fake(dir.path(), OpenParams::default()).unwrap();
        let err = bs.delete_store().unwrap_err();
        assert!(matches!(err, BlobstoreError::Unknown(_)));
    }
}
