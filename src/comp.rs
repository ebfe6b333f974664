//! Composition engine: validates a block map and either copies data in place
//! or emits a device-mapper graph (linear / snapshot / zero) over a
//! destination blob, maintaining the bidirectional `deps`/`refs` graph for
//! every non-copy reference it creates.
//!
//! This is a close translation of `blockblob_clone()` from the original,
//! with the `dev[0]=='e'` string hack (a bare dm device name it just
//! created, vs. an already-fully-qualified device path) replaced by the
//! [`DevRef`] enum.

use std::fs;
use std::path::{Path, PathBuf};

use crate::adapters::{BlockCopyAdapter, DmAdapter, LoopDeviceAdapter};
use crate::blob::Blob;
use crate::error::{BlobstoreError, Result};
use crate::metadata::{self, SnapshotPolicy};
use crate::path::{self, Kind};
use crate::store::GenericBlobstore;

/// §4.9: entries per composition call.
pub const MAX_BLOCKMAP: usize = 32;
/// §4.7: minimum `len_blocks` for a `Snapshot` relation against a `Blob` source.
pub const MIN_BLOCKS_SNAPSHOT: u64 = 32;

const ZERO_DEVICE_NAME: &str = "euca-zero";
/// The original's `EUCA_ZERO_SIZE` wire constant, in 512-byte blocks.
const ZERO_DEVICE_BLOCKS: u64 = 2_199_023_255_552;

/// How a block-map entry relates its destination range to its source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// Bytes are copied once; no dependency is recorded.
    Copy,
    /// The destination range becomes a linear dm mapping onto the source.
    Map,
    /// The destination range becomes a copy-on-write dm snapshot of the source.
    Snapshot,
}

/// Where a block-map entry's bytes come from.
pub enum Source<'a, L, D, C> {
    /// An arbitrary block device already present on the system.
    Device(PathBuf),
    /// Another open blob, possibly in a different store.
    Blob { store: &'a GenericBlobstore<L, D, C>, blob: &'a Blob },
    /// The shared `euca-zero` dm target, created lazily on first use.
    Zero,
}

/// One entry of the block map passed to [`clone`].
pub struct BlockMapEntry<'a, L, D, C> {
    pub relation: Relation,
    pub source: Source<'a, L, D, C>,
    pub first_block_src: u64,
    pub first_block_dst: u64,
    pub len_blocks: u64,
}

/// A device reference used while building dm tables: either an
/// already-fully-qualified path (an external device, a blob's current
/// `device_path`, or the zero device) or the bare name of an auxiliary dm
/// device created earlier in the same call, which needs a `/dev/mapper/`
/// prefix once referenced from a table.
#[derive(Clone)]
enum DevRef {
    Path(PathBuf),
    Local(String),
}

impl DevRef {
    fn table_path(&self) -> String {
        match self {
            DevRef::Path(p) => p.display().to_string(),
            DevRef::Local(name) => format!("/dev/mapper/{}", name),
        }
    }
}

/// Validates `map` against `dst`, then either copies data or builds and
/// installs a device-mapper graph over `dst`, updating `dst.device_path`
/// and the `dm`/`deps`/`refs` sidecars as appropriate. See §4.7.
pub fn clone<L, D, C>(dst_store: &GenericBlobstore<L, D, C>, dst: &mut Blob, map: &[BlockMapEntry<L, D, C>]) -> Result<()>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    clone_impl(dst_store, dst, map).map_err(|e| {
        crate::error::note(&e);
        e
    })
}

fn clone_impl<L, D, C>(dst_store: &GenericBlobstore<L, D, C>, dst: &mut Blob, map: &[BlockMapEntry<L, D, C>]) -> Result<()>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    if map.is_empty() || map.len() > MAX_BLOCKMAP {
        return Err(BlobstoreError::Invalid("invalid blockmap or its size".into()));
    }

    validate(dst_store, dst, map)?;

    let dm_base = format!("euca-{}", dst.id.replace('/', "-"));
    let mut dev_names: Vec<String> = Vec::new();
    let mut dm_tables: Vec<String> = Vec::new();
    let mut main_table = String::new();
    let mut mapped_or_snapshotted = false;

    for (i, m) in map.iter().enumerate() {
        let dev = source_dev_ref(m)?;

        match m.relation {
            Relation::Copy => {
                let src_path = match &dev {
                    DevRef::Path(p) => p.clone(),
                    DevRef::Local(_) => unreachable!("source dev refs are always fully-qualified paths"),
                };
                dst_store
                    .copy_adapter
                    .copy(&src_path, &dst.device_path, 512, m.len_blocks, m.first_block_src, m.first_block_dst)?;
                main_table.push_str(&format!(
                    "{} {} linear {} {}\n",
                    m.first_block_dst,
                    m.len_blocks,
                    dst.device_path.display(),
                    m.first_block_dst
                ));
            }

            Relation::Snapshot => {
                let granularity = snapshot_granularity(m.len_blocks);

                let back_name = format!("{}-p{}-back", dm_base, i);
                dm_tables.push(format!("0 {} linear {} {}\n", m.len_blocks, dst.device_path.display(), m.first_block_dst));
                dev_names.push(back_name.clone());

                let mut snapshotted = dev.clone();
                if m.first_block_src > 0 && !matches!(m.source, Source::Zero) {
                    let real_name = format!("{}-p{}-real", dm_base, i);
                    dm_tables.push(format!("0 {} linear {} {}\n", m.len_blocks, dev.table_path(), m.first_block_src));
                    dev_names.push(real_name.clone());
                    snapshotted = DevRef::Local(real_name);
                }

                let snap_name = format!("{}-p{}-snap", dm_base, i);
                dm_tables.push(format!(
                    "0 {} snapshot {} {} p {}\n",
                    m.len_blocks,
                    snapshotted.table_path(),
                    DevRef::Local(back_name).table_path(),
                    granularity
                ));
                dev_names.push(snap_name.clone());

                main_table.push_str(&format!(
                    "{} {} linear {} 0\n",
                    m.first_block_dst,
                    m.len_blocks,
                    DevRef::Local(snap_name).table_path()
                ));
                mapped_or_snapshotted = true;
            }

            Relation::Map => {
                main_table.push_str(&format!(
                    "{} {} linear {} {}\n",
                    m.first_block_dst,
                    m.len_blocks,
                    dev.table_path(),
                    m.first_block_src
                ));
                mapped_or_snapshotted = true;
            }
        }
    }

    if !mapped_or_snapshotted {
        return Ok(());
    }

    dev_names.push(dm_base.clone());
    dm_tables.push(main_table);

    if let Err(e) = create_devices_or_rollback(&dst_store.dm_adapter, &dev_names, &dm_tables) {
        return Err(e);
    }

    dst.device_path = PathBuf::from(format!("/dev/mapper/{}", dm_base));

    let dm_path = path::sidecar_path(dst_store.root(), dst_store.format(), &dst.id, Kind::Dm)?;
    metadata::write_list(&dm_path, &dev_names)?;

    let my_ref = format!("{} {}", dst_store.root().display(), dst.id);
    for m in map {
        if matches!(m.relation, Relation::Copy) {
            continue;
        }
        if let Source::Blob { store, blob } = &m.source {
            let src_refs_path = path::sidecar_path(store.root(), store.format(), &blob.id, Kind::Refs)?;
            metadata::update_entry(&src_refs_path, &my_ref, false)?;

            let dep_ref = format!("{} {}", store.root().display(), blob.id);
            let dst_deps_path = path::sidecar_path(dst_store.root(), dst_store.format(), &dst.id, Kind::Deps)?;
            metadata::update_entry(&dst_deps_path, &dep_ref, false)?;
        }
    }

    Ok(())
}

fn source_dev_ref<L, D, C>(m: &BlockMapEntry<L, D, C>) -> Result<DevRef> {
    Ok(match &m.source {
        Source::Device(path) => DevRef::Path(path.clone()),
        Source::Blob { blob, .. } => DevRef::Path(blob.device_path.clone()),
        Source::Zero => DevRef::Path(PathBuf::from(format!("/dev/mapper/{}", ZERO_DEVICE_NAME))),
    })
}

/// Largest power of two ≤ 16 that divides `len_blocks`; falls back to 1 if
/// `len_blocks` is odd.
fn snapshot_granularity(len_blocks: u64) -> u64 {
    let mut g = 16u64;
    while g > 1 && len_blocks % g != 0 {
        g /= 2;
    }
    g
}

fn validate<L, D, C>(dst_store: &GenericBlobstore<L, D, C>, dst: &Blob, map: &[BlockMapEntry<L, D, C>]) -> Result<()>
where
    L: LoopDeviceAdapter,
    D: DmAdapter,
    C: BlockCopyAdapter,
{
    for m in map {
        if !matches!(m.relation, Relation::Copy) && dst_store.snapshot_policy() != SnapshotPolicy::DeviceMapper {
            return Err(BlobstoreError::Invalid("relation type is incompatible with snapshot policy".into()));
        }
        if dst.size_blocks < m.first_block_dst + m.len_blocks {
            return Err(BlobstoreError::Invalid("the destination blockblob is too small for the map".into()));
        }

        match &m.source {
            Source::Device(path) => {
                fs::metadata(path).map_err(|_| BlobstoreError::NoEntry(format!("{:?}", path)))?;
                dst_store.copy_adapter.validate_device(path)?;
            }
            Source::Blob { store, blob } => {
                let blocks_path = path::sidecar_path_readonly(store.root(), store.format(), &blob.id, Kind::Blocks);
                let meta = fs::metadata(&blocks_path)?;
                if meta.len() / 512 < blob.size_blocks {
                    return Err(BlobstoreError::Invalid("one of the source blockblobs has backing that is too small".into()));
                }
                store.copy_adapter.validate_device(&blob.device_path)?;
                if blob.size_blocks < m.first_block_src + m.len_blocks {
                    return Err(BlobstoreError::Invalid("one of the source blockblobs is too small for the map".into()));
                }
                if matches!(m.relation, Relation::Snapshot) && m.len_blocks < MIN_BLOCKS_SNAPSHOT {
                    return Err(BlobstoreError::Invalid("snapshot size is too small".into()));
                }
            }
            Source::Zero => {
                if !matches!(m.relation, Relation::Copy) {
                    ensure_zero_device(&dst_store.dm_adapter)?;
                }
            }
        }
    }
    Ok(())
}

/// Creates the process-wide `euca-zero` dm target on first use.
fn ensure_zero_device<D: DmAdapter>(dm: &D) -> Result<()> {
    if dm.exists(ZERO_DEVICE_NAME)? {
        return Ok(());
    }
    dm.create(ZERO_DEVICE_NAME, &format!("0 {} zero\n", ZERO_DEVICE_BLOCKS))
}

/// Creates every `(name, table)` pair in order; on failure, removes whatever
/// was already created, in reverse order, before propagating the original
/// error (§4.7 failure semantics).
fn create_devices_or_rollback<D: DmAdapter>(dm: &D, names: &[String], tables: &[String]) -> Result<()> {
    for (i, (name, table)) in names.iter().zip(tables.iter()).enumerate() {
        if let Err(e) = dm.create(name, table) {
            for created in names[..i].iter().rev() {
                if let Err(cleanup_err) = dm.remove(created) {
                    log::warn!("rollback of dm device {} after failed composition failed: {}", created, cleanup_err);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeCopy, FakeDm, FakeLoop};
    use crate::metadata::OpenParams;
    use crate::path::Format;
    use crate::{blob, lock::Timeout};
    use tempfile::tempdir;

    type TestStore = GenericBlobstore<FakeLoop, FakeDm, FakeCopy>;

    fn open(dir: &Path, snapshot: SnapshotPolicy) -> TestStore {
        GenericBlobstore::open(
            dir,
            OpenParams { limit_blocks: Some(1000), format: Some(Format::Files), snapshot_policy: Some(snapshot), ..Default::default() },
            FakeLoop::default(),
            FakeDm::default(),
            FakeCopy,
        )
        .unwrap()
    }

    fn make_blob(store: &TestStore, id: &str, size: u64, fill: u8) -> Blob {
        let b = blob::create_or_open(store, Some(id), size, blob::BlobFlags { create: true, exclusive: false }, None, Timeout::Forever).unwrap();
        let bytes = vec![fill; (size * 512) as usize];
        std::fs::write(&b.device_path, &bytes).unwrap();
        b
    }

    #[test]
    fn granularity_picks_largest_power_of_two_divisor() {
        assert_eq!(snapshot_granularity(64), 16);
        assert_eq!(snapshot_granularity(48), 16);
        assert_eq!(snapshot_granularity(24), 8);
        assert_eq!(snapshot_granularity(33), 1);
    }

    #[test]
    fn snapshot_relation_rejected_without_dm_snapshot_policy() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), SnapshotPolicy::None);
        let src = make_blob(&store, "src", 32, b'a');
        let mut dst = make_blob(&store, "dst", 32, 0);

        let map = [BlockMapEntry {
            relation: Relation::Snapshot,
            source: Source::Blob { store: &store, blob: &src },
            first_block_src: 0,
            first_block_dst: 0,
            len_blocks: 32,
        }];
        let err = clone(&store, &mut dst, &map).unwrap_err();
        assert!(matches!(err, BlobstoreError::Invalid(_)));
    }

    #[test]
    fn snapshot_below_minimum_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), SnapshotPolicy::DeviceMapper);
        let src = make_blob(&store, "src", 32, b'a');
        let mut dst = make_blob(&store, "dst", 32, 0);

        let map = [BlockMapEntry {
            relation: Relation::Snapshot,
            source: Source::Blob { store: &store, blob: &src },
            first_block_src: 0,
            first_block_dst: 0,
            len_blocks: MIN_BLOCKS_SNAPSHOT - 1,
        }];
        let err = clone(&store, &mut dst, &map).unwrap_err();
        assert!(matches!(err, BlobstoreError::Invalid(_)));
    }

    #[test]
    fn copy_writes_bytes_and_creates_no_dm_devices_or_refs() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), SnapshotPolicy::DeviceMapper);
        let src = make_blob(&store, "src", 32, b'x');
        let mut dst = make_blob(&store, "dst", 32, 0);

        let map = [BlockMapEntry {
            relation: Relation::Copy,
            source: Source::Blob { store: &store, blob: &src },
            first_block_src: 0,
            first_block_dst: 0,
            len_blocks: 32,
        }];
        clone(&store, &mut dst, &map).unwrap();

        let data = std::fs::read(&dst.device_path).unwrap();
        assert!(data.iter().all(|&b| b == b'x'));

        let refs_path = path::sidecar_path_readonly(store.root(), store.format(), &src.id, Kind::Refs);
        assert!(metadata::read_list(&refs_path).unwrap().is_empty());
        assert_eq!(dst.device_path, blob::device_path_of(&store, &dst.id).unwrap());
    }

    #[test]
    fn map_relation_records_deps_and_refs_and_uses_dm_device_path() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), SnapshotPolicy::DeviceMapper);
        let src = make_blob(&store, "src", 32, b'm');
        let mut dst = make_blob(&store, "dst", 32, 0);
        let src_id = src.id.clone();

        let map = [BlockMapEntry {
            relation: Relation::Map,
            source: Source::Blob { store: &store, blob: &src },
            first_block_src: 0,
            first_block_dst: 0,
            len_blocks: 32,
        }];
        clone(&store, &mut dst, &map).unwrap();

        assert_eq!(dst.device_path, PathBuf::from("/dev/mapper/euca-dst"));

        let deps_path = path::sidecar_path_readonly(store.root(), store.format(), &dst.id, Kind::Deps);
        let deps = metadata::read_list(&deps_path).unwrap();
        assert_eq!(deps, vec![format!("{} {}", store.root().display(), src_id)]);

        let refs_path = path::sidecar_path_readonly(store.root(), store.format(), &src_id, Kind::Refs);
        let refs = metadata::read_list(&refs_path).unwrap();
        assert_eq!(refs, vec![format!("{} {}", store.root().display(), dst.id)]);
    }

    #[test]
    fn mixed_map_builds_expected_main_table_shape() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), SnapshotPolicy::DeviceMapper);
        let b1 = make_blob(&store, "b1", 32, b'1');
        let b2 = make_blob(&store, "b2", 32, b'2');
        let b3 = make_blob(&store, "b3", 32, b'3');
        let mut dst = make_blob(&store, "dst", 96, 0);

        let map = [
            BlockMapEntry { relation: Relation::Map, source: Source::Blob { store: &store, blob: &b1 }, first_block_src: 0, first_block_dst: 0, len_blocks: 32 },
            BlockMapEntry { relation: Relation::Copy, source: Source::Blob { store: &store, blob: &b2 }, first_block_src: 0, first_block_dst: 32, len_blocks: 32 },
            BlockMapEntry { relation: Relation::Snapshot, source: Source::Blob { store: &store, blob: &b3 }, first_block_src: 0, first_block_dst: 64, len_blocks: 32 },
        ];
        clone(&store, &mut dst, &map).unwrap();

        let dm_path = path::sidecar_path_readonly(store.root(), store.format(), &dst.id, Kind::Dm);
        let dev_names = metadata::read_list(&dm_path).unwrap();
        // back + snap auxiliary devices for the snapshot entry, plus the main device.
        assert_eq!(dev_names, vec!["euca-dst-p2-back".to_string(), "euca-dst-p2-snap".to_string(), "euca-dst".to_string()]);

        let main_table = store.dm_adapter.tables.lock().unwrap().get("euca-dst").unwrap().clone();
        assert!(main_table.contains("0 32 linear"));
        assert!(main_table.contains("32 32 linear"));
        assert!(main_table.contains("64 32 linear /dev/mapper/euca-dst-p2-snap 0"));
    }

    #[test]
    fn zero_source_creates_shared_device_once() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), SnapshotPolicy::DeviceMapper);
        let mut dst1 = make_blob(&store, "dst1", 64, 0);
        let mut dst2 = make_blob(&store, "dst2", 64, 0);

        let map1 = [BlockMapEntry { relation: Relation::Map, source: Source::Zero, first_block_src: 0, first_block_dst: 0, len_blocks: 64 }];
        clone(&store, &mut dst1, &map1).unwrap();
        let map2 = [BlockMapEntry { relation: Relation::Map, source: Source::Zero, first_block_src: 0, first_block_dst: 0, len_blocks: 64 }];
        clone(&store, &mut dst2, &map2).unwrap();

        assert!(store.dm_adapter.tables.lock().unwrap().contains_key("euca-zero"));
    }

    #[test]
    fn failed_dm_creation_rolls_back_devices_created_so_far() {
        struct FlakyDm {
            inner: FakeDm,
        }
        impl DmAdapter for FlakyDm {
            fn create(&self, name: &str, table: &str) -> Result<()> {
                if name.ends_with("-back") {
                    return Err(BlobstoreError::Unknown("simulated dmsetup failure".into()));
                }
                self.inner.create(name, table)
            }
            fn remove(&self, name: &str) -> Result<()> {
                self.inner.remove(name)
            }
            fn suspend(&self, name: &str) -> Result<()> {
                self.inner.suspend(name)
            }
            fn resume(&self, name: &str) -> Result<()> {
                self.inner.resume(name)
            }
            fn exists(&self, name: &str) -> Result<bool> {
                self.inner.exists(name)
            }
        }

        let dir = tempdir().unwrap();
        let store = GenericBlobstore::open(
            dir.path(),
            OpenParams { limit_blocks: Some(1000), format: Some(Format::Files), snapshot_policy: Some(SnapshotPolicy::DeviceMapper), ..Default::default() },
            FakeLoop::default(),
            FlakyDm { inner: FakeDm::default() },
            FakeCopy,
        )
        .unwrap();

        let src = make_blob(&store, "src", 32, b's');
        let mut dst = make_blob(&store, "dst", 32, 0);
        let map = [BlockMapEntry {
            relation: Relation::Snapshot,
            source: Source::Blob { store: &store, blob: &src },
            first_block_src: 0,
            first_block_dst: 0,
            len_blocks: 32,
        }];
        let err = clone(&store, &mut dst, &map).unwrap_err();
        assert!(matches!(err, BlobstoreError::Unknown(_)));
        assert!(store.dm_adapter.inner.tables.lock().unwrap().is_empty());
    }
}
