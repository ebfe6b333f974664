//! Reads and writes the store descriptor and per-blob sidecar files.
//!
//! Two shapes: the store descriptor is a flat `key: value` text block; every
//! other sidecar is either a raw byte string (`sig`) or a line-oriented list
//! (`dm`, `deps`, `refs`). List writes go through `tools::atomic_write`
//! (tempfile + rename) rather than the original's bare truncate-then-write,
//! per the design notes' recommendation that torn writes on these files
//! should not be possible to observe.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{BlobstoreError, Result};
use crate::path::Format;

pub const DEFAULT_SIDECAR_MODE: u32 = 0o600;

/// The store-level descriptor stored in `.blobstore`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub id: String,
    pub limit_blocks: u64,
    pub format: Format,
    pub revocation_policy: RevocationPolicy,
    pub snapshot_policy: SnapshotPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevocationPolicy {
    None,
    Lru,
}

impl RevocationPolicy {
    fn as_str(self) -> &'static str {
        match self {
            RevocationPolicy::None => "none",
            RevocationPolicy::Lru => "lru",
        }
    }
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(RevocationPolicy::None),
            "lru" => Some(RevocationPolicy::Lru),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotPolicy {
    None,
    DeviceMapper,
}

impl SnapshotPolicy {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotPolicy::None => "none",
            SnapshotPolicy::DeviceMapper => "device_mapper",
        }
    }
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SnapshotPolicy::None),
            "device_mapper" => Some(SnapshotPolicy::DeviceMapper),
            _ => None,
        }
    }
}

/// Any-valued request parameters for `Blobstore::open`: `None` means "accept
/// whatever the store already has", `Some(x)` means "must match `x`".
#[derive(Clone, Debug, Default)]
pub struct OpenParams {
    pub limit_blocks: Option<u64>,
    pub format: Option<Format>,
    pub revocation_policy: Option<RevocationPolicy>,
    pub snapshot_policy: Option<SnapshotPolicy>,
}

pub fn read_descriptor(path: &Path) -> Result<Descriptor> {
    let raw = fs::read_to_string(path)?;
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in raw.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim(), value.trim());
        }
    }
    let id = fields
        .get("id")
        .ok_or_else(|| BlobstoreError::Invalid("descriptor missing 'id'".into()))?
        .to_string();
    let limit_blocks = fields
        .get("limit")
        .ok_or_else(|| BlobstoreError::Invalid("descriptor missing 'limit'".into()))?
        .parse::<u64>()
        .map_err(|_| BlobstoreError::Invalid("descriptor 'limit' is not a number".into()))?;
    let format = fields
        .get("format")
        .and_then(|v| Format::parse(v))
        .ok_or_else(|| BlobstoreError::Invalid("descriptor missing/unknown 'format'".into()))?;
    let revocation_policy = fields
        .get("revocation")
        .and_then(|v| RevocationPolicy::parse(v))
        .ok_or_else(|| BlobstoreError::Invalid("descriptor missing/unknown 'revocation'".into()))?;
    let snapshot_policy = fields
        .get("snapshot")
        .and_then(|v| SnapshotPolicy::parse(v))
        .ok_or_else(|| BlobstoreError::Invalid("descriptor missing/unknown 'snapshot'".into()))?;

    Ok(Descriptor { id, limit_blocks, format, revocation_policy, snapshot_policy })
}

pub fn write_descriptor(path: &Path, desc: &Descriptor) -> Result<()> {
    let text = format!(
        "id: {}\nlimit: {}\nrevocation: {}\nsnapshot: {}\nformat: {}\n",
        desc.id,
        desc.limit_blocks,
        desc.revocation_policy.as_str(),
        desc.snapshot_policy.as_str(),
        desc.format.as_str(),
    );
    crate::tools::atomic_write(path, text.as_bytes(), 0o600)
}

/// Reads a raw byte-string sidecar (`sig`). A missing file reads as empty,
/// matching the design notes' "treat a missing/short sidecar as empty" rule.
pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    crate::tools::atomic_write(path, data, DEFAULT_SIDECAR_MODE)
}

/// Reads a line-oriented list sidecar (`dm`, `deps`, `refs`). Missing file
/// reads as an empty list.
pub fn read_list(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn write_list(path: &Path, entries: &[String]) -> Result<()> {
    let mut text = String::new();
    for e in entries {
        text.push_str(e);
        text.push('\n');
    }
    crate::tools::atomic_write(path, text.as_bytes(), DEFAULT_SIDECAR_MODE)
}

/// Adds or removes one entry from a list sidecar by exact string match,
/// writing back only if the set actually changed. Mirrors the original's
/// `update_entry_blockblob_metadata_path`: additions are appended, removals
/// are swap-removed (order among the rest is not preserved).
pub fn update_entry(path: &Path, entry: &str, remove: bool) -> Result<()> {
    let mut entries = read_list(path)?;
    let pos = entries.iter().position(|e| e == entry);
    let changed = match (remove, pos) {
        (false, None) => {
            entries.push(entry.to_string());
            true
        }
        (true, Some(i)) => {
            entries.swap_remove(i);
            true
        }
        _ => false,
    };
    if changed {
        write_list(path, &entries)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn descriptor_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".blobstore");
        let desc = Descriptor {
            id: "abc123".into(),
            limit_blocks: 30,
            format: Format::Files,
            revocation_policy: RevocationPolicy::Lru,
            snapshot_policy: SnapshotPolicy::DeviceMapper,
        };
        write_descriptor(&path, &desc).unwrap();
        let read_back = read_descriptor(&path).unwrap();
        assert_eq!(read_back, desc);
    }

    #[test]
    fn missing_list_sidecar_reads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.deps");
        assert_eq!(read_list(&path).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn update_entry_appends_then_removes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.refs");
        update_entry(&path, "store1 blobA", false).unwrap();
        update_entry(&path, "store2 blobB", false).unwrap();
        assert_eq!(read_list(&path).unwrap(), vec!["store1 blobA", "store2 blobB"]);
        update_entry(&path, "store1 blobA", true).unwrap();
        assert_eq!(read_list(&path).unwrap(), vec!["store2 blobB"]);
    }

    #[test]
    fn list_round_trip_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.dm");
        let entries = vec!["euca-1-p0-back".to_string(), "euca-1-p0-snap".to_string(), "euca-1".to_string()];
        write_list(&path, &entries).unwrap();
        assert_eq!(read_list(&path).unwrap(), entries);
    }
}
