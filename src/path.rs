//! Maps `(blob_id, sidecar kind)` to filesystem paths, under either of the
//! two on-disk layouts a store can be configured with.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::tools;

/// The on-disk layout of a store: how a blob id maps to sidecar paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Sidecars are siblings named `<id>.<suffix>`.
    Files,
    /// Sidecars live under `<id>/<suffix>`; `<id>` may itself contain `/`,
    /// producing nested directories.
    Directory,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Files => "files",
            Format::Directory => "directory",
        }
    }

    pub fn parse(s: &str) -> Option<Format> {
        match s {
            "files" => Some(Format::Files),
            "directory" => Some(Format::Directory),
            _ => None,
        }
    }
}

/// The kind of file associated with a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Blocks,
    Dm,
    Deps,
    Loopback,
    Sig,
    Refs,
}

impl Kind {
    fn suffix(self) -> &'static str {
        match self {
            Kind::Blocks => "blocks",
            Kind::Dm => "dm",
            Kind::Deps => "deps",
            Kind::Loopback => "loopback",
            Kind::Sig => "sig",
            Kind::Refs => "refs",
        }
    }

    fn from_suffix(s: &str) -> Option<Kind> {
        match s {
            "blocks" => Some(Kind::Blocks),
            "dm" => Some(Kind::Dm),
            "deps" => Some(Kind::Deps),
            "loopback" => Some(Kind::Loopback),
            "sig" => Some(Kind::Sig),
            "refs" => Some(Kind::Refs),
            _ => None,
        }
    }

    pub const ALL: [Kind; 6] = [Kind::Blocks, Kind::Dm, Kind::Deps, Kind::Loopback, Kind::Sig, Kind::Refs];
}

/// Resolves the sidecar path for `(blob_id, kind)` under `root` and `format`.
/// For the `Directory` format, intermediate directories implied by `blob_id`
/// are created on demand (mode `0700`); callers that only want to inspect a
/// path without creating anything should use `sidecar_path_readonly`.
pub fn sidecar_path(root: &Path, format: Format, blob_id: &str, kind: Kind) -> Result<PathBuf> {
    let path = sidecar_path_readonly(root, format, blob_id, kind);
    if format == Format::Directory {
        if let Some(parent) = path.parent() {
            tools::ensure_dir_exists(parent)?;
        }
    }
    Ok(path)
}

/// Like `sidecar_path` but never touches the filesystem.
pub fn sidecar_path_readonly(root: &Path, format: Format, blob_id: &str, kind: Kind) -> PathBuf {
    match format {
        Format::Files => root.join(format!("{}.{}", blob_id, kind.suffix())),
        Format::Directory => root.join(blob_id).join(kind.suffix()),
    }
}

/// Classifies a path found during a directory scan, returning the blob id
/// and kind it represents if it matches the current store `format`.
pub fn classify(root: &Path, format: Format, path: &Path) -> Option<(String, Kind)> {
    let rel = path.strip_prefix(root).ok()?;
    match format {
        Format::Files => {
            let name = rel.to_str()?;
            let (id, suffix) = name.rsplit_once('.')?;
            let kind = Kind::from_suffix(suffix)?;
            Some((id.to_string(), kind))
        }
        Format::Directory => {
            let mut components: Vec<&str> = rel.iter().map(|c| c.to_str()).collect::<Option<_>>()?;
            let suffix = components.pop()?;
            let kind = Kind::from_suffix(suffix)?;
            if components.is_empty() {
                return None;
            }
            Some((components.join("/"), kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_layout_round_trips() {
        let root = Path::new("/store");
        let p = sidecar_path_readonly(root, Format::Files, "myblob", Kind::Blocks);
        assert_eq!(p, Path::new("/store/myblob.blocks"));
        assert_eq!(classify(root, Format::Files, &p), Some(("myblob".to_string(), Kind::Blocks)));
    }

    #[test]
    fn directory_layout_supports_nested_ids() {
        let root = Path::new("/store");
        let p = sidecar_path_readonly(root, Format::Directory, "a/b/c", Kind::Sig);
        assert_eq!(p, Path::new("/store/a/b/c/sig"));
        assert_eq!(classify(root, Format::Directory, &p), Some(("a/b/c".to_string(), Kind::Sig)));
    }

    #[test]
    fn classify_rejects_unknown_suffix() {
        let root = Path::new("/store");
        assert_eq!(classify(root, Format::Files, Path::new("/store/.blobstore")), None);
    }
}
