//! Small filesystem helpers shared across the codec and lifecycle modules.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::unistd;

use crate::error::{BlobstoreError, Result};

/// Writes `data` to `path` by writing a temporary sibling file and renaming
/// it over the target, so a reader never observes a partial write. This is
/// the upgrade the design notes call for over the original's bare
/// `O_TRUNC` + write (see the per-sidecar codec in `metadata.rs`, which uses
/// this for every list sidecar).
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut template = path.to_owned();
    let file_name = template
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_default();
    template.set_file_name(format!("{}.tmp_XXXXXX", file_name.to_string_lossy()));

    let (fd, tmp_path) = unistd::mkstemp(&template)
        .map_err(|e| BlobstoreError::Unknown(format!("mkstemp {:?} failed: {}", template, e)))?;

    let cleanup = |path: &Path| {
        let _ = unistd::unlink(path);
    };

    let mut file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };

    if let Err(e) = nix::sys::stat::fchmod(fd, nix::sys::stat::Mode::from_bits_truncate(mode as _)) {
        cleanup(&tmp_path);
        return Err(BlobstoreError::Unknown(format!("fchmod {:?} failed: {}", tmp_path, e)));
    }

    if let Err(e) = file.write_all(data) {
        cleanup(&tmp_path);
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        cleanup(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}

/// Creates `dir` and all missing ancestors with mode `0700`, mirroring the
/// original's `ensure_directories_exist`.
pub fn ensure_dir_exists(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    let perms = fs::Permissions::from_mode(0o700);
    fs::set_permissions(dir, perms)?;
    Ok(())
}
