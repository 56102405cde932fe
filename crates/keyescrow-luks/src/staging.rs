//! Hand-off file for the new key.
//!
//! `luksAddKey` only reads the new key from a file, so the secret has to touch a filesystem for the
//! duration of that call. Only memory-backed filesystems are accepted; a disk-backed `/tmp` would
//! leave the secret in freed blocks after the file is removed.

use keyescrow_core::error::{EscrowError, EscrowResult};
use log::debug;
use nix::sys::statfs::{statfs, FsType, TMPFS_MAGIC};
use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// `RAMFS_MAGIC` from `linux/magic.h`; not exported by nix.
#[allow(clippy::unnecessary_cast)]
const RAMFS_MAGIC: FsType = FsType(0x8584_58f6_u32 as _);

/// Directories tried, in order, for the staging file.
pub const KEY_STAGING_DIRS: &[&str] = &["/run", "/dev/shm"];

/// Whether `dir` lives on tmpfs or ramfs.
pub fn is_memory_backed(dir: &Path) -> bool {
    match statfs(dir) {
        Ok(stat) => {
            let fs_type = stat.filesystem_type();
            fs_type == TMPFS_MAGIC || fs_type == RAMFS_MAGIC
        }
        Err(err) => {
            debug!("statfs {} failed: {err}", dir.display());
            false
        }
    }
}

/// Write `key` to a 0600 file in the first usable memory-backed directory of `candidates`.
pub(crate) fn stage_key(key: &[u8], candidates: &[PathBuf]) -> EscrowResult<NamedTempFile> {
    for dir in candidates {
        if !is_memory_backed(dir) {
            debug!("{} is not memory-backed; not staging the key there", dir.display());
            continue;
        }
        match create_in(dir, key) {
            Ok(file) => return Ok(file),
            Err(err) => debug!("cannot stage key in {}: {err}", dir.display()),
        }
    }

    let tried: Vec<String> = candidates
        .iter()
        .map(|dir| dir.display().to_string())
        .collect();
    Err(EscrowError::KeySlot(format!(
        "no writable memory-backed directory to stage the new key in (tried {})",
        tried.join(", ")
    )))
}

fn create_in(dir: &Path, key: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(".keyescrow-key-")
        .permissions(Permissions::from_mode(0o600))
        .tempfile_in(dir)?;
    file.write_all(key)?;
    file.flush()?;
    Ok(file)
}

pub(crate) fn discard_staged_key(file: NamedTempFile) {
    if let Err(err) = file.as_file().set_len(0) {
        debug!("failed to truncate staged key file: {err}");
    }
    if let Err(err) = file.close() {
        debug!("failed to remove staged key file: {err}");
    }
}

pub(crate) fn default_staging_dirs() -> Vec<PathBuf> {
    KEY_STAGING_DIRS.iter().map(PathBuf::from).collect()
}
