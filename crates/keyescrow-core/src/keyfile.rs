//! Loading the operator-supplied unlock key from the places the CLI accepts it.

use crate::error::{EscrowError, EscrowResult};
use log::warn;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Upper bound for a key file; anything larger is almost certainly the wrong path.
const MAX_KEY_FILE_LEN: u64 = 8 * 1024;

/// Read an existing unlock key from `path`.
///
/// The contents are used verbatim except for a single trailing newline, which editors and
/// `echo` add but a typed passphrase never contains.
pub fn read_key_file(path: &Path) -> EscrowResult<Zeroizing<Vec<u8>>> {
    let meta = fs::metadata(path).map_err(|err| invalid_key(path, err.to_string()))?;
    if !meta.is_file() {
        return Err(invalid_key(path, "not a regular file"));
    }
    if meta.len() > MAX_KEY_FILE_LEN {
        return Err(invalid_key(
            path,
            format!("file is {} bytes; refusing to treat it as a key", meta.len()),
        ));
    }
    if meta.permissions().mode() & 0o077 != 0 {
        warn!(
            "key file {} is accessible by group or others (mode {:o})",
            path.display(),
            meta.permissions().mode() & 0o777
        );
    }

    let contents = Zeroizing::new(fs::read(path)?);
    decode_key_bytes(path, &contents)
}

/// Normalise raw key bytes, stripping one trailing `\n` or `\r\n`.
pub fn decode_key_bytes(origin: &Path, bytes: &[u8]) -> EscrowResult<Zeroizing<Vec<u8>>> {
    let trimmed = bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes);
    if trimmed.is_empty() {
        return Err(invalid_key(origin, "file is empty"));
    }
    Ok(Zeroizing::new(trimmed.to_vec()))
}

/// Wrap a key typed on the command line or at a prompt.
pub fn key_from_text(value: &str) -> EscrowResult<Zeroizing<Vec<u8>>> {
    if value.is_empty() {
        return Err(EscrowError::Validation(
            "existing unlock key cannot be empty".into(),
        ));
    }
    Ok(Zeroizing::new(value.as_bytes().to_vec()))
}

fn invalid_key(path: &Path, reason: impl Into<String>) -> EscrowError {
    EscrowError::InvalidKeyFile {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}
