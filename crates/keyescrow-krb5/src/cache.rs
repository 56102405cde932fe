//! The ticket cache handed to the directory client.

use keyescrow_provider::MachineCredential;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A ticket cache living in its own private directory.
///
/// Dropping the handle without releasing it still removes the directory, but only
/// [`crate::KinitCredentialProvider`] runs `kdestroy` and reports removal failures.
pub struct CredentialCache {
    pub(crate) dir: TempDir,
    pub(crate) cache_name: String,
    keytab: PathBuf,
    principal: String,
}

impl CredentialCache {
    pub(crate) fn new(dir: TempDir, keytab: &Path, principal: &str) -> Self {
        let cache_name = format!("FILE:{}", dir.path().join("krb5cc").display());
        Self {
            dir,
            cache_name,
            keytab: keytab.to_path_buf(),
            principal: principal.to_string(),
        }
    }

    /// Directory holding the cache file.
    pub fn directory(&self) -> &Path {
        self.dir.path()
    }
}

impl MachineCredential for CredentialCache {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn keytab(&self) -> &Path {
        &self.keytab
    }

    fn principal(&self) -> &str {
        &self.principal
    }
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("cache_name", &self.cache_name)
            .field("principal", &self.principal)
            .finish()
    }
}
