//! `kinit`/`kdestroy` backed credential provider.

use crate::cache::CredentialCache;
use crate::CCACHE_ENV;
use keyescrow_core::command::{resolve_binary, ToolCommand};
use keyescrow_core::config::{KNOWN_KDESTROY_PATHS, KNOWN_KINIT_PATHS};
use keyescrow_core::error::{ErrorKind, EscrowError, EscrowResult};
use keyescrow_core::KeyescrowConfig;
use keyescrow_provider::{CredentialProvider, MachineCredential};
use log::{debug, info, warn};
use std::fs::{self, File, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Obtains machine tickets from a keytab with the host `kinit`.
#[derive(Debug, Clone)]
pub struct KinitCredentialProvider {
    kinit: ToolCommand,
    kdestroy: Option<ToolCommand>,
    cache_root: PathBuf,
}

impl KinitCredentialProvider {
    /// Build a provider from configuration, resolving `kinit` and (if present) `kdestroy`.
    pub fn from_config(config: &KeyescrowConfig) -> EscrowResult<Self> {
        let cfg = &config.credential;
        let kinit = resolve_binary("kinit", cfg.kinit_path.as_deref(), KNOWN_KINIT_PATHS)?;
        let kdestroy = match cfg.kdestroy_path.as_deref() {
            Some(path) => Some(resolve_binary("kdestroy", Some(path), KNOWN_KDESTROY_PATHS)?),
            None => match resolve_binary("kdestroy", None, KNOWN_KDESTROY_PATHS) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!("{err}; ticket caches will only be deleted from disk");
                    None
                }
            },
        };
        Ok(Self::new(kinit, kdestroy, config.credential_timeout()))
    }

    pub fn new(kinit: PathBuf, kdestroy: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            kinit: ToolCommand::new(kinit, timeout),
            kdestroy: kdestroy.map(|path| ToolCommand::new(path, timeout)),
            cache_root: std::env::temp_dir(),
        }
    }

    /// Create cache directories below `root` instead of the system temp directory.
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    fn create_cache(&self, keytab: &Path, principal: &str) -> EscrowResult<CredentialCache> {
        let dir = tempfile::Builder::new()
            .prefix("keyescrow-krb5-")
            .tempdir_in(&self.cache_root)
            .map_err(|err| {
                EscrowError::Credential(format!(
                    "unable to create a ticket cache directory under {}: {err}",
                    self.cache_root.display()
                ))
            })?;
        fs::set_permissions(dir.path(), Permissions::from_mode(0o700)).map_err(|err| {
            EscrowError::Credential(format!(
                "unable to restrict {}: {err}",
                dir.path().display()
            ))
        })?;
        Ok(CredentialCache::new(dir, keytab, principal))
    }
}

impl CredentialProvider for KinitCredentialProvider {
    type Error = EscrowError;
    type Credential = CredentialCache;

    fn acquire(&self, keytab: &Path, principal: &str) -> EscrowResult<CredentialCache> {
        if principal.trim().is_empty() {
            return Err(EscrowError::Credential("principal must not be empty".into()));
        }
        File::open(keytab).map_err(|err| {
            EscrowError::Credential(format!("keytab {} is not readable: {err}", keytab.display()))
        })?;

        // The cache directory is removed on drop if anything below fails.
        let cache = self.create_cache(keytab, principal)?;
        let keytab_arg = keytab.to_string_lossy();
        let out = self
            .kinit
            .clone()
            .env(CCACHE_ENV, cache.cache_name())
            .run(
                &[
                    "-k",
                    "-t",
                    &*keytab_arg,
                    "-c",
                    cache.cache_name(),
                    principal,
                ],
                None,
            )
            .map_err(|err| err.into_kind(ErrorKind::Credential))?;

        if !out.success() {
            return Err(EscrowError::Credential(format!(
                "{} (exit code {})",
                classify_kinit_failure(principal, keytab, &out.diagnostic()),
                out.status
            )));
        }

        info!("obtained machine ticket for {principal}");
        debug!("ticket cache at {}", cache.cache_name());
        Ok(cache)
    }

    fn release(&self, credential: CredentialCache) -> EscrowResult<()> {
        if let Some(kdestroy) = &self.kdestroy {
            let result = kdestroy
                .clone()
                .env(CCACHE_ENV, credential.cache_name())
                .run(&["-c", credential.cache_name()], None);
            match result {
                Ok(out) if out.success() => debug!("destroyed {}", credential.cache_name()),
                Ok(out) => warn!("kdestroy exited with {}: {}", out.status, out.diagnostic()),
                Err(err) => warn!("kdestroy failed: {err}"),
            }
        }

        let dir = credential.dir.path().to_path_buf();
        credential.dir.close().map_err(|err| {
            EscrowError::Credential(format!(
                "unable to remove ticket cache directory {}: {err}",
                dir.display()
            ))
        })
    }
}

fn classify_kinit_failure(principal: &str, keytab: &Path, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let keytab = keytab.display();

    if lower.contains("client not found") || lower.contains("not found in kerberos database") {
        return format!(
            "the KDC does not know principal `{principal}`: {diagnostic}. Check that the machine account exists"
        );
    }

    if lower.contains("keytab contains no suitable keys")
        || lower.contains("key table entry not found")
        || lower.contains("no key table entry")
    {
        return format!(
            "keytab {keytab} has no key for `{principal}`: {diagnostic}. Pass --principal with the name stored in the keytab"
        );
    }

    if lower.contains("preauthentication failed") || lower.contains("password incorrect") {
        return format!(
            "the KDC rejected the key for `{principal}` from {keytab}: {diagnostic}. The keytab may be stale"
        );
    }

    if lower.contains("cannot contact any kdc") || lower.contains("cannot find kdc") {
        return format!("no KDC reachable for `{principal}`: {diagnostic}");
    }

    if lower.contains("clock skew") {
        return format!("clock skew too great while authenticating `{principal}`: {diagnostic}");
    }

    format!("kinit failed for `{principal}` using {keytab}: {diagnostic}")
}
