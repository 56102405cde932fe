//! Configuration model and helpers used by keyescrow binaries.
//!
//! Every value may also come from the command line; the file only supplies site defaults so the
//! periodic job does not need to repeat them.

use crate::error::{EscrowError, EscrowResult};
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/keyescrow.toml";
pub const CONFIG_PATH_ENV: &str = "KEYESCROW_CONFIG";
pub const DEFAULT_KEYTAB_PATH: &str = "/etc/krb5.keytab";

pub const KNOWN_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
pub const KNOWN_KINIT_PATHS: &[&str] = &["/usr/bin/kinit", "/bin/kinit", "/usr/local/bin/kinit"];
pub const KNOWN_KDESTROY_PATHS: &[&str] = &[
    "/usr/bin/kdestroy",
    "/bin/kdestroy",
    "/usr/local/bin/kdestroy",
];

fn default_timeout_secs() -> u64 {
    30
}

/// Where escrow records go and how long directory calls may take.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DirectoryCfg {
    /// Directory service URL, e.g. `ldap://dc1.corp.example.com`.
    #[serde(default)]
    pub url: Option<String>,

    /// Search base for the host lookup, e.g. `DC=corp,DC=example,DC=com`.
    #[serde(default)]
    pub search_base: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Reject plain `ldap://` URLs.
    #[serde(default)]
    pub require_tls: bool,
}

impl Default for DirectoryCfg {
    fn default() -> Self {
        Self {
            url: None,
            search_base: None,
            timeout_secs: default_timeout_secs(),
            require_tls: false,
        }
    }
}

/// Keytab and Kerberos tooling used to obtain the machine credential.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CredentialCfg {
    #[serde(default = "default_keytab")]
    pub keytab: String,

    /// Principal to request; defaults to the machine account (`HOST$`).
    #[serde(default)]
    pub principal: Option<String>,

    #[serde(default)]
    pub kinit_path: Option<String>,

    #[serde(default)]
    pub kdestroy_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_keytab() -> String {
    DEFAULT_KEYTAB_PATH.to_string()
}

impl Default for CredentialCfg {
    fn default() -> Self {
        Self {
            keytab: default_keytab(),
            principal: None,
            kinit_path: None,
            kdestroy_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// The encrypted volume and the tool that manages its key slots.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VolumeCfg {
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VolumeCfg {
    fn default() -> Self {
        Self {
            device: None,
            cryptsetup_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Backoff applied to directory connect and write.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryCfg {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_jitter")]
    pub jitter_ratio: f64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    5_000
}

fn default_retry_jitter() -> f64 {
    0.1
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay(),
            max_delay_ms: default_retry_max_delay(),
            jitter_ratio: default_retry_jitter(),
        }
    }
}

impl RetryCfg {
    /// Single attempt, no sleeping.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct KeyescrowConfig {
    #[serde(default)]
    pub directory: DirectoryCfg,

    #[serde(default)]
    pub credential: CredentialCfg,

    #[serde(default)]
    pub volume: VolumeCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl KeyescrowConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Read a config file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> EscrowResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            EscrowError::InvalidConfig(format!("unable to read {}: {err}", path.display()))
        })?;
        let mut cfg = toml::from_str::<Self>(&contents)?;
        cfg.path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// Load `explicit` when given (it must exist); otherwise the default path when present,
    /// falling back to built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> EscrowResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let default = Self::default_path();
        if default.exists() {
            return Self::load(default);
        }

        debug!(
            "no configuration at {}; using built-in defaults",
            default.display()
        );
        Ok(Self::default())
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if let Some(url) = self.directory.url.as_deref() {
            if let Err(issue) = check_directory_url(url, self.directory.require_tls) {
                issues.push(issue);
            }
        }

        if let Some(base) = self.directory.search_base.as_deref() {
            if !looks_like_dn(base) {
                issues.push(format!(
                    "directory.search_base `{base}` is not a distinguished name"
                ));
            }
        }

        if self.credential.keytab.trim().is_empty() {
            issues.push("credential.keytab must not be empty".to_string());
        }

        if let Some(principal) = self.credential.principal.as_deref() {
            if principal.trim().is_empty() || principal.chars().any(char::is_whitespace) {
                issues.push(format!(
                    "credential.principal `{principal}` must be a single non-empty token"
                ));
            }
        }

        if let Some(device) = self.volume.device.as_deref() {
            if !device.starts_with('/') {
                issues.push(format!("volume.device `{device}` must be an absolute path"));
            }
        }

        for (name, secs) in [
            ("directory.timeout_secs", self.directory.timeout_secs),
            ("credential.timeout_secs", self.credential.timeout_secs),
            ("volume.timeout_secs", self.volume.timeout_secs),
        ] {
            if secs == 0 {
                issues.push(format!("{name} must be greater than 0"));
            }
        }

        if self.retry.max_attempts == 0 {
            issues.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms == 0 {
            issues.push("retry.base_delay_ms must be greater than 0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            issues.push(
                "retry.max_delay_ms must be greater than or equal to retry.base_delay_ms"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            issues.push("retry.jitter_ratio must be between 0.0 and 1.0".to_string());
        }

        issues
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory.timeout_secs)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credential.timeout_secs)
    }

    pub fn volume_timeout(&self) -> Duration {
        Duration::from_secs(self.volume.timeout_secs)
    }
}

/// Check that `url` is an LDAP URL with a host; `require_tls` demands `ldaps://`.
pub fn check_directory_url(url: &str, require_tls: bool) -> Result<(), String> {
    let parsed = Url::parse(url).map_err(|err| format!("directory.url `{url}` is invalid: {err}"))?;
    match parsed.scheme() {
        "ldaps" => {}
        "ldap" if !require_tls => {}
        "ldap" => {
            return Err(format!(
                "directory.url `{url}` uses plain ldap:// but directory.require_tls is set"
            ))
        }
        other => {
            return Err(format!(
                "directory.url `{url}` has unsupported scheme `{other}` (expected ldap or ldaps)"
            ))
        }
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(format!("directory.url `{url}` does not name a host"));
    }
    Ok(())
}

/// Cheap syntactic check for `attr=value[,attr=value...]`.
pub fn looks_like_dn(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty()
        && trimmed.split(',').all(|rdn| {
            rdn.split_once('=')
                .map(|(attr, val)| {
                    let attr = attr.trim();
                    !attr.is_empty()
                        && attr.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
                        && !val.trim().is_empty()
                })
                .unwrap_or(false)
        })
}
