//! Merge command-line flags with the configuration file into one rotation request.
//!
//! Precedence is flag, then file, then built-in default.

use anyhow::{bail, ensure, Context, Result};
use keyescrow_core::config::{check_directory_url, looks_like_dn};
use keyescrow_core::host::{directory_hostname, local_hostname, machine_principal};
use keyescrow_core::keyfile::{key_from_text, read_key_file};
use keyescrow_core::{KeyescrowConfig, RotationRequest};
use rpassword::prompt_password;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Flags that feed a rotation, as parsed from the command line.
#[derive(Debug, Default, Clone)]
pub struct RotateFlags {
    pub device: Option<PathBuf>,
    pub url: Option<String>,
    pub search_base: Option<String>,
    pub keytab: Option<PathBuf>,
    pub principal: Option<String>,
    pub hostname: Option<String>,
    pub existing_key: Option<String>,
    pub existing_key_file: Option<PathBuf>,
    pub prompt_existing_key: bool,
    pub remove_original_key: bool,
}

/// Where the existing unlock key comes from.
#[derive(Debug, PartialEq, Eq)]
pub enum KeySource {
    Inline(String),
    File(PathBuf),
    Prompt,
}

impl RotateFlags {
    /// Exactly one key source must be given.
    pub fn key_source(&self) -> Result<KeySource> {
        let given = [
            self.existing_key.is_some(),
            self.existing_key_file.is_some(),
            self.prompt_existing_key,
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        ensure!(
            given == 1,
            "supply the existing unlock key with exactly one of --existing-key, \
             --existing-key-file or --prompt-existing-key"
        );

        if let Some(value) = &self.existing_key {
            return Ok(KeySource::Inline(value.clone()));
        }
        if let Some(path) = &self.existing_key_file {
            return Ok(KeySource::File(path.clone()));
        }
        Ok(KeySource::Prompt)
    }
}

/// Everything a rotation needs except the existing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateSettings {
    pub device: PathBuf,
    pub url: String,
    pub search_base: String,
    pub keytab: PathBuf,
    pub principal: String,
    pub hostname: String,
    pub remove_original_key: bool,
}

impl RotateSettings {
    /// Resolve settings, failing on anything missing or malformed.
    ///
    /// `local_name` supplies the host name when neither flag nor file names one.
    pub fn resolve(
        flags: &RotateFlags,
        config: &KeyescrowConfig,
        local_name: impl FnOnce() -> Result<String>,
    ) -> Result<Self> {
        let device = match &flags.device {
            Some(path) => path.clone(),
            None => match config.volume.device.as_deref() {
                Some(path) => PathBuf::from(path),
                None => bail!("missing volume device: pass --device or set volume.device"),
            },
        };
        ensure!(
            device.is_absolute(),
            "volume device {} must be an absolute path",
            device.display()
        );

        let Some(url) = flags.url.clone().or_else(|| config.directory.url.clone()) else {
            bail!("missing directory URL: pass --url or set directory.url");
        };
        if let Err(issue) = check_directory_url(&url, config.directory.require_tls) {
            bail!(issue);
        }

        let Some(search_base) = flags
            .search_base
            .clone()
            .or_else(|| config.directory.search_base.clone())
        else {
            bail!("missing search base: pass --search-base or set directory.search_base");
        };
        ensure!(
            looks_like_dn(&search_base),
            "search base `{search_base}` is not a distinguished name"
        );

        let raw_hostname = match &flags.hostname {
            Some(name) => name.clone(),
            None => local_name()?,
        };
        let Some(hostname) = directory_hostname(&raw_hostname) else {
            bail!("host name `{raw_hostname}` is not usable as a directory name");
        };

        let principal = flags
            .principal
            .clone()
            .or_else(|| config.credential.principal.clone())
            .unwrap_or_else(|| machine_principal(&hostname));

        let keytab = flags
            .keytab
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.credential.keytab));

        Ok(Self {
            device,
            url,
            search_base,
            keytab,
            principal,
            hostname,
            remove_original_key: flags.remove_original_key,
        })
    }

    pub fn into_request(self, existing_key: Zeroizing<Vec<u8>>) -> RotationRequest {
        RotationRequest {
            device: self.device,
            directory_url: self.url,
            search_base: self.search_base,
            keytab: self.keytab,
            principal: self.principal,
            hostname: self.hostname,
            existing_key,
            remove_original_key: self.remove_original_key,
        }
    }
}

/// Host name of this machine in directory form.
pub fn system_hostname() -> Result<String> {
    local_hostname().context("unable to determine the local host name")
}

/// Load the existing unlock key from its source.
pub fn read_existing_key(source: &KeySource, device: &std::path::Path) -> Result<Zeroizing<Vec<u8>>> {
    let key = match source {
        KeySource::Inline(value) => key_from_text(value)?,
        KeySource::File(path) => read_key_file(path)
            .with_context(|| format!("failed to read existing key from {}", path.display()))?,
        KeySource::Prompt => {
            let typed = Zeroizing::new(prompt_password(format!(
                "Existing unlock key for {}: ",
                device.display()
            ))?);
            key_from_text(&typed)?
        }
    };
    Ok(key)
}
