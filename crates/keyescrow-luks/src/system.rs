//! System-backed `KeySlotManager` implementation.

use crate::command::CryptsetupCommand;
use keyescrow_core::command::resolve_binary;
use keyescrow_core::config::KNOWN_CRYPTSETUP_PATHS;
use keyescrow_core::error::{EscrowError, EscrowResult};
use keyescrow_core::KeyescrowConfig;
use keyescrow_provider::KeySlotManager;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Manages LUKS key slots through the host `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct SystemKeySlotManager {
    cryptsetup: CryptsetupCommand,
}

impl SystemKeySlotManager {
    /// Build a manager from configuration, resolving the `cryptsetup` binary.
    pub fn from_config(config: &KeyescrowConfig) -> EscrowResult<Self> {
        let binary = resolve_binary(
            "cryptsetup",
            config.volume.cryptsetup_path.as_deref(),
            KNOWN_CRYPTSETUP_PATHS,
        )?;
        debug!("using cryptsetup at {}", binary.display());
        Ok(Self::new(binary, config.volume_timeout()))
    }

    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            cryptsetup: CryptsetupCommand::new(binary, timeout),
        }
    }

    /// Stage the new key in the first usable memory-backed directory of `dirs` instead of the
    /// default `/run`, `/dev/shm`.
    pub fn with_staging_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.cryptsetup.set_staging_dirs(dirs);
        self
    }

    pub fn cryptsetup_path(&self) -> &Path {
        self.cryptsetup.binary()
    }

    /// Number of key slots currently in use on `device`.
    pub fn active_slots(&self, device: &Path) -> EscrowResult<usize> {
        self.cryptsetup.active_slots(&device_arg(device)?)
    }
}

impl KeySlotManager for SystemKeySlotManager {
    type Error = EscrowError;

    fn validate(&self, device: &Path) -> EscrowResult<bool> {
        if !device.exists() {
            return Err(EscrowError::Validation(format!(
                "device {} does not exist",
                device.display()
            )));
        }
        self.cryptsetup.is_luks(&device_arg(device)?)
    }

    fn add_key(&self, device: &Path, existing_key: &[u8], new_key: &[u8]) -> EscrowResult<()> {
        require_key("existing", existing_key)?;
        require_key("new", new_key)?;
        let device = device_arg(device)?;

        self.cryptsetup.add_key(&device, existing_key, new_key)?;
        self.cryptsetup
            .test_passphrase(&device, new_key)
            .map_err(|err| EscrowError::KeyPossiblyInstalled(Box::new(err)))?;
        info!("installed and verified new key on {device}");
        Ok(())
    }

    fn remove_key(&self, device: &Path, key: &[u8]) -> EscrowResult<()> {
        require_key("original", key)?;
        let device = device_arg(device)?;

        let active = self.cryptsetup.active_slots(&device)?;
        if active <= 1 {
            return Err(EscrowError::KeySlot(format!(
                "refusing to remove a key from {device}: only {active} key slot(s) in use"
            )));
        }
        self.cryptsetup.remove_key(&device, key)?;
        info!("removed original key from {device} ({} slot(s) remain)", active - 1);
        Ok(())
    }
}

fn require_key(which: &str, key: &[u8]) -> EscrowResult<()> {
    if key.is_empty() {
        return Err(EscrowError::KeySlot(format!("{which} key must not be empty")));
    }
    Ok(())
}

fn device_arg(device: &Path) -> EscrowResult<String> {
    device.to_str().map(str::to_string).ok_or_else(|| {
        EscrowError::Validation(format!(
            "device path {} is not valid UTF-8",
            device.display()
        ))
    })
}
