//! `cryptsetup` invocations and failure classification.
//!
//! Keys never appear on the command line: existing keys go over stdin (`--key-file -`) and the new
//! key is staged in a private file on a memory-backed filesystem that is truncated and removed
//! before returning.

use crate::dump::count_active_slots;
use crate::staging::{default_staging_dirs, discard_staged_key, stage_key};
use keyescrow_core::command::{ToolCommand, ToolOutput};
use keyescrow_core::error::{ErrorKind, EscrowError, EscrowResult};
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct CryptsetupCommand {
    tool: ToolCommand,
    staging_dirs: Vec<PathBuf>,
}

impl CryptsetupCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            tool: ToolCommand::new(binary, timeout),
            staging_dirs: default_staging_dirs(),
        }
    }

    pub(crate) fn set_staging_dirs(&mut self, dirs: Vec<PathBuf>) {
        self.staging_dirs = dirs;
    }

    pub(crate) fn binary(&self) -> &Path {
        self.tool.binary()
    }

    pub(crate) fn is_luks(&self, device: &str) -> EscrowResult<bool> {
        let out = self.run(&["isLuks", device], None)?;
        match out.status {
            0 => Ok(true),
            1 => Ok(false),
            code => Err(EscrowError::KeySlot(format!(
                "cryptsetup isLuks {device} failed: {} (exit code {code})",
                out.diagnostic()
            ))),
        }
    }

    pub(crate) fn add_key(&self, device: &str, existing_key: &[u8], new_key: &[u8]) -> EscrowResult<()> {
        let staged = stage_key(new_key, &self.staging_dirs)?;
        let key_arg = staged.path().to_string_lossy().into_owned();
        let result = self.run(
            &["luksAddKey", "--batch-mode", "--key-file", "-", device, key_arg.as_str()],
            Some(existing_key),
        );
        discard_staged_key(staged);
        // A luksAddKey killed on timeout may already have written the slot.
        let out = result.map_err(|err| match err {
            timeout @ EscrowError::Timeout { .. } => {
                EscrowError::KeyPossiblyInstalled(Box::new(timeout))
            }
            other => other,
        })?;
        if out.success() {
            return Ok(());
        }
        let message = classify_failure(Action::AddKey, device, &out.diagnostic());
        Err(EscrowError::KeySlot(format!("{message} (exit code {})", out.status)))
    }

    /// Check that `key` unlocks `device` without activating a mapping.
    pub(crate) fn test_passphrase(&self, device: &str, key: &[u8]) -> EscrowResult<()> {
        let out = self.run(&["open", "--test-passphrase", "--key-file", "-", device], Some(key))?;
        if out.success() {
            return Ok(());
        }
        let message = classify_failure(Action::TestPassphrase, device, &out.diagnostic());
        Err(EscrowError::KeySlot(format!("{message} (exit code {})", out.status)))
    }

    pub(crate) fn active_slots(&self, device: &str) -> EscrowResult<usize> {
        let out = self.run(&["luksDump", device], None)?;
        if !out.success() {
            let message = classify_failure(Action::Dump, device, &out.diagnostic());
            return Err(EscrowError::KeySlot(format!(
                "{message} (exit code {})",
                out.status
            )));
        }
        Ok(count_active_slots(&out.stdout))
    }

    pub(crate) fn remove_key(&self, device: &str, key: &[u8]) -> EscrowResult<()> {
        let out = self.run(
            &["luksRemoveKey", "--batch-mode", "--key-file", "-", device],
            Some(key),
        )?;
        if out.success() {
            return Ok(());
        }
        let message = classify_failure(Action::RemoveKey, device, &out.diagnostic());
        Err(EscrowError::KeySlot(format!("{message} (exit code {})", out.status)))
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> EscrowResult<ToolOutput> {
        debug!("running cryptsetup {}", args.first().copied().unwrap_or_default());
        self.tool
            .run(args, input)
            .map_err(|err| err.into_kind(ErrorKind::KeySlot))
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    AddKey,
    TestPassphrase,
    Dump,
    RemoveKey,
}

impl Action {
    fn describe(self) -> &'static str {
        match self {
            Action::AddKey => "add a key to",
            Action::TestPassphrase => "verify the new key on",
            Action::Dump => "read the key slot table of",
            Action::RemoveKey => "remove the original key from",
        }
    }
}

fn classify_failure(action: Action, device: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let what = action.describe();

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        let hint = match action {
            Action::TestPassphrase => {
                "The new key is installed but does not unlock the volume; keep the original key"
            }
            _ => "Check that the supplied existing key unlocks the volume",
        };
        return format!(
            "cryptsetup rejected the key while trying to {what} `{device}`: {diagnostic}. {hint}"
        );
    }

    if lower.contains("not a valid luks device") || lower.contains("is not a luks device") {
        return format!("cannot {what} `{device}`: not a LUKS device: {diagnostic}");
    }

    if lower.contains("no free key slot")
        || lower.contains("no free keyslot")
        || lower.contains("no remaining keyslot")
        || lower.contains("all key slots full")
    {
        return format!(
            "cannot {what} `{device}` because every key slot is in use: {diagnostic}. Free a slot before retrying"
        );
    }

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "cryptsetup could not {what} `{device}`: {diagnostic}. This usually requires running as root"
        );
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("cannot open device")
    {
        return format!(
            "cryptsetup could not {what} `{device}`: {diagnostic}. Confirm the device path is correct and present"
        );
    }

    format!("cryptsetup failed to {what} `{device}`: {diagnostic}")
}
