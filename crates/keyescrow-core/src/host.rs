//! Host identity helpers: the name the directory knows this machine by.

use crate::error::{EscrowError, EscrowResult};

/// Short host name of the running machine, uppercased as stored in the directory.
pub fn local_hostname() -> EscrowResult<String> {
    let raw = nix::unistd::gethostname()
        .map_err(|err| EscrowError::Validation(format!("unable to read host name: {err}")))?;
    let raw = raw.to_string_lossy();
    directory_hostname(&raw)
        .ok_or_else(|| EscrowError::Validation(format!("host name `{raw}` is not usable")))
}

/// Normalise `name` to the directory form: first DNS label, uppercased.
pub fn directory_hostname(name: &str) -> Option<String> {
    let short = name.trim().split('.').next().unwrap_or_default().trim();
    if short.is_empty()
        || !short
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return None;
    }
    Some(short.to_ascii_uppercase())
}

/// Machine-account principal for `hostname` (`HOST$`).
pub fn machine_principal(hostname: &str) -> String {
    format!("{}$", hostname.to_ascii_uppercase())
}
