//! Process-environment hand-off for the GSSAPI bind.
//!
//! The Kerberos library only learns which cache and keytab to use from the environment, so the
//! variables are pointed at the machine credential for the lifetime of a session and put back
//! afterwards.

use keyescrow_provider::MachineCredential;
use log::debug;
use std::env;
use std::ffi::OsString;

pub(crate) const CCACHE_ENV: &str = "KRB5CCNAME";
pub(crate) const CLIENT_KEYTAB_ENV: &str = "KRB5_CLIENT_KTNAME";

/// Restores the previous values of the bound variables on drop.
#[derive(Debug)]
pub(crate) struct EnvBinding {
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl EnvBinding {
    pub(crate) fn bind(credential: &dyn MachineCredential) -> Self {
        let values = [
            (CCACHE_ENV, OsString::from(credential.cache_name())),
            (CLIENT_KEYTAB_ENV, credential.keytab().as_os_str().to_owned()),
        ];
        let mut saved = Vec::with_capacity(values.len());
        for (key, value) in values {
            saved.push((key, env::var_os(key)));
            env::set_var(key, value);
        }
        debug!("bound {} for directory authentication", credential.cache_name());
        Self { saved }
    }
}

impl Drop for EnvBinding {
    fn drop(&mut self) {
        for (key, previous) in self.saved.drain(..).rev() {
            match previous {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
    }
}
