//! Provider contract for machine credentials derived from a keytab.

use std::error::Error;
use std::path::Path;

/// A short-lived ticket cache proving the host's own identity.
pub trait MachineCredential {
    /// Location of the ticket cache in `TYPE:residual` form (e.g. `FILE:/run/x/krb5cc`).
    fn cache_name(&self) -> &str;

    /// Keytab the ticket was obtained from.
    fn keytab(&self) -> &Path;

    /// Principal the ticket was issued to.
    fn principal(&self) -> &str;
}

/// Acquires and releases isolated machine credentials.
pub trait CredentialProvider {
    type Error: Error + Send + Sync + 'static;
    type Credential: MachineCredential;

    /// Obtain a ticket for `principal` from `keytab` into a process-private cache.
    ///
    /// On failure nothing is left behind for the caller to release.
    fn acquire(&self, keytab: &Path, principal: &str) -> Result<Self::Credential, Self::Error>;

    /// Destroy the ticket cache backing `credential`.
    fn release(&self, credential: Self::Credential) -> Result<(), Self::Error>;
}
