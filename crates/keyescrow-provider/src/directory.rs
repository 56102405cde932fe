//! Provider contract for the directory service that stores escrow records.

use crate::credential::MachineCredential;
use crate::record::EscrowRecord;
use std::error::Error;

/// Opens authenticated sessions against a directory service.
pub trait DirectoryConnector {
    type Error: Error + Send + Sync + 'static;
    type Session: DirectorySession<Error = Self::Error>;

    /// Connect to `url` and authenticate with `credential`.
    fn connect(
        &self,
        url: &str,
        credential: &dyn MachineCredential,
    ) -> Result<Self::Session, Self::Error>;
}

/// Operations the rotation workflow needs from an authenticated session.
pub trait DirectorySession {
    type Error: Error + Send + Sync + 'static;

    /// Resolve the distinguished name of the computer object named `hostname` under `base_dn`.
    fn find_host(&mut self, base_dn: &str, hostname: &str) -> Result<String, Self::Error>;

    /// Create `record` as a new entry at `record_dn`.
    fn add_escrow_record(&mut self, record_dn: &str, record: &EscrowRecord)
        -> Result<(), Self::Error>;

    /// Tear the session down.
    fn close(self) -> Result<(), Self::Error>;
}
