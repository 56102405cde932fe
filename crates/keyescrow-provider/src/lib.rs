#![forbid(unsafe_code)]

//! Provider contracts shared across keyescrow.
//!
//! The rotation workflow is written against these traits so the volume, Kerberos, and directory
//! integrations can be swapped for fakes in tests without touching orchestration logic.

pub mod credential;
pub mod directory;
pub mod record;
pub mod volume;

pub use credential::{CredentialProvider, MachineCredential};
pub use directory::{DirectoryConnector, DirectorySession};
pub use record::{EscrowRecord, RecoverySecret};
pub use volume::KeySlotManager;
