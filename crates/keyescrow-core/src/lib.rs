//! Core building blocks shared by keyescrow binaries.
//!
//! Configuration, secret generation, and the rotation workflow live here so the provider crates
//! only have to wrap their external tool.

pub mod command;
pub mod config;
pub mod error;
pub mod host;
pub mod keyfile;
pub mod logging;
pub mod retry;
pub mod rotation;
pub mod secret;

pub use config::{CredentialCfg, DirectoryCfg, KeyescrowConfig, RetryCfg, VolumeCfg};
pub use error::{ErrorKind, EscrowError, EscrowResult};
pub use keyescrow_provider::{
    CredentialProvider, DirectoryConnector, DirectorySession, EscrowRecord, KeySlotManager,
    MachineCredential, RecoverySecret,
};
pub use rotation::{
    RotationFailure, RotationOrchestrator, RotationReport, RotationRequest, RotationStage,
};
pub use secret::{generate_escrow_record, generate_secret, PlannedRecord};
