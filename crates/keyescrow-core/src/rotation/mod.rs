//! Rotate-then-escrow workflow.
//!
//! Ordering is what keeps the volume recoverable: the new key is installed before it is escrowed,
//! the original key is only retired after the escrow write succeeded, and nothing that was added
//! to the volume is ever removed to compensate for a later failure.

use crate::config::RetryCfg;
use crate::error::{ErrorKind, EscrowError, EscrowResult};
use crate::retry::with_backoff;
use crate::secret::{generate_escrow_record, PlannedRecord};
use keyescrow_provider::{
    CredentialProvider, DirectoryConnector, DirectorySession, KeySlotManager, MachineCredential,
};
use log::{debug, error, info, warn};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Workflow states, in the order a successful run reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStage {
    Init,
    CredentialAcquired,
    DirectoryConnected,
    HostResolved,
    SecretGenerated,
    KeyInstalled,
    Escrowed,
    CredentialReleased,
    OldKeyRemoved,
    Done,
}

impl fmt::Display for RotationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs for one rotation run.
pub struct RotationRequest {
    pub device: PathBuf,
    pub directory_url: String,
    pub search_base: String,
    pub keytab: PathBuf,
    pub principal: String,
    /// Directory name of this host (uppercased short name).
    pub hostname: String,
    pub existing_key: Zeroizing<Vec<u8>>,
    pub remove_original_key: bool,
}

impl fmt::Debug for RotationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationRequest")
            .field("device", &self.device)
            .field("directory_url", &self.directory_url)
            .field("search_base", &self.search_base)
            .field("keytab", &self.keytab)
            .field("principal", &self.principal)
            .field("hostname", &self.hostname)
            .field("existing_key", &"<redacted>")
            .field("remove_original_key", &self.remove_original_key)
            .finish()
    }
}

/// Summary of a run that reached `Done`.
#[derive(Debug, Clone)]
pub struct RotationReport {
    pub host_dn: String,
    pub record_dn: String,
    pub record_name: String,
    pub record_id: Uuid,
    pub original_key_removed: bool,
    pub stages: Vec<RotationStage>,
    /// Set when the credential cache could not be destroyed; the rotation itself succeeded.
    pub credential_release_error: Option<String>,
}

/// A run that stopped in `Failed`.
#[derive(Debug)]
pub struct RotationFailure {
    /// Last state reached.
    pub from: RotationStage,
    /// State the workflow was trying to reach.
    pub to: RotationStage,
    pub error: EscrowError,
    /// The new key is, or may be, on the volume but is not in the directory (original key still
    /// valid).
    pub unescrowed_key_installed: bool,
    pub stages: Vec<RotationStage>,
    pub credential_release_error: Option<String>,
}

impl RotationFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for RotationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.from, self.to, self.error)
    }
}

impl std::error::Error for RotationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Sequences credential, directory, and volume providers into one rotation.
#[derive(Debug)]
pub struct RotationOrchestrator<C, D, K> {
    credentials: C,
    directory: D,
    key_slots: K,
    retry: RetryCfg,
}

impl<C, D, K> RotationOrchestrator<C, D, K>
where
    C: CredentialProvider<Error = EscrowError>,
    D: DirectoryConnector<Error = EscrowError>,
    K: KeySlotManager<Error = EscrowError>,
{
    pub fn new(credentials: C, directory: D, key_slots: K) -> Self {
        Self {
            credentials,
            directory,
            key_slots,
            retry: RetryCfg::default(),
        }
    }

    /// Replace the backoff used around directory connect and write.
    pub fn with_retry(mut self, retry: RetryCfg) -> Self {
        self.retry = retry;
        self
    }

    pub fn key_slots(&self) -> &K {
        &self.key_slots
    }

    /// Reject requests that cannot succeed, before anything external is touched.
    pub fn preflight(&self, request: &RotationRequest) -> EscrowResult<()> {
        for (name, value) in [
            ("directory URL", request.directory_url.as_str()),
            ("search base", request.search_base.as_str()),
            ("principal", request.principal.as_str()),
            ("hostname", request.hostname.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(EscrowError::Validation(format!("{name} must not be empty")));
            }
        }
        if request.existing_key.is_empty() {
            return Err(EscrowError::Validation(
                "existing unlock key must not be empty".into(),
            ));
        }

        let device = request.device.display();
        match self.key_slots.validate(&request.device) {
            Ok(true) => Ok(()),
            Ok(false) => Err(EscrowError::Validation(format!(
                "{device} is not an encrypted volume"
            ))),
            Err(EscrowError::Validation(message)) => Err(EscrowError::Validation(message)),
            Err(err) => Err(EscrowError::Validation(format!(
                "unable to validate {device}: {err}"
            ))),
        }
    }

    /// Run the full workflow.
    ///
    /// A failure before `SecretGenerated -> KeyInstalled` leaves the volume untouched. From that
    /// transition on, the new key may sit next to the original one; it is never rolled back.
    pub fn rotate(&self, request: &RotationRequest) -> Result<RotationReport, RotationFailure> {
        let mut progress = Progress::default();
        info!(
            "starting key rotation for {} (host {}, device {})",
            request.principal,
            request.hostname,
            request.device.display()
        );

        self.preflight(request)
            .map_err(|err| progress.fail(RotationStage::CredentialAcquired, err))?;

        let credential = self
            .credentials
            .acquire(&request.keytab, &request.principal)
            .map_err(|err| {
                progress.fail(
                    RotationStage::CredentialAcquired,
                    err.into_kind(ErrorKind::Credential),
                )
            })?;
        progress.reach(RotationStage::CredentialAcquired);

        let outcome = self.escrow_phase(request, &credential, &mut progress);

        let credential_release_error = match self.credentials.release(credential) {
            Ok(()) => {
                if outcome.is_ok() {
                    progress.reach(RotationStage::CredentialReleased);
                }
                None
            }
            Err(err) => {
                warn!("failed to destroy machine credential cache: {err}");
                Some(err.to_string())
            }
        };

        let (host_dn, planned) = match outcome {
            Ok(done) => done,
            Err(mut failure) => {
                failure.credential_release_error = credential_release_error;
                report_failure(&failure);
                return Err(failure);
            }
        };

        let mut original_key_removed = false;
        if request.remove_original_key {
            self.key_slots
                .remove_key(&request.device, &request.existing_key)
                .map_err(|err| {
                    let mut failure = progress.fail(
                        RotationStage::OldKeyRemoved,
                        err.into_kind(ErrorKind::KeySlot),
                    );
                    failure.credential_release_error = credential_release_error.clone();
                    report_failure(&failure);
                    failure
                })?;
            original_key_removed = true;
            progress.reach(RotationStage::OldKeyRemoved);
        }

        progress.reach(RotationStage::Done);
        Ok(RotationReport {
            host_dn,
            record_dn: planned.record_dn,
            record_name: planned.record.name().to_string(),
            record_id: planned.record.id(),
            original_key_removed,
            stages: progress.stages,
            credential_release_error,
        })
    }

    fn escrow_phase(
        &self,
        request: &RotationRequest,
        credential: &C::Credential,
        progress: &mut Progress,
    ) -> Result<(String, PlannedRecord), RotationFailure> {
        let mut session = with_backoff(&self.retry, "directory connect", |_| {
            self.directory
                .connect(&request.directory_url, credential as &dyn MachineCredential)
        })
        .map_err(|err| {
            progress.fail(
                RotationStage::DirectoryConnected,
                err.into_kind(ErrorKind::DirectoryConnect),
            )
        })?;
        progress.reach(RotationStage::DirectoryConnected);

        let (host_dn, planned) = match self.install_key(request, &mut session, progress) {
            Ok(installed) => installed,
            Err(failure) => {
                close_session(session);
                return Err(failure);
            }
        };

        let mut live = Some(session);
        let written = self.write_record(request, credential, &planned, &mut live);
        if let Some(session) = live {
            close_session(session);
        }
        written.map_err(|err| {
            progress.fail(
                RotationStage::Escrowed,
                err.into_kind(ErrorKind::DirectoryWrite),
            )
        })?;
        progress.reach(RotationStage::Escrowed);
        info!("escrowed recovery record {}", planned.record_dn);

        Ok((host_dn, planned))
    }

    fn install_key(
        &self,
        request: &RotationRequest,
        session: &mut D::Session,
        progress: &mut Progress,
    ) -> Result<(String, PlannedRecord), RotationFailure> {
        let host_dn = session
            .find_host(&request.search_base, &request.hostname)
            .map_err(|err| {
                progress.fail(RotationStage::HostResolved, err.into_kind(ErrorKind::NotFound))
            })?;
        progress.reach(RotationStage::HostResolved);
        info!("resolved host object {host_dn}");

        let planned = generate_escrow_record(&host_dn);
        progress.reach(RotationStage::SecretGenerated);

        self.key_slots
            .add_key(
                &request.device,
                &request.existing_key,
                planned.record.secret().as_bytes(),
            )
            .map_err(|err| {
                let key_on_volume = err.key_may_be_installed();
                let mut failure =
                    progress.fail(RotationStage::KeyInstalled, err.into_kind(ErrorKind::KeySlot));
                failure.unescrowed_key_installed |= key_on_volume;
                failure
            })?;
        progress.reach(RotationStage::KeyInstalled);

        Ok((host_dn, planned))
    }

    /// Write the record, reopening the session when a transport failure left it unusable.
    fn write_record(
        &self,
        request: &RotationRequest,
        credential: &C::Credential,
        planned: &PlannedRecord,
        live: &mut Option<D::Session>,
    ) -> EscrowResult<()> {
        with_backoff(&self.retry, "escrow record write", |attempt| {
            let session = match live.take() {
                Some(session) => session,
                None => {
                    debug!("reconnecting to {} for write attempt {attempt}", request.directory_url);
                    self.directory
                        .connect(&request.directory_url, credential as &dyn MachineCredential)?
                }
            };
            let session = live.insert(session);
            let result = session.add_escrow_record(&planned.record_dn, &planned.record);
            if matches!(&result, Err(err) if err.is_transient()) {
                if let Some(stale) = live.take() {
                    close_session(stale);
                }
            }
            result
        })
    }
}

fn close_session<S: DirectorySession<Error = EscrowError>>(session: S) {
    if let Err(err) = session.close() {
        warn!("directory session did not close cleanly: {err}");
    }
}

fn report_failure(failure: &RotationFailure) {
    error!("key rotation failed at {failure}");
    if failure.unescrowed_key_installed {
        warn!(
            "the new recovery key is installed on the volume but was not escrowed; \
             the original key is still valid and must not be discarded"
        );
    }
}

#[derive(Debug)]
struct Progress {
    stages: Vec<RotationStage>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            stages: vec![RotationStage::Init],
        }
    }
}

impl Progress {
    fn current(&self) -> RotationStage {
        self.stages
            .last()
            .copied()
            .unwrap_or(RotationStage::Init)
    }

    fn reach(&mut self, stage: RotationStage) {
        info!("rotation: {} -> {stage}", self.current());
        self.stages.push(stage);
    }

    fn fail(&self, to: RotationStage, error: EscrowError) -> RotationFailure {
        let installed = self.stages.contains(&RotationStage::KeyInstalled);
        let escrowed = self.stages.contains(&RotationStage::Escrowed);
        RotationFailure {
            from: self.current(),
            to,
            error,
            unescrowed_key_installed: installed && !escrowed,
            stages: self.stages.clone(),
            credential_release_error: None,
        }
    }
}

#[cfg(test)]
mod tests;
