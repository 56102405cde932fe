use super::*;
use crate::error::EscrowResult;
use keyescrow_provider::EscrowRecord;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HOST_DN: &str = "CN=WS-042,OU=Workstations,DC=corp,DC=example,DC=com";
const ORIGINAL_KEY: &[u8] = b"correct horse battery staple";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Validate,
    Acquire,
    Connect(String),
    FindHost(String),
    AddKey,
    Write(String),
    Close,
    Release,
    RemoveKey,
}

/// Shared state standing in for the volume header, the KDC, and the directory.
#[derive(Default)]
struct World {
    calls: Vec<Call>,
    is_luks: bool,
    slots: Vec<Vec<u8>>,
    hosts: Vec<(String, String)>,
    records: Vec<(String, String)>,
    acquire_error: Option<EscrowError>,
    release_error: Option<EscrowError>,
    connect_errors: Vec<EscrowError>,
    write_errors: Vec<EscrowError>,
    add_key_error: Option<EscrowError>,
    /// Fail after the new key has already landed in a slot.
    add_key_late_error: Option<EscrowError>,
    remove_error: Option<EscrowError>,
}

type Shared = Arc<Mutex<World>>;

fn world() -> Shared {
    Arc::new(Mutex::new(World {
        is_luks: true,
        slots: vec![ORIGINAL_KEY.to_vec()],
        hosts: vec![("WS-042".into(), HOST_DN.into())],
        ..World::default()
    }))
}

fn record(shared: &Shared, call: Call) {
    shared.lock().unwrap().calls.push(call);
}

struct FakeCredential {
    cache: String,
    keytab: PathBuf,
    principal: String,
}

impl MachineCredential for FakeCredential {
    fn cache_name(&self) -> &str {
        &self.cache
    }

    fn keytab(&self) -> &Path {
        &self.keytab
    }

    fn principal(&self) -> &str {
        &self.principal
    }
}

struct FakeKerberos(Shared);

impl CredentialProvider for FakeKerberos {
    type Error = EscrowError;
    type Credential = FakeCredential;

    fn acquire(&self, keytab: &Path, principal: &str) -> EscrowResult<FakeCredential> {
        record(&self.0, Call::Acquire);
        if let Some(err) = self.0.lock().unwrap().acquire_error.take() {
            return Err(err);
        }
        Ok(FakeCredential {
            cache: "FILE:/run/keyescrow-test/krb5cc".into(),
            keytab: keytab.to_path_buf(),
            principal: principal.to_string(),
        })
    }

    fn release(&self, _credential: FakeCredential) -> EscrowResult<()> {
        record(&self.0, Call::Release);
        match self.0.lock().unwrap().release_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct FakeDirectory(Shared);

struct FakeSession(Shared);

impl DirectoryConnector for FakeDirectory {
    type Error = EscrowError;
    type Session = FakeSession;

    fn connect(&self, _url: &str, credential: &dyn MachineCredential) -> EscrowResult<FakeSession> {
        record(&self.0, Call::Connect(credential.cache_name().to_string()));
        let mut world = self.0.lock().unwrap();
        if !world.connect_errors.is_empty() {
            return Err(world.connect_errors.remove(0));
        }
        Ok(FakeSession(self.0.clone()))
    }
}

impl DirectorySession for FakeSession {
    type Error = EscrowError;

    fn find_host(&mut self, _base_dn: &str, hostname: &str) -> EscrowResult<String> {
        record(&self.0, Call::FindHost(hostname.to_string()));
        let world = self.0.lock().unwrap();
        let matches: Vec<&String> = world
            .hosts
            .iter()
            .filter(|(name, _)| name == hostname)
            .map(|(_, dn)| dn)
            .collect();
        match matches.as_slice() {
            [dn] => Ok((*dn).clone()),
            [] => Err(EscrowError::NotFound(format!("no computer object for {hostname}"))),
            _ => Err(EscrowError::NotFound(format!(
                "{} computer objects match {hostname}",
                matches.len()
            ))),
        }
    }

    fn add_escrow_record(&mut self, record_dn: &str, entry: &EscrowRecord) -> EscrowResult<()> {
        record(&self.0, Call::Write(record_dn.to_string()));
        let mut world = self.0.lock().unwrap();
        if !world.write_errors.is_empty() {
            return Err(world.write_errors.remove(0));
        }
        world
            .records
            .push((record_dn.to_string(), entry.secret().as_str().to_string()));
        Ok(())
    }

    fn close(self) -> EscrowResult<()> {
        record(&self.0, Call::Close);
        Ok(())
    }
}

struct FakeVolume(Shared);

impl KeySlotManager for FakeVolume {
    type Error = EscrowError;

    fn validate(&self, _device: &Path) -> EscrowResult<bool> {
        record(&self.0, Call::Validate);
        Ok(self.0.lock().unwrap().is_luks)
    }

    fn add_key(&self, _device: &Path, existing_key: &[u8], new_key: &[u8]) -> EscrowResult<()> {
        record(&self.0, Call::AddKey);
        let mut world = self.0.lock().unwrap();
        if let Some(err) = world.add_key_error.take() {
            return Err(err);
        }
        if !world.slots.iter().any(|slot| slot == existing_key) {
            return Err(EscrowError::KeySlot("no key available with this passphrase".into()));
        }
        world.slots.push(new_key.to_vec());
        match world.add_key_late_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn remove_key(&self, _device: &Path, key: &[u8]) -> EscrowResult<()> {
        record(&self.0, Call::RemoveKey);
        let mut world = self.0.lock().unwrap();
        if let Some(err) = world.remove_error.take() {
            return Err(err);
        }
        if world.slots.len() <= 1 {
            return Err(EscrowError::KeySlot("refusing to remove the last key slot".into()));
        }
        let before = world.slots.len();
        world.slots.retain(|slot| slot != key);
        if world.slots.len() == before {
            return Err(EscrowError::KeySlot("no key available with this passphrase".into()));
        }
        Ok(())
    }
}

type Orchestrator = RotationOrchestrator<FakeKerberos, FakeDirectory, FakeVolume>;

fn orchestrator(shared: &Shared) -> Orchestrator {
    RotationOrchestrator::new(
        FakeKerberos(shared.clone()),
        FakeDirectory(shared.clone()),
        FakeVolume(shared.clone()),
    )
    .with_retry(RetryCfg {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
        jitter_ratio: 0.0,
    })
}

fn request(remove_original_key: bool) -> RotationRequest {
    RotationRequest {
        device: PathBuf::from("/dev/disk/by-uuid/test"),
        directory_url: "ldap://dc01.corp.example.com".into(),
        search_base: "DC=corp,DC=example,DC=com".into(),
        keytab: PathBuf::from("/etc/krb5.keytab"),
        principal: "WS-042$".into(),
        hostname: "WS-042".into(),
        existing_key: Zeroizing::new(ORIGINAL_KEY.to_vec()),
        remove_original_key,
    }
}

fn calls(shared: &Shared) -> Vec<Call> {
    shared.lock().unwrap().calls.clone()
}

fn count(shared: &Shared, call: &Call) -> usize {
    calls(shared).iter().filter(|c| *c == call).count()
}

fn position(shared: &Shared, wanted: fn(&Call) -> bool) -> Option<usize> {
    calls(shared).iter().position(wanted)
}

#[test]
fn rotation_without_removal_keeps_both_keys() {
    let shared = world();
    let report = orchestrator(&shared).rotate(&request(false)).unwrap();

    assert_eq!(report.host_dn, HOST_DN);
    assert!(!report.original_key_removed);
    assert_eq!(
        report.stages,
        vec![
            RotationStage::Init,
            RotationStage::CredentialAcquired,
            RotationStage::DirectoryConnected,
            RotationStage::HostResolved,
            RotationStage::SecretGenerated,
            RotationStage::KeyInstalled,
            RotationStage::Escrowed,
            RotationStage::CredentialReleased,
            RotationStage::Done,
        ]
    );

    let world = shared.lock().unwrap();
    assert_eq!(world.records.len(), 1);
    let (dn, secret) = &world.records[0];
    assert_eq!(dn, &report.record_dn);
    assert!(dn.ends_with(&format!(",{HOST_DN}")));
    assert!(report.record_name.ends_with(&format!(
        "{{{}}}",
        report.record_id.hyphenated().to_string().to_uppercase()
    )));
    assert_eq!(world.slots.len(), 2);
    assert_eq!(world.slots[0], ORIGINAL_KEY);
    assert_eq!(world.slots[1], secret.as_bytes());
}

#[test]
fn rotation_with_removal_retires_original_after_escrow() {
    let shared = world();
    let report = orchestrator(&shared).rotate(&request(true)).unwrap();

    assert!(report.original_key_removed);
    assert_eq!(
        &report.stages[report.stages.len() - 3..],
        &[
            RotationStage::CredentialReleased,
            RotationStage::OldKeyRemoved,
            RotationStage::Done
        ]
    );
    assert_eq!(count(&shared, &Call::RemoveKey), 1);

    let write = position(&shared, |c| matches!(c, Call::Write(_))).unwrap();
    let release = position(&shared, |c| *c == Call::Release).unwrap();
    let remove = position(&shared, |c| *c == Call::RemoveKey).unwrap();
    assert!(write < remove);
    assert!(release < remove);

    let world = shared.lock().unwrap();
    assert_eq!(world.slots.len(), 1);
    assert_eq!(world.slots[0], world.records[0].1.as_bytes());
}

#[test]
fn workflow_calls_happen_in_order() {
    let shared = world();
    orchestrator(&shared).rotate(&request(false)).unwrap();
    let calls = calls(&shared);
    assert_eq!(calls[0], Call::Validate);
    assert_eq!(calls[1], Call::Acquire);
    assert_eq!(calls[2], Call::Connect("FILE:/run/keyescrow-test/krb5cc".into()));
    assert_eq!(calls[3], Call::FindHost("WS-042".into()));
    assert_eq!(calls[4], Call::AddKey);
    assert!(matches!(calls[5], Call::Write(_)));
    assert_eq!(calls[6..], [Call::Close, Call::Release]);
}

#[test]
fn invalid_device_stops_before_credentials() {
    let shared = world();
    shared.lock().unwrap().is_luks = false;
    let failure = orchestrator(&shared).rotate(&request(true)).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::Validation);
    assert_eq!(failure.from, RotationStage::Init);
    assert_eq!(calls(&shared), vec![Call::Validate]);
    assert!(!failure.unescrowed_key_installed);
}

#[test]
fn empty_existing_key_is_rejected_up_front() {
    let shared = world();
    let mut req = request(false);
    req.existing_key = Zeroizing::new(Vec::new());
    let failure = orchestrator(&shared).rotate(&req).unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Validation);
    assert!(calls(&shared).is_empty());
}

#[test]
fn credential_failure_touches_nothing_else() {
    let shared = world();
    shared.lock().unwrap().acquire_error = Some(EscrowError::Timeout {
        tool: "kinit".into(),
        after: Duration::from_secs(1),
        kind: ErrorKind::Io,
    });
    let failure = orchestrator(&shared).rotate(&request(true)).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::Credential);
    assert_eq!(
        (failure.from, failure.to),
        (RotationStage::Init, RotationStage::CredentialAcquired)
    );
    assert_eq!(calls(&shared), vec![Call::Validate, Call::Acquire]);
}

#[test]
fn unreachable_directory_is_retried_then_reported() {
    let shared = world();
    shared.lock().unwrap().connect_errors = (0..3)
        .map(|_| EscrowError::Io(std::io::Error::other("connection refused")))
        .collect();
    let failure = orchestrator(&shared).rotate(&request(false)).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::DirectoryConnect);
    assert_eq!(failure.to, RotationStage::DirectoryConnected);
    let connects = calls(&shared)
        .iter()
        .filter(|c| matches!(c, Call::Connect(_)))
        .count();
    assert_eq!(connects, 3);
    assert_eq!(count(&shared, &Call::Release), 1);
    assert_eq!(count(&shared, &Call::AddKey), 0);
}

#[test]
fn transient_connect_failure_recovers() {
    let shared = world();
    shared.lock().unwrap().connect_errors =
        vec![EscrowError::Io(std::io::Error::other("connection reset"))];
    let report = orchestrator(&shared).rotate(&request(false)).unwrap();
    assert_eq!(report.stages.last(), Some(&RotationStage::Done));
}

#[test]
fn missing_host_fails_without_touching_the_volume() {
    let shared = world();
    shared.lock().unwrap().hosts.clear();
    let failure = orchestrator(&shared).rotate(&request(true)).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::NotFound);
    assert_eq!(
        (failure.from, failure.to),
        (RotationStage::DirectoryConnected, RotationStage::HostResolved)
    );
    assert_eq!(count(&shared, &Call::AddKey), 0);
    assert_eq!(count(&shared, &Call::Close), 1);
    assert_eq!(count(&shared, &Call::Release), 1);
    assert_eq!(shared.lock().unwrap().slots, vec![ORIGINAL_KEY.to_vec()]);
}

#[test]
fn ambiguous_host_fails_closed() {
    let shared = world();
    shared
        .lock()
        .unwrap()
        .hosts
        .push(("WS-042".into(), "CN=WS-042,OU=Stale,DC=corp,DC=example,DC=com".into()));
    let failure = orchestrator(&shared).rotate(&request(false)).unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::NotFound);
    assert_eq!(count(&shared, &Call::AddKey), 0);
}

#[test]
fn add_key_failure_skips_escrow_and_removal() {
    let shared = world();
    shared.lock().unwrap().add_key_error =
        Some(EscrowError::KeySlot("No key available with this passphrase.".into()));
    let failure = orchestrator(&shared).rotate(&request(true)).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::KeySlot);
    assert_eq!(
        (failure.from, failure.to),
        (RotationStage::SecretGenerated, RotationStage::KeyInstalled)
    );
    assert!(failure
        .to_string()
        .starts_with("SecretGenerated -> KeyInstalled: "));
    assert!(!failure.unescrowed_key_installed);
    assert!(position(&shared, |c| matches!(c, Call::Write(_))).is_none());
    assert_eq!(count(&shared, &Call::RemoveKey), 0);
    assert_eq!(count(&shared, &Call::Release), 1);
}

#[test]
fn key_left_on_volume_by_failed_add_is_flagged() {
    let shared = world();
    shared.lock().unwrap().add_key_late_error = Some(EscrowError::KeyPossiblyInstalled(Box::new(
        EscrowError::Timeout {
            tool: "cryptsetup".into(),
            after: Duration::from_secs(30),
            kind: ErrorKind::KeySlot,
        },
    )));
    let failure = orchestrator(&shared).rotate(&request(true)).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::KeySlot);
    assert_eq!(
        (failure.from, failure.to),
        (RotationStage::SecretGenerated, RotationStage::KeyInstalled)
    );
    assert!(failure.unescrowed_key_installed);
    assert!(position(&shared, |c| matches!(c, Call::Write(_))).is_none());
    assert_eq!(count(&shared, &Call::RemoveKey), 0);

    let world = shared.lock().unwrap();
    assert_eq!(world.slots.len(), 2);
    assert_eq!(world.slots[0], ORIGINAL_KEY);
}

#[test]
fn escrow_failure_keeps_original_and_new_key() {
    let shared = world();
    shared.lock().unwrap().write_errors =
        vec![EscrowError::DirectoryWrite("insufficientAccessRights".into())];
    let failure = orchestrator(&shared).rotate(&request(true)).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::DirectoryWrite);
    assert_eq!(
        (failure.from, failure.to),
        (RotationStage::KeyInstalled, RotationStage::Escrowed)
    );
    assert!(failure.unescrowed_key_installed);
    assert_eq!(count(&shared, &Call::RemoveKey), 0);
    assert_eq!(count(&shared, &Call::Release), 1);

    let world = shared.lock().unwrap();
    assert!(world.records.is_empty());
    assert_eq!(world.slots.len(), 2);
    assert_eq!(world.slots[0], ORIGINAL_KEY);
}

#[test]
fn escrow_write_rejection_is_not_retried() {
    let shared = world();
    shared.lock().unwrap().write_errors =
        vec![EscrowError::DirectoryWrite("entryAlreadyExists".into())];
    orchestrator(&shared).rotate(&request(false)).unwrap_err();
    let writes = calls(&shared)
        .iter()
        .filter(|c| matches!(c, Call::Write(_)))
        .count();
    assert_eq!(writes, 1);
}

#[test]
fn escrow_write_timeout_is_retried_once_more() {
    let shared = world();
    shared.lock().unwrap().write_errors = vec![EscrowError::Timeout {
        tool: "ldap".into(),
        after: Duration::from_secs(30),
        kind: ErrorKind::Io,
    }];
    let report = orchestrator(&shared).rotate(&request(false)).unwrap();
    assert_eq!(report.stages.last(), Some(&RotationStage::Done));
    assert_eq!(shared.lock().unwrap().records.len(), 1);
}

#[test]
fn dropped_connection_is_reopened_for_the_write_retry() {
    let shared = world();
    shared.lock().unwrap().write_errors =
        vec![EscrowError::Io(std::io::Error::other("connection reset by peer"))];
    let report = orchestrator(&shared).rotate(&request(false)).unwrap();

    assert_eq!(report.stages.last(), Some(&RotationStage::Done));
    let connects = calls(&shared)
        .iter()
        .filter(|c| matches!(c, Call::Connect(_)))
        .count();
    assert_eq!(connects, 2);
    assert_eq!(count(&shared, &Call::Close), 2);

    let calls = calls(&shared);
    let first_write = position(&shared, |c| matches!(c, Call::Write(_))).unwrap();
    assert_eq!(calls[first_write + 1], Call::Close);
    assert!(matches!(calls[first_write + 2], Call::Connect(_)));
    assert!(matches!(calls[first_write + 3], Call::Write(_)));
    assert_eq!(shared.lock().unwrap().records.len(), 1);
}

#[test]
fn credential_release_failure_does_not_fail_rotation() {
    let shared = world();
    shared.lock().unwrap().release_error =
        Some(EscrowError::Credential("unable to remove cache directory".into()));
    let report = orchestrator(&shared).rotate(&request(true)).unwrap();

    assert!(report.credential_release_error.is_some());
    assert!(report.original_key_removed);
    assert!(!report.stages.contains(&RotationStage::CredentialReleased));
    assert_eq!(count(&shared, &Call::Release), 1);
}

#[test]
fn release_error_is_attached_to_an_earlier_failure() {
    let shared = world();
    {
        let mut world = shared.lock().unwrap();
        world.hosts.clear();
        world.release_error = Some(EscrowError::Credential("cache busy".into()));
    }
    let failure = orchestrator(&shared).rotate(&request(false)).unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::NotFound);
    assert!(failure
        .credential_release_error
        .as_deref()
        .is_some_and(|msg| msg.contains("cache busy")));
}

#[test]
fn remove_failure_is_reported_after_escrow() {
    let shared = world();
    shared.lock().unwrap().remove_error =
        Some(EscrowError::KeySlot("device is busy".into()));
    let failure = orchestrator(&shared).rotate(&request(true)).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::KeySlot);
    assert_eq!(
        (failure.from, failure.to),
        (RotationStage::CredentialReleased, RotationStage::OldKeyRemoved)
    );
    assert!(!failure.unescrowed_key_installed);

    let world = shared.lock().unwrap();
    assert_eq!(world.records.len(), 1);
    assert_eq!(world.slots.len(), 2);
}

#[test]
fn request_debug_hides_the_existing_key() {
    let rendered = format!("{:?}", request(false));
    assert!(!rendered.contains("horse"));
    assert!(rendered.contains("<redacted>"));
}
