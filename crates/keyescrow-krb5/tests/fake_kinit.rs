use keyescrow_core::error::{ErrorKind, EscrowResult};
use keyescrow_krb5::KinitCredentialProvider;
use keyescrow_provider::{CredentialProvider, MachineCredential};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use testresult::TestResult;

fn write_executable(path: &Path, contents: &str) -> EscrowResult<()> {
    fs::write(path, contents)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

struct Fixture {
    tmp: TempDir,
    keytab: PathBuf,
    cache_root: PathBuf,
    log: PathBuf,
}

impl Fixture {
    /// `kinit_body` runs after the invocation has been logged.
    fn new(kinit_body: &str, kdestroy_body: &str) -> EscrowResult<Self> {
        let tmp = tempdir()?;
        let keytab = tmp.path().join("krb5.keytab");
        fs::write(&keytab, b"\x05\x02fake-keytab")?;
        let cache_root = tmp.path().join("run");
        fs::create_dir_all(&cache_root)?;
        let log = tmp.path().join("calls.log");

        write_executable(
            &tmp.path().join("kinit"),
            &format!(
                "#!/bin/sh\necho \"kinit $* ccname=$KRB5CCNAME\" >> \"{log}\"\n{kinit_body}\n",
                log = log.display()
            ),
        )?;
        write_executable(
            &tmp.path().join("kdestroy"),
            &format!(
                "#!/bin/sh\necho \"kdestroy $* ccname=$KRB5CCNAME\" >> \"{log}\"\n{kdestroy_body}\n",
                log = log.display()
            ),
        )?;

        Ok(Self {
            tmp,
            keytab,
            cache_root,
            log,
        })
    }

    fn provider(&self) -> KinitCredentialProvider {
        KinitCredentialProvider::new(
            self.tmp.path().join("kinit"),
            Some(self.tmp.path().join("kdestroy")),
            Duration::from_secs(10),
        )
        .with_cache_root(&self.cache_root)
    }

    fn log(&self) -> String {
        fs::read_to_string(&self.log).unwrap_or_default()
    }

    fn leftover_caches(&self) -> EscrowResult<usize> {
        Ok(fs::read_dir(&self.cache_root)?.count())
    }
}

const WRITE_CACHE: &str = r#"cache="$5"; echo ticket > "${cache#FILE:}"; exit 0"#;
const REMOVE_CACHE: &str = r#"cache="$2"; rm -f "${cache#FILE:}"; exit 0"#;

#[test]
fn acquire_uses_private_cache_and_release_cleans_up() -> TestResult {
    let fixture = Fixture::new(WRITE_CACHE, REMOVE_CACHE)?;
    let provider = fixture.provider();

    let credential = provider.acquire(&fixture.keytab, "WS-042$")?;
    let cache_name = credential.cache_name().to_string();
    let cache_file = PathBuf::from(cache_name.trim_start_matches("FILE:"));
    assert!(cache_name.starts_with("FILE:"));
    assert!(cache_file.starts_with(&fixture.cache_root));
    assert!(cache_file.exists());
    assert_eq!(credential.principal(), "WS-042$");
    assert_eq!(credential.keytab(), fixture.keytab.as_path());

    let mode = fs::metadata(credential.directory())?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o700);

    let log = fixture.log();
    assert!(log.contains(&format!(
        "kinit -k -t {} -c {cache_name} WS-042$ ccname={cache_name}",
        fixture.keytab.display()
    )));

    provider.release(credential)?;
    assert!(fixture.log().contains(&format!("kdestroy -c {cache_name}")));
    assert_eq!(fixture.leftover_caches()?, 0);
    Ok(())
}

#[test]
fn missing_keytab_fails_before_kinit() -> TestResult {
    let fixture = Fixture::new(WRITE_CACHE, REMOVE_CACHE)?;
    let err = fixture
        .provider()
        .acquire(&fixture.tmp.path().join("absent.keytab"), "WS-042$")
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Credential);
    assert!(fixture.log().is_empty());
    assert_eq!(fixture.leftover_caches()?, 0);
    Ok(())
}

#[test]
fn rejected_principal_leaves_nothing_behind() -> TestResult {
    let fixture = Fixture::new(
        "echo 'kinit: Client not found in Kerberos database' >&2; exit 1",
        REMOVE_CACHE,
    )?;
    let err = fixture
        .provider()
        .acquire(&fixture.keytab, "WS-042$")
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Credential);
    assert!(err.to_string().contains("machine account exists"));
    assert_eq!(fixture.leftover_caches()?, 0);
    Ok(())
}

#[test]
fn hanging_kinit_is_a_credential_timeout() -> TestResult {
    let fixture = Fixture::new("sleep 5", REMOVE_CACHE)?;
    let provider = KinitCredentialProvider::new(
        fixture.tmp.path().join("kinit"),
        None,
        Duration::from_millis(200),
    )
    .with_cache_root(&fixture.cache_root);

    let err = provider.acquire(&fixture.keytab, "WS-042$").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credential);
    assert_eq!(fixture.leftover_caches()?, 0);
    Ok(())
}

#[test]
fn kdestroy_failure_is_not_fatal() -> TestResult {
    let fixture = Fixture::new(WRITE_CACHE, "echo 'kdestroy: No credentials cache found' >&2; exit 1")?;
    let provider = fixture.provider();
    let credential = provider.acquire(&fixture.keytab, "WS-042$")?;

    provider.release(credential)?;
    assert_eq!(fixture.leftover_caches()?, 0);
    Ok(())
}

#[test]
fn release_reports_directory_removal_failure() -> TestResult {
    let fixture = Fixture::new(
        WRITE_CACHE,
        r#"cache="$2"; rm -rf "$(dirname "${cache#FILE:}")"; exit 0"#,
    )?;
    let provider = fixture.provider();
    let credential = provider.acquire(&fixture.keytab, "WS-042$")?;

    let err = provider.release(credential).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credential);
    assert!(err.to_string().contains("unable to remove ticket cache directory"));
    Ok(())
}
