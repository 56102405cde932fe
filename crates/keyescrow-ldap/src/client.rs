//! Synchronous `ldap3` connector and session.

use crate::entry::{host_filter, record_attributes, select_host_dn};
use crate::env::EnvBinding;
use keyescrow_core::error::{ErrorKind, EscrowError, EscrowResult};
use keyescrow_core::KeyescrowConfig;
use keyescrow_provider::{DirectoryConnector, DirectorySession, EscrowRecord, MachineCredential};
use ldap3::{LdapConn, LdapConnSettings, LdapError, LdapResult, Scope, SearchEntry};
use log::{debug, info};
use std::io;
use std::time::Duration;
use url::Url;

/// Opens GSSAPI-authenticated LDAP sessions.
#[derive(Debug, Clone)]
pub struct LdapDirectory {
    timeout: Duration,
}

impl LdapDirectory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &KeyescrowConfig) -> Self {
        Self::new(config.directory_timeout())
    }
}

impl DirectoryConnector for LdapDirectory {
    type Error = EscrowError;
    type Session = LdapSession;

    fn connect(&self, url: &str, credential: &dyn MachineCredential) -> EscrowResult<LdapSession> {
        let host = gssapi_host(url)?;
        let binding = EnvBinding::bind(credential);

        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let mut conn = LdapConn::with_settings(settings, url)
            .map_err(|err| ldap_failure(err, self.timeout, EscrowError::DirectoryConnect))?;

        conn.with_timeout(self.timeout)
            .sasl_gssapi_bind(&host)
            .and_then(LdapResult::success)
            .map_err(|err| ldap_failure(err, self.timeout, EscrowError::DirectoryConnect))?;
        info!("bound to {url} as {}", credential.principal());

        Ok(LdapSession {
            conn,
            timeout: self.timeout,
            _binding: binding,
        })
    }
}

/// An authenticated session; the credential stays bound until it is closed or dropped.
pub struct LdapSession {
    conn: LdapConn,
    timeout: Duration,
    _binding: EnvBinding,
}

impl DirectorySession for LdapSession {
    type Error = EscrowError;

    fn find_host(&mut self, base_dn: &str, hostname: &str) -> EscrowResult<String> {
        let filter = host_filter(hostname);
        debug!("searching {base_dn} for {filter}");
        let (entries, _) = self
            .conn
            .with_timeout(self.timeout)
            .search(base_dn, Scope::Subtree, &filter, vec!["1.1"])
            .and_then(|result| result.success())
            .map_err(|err| ldap_failure(err, self.timeout, EscrowError::NotFound))?;

        let dns = entries
            .into_iter()
            .filter(|entry| !entry.is_ref())
            .map(|entry| SearchEntry::construct(entry).dn)
            .collect();
        select_host_dn(hostname, base_dn, dns)
    }

    fn add_escrow_record(&mut self, record_dn: &str, record: &EscrowRecord) -> EscrowResult<()> {
        self.conn
            .with_timeout(self.timeout)
            .add(record_dn, record_attributes(record))
            .and_then(LdapResult::success)
            .map_err(|err| ldap_failure(err, self.timeout, EscrowError::DirectoryWrite))?;
        Ok(())
    }

    fn close(mut self) -> EscrowResult<()> {
        self.conn
            .unbind()
            .map_err(|err| ldap_failure(err, self.timeout, EscrowError::DirectoryConnect))
    }
}

/// Host to request a service ticket for: the host named in the URL.
fn gssapi_host(url: &str) -> EscrowResult<String> {
    let parsed = Url::parse(url)
        .map_err(|err| EscrowError::DirectoryConnect(format!("invalid directory URL {url}: {err}")))?;
    parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .ok_or_else(|| EscrowError::DirectoryConnect(format!("directory URL {url} names no host")))
}

/// Split transport trouble (transient) from server rejections (reported as `rejected`).
fn ldap_failure(
    err: LdapError,
    timeout: Duration,
    rejected: fn(String) -> EscrowError,
) -> EscrowError {
    match err {
        LdapError::Io { source } => EscrowError::Io(io::Error::new(
            source.kind(),
            format!("directory transport error: {source}"),
        )),
        LdapError::EndOfStream => {
            EscrowError::Io(io::Error::other("directory closed the connection"))
        }
        LdapError::Timeout { .. } => EscrowError::Timeout {
            tool: "directory request".into(),
            after: timeout,
            kind: ErrorKind::Io,
        },
        LdapError::LdapResult { result } => rejected(describe_result(&result)),
        other => rejected(other.to_string()),
    }
}

fn describe_result(result: &LdapResult) -> String {
    let name = match result.rc {
        10 => "referral",
        32 => "noSuchObject",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        53 => "unwillingToPerform",
        64 => "namingViolation",
        65 => "objectClassViolation",
        68 => "entryAlreadyExists",
        _ => "ldap error",
    };
    let text = result.text.trim();
    if text.is_empty() {
        format!("{name} (rc={})", result.rc)
    } else {
        format!("{name} (rc={}): {text}", result.rc)
    }
}
