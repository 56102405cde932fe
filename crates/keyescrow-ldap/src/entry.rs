//! Search filters and attribute sets for escrow entries.

use keyescrow_core::error::{EscrowError, EscrowResult};
use keyescrow_provider::EscrowRecord;
use ldap3::ldap_escape;
use std::collections::HashSet;

/// Object class of stored recovery records.
pub const RECOVERY_OBJECT_CLASS: &str = "msFVE-RecoveryInformation";
const GUID_ATTRIBUTE: &str = "msFVE-RecoveryGuid";
const PASSWORD_ATTRIBUTE: &str = "msFVE-RecoveryPassword";

/// Filter matching the computer object whose `cn` is `hostname` (uppercased, escaped).
pub fn host_filter(hostname: &str) -> String {
    format!(
        "(&(objectClass=computer)(cn={}))",
        ldap_escape(&hostname.to_ascii_uppercase())
    )
}

/// Pick the single host DN out of a search result.
///
/// More than one match is treated like no match: escrowing under the wrong object is worse than
/// not escrowing at all.
pub fn select_host_dn(hostname: &str, base_dn: &str, mut dns: Vec<String>) -> EscrowResult<String> {
    match dns.len() {
        0 => Err(EscrowError::NotFound(format!(
            "no computer object named {hostname} under {base_dn}"
        ))),
        1 => Ok(dns.remove(0)),
        n => {
            dns.sort();
            Err(EscrowError::NotFound(format!(
                "{n} computer objects named {hostname} under {base_dn}: {}",
                dns.join("; ")
            )))
        }
    }
}

/// Attribute set for a new recovery entry.
pub fn record_attributes(record: &EscrowRecord) -> Vec<(Vec<u8>, HashSet<Vec<u8>>)> {
    vec![
        attribute("objectClass", RECOVERY_OBJECT_CLASS.as_bytes()),
        attribute("name", record.name().as_bytes()),
        attribute(GUID_ATTRIBUTE, &record.guid_bytes()),
        attribute(PASSWORD_ATTRIBUTE, record.secret().as_bytes()),
    ]
}

fn attribute(name: &str, value: &[u8]) -> (Vec<u8>, HashSet<Vec<u8>>) {
    (name.as_bytes().to_vec(), HashSet::from([value.to_vec()]))
}
