//! Recovery secret generation and escrow record construction.

use chrono::Utc;
use keyescrow_provider::record::SECRET_DIGITS;
use keyescrow_provider::{EscrowRecord, RecoverySecret};
use rand::rngs::OsRng;
use rand::Rng;
use uuid::Uuid;
use zeroize::Zeroizing;

/// An escrow record together with the directory name it will be written under.
#[derive(Debug, Clone)]
pub struct PlannedRecord {
    pub record_dn: String,
    pub record: EscrowRecord,
}

/// Generate a new recovery secret.
///
/// Every digit is drawn independently and uniformly from the operating system CSPRNG.
pub fn generate_secret() -> RecoverySecret {
    let mut rng = OsRng;
    let mut digits = Zeroizing::new([0u8; SECRET_DIGITS]);
    for digit in digits.iter_mut() {
        *digit = rng.gen_range(0..10);
    }
    RecoverySecret::from_digits(&digits)
}

/// Build a fresh escrow record to be stored beneath `host_dn`.
pub fn generate_escrow_record(host_dn: &str) -> PlannedRecord {
    let record = EscrowRecord::new(Uuid::new_v4(), Utc::now(), generate_secret());
    let record_dn = format!("CN={},{}", escape_rdn_value(record.name()), host_dn);
    PlannedRecord { record_dn, record }
}

/// Escape an attribute value for use inside an RDN (RFC 4514, section 2.4).
pub fn escape_rdn_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (idx, ch) in value.chars().enumerate() {
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            '#' if idx == 0 => escaped.push_str("\\#"),
            ' ' if idx == 0 || idx == last => escaped.push_str("\\ "),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
