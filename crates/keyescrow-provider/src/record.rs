//! Recovery secrets and the escrow records that carry them into the directory.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Number of digit groups in a recovery secret.
pub const SECRET_GROUPS: usize = 8;
/// Number of decimal digits in each group.
pub const SECRET_GROUP_WIDTH: usize = 6;
/// Character placed between groups.
pub const SECRET_SEPARATOR: char = '-';
/// Number of decimal digits in a secret.
pub const SECRET_DIGITS: usize = SECRET_GROUPS * SECRET_GROUP_WIDTH;
/// Length of a formatted secret in bytes (48 digits + 7 separators).
pub const SECRET_LEN: usize = SECRET_DIGITS + SECRET_GROUPS - 1;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const NAME_OFFSET: &str = "-00:00";

/// Grouped-digit recovery secret, e.g. `123456-654321-...`.
///
/// The value is wiped from memory on drop and never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoverySecret(Zeroizing<String>);

impl RecoverySecret {
    /// Wrap `value` when it matches the grouped-digit format.
    pub fn parse(value: &str) -> Option<Self> {
        is_well_formed(value).then(|| Self(Zeroizing::new(value.to_string())))
    }

    /// Build a secret from its digit groups.
    ///
    /// Returns `None` unless exactly [`SECRET_GROUPS`] groups of [`SECRET_GROUP_WIDTH`] decimal
    /// digits are supplied.
    pub fn from_groups<S: AsRef<str>>(groups: &[S]) -> Option<Self> {
        let mut joined = Zeroizing::new(String::with_capacity(SECRET_LEN));
        for (idx, group) in groups.iter().enumerate() {
            if idx > 0 {
                joined.push(SECRET_SEPARATOR);
            }
            joined.push_str(group.as_ref());
        }
        Self::parse(&joined)
    }

    /// Format digit values (`0..=9`) into groups.
    ///
    /// Values above nine are reduced modulo ten.
    pub fn from_digits(digits: &[u8; SECRET_DIGITS]) -> Self {
        let mut formatted = Zeroizing::new(String::with_capacity(SECRET_LEN));
        for (idx, digit) in digits.iter().enumerate() {
            if idx > 0 && idx % SECRET_GROUP_WIDTH == 0 {
                formatted.push(SECRET_SEPARATOR);
            }
            formatted.push(char::from(b'0' + digit % 10));
        }
        Self(formatted)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for RecoverySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoverySecret(<redacted>)")
    }
}

fn is_well_formed(value: &str) -> bool {
    if value.len() != SECRET_LEN {
        return false;
    }
    let groups: Vec<&str> = value.split(SECRET_SEPARATOR).collect();
    groups.len() == SECRET_GROUPS
        && groups.iter().all(|group| {
            group.len() == SECRET_GROUP_WIDTH && group.bytes().all(|b| b.is_ascii_digit())
        })
}

/// One rotation event as stored in the directory.
#[derive(Debug, Clone)]
pub struct EscrowRecord {
    id: Uuid,
    created: DateTime<Utc>,
    secret: RecoverySecret,
    name: String,
}

impl EscrowRecord {
    /// Assemble a record; the display name is derived from `created` and `id`.
    ///
    /// Sub-second precision is dropped from `created`.
    pub fn new(id: Uuid, created: DateTime<Utc>, secret: RecoverySecret) -> Self {
        let created = truncate_to_seconds(created);
        let name = record_name(&created, &id);
        Self {
            id,
            created,
            secret,
            name,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn secret(&self) -> &RecoverySecret {
        &self.secret
    }

    /// Display name, `<timestamp>-00:00{<UUID>}`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identifier as the 16 bytes stored in the directory.
    ///
    /// Uses the mixed-endian GUID layout so directory tooling renders the same GUID that appears
    /// in [`EscrowRecord::name`].
    pub fn guid_bytes(&self) -> [u8; 16] {
        self.id.to_bytes_le()
    }
}

/// Split a record name back into its timestamp and identifier.
pub fn parse_record_name(name: &str) -> Option<(DateTime<Utc>, Uuid)> {
    let (timestamp, rest) = name.split_once(NAME_OFFSET)?;
    let guid = rest.strip_prefix('{')?.strip_suffix('}')?;
    let created = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    let id = Uuid::parse_str(guid).ok()?;
    Some((created, id))
}

fn record_name(created: &DateTime<Utc>, id: &Uuid) -> String {
    format!(
        "{}{NAME_OFFSET}{{{}}}",
        created.format(TIMESTAMP_FORMAT),
        id.hyphenated().to_string().to_ascii_uppercase()
    )
}

fn truncate_to_seconds(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(value.timestamp(), 0).unwrap_or(value)
}
