#![forbid(unsafe_code)]

//! Directory client for escrow records, built on `ldap3`.
//!
//! Sessions authenticate with a SASL GSSAPI bind using the machine credential handed to
//! [`LdapDirectory::connect`](keyescrow_provider::DirectoryConnector::connect).

mod client;
mod entry;
mod env;

pub use client::{LdapDirectory, LdapSession};
pub use entry::{host_filter, record_attributes, select_host_dn, RECOVERY_OBJECT_CLASS};
