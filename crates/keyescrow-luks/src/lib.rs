#![forbid(unsafe_code)]

//! Key slot provider for LUKS volumes.
//!
//! Integrates with the host via `cryptsetup` (isLuks, luksAddKey, luksDump, luksRemoveKey and
//! `open --test-passphrase`).

mod command;
mod dump;
mod staging;
mod system;

pub use dump::count_active_slots;
pub use staging::{is_memory_backed, KEY_STAGING_DIRS};
pub use system::SystemKeySlotManager;
