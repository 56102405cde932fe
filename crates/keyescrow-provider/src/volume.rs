//! Provider contract for encrypted-volume key slots.

use std::error::Error;
use std::path::Path;

/// Abstraction over the key-slot table of a block-device encryption format.
///
/// Every operation is local to the volume header. Implementations never invalidate a key as a side
/// effect of adding another one.
pub trait KeySlotManager {
    type Error: Error + Send + Sync + 'static;

    /// Return whether `device` carries the expected encryption header.
    fn validate(&self, device: &Path) -> Result<bool, Self::Error>;

    /// Authenticate with `existing_key` and install `new_key` into a free slot.
    fn add_key(&self, device: &Path, existing_key: &[u8], new_key: &[u8])
        -> Result<(), Self::Error>;

    /// Remove the slot unlocked by `key`.
    ///
    /// Implementations must refuse to remove the last remaining slot.
    fn remove_key(&self, device: &Path, key: &[u8]) -> Result<(), Self::Error>;
}
