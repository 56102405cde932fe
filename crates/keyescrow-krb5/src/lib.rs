#![forbid(unsafe_code)]

//! Machine credentials obtained with `kinit -k` into a process-private ticket cache.

mod cache;
mod kinit;

pub use cache::CredentialCache;
pub use kinit::KinitCredentialProvider;

/// Environment variable naming the active ticket cache.
pub const CCACHE_ENV: &str = "KRB5CCNAME";
