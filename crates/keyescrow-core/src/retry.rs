//! Bounded exponential backoff for directory calls.

use crate::config::RetryCfg;
use crate::error::EscrowResult;
use log::warn;
use rand::Rng;
use std::thread;
use std::time::Duration;

/// Run `op` until it succeeds, fails with a non-transient error, or `cfg.max_attempts` is used up.
///
/// `op` receives the 1-based attempt number.
pub fn with_backoff<T, F>(cfg: &RetryCfg, what: &str, mut op: F) -> EscrowResult<T>
where
    F: FnMut(u32) -> EscrowResult<T>,
{
    let attempts = cfg.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = backoff_delay(cfg, attempt, &mut rand::thread_rng());
                warn!("{what} failed (attempt {attempt}/{attempts}): {err}; retrying in {delay:?}");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Delay before retry number `attempt`: `base * 2^(attempt-1)`, capped, then jittered.
pub fn backoff_delay<R: Rng>(cfg: &RetryCfg, attempt: u32, rng: &mut R) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = cfg.base_delay_ms.saturating_mul(1u64 << exponent);
    let capped = raw.min(cfg.max_delay_ms.max(cfg.base_delay_ms)) as f64;
    let ratio = cfg.jitter_ratio.clamp(0.0, 1.0);
    let jitter = if ratio > 0.0 {
        rng.gen_range(-ratio..=ratio)
    } else {
        0.0
    };
    Duration::from_millis((capped * (1.0 + jitter)).max(0.0).round() as u64)
}
