//! Logger setup shared by keyescrow binaries.
//!
//! Runs under systemd log straight to the journal; interactive runs get a terminal logger on
//! stderr so stdout stays reserved for the rotation summary.

use log::{LevelFilter, Log};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use systemd_journal_logger::{connected_to_journal, JournalLog};

/// Install the process-wide logger at `level` (`error`, `warn`, `info`, `debug`, `trace`).
///
/// Unknown levels fall back to `info`. Calling this more than once keeps the first logger.
pub fn init(level: &str) {
    let max_level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

    if connected_to_journal() {
        if let Ok(journal) = JournalLog::new() {
            let journal = journal.with_extra_fields(vec![("VERSION", env!("CARGO_PKG_VERSION"))]);
            if log::set_boxed_logger(Box::new(journal) as Box<dyn Log>).is_ok() {
                log::set_max_level(max_level);
            }
            return;
        }
    }

    let config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    // A logger may already be installed (tests, repeated init); keep it.
    let _ = TermLogger::init(max_level, config, TerminalMode::Stderr, ColorChoice::Auto);
}
