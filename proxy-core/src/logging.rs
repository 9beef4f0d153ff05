//! Logging bootstrap. One-shot global subscriber init, mirroring the shape of
//! `flux::logging::init()` (parse a level, build a subscriber, install it as the global
//! default) but wired to `tracing`/`tracing-subscriber`, the crate the mio reference in this
//! workspace's ancestry actually pulls in.

use crate::config::LogLevel;
use tracing_subscriber::fmt;

/// Install the global `tracing` subscriber for the process. Call exactly once, before any
/// worker thread starts, so every thread's spans are captured from the start.
pub fn init(level: LogLevel, disable_colors: bool) {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level.as_tracing_level());
    let subscriber = fmt()
        .with_ansi(!disable_colors)
        .with_max_level(filter)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // A subscriber is already installed (e.g. a test harness set one up); nothing to do.
    }
}
