// src/logging.rs - tracing subscriber setup
use tracing::Level;

/// Installs a fmt subscriber capped at `level`.
///
/// Returns false when a global subscriber was already installed, which is
/// the normal case when several tests initialize logging.
pub fn init(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Parses `trace`/`debug`/`info`/`warn`/`error`, defaulting to INFO.
pub fn level_from_str(value: &str) -> Level {
    value.trim().parse().unwrap_or(Level::INFO)
}
