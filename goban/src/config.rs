//! Environment tunables for the `goban` driver.
//!
//! The engine itself is described by a JSON config file; these variables pick
//! that file and patch a few fields without editing it.

use std::path::PathBuf;

/// Config file used when neither `--config` nor the env variable is given.
const DEFAULT_ENGINE_CONFIG: &str = "goban-engine.json";

/// Get the engine config file path.
///
/// Priority:
/// 1. `GOBAN_ENGINE_CONFIG` env variable if set
/// 2. `goban-engine.json` in the current directory as fallback
pub fn get_engine_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("GOBAN_ENGINE_CONFIG") {
        return PathBuf::from(path);
    }

    PathBuf::from(DEFAULT_ENGINE_CONFIG)
}

/// Get a replacement for the configured engine program.
///
/// Useful to try another build against the same config file. Set
/// `GOBAN_ENGINE_PROGRAM` to the executable path.
pub fn get_program_override() -> Option<PathBuf> {
    std::env::var("GOBAN_ENGINE_PROGRAM").ok().map(PathBuf::from)
}

/// Get a replacement graceful-shutdown wait in milliseconds.
///
/// Reads `GOBAN_SHUTDOWN_GRACE_MS`; values that do not parse as `u64` are
/// ignored.
pub fn get_shutdown_grace_ms() -> Option<u64> {
    std::env::var("GOBAN_SHUTDOWN_GRACE_MS")
        .ok()
        .and_then(|ms| ms.parse().ok())
}
