//! Receiver binary resolution
//!
//! Accepts whatever the user typed: a bare command name that should be on
//! `PATH`, an absolute or relative path, or a `~/`-prefixed path.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use nix::unistd::{access, AccessFlags};
use tracing::debug;

use crate::error::{RegistryError, Result};

/// Command name used when the caller supplies nothing
pub const DEFAULT_BINARY: &str = "uxplay";

/// Install locations probed by [`auto_detect`] after `PATH`
const WELL_KNOWN_LOCATIONS: &[&str] = &["/usr/local/bin/uxplay", "/opt/homebrew/bin/uxplay"];

/// Resolve `candidate` to an existing, executable regular file.
///
/// A candidate containing a path separator is an explicit path and is returned
/// unchanged when it checks out. Anything else is looked up on `PATH`.
pub fn resolve(candidate: &str) -> Result<PathBuf> {
    let normalized = normalize(candidate);

    if normalized.contains(MAIN_SEPARATOR) {
        let path = PathBuf::from(&normalized);
        if is_executable_file(&path) {
            debug!(path = %path.display(), "Resolved explicit receiver path");
            return Ok(path);
        }
        return Err(RegistryError::NotFound(normalized));
    }

    match which::which(&normalized) {
        Ok(path) if is_executable_file(&path) => {
            debug!(name = %normalized, path = %path.display(), "Resolved receiver on PATH");
            Ok(path)
        }
        _ => Err(RegistryError::NotFound(normalized)),
    }
}

/// Best-effort guess at the receiver binary for a fresh setup.
///
/// Falls back to the bare [`DEFAULT_BINARY`] name so that a later [`resolve`]
/// reports a clear `NotFound`.
pub fn auto_detect() -> String {
    let on_path = which::which(DEFAULT_BINARY).ok();
    let candidates = on_path
        .into_iter()
        .chain(WELL_KNOWN_LOCATIONS.iter().map(PathBuf::from));

    for path in candidates {
        if is_executable_file(&path) {
            debug!(path = %path.display(), "Auto-detected receiver binary");
            return path.to_string_lossy().into_owned();
        }
    }
    DEFAULT_BINARY.to_string()
}

/// Trim, default to [`DEFAULT_BINARY`] and expand a leading `~`.
fn normalize(candidate: &str) -> String {
    let trimmed = candidate.trim();
    let trimmed = if trimmed.is_empty() {
        DEFAULT_BINARY
    } else {
        trimmed
    };
    expand_home(trimmed)
}

fn expand_home(candidate: &str) -> String {
    let rest = match candidate.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with(MAIN_SEPARATOR) => rest,
        _ => return candidate.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{rest}", home.display()),
        None => candidate.to_string(),
    }
}

fn is_executable_file(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}
