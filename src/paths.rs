//! Local path expansion.

use std::path::PathBuf;

/// Expand a leading `~` to the invoking user's home directory.
///
/// Only `~` and `~/...` are expanded; `~user` forms and paths without a
/// leading tilde are returned unchanged. If the home directory cannot be
/// determined the path is returned as written.
pub fn expand(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}
