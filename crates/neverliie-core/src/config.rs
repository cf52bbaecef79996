//! Fixed filesystem locations and naming rules for the runtime.
//!
//! Nothing here requires configuration. The environment overrides exist
//! for sandboxed installs and test isolation:
//!   NEVERLIIE_HOME         — registry directory (default ~/.neverliie)
//!   NEVERLIIE_RUNTIME_DIR  — endpoint directory (default $XDG_RUNTIME_DIR,
//!                            falling back to the system temp dir)

use std::path::PathBuf;

/// Prefix carried by every transport endpoint. The peer name is embedded
/// verbatim after it.
pub const ENDPOINT_PREFIX: &str = "NeverLiie_";

/// Directory holding the registry file.
pub fn home_dir() -> PathBuf {
    std::env::var("NEVERLIIE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| user_home().join(".neverliie"))
}

/// The shared peer registry file.
pub fn registry_path() -> PathBuf {
    home_dir().join("registry.json")
}

/// Directory holding transport endpoints.
pub fn runtime_dir() -> PathBuf {
    std::env::var("NEVERLIIE_RUNTIME_DIR")
        .or_else(|_| std::env::var("XDG_RUNTIME_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

/// Transport endpoint for a peer name.
pub fn endpoint_path(name: &str) -> PathBuf {
    runtime_dir().join(format!("{ENDPOINT_PREFIX}{name}"))
}

/// A peer name doubles as a transport key and a registry key: non-empty,
/// printable ASCII, no path separators.
pub fn valid_peer_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_graphic() && c != '/')
}

fn user_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_embeds_name_verbatim() {
        let path = endpoint_path("launcher");
        let file = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(file, "NeverLiie_launcher");
    }

    #[test]
    fn peer_name_validation() {
        assert!(valid_peer_name("launcher"));
        assert!(valid_peer_name("status-bar.2"));
        assert!(!valid_peer_name(""));
        assert!(!valid_peer_name("has space"));
        assert!(!valid_peer_name("has/slash"));
        assert!(!valid_peer_name("nul\0byte"));
    }
}
