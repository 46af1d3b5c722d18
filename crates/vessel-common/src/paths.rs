//! Standard filesystem paths for Vessel.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Vessel state.
pub static VESSEL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VESSEL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/vessel"))
});

/// Default session directory, holding per-container staging trees.
pub static VESSEL_SESSION_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VESSEL_SESSION_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/vessel/session"))
});

/// Standard paths used by the Vessel engine.
#[derive(Debug, Clone)]
pub struct VesselPaths {
    /// Root state directory (default: /var/lib/vessel).
    pub root: PathBuf,
    /// Session staging directory (default: /run/vessel/session).
    pub session: PathBuf,
}

impl VesselPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let session = root.join("session");
        Self { root, session }
    }

    /// Per-user paths for unprivileged installs.
    #[must_use]
    pub fn per_user() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::with_root(home.join(".local/share/vessel"))
    }

    /// Directory for persisted instance records.
    #[must_use]
    pub fn instances(&self) -> PathBuf {
        self.root.join("instances")
    }

    /// Record file for a named instance.
    #[must_use]
    pub fn instance(&self, name: &str) -> PathBuf {
        self.instances().join(name).join("instance.json")
    }

    /// Staging directory for one container session.
    #[must_use]
    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.session.join(id)
    }

    /// Administrator configuration file.
    #[must_use]
    pub fn engine_config(&self) -> PathBuf {
        PathBuf::from("/etc/vessel/vessel.conf")
    }

    /// Capability authorization policy file.
    #[must_use]
    pub fn capability_policy(&self) -> PathBuf {
        PathBuf::from("/etc/vessel/capability.json")
    }
}

impl Default for VesselPaths {
    fn default() -> Self {
        Self {
            root: VESSEL_ROOT.clone(),
            session: VESSEL_SESSION_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = VesselPaths::with_root("/custom");
        assert_eq!(paths.session, PathBuf::from("/custom/session"));
        assert_eq!(
            paths.instance("web"),
            PathBuf::from("/custom/instances/web/instance.json")
        );
    }

    #[test]
    fn session_dir_is_per_id() {
        let paths = VesselPaths::with_root("/custom");
        assert_eq!(
            paths.session_dir("abc123"),
            PathBuf::from("/custom/session/abc123")
        );
    }
}
