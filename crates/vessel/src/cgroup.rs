//! Cgroup placement.
//!
//! Resource-limit semantics are out of scope; the engine only creates
//! a cgroup, places the container leader in it, and removes it again
//! during cleanup.

use std::path::PathBuf;

use vessel_common::{VesselError, VesselResult};

/// Default cgroup v2 mount point.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// A cgroup created for one container.
#[derive(Debug)]
pub struct CgroupHandle {
    path: PathBuf,
}

impl CgroupHandle {
    /// Create the cgroup for a container id.
    pub fn create(container_id: &str) -> VesselResult<Self> {
        let path = PathBuf::from(CGROUP_ROOT).join("vessel").join(container_id);

        std::fs::create_dir_all(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                VesselError::Privilege {
                    message: "cannot create cgroup".to_string(),
                }
            } else {
                VesselError::Io(e)
            }
        })?;

        tracing::debug!(path = %path.display(), "Created cgroup");
        Ok(Self { path })
    }

    /// The cgroup path.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Place a process in the cgroup.
    pub fn place(&self, pid: i32) -> VesselResult<()> {
        std::fs::write(self.path.join("cgroup.procs"), pid.to_string())?;
        tracing::debug!(pid, path = %self.path.display(), "Placed process in cgroup");
        Ok(())
    }

    /// Remove the cgroup. Idempotent; called by cleanup.
    pub fn remove(&self) -> VesselResult<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VesselError::Io(e)),
        }
    }
}
