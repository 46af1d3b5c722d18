//! Instance persistence.
//!
//! A daemonized container leaves a record behind so later invocations
//! can join its running namespaces. Join requests re-validate the
//! record against the live process before trusting any recorded
//! namespace path: the target's proc directory must belong to the
//! joining user and the process must still be the engine's shim.

use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vessel_common::{VesselError, VesselResult};

use crate::privop::SHIM_PROCESS_NAME;

/// Persisted record of a running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance name.
    pub name: String,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Container leader pid.
    pub pid: i32,
    /// Supervisor pid.
    pub ppid: i32,
    /// Image reference the instance was started from.
    pub image: PathBuf,
    /// IP address, when the instance is networked.
    pub ip: Option<String>,
    /// Namespace-join paths by namespace name.
    pub namespace_paths: BTreeMap<String, PathBuf>,
    /// Serialized engine configuration for the instance.
    pub engine_config: serde_json::Value,
    /// Start timestamp.
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl InstanceRecord {
    /// Record the standard namespace-join paths for a pid.
    pub fn with_namespace_paths(mut self) -> Self {
        for ns in ["mnt", "pid", "uts", "ipc", "net", "user"] {
            self.namespace_paths.insert(
                ns.to_string(),
                PathBuf::from(format!("/proc/{}/ns/{ns}", self.pid)),
            );
        }
        self
    }
}

/// Instance record storage.
#[derive(Debug)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    /// A store rooted at the instances directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(name).join("instance.json")
    }

    /// Persist a record after successful start.
    pub fn save(&self, record: &InstanceRecord) -> VesselResult<()> {
        let path = self.record_path(&record.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json)?;

        tracing::debug!(
            instance = %record.name,
            path = %path.display(),
            "Saved instance record"
        );
        Ok(())
    }

    /// Load a record by name.
    pub fn load(&self, name: &str) -> VesselResult<InstanceRecord> {
        let path = self.record_path(name);
        if !path.exists() {
            return Err(VesselError::Config {
                message: format!("no instance named '{name}'"),
            });
        }

        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Delete a record.
    pub fn delete(&self, name: &str) -> VesselResult<()> {
        let dir = self.dir.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// List instances owned by a user.
    pub fn list(&self, uid: u32) -> VesselResult<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }

        let mut names: Vec<_> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join("instance.json").exists())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        for name in names {
            let record = self.load(&name)?;
            if record.uid == uid {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Validate a record against the live process before a join.
///
/// The `/proc` task directory of the target must be owned by the
/// joining user, and the process `comm` must still read the engine's
/// shim sentinel; only then are the recorded namespace paths trusted.
/// Any mismatch is a privilege error, never downgraded.
pub fn validate_join(record: &InstanceRecord, uid: u32, gid: u32) -> VesselResult<()> {
    validate_join_under(Path::new("/proc"), record, uid, gid)
}

fn validate_join_under(
    proc_root: &Path,
    record: &InstanceRecord,
    uid: u32,
    gid: u32,
) -> VesselResult<()> {
    let task_dir = proc_root.join(record.pid.to_string());
    let metadata = std::fs::metadata(&task_dir).map_err(|_| VesselError::Privilege {
        message: format!("instance '{}' is not running", record.name),
    })?;

    if metadata.uid() != uid || metadata.gid() != gid {
        return Err(VesselError::Privilege {
            message: format!(
                "instance '{}' is not owned by the joining user",
                record.name
            ),
        });
    }

    let comm = std::fs::read_to_string(task_dir.join("comm")).map_err(|_| {
        VesselError::Privilege {
            message: format!("cannot identify instance '{}'", record.name),
        }
    })?;
    if comm.trim_end() != SHIM_PROCESS_NAME {
        return Err(VesselError::Privilege {
            message: format!(
                "process {} is not a container shim, refusing to join",
                record.pid
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, pid: i32) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            uid: 1000,
            gid: 1000,
            pid,
            ppid: 1,
            image: PathBuf::from("/images/base.sif"),
            ip: None,
            namespace_paths: BTreeMap::new(),
            engine_config: serde_json::json!({}),
            started_at: chrono::Utc::now(),
        }
        .with_namespace_paths()
    }

    #[test]
    fn save_load_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(temp.path());

        let original = record("web", 4242);
        store.save(&original).unwrap();

        let loaded = store.load("web").unwrap();
        assert_eq!(loaded.pid, 4242);
        assert_eq!(
            loaded.namespace_paths.get("mnt"),
            Some(&PathBuf::from("/proc/4242/ns/mnt"))
        );
    }

    #[test]
    fn list_filters_by_owner() {
        let temp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(temp.path());

        store.save(&record("mine", 10)).unwrap();
        let mut other = record("theirs", 11);
        other.uid = 2000;
        store.save(&other).unwrap();

        let mine = store.list(1000).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "mine");
    }

    #[test]
    fn join_rejects_wrong_owner() {
        let temp = tempfile::tempdir().unwrap();
        let proc_root = temp.path();
        let task_dir = proc_root.join("4242");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("comm"), format!("{SHIM_PROCESS_NAME}\n")).unwrap();

        // The fake proc dir is owned by the test user; a different
        // joining uid must be rejected.
        let this_uid = rustix::process::getuid().as_raw();
        let this_gid = rustix::process::getgid().as_raw();
        let err =
            validate_join_under(proc_root, &record("web", 4242), this_uid + 1, this_gid)
                .unwrap_err();
        assert!(matches!(err, VesselError::Privilege { .. }));
    }

    #[test]
    fn join_rejects_non_shim_process() {
        let temp = tempfile::tempdir().unwrap();
        let proc_root = temp.path();
        let task_dir = proc_root.join("4242");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("comm"), "bash\n").unwrap();

        let this_uid = rustix::process::getuid().as_raw();
        let this_gid = rustix::process::getgid().as_raw();
        let err = validate_join_under(proc_root, &record("web", 4242), this_uid, this_gid)
            .unwrap_err();
        assert!(err.to_string().contains("not a container shim"));
    }

    #[test]
    fn join_accepts_matching_shim() {
        let temp = tempfile::tempdir().unwrap();
        let proc_root = temp.path();
        let task_dir = proc_root.join("4242");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("comm"), format!("{SHIM_PROCESS_NAME}\n")).unwrap();

        let this_uid = rustix::process::getuid().as_raw();
        let this_gid = rustix::process::getgid().as_raw();
        validate_join_under(proc_root, &record("web", 4242), this_uid, this_gid).unwrap();
    }

    #[test]
    fn missing_instance_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let store = InstanceStore::new(temp.path());
        assert!(store.load("ghost").is_err());
    }
}
