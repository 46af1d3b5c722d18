#![allow(unsafe_code)]
//! Linux namespace requests.
//!
//! The namespace set is resolved once at prepare time from user flags
//! and administrator policy, and never mutated mid-lifecycle.

use vessel_common::{EngineConfig, VesselError, VesselResult};

/// The namespaces requested for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// User namespace (CLONE_NEWUSER).
    pub user: bool,
    /// PID namespace (CLONE_NEWPID).
    pub pid: bool,
    /// Network namespace (CLONE_NEWNET).
    pub net: bool,
    /// Mount namespace (CLONE_NEWNS).
    pub mount: bool,
    /// UTS namespace (CLONE_NEWUTS).
    pub uts: bool,
    /// IPC namespace (CLONE_NEWIPC).
    pub ipc: bool,
}

impl NamespaceConfig {
    /// The baseline for any container: a private mount namespace.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            mount: true,
            ..Self::default()
        }
    }

    /// Reject namespaces the administrator has disallowed.
    pub fn validate(&self, config: &EngineConfig) -> VesselResult<()> {
        let denied = [
            (self.pid && !config.allow_pid_ns, "pid"),
            (self.uts && !config.allow_uts_ns, "uts"),
            (self.ipc && !config.allow_ipc_ns, "ipc"),
            (self.user && !config.allow_user_ns, "user"),
            (self.net && !config.allow_net_ns, "net"),
        ];
        for (hit, name) in denied {
            if hit {
                return Err(VesselError::Config {
                    message: format!("{name} namespace is disallowed by configuration"),
                });
            }
        }
        Ok(())
    }

    /// Convert to unshare flags.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn to_unshare_flags(&self) -> rustix::thread::UnshareFlags {
        use rustix::thread::UnshareFlags;

        let mut flags = UnshareFlags::empty();
        if self.user {
            flags |= UnshareFlags::NEWUSER;
        }
        if self.pid {
            flags |= UnshareFlags::NEWPID;
        }
        if self.net {
            flags |= UnshareFlags::NEWNET;
        }
        if self.mount {
            flags |= UnshareFlags::NEWNS;
        }
        if self.uts {
            flags |= UnshareFlags::NEWUTS;
        }
        if self.ipc {
            flags |= UnshareFlags::NEWIPC;
        }
        flags
    }

    /// Unshare the requested namespaces for the calling process.
    #[cfg(target_os = "linux")]
    pub fn unshare(&self) -> VesselResult<()> {
        let flags = self.to_unshare_flags();
        if flags.is_empty() {
            return Ok(());
        }

        // Safety: creating new namespaces for container isolation is
        // the intended use of unshare.
        unsafe {
            rustix::thread::unshare_unsafe(flags).map_err(|e| VesselError::Internal {
                message: format!("cannot unshare namespaces: {e}"),
            })?;
        }

        tracing::debug!(?flags, "Unshared namespaces");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn unshare(&self) -> VesselResult<()> {
        Err(VesselError::Unsupported {
            feature: "namespaces".to_string(),
        })
    }

    /// Whether any namespace is requested at all.
    #[must_use]
    pub fn any(&self) -> bool {
        self.user || self.pid || self.net || self.mount || self.uts || self.ipc
    }
}

/// One UID or GID range mapping for a user namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapping {
    /// Start of the range inside the container.
    pub container_id: u32,
    /// Start of the range on the host.
    pub host_id: u32,
    /// Length of the range.
    pub size: u32,
}

impl IdMapping {
    /// A 1:1 mapping of the current user onto container root.
    #[must_use]
    pub fn current_user_as_root() -> Self {
        Self {
            container_id: 0,
            host_id: rustix::process::getuid().as_raw(),
            size: 1,
        }
    }

    fn render(mappings: &[IdMapping]) -> String {
        mappings
            .iter()
            .map(|m| format!("{} {} {}", m.container_id, m.host_id, m.size))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Write UID/GID mappings into a child's proc files.
///
/// Must run in the parent: a process cannot complete its own mapping
/// once it is inside the new user namespace. Denies setgroups first,
/// as required for unprivileged user namespaces.
pub fn write_id_mappings(
    pid: libc::pid_t,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> VesselResult<()> {
    if !uid_mappings.is_empty() {
        let path = format!("/proc/{pid}/uid_map");
        std::fs::write(&path, IdMapping::render(uid_mappings)).map_err(|e| {
            VesselError::Internal {
                message: format!("cannot write {path}: {e}"),
            }
        })?;
        tracing::debug!(pid, "Wrote UID mappings");
    }

    if !gid_mappings.is_empty() {
        let setgroups = format!("/proc/{pid}/setgroups");
        if std::path::Path::new(&setgroups).exists() {
            let _ = std::fs::write(&setgroups, "deny");
        }

        let path = format!("/proc/{pid}/gid_map");
        std::fs::write(&path, IdMapping::render(gid_mappings)).map_err(|e| {
            VesselError::Internal {
                message: format!("cannot write {path}: {e}"),
            }
        })?;
        tracing::debug!(pid, "Wrote GID mappings");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_has_only_mount() {
        let config = NamespaceConfig::minimal();
        assert!(config.mount);
        assert!(!config.pid && !config.user && !config.net);
    }

    #[test]
    fn disallowed_namespace_is_a_config_error() {
        let engine = EngineConfig::default();
        let mut request = NamespaceConfig::minimal();
        request.net = true;

        // Network namespaces are disallowed by default.
        let err = request.validate(&engine).unwrap_err();
        assert!(err.to_string().contains("net namespace is disallowed"));

        let permissive = EngineConfig::parse("allow net ns = yes\n").unwrap();
        request.validate(&permissive).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unshare_flags_cover_requests() {
        use rustix::thread::UnshareFlags;

        let mut config = NamespaceConfig::minimal();
        config.pid = true;
        let flags = config.to_unshare_flags();
        assert!(flags.contains(UnshareFlags::NEWNS));
        assert!(flags.contains(UnshareFlags::NEWPID));
        assert!(!flags.contains(UnshareFlags::NEWNET));
    }

    #[test]
    fn mapping_rendering() {
        let mappings = vec![
            IdMapping {
                container_id: 0,
                host_id: 1000,
                size: 1,
            },
            IdMapping {
                container_id: 1,
                host_id: 100_000,
                size: 65536,
            },
        ];
        assert_eq!(
            IdMapping::render(&mappings),
            "0 1000 1\n1 100000 65536"
        );
    }
}
