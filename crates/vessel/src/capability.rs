//! Linux capability management.
//!
//! Capabilities show up in three places: the helper narrows its own
//! effective set per privileged call, the container leader gets a
//! resolved set applied before exec, and user add requests are checked
//! against the administrator's authorization policy file.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use vessel_common::config::RootCapPolicy;
use vessel_common::{VesselError, VesselResult};

/// Linux capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// CAP_CHOWN
    Chown,
    /// CAP_DAC_OVERRIDE
    DacOverride,
    /// CAP_DAC_READ_SEARCH
    DacReadSearch,
    /// CAP_FOWNER
    Fowner,
    /// CAP_FSETID
    Fsetid,
    /// CAP_KILL
    Kill,
    /// CAP_SETGID
    Setgid,
    /// CAP_SETUID
    Setuid,
    /// CAP_SETPCAP
    Setpcap,
    /// CAP_LINUX_IMMUTABLE
    LinuxImmutable,
    /// CAP_NET_BIND_SERVICE
    NetBindService,
    /// CAP_NET_BROADCAST
    NetBroadcast,
    /// CAP_NET_ADMIN
    NetAdmin,
    /// CAP_NET_RAW
    NetRaw,
    /// CAP_IPC_LOCK
    IpcLock,
    /// CAP_IPC_OWNER
    IpcOwner,
    /// CAP_SYS_MODULE
    SysModule,
    /// CAP_SYS_RAWIO
    SysRawio,
    /// CAP_SYS_CHROOT
    SysChroot,
    /// CAP_SYS_PTRACE
    SysPtrace,
    /// CAP_SYS_PACCT
    SysPacct,
    /// CAP_SYS_ADMIN
    SysAdmin,
    /// CAP_SYS_BOOT
    SysBoot,
    /// CAP_SYS_NICE
    SysNice,
    /// CAP_SYS_RESOURCE
    SysResource,
    /// CAP_SYS_TIME
    SysTime,
    /// CAP_SYS_TTY_CONFIG
    SysTtyConfig,
    /// CAP_MKNOD
    Mknod,
    /// CAP_LEASE
    Lease,
    /// CAP_AUDIT_WRITE
    AuditWrite,
    /// CAP_AUDIT_CONTROL
    AuditControl,
    /// CAP_SETFCAP
    Setfcap,
}

/// Every capability the engine knows about.
pub const ALL_CAPABILITIES: [Capability; 32] = [
    Capability::Chown,
    Capability::DacOverride,
    Capability::DacReadSearch,
    Capability::Fowner,
    Capability::Fsetid,
    Capability::Kill,
    Capability::Setgid,
    Capability::Setuid,
    Capability::Setpcap,
    Capability::LinuxImmutable,
    Capability::NetBindService,
    Capability::NetBroadcast,
    Capability::NetAdmin,
    Capability::NetRaw,
    Capability::IpcLock,
    Capability::IpcOwner,
    Capability::SysModule,
    Capability::SysRawio,
    Capability::SysChroot,
    Capability::SysPtrace,
    Capability::SysPacct,
    Capability::SysAdmin,
    Capability::SysBoot,
    Capability::SysNice,
    Capability::SysResource,
    Capability::SysTime,
    Capability::SysTtyConfig,
    Capability::Mknod,
    Capability::Lease,
    Capability::AuditWrite,
    Capability::AuditControl,
    Capability::Setfcap,
];

/// Symbolic-name lookup table, built once at first use.
static NAME_TABLE: Lazy<HashMap<&'static str, Capability>> = Lazy::new(|| {
    ALL_CAPABILITIES.iter().map(|c| (c.name(), *c)).collect()
});

impl Capability {
    /// The capability name as a string.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chown => "CAP_CHOWN",
            Self::DacOverride => "CAP_DAC_OVERRIDE",
            Self::DacReadSearch => "CAP_DAC_READ_SEARCH",
            Self::Fowner => "CAP_FOWNER",
            Self::Fsetid => "CAP_FSETID",
            Self::Kill => "CAP_KILL",
            Self::Setgid => "CAP_SETGID",
            Self::Setuid => "CAP_SETUID",
            Self::Setpcap => "CAP_SETPCAP",
            Self::LinuxImmutable => "CAP_LINUX_IMMUTABLE",
            Self::NetBindService => "CAP_NET_BIND_SERVICE",
            Self::NetBroadcast => "CAP_NET_BROADCAST",
            Self::NetAdmin => "CAP_NET_ADMIN",
            Self::NetRaw => "CAP_NET_RAW",
            Self::IpcLock => "CAP_IPC_LOCK",
            Self::IpcOwner => "CAP_IPC_OWNER",
            Self::SysModule => "CAP_SYS_MODULE",
            Self::SysRawio => "CAP_SYS_RAWIO",
            Self::SysChroot => "CAP_SYS_CHROOT",
            Self::SysPtrace => "CAP_SYS_PTRACE",
            Self::SysPacct => "CAP_SYS_PACCT",
            Self::SysAdmin => "CAP_SYS_ADMIN",
            Self::SysBoot => "CAP_SYS_BOOT",
            Self::SysNice => "CAP_SYS_NICE",
            Self::SysResource => "CAP_SYS_RESOURCE",
            Self::SysTime => "CAP_SYS_TIME",
            Self::SysTtyConfig => "CAP_SYS_TTY_CONFIG",
            Self::Mknod => "CAP_MKNOD",
            Self::Lease => "CAP_LEASE",
            Self::AuditWrite => "CAP_AUDIT_WRITE",
            Self::AuditControl => "CAP_AUDIT_CONTROL",
            Self::Setfcap => "CAP_SETFCAP",
        }
    }

    /// Look up a capability by its symbolic name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        NAME_TABLE.get(name).copied()
    }

    fn to_caps_capability(self) -> caps::Capability {
        match self {
            Self::Chown => caps::Capability::CAP_CHOWN,
            Self::DacOverride => caps::Capability::CAP_DAC_OVERRIDE,
            Self::DacReadSearch => caps::Capability::CAP_DAC_READ_SEARCH,
            Self::Fowner => caps::Capability::CAP_FOWNER,
            Self::Fsetid => caps::Capability::CAP_FSETID,
            Self::Kill => caps::Capability::CAP_KILL,
            Self::Setgid => caps::Capability::CAP_SETGID,
            Self::Setuid => caps::Capability::CAP_SETUID,
            Self::Setpcap => caps::Capability::CAP_SETPCAP,
            Self::LinuxImmutable => caps::Capability::CAP_LINUX_IMMUTABLE,
            Self::NetBindService => caps::Capability::CAP_NET_BIND_SERVICE,
            Self::NetBroadcast => caps::Capability::CAP_NET_BROADCAST,
            Self::NetAdmin => caps::Capability::CAP_NET_ADMIN,
            Self::NetRaw => caps::Capability::CAP_NET_RAW,
            Self::IpcLock => caps::Capability::CAP_IPC_LOCK,
            Self::IpcOwner => caps::Capability::CAP_IPC_OWNER,
            Self::SysModule => caps::Capability::CAP_SYS_MODULE,
            Self::SysRawio => caps::Capability::CAP_SYS_RAWIO,
            Self::SysChroot => caps::Capability::CAP_SYS_CHROOT,
            Self::SysPtrace => caps::Capability::CAP_SYS_PTRACE,
            Self::SysPacct => caps::Capability::CAP_SYS_PACCT,
            Self::SysAdmin => caps::Capability::CAP_SYS_ADMIN,
            Self::SysBoot => caps::Capability::CAP_SYS_BOOT,
            Self::SysNice => caps::Capability::CAP_SYS_NICE,
            Self::SysResource => caps::Capability::CAP_SYS_RESOURCE,
            Self::SysTime => caps::Capability::CAP_SYS_TIME,
            Self::SysTtyConfig => caps::Capability::CAP_SYS_TTY_CONFIG,
            Self::Mknod => caps::Capability::CAP_MKNOD,
            Self::Lease => caps::Capability::CAP_LEASE,
            Self::AuditWrite => caps::Capability::CAP_AUDIT_WRITE,
            Self::AuditControl => caps::Capability::CAP_AUDIT_CONTROL,
            Self::Setfcap => caps::Capability::CAP_SETFCAP,
        }
    }
}

/// An ordered set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    caps: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every capability.
    #[must_use]
    pub fn full() -> Self {
        Self {
            caps: ALL_CAPABILITIES.into_iter().collect(),
        }
    }

    /// Build from symbolic names; unknown names are skipped with a
    /// warning.
    #[must_use]
    pub fn from_names(names: &[String]) -> Self {
        let mut set = Self::empty();
        for name in names {
            match Capability::from_name(name) {
                Some(cap) => {
                    set.caps.insert(cap);
                }
                None => tracing::warn!(name, "Unknown capability name, skipping"),
            }
        }
        set
    }

    /// Insert a capability.
    pub fn insert(&mut self, cap: Capability) {
        self.caps.insert(cap);
    }

    /// Remove a capability.
    pub fn remove(&mut self, cap: Capability) {
        self.caps.remove(&cap);
    }

    /// Whether the set contains `cap`.
    #[must_use]
    pub fn contains(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Symbolic names in deterministic order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.caps.iter().map(|c| c.name().to_string()).collect()
    }

    /// Apply the set to the calling process.
    ///
    /// Bounding and ambient sets are best-effort (they require
    /// privileges a rootless run may lack); the permitted, effective
    /// and inheritable sets are authoritative.
    pub fn apply(&self) -> VesselResult<()> {
        let target: caps::CapsHashSet = self
            .caps
            .iter()
            .map(|c| c.to_caps_capability())
            .collect();

        tracing::debug!(count = target.len(), "Applying capability set");

        if let Err(e) = caps::set(None, caps::CapSet::Bounding, &target) {
            tracing::warn!(error = %e, "Cannot set bounding capabilities");
        }

        caps::set(None, caps::CapSet::Inheritable, &target).map_err(|e| {
            VesselError::Internal {
                message: format!("cannot set inheritable capabilities: {e}"),
            }
        })?;
        caps::set(None, caps::CapSet::Effective, &target).map_err(|e| {
            VesselError::Internal {
                message: format!("cannot set effective capabilities: {e}"),
            }
        })?;
        caps::set(None, caps::CapSet::Permitted, &target).map_err(|e| {
            VesselError::Internal {
                message: format!("cannot set permitted capabilities: {e}"),
            }
        })?;

        if let Err(e) = caps::set(None, caps::CapSet::Ambient, &target) {
            tracing::warn!(error = %e, "Cannot set ambient capabilities");
        }

        Ok(())
    }
}

/// The administrator's capability authorization policy.
///
/// A JSON file mapping users and groups to the capabilities they may
/// request; absent file means nobody is authorized for anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    /// Capabilities authorized per user name.
    #[serde(default)]
    pub users: HashMap<String, Vec<String>>,
    /// Capabilities authorized per group name.
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
}

impl CapabilityPolicy {
    /// Load the policy file; a missing file yields the empty policy.
    pub fn load(path: &Path) -> VesselResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let policy = serde_json::from_str(&content).map_err(|e| VesselError::Config {
                    message: format!("malformed capability policy {}: {e}", path.display()),
                })?;
                Ok(policy)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(VesselError::Io(e)),
        }
    }

    /// The set a user may request, via their name or any group.
    #[must_use]
    pub fn authorized_for(&self, user: &str, groups: &[String]) -> CapabilitySet {
        let mut set = CapabilitySet::empty();
        if let Some(names) = self.users.get(user) {
            for name in names {
                if let Some(cap) = Capability::from_name(name) {
                    set.insert(cap);
                }
            }
        }
        for group in groups {
            if let Some(names) = self.groups.get(group) {
                for name in names {
                    if let Some(cap) = Capability::from_name(name) {
                        set.insert(cap);
                    }
                }
            }
        }
        set
    }
}

/// Resolve the container's capability set at prepare time.
///
/// Root containers start from the administrator's root default policy;
/// everyone else starts empty. Add requests from unprivileged users
/// must be authorized by the policy file; an unauthorized request is a
/// privilege error, never downgraded.
pub fn resolve_container_caps(
    root_policy: RootCapPolicy,
    uid: u32,
    user: &str,
    groups: &[String],
    policy: &CapabilityPolicy,
    add: &[String],
    drop: &[String],
) -> VesselResult<CapabilitySet> {
    let mut set = if uid == 0 {
        match root_policy {
            RootCapPolicy::Full => CapabilitySet::full(),
            RootCapPolicy::File => policy.authorized_for(user, groups),
            RootCapPolicy::No => CapabilitySet::empty(),
        }
    } else {
        CapabilitySet::empty()
    };

    let authorized = policy.authorized_for(user, groups);
    for name in add {
        let cap = Capability::from_name(name).ok_or_else(|| VesselError::Config {
            message: format!("unknown capability '{name}'"),
        })?;
        if uid != 0 && !authorized.contains(cap) {
            return Err(VesselError::Privilege {
                message: format!("capability {name} is not authorized for user {user}"),
            });
        }
        set.insert(cap);
    }

    for name in drop {
        if let Some(cap) = Capability::from_name(name) {
            set.remove(cap);
        }
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_table_roundtrip() {
        for cap in ALL_CAPABILITIES {
            assert_eq!(Capability::from_name(cap.name()), Some(cap));
        }
        assert_eq!(Capability::from_name("CAP_NOT_A_THING"), None);
    }

    #[test]
    fn root_full_policy_starts_full() {
        let set = resolve_container_caps(
            RootCapPolicy::Full,
            0,
            "root",
            &[],
            &CapabilityPolicy::default(),
            &[],
            &["CAP_SYS_ADMIN".to_string()],
        )
        .unwrap();
        assert!(!set.contains(Capability::SysAdmin));
        assert!(set.contains(Capability::Chown));
    }

    #[test]
    fn root_no_policy_starts_empty() {
        let set = resolve_container_caps(
            RootCapPolicy::No,
            0,
            "root",
            &[],
            &CapabilityPolicy::default(),
            &[],
            &[],
        )
        .unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn unauthorized_add_is_a_privilege_error() {
        let err = resolve_container_caps(
            RootCapPolicy::Full,
            1000,
            "alice",
            &[],
            &CapabilityPolicy::default(),
            &["CAP_NET_ADMIN".to_string()],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, VesselError::Privilege { .. }));
        assert!(err.is_always_fatal());
    }

    #[test]
    fn policy_file_authorizes_user_and_group_requests() {
        let mut policy = CapabilityPolicy::default();
        policy
            .users
            .insert("alice".to_string(), vec!["CAP_NET_ADMIN".to_string()]);
        policy
            .groups
            .insert("hpc".to_string(), vec!["CAP_SYS_NICE".to_string()]);

        let set = resolve_container_caps(
            RootCapPolicy::Full,
            1000,
            "alice",
            &["hpc".to_string()],
            &policy,
            &["CAP_NET_ADMIN".to_string(), "CAP_SYS_NICE".to_string()],
            &[],
        )
        .unwrap();
        assert!(set.contains(Capability::NetAdmin));
        assert!(set.contains(Capability::SysNice));
    }

    #[test]
    fn policy_load_tolerates_missing_file() {
        let policy = CapabilityPolicy::load(Path::new("/nonexistent/capability.json")).unwrap();
        assert!(policy.users.is_empty());
    }

    #[test]
    fn malformed_policy_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not json").unwrap();
        let err = CapabilityPolicy::load(file.path()).unwrap_err();
        assert!(matches!(err, VesselError::Config { .. }));
    }
}
