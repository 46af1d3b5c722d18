//! Mount orchestration.
//!
//! This module holds the pieces that turn declarative mount requests into
//! an ordered, deterministic sequence of privileged mount operations:
//! - Mount point description ([`MountPoint`], [`MountFlagSet`])
//! - The tag-ordered registry ([`Registry`])
//! - The hook-interleaving scheduler ([`Scheduler`])

mod registry;
mod scheduler;

pub use registry::{MountExecutor, Registry};
pub use scheduler::{Hook, Scheduler};

use std::path::{Path, PathBuf};

/// Ordering bucket for mount points and hooks.
///
/// Tags impose a partial order on the mount sequence: every mount in an
/// earlier tag is applied before any mount in a later one. Within a tag,
/// mounts apply in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    /// The container root filesystem itself.
    Rootfs,
    /// Mounts that must precede layer composition.
    PreLayer,
    /// Kernel pseudo-filesystems (/proc, /sys).
    Kernel,
    /// Device tree (/dev, /dev/pts, /dev/shm).
    Dev,
    /// Probed host filesystems.
    Hostfs,
    /// System-configured bind mounts.
    Binds,
    /// The invoking user's home directory.
    Home,
    /// User-requested bind mounts.
    Userbinds,
    /// tmpfs-backed /tmp and /var/tmp.
    Tmp,
    /// Scratch directories.
    Scratch,
    /// Synthesized session files (passwd, group, resolv.conf).
    Files,
    /// Mounts shared with other containers.
    Shared,
    /// The session staging tree.
    Session,
    /// The initial working directory.
    Cwd,
    /// Everything else.
    Other,
}

impl Tag {
    /// The fixed global application order.
    pub const ORDER: [Tag; 15] = [
        Tag::Rootfs,
        Tag::PreLayer,
        Tag::Kernel,
        Tag::Dev,
        Tag::Hostfs,
        Tag::Binds,
        Tag::Home,
        Tag::Userbinds,
        Tag::Tmp,
        Tag::Scratch,
        Tag::Files,
        Tag::Shared,
        Tag::Session,
        Tag::Cwd,
        Tag::Other,
    ];

    /// Whether a missing destination under this tag degrades to a
    /// warning instead of aborting the schedule.
    ///
    /// These tags target optional paths (host binds, working directory,
    /// kernel filesystems on exotic images).
    #[must_use]
    pub fn tolerates_missing_destination(self) -> bool {
        matches!(
            self,
            Tag::Kernel | Tag::Hostfs | Tag::Binds | Tag::Cwd | Tag::Files | Tag::Tmp
        )
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tag::Rootfs => "rootfs",
            Tag::PreLayer => "prelayer",
            Tag::Kernel => "kernel",
            Tag::Dev => "dev",
            Tag::Hostfs => "hostfs",
            Tag::Binds => "binds",
            Tag::Home => "home",
            Tag::Userbinds => "userbinds",
            Tag::Tmp => "tmp",
            Tag::Scratch => "scratch",
            Tag::Files => "files",
            Tag::Shared => "shared",
            Tag::Session => "session",
            Tag::Cwd => "cwd",
            Tag::Other => "other",
        };
        write!(f, "{name}")
    }
}

/// Flags applied to a mount point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountFlagSet {
    /// Bind mount.
    pub bind: bool,
    /// Read-only mount.
    pub readonly: bool,
    /// No suid.
    pub nosuid: bool,
    /// No dev.
    pub nodev: bool,
    /// No exec.
    pub noexec: bool,
    /// Remount pass over an existing mount.
    pub remount: bool,
    /// Recursive bind.
    pub recursive: bool,
    /// Slave propagation.
    pub slave: bool,
    /// Private propagation.
    pub private: bool,
}

impl MountFlagSet {
    /// Flags for a plain bind mount.
    #[must_use]
    pub fn bind() -> Self {
        Self {
            bind: true,
            ..Self::default()
        }
    }

    /// Flags for a read-only remount of an existing bind.
    #[must_use]
    pub fn readonly_remount() -> Self {
        Self {
            bind: true,
            readonly: true,
            remount: true,
            ..Self::default()
        }
    }

    /// Flags for kernel pseudo-filesystems.
    #[must_use]
    pub fn kernel() -> Self {
        Self {
            nosuid: true,
            nodev: true,
            noexec: true,
            ..Self::default()
        }
    }

    /// Convert to raw mount flag bits for the mount(2) syscall.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn to_raw(self) -> libc::c_ulong {
        let mut flags: libc::c_ulong = 0;
        if self.bind {
            flags |= libc::MS_BIND;
        }
        if self.readonly {
            flags |= libc::MS_RDONLY;
        }
        if self.nosuid {
            flags |= libc::MS_NOSUID;
        }
        if self.nodev {
            flags |= libc::MS_NODEV;
        }
        if self.noexec {
            flags |= libc::MS_NOEXEC;
        }
        if self.remount {
            flags |= libc::MS_REMOUNT;
        }
        if self.recursive {
            flags |= libc::MS_REC;
        }
        if self.slave {
            flags |= libc::MS_SLAVE;
        }
        if self.private {
            flags |= libc::MS_PRIVATE;
        }
        flags
    }
}

/// Options that never reach the kernel: image offsets, decryption keys
/// and the skip-on-error marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalOptions {
    /// Byte offset of an image-backed filesystem inside its file.
    pub offset: Option<u64>,
    /// Size limit of an image-backed filesystem.
    pub size_limit: Option<u64>,
    /// Decryption key for an encrypted partition.
    pub key: Option<Vec<u8>>,
    /// Convert a mount failure into a warning and a skip record.
    pub skip_on_error: bool,
}

/// A single pending mount operation.
///
/// Immutable once submitted to the registry, except for flag adjustment
/// during a remount pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Mount source, if the filesystem has one.
    pub source: Option<PathBuf>,
    /// Mount destination.
    pub destination: PathBuf,
    /// Filesystem type, if not a bind.
    pub fstype: Option<String>,
    /// Mount flags.
    pub flags: MountFlagSet,
    /// Filesystem-specific option strings.
    pub options: Vec<String>,
    /// Options consumed by the engine rather than the kernel.
    pub internal: InternalOptions,
}

impl MountPoint {
    /// A bind mount from `source` to `destination`.
    #[must_use]
    pub fn bind(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            destination: destination.into(),
            fstype: None,
            flags: MountFlagSet::bind(),
            options: Vec::new(),
            internal: InternalOptions::default(),
        }
    }

    /// A filesystem mount of type `fstype` at `destination`.
    #[must_use]
    pub fn filesystem(fstype: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            destination: destination.into(),
            fstype: Some(fstype.into()),
            flags: MountFlagSet::default(),
            options: Vec::new(),
            internal: InternalOptions::default(),
        }
    }

    /// Set mount flags.
    #[must_use]
    pub fn with_flags(mut self, flags: MountFlagSet) -> Self {
        self.flags = flags;
        self
    }

    /// Append a filesystem-specific option.
    #[must_use]
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Mark the mount as best-effort.
    #[must_use]
    pub fn skip_on_error(mut self) -> Self {
        self.internal.skip_on_error = true;
        self
    }

    /// Set the image byte offset.
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.internal.offset = Some(offset);
        self
    }

    /// Set the image size limit.
    #[must_use]
    pub fn with_size_limit(mut self, size: u64) -> Self {
        self.internal.size_limit = Some(size);
        self
    }

    /// Whether this mounts an overlay filesystem.
    #[must_use]
    pub fn is_overlay(&self) -> bool {
        self.fstype.as_deref() == Some("overlay")
    }

    /// The kernel-facing option string.
    #[must_use]
    pub fn options_string(&self) -> String {
        self.options.join(",")
    }

    /// The source path, or "none" for sourceless filesystems.
    #[must_use]
    pub fn source_or_none(&self) -> &Path {
        self.source
            .as_deref()
            .unwrap_or_else(|| Path::new("none"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_order_is_total() {
        assert_eq!(Tag::ORDER.len(), 15);
        assert_eq!(Tag::ORDER[0], Tag::Rootfs);
        assert_eq!(Tag::ORDER[14], Tag::Other);

        // The declared enum order matches the application order.
        for pair in Tag::ORDER.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn tolerant_tags() {
        assert!(Tag::Kernel.tolerates_missing_destination());
        assert!(Tag::Binds.tolerates_missing_destination());
        assert!(!Tag::Rootfs.tolerates_missing_destination());
        assert!(!Tag::Session.tolerates_missing_destination());
    }

    #[test]
    fn bind_mount_point() {
        let point = MountPoint::bind("/etc/hosts", "/mnt/etc/hosts").skip_on_error();
        assert!(point.flags.bind);
        assert!(point.internal.skip_on_error);
        assert_eq!(point.source_or_none(), Path::new("/etc/hosts"));
    }

    #[test]
    fn overlay_detection() {
        let point = MountPoint::filesystem("overlay", "/mnt/final")
            .with_option("lowerdir=/a:/b");
        assert!(point.is_overlay());
        assert_eq!(point.options_string(), "lowerdir=/a:/b");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn raw_flags() {
        let flags = MountFlagSet::readonly_remount().to_raw();
        assert_ne!(flags & libc::MS_BIND, 0);
        assert_ne!(flags & libc::MS_RDONLY, 0);
        assert_ne!(flags & libc::MS_REMOUNT, 0);
    }
}
