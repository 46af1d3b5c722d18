//! Per-container session staging.
//!
//! A session is a private directory tree rooted in the system session
//! directory. It holds everything the engine synthesizes for one
//! container invocation: the final mount point the root filesystem view
//! is composed at, staged files (passwd, group, resolv.conf), scratch
//! space and the layer working directories. Sessions are created once
//! per invocation and torn down by cleanup.
//!
//! Directory and file staging happens with plain filesystem calls and
//! is visible on both sides of the privileged channel; only the
//! size-limited tmpfs for writable content is a scheduled mount, since
//! mounts are private to the container's namespace.

mod layer;

pub use layer::{
    fs_magic, host_root_entries, overlay_lower_compatible, overlay_upper_compatible,
    select_strategy, LayerRequest, LayerStrategy, OverlayLayer, RootEntry, RootEntryKind,
    UnderlayLayer,
};

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use vessel_common::{VesselError, VesselResult};

use crate::mount::{MountFlagSet, MountPoint, Registry, Tag};

/// Backing store for the session's writable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFs {
    /// A dedicated size-limited tmpfs for upper/work and scratch.
    Tmpfs,
    /// Plain directories on the system session filesystem.
    Dir,
}

/// In-container path the session directory is exposed at.
const SESSION_BIND_TARGET: &str = ".vessel/session";

/// A private staging tree for one container invocation.
#[derive(Debug)]
pub struct Session {
    id: String,
    base: PathBuf,
    fstype: SessionFs,
}

impl Session {
    /// Allocate the staging tree and wire it into the registry.
    ///
    /// With [`SessionFs::Tmpfs`], a size-limited tmpfs over the
    /// session's writable subtree is registered under the rootfs tag
    /// (it must precede layer composition); the session's bind into
    /// the final view is registered under the session tag.
    pub fn new(
        session_root: &Path,
        fstype: SessionFs,
        size_limit_mib: u64,
        registry: &mut Registry,
    ) -> VesselResult<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let base = session_root.join(&id);

        std::fs::create_dir_all(&base)?;
        std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o700))?;

        let session = Self { id, base, fstype };

        for dir in ["final", "rootfs", "files", "tmpfs"] {
            std::fs::create_dir_all(session.base.join(dir))?;
        }

        if fstype == SessionFs::Tmpfs {
            registry.add(
                Tag::Rootfs,
                MountPoint::filesystem("tmpfs", session.tmpfs_path())
                    .with_flags(MountFlagSet {
                        nosuid: true,
                        nodev: true,
                        ..MountFlagSet::default()
                    })
                    .with_option(format!("size={size_limit_mib}m"))
                    .with_option("mode=0700"),
            )?;
        }

        // Expose the staged tree inside the container, best-effort:
        // images without a writable layer may lack the target.
        registry.add(
            Tag::Session,
            MountPoint::bind(&session.base, session.in_final(SESSION_BIND_TARGET))
                .with_flags(MountFlagSet {
                    bind: true,
                    nosuid: true,
                    nodev: true,
                    ..MountFlagSet::default()
                })
                .skip_on_error(),
        )?;

        tracing::debug!(
            id = %session.id,
            base = %session.base.display(),
            ?fstype,
            "Session allocated"
        );

        Ok(session)
    }

    /// The session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The staging root.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The mount point the final root filesystem view is composed at.
    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        self.base.join("final")
    }

    /// Where the image root partition is mounted before composition.
    #[must_use]
    pub fn rootfs_path(&self) -> PathBuf {
        self.base.join("rootfs")
    }

    /// Directory holding synthesized files.
    #[must_use]
    pub fn files_path(&self) -> PathBuf {
        self.base.join("files")
    }

    /// The session's writable subtree (tmpfs-backed when requested).
    #[must_use]
    pub fn tmpfs_path(&self) -> PathBuf {
        self.base.join("tmpfs")
    }

    /// Upper directory for a writable tmpfs overlay.
    #[must_use]
    pub fn overlay_upper(&self) -> PathBuf {
        self.tmpfs_path().join("upper")
    }

    /// Work directory for a writable tmpfs overlay.
    #[must_use]
    pub fn overlay_work(&self) -> PathBuf {
        self.tmpfs_path().join("work")
    }

    /// Scratch space for writable in-container directories.
    #[must_use]
    pub fn scratch_path(&self) -> PathBuf {
        self.tmpfs_path().join("scratch")
    }

    /// Where a mounted overlay partition of the image lands.
    #[must_use]
    pub fn overlay_partition_path(&self, index: usize) -> PathBuf {
        self.base.join(format!("overlay-img/{index}"))
    }

    /// Root directory for the underlay strategy.
    #[must_use]
    pub fn underlay_root(&self) -> PathBuf {
        self.base.join("underlay")
    }

    /// Resolve a container-absolute path inside the final view.
    #[must_use]
    pub fn in_final(&self, container_path: impl AsRef<Path>) -> PathBuf {
        let relative = container_path
            .as_ref()
            .strip_prefix("/")
            .unwrap_or_else(|_| container_path.as_ref())
            .to_path_buf();
        self.final_path().join(relative)
    }

    /// Stage a synthesized file, returning its session path.
    ///
    /// Staged files are bind-mounted into the final view under the
    /// files tag by the creation pass.
    pub fn stage_file(&self, name: &str, contents: &[u8]) -> VesselResult<PathBuf> {
        let path = self.files_path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;

        tracing::debug!(name, path = %path.display(), "Staged session file");
        Ok(path)
    }

    /// Remove the staging tree from disk.
    ///
    /// Called by cleanup after the session mounts are unwound.
    pub fn remove(&self) -> VesselResult<()> {
        if self.base.exists() {
            std::fs::remove_dir_all(&self.base).map_err(|e| VesselError::Internal {
                message: format!("cannot remove session {}: {e}", self.base.display()),
            })?;
        }
        Ok(())
    }

    /// Whether the writable subtree sits on its own tmpfs.
    #[must_use]
    pub fn is_tmpfs(&self) -> bool {
        self.fstype == SessionFs::Tmpfs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_session_creates_staging_tree() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();

        let session = Session::new(temp.path(), SessionFs::Dir, 64, &mut registry).unwrap();

        assert!(session.final_path().is_dir());
        assert!(session.rootfs_path().is_dir());
        assert!(session.files_path().is_dir());
        // No tmpfs mount for plain directory sessions.
        assert!(registry.by_tag(Tag::Rootfs).is_empty());
    }

    #[test]
    fn tmpfs_session_registers_a_size_limited_mount() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();

        let session = Session::new(temp.path(), SessionFs::Tmpfs, 16, &mut registry).unwrap();

        let mounts = registry.by_tag(Tag::Rootfs);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fstype.as_deref(), Some("tmpfs"));
        assert_eq!(mounts[0].destination, session.tmpfs_path());
        assert!(mounts[0].options.contains(&"size=16m".to_string()));
    }

    #[test]
    fn session_bind_is_best_effort() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();

        let session = Session::new(temp.path(), SessionFs::Dir, 64, &mut registry).unwrap();

        let binds = registry.by_tag(Tag::Session);
        assert_eq!(binds.len(), 1);
        assert!(binds[0].internal.skip_on_error);
        assert_eq!(binds[0].destination, session.in_final(".vessel/session"));
    }

    #[test]
    fn staged_files_land_under_files_dir() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();
        let session = Session::new(temp.path(), SessionFs::Dir, 64, &mut registry).unwrap();

        let passwd = session
            .stage_file("passwd", b"root:x:0:0::/root:/bin/sh\n")
            .unwrap();
        assert!(passwd.starts_with(session.files_path()));
        assert_eq!(
            std::fs::read(&passwd).unwrap(),
            b"root:x:0:0::/root:/bin/sh\n"
        );
    }

    #[test]
    fn in_final_strips_leading_slash() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();
        let session = Session::new(temp.path(), SessionFs::Dir, 64, &mut registry).unwrap();

        assert_eq!(
            session.in_final("/etc/passwd"),
            session.final_path().join("etc/passwd")
        );
    }

    #[test]
    fn removal_clears_the_tree() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();
        let session = Session::new(temp.path(), SessionFs::Dir, 64, &mut registry).unwrap();
        session.stage_file("resolv.conf", b"nameserver 10.0.0.1\n").unwrap();

        session.remove().unwrap();
        assert!(!session.base().exists());
    }
}
