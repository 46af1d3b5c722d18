//! Filesystem layering strategies.
//!
//! Three ways to present a composed root filesystem view over a
//! read-only or multi-part image: an overlay union, an underlay of
//! individually materialized bind targets, or nothing at all.

use std::path::{Path, PathBuf};

use vessel_common::config::{EngineConfig, OverlayMode, UnderlayMode};
use vessel_common::{VesselError, VesselResult};

use crate::mount::{MountFlagSet, MountPoint, Registry, Tag};

/// The layering strategy selected at prepare time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStrategy {
    /// Union the image and session content with an overlay mount.
    Overlay,
    /// Materialize bind destinations in a session-owned root.
    Underlay,
    /// No composition: binds fail if the target is absent in the image.
    None,
}

impl std::fmt::Display for LayerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overlay => write!(f, "overlay"),
            Self::Underlay => write!(f, "underlay"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Inputs to strategy selection, gathered during prepare.
#[derive(Debug, Clone)]
pub struct LayerRequest {
    /// The kernel supports unprivileged-enough overlay mounts.
    pub kernel_overlay: bool,
    /// The image root is a plain directory rather than an image file.
    pub sandbox_image: bool,
    /// Filesystem magic of the filesystem holding the image root.
    pub image_fs_magic: i64,
    /// The image (or one of its partitions) is writable.
    pub writable_image: bool,
    /// A writable tmpfs upper layer was requested.
    pub writable_tmpfs: bool,
    /// A user namespace was requested.
    pub user_namespace: bool,
}

/// Pick the layering strategy once, at prepare time.
///
/// Administrator policy wins, then kernel support, then the
/// compatibility of the filesystem under a sandbox image.
pub fn select_strategy(
    config: &EngineConfig,
    request: &LayerRequest,
) -> VesselResult<LayerStrategy> {
    let overlay_allowed = config.enable_overlay != OverlayMode::No;

    if request.writable_tmpfs && !overlay_allowed {
        return Err(VesselError::Config {
            message: "writable-tmpfs requires overlay support, disabled by configuration"
                .to_string(),
        });
    }

    if config.enable_underlay == UnderlayMode::Preferred {
        return Ok(LayerStrategy::Underlay);
    }

    let underlay_allowed = config.enable_underlay != UnderlayMode::No;
    let fallback = if underlay_allowed {
        LayerStrategy::Underlay
    } else {
        LayerStrategy::None
    };

    if !overlay_allowed {
        return Ok(fallback);
    }

    if !request.kernel_overlay {
        if config.enable_overlay == OverlayMode::Yes {
            return Err(VesselError::Config {
                message: "overlay is required by configuration but the kernel lacks support"
                    .to_string(),
            });
        }
        return Ok(fallback);
    }

    // Inside a user namespace overlay mounts need a kernel new enough
    // to allow them unprivileged; only an explicit administrator 'yes'
    // opts in.
    if request.user_namespace && config.enable_overlay != OverlayMode::Yes {
        return Ok(fallback);
    }

    if request.sandbox_image && !overlay_lower_compatible(request.image_fs_magic) {
        tracing::debug!(
            magic = format_args!("{:#x}", request.image_fs_magic),
            "Sandbox image filesystem incompatible with overlay, using underlay"
        );
        return Ok(fallback);
    }

    Ok(LayerStrategy::Overlay)
}

/// Filesystem magics that cannot back an overlay lower directory.
#[must_use]
pub fn overlay_lower_compatible(magic: i64) -> bool {
    !matches!(
        magic,
        NFS_SUPER_MAGIC | FUSE_SUPER_MAGIC | LUSTRE_SUPER_MAGIC | GPFS_SUPER_MAGIC
    )
}

/// Filesystem magics that cannot back an overlay upper directory.
///
/// Stricter than the lower-directory set: remote and stacked
/// filesystems cannot host the overlay index and work directories.
#[must_use]
pub fn overlay_upper_compatible(magic: i64) -> bool {
    !matches!(
        magic,
        NFS_SUPER_MAGIC
            | FUSE_SUPER_MAGIC
            | ECRYPTFS_SUPER_MAGIC
            | LUSTRE_SUPER_MAGIC
            | GPFS_SUPER_MAGIC
            | OVERLAYFS_SUPER_MAGIC
    )
}

const NFS_SUPER_MAGIC: i64 = 0x6969;
const FUSE_SUPER_MAGIC: i64 = 0x6573_5546;
const ECRYPTFS_SUPER_MAGIC: i64 = 0xf15f;
const LUSTRE_SUPER_MAGIC: i64 = 0x0bd0_0bd0;
const GPFS_SUPER_MAGIC: i64 = 0x4750_4653;
const OVERLAYFS_SUPER_MAGIC: i64 = 0x794c_7630;

/// Filesystem magic of the filesystem holding `path`.
#[cfg(target_os = "linux")]
pub fn fs_magic(path: &Path) -> VesselResult<i64> {
    let stat = rustix::fs::statfs(path).map_err(std::io::Error::from)?;
    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_type as i64)
}

#[cfg(not(target_os = "linux"))]
pub fn fs_magic(_path: &Path) -> VesselResult<i64> {
    Err(VesselError::Unsupported {
        feature: "filesystem probing".to_string(),
    })
}

/// An overlay union of lower directories with at most one writable
/// upper/work pair.
#[derive(Debug, Clone, Default)]
pub struct OverlayLayer {
    lower: Vec<PathBuf>,
    upper: Option<PathBuf>,
    work: Option<PathBuf>,
}

impl OverlayLayer {
    /// Create an empty overlay description.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a lower directory.
    ///
    /// Directories are collected in declaration order; later entries
    /// are lower priority, matching overlay `lowerdir` semantics.
    pub fn add_lower(&mut self, dir: impl Into<PathBuf>) {
        self.lower.push(dir.into());
    }

    /// Designate the single writable upper/work pair.
    ///
    /// A second designation is an error and leaves the first setting
    /// untouched.
    pub fn set_upper(
        &mut self,
        upper: impl Into<PathBuf>,
        work: impl Into<PathBuf>,
    ) -> VesselResult<()> {
        if self.upper.is_some() {
            return Err(VesselError::Config {
                message: "overlay upper directory is already set".to_string(),
            });
        }
        self.upper = Some(upper.into());
        self.work = Some(work.into());
        Ok(())
    }

    /// The writable upper directory, if one is set.
    #[must_use]
    pub fn upper(&self) -> Option<&Path> {
        self.upper.as_deref()
    }

    /// Lower directories in priority order.
    #[must_use]
    pub fn lower(&self) -> &[PathBuf] {
        &self.lower
    }

    /// Whether the union will be writable.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.upper.is_some()
    }

    /// The mount point unioning the layers at `destination`.
    pub fn mount_point(&self, destination: &Path) -> VesselResult<MountPoint> {
        if self.lower.is_empty() {
            return Err(VesselError::Config {
                message: "overlay requires at least one lower directory".to_string(),
            });
        }

        let lowerdir = self
            .lower
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        let mut point = MountPoint::filesystem("overlay", destination)
            .with_option(format!("lowerdir={lowerdir}"));

        match (&self.upper, &self.work) {
            (Some(upper), Some(work)) => {
                point = point
                    .with_option(format!("upperdir={}", upper.display()))
                    .with_option(format!("workdir={}", work.display()));
            }
            _ => {
                point = point.with_flags(MountFlagSet {
                    readonly: true,
                    ..MountFlagSet::default()
                });
            }
        }

        Ok(point)
    }

    /// Register the union mount.
    ///
    /// Composition closes the pre-layer phase: everything the union
    /// depends on (partition mounts, the session tmpfs) is registered
    /// under earlier submissions, and mounts from later tags land
    /// inside the composed view.
    pub fn register(&self, registry: &mut Registry, destination: &Path) -> VesselResult<()> {
        registry.add(Tag::PreLayer, self.mount_point(destination)?)
    }
}

/// What one top-level image root entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootEntryKind {
    /// A directory.
    Dir,
    /// A regular file (or anything bindable that is not a directory).
    File,
    /// A symlink with its target.
    Symlink(PathBuf),
}

/// One top-level entry of the image root, however it was enumerated.
///
/// Sandbox roots are read directly; image-file roots are mounted in
/// the container's namespace and enumerated through the privileged
/// channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    /// Entry name.
    pub name: String,
    /// Entry kind.
    pub kind: RootEntryKind,
}

/// Enumerate a host-visible image root (sandbox directories).
pub fn host_root_entries(image_root: &Path) -> VesselResult<Vec<RootEntry>> {
    let mut entries = Vec::new();
    let mut dir_entries: Vec<_> = std::fs::read_dir(image_root)?
        .filter_map(|entry| entry.ok())
        .collect();
    dir_entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in dir_entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        let kind = if file_type.is_symlink() {
            RootEntryKind::Symlink(std::fs::read_link(entry.path())?)
        } else if file_type.is_dir() {
            RootEntryKind::Dir
        } else {
            RootEntryKind::File
        };
        entries.push(RootEntry { name, kind });
    }
    Ok(entries)
}

/// An underlay: no composition mount. Every bind destination missing
/// from the image root is materialized as a real directory in a
/// session-owned copy of the root's top level.
///
/// This trades functionality for independence from kernel overlay
/// support: the view is assembled from one bind per top-level entry,
/// so it cannot present entirely new top-level trees that collide with
/// image content.
#[derive(Debug, Clone)]
pub struct UnderlayLayer {
    root: PathBuf,
}

impl UnderlayLayer {
    /// Create an underlay rooted at a session-owned directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The session-owned directory serving as the composed root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the underlay tree and register its binds.
    ///
    /// For every bind destination whose top-level tree is not already
    /// present among the image root's `entries`, the missing parent
    /// chain is pre-created inside the session. Every top-level image
    /// entry is then bound individually into the underlay root, and the
    /// underlay root is bound as the composed view at `destination`.
    pub fn register(
        &self,
        registry: &mut Registry,
        entries: &[RootEntry],
        image_root: &Path,
        destination: &Path,
        bind_destinations: &[PathBuf],
    ) -> VesselResult<()> {
        std::fs::create_dir_all(&self.root)?;

        let top_level: std::collections::HashSet<&str> =
            entries.iter().map(|e| e.name.as_str()).collect();

        for dest in bind_destinations {
            let relative = dest.strip_prefix("/").unwrap_or(dest);
            let Some(first) = relative
                .components()
                .next()
                .and_then(|c| c.as_os_str().to_str())
            else {
                continue;
            };
            if !top_level.contains(first) {
                let materialized = self.root.join(relative);
                tracing::debug!(
                    destination = %dest.display(),
                    "Materializing bind destination in underlay"
                );
                std::fs::create_dir_all(&materialized)?;
            }
        }

        for entry in entries {
            let target = self.root.join(&entry.name);
            if target.exists() {
                continue;
            }

            match &entry.kind {
                RootEntryKind::Symlink(link) => {
                    std::os::unix::fs::symlink(link, &target)?;
                    continue;
                }
                RootEntryKind::Dir => {
                    std::fs::create_dir(&target)?;
                }
                RootEntryKind::File => {
                    std::fs::File::create(&target)?;
                }
            }

            registry.add(
                Tag::PreLayer,
                MountPoint::bind(image_root.join(&entry.name), target).with_flags(
                    MountFlagSet {
                        bind: true,
                        recursive: true,
                        ..MountFlagSet::default()
                    },
                ),
            )?;
        }

        registry.add(
            Tag::PreLayer,
            MountPoint::bind(&self.root, destination).with_flags(MountFlagSet {
                bind: true,
                recursive: true,
                ..MountFlagSet::default()
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_common::config::EngineConfig;

    fn plain_request() -> LayerRequest {
        LayerRequest {
            kernel_overlay: true,
            sandbox_image: false,
            image_fs_magic: 0xef53, // ext4
            writable_image: false,
            writable_tmpfs: false,
            user_namespace: false,
        }
    }

    #[test]
    fn overlay_selected_by_default() {
        let config = EngineConfig::default();
        let strategy = select_strategy(&config, &plain_request()).unwrap();
        assert_eq!(strategy, LayerStrategy::Overlay);
    }

    #[test]
    fn writable_tmpfs_without_overlay_is_a_config_error() {
        let config = EngineConfig::parse("enable overlay = no\n").unwrap();
        let request = LayerRequest {
            writable_tmpfs: true,
            ..plain_request()
        };
        let err = select_strategy(&config, &request).unwrap_err();
        assert!(err.to_string().contains("writable-tmpfs requires overlay"));
    }

    #[test]
    fn nfs_sandbox_silently_selects_underlay() {
        let config = EngineConfig::default();
        let request = LayerRequest {
            sandbox_image: true,
            image_fs_magic: NFS_SUPER_MAGIC,
            ..plain_request()
        };
        let strategy = select_strategy(&config, &request).unwrap();
        assert_eq!(strategy, LayerStrategy::Underlay);
    }

    #[test]
    fn missing_kernel_support_falls_back() {
        let config = EngineConfig::default();
        let request = LayerRequest {
            kernel_overlay: false,
            ..plain_request()
        };
        assert_eq!(
            select_strategy(&config, &request).unwrap(),
            LayerStrategy::Underlay
        );

        let strict = EngineConfig::parse("enable overlay = yes\n").unwrap();
        assert!(select_strategy(&strict, &request).is_err());
    }

    #[test]
    fn underlay_preferred_wins() {
        let config = EngineConfig::parse("enable underlay = preferred\n").unwrap();
        assert_eq!(
            select_strategy(&config, &plain_request()).unwrap(),
            LayerStrategy::Underlay
        );
    }

    #[test]
    fn upper_uniqueness_preserves_first_setting() {
        let mut layer = OverlayLayer::new();
        layer.add_lower("/image/root");
        layer.set_upper("/session/upper", "/session/work").unwrap();

        let err = layer.set_upper("/other/upper", "/other/work").unwrap_err();
        assert!(err.to_string().contains("already set"));
        assert_eq!(layer.upper(), Some(Path::new("/session/upper")));
    }

    #[test]
    fn overlay_mount_options_order_lowers_by_declaration() {
        let mut layer = OverlayLayer::new();
        layer.add_lower("/top-priority");
        layer.add_lower("/lower-priority");
        layer.set_upper("/upper", "/work").unwrap();

        let point = layer.mount_point(Path::new("/final")).unwrap();
        assert_eq!(
            point.options_string(),
            "lowerdir=/top-priority:/lower-priority,upperdir=/upper,workdir=/work"
        );
        assert!(point.is_overlay());
    }

    #[test]
    fn readonly_overlay_has_no_upper() {
        let mut layer = OverlayLayer::new();
        layer.add_lower("/image/root");

        let point = layer.mount_point(Path::new("/final")).unwrap();
        assert!(point.flags.readonly);
        assert!(!point.options_string().contains("upperdir"));
    }

    #[test]
    fn underlay_materializes_missing_destinations() {
        let temp = tempfile::tempdir().unwrap();
        let image_root = temp.path().join("image");
        std::fs::create_dir_all(image_root.join("etc")).unwrap();
        std::fs::create_dir_all(image_root.join("usr")).unwrap();

        let underlay_root = temp.path().join("underlay");
        let final_dir = temp.path().join("final");
        std::fs::create_dir_all(&final_dir).unwrap();

        let mut registry = Registry::new();
        let layer = UnderlayLayer::new(&underlay_root);
        let entries = host_root_entries(&image_root).unwrap();
        layer
            .register(
                &mut registry,
                &entries,
                &image_root,
                &final_dir,
                &[PathBuf::from("/data/input"), PathBuf::from("/etc")],
            )
            .unwrap();

        // /data/input is absent from the image and was materialized;
        // /etc exists in the image and was not.
        assert!(underlay_root.join("data/input").is_dir());
        // Two entry binds plus the composed-view bind.
        assert_eq!(registry.by_tag(Tag::PreLayer).len(), 3);
    }

    #[test]
    fn host_enumeration_preserves_symlinks() {
        let temp = tempfile::tempdir().unwrap();
        let image_root = temp.path().join("image");
        std::fs::create_dir_all(image_root.join("usr/bin")).unwrap();
        std::os::unix::fs::symlink("usr/bin", image_root.join("bin")).unwrap();

        let entries = host_root_entries(&image_root).unwrap();
        assert_eq!(
            entries,
            vec![
                RootEntry {
                    name: "bin".to_string(),
                    kind: RootEntryKind::Symlink(PathBuf::from("usr/bin")),
                },
                RootEntry {
                    name: "usr".to_string(),
                    kind: RootEntryKind::Dir,
                },
            ]
        );
    }
}
