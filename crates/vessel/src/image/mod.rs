//! Image resolution and attachment.
//!
//! An image arrives here already resolved (pull, signature checks and
//! format parsing are external collaborators): a path plus a set of
//! partitions with known types and offsets. This module turns that into
//! mountable resources: loop attachments, exclusive write locks and the
//! pluggable driver interface.

mod driver;
mod loopdev;

pub use driver::{AttachedResource, DriverFeatures, ImageDriver, LoopAttachDriver};
pub use loopdev::attach as loop_attach;

use std::fs::File;
use std::path::{Path, PathBuf};

use vessel_common::{EngineConfig, VesselError, VesselResult};

/// Filesystem type of one image partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// A squashfs filesystem.
    Squashfs,
    /// An ext3 filesystem.
    Ext3,
    /// A LUKS-encrypted squashfs filesystem.
    EncryptedSquashfs,
    /// A plain directory tree (sandbox image).
    SandboxDir,
}

impl PartitionKind {
    /// The kernel filesystem type used to mount the partition.
    #[must_use]
    pub fn fstype(self) -> &'static str {
        match self {
            Self::Squashfs | Self::EncryptedSquashfs => "squashfs",
            Self::Ext3 => "ext3",
            Self::SandboxDir => "",
        }
    }
}

/// What a partition contributes to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionUsage {
    /// The root filesystem.
    Rootfs,
    /// An overlay layer.
    Overlay,
    /// Plain data exposed inside the container.
    Data,
}

/// One partition of a resolved image.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Filesystem type.
    pub kind: PartitionKind,
    /// Role in the container.
    pub usage: PartitionUsage,
    /// Byte offset inside the image file.
    pub offset: u64,
    /// Size in bytes, 0 for the rest of the file.
    pub size: u64,
}

/// A resolved, opened container image.
#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    writable: bool,
    partitions: Vec<Partition>,
    /// Exclusive lock handle for writable ext3 partitions.
    lock: Option<File>,
}

impl Image {
    /// An image file with pre-parsed partitions.
    pub fn new(
        path: impl Into<PathBuf>,
        writable: bool,
        partitions: Vec<Partition>,
    ) -> VesselResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(VesselError::Attach {
                message: format!("image {} does not exist", path.display()),
            });
        }

        Ok(Self {
            path,
            writable,
            partitions,
            lock: None,
        })
    }

    /// A sandbox directory image.
    pub fn sandbox(path: impl Into<PathBuf>, writable: bool) -> VesselResult<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(VesselError::Attach {
                message: format!("sandbox {} is not a directory", path.display()),
            });
        }

        Ok(Self {
            path,
            writable,
            partitions: vec![Partition {
                kind: PartitionKind::SandboxDir,
                usage: PartitionUsage::Rootfs,
                offset: 0,
                size: 0,
            }],
            lock: None,
        })
    }

    /// The image path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the image was requested writable.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Whether the image root is a plain directory.
    #[must_use]
    pub fn is_sandbox(&self) -> bool {
        matches!(
            self.root_partition().map(|p| p.kind),
            Some(PartitionKind::SandboxDir)
        )
    }

    /// The root filesystem partition.
    #[must_use]
    pub fn root_partition(&self) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.usage == PartitionUsage::Rootfs)
    }

    /// Overlay partitions in declaration order.
    pub fn overlay_partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions
            .iter()
            .filter(|p| p.usage == PartitionUsage::Overlay)
    }

    /// All partitions in declaration order.
    #[must_use]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Whether any partition is encrypted.
    #[must_use]
    pub fn has_encrypted_partition(&self) -> bool {
        self.partitions
            .iter()
            .any(|p| p.kind == PartitionKind::EncryptedSquashfs)
    }

    /// Reject image formats the administrator has disallowed.
    pub fn check_allowed(&self, config: &EngineConfig) -> VesselResult<()> {
        for partition in &self.partitions {
            let (allowed, what) = match partition.kind {
                PartitionKind::Squashfs => (config.allow_container_squashfs, "squashfs"),
                PartitionKind::Ext3 => (config.allow_container_extfs, "extfs"),
                PartitionKind::EncryptedSquashfs => {
                    (config.allow_container_encrypted, "encrypted")
                }
                PartitionKind::SandboxDir => (config.allow_container_dir, "directory"),
            };
            if !allowed {
                return Err(VesselError::Config {
                    message: format!("{what} images are disallowed by configuration"),
                });
            }
        }
        Ok(())
    }

    /// Take the exclusive write lock required for ext3 partitions.
    ///
    /// Writable ext filesystems tolerate only one writer; the lock is
    /// held for the container's duration and released on drop.
    pub fn lock_exclusive(&mut self) -> VesselResult<()> {
        let needs_lock = self
            .partitions
            .iter()
            .any(|p| p.kind == PartitionKind::Ext3);
        if !needs_lock || self.lock.is_some() {
            return Ok(());
        }

        let file = File::open(&self.path)?;
        rustix::fs::flock(
            &file,
            if self.writable {
                rustix::fs::FlockOperation::NonBlockingLockExclusive
            } else {
                rustix::fs::FlockOperation::NonBlockingLockShared
            },
        )
        .map_err(|e| {
            if e == rustix::io::Errno::WOULDBLOCK {
                VesselError::Attach {
                    message: format!(
                        "image {} is locked by another container",
                        self.path.display()
                    ),
                }
            } else {
                VesselError::Io(e.into())
            }
        })?;

        tracing::debug!(
            image = %self.path.display(),
            writable = self.writable,
            "Locked image partition"
        );
        self.lock = Some(file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squashfs_image(path: &Path) -> Image {
        Image::new(
            path,
            false,
            vec![Partition {
                kind: PartitionKind::Squashfs,
                usage: PartitionUsage::Rootfs,
                offset: 4096,
                size: 0,
            }],
        )
        .unwrap()
    }

    #[test]
    fn missing_image_is_an_attach_error() {
        let err = Image::new("/nonexistent.sif", false, Vec::new()).unwrap_err();
        assert!(matches!(err, VesselError::Attach { .. }));
    }

    #[test]
    fn sandbox_detection() {
        let temp = tempfile::tempdir().unwrap();
        let image = Image::sandbox(temp.path(), true).unwrap();
        assert!(image.is_sandbox());
        assert_eq!(
            image.root_partition().unwrap().kind,
            PartitionKind::SandboxDir
        );
    }

    #[test]
    fn disallowed_format_is_a_config_error() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let image = squashfs_image(temp.path());

        let config = EngineConfig::parse("allow container squashfs = no\n").unwrap();
        let err = image.check_allowed(&config).unwrap_err();
        assert!(err.to_string().contains("squashfs images are disallowed"));

        assert!(image.check_allowed(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn ext3_lock_is_exclusive_per_image() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let mut first = Image::new(
            temp.path(),
            true,
            vec![Partition {
                kind: PartitionKind::Ext3,
                usage: PartitionUsage::Rootfs,
                offset: 0,
                size: 0,
            }],
        )
        .unwrap();
        first.lock_exclusive().unwrap();

        let mut second = Image::new(
            temp.path(),
            true,
            vec![Partition {
                kind: PartitionKind::Ext3,
                usage: PartitionUsage::Rootfs,
                offset: 0,
                size: 0,
            }],
        )
        .unwrap();
        let err = second.lock_exclusive().unwrap_err();
        assert!(err.to_string().contains("locked by another container"));
    }

    #[test]
    fn squashfs_needs_no_lock() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let mut image = squashfs_image(temp.path());
        image.lock_exclusive().unwrap();
        assert!(image.lock.is_none());
    }
}
