//! Pluggable image attachment drivers.

use std::path::PathBuf;

use vessel_common::{EngineConfig, VesselError, VesselResult};

use super::{Image, Partition, PartitionKind};
use crate::privop::{Channel, LoopMode};

/// What an image driver can do.
///
/// Drivers must report their feature set truthfully: the session/layer
/// builder branches on it before relying on the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverFeatures {
    /// The driver can perform FUSE-based mounts.
    pub fuse: bool,
    /// The driver can compose overlay views itself.
    pub overlay: bool,
    /// The driver can mount a whole image without partition addressing.
    pub whole_image: bool,
}

/// A mountable resource produced by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachedResource {
    /// A block device to mount with the partition's filesystem type.
    Device(PathBuf),
    /// A directory to bind.
    Directory(PathBuf),
}

/// Resolves image partitions into mountable resources.
pub trait ImageDriver: Send + Sync {
    /// The driver name, matched against the `image driver` directive.
    fn name(&self) -> &str;

    /// The driver's supported feature set.
    fn features(&self) -> DriverFeatures;

    /// Resolve one partition into a mountable resource.
    fn attach(
        &self,
        channel: &mut Channel,
        image: &Image,
        partition: &Partition,
        config: &EngineConfig,
    ) -> VesselResult<AttachedResource>;

    /// Stop anything the driver started. Called by cleanup; must be
    /// idempotent.
    fn stop(&self) -> VesselResult<()> {
        Ok(())
    }
}

/// The built-in driver: loop devices through the privileged channel.
#[derive(Debug, Default)]
pub struct LoopAttachDriver;

impl ImageDriver for LoopAttachDriver {
    fn name(&self) -> &str {
        "loop"
    }

    fn features(&self) -> DriverFeatures {
        DriverFeatures {
            fuse: false,
            overlay: false,
            whole_image: false,
        }
    }

    fn attach(
        &self,
        channel: &mut Channel,
        image: &Image,
        partition: &Partition,
        config: &EngineConfig,
    ) -> VesselResult<AttachedResource> {
        if partition.kind == PartitionKind::SandboxDir {
            return Ok(AttachedResource::Directory(image.path().to_path_buf()));
        }

        let mode = if image.writable() {
            LoopMode::ReadWrite
        } else {
            LoopMode::ReadOnly
        };

        let device = channel
            .loop_attach(
                image.path(),
                mode,
                partition.offset,
                partition.size,
                config.max_loop_devices,
                config.shared_loop_devices,
            )
            .map_err(|e| match e.remote_errno() {
                Some(errno) if errno == libc::ENOSPC => VesselError::LoopCapacity {
                    max: config.max_loop_devices,
                },
                _ => e,
            })?;

        Ok(AttachedResource::Device(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_driver_reports_no_extra_features() {
        let driver = LoopAttachDriver;
        assert_eq!(driver.name(), "loop");
        assert_eq!(driver.features(), DriverFeatures::default());
    }

    #[test]
    fn capacity_errno_maps_to_capacity_error() {
        // The mapping itself, without a kernel: a Remote ENOSPC from
        // the helper must surface as the capacity error.
        let err = VesselError::Remote {
            operation: "loop attach".to_string(),
            path: PathBuf::from("/images/base.sif"),
            errno: libc::ENOSPC,
        };
        let config = EngineConfig::default();
        let mapped = match err.remote_errno() {
            Some(errno) if errno == libc::ENOSPC => VesselError::LoopCapacity {
                max: config.max_loop_devices,
            },
            _ => err,
        };
        assert!(matches!(mapped, VesselError::LoopCapacity { max: 256 }));
    }
}
