//! Prepare: validate configuration, resolve capability and namespace
//! sets, pick the layering strategy.
//!
//! Everything here fails before any mount happens; prepare errors are
//! configuration or privilege errors, never partial state.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use vessel_common::{VesselError, VesselResult};

use crate::capability::{resolve_container_caps, CapabilityPolicy, CapabilitySet};
use crate::fakeroot;
use crate::image::Image;
use crate::namespace::{IdMapping, NamespaceConfig};
use crate::session::{fs_magic, select_strategy, LayerRequest, LayerStrategy, SessionFs};

use super::{ContainerExecution, State};

/// The immutable outcome of prepare, consumed by create.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Resolved namespace set.
    pub namespaces: NamespaceConfig,
    /// UID mappings for the user namespace.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings for the user namespace.
    pub gid_mappings: Vec<IdMapping>,
    /// The container's capability set.
    pub capabilities: CapabilitySet,
    /// The selected layering strategy.
    pub strategy: LayerStrategy,
    /// Backing store for the session staging root.
    pub session_fs: SessionFs,
}

impl ContainerExecution {
    /// Validate the request and resolve the execution plan.
    pub fn prepare(&mut self) -> VesselResult<()> {
        self.expect_state(State::New)?;
        tracing::info!(image = %self.spec.image.display(), "Preparing container");

        validate_config_ownership(&self.paths.engine_config())?;

        // Resolve and gate the image.
        let image = if self.spec.partitions.is_empty() {
            Image::sandbox(&self.spec.image, self.spec.writable)?
        } else {
            Image::new(
                &self.spec.image,
                self.spec.writable,
                self.spec.partitions.clone(),
            )?
        };
        image.check_allowed(&self.config)?;

        if image.has_encrypted_partition() && self.spec.key.is_none() {
            return Err(VesselError::Config {
                message: "image has an encrypted partition but no key was provided".to_string(),
            });
        }

        // Namespaces: the mount namespace is the engine's baseline and
        // always part of the set.
        let mut namespaces = self.spec.namespaces.clone();
        namespaces.mount = true;
        if self.spec.fakeroot {
            namespaces.user = true;
        }
        if self.spec.hostname.is_some() {
            namespaces.uts = true;
        }
        namespaces.validate(&self.config)?;

        // Fakeroot mappings come from the subordinate-ID allocation.
        let (uid_mappings, gid_mappings) = if self.spec.fakeroot {
            let uid = rustix::process::getuid().as_raw();
            let gid = rustix::process::getgid().as_raw();
            let user = std::env::var("USER").unwrap_or_else(|_| uid.to_string());

            let uid_range =
                fakeroot::read_range(Path::new(fakeroot::SUBUID_PATH), &user, uid)?;
            let gid_range =
                fakeroot::read_range(Path::new(fakeroot::SUBGID_PATH), &user, gid)?;

            (
                fakeroot::fakeroot_mappings(uid, uid_range),
                fakeroot::fakeroot_mappings(gid, gid_range),
            )
        } else if namespaces.user {
            (
                vec![IdMapping::current_user_as_root()],
                vec![IdMapping {
                    container_id: 0,
                    host_id: rustix::process::getgid().as_raw(),
                    size: 1,
                }],
            )
        } else {
            (Vec::new(), Vec::new())
        };

        // Capability resolution against the authorization policy.
        let uid = rustix::process::getuid().as_raw();
        let user = std::env::var("USER").unwrap_or_else(|_| uid.to_string());
        let policy = CapabilityPolicy::load(&self.paths.capability_policy())?;
        let capabilities = resolve_container_caps(
            self.config.root_default_capabilities,
            uid,
            &user,
            &[],
            &policy,
            &self.spec.add_caps,
            &self.spec.drop_caps,
        )?;

        // Layer strategy, fixed for the rest of the lifecycle.
        let request = LayerRequest {
            kernel_overlay: kernel_supports_overlay(),
            sandbox_image: image.is_sandbox(),
            image_fs_magic: fs_magic(&self.spec.image).unwrap_or(0),
            writable_image: self.spec.writable,
            writable_tmpfs: self.spec.writable_tmpfs,
            user_namespace: namespaces.user,
        };
        let strategy = select_strategy(&self.config, &request)?;

        tracing::debug!(
            %strategy,
            fakeroot = self.spec.fakeroot,
            capabilities = capabilities.names().len(),
            "Prepared execution plan"
        );

        // The size-limited tmpfs only matters when the session holds
        // writable container content.
        let session_fs = if self.spec.writable_tmpfs
            || self.config.mount_tmp
            || !self.spec.scratch.is_empty()
        {
            SessionFs::Tmpfs
        } else {
            SessionFs::Dir
        };

        self.image = Some(image);
        self.plan = Some(ExecutionPlan {
            namespaces,
            uid_mappings,
            gid_mappings,
            capabilities,
            strategy,
            session_fs,
        });
        self.state = State::Prepared;
        Ok(())
    }
}

/// When running from a privilege-elevating install, the engine
/// configuration must belong to root; anything else would let the
/// invoking user feed directives to a privileged process.
fn validate_config_ownership(config_path: &Path) -> VesselResult<()> {
    let elevated =
        rustix::process::geteuid().is_root() && !rustix::process::getuid().is_root();
    if !elevated {
        return Ok(());
    }

    let metadata = match std::fs::metadata(config_path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(VesselError::Io(e)),
    };

    if metadata.uid() != 0 {
        return Err(VesselError::Privilege {
            message: format!(
                "configuration file {} is not owned by root",
                config_path.display()
            ),
        });
    }
    Ok(())
}

/// Probe the kernel's overlay support.
fn kernel_supports_overlay() -> bool {
    std::fs::read_to_string("/proc/filesystems")
        .map(|content| content.lines().any(|line| line.trim_end().ends_with("overlay")))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ContainerSpec;
    use vessel_common::{EngineConfig, VesselPaths};

    fn sandbox_execution(temp: &Path) -> ContainerExecution {
        let rootfs = temp.join("image");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();

        ContainerExecution::new(
            EngineConfig::default(),
            VesselPaths::with_root(temp.join("state")),
            ContainerSpec::new(rootfs, vec!["/bin/sh".to_string()]),
        )
    }

    #[test]
    fn prepare_resolves_a_plan() {
        let temp = tempfile::tempdir().unwrap();
        let mut execution = sandbox_execution(temp.path());

        execution.prepare().unwrap();
        assert_eq!(execution.state(), State::Prepared);

        let plan = execution.plan().unwrap();
        assert!(plan.namespaces.mount);
        assert!(plan.uid_mappings.is_empty());
    }

    #[test]
    fn encrypted_image_without_key_is_rejected() {
        use crate::image::{Partition, PartitionKind, PartitionUsage};

        let temp = tempfile::tempdir().unwrap();
        let image = temp.path().join("locked.sif");
        std::fs::write(&image, b"").unwrap();

        let mut spec = ContainerSpec::new(&image, vec!["/bin/sh".to_string()]);
        spec.partitions = vec![Partition {
            kind: PartitionKind::EncryptedSquashfs,
            usage: PartitionUsage::Rootfs,
            offset: 4096,
            size: 0,
        }];

        let mut execution = ContainerExecution::new(
            EngineConfig::default(),
            VesselPaths::with_root(temp.path().join("state")),
            spec,
        );
        let err = execution.prepare().unwrap_err();
        assert!(err.to_string().contains("no key was provided"));
        assert_eq!(execution.state(), State::New);
    }

    #[test]
    fn disallowed_namespace_fails_prepare() {
        let temp = tempfile::tempdir().unwrap();
        let mut execution = sandbox_execution(temp.path());
        execution.spec.namespaces.net = true;

        let err = execution.prepare().unwrap_err();
        assert!(err.to_string().contains("net namespace is disallowed"));
    }

    #[test]
    fn hostname_request_implies_uts() {
        let temp = tempfile::tempdir().unwrap();
        let mut execution = sandbox_execution(temp.path());
        execution.spec.hostname = Some("analysis".to_string());

        execution.prepare().unwrap();
        assert!(execution.plan().unwrap().namespaces.uts);
    }

    #[test]
    fn config_ownership_is_skipped_when_not_elevated() {
        // The test process is not setuid; any file passes.
        let temp = tempfile::NamedTempFile::new().unwrap();
        validate_config_ownership(temp.path()).unwrap();
    }
}
