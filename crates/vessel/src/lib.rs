//! # Vessel Execution Engine
//!
//! Vessel is a privilege-separated container execution engine: given a
//! resolved image and a declarative set of namespace, mount and
//! capability requests, it composes an isolated root filesystem view,
//! establishes Linux namespaces, performs privilege-separated mount
//! operations, attaches loop and image resources, and supervises the
//! container process through its lifecycle.
//!
//! ## Architecture
//!
//! - **Mount orchestration**: an ordered, tag-scheduled mount-point
//!   registry with deterministic hook interleaving
//! - **Session/layer building**: overlay, underlay or plain views of
//!   the final root filesystem, chosen at prepare time
//! - **Privileged operation channel**: an unprivileged supervisor
//!   delegates specific syscalls to a privileged helper, which narrows
//!   its capabilities per operation
//! - **Image attachment**: loop devices, partition offsets, encrypted
//!   partitions, and pluggable alternative drivers
//! - **Lifecycle control**: Prepare → Create → Run → Monitor, with
//!   cleanup guaranteed regardless of outcome
//!
//! ## Usage
//!
//! ```no_run
//! use vessel::lifecycle::{ContainerExecution, ContainerSpec};
//! use vessel::plugin::PluginRegistry;
//! use vessel_common::{EngineConfig, VesselPaths};
//!
//! # fn example() -> vessel_common::VesselResult<()> {
//! let spec = ContainerSpec::new("/images/base.sif", vec!["/bin/sh".to_string()]);
//! let mut execution =
//!     ContainerExecution::new(EngineConfig::default(), VesselPaths::new(), spec);
//!
//! let plugins = PluginRegistry::new();
//! let status = execution.run(&plugins)?;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod capability;
pub mod cgroup;
pub mod fakeroot;
pub mod image;
pub mod instance;
pub mod lifecycle;
pub mod mount;
pub mod namespace;
pub mod plugin;
pub mod privop;
pub mod session;

pub use lifecycle::{ContainerExecution, ContainerSpec};
