//! The container lifecycle controller.
//!
//! A finite state machine sequencing Prepare → Create → Run → Monitor →
//! Cleanup. All per-execution handles (the privileged channel, the
//! session, the image driver, the applied-mount list, network and
//! cgroup placement) live on one [`ContainerExecution`] context object,
//! written during Create and consumed by Cleanup.

mod cleanup;
mod create;
mod monitor;
mod prepare;

pub use monitor::SignalSource;
pub use prepare::ExecutionPlan;

use std::path::PathBuf;
use std::sync::Arc;

use vessel_common::{EngineConfig, VesselPaths, VesselResult};

use crate::image::{Image, ImageDriver, Partition};
use crate::mount::Registry;
use crate::namespace::NamespaceConfig;
use crate::plugin::PluginRegistry;
use crate::privop::Channel;
use crate::session::Session;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, nothing validated yet.
    New,
    /// Configuration validated, capability and namespace sets resolved.
    Prepared,
    /// Mounts applied, final view entered.
    Created,
    /// Container leader started.
    Running,
    /// Supervising the leader.
    Monitoring,
    /// All resources released.
    CleanedUp,
    /// Terminal failure; reachable from any state.
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Prepared => "prepared",
            Self::Created => "created",
            Self::Running => "running",
            Self::Monitoring => "monitoring",
            Self::CleanedUp => "cleaned up",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// One user-requested bind mount.
#[derive(Debug, Clone)]
pub struct BindSpec {
    /// Host path.
    pub source: PathBuf,
    /// Container path.
    pub destination: PathBuf,
    /// Remount read-only after binding.
    pub readonly: bool,
}

/// The declarative request for one container run.
///
/// Arrives fully resolved: image pulling, build-definition parsing and
/// command-line handling are external collaborators.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image path (file or sandbox directory).
    pub image: PathBuf,
    /// Image partitions; empty means a sandbox directory.
    pub partitions: Vec<Partition>,
    /// Open the image writable.
    pub writable: bool,
    /// Compose a writable tmpfs upper layer.
    pub writable_tmpfs: bool,
    /// Entry process argv.
    pub command: Vec<String>,
    /// Entry process environment.
    pub env: Vec<(String, String)>,
    /// Initial working directory.
    pub cwd: Option<PathBuf>,
    /// Container hostname (requires a UTS namespace).
    pub hostname: Option<String>,
    /// User-requested bind mounts.
    pub binds: Vec<BindSpec>,
    /// Scratch directories to create inside the container.
    pub scratch: Vec<PathBuf>,
    /// Requested namespaces.
    pub namespaces: NamespaceConfig,
    /// Simulate root via UID/GID mapping.
    pub fakeroot: bool,
    /// Do not interpose the reaping shim as PID namespace init.
    pub no_init: bool,
    /// Capability add requests.
    pub add_caps: Vec<String>,
    /// Capability drop requests.
    pub drop_caps: Vec<String>,
    /// Place the leader in a cgroup.
    pub use_cgroup: bool,
    /// Persist an instance record under this name.
    pub instance_name: Option<String>,
    /// Decryption key for encrypted partitions.
    pub key: Option<Vec<u8>>,
}

impl ContainerSpec {
    /// A minimal spec running `command` in `image`.
    #[must_use]
    pub fn new(image: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            partitions: Vec::new(),
            writable: false,
            writable_tmpfs: false,
            command,
            env: Vec::new(),
            cwd: None,
            hostname: None,
            binds: Vec::new(),
            scratch: Vec::new(),
            namespaces: NamespaceConfig::minimal(),
            fakeroot: false,
            no_init: false,
            add_caps: Vec::new(),
            drop_caps: Vec::new(),
            use_cgroup: false,
            instance_name: None,
            key: None,
        }
    }
}

/// Network namespace bookkeeping for one execution.
///
/// CNI-style plumbing is an external collaborator; the engine records
/// the namespace join path for instance persistence and logs teardown.
#[derive(Debug)]
pub struct NetworkHandle {
    /// Namespace join path of the leader.
    pub netns_path: PathBuf,
}

impl NetworkHandle {
    /// The handle for a started leader.
    #[must_use]
    pub fn for_leader(pid: i32) -> Self {
        Self {
            netns_path: PathBuf::from(format!("/proc/{pid}/ns/net")),
        }
    }

    /// Release network state. The namespace itself dies with the
    /// leader.
    pub fn teardown(&self) {
        tracing::debug!(netns = %self.netns_path.display(), "Network namespace released");
    }
}

/// The execution context for one container run.
pub struct ContainerExecution {
    pub(crate) state: State,
    pub(crate) config: EngineConfig,
    pub(crate) paths: VesselPaths,
    pub(crate) spec: ContainerSpec,
    pub(crate) plan: Option<ExecutionPlan>,
    pub(crate) image: Option<Image>,
    pub(crate) channel: Option<Channel>,
    pub(crate) helper_pid: Option<libc::pid_t>,
    pub(crate) session: Option<Session>,
    pub(crate) registry: Registry,
    pub(crate) driver: Option<Arc<dyn ImageDriver>>,
    pub(crate) crypt_mappers: Vec<String>,
    pub(crate) cgroup: Option<crate::cgroup::CgroupHandle>,
    pub(crate) network: Option<NetworkHandle>,
    pub(crate) leader_pid: Option<i32>,
}

impl ContainerExecution {
    /// A fresh execution context.
    #[must_use]
    pub fn new(config: EngineConfig, paths: VesselPaths, spec: ContainerSpec) -> Self {
        Self {
            state: State::New,
            config,
            paths,
            spec,
            plan: None,
            image: None,
            channel: None,
            helper_pid: None,
            session: None,
            registry: Registry::new(),
            driver: None,
            crypt_mappers: Vec::new(),
            cgroup: None,
            network: None,
            leader_pid: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// The resolved execution plan, after prepare.
    #[must_use]
    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    pub(crate) fn expect_state(&self, expected: State) -> VesselResult<()> {
        if self.state != expected {
            return Err(vessel_common::VesselError::Internal {
                message: format!(
                    "lifecycle is {}, expected {} for this transition",
                    self.state, expected
                ),
            });
        }
        Ok(())
    }

    /// Drive the full lifecycle: prepare, create, start, monitor.
    ///
    /// Cleanup always runs afterwards, regardless of how the container
    /// terminated; it logs its own failures and never masks the run's
    /// result.
    pub fn run(&mut self, plugins: &PluginRegistry) -> VesselResult<i32> {
        let result = self.run_phases(plugins);

        self.cleanup(plugins);

        match result {
            Ok(status) => Ok(status),
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    fn run_phases(&mut self, plugins: &PluginRegistry) -> VesselResult<i32> {
        self.prepare()?;
        self.create(plugins)?;
        let pid = self.start(plugins)?;
        self.monitor(plugins, pid)
    }
}

impl std::fmt::Debug for ContainerExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerExecution")
            .field("state", &self.state)
            .field("image", &self.spec.image)
            .field("leader_pid", &self.leader_pid)
            .finish()
    }
}
