//! Create: compute mount points, execute the schedule, enter the view.
//!
//! Everything here runs in the supervisor; concrete mounts cross the
//! privileged channel into the helper, which lives inside the
//! container's namespaces. Directory and file staging under the
//! session is shared between both sides; mounted content is private to
//! the helper and is inspected through the channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use vessel_common::config::DevMode;
use vessel_common::{VesselError, VesselResult};

use crate::cgroup::CgroupHandle;
use crate::image::{AttachedResource, ImageDriver, LoopAttachDriver, PartitionKind};
use crate::instance::{InstanceRecord, InstanceStore};
use crate::mount::{MountFlagSet, MountPoint, Scheduler, Tag};
use crate::plugin::PluginRegistry;
use crate::privop::Channel;
use crate::session::{
    host_root_entries, LayerStrategy, OverlayLayer, RootEntry, RootEntryKind, Session,
    UnderlayLayer,
};

use super::{ContainerExecution, NetworkHandle, State};

impl ContainerExecution {
    /// Build the root filesystem view and enter it.
    pub fn create(&mut self, plugins: &PluginRegistry) -> VesselResult<()> {
        self.expect_state(State::Prepared)?;
        let plan = self.plan.clone().ok_or_else(|| VesselError::Internal {
            message: "create without a prepared plan".to_string(),
        })?;

        tracing::info!(image = %self.spec.image.display(), "Creating container");

        // Writable ext filesystems tolerate one writer only.
        if let Some(image) = self.image.as_mut() {
            image.lock_exclusive()?;
        }

        let (channel, helper_pid) =
            Channel::spawn_helper_in(&plan.namespaces, &plan.uid_mappings, &plan.gid_mappings)?;
        self.channel = Some(channel);
        self.helper_pid = Some(helper_pid);

        let driver: Arc<dyn ImageDriver> = if self.config.image_driver.is_empty() {
            Arc::new(LoopAttachDriver)
        } else {
            plugins
                .image_driver(&self.config.image_driver)
                .ok_or_else(|| VesselError::Config {
                    message: format!(
                        "image driver '{}' is not registered",
                        self.config.image_driver
                    ),
                })?
        };
        self.driver = Some(driver.clone());

        // The container keeps host mounts visible but never leaks its
        // own back out.
        self.registry.add(
            Tag::Rootfs,
            MountPoint {
                source: None,
                destination: PathBuf::from("/"),
                fstype: None,
                flags: MountFlagSet {
                    recursive: true,
                    slave: self.config.mount_slave,
                    private: !self.config.mount_slave,
                    ..MountFlagSet::default()
                },
                options: Vec::new(),
                internal: Default::default(),
            },
        )?;

        let session = Session::new(
            &self.paths.session,
            plan.session_fs,
            self.config.sessiondir_max_size,
            &mut self.registry,
        )?;
        let final_path = session.final_path();

        let mut scheduler: Scheduler<Channel> = Scheduler::new();

        self.register_rootfs(&session, plan.namespaces.ipc, &driver)?;
        let overlay_dirs = self.register_overlay_partitions(&session, &driver)?;

        let bind_destinations = self.collect_bind_destinations();
        self.register_layer(
            &plan.strategy,
            &session,
            &final_path,
            overlay_dirs,
            &bind_destinations,
            &mut scheduler,
        )?;

        self.register_kernel_mounts(&session)?;
        self.register_dev_mounts(&session)?;
        self.register_hostfs_mounts(&session)?;
        self.register_system_binds(&session)?;
        self.register_home(&session)?;
        self.register_user_binds(&session)?;
        self.register_tmp(&session, &mut scheduler)?;
        self.register_scratch(&session, &mut scheduler)?;
        self.register_files_hook(&session, &mut scheduler);
        self.register_cwd(&session)?;

        // Run the schedule: deterministic order, every concrete mount
        // through the privileged channel.
        let channel = self.channel.as_mut().ok_or_else(|| VesselError::Internal {
            message: "channel lost before schedule".to_string(),
        })?;

        // Predictable permissions for everything the helper creates.
        let previous_umask = channel.umask(0o022)?;
        tracing::trace!(previous = format_args!("{previous_umask:04o}"), "Set helper umask");

        scheduler.run(&mut self.registry, channel)?;

        channel.chroot(&final_path)?;
        tracing::debug!(view = %final_path.display(), "Entered final view");

        if self.spec.use_cgroup {
            self.cgroup = match CgroupHandle::create(session.id()) {
                Ok(handle) => Some(handle),
                Err(VesselError::Privilege { .. }) => {
                    tracing::warn!("Cannot create cgroup, continuing without one");
                    None
                }
                Err(e) => return Err(e),
            };
        }

        self.session = Some(session);
        self.state = State::Created;
        Ok(())
    }

    /// Start the container leader.
    pub fn start(&mut self, plugins: &PluginRegistry) -> VesselResult<i32> {
        self.expect_state(State::Created)?;
        let plan = self.plan.clone().ok_or_else(|| VesselError::Internal {
            message: "start without a prepared plan".to_string(),
        })?;

        let shim = plan.namespaces.pid && !self.spec.no_init;
        let hostname = plan
            .namespaces
            .uts
            .then(|| self.spec.hostname.clone())
            .flatten();
        let capabilities = plan.capabilities.names();

        let channel = self.channel.as_mut().ok_or_else(|| VesselError::Internal {
            message: "start without a channel".to_string(),
        })?;
        let pid = channel.exec_container(
            &self.spec.command,
            &self.spec.env,
            self.spec.cwd.as_deref(),
            hostname.as_deref(),
            shim,
            &capabilities,
        )?;
        self.leader_pid = Some(pid);

        tracing::info!(pid, shim, "Container started");

        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.place(pid) {
                tracing::warn!(error = %e, "Cannot place leader in cgroup");
            }
        }

        if plan.namespaces.net {
            self.network = Some(NetworkHandle::for_leader(pid));
        }

        for callback in plugins.post_start_callbacks() {
            callback.post_start(&self.config, pid)?;
        }

        if let Some(name) = &self.spec.instance_name {
            let record = InstanceRecord {
                name: name.clone(),
                uid: rustix::process::getuid().as_raw(),
                gid: rustix::process::getgid().as_raw(),
                pid,
                ppid: std::process::id() as i32,
                image: self.spec.image.clone(),
                ip: None,
                namespace_paths: Default::default(),
                engine_config: serde_json::to_value(&self.config)?,
                started_at: chrono::Utc::now(),
            }
            .with_namespace_paths();
            InstanceStore::new(self.paths.instances()).save(&record)?;
        }

        self.state = State::Running;
        Ok(pid)
    }

    fn register_rootfs(
        &mut self,
        session: &Session,
        isolated_ipc: bool,
        driver: &Arc<dyn ImageDriver>,
    ) -> VesselResult<()> {
        let image = self.image.as_ref().ok_or_else(|| VesselError::Internal {
            message: "create without an image".to_string(),
        })?;
        let root = image
            .root_partition()
            .cloned()
            .ok_or_else(|| VesselError::Attach {
                message: "image has no root partition".to_string(),
            })?;

        let channel = self.channel.as_mut().ok_or_else(|| VesselError::Internal {
            message: "channel lost".to_string(),
        })?;
        let resource = driver.attach(channel, image, &root, &self.config)?;

        let point = match resource {
            AttachedResource::Directory(dir) => {
                MountPoint::bind(dir, session.rootfs_path()).with_flags(MountFlagSet {
                    bind: true,
                    recursive: true,
                    ..MountFlagSet::default()
                })
            }
            AttachedResource::Device(device) => {
                let device = if root.kind == PartitionKind::EncryptedSquashfs {
                    let name = format!("vessel-{}", &session.id()[..8]);
                    let key = self.spec.key.clone().unwrap_or_default();
                    let mapper = channel.decrypt(&device, &key, &name, isolated_ipc)?;
                    self.crypt_mappers.push(name);
                    mapper
                } else {
                    device
                };

                MountPoint {
                    source: Some(device),
                    destination: session.rootfs_path(),
                    fstype: Some(root.kind.fstype().to_string()),
                    flags: MountFlagSet {
                        readonly: !image.writable(),
                        nosuid: false,
                        nodev: true,
                        ..MountFlagSet::default()
                    },
                    options: Vec::new(),
                    internal: Default::default(),
                }
            }
        };

        self.registry.add(Tag::Rootfs, point)
    }

    fn register_overlay_partitions(
        &mut self,
        session: &Session,
        driver: &Arc<dyn ImageDriver>,
    ) -> VesselResult<Vec<(PathBuf, bool)>> {
        let image = self.image.as_ref().ok_or_else(|| VesselError::Internal {
            message: "create without an image".to_string(),
        })?;
        let partitions: Vec<_> = image.overlay_partitions().cloned().collect();

        let mut dirs = Vec::new();
        for (index, partition) in partitions.iter().enumerate() {
            let dir = session.overlay_partition_path(index);
            std::fs::create_dir_all(&dir)?;

            let channel = self.channel.as_mut().ok_or_else(|| VesselError::Internal {
                message: "channel lost".to_string(),
            })?;
            let resource = driver.attach(channel, image, partition, &self.config)?;
            let writable = partition.kind == PartitionKind::Ext3 && image.writable();

            match resource {
                AttachedResource::Directory(source) => {
                    self.registry.add(
                        Tag::Rootfs,
                        MountPoint::bind(source, &dir).with_flags(MountFlagSet {
                            bind: true,
                            recursive: true,
                            ..MountFlagSet::default()
                        }),
                    )?;
                }
                AttachedResource::Device(device) => {
                    self.registry.add(
                        Tag::Rootfs,
                        MountPoint {
                            source: Some(device),
                            destination: dir.clone(),
                            fstype: Some(partition.kind.fstype().to_string()),
                            flags: MountFlagSet {
                                readonly: !writable,
                                nodev: true,
                                ..MountFlagSet::default()
                            },
                            options: Vec::new(),
                            internal: Default::default(),
                        },
                    )?;
                }
            }

            dirs.push((dir, writable));
        }

        Ok(dirs)
    }

    /// Every container path a bind will target; the underlay needs the
    /// list to materialize missing parents.
    fn collect_bind_destinations(&self) -> Vec<PathBuf> {
        let mut destinations: Vec<PathBuf> =
            self.spec.binds.iter().map(|b| b.destination.clone()).collect();
        if self.config.mount_home {
            if let Some(home) = dirs::home_dir() {
                destinations.push(home);
            }
        }
        if self.config.mount_tmp {
            destinations.push(PathBuf::from("/tmp"));
            destinations.push(PathBuf::from("/var/tmp"));
        }
        destinations.extend(self.spec.scratch.iter().cloned());
        if let Some(cwd) = &self.spec.cwd {
            destinations.push(cwd.clone());
        }
        destinations
    }

    fn register_layer(
        &mut self,
        strategy: &LayerStrategy,
        session: &Session,
        final_path: &Path,
        overlay_dirs: Vec<(PathBuf, bool)>,
        bind_destinations: &[PathBuf],
        scheduler: &mut Scheduler<Channel>,
    ) -> VesselResult<()> {
        match strategy {
            LayerStrategy::Overlay => {
                let mut layer = OverlayLayer::new();
                for (dir, _) in &overlay_dirs {
                    layer.add_lower(dir);
                }
                layer.add_lower(session.rootfs_path());

                let upper_work = if let Some((dir, _)) =
                    overlay_dirs.iter().find(|(_, writable)| *writable)
                {
                    Some((dir.join("upper"), dir.join("work")))
                } else if self.spec.writable_tmpfs {
                    Some((session.overlay_upper(), session.overlay_work()))
                } else {
                    None
                };

                if let Some((upper, work)) = upper_work {
                    layer.set_upper(&upper, &work)?;

                    // The pair lives on a helper-side mount (the
                    // session tmpfs or a writable image partition);
                    // create it there.
                    scheduler.run_before_tag(Tag::PreLayer, move |_, channel: &mut Channel| {
                        ensure_dir(channel, &upper, 0o755)?;
                        ensure_dir(channel, &work, 0o755)?;
                        Ok(())
                    });
                }

                layer.register(&mut self.registry, final_path)
            }
            LayerStrategy::Underlay => {
                let underlay = UnderlayLayer::new(session.underlay_root());
                let image = self.image.as_ref().ok_or_else(|| VesselError::Internal {
                    message: "create without an image".to_string(),
                })?;

                if image.is_sandbox() {
                    // Sandbox roots are host-visible; build eagerly.
                    let entries = host_root_entries(image.path())?;
                    underlay.register(
                        &mut self.registry,
                        &entries,
                        &session.rootfs_path(),
                        final_path,
                        bind_destinations,
                    )
                } else {
                    // Image-file roots only exist once their partition
                    // is mounted in the helper's namespace; enumerate
                    // through the channel right before composition.
                    let root = session.rootfs_path();
                    let final_path = final_path.to_path_buf();
                    let binds = bind_destinations.to_vec();
                    scheduler.run_before_tag(
                        Tag::PreLayer,
                        move |registry, channel: &mut Channel| {
                            let entries = channel_root_entries(channel, &root)?;
                            underlay.register(registry, &entries, &root, &final_path, &binds)
                        },
                    );
                    Ok(())
                }
            }
            LayerStrategy::None => self.registry.add(
                Tag::PreLayer,
                MountPoint::bind(session.rootfs_path(), final_path).with_flags(MountFlagSet {
                    bind: true,
                    recursive: true,
                    ..MountFlagSet::default()
                }),
            ),
        }
    }

    fn register_kernel_mounts(&mut self, session: &Session) -> VesselResult<()> {
        if self.config.mount_proc {
            self.registry.add(
                Tag::Kernel,
                MountPoint::filesystem("proc", session.in_final("proc"))
                    .with_flags(MountFlagSet::kernel()),
            )?;
        }
        if self.config.mount_sys {
            self.registry.add(
                Tag::Kernel,
                MountPoint::filesystem("sysfs", session.in_final("sys"))
                    .with_flags(MountFlagSet::kernel()),
            )?;
        }
        Ok(())
    }

    fn register_dev_mounts(&mut self, session: &Session) -> VesselResult<()> {
        match self.config.mount_dev {
            DevMode::Yes => {
                self.registry.add(
                    Tag::Dev,
                    MountPoint::bind("/dev", session.in_final("dev")).with_flags(MountFlagSet {
                        bind: true,
                        recursive: true,
                        ..MountFlagSet::default()
                    }),
                )?;
            }
            DevMode::Minimal => {
                self.registry.add(
                    Tag::Dev,
                    MountPoint::filesystem("tmpfs", session.in_final("dev"))
                        .with_flags(MountFlagSet {
                            nosuid: true,
                            ..MountFlagSet::default()
                        })
                        .with_option("mode=0755")
                        .with_option("size=4m"),
                )?;

                for node in ["null", "zero", "full", "random", "urandom", "tty"] {
                    self.registry.add(
                        Tag::Dev,
                        MountPoint::bind(
                            PathBuf::from("/dev").join(node),
                            session.in_final(format!("dev/{node}")),
                        )
                        .skip_on_error(),
                    )?;
                }

                if self.config.mount_devpts {
                    self.registry.add(
                        Tag::Dev,
                        MountPoint::filesystem("devpts", session.in_final("dev/pts"))
                            .with_flags(MountFlagSet {
                                nosuid: true,
                                noexec: true,
                                ..MountFlagSet::default()
                            })
                            .with_option("newinstance")
                            .with_option("mode=0620")
                            .skip_on_error(),
                    )?;
                }
            }
            DevMode::No => {}
        }
        Ok(())
    }

    fn register_hostfs_mounts(&mut self, session: &Session) -> VesselResult<()> {
        if !self.config.mount_hostfs {
            return Ok(());
        }

        let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
        for target in parse_hostfs_mounts(&mounts) {
            self.registry.add(
                Tag::Hostfs,
                MountPoint::bind(&target, session.in_final(&target))
                    .with_flags(MountFlagSet {
                        bind: true,
                        recursive: true,
                        ..MountFlagSet::default()
                    })
                    .skip_on_error(),
            )?;
        }
        Ok(())
    }

    fn register_system_binds(&mut self, session: &Session) -> VesselResult<()> {
        for path in ["/etc/hosts", "/etc/localtime"] {
            self.registry.add(
                Tag::Binds,
                MountPoint::bind(path, session.in_final(path)).skip_on_error(),
            )?;
        }
        Ok(())
    }

    fn register_home(&mut self, session: &Session) -> VesselResult<()> {
        if !self.config.mount_home {
            return Ok(());
        }
        let Some(home) = dirs::home_dir() else {
            return Ok(());
        };

        self.registry.add(
            Tag::Home,
            MountPoint::bind(&home, session.in_final(&home)).with_flags(MountFlagSet {
                bind: true,
                recursive: true,
                nosuid: true,
                nodev: true,
                ..MountFlagSet::default()
            }),
        )
    }

    fn register_user_binds(&mut self, session: &Session) -> VesselResult<()> {
        if self.spec.binds.is_empty() {
            return Ok(());
        }
        if !self.config.user_bind_control {
            return Err(VesselError::Config {
                message: "user bind mounts are disabled by configuration".to_string(),
            });
        }

        let binds = self.spec.binds.clone();
        for bind in &binds {
            let destination = session.in_final(&bind.destination);
            self.registry.add(
                Tag::Userbinds,
                MountPoint::bind(&bind.source, &destination).with_flags(MountFlagSet {
                    bind: true,
                    recursive: true,
                    nosuid: true,
                    nodev: true,
                    ..MountFlagSet::default()
                }),
            )?;

            if bind.readonly {
                self.registry.add(
                    Tag::Userbinds,
                    MountPoint::bind(&bind.source, &destination)
                        .with_flags(MountFlagSet::readonly_remount()),
                )?;
            }
        }
        Ok(())
    }

    fn register_tmp(
        &mut self,
        session: &Session,
        scheduler: &mut Scheduler<Channel>,
    ) -> VesselResult<()> {
        if !self.config.mount_tmp {
            return Ok(());
        }

        let sources = [
            (session.scratch_path().join("tmp"), "tmp"),
            (session.scratch_path().join("var_tmp"), "var/tmp"),
        ];

        let dirs: Vec<PathBuf> = sources.iter().map(|(s, _)| s.clone()).collect();
        scheduler.run_before_tag(Tag::Tmp, move |_, channel: &mut Channel| {
            for dir in &dirs {
                ensure_dir(channel, dir, 0o1777)?;
            }
            Ok(())
        });

        for (source, target) in sources {
            self.registry.add(
                Tag::Tmp,
                MountPoint::bind(source, session.in_final(target)).with_flags(MountFlagSet {
                    bind: true,
                    nosuid: true,
                    nodev: true,
                    ..MountFlagSet::default()
                }),
            )?;
        }
        Ok(())
    }

    fn register_scratch(
        &mut self,
        session: &Session,
        scheduler: &mut Scheduler<Channel>,
    ) -> VesselResult<()> {
        if self.spec.scratch.is_empty() {
            return Ok(());
        }

        let mut sources = Vec::new();
        let scratch = self.spec.scratch.clone();
        for (index, target) in scratch.iter().enumerate() {
            let source = session.scratch_path().join(format!("scratch-{index}"));
            sources.push(source.clone());

            self.registry.add(
                Tag::Scratch,
                MountPoint::bind(source, session.in_final(target)).with_flags(MountFlagSet {
                    bind: true,
                    nosuid: true,
                    nodev: true,
                    ..MountFlagSet::default()
                }),
            )?;
        }

        scheduler.run_before_tag(Tag::Scratch, move |_, channel: &mut Channel| {
            for source in &sources {
                ensure_dir(channel, source, 0o755)?;
            }
            Ok(())
        });
        Ok(())
    }

    /// Synthesize passwd, group and resolv.conf right before the files
    /// tag binds them: host content, with a passwd entry appended for
    /// the invoking user when the host file lacks one.
    fn register_files_hook(&mut self, session: &Session, scheduler: &mut Scheduler<Channel>) {
        let files_dir = session.files_path();
        let targets = [
            ("passwd", session.in_final("etc/passwd")),
            ("group", session.in_final("etc/group")),
            ("resolv.conf", session.in_final("etc/resolv.conf")),
        ];

        scheduler.run_before_tag(Tag::Files, move |registry, _: &mut Channel| {
            for (name, target) in targets {
                let host_path = PathBuf::from("/etc").join(name);
                let mut contents = std::fs::read_to_string(&host_path).unwrap_or_default();
                if name == "passwd" {
                    augment_passwd(&mut contents);
                }

                let staged = files_dir.join(name);
                std::fs::write(&staged, contents)?;

                registry.add(
                    Tag::Files,
                    MountPoint::bind(staged, target).skip_on_error(),
                )?;
            }
            Ok(())
        });
    }

    fn register_cwd(&mut self, session: &Session) -> VesselResult<()> {
        let Some(cwd) = self.spec.cwd.clone() else {
            return Ok(());
        };
        if !cwd.is_dir() {
            return Ok(());
        }

        self.registry.add(
            Tag::Cwd,
            MountPoint::bind(&cwd, session.in_final(&cwd))
                .with_flags(MountFlagSet {
                    bind: true,
                    recursive: true,
                    ..MountFlagSet::default()
                })
                .skip_on_error(),
        )
    }
}

/// Append a passwd entry for the invoking user when none exists, so
/// name lookups inside the container resolve.
fn augment_passwd(contents: &mut String) {
    let uid = rustix::process::getuid().as_raw();
    let needle = format!(":{uid}:");
    if contents.lines().any(|line| line.contains(&needle)) {
        return;
    }

    let user = std::env::var("USER").unwrap_or_else(|_| uid.to_string());
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    let gid = rustix::process::getgid().as_raw();

    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&format!(
        "{user}:x:{uid}:{gid}::{}:/bin/sh\n",
        home.display()
    ));
}

/// Create a directory through the channel, tolerating its existence.
fn ensure_dir(channel: &mut Channel, path: &Path, mode: u32) -> VesselResult<()> {
    match channel.mkdir(path, mode) {
        Ok(()) => Ok(()),
        Err(e) if e.remote_errno() == Some(libc::EEXIST) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Enumerate an image root through the privileged channel.
fn channel_root_entries(channel: &mut Channel, root: &Path) -> VesselResult<Vec<RootEntry>> {
    let mut entries = Vec::new();
    for name in channel.read_dir(root)? {
        let path = root.join(&name);
        let info = channel.lstat(&path)?;
        let kind = if info.is_symlink {
            RootEntryKind::Symlink(channel.readlink(&path)?)
        } else if info.is_dir {
            RootEntryKind::Dir
        } else {
            RootEntryKind::File
        };
        entries.push(RootEntry { name, kind });
    }
    Ok(entries)
}

/// Mount points of real host filesystems worth probing: everything
/// that is not a kernel pseudo-filesystem and not under a system tree.
fn parse_hostfs_mounts(proc_mounts: &str) -> Vec<PathBuf> {
    const VIRTUAL_FS: &[&str] = &[
        "proc", "sysfs", "devtmpfs", "devpts", "tmpfs", "cgroup", "cgroup2", "securityfs",
        "debugfs", "tracefs", "pstore", "bpf", "autofs", "mqueue", "hugetlbfs", "configfs",
        "fusectl", "overlay", "squashfs", "ramfs", "binfmt_misc", "rpc_pipefs", "nsfs",
    ];
    const SYSTEM_PREFIXES: &[&str] = &["/proc", "/sys", "/dev", "/run", "/boot", "/var/lib"];

    let mut targets = Vec::new();
    for line in proc_mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(target), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        if target == "/" || VIRTUAL_FS.contains(&fstype) {
            continue;
        }
        if SYSTEM_PREFIXES.iter().any(|p| target.starts_with(p)) {
            continue;
        }
        targets.push(PathBuf::from(target));
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privop::serve;

    #[test]
    fn passwd_augmentation_appends_missing_user() {
        let uid = rustix::process::getuid().as_raw();

        let mut with_user = format!("root:x:0:0:root:/root:/bin/bash\nme:x:{uid}:100::/home/me:/bin/sh\n");
        let before = with_user.clone();
        augment_passwd(&mut with_user);
        assert_eq!(with_user, before);

        let mut without_user = "root:x:0:0:root:/root:/bin/bash".to_string();
        augment_passwd(&mut without_user);
        assert!(without_user.contains(&format!(":{uid}:")));
        assert!(without_user.ends_with('\n'));
    }

    #[test]
    fn hostfs_probe_skips_virtual_and_system_mounts() {
        let proc_mounts = "\
sysfs /sys sysfs rw 0 0
proc /proc proc rw 0 0
/dev/sda1 / ext4 rw 0 0
/dev/sdb1 /scratch ext4 rw 0 0
beegfs_nodev /cluster beegfs rw 0 0
tmpfs /run tmpfs rw 0 0
/dev/sdc1 /boot ext4 rw 0 0
";
        let targets = parse_hostfs_mounts(proc_mounts);
        assert_eq!(
            targets,
            vec![PathBuf::from("/scratch"), PathBuf::from("/cluster")]
        );
    }

    #[test_log::test]
    fn channel_enumeration_matches_host_enumeration() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("image");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("os-release"), b"ID=vessel\n").unwrap();
        std::os::unix::fs::symlink("usr/bin", root.join("bin")).unwrap();

        let (mut channel, server) = Channel::pair().unwrap();
        std::thread::spawn(move || {
            let _ = serve(server);
        });

        let mut via_channel = channel_root_entries(&mut channel, &root).unwrap();
        via_channel.sort_by(|a, b| a.name.cmp(&b.name));

        let via_host = host_root_entries(&root).unwrap();
        assert_eq!(via_channel, via_host);
    }
}
