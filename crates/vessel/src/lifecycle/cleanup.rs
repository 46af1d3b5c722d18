#![allow(unsafe_code)]
//! Cleanup: unwind everything, always.
//!
//! Runs after monitor returns regardless of outcome. Failures here are
//! logged and swallowed: cleanup is the terminal step and there is no
//! further recovery path to hand an error to.

use std::path::Path;

use vessel_common::VesselError;

use crate::namespace::IdMapping;
use crate::plugin::PluginRegistry;
use crate::privop::Channel;

use super::{ContainerExecution, State};

/// Bounded retries for EBUSY on unmount.
const UMOUNT_RETRIES: u32 = 10;
const UMOUNT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

impl ContainerExecution {
    /// Release every resource the execution acquired.
    ///
    /// Safe to call from any state, idempotent, and never raises.
    pub fn cleanup(&mut self, plugins: &PluginRegistry) {
        if self.state == State::CleanedUp {
            return;
        }
        tracing::debug!(state = %self.state, "Cleaning up container");

        // Pluggable drivers first: a FUSE driver holds mounts open.
        for driver in plugins.image_drivers() {
            if let Err(e) = driver.stop() {
                tracing::warn!(driver = driver.name(), error = %e, "Cannot stop image driver");
            }
        }
        if let Some(driver) = &self.driver {
            if let Err(e) = driver.stop() {
                tracing::warn!(driver = driver.name(), error = %e, "Cannot stop image driver");
            }
        }

        // Unmount in strict reverse order of the applied sequence.
        let applied: Vec<_> = self.registry.applied().to_vec();
        for destination in applied.iter().rev() {
            unmount_with_retry(self.channel.as_mut(), destination);
        }

        // Close crypt mappings before dropping the channel.
        for name in std::mem::take(&mut self.crypt_mappers) {
            let result = match self.channel.as_mut() {
                Some(channel) => channel.crypt_close(&name),
                None => Err(VesselError::Transport {
                    message: "no channel".to_string(),
                }),
            };
            if let Err(e) = result {
                tracing::warn!(mapper = %name, error = %e, "Cannot close crypt mapping");
            }
        }

        // Dropping the channel ends the helper's serve loop; reap it.
        drop(self.channel.take());
        if let Some(pid) = self.helper_pid.take() {
            let mut status = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) };
        }

        if let Some(session) = self.session.take() {
            let (uid_mappings, gid_mappings) = self
                .plan
                .as_ref()
                .map_or((&[][..], &[][..]), |p| {
                    (p.uid_mappings.as_slice(), p.gid_mappings.as_slice())
                });
            remove_session(&session, uid_mappings, gid_mappings);
        }

        if let Some(network) = self.network.take() {
            network.teardown();
        }

        if let Some(cgroup) = self.cgroup.take() {
            if let Err(e) = cgroup.remove() {
                tracing::warn!(error = %e, "Cannot remove cgroup");
            }
        }

        self.state = State::CleanedUp;
        tracing::debug!("Cleanup complete");
    }
}

/// Unmount one destination, tolerating "not a mount point" and
/// retrying EBUSY a bounded number of times.
///
/// Prefers the privileged channel (the mount lives in the helper's
/// namespace); falls back to a direct call for mounts still visible
/// here once the channel is gone.
fn unmount_with_retry(mut channel: Option<&mut Channel>, destination: &Path) {
    for attempt in 0..UMOUNT_RETRIES {
        let errno = match channel.as_deref_mut() {
            Some(channel) => match channel.umount(destination, false) {
                Ok(()) => None,
                Err(e) => e.remote_errno().or(Some(libc::EIO)),
            },
            None => {
                let path_c = match std::ffi::CString::new(
                    destination.as_os_str().as_encoded_bytes(),
                ) {
                    Ok(c) => c,
                    Err(_) => return,
                };
                if unsafe { libc::umount2(path_c.as_ptr(), 0) } == 0 {
                    None
                } else {
                    std::io::Error::last_os_error().raw_os_error()
                }
            }
        };

        match errno {
            None => {
                tracing::debug!(destination = %destination.display(), "Unmounted");
                return;
            }
            // Not mounted (or already gone): nothing to unwind.
            Some(errno) if errno == libc::EINVAL || errno == libc::ENOENT => return,
            Some(errno) if errno == libc::EBUSY && attempt + 1 < UMOUNT_RETRIES => {
                tracing::debug!(
                    destination = %destination.display(),
                    attempt = attempt + 1,
                    "Unmount busy, retrying"
                );
                std::thread::sleep(UMOUNT_RETRY_DELAY);
            }
            Some(errno) => {
                tracing::warn!(
                    destination = %destination.display(),
                    errno,
                    "Cannot unmount"
                );
                return;
            }
        }
    }
}

/// Remove the session tree, escalating through a fakeroot-context
/// subprocess when the cleaning UID cannot remove root-owned content
/// directly.
fn remove_session(
    session: &crate::session::Session,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) {
    match session.remove() {
        Ok(()) => return,
        Err(e) => {
            if uid_mappings.is_empty() {
                tracing::warn!(error = %e, "Cannot remove session directory");
                return;
            }
            tracing::debug!(
                error = %e,
                "Direct session removal failed, escalating via fakeroot context"
            );
        }
    }

    if let Err(e) = remove_as_fakeroot(session.base(), uid_mappings, gid_mappings) {
        tracing::warn!(error = %e, "Cannot remove session directory as fakeroot");
    }
}

/// Fork a child that enters a user namespace mapping the container's
/// ID range and removes `path` with the mapped ownership.
fn remove_as_fakeroot(
    path: &Path,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> std::io::Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let (parent_sock, child_sock) = UnixStream::pair()?;

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error());
    }

    if pid == 0 {
        drop(parent_sock);
        let code = fakeroot_remove_child(path, child_sock);
        unsafe { libc::_exit(code) };
    }

    drop(child_sock);
    let mut stream = &parent_sock;

    // Child signals after unsharing; write its mappings, release it.
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte)?;
    crate::namespace::write_id_mappings(pid, uid_mappings, gid_mappings)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    stream.write_all(&[1u8])?;

    let mut status = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };
    if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
        Ok(())
    } else {
        Err(std::io::Error::other("fakeroot removal subprocess failed"))
    }
}

fn fakeroot_remove_child(path: &Path, sock: std::os::unix::net::UnixStream) -> i32 {
    use std::io::{Read, Write};

    let namespaces = crate::namespace::NamespaceConfig {
        user: true,
        ..crate::namespace::NamespaceConfig::default()
    };
    if namespaces.unshare().is_err() {
        return 1;
    }

    let mut stream = &sock;
    if stream.write_all(&[0u8]).is_err() {
        return 1;
    }
    let mut byte = [0u8; 1];
    if stream.read_exact(&mut byte).is_err() {
        return 1;
    }

    match std::fs::remove_dir_all(path) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{ContainerSpec, State};
    use vessel_common::{EngineConfig, VesselPaths};

    #[test]
    fn cleanup_is_idempotent_and_never_panics() {
        let temp = tempfile::tempdir().unwrap();
        let mut execution = ContainerExecution::new(
            EngineConfig::default(),
            VesselPaths::with_root(temp.path()),
            ContainerSpec::new("/images/base.sif", vec!["/bin/sh".to_string()]),
        );

        let plugins = PluginRegistry::new();
        execution.cleanup(&plugins);
        assert_eq!(execution.state(), State::CleanedUp);
        execution.cleanup(&plugins);
        assert_eq!(execution.state(), State::CleanedUp);
    }

    #[test]
    fn unmount_tolerates_paths_that_are_not_mounted() {
        let temp = tempfile::tempdir().unwrap();
        // EINVAL from the kernel: plain directory, not a mount point.
        unmount_with_retry(None, temp.path());
        assert!(temp.path().exists());
    }
}
