#![allow(unsafe_code)]
//! Privileged helper side of the operation channel.
//!
//! Each call narrows the helper's effective capability set to the
//! minimum that one operation requires and restores the prior set
//! before replying. The helper keeps no session state between calls.

use std::ffi::CString;
use std::io::Write;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use caps::{CapSet, Capability, CapsHashSet};
use vessel_common::{VesselError, VesselResult};

use super::client::{read_frame, recv_fd, send_fd, write_frame};
use super::{FileInfo, Reply, Request};

/// Serve privileged requests until the channel closes.
///
/// Runs in the helper process; returns when the supervisor end of the
/// stream is dropped.
pub fn serve(stream: UnixStream) -> VesselResult<()> {
    tracing::debug!("Privileged helper serving");

    loop {
        let mut reader = &stream;
        let bytes = match read_frame(&mut reader) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Channel closed, helper exiting");
                return Ok(());
            }
            Err(e) => {
                return Err(VesselError::Transport {
                    message: format!("cannot read request: {e}"),
                });
            }
        };

        let request: Request = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => {
                // A peer that sends garbage cannot be trusted with a
                // structured error; drop the channel.
                return Err(VesselError::Transport {
                    message: format!("malformed request: {e}"),
                });
            }
        };

        tracing::trace!(operation = request.operation(), "Executing privileged call");

        let reply = with_narrowed_caps(&required_caps(&request), || dispatch(&request, &stream));

        let reply_bytes = serde_json::to_vec(&reply).map_err(|e| VesselError::Transport {
            message: format!("cannot encode reply: {e}"),
        })?;
        let mut writer = &stream;
        write_frame(&mut writer, &reply_bytes).map_err(|e| VesselError::Transport {
            message: format!("cannot send reply: {e}"),
        })?;

        // Outbound descriptors ride after the reply frame.
        if let (Request::OpenSendFuseFd, Reply::Fd { raw }) = (&request, &reply) {
            let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(*raw) };
            send_fd(&stream, fd).map_err(|e| VesselError::Transport {
                message: format!("cannot transfer fuse fd: {e}"),
            })?;
        }
    }
}

/// The minimum capability set one operation requires.
fn required_caps(request: &Request) -> Vec<Capability> {
    match request {
        Request::Mount { fstype, .. } if fstype.as_deref() == Some("overlay") => vec![
            Capability::CAP_FOWNER,
            Capability::CAP_DAC_OVERRIDE,
            Capability::CAP_DAC_READ_SEARCH,
            Capability::CAP_CHOWN,
            Capability::CAP_SYS_ADMIN,
        ],
        Request::Mount { .. } | Request::Umount { .. } => vec![
            Capability::CAP_SYS_ADMIN,
            Capability::CAP_DAC_READ_SEARCH,
        ],
        Request::Chroot { .. } => vec![Capability::CAP_SYS_CHROOT, Capability::CAP_SYS_ADMIN],
        Request::LoopAttach { .. } => vec![Capability::CAP_SYS_ADMIN, Capability::CAP_MKNOD],
        Request::Decrypt { .. } | Request::CryptClose { .. } => vec![Capability::CAP_SYS_ADMIN],
        Request::Mkdir { .. } | Request::WriteFile { .. } | Request::Symlink { .. } => {
            vec![Capability::CAP_DAC_OVERRIDE]
        }
        Request::Chown { .. } | Request::Lchown { .. } => vec![Capability::CAP_CHOWN],
        Request::Chdir { .. }
        | Request::Stat { .. }
        | Request::Lstat { .. }
        | Request::ReadDir { .. }
        | Request::Readlink { .. } => vec![Capability::CAP_DAC_READ_SEARCH],
        Request::Umask { .. } | Request::SendFuseFd | Request::Wait { .. } => Vec::new(),
        Request::OpenSendFuseFd => vec![Capability::CAP_DAC_OVERRIDE],
        Request::Exec { .. } => vec![
            Capability::CAP_SETUID,
            Capability::CAP_SETGID,
            Capability::CAP_SETPCAP,
            Capability::CAP_SYS_ADMIN,
        ],
    }
}

/// Run `f` with the effective capability set narrowed to `required`,
/// restoring the prior set afterwards.
///
/// Only capabilities actually held in the permitted set are raised, so
/// an unprivileged helper degrades to running with nothing raised and
/// the syscall itself reporting EPERM. The thread's capability state
/// after return always equals its state before the call.
fn with_narrowed_caps<T>(required: &[Capability], f: impl FnOnce() -> T) -> T {
    let prior = caps::read(None, CapSet::Effective).ok();
    let permitted = caps::read(None, CapSet::Permitted).unwrap_or_default();

    if prior.is_some() {
        let narrowed: CapsHashSet = required
            .iter()
            .copied()
            .filter(|c| permitted.contains(c))
            .collect();
        if let Err(e) = caps::set(None, CapSet::Effective, &narrowed) {
            tracing::debug!(error = %e, "Cannot narrow effective capabilities");
        }
    }

    let out = f();

    if let Some(prior) = prior {
        if let Err(e) = caps::set(None, CapSet::Effective, &prior) {
            tracing::warn!(error = %e, "Cannot restore effective capabilities");
        }
    }

    out
}

fn errno_reply(request: &Request, err: &std::io::Error) -> Reply {
    Reply::Err {
        operation: request.operation().to_string(),
        path: request.target(),
        errno: err.raw_os_error().unwrap_or(libc::EIO),
    }
}

fn dispatch(request: &Request, stream: &UnixStream) -> Reply {
    let result = match request {
        Request::Mount {
            source,
            destination,
            fstype,
            flags,
            options,
        } => do_mount(source.as_deref(), destination, fstype.as_deref(), *flags, options)
            .map(|()| Reply::Ok),
        Request::Umount { path, detach } => do_umount(path, *detach).map(|()| Reply::Ok),
        Request::Chroot { path } => do_chroot(path).map(|()| Reply::Ok),
        Request::LoopAttach {
            image,
            mode,
            offset,
            size_limit,
            max_devices,
            shared,
        } => crate::image::loop_attach(image, *mode, *offset, *size_limit, *max_devices, *shared)
            .map(|path| Reply::Device { path }),
        Request::Decrypt {
            device,
            key,
            name,
            isolated_ipc,
        } => do_decrypt(device, key, name, *isolated_ipc).map(|path| Reply::Device { path }),
        Request::CryptClose { name } => do_crypt_close(name).map(|()| Reply::Ok),
        Request::Mkdir { path, mode } => {
            rustix::fs::mkdir(path, rustix::fs::Mode::from_raw_mode(*mode))
                .map_err(std::io::Error::from)
                .map(|()| Reply::Ok)
        }
        Request::Chdir { path } => rustix::process::chdir(path)
            .map_err(std::io::Error::from)
            .map(|()| Reply::Ok),
        Request::Stat { path } => std::fs::metadata(path).map(|m| Reply::Info {
            info: file_info(&m, false),
        }),
        Request::Lstat { path } => std::fs::symlink_metadata(path).map(|m| Reply::Info {
            info: file_info(&m, m.file_type().is_symlink()),
        }),
        Request::Symlink { target, link } => {
            std::os::unix::fs::symlink(target, link).map(|()| Reply::Ok)
        }
        Request::ReadDir { path } => read_dir_names(path).map(|names| Reply::Entries { names }),
        Request::Chown { path, uid, gid } => do_chown(path, *uid, *gid, false).map(|()| Reply::Ok),
        Request::Lchown { path, uid, gid } => do_chown(path, *uid, *gid, true).map(|()| Reply::Ok),
        Request::Readlink { path } => std::fs::read_link(path).map(|path| Reply::Path { path }),
        Request::Umask { mask } => {
            let previous = unsafe { libc::umask(*mask as libc::mode_t) };
            Ok(Reply::Mask {
                previous: previous as u32,
            })
        }
        Request::WriteFile {
            path,
            mode,
            contents,
        } => write_file(path, *mode, contents).map(|()| Reply::Ok),
        Request::SendFuseFd => recv_fd(stream).map(|fd| Reply::Fd {
            // Ownership moves into the helper's descriptor table; a
            // later fuse mount references it by number.
            raw: fd.into_raw_fd(),
        }),
        Request::OpenSendFuseFd => std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/fuse")
            .map(|file| Reply::Fd {
                raw: file.into_raw_fd(),
            }),
        Request::Exec {
            command,
            env,
            cwd,
            hostname,
            shim,
            capabilities,
        } => super::exec::do_exec(
            command,
            env,
            cwd.as_deref(),
            hostname.as_deref(),
            *shim,
            capabilities,
        )
        .map(|pid| Reply::Started { pid }),
        Request::Wait { pid } => {
            super::exec::do_wait(*pid).map(|status| Reply::Exited { status })
        }
    };

    match result {
        Ok(reply) => reply,
        Err(e) => errno_reply(request, &e),
    }
}

fn file_info(metadata: &std::fs::Metadata, is_symlink: bool) -> FileInfo {
    FileInfo {
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        size: metadata.size(),
        is_dir: metadata.is_dir(),
        is_symlink,
    }
}

fn read_dir_names(path: &Path) -> std::io::Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

fn write_file(path: &Path, mode: u32, contents: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)
}

fn path_cstring(path: &Path) -> std::io::Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"))
}

fn do_mount(
    source: Option<&Path>,
    destination: &Path,
    fstype: Option<&str>,
    flags: u64,
    options: &str,
) -> std::io::Result<()> {
    let source_c = path_cstring(source.unwrap_or_else(|| Path::new("none")))?;
    let dest_c = path_cstring(destination)?;
    let fstype_c = CString::new(fstype.unwrap_or(""))
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "fstype NUL"))?;
    let options_c = CString::new(options)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "options NUL"))?;

    tracing::debug!(
        source = %source.unwrap_or_else(|| Path::new("none")).display(),
        destination = %destination.display(),
        fstype = fstype.unwrap_or(""),
        flags,
        "Mounting"
    );

    let ret = unsafe {
        libc::mount(
            source_c.as_ptr(),
            dest_c.as_ptr(),
            fstype_c.as_ptr(),
            flags as libc::c_ulong,
            options_c.as_ptr().cast(),
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn do_umount(path: &Path, detach: bool) -> std::io::Result<()> {
    let path_c = path_cstring(path)?;
    let flags = if detach { libc::MNT_DETACH } else { 0 };

    tracing::debug!(path = %path.display(), detach, "Unmounting");

    let ret = unsafe { libc::umount2(path_c.as_ptr(), flags) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Enter the final root filesystem view.
///
/// Tries pivot_root into the target first; kernels that refuse (rootfs
/// is an initramfs, or the target shares the current root mount) get
/// the move+chroot fallback.
fn do_chroot(path: &Path) -> std::io::Result<()> {
    rustix::process::chdir(path)?;

    match pivot_into_cwd() {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Entered root via pivot_root");
        }
        Err(pivot_err) => {
            tracing::debug!(
                error = %pivot_err,
                "pivot_root refused, falling back to move+chroot"
            );
            move_chroot_cwd()?;
            tracing::debug!(path = %path.display(), "Entered root via move+chroot");
        }
    }

    rustix::process::chdir("/")?;
    Ok(())
}

/// pivot_root(".", ".") with the old root stacked under the new one,
/// then detach it.
fn pivot_into_cwd() -> std::io::Result<()> {
    let dot = CString::new(".").unwrap_or_default();
    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, dot.as_ptr(), dot.as_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let ret = unsafe { libc::umount2(dot.as_ptr(), libc::MNT_DETACH) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let ret = unsafe { libc::chroot(dot.as_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Move the current directory's mount over / and chroot into it.
fn move_chroot_cwd() -> std::io::Result<()> {
    let dot = CString::new(".").unwrap_or_default();
    let root = CString::new("/").unwrap_or_default();

    let ret = unsafe {
        libc::mount(
            dot.as_ptr(),
            root.as_ptr(),
            std::ptr::null(),
            libc::MS_MOVE,
            std::ptr::null(),
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let ret = unsafe { libc::chroot(dot.as_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn do_chown(path: &Path, uid: u32, gid: u32, follow_symlinks_not: bool) -> std::io::Result<()> {
    let path_c = path_cstring(path)?;
    let ret = if follow_symlinks_not {
        unsafe { libc::lchown(path_c.as_ptr(), uid, gid) }
    } else {
        unsafe { libc::chown(path_c.as_ptr(), uid, gid) }
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Unlock an encrypted partition through the host decrypt tool.
///
/// The tool talks to the kernel keyring over host IPC; when the
/// container has an isolated IPC namespace the helper temporarily
/// rejoins the host namespace for the duration of the call.
fn do_decrypt(
    device: &Path,
    key: &[u8],
    name: &str,
    isolated_ipc: bool,
) -> std::io::Result<PathBuf> {
    let restore = if isolated_ipc {
        Some(join_host_ipc()?)
    } else {
        None
    };

    let result = run_cryptsetup_open(device, key, name);

    if let Some(own_ns) = restore {
        let ret = unsafe { libc::setns(own_ns.as_raw_fd(), libc::CLONE_NEWIPC) };
        if ret != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "Cannot rejoin container IPC namespace after decrypt"
            );
        }
    }

    result
}

/// Join the host IPC namespace, returning a handle on the current one
/// so the caller can switch back.
fn join_host_ipc() -> std::io::Result<std::fs::File> {
    let own_ns = std::fs::File::open("/proc/self/ns/ipc")?;
    let host_ns = std::fs::File::open("/proc/1/ns/ipc")?;

    let ret = unsafe { libc::setns(host_ns.as_raw_fd(), libc::CLONE_NEWIPC) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(own_ns)
}

fn run_cryptsetup_open(device: &Path, key: &[u8], name: &str) -> std::io::Result<PathBuf> {
    let mut child = std::process::Command::new("cryptsetup")
        .arg("open")
        .arg("--type")
        .arg("luks2")
        .arg("--key-file")
        .arg("-")
        .arg(device)
        .arg(name)
        .stdin(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(key)?;
    }
    drop(child.stdin.take());

    let status = child.wait()?;
    if !status.success() {
        return Err(std::io::Error::other(format!(
            "cryptsetup open exited with {status}"
        )));
    }

    Ok(PathBuf::from("/dev/mapper").join(name))
}

fn do_crypt_close(name: &str) -> std::io::Result<()> {
    let status = std::process::Command::new("cryptsetup")
        .arg("close")
        .arg(name)
        .stderr(std::process::Stdio::null())
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!(
            "cryptsetup close exited with {status}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privop::Channel;

    fn spawn_serving_channel() -> Channel {
        let (channel, server) = Channel::pair().unwrap();
        std::thread::spawn(move || {
            let _ = serve(server);
        });
        channel
    }

    #[test]
    fn capability_set_survives_a_call_roundtrip() {
        let before = caps::read(None, CapSet::Effective).unwrap();
        let _ = with_narrowed_caps(&[Capability::CAP_SYS_ADMIN], || {
            // Inside the call the set is narrowed (or empty when the
            // process holds nothing); outside it must be restored.
        });
        let after = caps::read(None, CapSet::Effective).unwrap();
        assert_eq!(before, after);
    }

    #[test_log::test]
    fn file_operations_over_the_channel() {
        let mut channel = spawn_serving_channel();
        let temp = tempfile::tempdir().unwrap();

        let dir = temp.path().join("staging");
        channel.mkdir(&dir, 0o755).unwrap();

        let file = dir.join("resolv.conf");
        channel
            .write_file(&file, 0o644, b"nameserver 10.0.0.1\n")
            .unwrap();

        let info = channel.stat(&file).unwrap();
        assert!(!info.is_dir);
        assert_eq!(info.size, 20);

        let link = dir.join("link");
        channel.symlink(&file, &link).unwrap();
        assert!(channel.lstat(&link).unwrap().is_symlink);
        assert_eq!(channel.readlink(&link).unwrap(), file);

        let names = channel.read_dir(&dir).unwrap();
        assert_eq!(names, vec!["link".to_string(), "resolv.conf".to_string()]);
    }

    #[test]
    fn remote_failure_carries_errno() {
        let mut channel = spawn_serving_channel();

        let err = channel
            .chdir(Path::new("/nonexistent/vessel/path"))
            .unwrap_err();
        assert_eq!(err.remote_errno(), Some(libc::ENOENT));
    }

    #[test]
    fn fuse_fd_transfer_to_helper() {
        let mut channel = spawn_serving_channel();
        let file = tempfile::tempfile().unwrap();

        let raw = channel.send_fuse_fd(&file).unwrap();
        assert!(raw >= 0);
    }
}
