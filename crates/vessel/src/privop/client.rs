#![allow(unsafe_code)]
//! Supervisor side of the privileged operation channel.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use vessel_common::{VesselError, VesselResult};

use super::{FileInfo, LoopMode, Reply, Request};
use crate::mount::{MountExecutor, MountPoint};

/// Upper bound on a single frame; anything larger is a broken peer.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

pub(crate) fn write_frame(stream: &mut &UnixStream, bytes: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()
}

pub(crate) fn read_frame(stream: &mut &UnixStream) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized frame",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Send one file descriptor as ancillary data with a one-byte payload.
pub(crate) fn send_fd(stream: &UnixStream, fd: impl AsFd) -> std::io::Result<()> {
    let mut space = vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut control = rustix::net::SendAncillaryBuffer::new(&mut space);
    let fds = [fd.as_fd()];
    control.push(rustix::net::SendAncillaryMessage::ScmRights(&fds));

    rustix::net::sendmsg(
        stream,
        &[IoSlice::new(&[0u8])],
        &mut control,
        rustix::net::SendFlags::empty(),
    )?;
    Ok(())
}

/// Receive one file descriptor sent with [`send_fd`].
pub(crate) fn recv_fd(stream: &UnixStream) -> std::io::Result<OwnedFd> {
    let mut space = vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut control = rustix::net::RecvAncillaryBuffer::new(&mut space);
    let mut byte = [0u8; 1];

    rustix::net::recvmsg(
        stream,
        &mut [IoSliceMut::new(&mut byte)],
        &mut control,
        rustix::net::RecvFlags::empty(),
    )?;

    for message in control.drain() {
        if let rustix::net::RecvAncillaryMessage::ScmRights(fds) = message {
            if let Some(fd) = fds.into_iter().next() {
                return Ok(fd);
            }
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "no file descriptor in ancillary data",
    ))
}

/// Helper-process entry: unshare, synchronize with the parent, serve.
fn helper_main(
    namespaces: &crate::namespace::NamespaceConfig,
    server: UnixStream,
) -> VesselResult<()> {
    namespaces.unshare()?;

    let mut stream = &server;
    stream
        .write_all(&[0u8])
        .map_err(|e| VesselError::Transport {
            message: format!("cannot signal unshare: {e}"),
        })?;

    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).map_err(|e| VesselError::Transport {
        message: format!("supervisor did not release helper: {e}"),
    })?;

    super::serve(server)
}

/// The supervisor's handle on the privileged helper.
///
/// Calls are synchronous and blocking: one request is outstanding at a
/// time and the caller suspends until the helper replies or the channel
/// breaks.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// Create a connected channel pair: the supervisor handle and the
    /// raw stream to hand to [`super::serve`] in the helper process.
    pub fn pair() -> VesselResult<(Self, UnixStream)> {
        let (client, server) = UnixStream::pair()?;
        Ok((Self { stream: client }, server))
    }

    /// Fork the privileged helper process.
    ///
    /// The child serves requests until the channel closes, then exits;
    /// the parent receives the supervisor handle and the helper pid.
    pub fn spawn_helper() -> VesselResult<(Self, libc::pid_t)> {
        Self::spawn_helper_in(&crate::namespace::NamespaceConfig::default(), &[], &[])
    }

    /// Fork the privileged helper inside a fresh set of namespaces.
    ///
    /// The child unshares the requested namespaces before serving; the
    /// parent writes the UID/GID mappings into the child's proc files
    /// in between, synchronized over the channel socket itself (one
    /// byte each way before the framed protocol starts).
    pub fn spawn_helper_in(
        namespaces: &crate::namespace::NamespaceConfig,
        uid_mappings: &[crate::namespace::IdMapping],
        gid_mappings: &[crate::namespace::IdMapping],
    ) -> VesselResult<(Self, libc::pid_t)> {
        let (client, server) = Self::pair()?;
        let namespaces = namespaces.clone();

        // Safety: the child immediately enters namespace setup and the
        // serve loop, and never returns into caller code.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(VesselError::Internal {
                message: format!("fork failed: {}", std::io::Error::last_os_error()),
            });
        }

        if pid == 0 {
            drop(client);
            let code = match helper_main(&namespaces, server) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "Privileged helper failed");
                    1
                }
            };
            unsafe { libc::_exit(code) };
        }

        drop(server);

        // Wait for the child to finish unsharing, then publish the
        // identity mappings it cannot write for itself.
        let mut stream = &client.stream;
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).map_err(|e| VesselError::Transport {
            message: format!("helper did not signal unshare: {e}"),
        })?;

        crate::namespace::write_id_mappings(pid, uid_mappings, gid_mappings)?;

        stream.write_all(&[1u8]).map_err(|e| VesselError::Transport {
            message: format!("cannot release helper: {e}"),
        })?;

        tracing::debug!(pid, "Spawned privileged helper");
        Ok((client, pid))
    }

    /// Issue one call and wait for its reply.
    pub fn call(&mut self, request: &Request) -> VesselResult<Reply> {
        let bytes = serde_json::to_vec(request).map_err(|e| VesselError::Transport {
            message: format!("cannot encode request: {e}"),
        })?;

        let mut stream = &self.stream;
        write_frame(&mut stream, &bytes).map_err(|e| VesselError::Transport {
            message: format!("cannot send {}: {e}", request.operation()),
        })?;

        let reply_bytes = read_frame(&mut stream).map_err(|e| VesselError::Transport {
            message: format!("no reply to {}: {e}", request.operation()),
        })?;

        let reply: Reply =
            serde_json::from_slice(&reply_bytes).map_err(|e| VesselError::Transport {
                message: format!("malformed reply to {}: {e}", request.operation()),
            })?;

        match reply {
            Reply::Err {
                operation,
                path,
                errno,
            } => Err(VesselError::Remote {
                operation,
                path,
                errno,
            }),
            other => Ok(other),
        }
    }

    fn expect_ok(&mut self, request: &Request) -> VesselResult<()> {
        match self.call(request)? {
            Reply::Ok => Ok(()),
            other => Err(VesselError::Transport {
                message: format!(
                    "unexpected reply to {}: {:?}",
                    request.operation(),
                    other
                ),
            }),
        }
    }

    /// Unmount `path`, optionally with MNT_DETACH.
    pub fn umount(&mut self, path: &Path, detach: bool) -> VesselResult<()> {
        self.expect_ok(&Request::Umount {
            path: path.to_path_buf(),
            detach,
        })
    }

    /// Enter the final root filesystem view.
    pub fn chroot(&mut self, path: &Path) -> VesselResult<()> {
        self.expect_ok(&Request::Chroot {
            path: path.to_path_buf(),
        })
    }

    /// Attach an image to a loop device, returning the device path.
    pub fn loop_attach(
        &mut self,
        image: &Path,
        mode: LoopMode,
        offset: u64,
        size_limit: u64,
        max_devices: u32,
        shared: bool,
    ) -> VesselResult<PathBuf> {
        let request = Request::LoopAttach {
            image: image.to_path_buf(),
            mode,
            offset,
            size_limit,
            max_devices,
            shared,
        };
        match self.call(&request)? {
            Reply::Device { path } => Ok(path),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to loop attach: {other:?}"),
            }),
        }
    }

    /// Unlock an encrypted partition, returning the mapper device path.
    pub fn decrypt(
        &mut self,
        device: &Path,
        key: &[u8],
        name: &str,
        isolated_ipc: bool,
    ) -> VesselResult<PathBuf> {
        let request = Request::Decrypt {
            device: device.to_path_buf(),
            key: key.to_vec(),
            name: name.to_string(),
            isolated_ipc,
        };
        match self.call(&request)? {
            Reply::Device { path } => Ok(path),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to decrypt: {other:?}"),
            }),
        }
    }

    /// Close a decrypted mapper device.
    pub fn crypt_close(&mut self, name: &str) -> VesselResult<()> {
        self.expect_ok(&Request::CryptClose {
            name: name.to_string(),
        })
    }

    /// Create a directory.
    pub fn mkdir(&mut self, path: &Path, mode: u32) -> VesselResult<()> {
        self.expect_ok(&Request::Mkdir {
            path: path.to_path_buf(),
            mode,
        })
    }

    /// Change the helper's working directory.
    pub fn chdir(&mut self, path: &Path) -> VesselResult<()> {
        self.expect_ok(&Request::Chdir {
            path: path.to_path_buf(),
        })
    }

    /// stat(2) through the helper.
    pub fn stat(&mut self, path: &Path) -> VesselResult<FileInfo> {
        self.expect_info(&Request::Stat {
            path: path.to_path_buf(),
        })
    }

    /// lstat(2) through the helper.
    pub fn lstat(&mut self, path: &Path) -> VesselResult<FileInfo> {
        self.expect_info(&Request::Lstat {
            path: path.to_path_buf(),
        })
    }

    fn expect_info(&mut self, request: &Request) -> VesselResult<FileInfo> {
        match self.call(request)? {
            Reply::Info { info } => Ok(info),
            other => Err(VesselError::Transport {
                message: format!(
                    "unexpected reply to {}: {:?}",
                    request.operation(),
                    other
                ),
            }),
        }
    }

    /// Create a symlink.
    pub fn symlink(&mut self, target: &Path, link: &Path) -> VesselResult<()> {
        self.expect_ok(&Request::Symlink {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        })
    }

    /// List directory entry names.
    pub fn read_dir(&mut self, path: &Path) -> VesselResult<Vec<String>> {
        match self.call(&Request::ReadDir {
            path: path.to_path_buf(),
        })? {
            Reply::Entries { names } => Ok(names),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to readdir: {other:?}"),
            }),
        }
    }

    /// Change ownership of a path.
    pub fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> VesselResult<()> {
        self.expect_ok(&Request::Chown {
            path: path.to_path_buf(),
            uid,
            gid,
        })
    }

    /// Change ownership without following symlinks.
    pub fn lchown(&mut self, path: &Path, uid: u32, gid: u32) -> VesselResult<()> {
        self.expect_ok(&Request::Lchown {
            path: path.to_path_buf(),
            uid,
            gid,
        })
    }

    /// Read a symlink target.
    pub fn readlink(&mut self, path: &Path) -> VesselResult<PathBuf> {
        match self.call(&Request::Readlink {
            path: path.to_path_buf(),
        })? {
            Reply::Path { path } => Ok(path),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to readlink: {other:?}"),
            }),
        }
    }

    /// Set the helper's umask, returning the previous mask.
    pub fn umask(&mut self, mask: u32) -> VesselResult<u32> {
        match self.call(&Request::Umask { mask })? {
            Reply::Mask { previous } => Ok(previous),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to umask: {other:?}"),
            }),
        }
    }

    /// Create a file with mode and contents.
    pub fn write_file(&mut self, path: &Path, mode: u32, contents: &[u8]) -> VesselResult<()> {
        self.expect_ok(&Request::WriteFile {
            path: path.to_path_buf(),
            mode,
            contents: contents.to_vec(),
        })
    }

    /// Launch the container leader, returning its pid.
    #[allow(clippy::too_many_arguments)]
    pub fn exec_container(
        &mut self,
        command: &[String],
        env: &[(String, String)],
        cwd: Option<&Path>,
        hostname: Option<&str>,
        shim: bool,
        capabilities: &[String],
    ) -> VesselResult<i32> {
        let request = Request::Exec {
            command: command.to_vec(),
            env: env.to_vec(),
            cwd: cwd.map(Path::to_path_buf),
            hostname: hostname.map(str::to_string),
            shim,
            capabilities: capabilities.to_vec(),
        };
        match self.call(&request)? {
            Reply::Started { pid } => Ok(pid),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to exec: {other:?}"),
            }),
        }
    }

    /// Send the blocking wait request for the leader.
    ///
    /// The reply arrives whenever the leader exits; the monitor loop
    /// polls the channel descriptor and collects it with
    /// [`Channel::finish_wait`].
    pub fn begin_wait(&mut self, pid: i32) -> VesselResult<()> {
        let bytes =
            serde_json::to_vec(&Request::Wait { pid }).map_err(|e| VesselError::Transport {
                message: format!("cannot encode request: {e}"),
            })?;
        let mut stream = &self.stream;
        write_frame(&mut stream, &bytes).map_err(|e| VesselError::Transport {
            message: format!("cannot send wait: {e}"),
        })?;
        Ok(())
    }

    /// Collect the exit status after [`Channel::begin_wait`].
    pub fn finish_wait(&mut self) -> VesselResult<i32> {
        let mut stream = &self.stream;
        let reply_bytes = read_frame(&mut stream).map_err(|e| VesselError::Transport {
            message: format!("no reply to wait: {e}"),
        })?;
        match serde_json::from_slice(&reply_bytes).map_err(|e| VesselError::Transport {
            message: format!("malformed reply to wait: {e}"),
        })? {
            Reply::Exited { status } => Ok(status),
            Reply::Err {
                operation,
                path,
                errno,
            } => Err(VesselError::Remote {
                operation,
                path,
                errno,
            }),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to wait: {other:?}"),
            }),
        }
    }

    /// Pass an open FUSE descriptor to the helper; returns the
    /// helper-side descriptor number for fuse mount option strings.
    pub fn send_fuse_fd(&mut self, fd: impl AsFd) -> VesselResult<i32> {
        let bytes = serde_json::to_vec(&Request::SendFuseFd).map_err(|e| {
            VesselError::Transport {
                message: format!("cannot encode request: {e}"),
            }
        })?;
        let mut stream = &self.stream;
        write_frame(&mut stream, &bytes).map_err(|e| VesselError::Transport {
            message: format!("cannot send fuse fd request: {e}"),
        })?;
        send_fd(&self.stream, fd).map_err(|e| VesselError::Transport {
            message: format!("cannot transfer fuse fd: {e}"),
        })?;

        let reply_bytes = read_frame(&mut stream).map_err(|e| VesselError::Transport {
            message: format!("no reply to send fuse fd: {e}"),
        })?;
        match serde_json::from_slice(&reply_bytes).map_err(|e| VesselError::Transport {
            message: format!("malformed reply to send fuse fd: {e}"),
        })? {
            Reply::Fd { raw } => Ok(raw),
            Reply::Err {
                operation,
                path,
                errno,
            } => Err(VesselError::Remote {
                operation,
                path,
                errno,
            }),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to send fuse fd: {other:?}"),
            }),
        }
    }

    /// Have the helper open /dev/fuse and pass the descriptor back.
    pub fn open_fuse_fd(&mut self) -> VesselResult<OwnedFd> {
        match self.call(&Request::OpenSendFuseFd)? {
            Reply::Fd { .. } => recv_fd(&self.stream).map_err(|e| VesselError::Transport {
                message: format!("cannot receive fuse fd: {e}"),
            }),
            other => Err(VesselError::Transport {
                message: format!("unexpected reply to open fuse fd: {other:?}"),
            }),
        }
    }

    /// The raw channel descriptor, for poll-based supervision.
    #[must_use]
    pub fn as_raw_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }
}

impl MountExecutor for Channel {
    fn mount(&mut self, point: &MountPoint) -> VesselResult<()> {
        #[cfg(target_os = "linux")]
        let flags = u64::from(point.flags.to_raw());
        #[cfg(not(target_os = "linux"))]
        let flags = 0u64;

        self.expect_ok(&Request::Mount {
            source: point.source.clone(),
            destination: point.destination.clone(),
            fstype: point.fstype.clone(),
            flags,
            options: point.options_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_channel_is_a_transport_error() {
        let (mut channel, server) = Channel::pair().unwrap();
        drop(server);

        let err = channel
            .call(&Request::Chdir {
                path: PathBuf::from("/"),
            })
            .unwrap_err();
        assert!(matches!(err, VesselError::Transport { .. }));
    }

    #[test]
    fn frame_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        let payload = br#"{"hello":"world"}"#;

        let mut writer = &a;
        write_frame(&mut writer, payload).unwrap();

        let mut reader = &b;
        let back = read_frame(&mut reader).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn fd_transfer_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();

        send_fd(&a, &file).unwrap();
        let received = recv_fd(&b).unwrap();
        assert!(received.as_raw_fd() >= 0);
    }
}
