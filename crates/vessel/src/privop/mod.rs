//! The privileged operation channel.
//!
//! A synchronous call/reply boundary between the (possibly
//! unprivileged) supervisor and a privileged helper process. The
//! supervisor sends one request at a time over a private socketpair and
//! blocks until the helper replies or the channel breaks; the helper
//! executes each syscall with its effective capability set narrowed to
//! the minimum that one operation requires.
//!
//! Wire format: length-prefixed JSON frames, one outstanding call, file
//! descriptors transferred out-of-band as ancillary data.

mod client;
mod exec;
mod server;

pub use client::Channel;
pub use exec::SHIM_PROCESS_NAME;
pub use server::serve;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Access mode for a loop attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopMode {
    /// Attach read-only.
    ReadOnly,
    /// Attach read-write.
    ReadWrite,
}

/// File metadata returned by Stat/Lstat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// File mode bits.
    pub mode: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Whether the path is a symlink (Lstat only).
    pub is_symlink: bool,
}

/// A named privileged operation with typed arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// mount(2) with pre-resolved sources and raw flag bits.
    Mount {
        /// Mount source, if any.
        source: Option<PathBuf>,
        /// Mount destination.
        destination: PathBuf,
        /// Filesystem type, if not a bind.
        fstype: Option<String>,
        /// Raw MS_* flag bits.
        flags: u64,
        /// Kernel-facing option string.
        options: String,
    },
    /// Unmount a path, optionally detaching lazily.
    Umount {
        /// Path to unmount.
        path: PathBuf,
        /// Use MNT_DETACH.
        detach: bool,
    },
    /// Enter the final root filesystem view.
    ///
    /// The helper tries a pivot_root strategy first and falls back to
    /// move+chroot when the kernel refuses (e.g. initramfs roots).
    Chroot {
        /// The new root.
        path: PathBuf,
    },
    /// Attach an image file to a free loop device.
    LoopAttach {
        /// Image file path.
        image: PathBuf,
        /// Access mode.
        mode: LoopMode,
        /// Byte offset of the filesystem inside the image.
        offset: u64,
        /// Size limit, 0 for the rest of the file.
        size_limit: u64,
        /// Maximum device slots to claim.
        max_devices: u32,
        /// Reuse an existing identical attachment.
        shared: bool,
    },
    /// Unlock an encrypted partition through the host decrypt tool.
    Decrypt {
        /// Backing device.
        device: PathBuf,
        /// Key material, fed to the tool on stdin.
        key: Vec<u8>,
        /// Mapper name to create.
        name: String,
        /// Whether the container runs an isolated IPC namespace; the
        /// decrypt tool requires host IPC, so the helper temporarily
        /// rejoins it.
        isolated_ipc: bool,
    },
    /// Close a decrypted mapper device.
    CryptClose {
        /// Mapper name to remove.
        name: String,
    },
    /// mkdir(2).
    Mkdir {
        /// Directory to create.
        path: PathBuf,
        /// Mode bits.
        mode: u32,
    },
    /// chdir(2).
    Chdir {
        /// Directory to enter.
        path: PathBuf,
    },
    /// stat(2).
    Stat {
        /// Path to inspect.
        path: PathBuf,
    },
    /// lstat(2).
    Lstat {
        /// Path to inspect.
        path: PathBuf,
    },
    /// symlink(2).
    Symlink {
        /// Link target.
        target: PathBuf,
        /// Link path to create.
        link: PathBuf,
    },
    /// Read directory entry names.
    ReadDir {
        /// Directory to list.
        path: PathBuf,
    },
    /// chown(2).
    Chown {
        /// Path to reown.
        path: PathBuf,
        /// New owning user.
        uid: u32,
        /// New owning group.
        gid: u32,
    },
    /// lchown(2).
    Lchown {
        /// Path to reown without following symlinks.
        path: PathBuf,
        /// New owning user.
        uid: u32,
        /// New owning group.
        gid: u32,
    },
    /// readlink(2).
    Readlink {
        /// Symlink to read.
        path: PathBuf,
    },
    /// umask(2); replies with the previous mask.
    Umask {
        /// New mask.
        mask: u32,
    },
    /// Create a file with the given mode and contents.
    WriteFile {
        /// File to write.
        path: PathBuf,
        /// Mode bits.
        mode: u32,
        /// File contents.
        contents: Vec<u8>,
    },
    /// Receive a FUSE file descriptor from the caller (ancillary data
    /// accompanies the request); replies with the helper-side fd
    /// number for use in a later fuse mount option string.
    SendFuseFd,
    /// Open /dev/fuse on the privileged side and pass the descriptor
    /// back to the caller as ancillary data.
    OpenSendFuseFd,
    /// Launch the container leader process inside the prepared view.
    ///
    /// The helper forks the leader (interposing a reaping shim as the
    /// PID namespace's process 1 unless `no_init`) and replies with
    /// its pid.
    Exec {
        /// Entry process argv.
        command: Vec<String>,
        /// Entry process environment.
        env: Vec<(String, String)>,
        /// Initial working directory inside the container.
        cwd: Option<PathBuf>,
        /// Hostname to set when a UTS namespace was unshared.
        hostname: Option<String>,
        /// Interpose the reaping shim as namespace init.
        shim: bool,
        /// Capability names to apply to the leader before exec.
        capabilities: Vec<String>,
    },
    /// Block until the leader exits; replies with its exit status.
    Wait {
        /// The pid returned by Exec.
        pid: i32,
    },
}

impl Request {
    /// Operation name for error context and logging.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Mount { .. } => "mount",
            Request::Umount { .. } => "umount",
            Request::Chroot { .. } => "chroot",
            Request::LoopAttach { .. } => "loop attach",
            Request::Decrypt { .. } => "decrypt",
            Request::CryptClose { .. } => "crypt close",
            Request::Mkdir { .. } => "mkdir",
            Request::Chdir { .. } => "chdir",
            Request::Stat { .. } => "stat",
            Request::Lstat { .. } => "lstat",
            Request::Symlink { .. } => "symlink",
            Request::ReadDir { .. } => "readdir",
            Request::Chown { .. } => "chown",
            Request::Lchown { .. } => "lchown",
            Request::Readlink { .. } => "readlink",
            Request::Umask { .. } => "umask",
            Request::WriteFile { .. } => "write file",
            Request::SendFuseFd => "send fuse fd",
            Request::OpenSendFuseFd => "open fuse fd",
            Request::Exec { .. } => "exec",
            Request::Wait { .. } => "wait",
        }
    }

    /// The path the operation targets, for error context.
    #[must_use]
    pub fn target(&self) -> PathBuf {
        match self {
            Request::Mount { destination, .. } => destination.clone(),
            Request::Umount { path, .. }
            | Request::Chroot { path }
            | Request::Mkdir { path, .. }
            | Request::Chdir { path }
            | Request::Stat { path }
            | Request::Lstat { path }
            | Request::ReadDir { path }
            | Request::Chown { path, .. }
            | Request::Lchown { path, .. }
            | Request::Readlink { path }
            | Request::WriteFile { path, .. } => path.clone(),
            Request::LoopAttach { image, .. } => image.clone(),
            Request::Decrypt { device, .. } => device.clone(),
            Request::CryptClose { name } => PathBuf::from("/dev/mapper").join(name),
            Request::Symlink { link, .. } => link.clone(),
            Request::Umask { .. }
            | Request::SendFuseFd
            | Request::OpenSendFuseFd
            | Request::Exec { .. }
            | Request::Wait { .. } => PathBuf::new(),
        }
    }
}

/// The typed reply to one [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Operation succeeded with no payload.
    Ok,
    /// A device path (loop attach, decrypt).
    Device {
        /// The device path.
        path: PathBuf,
    },
    /// File metadata.
    Info {
        /// The metadata.
        info: FileInfo,
    },
    /// Directory entry names.
    Entries {
        /// Entry names in directory order.
        names: Vec<String>,
    },
    /// A path payload (readlink).
    Path {
        /// The path.
        path: PathBuf,
    },
    /// The previous umask.
    Mask {
        /// Previous mask bits.
        previous: u32,
    },
    /// A helper-side file descriptor number; when the descriptor
    /// travels to the caller it rides as ancillary data on this frame.
    Fd {
        /// The descriptor number on the helper side.
        raw: i32,
    },
    /// The container leader was started.
    Started {
        /// Leader pid, as seen from the supervisor's pid namespace.
        pid: i32,
    },
    /// The container leader exited.
    Exited {
        /// Exit code, or 128 plus the terminating signal number.
        status: i32,
    },
    /// The remote syscall failed.
    Err {
        /// The operation that failed.
        operation: String,
        /// The path it targeted.
        path: PathBuf,
        /// The raw errno.
        errno: i32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = Request::Mount {
            source: Some(PathBuf::from("/dev/loop0")),
            destination: PathBuf::from("/mnt/root"),
            fstype: Some("squashfs".to_string()),
            flags: 1,
            options: String::new(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.operation(), "mount");
        assert_eq!(back.target(), PathBuf::from("/mnt/root"));
    }

    #[test]
    fn reply_err_roundtrip() {
        let reply = Reply::Err {
            operation: "mount".to_string(),
            path: PathBuf::from("/mnt"),
            errno: libc::EBUSY,
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(matches!(
            serde_json::from_str::<Reply>(&json).unwrap(),
            Reply::Err { errno, .. } if errno == libc::EBUSY
        ));
    }
}
