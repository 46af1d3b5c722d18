#![allow(unsafe_code)]
//! Loop device attachment.
//!
//! Runs on the privileged side of the operation channel. Attaching an
//! image means: pick a free device slot, open its node, associate the
//! image's descriptor, then push offset/size/flags. The kernel hands
//! the same free slot to every asker, so losing the association race is
//! normal under load and retried until a slot sticks or the configured
//! device budget is exhausted.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::privop::LoopMode;

const LOOP_CONTROL: &str = "/dev/loop-control";

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// Bounded retries for a status push that reports EAGAIN.
const STATUS_RETRIES: u32 = 5;

/// Mirror of the kernel's `struct loop_info64`.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn zeroed() -> Self {
        // Safety: all fields are plain integers and byte arrays.
        unsafe { std::mem::zeroed() }
    }

    fn for_attachment(image: &Path, mode: LoopMode, offset: u64, size_limit: u64) -> Self {
        let mut info = Self::zeroed();
        info.lo_offset = offset;
        info.lo_sizelimit = size_limit;
        info.lo_flags = LO_FLAGS_AUTOCLEAR;
        if mode == LoopMode::ReadOnly {
            info.lo_flags |= LO_FLAGS_READ_ONLY;
        }

        let bytes = image.as_os_str().as_encoded_bytes();
        let len = bytes.len().min(LO_NAME_SIZE - 1);
        info.lo_file_name[..len].copy_from_slice(&bytes[..len]);
        info
    }
}

/// Whether an existing attachment matches an image+mode pair.
fn info_matches(info: &LoopInfo64, image: &Path, mode: LoopMode, offset: u64) -> bool {
    let readonly = info.lo_flags & LO_FLAGS_READ_ONLY != 0;
    if readonly != (mode == LoopMode::ReadOnly) || info.lo_offset != offset {
        return false;
    }

    let bytes = image.as_os_str().as_encoded_bytes();
    if bytes.len() >= LO_NAME_SIZE {
        // The stored name was truncated; identity cannot be verified.
        return false;
    }
    info.lo_file_name[..bytes.len()] == bytes[..] && info.lo_file_name[bytes.len()] == 0
}

fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{index}"))
}

/// Open a device node, creating it when the kernel allocated a slot
/// faster than udev produced the node.
fn open_device(index: u32, mode: LoopMode) -> std::io::Result<File> {
    let path = device_path(index);
    let open = |path: &Path| {
        OpenOptions::new()
            .read(true)
            .write(mode == LoopMode::ReadWrite)
            .open(path)
    };

    match open(&path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let path_c = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                .map_err(|_| std::io::Error::other("device path contains NUL"))?;
            let dev = libc::makedev(7, index);
            let ret = unsafe { libc::mknod(path_c.as_ptr(), libc::S_IFBLK | 0o660, dev) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EEXIST) {
                    return Err(err);
                }
            }
            open(&path)
        }
        Err(e) => Err(e),
    }
}

/// Ask the loop-control device for a free slot index.
fn next_free_index(control: &File) -> std::io::Result<u32> {
    let ret = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ret as u32)
}

/// Find an existing attachment for the same image+mode pair.
fn find_shared(
    image: &Path,
    mode: LoopMode,
    offset: u64,
    max_devices: u32,
) -> Option<PathBuf> {
    for index in 0..max_devices {
        let Ok(device) = OpenOptions::new().read(true).open(device_path(index)) else {
            continue;
        };

        let mut info = LoopInfo64::zeroed();
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_GET_STATUS64,
                std::ptr::addr_of_mut!(info),
            )
        };
        if ret == 0 && info_matches(&info, image, mode, offset) {
            tracing::debug!(
                image = %image.display(),
                device = %device_path(index).display(),
                "Reusing shared loop attachment"
            );
            return Some(device_path(index));
        }
    }
    None
}

/// Attach an image file to a free loop device.
///
/// With `shared`, an existing attachment of the identical image+mode
/// pair is reused instead of claiming a new slot; this trades isolation
/// for lower device pressure under many-identical-image workloads.
/// Returns ENOSPC once `max_devices` slots are exhausted.
pub fn attach(
    image: &Path,
    mode: LoopMode,
    offset: u64,
    size_limit: u64,
    max_devices: u32,
    shared: bool,
) -> std::io::Result<PathBuf> {
    if shared {
        if let Some(device) = find_shared(image, mode, offset, max_devices) {
            return Ok(device);
        }
    }

    let backing = OpenOptions::new()
        .read(true)
        .write(mode == LoopMode::ReadWrite)
        .open(image)?;

    let control = OpenOptions::new().read(true).write(true).open(LOOP_CONTROL)?;

    // Each lost association race consumes one attempt; a well-behaved
    // kernel hands out a different slot next time.
    for _ in 0..max_devices {
        let index = next_free_index(&control)?;
        if index >= max_devices {
            return Err(std::io::Error::from_raw_os_error(libc::ENOSPC));
        }

        let device = open_device(index, mode)?;

        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_FD,
                backing.as_raw_fd() as libc::c_ulong,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EBUSY) {
                tracing::debug!(index, "Lost loop device race, retrying allocation");
                continue;
            }
            return Err(err);
        }

        return match set_status(&device, image, mode, offset, size_limit) {
            Ok(()) => {
                tracing::debug!(
                    image = %image.display(),
                    device = %device_path(index).display(),
                    offset,
                    "Attached image to loop device"
                );
                Ok(device_path(index))
            }
            Err(e) => {
                // Leave nothing half-attached behind.
                unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD) };
                Err(e)
            }
        };
    }

    Err(std::io::Error::from_raw_os_error(libc::ENOSPC))
}

/// Push offset/size/flags, retrying the transient EAGAIN the kernel
/// reports while the backing file is still settling.
fn set_status(
    device: &File,
    image: &Path,
    mode: LoopMode,
    offset: u64,
    size_limit: u64,
) -> std::io::Result<()> {
    let info = LoopInfo64::for_attachment(image, mode, offset, size_limit);

    let mut attempts = 0;
    loop {
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_STATUS64,
                std::ptr::addr_of!(info),
            )
        };
        if ret == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        attempts += 1;
        if err.raw_os_error() != Some(libc::EAGAIN) || attempts >= STATUS_RETRIES {
            return Err(err);
        }
        std::thread::sleep(std::time::Duration::from_millis(250));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_info64_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }

    #[test]
    fn attachment_info_carries_mode_and_offset() {
        let info = LoopInfo64::for_attachment(
            Path::new("/images/base.sif"),
            LoopMode::ReadOnly,
            4096,
            0,
        );
        assert_eq!(info.lo_offset, 4096);
        assert_ne!(info.lo_flags & LO_FLAGS_READ_ONLY, 0);
        assert_ne!(info.lo_flags & LO_FLAGS_AUTOCLEAR, 0);
    }

    #[test]
    fn shared_match_requires_identical_image_mode_and_offset() {
        let image = Path::new("/images/base.sif");
        let info = LoopInfo64::for_attachment(image, LoopMode::ReadOnly, 4096, 0);

        assert!(info_matches(&info, image, LoopMode::ReadOnly, 4096));
        assert!(!info_matches(&info, image, LoopMode::ReadWrite, 4096));
        assert!(!info_matches(&info, image, LoopMode::ReadOnly, 0));
        assert!(!info_matches(
            &info,
            Path::new("/images/other.sif"),
            LoopMode::ReadOnly,
            4096
        ));
    }

    #[test]
    fn name_truncation_still_matches_prefix_safely() {
        let long = "/images/".to_string() + &"x".repeat(100) + ".sif";
        let image = PathBuf::from(long);
        let info = LoopInfo64::for_attachment(&image, LoopMode::ReadOnly, 0, 0);

        // The stored name is truncated, so identity cannot be verified
        // and sharing must not kick in.
        assert!(!info_matches(&info, &image, LoopMode::ReadOnly, 0));
    }
}
