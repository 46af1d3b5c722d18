#![allow(unsafe_code)]
//! Container leader launch on the helper side.
//!
//! The helper lives inside the container's namespaces, so it is the
//! process that forks the leader. With a PID namespace and no opt-out,
//! a minimal reaping shim is interposed as the namespace's process 1:
//! it forwards termination signals to the payload and reaps everything
//! else.

use std::ffi::CString;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::capability::CapabilitySet;

/// `comm` value of the shim process; instance join validation checks
/// this sentinel before trusting recorded namespace paths.
pub const SHIM_PROCESS_NAME: &str = "vessel-shim";

/// Fork the container leader, returning its pid.
pub(super) fn do_exec(
    command: &[String],
    env: &[(String, String)],
    cwd: Option<&Path>,
    hostname: Option<&str>,
    shim: bool,
    capabilities: &[String],
) -> std::io::Result<i32> {
    if command.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        ));
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error());
    }

    if pid == 0 {
        // Leader process: namespace init when a PID namespace was
        // unshared at helper spawn.
        if let Some(hostname) = hostname {
            set_hostname(hostname);
        }

        if shim {
            run_shim(command, env, cwd, capabilities);
        } else {
            exec_payload(command, env, cwd, capabilities);
        }
    }

    tracing::debug!(pid, shim, "Container leader started");
    Ok(pid)
}

/// Block until `pid` exits; returns the exit code, or 128 plus the
/// terminating signal number.
pub(super) fn do_wait(pid: i32) -> std::io::Result<i32> {
    let mut status: libc::c_int = 0;
    loop {
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break;
    }

    Ok(decode_status(status))
}

fn decode_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

fn set_hostname(hostname: &str) {
    let ret = unsafe {
        libc::sethostname(
            hostname.as_ptr().cast(),
            hostname.len() as libc::size_t,
        )
    };
    if ret != 0 {
        tracing::warn!(
            hostname,
            error = %std::io::Error::last_os_error(),
            "Cannot set container hostname"
        );
    }
}

/// Apply the leader's environment and exec the payload. Never returns.
fn exec_payload(
    command: &[String],
    env: &[(String, String)],
    cwd: Option<&Path>,
    capabilities: &[String],
) -> ! {
    if let Some(dir) = cwd {
        if rustix::process::chdir(dir).is_err() {
            eprintln!("cannot enter working directory {}", dir.display());
            unsafe { libc::_exit(1) };
        }
    }

    let caps = CapabilitySet::from_names(capabilities);
    if let Err(e) = caps.apply() {
        eprintln!("cannot apply container capabilities: {e}");
        unsafe { libc::_exit(1) };
    }

    // Safety: single-threaded child between fork and exec.
    for (key, value) in env {
        unsafe { std::env::set_var(key, value) };
    }

    let c_args: Vec<CString> = command
        .iter()
        .filter_map(|s| CString::new(s.as_bytes()).ok())
        .collect();
    let c_arg_ptrs: Vec<*const libc::c_char> = c_args
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execvp(c_arg_ptrs[0], c_arg_ptrs.as_ptr());
    }

    eprintln!("cannot execute {}", command[0]);
    unsafe { libc::_exit(127) };
}

/// Payload pid, readable from the shim's signal handlers.
static PAYLOAD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: libc::c_int) {
    let pid = PAYLOAD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe { libc::kill(pid, sig) };
    }
}

/// Run as the PID namespace's process 1. Never returns.
///
/// Forks the payload, forwards termination signals to it and reaps
/// every orphan the namespace produces; exits with the payload's
/// status once it is gone.
fn run_shim(
    command: &[String],
    env: &[(String, String)],
    cwd: Option<&Path>,
    capabilities: &[String],
) -> ! {
    let name = CString::new(SHIM_PROCESS_NAME).unwrap_or_default();
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr());
    }

    let payload = unsafe { libc::fork() };
    if payload < 0 {
        eprintln!("shim cannot fork payload");
        unsafe { libc::_exit(1) };
    }
    if payload == 0 {
        exec_payload(command, env, cwd, capabilities);
    }

    PAYLOAD_PID.store(payload, Ordering::SeqCst);

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = forward_signal as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in [libc::SIGTERM, libc::SIGINT, libc::SIGHUP, libc::SIGUSR1, libc::SIGUSR2] {
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    }

    let mut payload_status = 1;
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid == payload {
            payload_status = decode_status(status);
            // Give orphans a chance to terminate, then leave: the
            // namespace dies with its init.
            continue;
        }
        if pid == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            // ECHILD: everything is reaped.
            break;
        }
    }

    unsafe { libc::_exit(payload_status) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decoding() {
        // Synthetic wait statuses: exited(3) and killed by SIGKILL.
        let exited = 3 << 8;
        assert_eq!(decode_status(exited), 3);

        let signaled = libc::SIGKILL;
        assert_eq!(decode_status(signaled), 128 + libc::SIGKILL);
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = do_exec(&[], &[], None, None, false, &[]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
