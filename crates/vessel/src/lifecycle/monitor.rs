#![allow(unsafe_code)]
//! Monitor: supervise the container until it exits.
//!
//! A single-threaded event loop multiplexes two sources: OS signal
//! delivery (a signalfd) and the leader's exit notification (the
//! pending wait reply on the privileged channel). Signals are
//! forwarded to the leader unless the controlling terminal already
//! delivered them; a stop request makes the supervisor stop itself so
//! its own parent notices.

use std::fs::File;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use vessel_common::{VesselError, VesselResult};

use crate::plugin::PluginRegistry;

use super::{ContainerExecution, State};

/// Signals the monitor intercepts and considers forwarding.
const MONITORED_SIGNALS: &[libc::c_int] = &[
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGTSTP,
    libc::SIGCONT,
];

/// A signalfd-backed signal intake.
///
/// Blocks the monitored signals for the process and surfaces them as
/// readable events instead; dropping the source restores the previous
/// signal mask.
#[derive(Debug)]
pub struct SignalSource {
    fd: OwnedFd,
    previous_mask: libc::sigset_t,
}

impl SignalSource {
    /// Install the signal mask and open the signalfd.
    pub fn new() -> VesselResult<Self> {
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            for sig in MONITORED_SIGNALS {
                libc::sigaddset(&mut mask, *sig);
            }

            let mut previous_mask: libc::sigset_t = std::mem::zeroed();
            if libc::sigprocmask(libc::SIG_BLOCK, &mask, &mut previous_mask) != 0 {
                return Err(VesselError::Internal {
                    message: format!("sigprocmask failed: {}", std::io::Error::last_os_error()),
                });
            }

            let fd = libc::signalfd(-1, &mask, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK);
            if fd < 0 {
                return Err(VesselError::Internal {
                    message: format!("signalfd failed: {}", std::io::Error::last_os_error()),
                });
            }

            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
                previous_mask,
            })
        }
    }

    /// The pollable descriptor.
    #[must_use]
    pub fn as_raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// The next pending signal, if one is queued.
    pub fn next(&mut self) -> VesselResult<Option<i32>> {
        let mut info: MaybeUninit<libc::signalfd_siginfo> = MaybeUninit::uninit();
        let size = std::mem::size_of::<libc::signalfd_siginfo>();

        let read = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                info.as_mut_ptr().cast(),
                size,
            )
        };
        if read < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(VesselError::Internal {
                message: format!("cannot read signalfd: {err}"),
            });
        }
        if read as usize != size {
            return Err(VesselError::Internal {
                message: "short signalfd read".to_string(),
            });
        }

        let info = unsafe { info.assume_init() };
        Ok(Some(info.ssi_signo as i32))
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.previous_mask, std::ptr::null_mut());
        }
    }
}

impl ContainerExecution {
    /// Block until the container exits, forwarding signals.
    ///
    /// A registered monitor plugin fully replaces the default loop.
    pub fn monitor(&mut self, plugins: &PluginRegistry, pid: i32) -> VesselResult<i32> {
        self.expect_state(State::Running)?;
        self.state = State::Monitoring;

        let mut signals = SignalSource::new()?;

        if let Some(plugin) = plugins.monitor() {
            tracing::debug!("Monitoring delegated to plugin");
            return plugin.monitor_container(&self.config, pid, &mut signals);
        }

        let channel = self.channel.as_mut().ok_or_else(|| VesselError::Internal {
            message: "monitor without a channel".to_string(),
        })?;
        channel.begin_wait(pid)?;

        tracing::debug!(pid, "Monitoring container");

        loop {
            let mut fds = [
                libc::pollfd {
                    fd: signals.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: channel.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(VesselError::Internal {
                    message: format!("poll failed: {err}"),
                });
            }

            if fds[0].revents & libc::POLLIN != 0 {
                while let Some(signal) = signals.next()? {
                    handle_signal(signal, pid);
                }
            }

            if fds[1].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                let status = channel.finish_wait()?;
                tracing::info!(pid, status, "Container exited");
                return Ok(status);
            }
        }
    }
}

/// Forward one signal to the leader, with the special cases the
/// supervisor owes its own parent.
fn handle_signal(signal: i32, pid: i32) {
    match signal {
        libc::SIGTSTP => {
            // Stop the container, then stop ourselves so the parent
            // shell sees the job stop.
            unsafe {
                libc::kill(pid, libc::SIGSTOP);
                libc::kill(libc::getpid(), libc::SIGSTOP);
            }
        }
        libc::SIGCONT => {
            unsafe { libc::kill(pid, libc::SIGCONT) };
        }
        signal => {
            if terminal_already_delivered(pid) {
                tracing::trace!(signal, "Signal delivered via controlling terminal");
                return;
            }
            tracing::debug!(signal, pid, "Forwarding signal to container");
            unsafe { libc::kill(pid, signal) };
        }
    }
}

/// Whether the leader shares the controlling terminal's foreground
/// process group: if so, keyboard-generated signals already reached it
/// and forwarding would deliver them twice.
fn terminal_already_delivered(pid: i32) -> bool {
    let Ok(tty) = File::open("/dev/tty") else {
        return false;
    };
    let Ok(foreground) = rustix::termios::tcgetpgrp(&tty) else {
        return false;
    };

    let leader_pgrp = unsafe { libc::getpgid(pid) };
    leader_pgrp > 0 && foreground.as_raw_nonzero().get() == leader_pgrp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_source_queues_blocked_signals() {
        let mut source = SignalSource::new().unwrap();
        assert_eq!(source.next().unwrap(), None);

        // Thread-directed, so the signal stays pending on this thread
        // regardless of what other test threads have blocked.
        unsafe {
            libc::pthread_kill(libc::pthread_self(), libc::SIGUSR1);
        }

        // The signal is blocked, so it sits in the signalfd queue.
        let mut seen = None;
        for _ in 0..100 {
            if let Some(signal) = source.next().unwrap() {
                seen = Some(signal);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(seen, Some(libc::SIGUSR1));
    }

    #[test]
    fn mask_is_restored_on_drop() {
        unsafe {
            let mut before: libc::sigset_t = std::mem::zeroed();
            libc::sigprocmask(libc::SIG_SETMASK, std::ptr::null(), &mut before);
            let before_blocked = libc::sigismember(&before, libc::SIGUSR2);

            drop(SignalSource::new().unwrap());

            let mut after: libc::sigset_t = std::mem::zeroed();
            libc::sigprocmask(libc::SIG_SETMASK, std::ptr::null(), &mut after);
            assert_eq!(libc::sigismember(&after, libc::SIGUSR2), before_blocked);
        }
    }
}
