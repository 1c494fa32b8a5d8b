//! Exit status handling: reaping children, translating wait statuses,
//! forwarding termination signals and running the exit command.

use crate::close_fds;
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::errno::Errno;
use std::{
    ffi::CString,
    os::unix::ffi::OsStrExt,
    path::Path,
    ptr,
    sync::{
        atomic::{AtomicI32, Ordering},
        OnceLock,
    },
};

/// Pid of the container process, `-1` until the runtime pidfile was read and
/// after the container was reaped. Mirrored into a static so the termination
/// signal handler can forward signals without touching supervisor state.
static CONTAINER_PID: AtomicI32 = AtomicI32::new(-1);

/// Pid of the forked runtime invocation, `-1` before the fork and after the
/// runtime was reaped.
static CREATE_PID: AtomicI32 = AtomicI32::new(-1);

static EXIT_COMMAND: OnceLock<ExitCommand> = OnceLock::new();

struct ExitCommand {
    path: CString,
    argv: Vec<CString>,
    delay: u32,
}

pub(crate) fn set_container_pid(pid: i32) {
    CONTAINER_PID.store(pid, Ordering::Relaxed);
}

pub(crate) fn set_create_pid(pid: i32) {
    CREATE_PID.store(pid, Ordering::Relaxed);
}

/// Translate a raw wait status into the exit code the monitor reports:
/// the exit status for normal exits, `128 + signal` for signaled ones and
/// `-1` for everything else.
pub(crate) fn get_exit_status(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        return libc::WEXITSTATUS(status);
    }
    if libc::WIFSIGNALED(status) {
        return 128 + libc::WTERMSIG(status);
    }
    -1
}

/// Outcome of one non-blocking `waitpid(-1)` round.
pub(crate) enum WaitResult {
    /// A child changed state.
    Child { pid: i32, status: i32 },
    /// Children exist but none is ready.
    NoneReady,
    /// No children are left at all.
    NoChildren,
}

/// One `waitpid(-1, WNOHANG)` round, retrying `EINTR`.
pub(crate) fn wait_next_child() -> Result<WaitResult> {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ECHILD => return Ok(WaitResult::NoChildren),
                e => return Err(e).context("wait for child process status"),
            }
        }
        if pid == 0 {
            return Ok(WaitResult::NoneReady);
        }
        return Ok(WaitResult::Child { pid, status });
    }
}

/// Forward a termination signal to the container, falling back to the
/// runtime create pid. Async-signal-safe: only `kill` and `raise`.
extern "C" fn on_sig_exit(signal: libc::c_int) {
    let container_pid = CONTAINER_PID.load(Ordering::Relaxed);
    let create_pid = CREATE_PID.load(Ordering::Relaxed);

    if container_pid > 0 && unsafe { libc::kill(container_pid, signal) } == 0 {
        return;
    }
    if create_pid > 0 {
        if unsafe { libc::kill(create_pid, signal) } == 0 {
            return;
        }
        // The create process might have exited already, try the container.
        if Errno::last() == Errno::ESRCH
            && container_pid > 0
            && unsafe { libc::kill(container_pid, signal) } == 0
        {
            return;
        }
    }
    // Force a child re-check through the signalfd.
    unsafe { libc::raise(libc::SIGUSR1) };
}

/// Install the forwarding handlers for SIGTERM, SIGQUIT and SIGINT.
pub(crate) fn install_signal_forwarders() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    for sig in [Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGINT] {
        unsafe { signal(sig, SigHandler::Handler(on_sig_exit)) }
            .context("register forwarding signal handler")?;
    }
    Ok(())
}

pub(crate) extern "C" fn reap_children() {
    // We need to reap any zombies (from an OCI runtime that errored) before
    // exiting.
    unsafe { while libc::waitpid(-1, ptr::null_mut(), libc::WNOHANG) > 0 {} };
}

pub(crate) fn set_subreaper(enabled: bool) -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, enabled as libc::c_ulong, 0, 0, 0) } != 0
    {
        return Err(Errno::last()).context("set child subreaper");
    }
    Ok(())
}

pub(crate) fn set_pdeathsig(signal: libc::c_int) -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal as libc::c_ulong, 0, 0, 0) } != 0 {
        return Err(Errno::last()).context("set parent death signal");
    }
    Ok(())
}

/// Remember the exit command and register the atexit hook that runs it.
pub(crate) fn register_exit_command(path: &Path, args: &[String], delay: u32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).context("exit command path")?;
    let mut argv = vec![c_path.clone()];
    for arg in args {
        argv.push(CString::new(arg.as_str()).context("exit command arg")?);
    }
    EXIT_COMMAND
        .set(ExitCommand {
            path: c_path,
            argv,
            delay,
        })
        .ok();
    unsafe { libc::atexit(do_exit_command) };
    Ok(())
}

/// Run the configured exit command in a grandchild while the exiting monitor
/// reaps leftovers. A non-zero exit command status overrides the monitor's.
extern "C" fn do_exit_command() {
    let cmd = match EXIT_COMMAND.get() {
        Some(cmd) => cmd,
        None => return,
    };

    unsafe { libc::signal(libc::SIGCHLD, libc::SIG_DFL) };

    // Close everything except stdin, stdout and stderr.
    close_fds::close_all_fds_ge_than(3);

    // We don't want the exit command to be reaped by the exiting monitor as
    // that would prevent the double-fork from doing its job.
    if set_subreaper(false).is_err() {
        warn!("Failed to disable self subreaper attribute");
    }

    let exit_pid = unsafe { libc::fork() };
    if exit_pid < 0 {
        unsafe { libc::_exit(libc::EXIT_FAILURE) };
    }

    if exit_pid > 0 {
        // Clean up any zombie the container runtime could have left around.
        let mut exit_status = 0;
        loop {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(-1, &mut status, 0) };
            if ret == exit_pid {
                exit_status = get_exit_status(status);
            }
            if ret < 0 && Errno::last() != Errno::EINTR {
                break;
            }
        }
        if exit_status != 0 {
            unsafe { libc::_exit(exit_status) };
        }
        return;
    }

    if cmd.delay > 0 {
        debug!(
            "Sleeping for {} seconds before executing exit command",
            cmd.delay
        );
        unsafe { libc::sleep(cmd.delay) };
    }

    let argv: Vec<&std::ffi::CStr> = cmd.argv.iter().map(CString::as_c_str).collect();
    nix::unistd::execv(&cmd.path, &argv).ok();

    // Should not happen, but better be safe.
    unsafe { libc::_exit(libc::EXIT_FAILURE) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_translation() {
        struct Tc {
            status: i32,
            expected: i32,
        }
        let test_cases = vec![
            Tc {
                status: 0,
                expected: 0,
            },
            Tc {
                // Exited with code 3.
                status: 3 << 8,
                expected: 3,
            },
            Tc {
                // Killed by SIGKILL.
                status: libc::SIGKILL,
                expected: 128 + libc::SIGKILL,
            },
            Tc {
                // Killed by SIGTERM.
                status: libc::SIGTERM,
                expected: 128 + libc::SIGTERM,
            },
            Tc {
                // Stopped, neither exited nor signaled.
                status: 0x137f,
                expected: -1,
            },
        ];
        for tc in test_cases {
            assert_eq!(get_exit_status(tc.status), tc.expected);
        }
    }
}
