//! Out-of-memory detection across both cgroup hierarchies.
//!
//! cgroup v2 watches `memory.events` with inotify and tracks the `oom` /
//! `oom_kill` counters; cgroup v1 registers an eventfd with
//! `cgroup.event_control`. Every failure in here degrades to "no OOM
//! detection" instead of aborting the monitor.

use crate::utils::write_all;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::{
    fcntl::{open, OFlag},
    sys::{
        eventfd::{eventfd, EfdFlags},
        stat::Mode,
        statfs::statfs,
    },
    unistd::{close, read},
};
use std::{
    ffi::CString,
    fs,
    os::unix::{ffi::OsStrExt, io::RawFd},
    path::{Path, PathBuf},
};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// OOM detection state for one container.
pub(crate) enum OomState {
    V1(OomV1),
    V2(OomV2),
}

pub(crate) struct OomV1 {
    event_fd: RawFd,
    oom_control_fd: RawFd,
    event_control_path: PathBuf,
    persist_path: Option<PathBuf>,
}

pub(crate) struct OomV2 {
    inotify_fd: RawFd,
    memory_events_path: PathBuf,
    last_counter: i64,
    persist_path: Option<PathBuf>,
}

/// Detect the cgroup version and wire up OOM monitoring for `pid`.
pub(crate) fn setup(pid: i32, persist_path: Option<&Path>) -> Option<OomState> {
    let cgroup2 = statfs(CGROUP_ROOT)
        .map(|fs| fs.filesystem_type().0 == libc::CGROUP2_SUPER_MAGIC)
        .unwrap_or(false);

    let result = if cgroup2 {
        setup_v2(pid, persist_path).map(OomState::V2)
    } else {
        setup_v1(pid, persist_path).map(OomState::V1)
    };

    match result {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("giving up on OOM detection: {:#}", e);
            None
        }
    }
}

fn setup_v2(pid: i32, persist_path: Option<&Path>) -> Result<OomV2> {
    let content = fs::read_to_string(format!("/proc/{}/cgroup", pid))
        .context("read cgroup file, container may have exited")?;
    let cgroup_path =
        parse_cgroup_path(&content, true, "").context("resolve cgroup v2 path")?;
    let memory_events_path = PathBuf::from(cgroup_path).join("memory.events");

    let inotify_fd =
        unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
    if inotify_fd < 0 {
        return Err(nix::errno::Errno::last()).context("create inotify fd");
    }

    let c_path = CString::new(memory_events_path.as_os_str().as_bytes())
        .context("memory.events path")?;
    if unsafe { libc::inotify_add_watch(inotify_fd, c_path.as_ptr(), libc::IN_MODIFY) } < 0 {
        let err = nix::errno::Errno::last();
        close(inotify_fd).ok();
        return Err(err)
            .with_context(|| format!("add inotify watch for {}", memory_events_path.display()));
    }

    Ok(OomV2 {
        inotify_fd,
        memory_events_path,
        last_counter: 0,
        persist_path: persist_path.map(Path::to_path_buf),
    })
}

fn setup_v1(pid: i32, persist_path: Option<&Path>) -> Result<OomV1> {
    let content = fs::read_to_string(format!("/proc/{}/cgroup", pid))
        .context("read cgroup file, container may have exited")?;
    let memory_cgroup_path =
        parse_cgroup_path(&content, false, "memory").context("resolve memory cgroup path")?;

    let event_control_path = PathBuf::from(&memory_cgroup_path).join("cgroup.event_control");
    let control_fd = open(
        &event_control_path,
        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("open {}", event_control_path.display()))?;

    let oom_control_path = PathBuf::from(&memory_cgroup_path).join("memory.oom_control");
    let oom_control_fd = match open(
        &oom_control_path,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(e) => {
            close(control_fd).ok();
            return Err(e).with_context(|| format!("open {}", oom_control_path.display()));
        }
    };

    let event_fd = match eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK) {
        Ok(fd) => fd,
        Err(e) => {
            close(control_fd).ok();
            close(oom_control_fd).ok();
            return Err(e).context("create eventfd");
        }
    };

    let registration = format!("{} {}", event_fd, oom_control_fd);
    let result = write_all(control_fd, registration.as_bytes());
    close(control_fd).ok();
    if let Err(e) = result {
        close(event_fd).ok();
        close(oom_control_fd).ok();
        return Err(e).context("write to cgroup.event_control");
    }

    Ok(OomV1 {
        event_fd,
        oom_control_fd,
        event_control_path,
        persist_path: persist_path.map(Path::to_path_buf),
    })
}

impl OomState {
    /// The fd to watch for readability.
    pub fn event_fd(&self) -> RawFd {
        match self {
            OomState::V1(v1) => v1.event_fd,
            OomState::V2(v2) => v2.inotify_fd,
        }
    }

    /// Process one readiness event. Returns false once the watch is dead
    /// and should be dropped from the event loop.
    pub fn handle_event(&mut self) -> bool {
        match self {
            OomState::V1(v1) => v1.handle_event(),
            OomState::V2(v2) => v2.handle_event(),
        }
    }

    /// One final counter check before the exit report, so an OOM kill that
    /// raced the container exit is still recorded.
    pub fn final_check(&mut self) {
        if let OomState::V2(v2) = self {
            v2.check_counters();
        }
    }
}

impl OomV1 {
    fn handle_event(&mut self) -> bool {
        // If the event_control file is gone the cgroup was removed, which
        // may itself be one of the queued events.
        let cgroup_removed = !self.event_control_path.exists();

        let mut count_buf = [0u8; 8];
        let num_read = match read(self.event_fd, &mut count_buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("failed to read oom event from eventfd: {}", e);
                return true;
            }
        };
        if num_read == 0 {
            return false;
        }
        if num_read != 8 {
            warn!("failed to read full oom event from eventfd");
            return true;
        }

        let event_count = u64::from_ne_bytes(count_buf);
        debug!("memory cgroup event count: {}", event_count);
        if event_count == 0 {
            warn!("unexpected event count (zero) when reading for oom event");
            return true;
        }

        // A single event on a removed cgroup is the removal, not an OOM.
        if event_count == 1 && cgroup_removed {
            return true;
        }

        info!("OOM event received");
        write_oom_files(self.persist_path.as_deref());
        true
    }
}

impl OomV2 {
    fn handle_event(&mut self) -> bool {
        // Drop the queued inotify events.
        let mut events = [0u8; 4096];
        if read(self.inotify_fd, &mut events).is_err() {
            warn!("failed to read inotify event for memory.events");
            return true;
        }
        self.check_counters()
    }

    /// Re-read `memory.events` and compare the counters with the last
    /// observed value. Returns false when the file disappeared for good.
    fn check_counters(&mut self) -> bool {
        let content = match fs::read_to_string(&self.memory_events_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "failed to open {}: {}",
                    self.memory_events_path.display(),
                    e
                );
                return true;
            }
        };
        match parse_memory_events(&content) {
            Some(counter) => {
                if counter != self.last_counter {
                    info!("OOM event received");
                    if write_oom_files(self.persist_path.as_deref()) {
                        self.last_counter = counter;
                    }
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for OomState {
    fn drop(&mut self) {
        match self {
            OomState::V1(v1) => {
                close(v1.event_fd).ok();
                close(v1.oom_control_fd).ok();
            }
            OomState::V2(v2) => {
                close(v2.inotify_fd).ok();
            }
        }
    }
}

/// Resolve the cgroup directory for a process from its `/proc/<pid>/cgroup`
/// content. For v2 the line with the empty controller list wins; for v1 the
/// line carrying `subsystem` does.
fn parse_cgroup_path(content: &str, cgroup2: bool, subsystem: &str) -> Option<String> {
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let _hierarchy = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;

        if cgroup2 {
            if controllers.is_empty() {
                return Some(format!("{}{}", CGROUP_ROOT, path));
            }
            continue;
        }

        if controllers.split(',').any(|c| c == subsystem) {
            return Some(format!("{}/{}{}", CGROUP_ROOT, subsystem, path));
        }
    }
    None
}

/// Extract the first non-zero `oom` / `oom_kill` counter.
fn parse_memory_events(content: &str) -> Option<i64> {
    for line in content.lines() {
        let counter = if let Some(value) = line.strip_prefix("oom_kill ") {
            value
        } else if let Some(value) = line.strip_prefix("oom ") {
            value
        } else {
            continue;
        };
        match counter.trim().parse::<i64>() {
            Ok(0) => continue,
            Ok(counter) => return Some(counter),
            Err(_) => {
                warn!("failed to parse memory.events counter: {}", counter);
                continue;
            }
        }
    }
    None
}

/// Leave the `oom` marker files behind, best-effort.
fn write_oom_files(persist_path: Option<&Path>) -> bool {
    if let Some(persist_path) = persist_path {
        if fs::write(persist_path.join("oom"), b"").is_err() {
            warn!("failed to write oom file to persist directory");
        }
    }
    match fs::write("oom", b"") {
        Ok(_) => true,
        Err(_) => {
            warn!("failed to write oom file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_path_resolution() {
        struct Tc {
            content: &'static str,
            cgroup2: bool,
            subsystem: &'static str,
            expected: Option<&'static str>,
        }
        let test_cases = vec![
            Tc {
                content: "0::/machine.slice/libpod-abc.scope\n",
                cgroup2: true,
                subsystem: "",
                expected: Some("/sys/fs/cgroup/machine.slice/libpod-abc.scope"),
            },
            Tc {
                content: "11:memory:/libpod_parent/ctr\n10:cpu,cpuacct:/other\n",
                cgroup2: false,
                subsystem: "memory",
                expected: Some("/sys/fs/cgroup/memory/libpod_parent/ctr"),
            },
            Tc {
                content: "10:cpu,cpuacct:/other\n",
                cgroup2: false,
                subsystem: "memory",
                expected: None,
            },
            Tc {
                content: "11:memory:/ctr\n",
                cgroup2: true,
                subsystem: "",
                expected: None,
            },
        ];
        for tc in test_cases {
            assert_eq!(
                parse_cgroup_path(tc.content, tc.cgroup2, tc.subsystem).as_deref(),
                tc.expected
            );
        }
    }

    #[test]
    fn memory_events_counters() {
        assert_eq!(parse_memory_events("low 0\nhigh 0\noom 0\noom_kill 0\n"), None);
        assert_eq!(parse_memory_events("oom 3\noom_kill 2\n"), Some(3));
        assert_eq!(parse_memory_events("oom_kill 2\noom 0\n"), Some(2));
        assert_eq!(parse_memory_events("oom 0\noom_kill 1\n"), Some(1));
        assert_eq!(parse_memory_events(""), None);
        assert_eq!(parse_memory_events("oom_group_kill 5\n"), None);
    }
}
