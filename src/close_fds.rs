//! Hygiene for caller-injected file descriptors.
//!
//! The container engine may pass extra fds into the monitor (port
//! reservations and the like). They are snapshotted before the monitor opens
//! anything of its own and closed right before the final exit report, so the
//! caller can reuse them immediately.

use std::{fs, os::unix::io::RawFd, sync::OnceLock};

static SNAPSHOT: OnceLock<Vec<RawFd>> = OnceLock::new();

fn list_open_fds() -> Vec<RawFd> {
    let mut fds = vec![];
    if let Ok(dir) = fs::read_dir("/proc/self/fd") {
        for entry in dir.flatten() {
            if let Some(fd) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                fds.push(fd);
            }
        }
    }
    fds
}

/// Record which fds are open right now. Must run before the monitor opens
/// any fd of its own.
pub(crate) fn snapshot_open_fds() {
    SNAPSHOT.get_or_init(list_open_fds);
}

/// Close every snapshotted fd that is not in `keep` and not stdio.
pub(crate) fn close_inherited_fds(keep: &[RawFd]) {
    let snapshot = match SNAPSHOT.get() {
        Some(s) => s,
        None => return,
    };
    for &fd in snapshot {
        if fd >= 3 && !keep.contains(&fd) {
            unsafe { libc::close(fd) };
        }
    }
}

/// Close every currently open fd greater or equal to `first`.
pub(crate) fn close_all_fds_ge_than(first: RawFd) {
    for fd in list_open_fds() {
        if fd >= first {
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn lists_own_fds() {
        let file = tempfile::tempfile().expect("create temp file");
        let fds = list_open_fds();
        assert!(fds.contains(&0));
        assert!(fds.contains(&file.as_raw_fd()));
    }
}
