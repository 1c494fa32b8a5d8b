//! The control channel: `ctl` and `winsz` FIFOs under the bundle path, and
//! acceptance of the PTY master the runtime hands over the console socket.

use crate::{cmsg::recvfd, container_logging::LogSinks, utils::write_all};
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::{
    fcntl::{open, OFlag},
    pty::Winsize,
    sys::{
        socket::{accept4, SockFlag},
        stat::Mode,
        termios::{tcgetattr, tcsetattr, OutputFlags, SetArg},
    },
    unistd::{close, mkfifo, read},
};
use std::{os::unix::io::RawFd, path::Path};

/// Window resize request from the caller.
pub(crate) const WIN_RESIZE_EVENT: i32 = 1;
/// Reopen-logs request from the caller.
pub(crate) const REOPEN_LOGS_EVENT: i32 = 2;

const CTL_BUF_SIZE: usize = 200;

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

/// Rolling buffer collecting newline-terminated control messages from a
/// non-blocking fd. Complete lines are handed out, the partial tail is
/// retained for the next read.
pub(crate) struct LineBuffer {
    buf: [u8; CTL_BUF_SIZE],
    len: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0; CTL_BUF_SIZE],
            len: 0,
        }
    }

    /// Read once from `fd` and return every complete line.
    pub fn read_from(&mut self, fd: RawFd) -> Vec<String> {
        let num_read = match read(fd, &mut self.buf[self.len..]) {
            Ok(n) if n > 0 => n,
            Ok(_) | Err(_) => {
                debug!("failed to read from control fd {}", fd);
                return vec![];
            }
        };
        self.len += num_read;
        self.drain_lines()
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = vec![];
        let mut start = 0;
        while let Some(pos) = self.buf[start..self.len].iter().position(|&b| b == b'\n') {
            let line = &self.buf[start..start + pos];
            lines.push(String::from_utf8_lossy(line).into_owned());
            start += pos + 1;
        }
        self.buf.copy_within(start..self.len, 0);
        self.len -= start;
        if self.len == self.buf.len() {
            // A filled buffer without any newline cannot make progress,
            // discard it instead of overflowing.
            warn!("could not find newline in entire buffer");
            self.len = 0;
        }
        lines
    }
}

/// The FIFO endpoints of the control channel. `ctl` is written by the
/// caller; `winsz` bridges the ctl reader to the PTY resize action.
pub(crate) struct CtlFifos {
    pub ctl_r: RawFd,
    // Keeps the read end from flapping on EOF when the last writer closes.
    _ctl_dummy_w: RawFd,
    pub winsz_r: RawFd,
    winsz_w: RawFd,
    ctl_buf: LineBuffer,
    winsz_buf: LineBuffer,
}

pub(crate) fn setup_fifos(bundle: &Path) -> Result<CtlFifos> {
    let (ctl_r, ctl_dummy_w) = setup_fifo(&bundle.join("ctl")).context("terminal control fifo")?;
    debug!("terminal_ctrl_fd: {}", ctl_r);
    let (winsz_r, winsz_w) =
        setup_fifo(&bundle.join("winsz")).context("window resize control fifo")?;
    debug!("winsz read side: {}, winsz write side: {}", winsz_r, winsz_w);

    Ok(CtlFifos {
        ctl_r,
        _ctl_dummy_w: ctl_dummy_w,
        winsz_r,
        winsz_w,
        ctl_buf: LineBuffer::new(),
        winsz_buf: LineBuffer::new(),
    })
}

fn setup_fifo(path: &Path) -> Result<(RawFd, RawFd)> {
    if let Err(e) = mkfifo(path, Mode::from_bits_truncate(0o660)) {
        if e == nix::errno::Errno::EEXIST {
            std::fs::remove_file(path).ok();
            mkfifo(path, Mode::from_bits_truncate(0o660))
                .with_context(|| format!("mkfifo at {}", path.display()))?;
        } else {
            return Err(e).with_context(|| format!("mkfifo at {}", path.display()));
        }
    }

    let fifo_r = open(
        path,
        OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .context("open fifo read half")?;
    let fifo_w = open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())
        .context("open fifo write half")?;

    Ok((fifo_r, fifo_w))
}

impl CtlFifos {
    /// Handle readiness on the ctl FIFO: window resizes are relayed to the
    /// winsz pipe, reopen requests go straight to the log sinks.
    pub fn handle_ctl_event(&mut self, sinks: &mut LogSinks) {
        for line in self.ctl_buf.read_from(self.ctl_r) {
            let mut fields = line.split_whitespace();
            let parsed = (
                fields.next().and_then(|v| v.parse::<i32>().ok()),
                fields.next().and_then(|v| v.parse::<i32>().ok()),
                fields.next().and_then(|v| v.parse::<i32>().ok()),
            );
            let (msg_type, height, width) = match parsed {
                (Some(t), Some(h), Some(w)) => (t, h, w),
                _ => {
                    warn!("failed to parse control message: {}", line);
                    continue;
                }
            };
            debug!("message type: {}", msg_type);
            match msg_type {
                WIN_RESIZE_EVENT => {
                    let hw = format!("{} {}\n", height, width);
                    if write_all(self.winsz_w, hw.as_bytes()).is_err() {
                        warn!("failed to write to window resizing fd, a resize event may have been dropped");
                    }
                }
                REOPEN_LOGS_EVENT => sinks.reopen(),
                unknown => warn!("unknown message type: {}", unknown),
            }
        }
    }

    /// Handle readiness on the winsz FIFO by resizing the PTY.
    pub fn handle_winsz_event(&mut self, pty_fd: Option<RawFd>) {
        for line in self.winsz_buf.read_from(self.winsz_r) {
            let mut fields = line.split_whitespace();
            let parsed = (
                fields.next().and_then(|v| v.parse::<u16>().ok()),
                fields.next().and_then(|v| v.parse::<u16>().ok()),
            );
            let (height, width) = match parsed {
                (Some(h), Some(w)) => (h, w),
                _ => {
                    warn!("failed to parse resize message: {}", line);
                    continue;
                }
            };
            debug!("height: {}, width: {}", height, width);
            if let Some(fd) = pty_fd {
                resize_winsz(fd, height, width);
            }
        }
    }
}

impl Drop for CtlFifos {
    fn drop(&mut self) {
        close(self.ctl_r).ok();
        close(self._ctl_dummy_w).ok();
        close(self.winsz_r).ok();
        close(self.winsz_w).ok();
    }
}

fn resize_winsz(fd: RawFd, height: u16, width: u16) {
    let ws = Winsize {
        ws_row: height,
        ws_col: width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if unsafe { tiocswinsz(fd, &ws) }.is_err() {
        warn!("failed to set process pty terminal size");
    }
}

/// Accept the runtime's single connection on the console socket and receive
/// the PTY master over it. The terminal is switched to `ONLCR` to match the
/// expected line discipline.
pub(crate) fn accept_console(listener_fd: RawFd, csname: &Path) -> Result<RawFd> {
    debug!("about to accept from console socket fd: {}", listener_fd);
    let connfd = accept4(listener_fd, SockFlag::SOCK_CLOEXEC)
        .context("accept console socket connection")?;

    // Not accepting anything else.
    if std::fs::remove_file(csname).is_err() {
        warn!("failed to unlink {}", csname.display());
    }

    let console = recvfd(connfd);
    close(connfd).ok();
    let console = console?;
    debug!("console = {{ .name = '{}'; .fd = {} }}", console.name, console.fd);

    match tcgetattr(console.fd) {
        Ok(mut termios) => {
            termios.output_flags |= OutputFlags::ONLCR;
            if tcsetattr(console.fd, SetArg::TCSANOW, &termios).is_err() {
                warn!("failed to set console terminal settings");
            }
        }
        Err(_) => warn!("failed to get console terminal settings"),
    }

    Ok(console.fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe2, write};

    #[test]
    fn line_buffer_collects_complete_lines() -> Result<()> {
        let (r, w) = pipe2(OFlag::O_NONBLOCK)?;
        let mut buf = LineBuffer::new();

        write(w, b"1 24 80\n2 0 ")?;
        assert_eq!(buf.read_from(r), vec!["1 24 80".to_string()]);

        // The partial tail is retained until its newline arrives.
        write(w, b"0\n")?;
        assert_eq!(buf.read_from(r), vec!["2 0 0".to_string()]);

        close(r).ok();
        close(w).ok();
        Ok(())
    }

    #[test]
    fn line_buffer_discards_overflow() -> Result<()> {
        let (r, w) = pipe2(OFlag::O_NONBLOCK)?;
        let mut buf = LineBuffer::new();

        write(w, &[b'x'; CTL_BUF_SIZE])?;
        assert!(buf.read_from(r).is_empty());
        assert_eq!(buf.len, 0);

        // Later messages still parse.
        write(w, b"1 2 3\n")?;
        assert_eq!(buf.read_from(r), vec!["1 2 3".to_string()]);

        close(r).ok();
        close(w).ok();
        Ok(())
    }

    #[test]
    fn fifos_are_created_and_readable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut fifos = setup_fifos(dir.path())?;
        assert!(dir.path().join("ctl").exists());
        assert!(dir.path().join("winsz").exists());

        // A resize message on ctl ends up on the winsz pipe.
        let caller_w = open(
            &dir.path().join("ctl"),
            OFlag::O_WRONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        write(caller_w, b"1 24 80\n")?;
        let mut sinks = crate::container_logging::LogSinks::empty();
        fifos.handle_ctl_event(&mut sinks);
        assert_eq!(
            fifos.winsz_buf.read_from(fifos.winsz_r),
            vec!["24 80".to_string()]
        );
        close(caller_w).ok();
        Ok(())
    }
}
