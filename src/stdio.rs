//! The stdio fabric: non-blocking reads from the container's stdout/stderr
//! (or the PTY master) and replication into log sinks and console clients.

use crate::{attach::AttachPlane, container_logging::LogSinks, log_rate::LogRate, utils};
use log::warn;
use nix::{errno::Errno, unistd};
use std::os::unix::io::RawFd;

/// Size of one stdio read. Matches the usual pipe buffer granularity.
pub(crate) const STDIO_BUF_SIZE: usize = 8192;

/// One of the container's standard streams. The discriminants double as the
/// one-byte stream identifier prepended to console client frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum StreamKind {
    Stdin = 1,
    Stdout = 2,
    Stderr = 3,
}

impl StreamKind {
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Outcome of a single read from a main fd.
pub(crate) enum ReadOutcome {
    /// `n` payload bytes are available in the fabric buffer.
    Data(usize),
    Eof,
    Again,
}

/// Monitor-side ends of the container stdio, plus the shared read buffer.
///
/// The buffer reserves one byte at index 0 for the stream identifier used
/// when forwarding to console clients and one trailing byte for a NUL.
pub(crate) struct StdioFabric {
    pub mainfd_stdin: Option<RawFd>,
    pub mainfd_stdout: Option<RawFd>,
    pub mainfd_stderr: Option<RawFd>,
    pub terminal: bool,
    pub hup_poll_armed: bool,
    buf: Box<[u8; STDIO_BUF_SIZE + 2]>,
}

impl StdioFabric {
    pub fn new(
        mainfd_stdin: Option<RawFd>,
        mainfd_stdout: Option<RawFd>,
        mainfd_stderr: Option<RawFd>,
        terminal: bool,
    ) -> Self {
        Self {
            mainfd_stdin,
            mainfd_stdout,
            mainfd_stderr,
            terminal,
            hup_poll_armed: false,
            buf: Box::new([0u8; STDIO_BUF_SIZE + 2]),
        }
    }

    pub fn main_fd(&self, kind: StreamKind) -> Option<RawFd> {
        match kind {
            StreamKind::Stdin => self.mainfd_stdin,
            StreamKind::Stdout => self.mainfd_stdout,
            StreamKind::Stderr => self.mainfd_stderr,
        }
    }

    pub fn clear_main_fd(&mut self, kind: StreamKind) {
        match kind {
            StreamKind::Stdin => self.mainfd_stdin = None,
            StreamKind::Stdout => self.mainfd_stdout = None,
            StreamKind::Stderr => self.mainfd_stderr = None,
        }
    }

    /// Both output mains have reached EOF.
    pub fn outputs_closed(&self) -> bool {
        self.mainfd_stdout.is_none() && self.mainfd_stderr.is_none()
    }

    /// Read once from the main fd of `kind` into the fabric buffer.
    pub fn read_once(&mut self, kind: StreamKind) -> ReadOutcome {
        let fd = match self.main_fd(kind) {
            Some(fd) => fd,
            None => return ReadOutcome::Eof,
        };
        match unistd::read(fd, &mut self.buf[1..=STDIO_BUF_SIZE]) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => {
                self.buf[0] = kind as u8;
                // Terminate the buffer, journald messages rely on it being
                // printable as-is.
                self.buf[1 + n] = 0;
                ReadOutcome::Data(n)
            }
            Err(Errno::EAGAIN) => ReadOutcome::Again,
            Err(Errno::EINTR) => ReadOutcome::Again,
            // A PTY master raises EIO when the last slave side is closed.
            Err(Errno::EIO) => ReadOutcome::Eof,
            Err(e) => {
                warn!("stdio read on {} failed: {}", kind.name(), e);
                ReadOutcome::Again
            }
        }
    }

    /// The payload of the last read.
    pub fn payload(&self, n: usize) -> &[u8] {
        &self.buf[1..1 + n]
    }

    /// The payload prefixed with its one-byte stream identifier.
    pub fn frame(&self, n: usize) -> &[u8] {
        &self.buf[..1 + n]
    }

    /// Replicate the last read to the log sinks (through the rate gate) and
    /// to all attached console clients, in that order.
    pub fn fan_out(
        &self,
        kind: StreamKind,
        n: usize,
        rate: &mut LogRate,
        sinks: &mut LogSinks,
        attach: Option<&mut AttachPlane>,
    ) {
        rate.write(sinks, kind, self.payload(n));
        if let Some(attach) = attach {
            attach.broadcast_or_backlog(self.frame(n));
        }
    }

    /// Read both output mains to EOF to capture tail output, then flush the
    /// journal partial-line buffers with a zero-length write.
    pub fn drain(
        &mut self,
        rate: &mut LogRate,
        sinks: &mut LogSinks,
        mut attach: Option<&mut AttachPlane>,
    ) {
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            if let Some(fd) = self.main_fd(kind) {
                utils::set_fd_nonblocking(fd).ok();
                while let ReadOutcome::Data(n) = self.read_once(kind) {
                    rate.write(sinks, kind, self.payload(n));
                    if let Some(attach) = attach.as_deref_mut() {
                        attach.broadcast_or_backlog(self.frame(n));
                    }
                }
            }
            sinks.write(kind, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use nix::{fcntl::OFlag, unistd};

    #[test]
    fn read_once_frames_payload() -> Result<()> {
        let (r, w) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        let mut fabric = StdioFabric::new(None, Some(r), None, false);
        unistd::write(w, b"hi")?;
        match fabric.read_once(StreamKind::Stdout) {
            ReadOutcome::Data(n) => {
                assert_eq!(n, 2);
                assert_eq!(fabric.payload(n), b"hi");
                assert_eq!(fabric.frame(n), b"\x02hi");
            }
            _ => panic!("expected data"),
        }
        unistd::close(w)?;
        match fabric.read_once(StreamKind::Stdout) {
            ReadOutcome::Eof => {}
            _ => panic!("expected EOF"),
        }
        unistd::close(r).ok();
        Ok(())
    }
}
