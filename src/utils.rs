//! Small fd helpers shared across the monitor.

use anyhow::{bail, Result};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    unistd::write,
};
use std::os::unix::io::RawFd;

/// Write the whole buffer to `fd`, retrying on `EINTR`.
pub(crate) fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => bail!("write to fd {}: {}", fd, e),
        }
    }
    Ok(())
}

/// Switch an fd into non-blocking mode.
pub(crate) fn set_fd_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, read};

    #[test]
    fn write_all_roundtrip() -> Result<()> {
        let (r, w) = pipe()?;
        write_all(w, b"hello")?;
        let mut buf = [0u8; 16];
        let n = read(r, &mut buf)?;
        assert_eq!(&buf[..n], b"hello");
        Ok(())
    }
}
