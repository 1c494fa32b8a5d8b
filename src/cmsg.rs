//! Reception of the PTY master fd the runtime sends over the console
//! socket, using `SCM_RIGHTS` ancillary data alongside a short name string.

use anyhow::{bail, Context, Result};
use nix::{
    cmsg_space,
    sys::socket::{recvmsg, ControlMessageOwned, MsgFlags},
};
use std::io::IoSliceMut;
use std::os::unix::io::RawFd;

const TAG_BUFFER: usize = 4096;

/// A received file descriptor and the name it was sent with.
pub(crate) struct ReceivedFile {
    pub name: String,
    pub fd: RawFd,
}

/// Receive one fd from the connected socket. The non-ancillary name bytes
/// must be consumed as well, otherwise the message is not delivered.
pub(crate) fn recvfd(sockfd: RawFd) -> Result<ReceivedFile> {
    let mut name_buf = [0u8; TAG_BUFFER];
    let mut cmsg_buffer = cmsg_space!([RawFd; 1]);

    let mut fd = None;
    {
        let mut iov = [IoSliceMut::new(&mut name_buf)];
        let msg = recvmsg::<()>(sockfd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
            .context("recvmsg on console socket")?;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                fd = fds.first().copied();
            }
        }
    }

    let fd = match fd {
        Some(fd) if fd >= 0 => fd,
        _ => bail!("no file descriptor received on console socket"),
    };

    let name_len = name_buf.iter().position(|&b| b == 0).unwrap_or(0);
    let name = String::from_utf8_lossy(&name_buf[..name_len]).into_owned();

    Ok(ReceivedFile { name, fd })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{
        sendmsg, socketpair, AddressFamily, ControlMessage, SockFlag, SockType,
    };
    use nix::unistd::close;
    use std::{fs::File, io::IoSlice, os::unix::io::AsRawFd};

    #[test]
    fn roundtrip_fd() -> Result<()> {
        let (tx, rx) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        let file = tempfile::tempfile()?;
        let fds = [file.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(b"terminal\0")];
        sendmsg::<()>(tx, &iov, &cmsg, MsgFlags::empty(), None)?;

        let received = recvfd(rx)?;
        assert_eq!(received.name, "terminal");
        assert!(received.fd >= 0);
        assert_ne!(received.fd, file.as_raw_fd());

        // The received fd refers to the same file.
        let received_file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(received.fd) };
        drop(received_file);
        close(tx).ok();
        close(rx).ok();
        Ok(())
    }
}
