//! Remote console plane: the attach socket with its connected clients, the
//! console socket the runtime sends the PTY master over, and the sd-notify
//! relay.

use crate::{
    events::{EpollFlags, EventLoop, Token},
    utils::write_all,
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::{
    errno::Errno,
    sys::{
        socket::{
            accept4, bind, listen, recvfrom, sendto, shutdown, socket, AddressFamily, MsgFlags,
            Shutdown, SockAddr, SockFlag, SockType,
        },
        stat::{fchmod, Mode},
    },
    unistd::{close, read, write},
};
use std::{
    collections::VecDeque,
    fs,
    os::unix::{ffi::OsStringExt, fs::PermissionsExt, io::RawFd},
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// Read size for connected console clients.
pub(crate) const CONN_SOCK_BUF_SIZE: usize = 32768;

/// Cap for output frames kept around until the first client attaches.
const BACKLOG_MAX_BYTES: usize = 16384;

/// `sockaddr_un.sun_path` size on Linux.
const SUN_PATH_LEN: usize = 108;

/// The listening socket the runtime connects to for handing over the PTY
/// master. Lives in a scratch directory to stay under the sun_path limit.
pub(crate) struct ConsoleListener {
    pub fd: RawFd,
    pub path: PathBuf,
    _dir: TempDir,
}

pub(crate) fn setup_console_socket() -> Result<ConsoleListener> {
    let dir = tempfile::Builder::new()
        .prefix("ctrmon-term")
        .tempdir()
        .context("create console socket directory")?;
    let path = dir.path().join("term.sock");

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("create console socket")?;
    fchmod(fd, Mode::from_bits_truncate(0o700)).context("change console socket permissions")?;
    bind(fd, &SockAddr::new_unix(&path)?).context("bind console socket")?;
    listen(fd, 128).context("listen on console socket")?;

    info!("console socket path: {}", path.display());
    Ok(ConsoleListener {
        fd,
        path,
        _dir: dir,
    })
}

/// What a connected client is allowed to do. Attach clients currently
/// always get both directions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ClientRole {
    Reader,
    Writer,
    Both,
}

impl ClientRole {
    fn reads(self) -> bool {
        self != ClientRole::Writer
    }

    fn writes(self) -> bool {
        self != ClientRole::Reader
    }
}

/// One connected attach client. Readers feed container stdin, writers
/// receive the multiplexed stdio frames.
struct ConsoleClient {
    fd: RawFd,
    role: ClientRole,
    readable: bool,
    writable: bool,
    buf: Box<[u8; CONN_SOCK_BUF_SIZE]>,
    off: usize,
    remaining: usize,
    data_ready: bool,
}

impl ConsoleClient {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            role: ClientRole::Both,
            readable: true,
            writable: true,
            buf: Box::new([0; CONN_SOCK_BUF_SIZE]),
            off: 0,
            remaining: 0,
            data_ready: false,
        }
    }
}

/// Supervisor directive resulting from a client event.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ClientDirective {
    None,
    /// The peer closed: container stdin should be closed unless configured
    /// to stay open.
    PeerClosed,
    /// Input did not fit into container stdin, arm write readiness.
    ArmStdinWrite,
}

/// The attach listener and everything hanging off it. Clients are owned by
/// the plane and die with it.
pub(crate) struct AttachPlane {
    pub listener_fd: RawFd,
    symlink_path: Option<PathBuf>,
    clients: Vec<ConsoleClient>,
    backlog: VecDeque<Vec<u8>>,
    backlog_bytes: usize,
    had_client: bool,
}

/// Bind the attach socket. Unless `full_attach` is requested, a
/// `<socket_dir>/<cuuid>` symlink to the bundle keeps the final socket path
/// under the `sun_path` limit.
pub(crate) fn setup_attach_socket(
    socket_dir: &Path,
    cuuid: &str,
    bundle: &Path,
    full_attach: bool,
) -> Result<AttachPlane> {
    let (sock_path, symlink_path) = if full_attach {
        (bundle.join("attach"), None)
    } else {
        let mut link = socket_dir.join(cuuid).into_os_string().into_vec();
        // A symlink path as long as the socket path would prevent the
        // socket from being created, shorten it by one byte.
        if link.len() == SUN_PATH_LEN - 1 {
            link.truncate(SUN_PATH_LEN - 2);
        }
        let link = PathBuf::from(std::ffi::OsString::from_vec(link));

        if let Err(e) = fs::remove_file(&link) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e).context("remove existing symlink for attach socket directory");
            }
        }
        std::os::unix::fs::symlink(bundle, &link)
            .context("create symlink for attach socket")?;

        (link.join("attach"), Some(link))
    };

    info!("attach sock path: {}", sock_path.display());

    // Non-blocking so a client aborting before accept cannot stall us.
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("create attach socket")?;
    fchmod(fd, Mode::from_bits_truncate(0o700)).context("change attach socket permissions")?;

    if let Err(e) = fs::remove_file(&sock_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e).context("remove existing attach socket");
        }
    }
    bind(fd, &SockAddr::new_unix(&sock_path)?)
        .with_context(|| format!("bind attach socket {}", sock_path.display()))?;
    listen(fd, 10).context("listen on attach socket")?;

    Ok(AttachPlane {
        listener_fd: fd,
        symlink_path,
        clients: vec![],
        backlog: VecDeque::new(),
        backlog_bytes: 0,
        had_client: false,
    })
}

impl AttachPlane {
    /// Accept one pending client connection.
    pub fn accept(&mut self, events: &EventLoop) {
        let fd = match accept4(self.listener_fd, SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => fd,
            Err(Errno::EAGAIN) => return,
            Err(e) => {
                warn!("failed to accept client connection on attach socket: {}", e);
                return;
            }
        };
        info!("accepted connection {}", fd);

        if let Err(e) = events.add(fd, Token::Client(fd), EpollFlags::EPOLLIN) {
            warn!("failed to watch attach client: {:#}", e);
            close(fd).ok();
            return;
        }

        let first = !self.had_client;
        self.had_client = true;
        self.clients.push(ConsoleClient::new(fd));

        if first && !self.backlog.is_empty() {
            // Replay output produced before anyone was attached.
            for frame in self.backlog.drain(..) {
                if write_all(fd, &frame).is_err() {
                    break;
                }
            }
            self.backlog_bytes = 0;
        }
    }

    /// Handle readiness on a connected client.
    pub fn handle_client_event(
        &mut self,
        fd: RawFd,
        flags: EpollFlags,
        stdin_fd: Option<RawFd>,
        events: &EventLoop,
    ) -> ClientDirective {
        let idx = match self.clients.iter().position(|c| c.fd == fd) {
            Some(idx) => idx,
            None => {
                events.delete(fd);
                return ClientDirective::None;
            }
        };
        if flags.contains(EpollFlags::EPOLLIN) {
            self.read_client(idx, stdin_fd, events)
        } else {
            self.terminate_client(idx, events)
        }
    }

    fn read_client(
        &mut self,
        idx: usize,
        stdin_fd: Option<RawFd>,
        events: &EventLoop,
    ) -> ClientDirective {
        let client = &mut self.clients[idx];

        // There is still data in the buffer, stop reading until it drained.
        if client.remaining > 0 {
            client.data_ready = true;
            events.delete(client.fd);
            return ClientDirective::None;
        }

        let num_read = match read(client.fd, &mut client.buf[..]) {
            Ok(n) => n,
            Err(_) => return ClientDirective::None,
        };
        if num_read == 0 {
            return self.terminate_client(idx, events);
        }

        let client = &mut self.clients[idx];
        if !client.role.reads() {
            return ClientDirective::None;
        }
        client.off = 0;
        client.remaining = num_read;

        try_write_stdin(client, stdin_fd);

        // Not everything went into stdin, wait for the fd to become ready.
        if client.remaining > 0 {
            return ClientDirective::ArmStdinWrite;
        }
        ClientDirective::None
    }

    fn terminate_client(&mut self, idx: usize, events: &EventLoop) -> ClientDirective {
        let client = &mut self.clients[idx];
        events.delete(client.fd);
        shutdown(client.fd, Shutdown::Read).ok();
        client.readable = false;
        if !client.writable {
            close(client.fd).ok();
            self.clients.remove(idx);
        }
        ClientDirective::PeerClosed
    }

    /// Write-readiness on container stdin: give every client with pending
    /// input a chance to drain. Returns true while data remains queued.
    pub fn flush_pending_stdin(&mut self, stdin_fd: Option<RawFd>, events: &EventLoop) -> bool {
        let mut has_data = false;
        for client in &mut self.clients {
            try_write_stdin(client, stdin_fd);
            if client.remaining > 0 {
                has_data = true;
            } else if client.data_ready {
                client.data_ready = false;
                events
                    .add(client.fd, Token::Client(client.fd), EpollFlags::EPOLLIN)
                    .ok();
            }
        }
        has_data
    }

    /// Any client input still waiting for container stdin?
    pub fn has_pending_stdin(&self) -> bool {
        self.clients.iter().any(|c| c.remaining > 0)
    }

    /// Forward one stream-id framed buffer to every writable client, or
    /// keep it in the bounded backlog while nobody ever attached.
    pub fn broadcast_or_backlog(&mut self, frame: &[u8]) {
        if self.clients.iter().any(|c| c.writable && c.role.writes()) {
            self.broadcast(frame);
        } else if !self.had_client {
            self.push_backlog(frame);
        }
    }

    fn push_backlog(&mut self, frame: &[u8]) {
        self.backlog_bytes += frame.len();
        self.backlog.push_back(frame.to_vec());
        while self.backlog_bytes > BACKLOG_MAX_BYTES {
            match self.backlog.pop_front() {
                Some(dropped) => self.backlog_bytes -= dropped.len(),
                None => break,
            }
        }
    }

    fn broadcast(&mut self, frame: &[u8]) {
        for idx in (0..self.clients.len()).rev() {
            let client = &mut self.clients[idx];
            if !client.writable || !client.role.writes() {
                continue;
            }
            if write_all(client.fd, frame).is_err() {
                debug!("removing failing console writer {}", client.fd);
                shutdown(client.fd, Shutdown::Write).ok();
                client.writable = false;
                if !client.readable {
                    close(client.fd).ok();
                    self.clients.remove(idx);
                }
            }
        }
    }

    /// Remove the cuuid symlink that kept the socket path short.
    pub fn unlink_symlink(&self) {
        if let Some(path) = &self.symlink_path {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove attach socket symlink: {}", e);
                }
            }
        }
    }
}

impl Drop for AttachPlane {
    fn drop(&mut self) {
        for client in &self.clients {
            close(client.fd).ok();
        }
        close(self.listener_fd).ok();
    }
}

fn try_write_stdin(client: &mut ConsoleClient, stdin_fd: Option<RawFd>) {
    let fd = match stdin_fd {
        Some(fd) if client.remaining > 0 => fd,
        _ => return,
    };
    match write(fd, &client.buf[client.off..client.off + client.remaining]) {
        Ok(w) => {
            client.off += w;
            client.remaining -= w;
        }
        Err(Errno::EAGAIN) => {}
        Err(e) => warn!("failed to write to container stdin: {}", e),
    }
}

/// Relay for sd-notify traffic: datagrams from the container's notify
/// socket are filtered down to readiness and watchdog messages and
/// forwarded to the host's notify socket.
pub(crate) struct NotifyRelay {
    pub fd: RawFd,
    send_fd: RawFd,
    host_addr: SockAddr,
}

pub(crate) fn setup_notify_relay(bundle: &Path, host_socket: &Path) -> Result<NotifyRelay> {
    let dir = bundle.join("notify");
    fs::create_dir_all(&dir).context("create notify socket directory")?;
    let path = dir.join("notify.sock");
    fs::remove_file(&path).ok();

    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("create notify socket")?;
    bind(fd, &SockAddr::new_unix(&path)?).context("bind notify socket")?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o777))
        .context("change notify socket permissions")?;

    let send_fd = match socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    ) {
        Ok(send_fd) => send_fd,
        Err(e) => {
            close(fd).ok();
            return Err(e).context("create notify forward socket");
        }
    };

    Ok(NotifyRelay {
        fd,
        send_fd,
        host_addr: SockAddr::new_unix(host_socket)?,
    })
}

impl NotifyRelay {
    /// Drain pending datagrams, forwarding the filtered ones.
    pub fn handle_event(&self) {
        let mut buf = [0u8; 8192];
        loop {
            let n = match recvfrom::<nix::sys::socket::SockAddr>(self.fd, &mut buf) {
                Ok((n, _)) => n,
                Err(Errno::EAGAIN) => return,
                Err(e) => {
                    warn!("failed to read from notify socket: {}", e);
                    return;
                }
            };
            if let Some(payload) = filter_notify_payload(&buf[..n]) {
                if let Err(e) = sendto(
                    self.send_fd,
                    payload,
                    &self.host_addr,
                    MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
                ) {
                    warn!("failed to forward notify message: {}", e);
                }
            }
        }
    }
}

impl Drop for NotifyRelay {
    fn drop(&mut self) {
        close(self.fd).ok();
        close(self.send_fd).ok();
    }
}

/// Reduce an sd-notify datagram to the message the host may see.
pub(crate) fn filter_notify_payload(payload: &[u8]) -> Option<&'static [u8]> {
    if contains(payload, b"READY=1") {
        Some(b"READY=1")
    } else if contains(payload, b"WATCHDOG=1") {
        Some(b"WATCHDOG=1")
    } else {
        None
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::socketpair;

    fn test_plane() -> AttachPlane {
        AttachPlane {
            listener_fd: -1,
            symlink_path: None,
            clients: vec![],
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            had_client: false,
        }
    }

    fn seqpacket_pair() -> (RawFd, RawFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .expect("create socketpair")
    }

    #[test]
    fn notify_payload_filtering() {
        struct Tc {
            input: &'static [u8],
            expected: Option<&'static [u8]>,
        }
        let test_cases = vec![
            Tc {
                input: b"READY=1",
                expected: Some(b"READY=1"),
            },
            Tc {
                input: b"STATUS=starting\nREADY=1\n",
                expected: Some(b"READY=1"),
            },
            Tc {
                input: b"WATCHDOG=1",
                expected: Some(b"WATCHDOG=1"),
            },
            Tc {
                input: b"STATUS=happy",
                expected: None,
            },
            Tc {
                input: b"",
                expected: None,
            },
        ];
        for tc in test_cases {
            assert_eq!(filter_notify_payload(tc.input), tc.expected);
        }
    }

    #[test]
    fn broadcast_reaches_all_writers() {
        let mut plane = test_plane();
        let (a_local, a_peer) = seqpacket_pair();
        let (b_local, b_peer) = seqpacket_pair();
        plane.clients.push(ConsoleClient::new(a_local));
        plane.clients.push(ConsoleClient::new(b_local));
        plane.had_client = true;

        plane.broadcast_or_backlog(b"\x02X");

        for peer in [a_peer, b_peer] {
            let mut buf = [0u8; 16];
            let n = read(peer, &mut buf).expect("read frame");
            assert_eq!(&buf[..n], b"\x02X");
        }

        for fd in [a_peer, b_peer] {
            close(fd).ok();
        }
    }

    #[test]
    fn failing_writer_is_removed_others_continue() {
        let mut plane = test_plane();
        let (a_local, a_peer) = seqpacket_pair();
        let (b_local, b_peer) = seqpacket_pair();
        plane.clients.push(ConsoleClient::new(a_local));
        plane.clients.push(ConsoleClient::new(b_local));
        plane.had_client = true;

        // Kill one peer entirely; writes to it will fail with EPIPE.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        shutdown(a_local, Shutdown::Both).ok();
        close(a_peer).ok();
        // Read side is marked down so the broadcast failure drops it.
        plane.clients[0].readable = false;

        plane.broadcast_or_backlog(b"\x02X");
        assert_eq!(plane.clients.len(), 1);

        let mut buf = [0u8; 16];
        let n = read(b_peer, &mut buf).expect("read frame");
        assert_eq!(&buf[..n], b"\x02X");
        close(b_peer).ok();
    }

    #[test]
    fn backlog_is_replayed_and_bounded() {
        let mut plane = test_plane();
        plane.broadcast_or_backlog(b"\x02early");
        assert_eq!(plane.backlog.len(), 1);

        // The backlog cannot grow without bound.
        for _ in 0..20 {
            plane.broadcast_or_backlog(&[0x02; 1024]);
        }
        assert!(plane.backlog_bytes <= BACKLOG_MAX_BYTES + 1024);

        // After the first client was seen, nothing is buffered anymore.
        plane.had_client = true;
        plane.clients.clear();
        let before = plane.backlog.len();
        plane.broadcast_or_backlog(b"\x02late");
        assert_eq!(plane.backlog.len(), before);
    }

    #[test]
    fn pending_stdin_is_flushed() {
        let mut plane = test_plane();
        let (local, peer) = seqpacket_pair();
        let mut client = ConsoleClient::new(local);
        client.buf[..5].copy_from_slice(b"hello");
        client.remaining = 5;
        plane.clients.push(client);
        plane.had_client = true;
        assert!(plane.has_pending_stdin());

        let (stdin_r, stdin_w) = nix::unistd::pipe().expect("create pipe");
        let events = EventLoop::new().expect("create event loop");
        let has_data = plane.flush_pending_stdin(Some(stdin_w), &events);
        assert!(!has_data);

        let mut buf = [0u8; 16];
        let n = read(stdin_r, &mut buf).expect("read stdin");
        assert_eq!(&buf[..n], b"hello");

        for fd in [peer, stdin_r, stdin_w] {
            close(fd).ok();
        }
    }
}
