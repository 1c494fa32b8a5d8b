//! A small epoll based event loop: per-fd readiness with typed tokens,
//! one-shot timers and a quit flag the callbacks can raise.

use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollOp},
    unistd::{close, read},
};
use std::os::unix::io::RawFd;

pub(crate) use nix::sys::epoll::EpollFlags;

/// What a readiness event belongs to. Encoded into the epoll user data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Token {
    Signal,
    Stdout,
    Stderr,
    CtlFifo,
    WinszFifo,
    ConsoleSock,
    AttachSock,
    NotifySock,
    /// A connected console client, keyed by its fd.
    Client(RawFd),
    /// The container stdin became writable again.
    StdinWritable,
    Oom,
    TimeoutTimer,
    HupTimer,
}

impl Token {
    fn encode(self) -> u64 {
        let (kind, fd) = match self {
            Token::Signal => (0u64, 0),
            Token::Stdout => (1, 0),
            Token::Stderr => (2, 0),
            Token::CtlFifo => (3, 0),
            Token::WinszFifo => (4, 0),
            Token::ConsoleSock => (5, 0),
            Token::AttachSock => (6, 0),
            Token::NotifySock => (7, 0),
            Token::Client(fd) => (8, fd),
            Token::StdinWritable => (9, 0),
            Token::Oom => (10, 0),
            Token::TimeoutTimer => (11, 0),
            Token::HupTimer => (12, 0),
        };
        kind << 32 | fd as u32 as u64
    }

    fn decode(data: u64) -> Self {
        let fd = data as u32 as RawFd;
        match data >> 32 {
            0 => Token::Signal,
            1 => Token::Stdout,
            2 => Token::Stderr,
            3 => Token::CtlFifo,
            4 => Token::WinszFifo,
            5 => Token::ConsoleSock,
            6 => Token::AttachSock,
            7 => Token::NotifySock,
            8 => Token::Client(fd),
            9 => Token::StdinWritable,
            10 => Token::Oom,
            11 => Token::TimeoutTimer,
            _ => Token::HupTimer,
        }
    }
}

/// The fd readiness demultiplexer. The only blocking call in the monitor.
pub(crate) struct EventLoop {
    epfd: RawFd,
    /// Raised by dispatch handlers to leave the loop.
    pub quit: bool,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).context("create epoll fd")?;
        Ok(Self { epfd, quit: false })
    }

    /// Watch `fd` for the given conditions.
    pub fn add(&self, fd: RawFd, token: Token, flags: EpollFlags) -> Result<()> {
        let mut event = EpollEvent::new(flags, token.encode());
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event)
            .with_context(|| format!("add fd {} to event loop", fd))
    }

    /// Stop watching `fd`. Removing an already closed or unknown fd is fine.
    pub fn delete(&self, fd: RawFd) {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None).ok();
    }

    /// Block until at least one fd is ready and collect the events.
    pub fn wait(&self, out: &mut Vec<(Token, EpollFlags)>) -> Result<()> {
        let mut events = [EpollEvent::empty(); 64];
        let n = loop {
            match epoll_wait(self.epfd, &mut events, -1) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("wait for events"),
            }
        };
        out.clear();
        for event in &events[..n] {
            out.push((Token::decode(event.data()), event.events()));
        }
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        close(self.epfd).ok();
    }
}

/// A one-shot timer backed by a timerfd.
pub(crate) struct OneShotTimer {
    fd: RawFd,
}

impl OneShotTimer {
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Errno::last()).context("create timerfd");
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Arm the timer to fire once after the given duration.
    pub fn arm(&self, duration: std::time::Duration) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: duration.as_secs() as libc::time_t,
                tv_nsec: duration.subsec_nanos() as libc::c_long,
            },
        };
        if unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) } != 0 {
            return Err(Errno::last()).context("arm timer");
        }
        Ok(())
    }

    /// Consume the expiration so the fd stops polling ready.
    pub fn consume(&self) {
        let mut buf = [0u8; 8];
        read(self.fd, &mut buf).ok();
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        close(self.fd).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{fcntl::OFlag, unistd};

    #[test]
    fn token_roundtrip() {
        let tokens = vec![
            Token::Signal,
            Token::Stdout,
            Token::Stderr,
            Token::CtlFifo,
            Token::WinszFifo,
            Token::ConsoleSock,
            Token::AttachSock,
            Token::NotifySock,
            Token::Client(42),
            Token::StdinWritable,
            Token::Oom,
            Token::TimeoutTimer,
            Token::HupTimer,
        ];
        for token in tokens {
            assert_eq!(Token::decode(token.encode()), token);
        }
    }

    #[test]
    fn readiness_and_timer() -> Result<()> {
        let events = EventLoop::new()?;
        let (r, w) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        events.add(r, Token::Stdout, EpollFlags::EPOLLIN)?;

        let timer = OneShotTimer::new()?;
        timer.arm(std::time::Duration::from_millis(1))?;
        events.add(timer.fd(), Token::HupTimer, EpollFlags::EPOLLIN)?;

        unistd::write(w, b"x")?;

        let mut seen = vec![];
        let mut out = vec![];
        while seen.len() < 2 {
            events.wait(&mut out)?;
            for (token, _) in out.drain(..) {
                if !seen.contains(&token) {
                    seen.push(token);
                }
                if token == Token::Stdout {
                    let mut buf = [0u8; 1];
                    unistd::read(r, &mut buf)?;
                }
                if token == Token::HupTimer {
                    timer.consume();
                }
            }
        }
        assert!(seen.contains(&Token::Stdout));
        assert!(seen.contains(&Token::HupTimer));

        unistd::close(r).ok();
        unistd::close(w).ok();
        Ok(())
    }
}
