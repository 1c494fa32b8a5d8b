//! This is the main library interface for this project

mod attach;
mod close_fds;
mod cmsg;
mod config;
mod container_logging;
mod ctrl;
mod events;
mod exit;
mod journald;
mod log_rate;
mod oom;
mod runtime_args;
mod stdio;
mod sync_pipe;
mod utils;

pub use crate::{config::Config, container_logging::RotationPolicy, log_rate::Policy};

use crate::{
    attach::{setup_attach_socket, setup_console_socket, setup_notify_relay, AttachPlane, ClientDirective, ConsoleListener, NotifyRelay},
    container_logging::LogSinks,
    ctrl::CtlFifos,
    events::{EpollFlags, EventLoop, OneShotTimer, Token},
    exit::WaitResult,
    log_rate::LogRate,
    oom::OomState,
    stdio::{ReadOutcome, StdioFabric, StreamKind},
    sync_pipe::{pipe_from_env, SyncPipe},
};
use anyhow::{bail, Context, Result};
use derive_builder::Builder;
use getset::{Getters, MutGetters};
use log::{debug, error, info, warn, LevelFilter};
use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    sys::{
        signal::{signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal},
        signalfd::{SfdFlags, SignalFd},
        stat::{fchmod, Mode},
    },
    unistd::{close, dup, dup2, fork, getpgid, getpid, getppid, pipe2, read, setsid, ForkResult, Pid},
};
use std::{
    collections::HashMap,
    env,
    ffi::CString,
    fs,
    io::Write,
    os::unix::io::{AsRawFd, RawFd},
    time::Duration,
};

const START_PIPE_ENV_KEY: &str = "_OCI_STARTPIPE";
const SYNC_PIPE_ENV_KEY: &str = "_OCI_SYNCPIPE";
const ATTACH_PIPE_ENV_KEY: &str = "_OCI_ATTACHPIPE";

const BUF_SIZE: usize = 8192;
const TIMED_OUT_MESSAGE: &str = "command timed out";

/// The OOM score making the monitor very hard to kill.
const OOM_SCORE: &str = "-1000";

#[derive(Builder, Debug, Default, Getters, MutGetters)]
#[builder(default, pattern = "owned", setter(into))]
/// Monitor is the main structure to run the OCI container monitor.
pub struct Monitor {
    #[doc = "The main monitor configuration."]
    #[getset(get, get_mut)]
    config: Config,
}

/// Exit related facts about the supervised container, mutated only by the
/// supervisor's event callbacks.
struct ContainerState {
    runtime_status: i32,
    container_status: i32,
    container_pid: i32,
    create_pid: i32,
    timed_out: bool,
}

/// Which callback a reaped child pid maps to.
#[derive(Clone, Copy, Debug)]
enum PidRole {
    Runtime,
    Container,
}

impl Monitor {
    /// Call `run` to start a new monitor instance. Returns the exit code to
    /// report to the immediate parent.
    pub fn run(&mut self) -> Result<i32> {
        // Everything open right now was injected by the caller.
        close_fds::snapshot_open_fds();

        if self.config().version() {
            println!(
                "version {}\ncommit {}",
                env!("CARGO_PKG_VERSION"),
                env!("CTRMON_GIT_COMMIT")
            );
            return Ok(0);
        }

        self.init_logging().context("init logging")?;
        debug!("Set log level to {}", self.config().log_level());

        self.config_mut().validate().context("validate config")?;
        Self::unset_locale();

        let old_oom_score = match Self::adjust_oom_score(OOM_SCORE) {
            Ok(old) => old,
            Err(e) => {
                warn!("Unable to adjust oom score: {}", e);
                None
            }
        };

        Self::set_signal_handler().context("set signal handler")?;

        let start_pipe_fd = pipe_from_env(START_PIPE_ENV_KEY).context("get start pipe")?;
        if let Some(fd) = start_pipe_fd {
            // Block for an initial write to the start pipe before spawning
            // any children or exiting, to ensure the parent can put us in
            // the right cgroup.
            let mut buf = [0u8; BUF_SIZE];
            read(fd, &mut buf).context("read from start pipe")?;

            // If we aren't attaching in an exec session, we don't need this
            // anymore.
            if !self.config().exec_attach() {
                close(fd).context("close start pipe")?;
            }
        }

        let dev_null_r = open("/dev/null", OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .context("open /dev/null for reading")?;
        let dev_null_w = open("/dev/null", OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())
            .context("open /dev/null for writing")?;

        // In the non-sync case, we double-fork in order to disconnect from
        // the parent, as we want to continue in a daemon-like way.
        if !self.config().sync() {
            if let ForkResult::Parent { child } = unsafe { fork()? } {
                if let Some(path) = self.config().conmon_pidfile() {
                    fs::write(path, child.to_string()).context("write monitor pidfile")?;
                }
                unsafe { libc::_exit(0) };
            }
        }

        // Before we fork, ensure our children will be reaped.
        unsafe { libc::atexit(exit::reap_children) };

        let sync_pipe_fd = pipe_from_env(SYNC_PIPE_ENV_KEY).context("get sync pipe")?;
        let sync_pipe = SyncPipe::new(
            sync_pipe_fd,
            self.config().api_version(),
            self.config().exec(),
        );

        let attach_pipe_fd = if self.config().exec_attach() {
            Some(
                pipe_from_env(ATTACH_PIPE_ENV_KEY)
                    .context("get attach pipe")?
                    .context("--exec-attach specified but _OCI_ATTACHPIPE was not")?,
            )
        } else {
            None
        };

        let sinks = LogSinks::configure(self.config()).context("configure log drivers")?;

        let notify = match (self.config().sdnotify_socket(), self.config().bundle()) {
            (Some(socket), Some(bundle)) => Some(
                setup_notify_relay(bundle, socket).context("setup sd-notify relay")?,
            ),
            (Some(_), None) => {
                warn!("sd-notify relay requires a bundle path");
                None
            }
            _ => None,
        };

        if !sinks.passthrough() {
            // Disconnect stdio from parent. We need to do this, because the
            // parent is waiting for the stdout to end when the intermediate
            // child dies.
            dup2(dev_null_r, libc::STDIN_FILENO).context("dup over stdin")?;
            dup2(dev_null_w, libc::STDOUT_FILENO).context("dup over stdout")?;
            dup2(dev_null_w, libc::STDERR_FILENO).context("dup over stderr")?;
        }

        // Create a new session group.
        setsid().context("create new session")?;

        // Set self as subreaper so we can wait for the container process
        // and return its exit code.
        exit::set_subreaper(true)?;

        let mut workerfd_stdin = -1;
        let mut workerfd_stdout = -1;
        let mut mainfd_stdin = None;
        let mut mainfd_stdout = None;
        let mut console: Option<ConsoleListener> = None;

        if self.config().terminal() {
            console = Some(setup_console_socket().context("setup console socket")?);
        } else if !sinks.passthrough() {
            // Create a "fake" main fd so that we can use the same event
            // loop code in both cases. The workerfd_*s will be closed after
            // we dup over everything. We use pipes here because
            // open(/dev/std{out,err}) will fail if we used anything else
            // (and it wouldn't be a good idea to create a new pty pair in
            // the host).
            if self.config().stdin() {
                let (r, w) = pipe2(OFlag::O_CLOEXEC).context("create stdin pipe")?;
                mainfd_stdin = Some(w);
                workerfd_stdin = r;

                if crate::utils::set_fd_nonblocking(w).is_err() {
                    warn!("Failed to set mainfd_stdin to non blocking");
                }
            }

            let (r, w) = pipe2(OFlag::O_CLOEXEC).context("create stdout pipe")?;
            mainfd_stdout = Some(r);
            workerfd_stdout = w;
        }

        // We always create a stderr pipe, because that way we can capture
        // runtime stderr messages before the tty is created.
        let (r, w) = pipe2(OFlag::O_CLOEXEC).context("create stderr pipe")?;
        let mainfd_stderr = Some(r);
        let workerfd_stderr = w;

        let runtime_argv = runtime_args::runtime_args(
            self.config(),
            console.as_ref().map(|c| c.path.as_path()),
        );

        // Setup endpoint for attach.
        let mut attach_plane = None;
        let mut ctl = None;
        if !sinks.passthrough() {
            if let Some(bundle) = self.config().bundle() {
                let cuuid = self
                    .config()
                    .cuuid()
                    .as_ref()
                    .context("attach socket requires a container UUID")?;
                attach_plane = Some(
                    setup_attach_socket(
                        self.config().socket_dir_path(),
                        cuuid,
                        bundle,
                        self.config().full_attach(),
                    )
                    .context("setup attach socket")?,
                );
                ctl = Some(ctrl::setup_fifos(bundle).context("setup control fifos")?);

                if self.config().exec_attach() {
                    if let Some(fd) = attach_pipe_fd {
                        debug!("sending attach message to parent");
                        sync_pipe.write_to(fd, 0, None)?;
                        debug!("sent attach message to parent");
                    }
                }
            }
        }

        // Block termination signals over the fork so the forwarding
        // handlers are in place before anything can be delivered.
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGQUIT);
        mask.add(Signal::SIGINT);
        let mut oldmask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut oldmask))
            .context("block signals")?;

        let create_pid = match unsafe { fork().context("fork the create command")? } {
            ForkResult::Child => Self::run_runtime_child(
                self.config(),
                &oldmask,
                start_pipe_fd,
                dev_null_r,
                dev_null_w,
                workerfd_stdin,
                workerfd_stdout,
                workerfd_stderr,
                sinks.passthrough(),
                old_oom_score,
                &runtime_argv,
            ),
            ForkResult::Parent { child } => child,
        };
        exit::set_create_pid(create_pid.as_raw());

        exit::install_signal_forwarders()?;
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&oldmask), None).context("unblock signals")?;

        // Route SIGCHLD through a signalfd; SIGUSR1 doubles as a manual
        // "re-check the children" nudge.
        let mut chld_mask = SigSet::empty();
        chld_mask.add(Signal::SIGCHLD);
        chld_mask.add(Signal::SIGUSR1);
        chld_mask.thread_block().context("block SIGCHLD")?;
        let signal_fd = SignalFd::with_flags(
            &chld_mask,
            SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
        )
        .context("create signalfd")?;

        // The runtime has the worker ends now, we don't need to touch them
        // anymore.
        for fd in [workerfd_stdin, workerfd_stdout, workerfd_stderr] {
            if fd > -1 {
                close(fd).ok();
            }
        }

        if let Some(exit_command) = self.config().exit_command() {
            exit::register_exit_command(
                exit_command,
                self.config().exit_command_arg(),
                self.config().exit_delay(),
            )?;
        }

        let events = EventLoop::new()?;
        let hup_timer = OneShotTimer::new()?;

        let mut supervisor = Supervisor {
            config: self.config(),
            events,
            state: ContainerState {
                runtime_status: -1,
                container_status: -1,
                container_pid: -1,
                create_pid: create_pid.as_raw(),
                timed_out: false,
            },
            pids: HashMap::from([(create_pid.as_raw(), PidRole::Runtime)]),
            status_cache: HashMap::new(),
            fabric: StdioFabric::new(
                mainfd_stdin,
                mainfd_stdout,
                mainfd_stderr,
                self.config().terminal(),
            ),
            sinks,
            rate: LogRate::new(
                self.config().log_rate_policy(),
                self.config().parsed_log_rate_limit(),
            ),
            attach: attach_plane,
            notify,
            ctl,
            console,
            oom: None,
            sync_pipe,
            signal_fd,
            timeout_timer: None,
            hup_timer,
            stdin_write_armed: false,
            winsz_registered: false,
            dev_null_r,
            dev_null_w,
            attach_pipe_fd,
        };
        supervisor.register_base_sources()?;

        let exit_status = supervisor.run()?;

        // In detached mode the caller learns about the exit status through
        // the sync pipe and the exit files only.
        Ok(if self.config().sync() { exit_status } else { 0 })
    }

    /// Turn into the OCI runtime process, never returns.
    #[allow(clippy::too_many_arguments)]
    fn run_runtime_child(
        config: &Config,
        oldmask: &SigSet,
        start_pipe_fd: Option<RawFd>,
        dev_null_r: RawFd,
        dev_null_w: RawFd,
        workerfd_stdin: RawFd,
        workerfd_stdout: RawFd,
        workerfd_stderr: RawFd,
        passthrough: bool,
        old_oom_score: Option<i32>,
        runtime_argv: &[String],
    ) -> ! {
        if exit::set_pdeathsig(libc::SIGKILL).is_err() {
            unsafe { libc::_exit(libc::EXIT_FAILURE) };
        }
        if sigprocmask(SigmaskHow::SIG_SETMASK, Some(oldmask), None).is_err() {
            unsafe { libc::_exit(libc::EXIT_FAILURE) };
        }

        if !passthrough {
            let stdin = if workerfd_stdin > -1 {
                workerfd_stdin
            } else {
                dev_null_r
            };
            let stdout = if workerfd_stdout > -1 {
                workerfd_stdout
            } else {
                dev_null_w
            };
            let stderr = if workerfd_stderr > -1 {
                workerfd_stderr
            } else {
                stdout
            };
            for (worker, stdio) in [
                (stdin, libc::STDIN_FILENO),
                (stdout, libc::STDOUT_FILENO),
                (stderr, libc::STDERR_FILENO),
            ] {
                if dup2(worker, stdio).is_err() {
                    unsafe { libc::_exit(libc::EXIT_FAILURE) };
                }
                fchmod(stdio, Mode::from_bits_truncate(0o777)).ok();
            }
        }

        // If a LISTEN_PID env is set, the new child may have to take it
        // over for socket activation to keep working.
        if let Ok(listen_pid) = env::var("LISTEN_PID") {
            let lpid = match listen_pid.parse::<i32>() {
                Ok(lpid) if lpid > 0 => lpid,
                _ => unsafe { libc::_exit(libc::EXIT_FAILURE) },
            };
            if config.replace_listen_pid() || lpid == getppid().as_raw() {
                env::set_var("LISTEN_PID", getpid().to_string());
            }
        }

        // If we are execing, and the user is trying to attach to this exec
        // session, we need to wait until they attach to the console before
        // actually execing, or else we may lose output.
        if config.exec_attach() {
            if let Some(fd) = start_pipe_fd {
                let mut buf = [0u8; BUF_SIZE];
                if read(fd, &mut buf).is_err() {
                    unsafe { libc::_exit(libc::EXIT_FAILURE) };
                }
                close(fd).ok();
            }
        }

        // The runtime and its container should be killable again.
        if let Some(score) = old_oom_score {
            fs::write("/proc/self/oom_score_adj", score.to_string()).ok();
        }

        let argv: Vec<CString> = runtime_argv
            .iter()
            .filter_map(|arg| CString::new(arg.as_str()).ok())
            .collect();
        let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(CString::as_c_str).collect();
        if !argv_refs.is_empty() {
            nix::unistd::execv(argv_refs[0], &argv_refs).ok();
        }
        unsafe { libc::_exit(127) };
    }

    /// Initialize the logger and set the verbosity to the provided level.
    fn init_logging(&self) -> Result<()> {
        // Set the logging verbosity via the env
        env::set_var("RUST_LOG", self.config().log_level().to_string());

        let log_level = self.config().log_level();
        let use_syslog = self.config().syslog();
        let cid = self.config().cid().clone();

        if use_syslog {
            unsafe {
                libc::openlog(
                    b"ctrmon\0".as_ptr() as *const libc::c_char,
                    libc::LOG_PID,
                    libc::LOG_DAEMON,
                )
            };
        }

        // Initialize the logger with the format:
        // [YYYY-MM-DDTHH:MM:SS:MMMZ LEVEL crate::module file:LINE] MSG…
        // The file and line will be only printed when running with debug or
        // trace level.
        env_logger::builder()
            .format(move |buf, r| {
                if use_syslog && r.level() <= log::Level::Warn {
                    let priority = if r.level() == log::Level::Error {
                        libc::LOG_ERR
                    } else {
                        libc::LOG_WARNING
                    };
                    if let Ok(msg) =
                        CString::new(format!("ctrmon {:.20} <{}>: {}", cid, r.level(), r.args()))
                    {
                        unsafe {
                            libc::syslog(
                                priority,
                                b"%s\0".as_ptr() as *const libc::c_char,
                                msg.as_ptr(),
                            )
                        };
                    }
                }
                writeln!(
                    buf,
                    "[{} {:<5} {}{}] {}",
                    buf.timestamp_millis(),
                    r.level(),
                    r.target(),
                    match (log_level >= LevelFilter::Debug, r.file(), r.line()) {
                        (true, Some(file), Some(line)) => format!(" {}:{}", file, line),
                        _ => "".into(),
                    },
                    r.args()
                )
            })
            .try_init()
            .context("init env logger")
    }

    /// Unset the locale for the current process.
    fn unset_locale() {
        unsafe { libc::setlocale(libc::LC_ALL, b"\0".as_ptr() as *const libc::c_char) };
    }

    /// Adjust the OOM score of the current process, returning the previous
    /// value so a child can restore it.
    fn adjust_oom_score(score: &str) -> Result<Option<i32>> {
        const OOM_SCORE_PATH: &str = "/proc/self/oom_score_adj";
        let old = fs::read_to_string(OOM_SCORE_PATH)
            .ok()
            .and_then(|value| value.trim().parse::<i32>().ok());
        fs::write(OOM_SCORE_PATH, score).context("write oom score")?;
        Ok(old)
    }

    /// Ignore SIGPIPE and let early termination signals flush the atexit
    /// hooks. The forwarding handlers replace these once the runtime runs.
    fn set_signal_handler() -> Result<()> {
        extern "C" fn handle_exit(_: libc::c_int) {
            std::process::exit(libc::EXIT_FAILURE);
        }
        unsafe {
            signal(Signal::SIGPIPE, SigHandler::SigIgn).context("ignore SIGPIPE")?;
            signal(Signal::SIGTERM, SigHandler::Handler(handle_exit)).context("handle SIGTERM")?;
            signal(Signal::SIGINT, SigHandler::Handler(handle_exit)).context("handle SIGINT")?;
            signal(Signal::SIGQUIT, SigHandler::Handler(handle_exit)).context("handle SIGQUIT")?;
        }
        Ok(())
    }
}

/// Owns every live resource of the monitor and reacts to event loop
/// readiness until the container is gone and reported.
struct Supervisor<'a> {
    config: &'a Config,
    events: EventLoop,
    state: ContainerState,
    pids: HashMap<i32, PidRole>,
    status_cache: HashMap<i32, i32>,
    fabric: StdioFabric,
    sinks: LogSinks,
    rate: LogRate,
    attach: Option<AttachPlane>,
    notify: Option<NotifyRelay>,
    ctl: Option<CtlFifos>,
    console: Option<ConsoleListener>,
    oom: Option<OomState>,
    sync_pipe: SyncPipe,
    signal_fd: SignalFd,
    timeout_timer: Option<OneShotTimer>,
    hup_timer: OneShotTimer,
    stdin_write_armed: bool,
    winsz_registered: bool,
    dev_null_r: RawFd,
    dev_null_w: RawFd,
    attach_pipe_fd: Option<RawFd>,
}

impl<'a> Supervisor<'a> {
    /// Register everything known before the runtime finished.
    fn register_base_sources(&mut self) -> Result<()> {
        self.events
            .add(self.signal_fd.as_raw_fd(), Token::Signal, EpollFlags::EPOLLIN)
            .context("watch signalfd")?;
        self.events
            .add(self.hup_timer.fd(), Token::HupTimer, EpollFlags::EPOLLIN)
            .context("watch hup timer")?;

        if let Some(ctl) = &self.ctl {
            self.events
                .add(ctl.ctl_r, Token::CtlFifo, EpollFlags::EPOLLIN)
                .context("watch ctl fifo")?;
            // The resize pipe is only useful once there is a terminal fd to
            // ioctl; for the pipe case that is true right away.
            if !self.config.terminal() && self.fabric.mainfd_stdout.is_some() {
                self.events
                    .add(ctl.winsz_r, Token::WinszFifo, EpollFlags::EPOLLIN)
                    .context("watch winsz fifo")?;
                self.winsz_registered = true;
            }
        }
        if let Some(attach) = &self.attach {
            self.events
                .add(attach.listener_fd, Token::AttachSock, EpollFlags::EPOLLIN)
                .context("watch attach socket")?;
        }
        if let Some(notify) = &self.notify {
            self.events
                .add(notify.fd, Token::NotifySock, EpollFlags::EPOLLIN)
                .context("watch notify socket")?;
        }
        if let Some(console) = &self.console {
            self.events
                .add(console.fd, Token::ConsoleSock, EpollFlags::EPOLLIN)
                .context("watch console socket")?;
        }
        Ok(())
    }

    /// Drive the monitor to completion and return the reported exit code.
    fn run(&mut self) -> Result<i32> {
        // Phase one: wait for the runtime invocation to finish. With a
        // terminal the event loop must run so the console fd handover can
        // happen; without one a plain blocking wait does the job since no
        // container output exists before create returns.
        if self.config.terminal() {
            self.events.quit = false;
            // Process any exit we may have missed before the signalfd was
            // in place.
            self.check_child_processes()?;
            if !self.events.quit {
                self.run_loop()?;
            }
        } else {
            self.wait_for_create()?;
        }

        let runtime_status = self.state.runtime_status;
        if !libc::WIFEXITED(runtime_status) || libc::WEXITSTATUS(runtime_status) != 0 {
            self.report_create_failure()?;
            let status = exit::get_exit_status(runtime_status);
            error!("Failed to create container: exit status {}", status);
            return Ok(status);
        }

        self.monitor_container()?;
        self.finish()
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut out = Vec::with_capacity(64);
        while !self.events.quit {
            self.events.wait(&mut out)?;
            for i in 0..out.len() {
                let (token, flags) = out[i];
                self.dispatch(token, flags)?;
                if self.events.quit {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Blocking wait for the runtime child, used when no terminal handover
    /// can happen concurrently.
    fn wait_for_create(&mut self) -> Result<()> {
        let create_pid = self.state.create_pid;
        loop {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(create_pid, &mut status, 0) };
            if ret >= 0 {
                self.state.runtime_status = status;
                break;
            }
            if Errno::last() == Errno::EINTR {
                continue;
            }
            if create_pid > 0 {
                unsafe { libc::kill(create_pid, libc::SIGKILL) };
            }
            bail!(
                "wait for runtime {} failed",
                if self.config.exec() { "exec" } else { "create" }
            );
        }
        self.state.create_pid = -1;
        exit::set_create_pid(-1);
        Ok(())
    }

    /// Forward the runtime's captured stderr to the parent when the create
    /// invocation failed.
    fn report_create_failure(&mut self) -> Result<()> {
        let fd = match self.fabric.mainfd_stderr {
            Some(fd) => fd,
            None => return Ok(()),
        };
        let mut buf = [0u8; BUF_SIZE];
        loop {
            match read(fd, &mut buf) {
                Ok(n) if n > 0 => {
                    let message = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let value = if self.config.api_version() < 1
                        && self.config.exec()
                        && self.state.container_status > 0
                    {
                        -(self.state.container_status as i64)
                    } else {
                        -1
                    };
                    self.sync_pipe.write(value, Some(&message))?;
                    return Ok(());
                }
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(_) => return Ok(()),
            }
        }
    }

    /// Learn the container pid, wire up the remaining event sources and run
    /// the main loop until the container is done.
    fn monitor_container(&mut self) -> Result<()> {
        if self.config.terminal() && self.fabric.mainfd_stdout.is_none() {
            bail!("runtime did not set up terminal");
        }

        // Read the pid so we can wait for the process to exit.
        let pidfile = self
            .config
            .container_pidfile()
            .as_ref()
            .context("no container pidfile configured")?;
        let contents = fs::read_to_string(pidfile).context("read container pidfile")?;
        let container_pid = contents
            .trim()
            .parse::<i32>()
            .context("parse container pid")?;
        debug!("container PID: {}", container_pid);

        self.state.container_pid = container_pid;
        exit::set_container_pid(container_pid);
        self.pids.insert(container_pid, PidRole::Container);

        // Send the container pid back to the parent. Legacy exec consumers
        // expect a single value on this pipe, which will be the exit code.
        if self.config.api_version() >= 1 || !self.config.exec() {
            self.sync_pipe.write(container_pid as i64, None)?;
        }

        self.oom = oom::setup(container_pid, self.config.persist_dir().as_deref());
        if let Some(oom) = &self.oom {
            if let Err(e) = self
                .events
                .add(oom.event_fd(), Token::Oom, EpollFlags::EPOLLIN)
            {
                warn!("failed to watch OOM event fd: {:#}", e);
                self.oom = None;
            }
        }

        if let Some(fd) = self.fabric.mainfd_stdout {
            self.events
                .add(fd, Token::Stdout, EpollFlags::EPOLLIN)
                .context("watch container stdout")?;
        }
        if let Some(fd) = self.fabric.mainfd_stderr {
            self.events
                .add(fd, Token::Stderr, EpollFlags::EPOLLIN)
                .context("watch container stderr")?;
        }

        if self.config.timeout() > 0 {
            let timer = OneShotTimer::new()?;
            timer.arm(Duration::from_secs(self.config.timeout().into()))?;
            self.events
                .add(timer.fd(), Token::TimeoutTimer, EpollFlags::EPOLLIN)
                .context("watch timeout timer")?;
            self.timeout_timer = Some(timer);
        }

        // Dispatch exits that happened before their callback existed.
        let cached: Vec<(i32, i32)> = self
            .status_cache
            .iter()
            .filter(|(pid, _)| self.pids.contains_key(pid))
            .map(|(pid, status)| (*pid, *status))
            .collect();
        for (pid, status) in cached {
            self.status_cache.remove(&pid);
            self.dispatch_child(pid, status);
        }

        // A quickly exiting exec session with a terminal may already be
        // fully handled; everything else needs the loop to flush the
        // remaining I/O and observe the container exit.
        if self.config.api_version() < 1
            || !self.config.exec()
            || !self.config.terminal()
            || self.state.container_status < 0
        {
            self.events.quit = false;
            self.check_child_processes()?;
            if !self.events.quit {
                self.run_loop()?;
            }
        }
        Ok(())
    }

    /// The fixed shutdown order: final OOM check, drain, sync, close the
    /// injected fds, persist exit files, report, unlink.
    fn finish(&mut self) -> Result<i32> {
        if let Some(oom) = &mut self.oom {
            oom.final_check();
        }

        // Drain stdout and stderr only if no timeout occurred; a still
        // running container would never deliver the EOF.
        if !self.state.timed_out {
            let Supervisor {
                fabric,
                rate,
                sinks,
                attach,
                ..
            } = self;
            fabric.drain(rate, sinks, attach.as_mut());
        }

        self.sinks.sync();

        let mut exit_status = -1;
        let mut exit_message = None;

        // If the container is already gone the timer elapsing lost the
        // race; treat it like a normal exit.
        if self.state.timed_out && self.state.container_pid > 0 {
            let pid = self.state.container_pid;
            match getpgid(Some(Pid::from_raw(pid))) {
                Ok(pgid) if pgid.as_raw() > 1 => {
                    nix::sys::signal::kill(Pid::from_raw(-pgid.as_raw()), Signal::SIGKILL).ok();
                }
                _ => {
                    nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL).ok();
                }
            }
            exit_message = Some(TIMED_OUT_MESSAGE);
        } else {
            exit_status = exit::get_exit_status(self.state.container_status);
        }

        // The caller may have injected fds (port reservations and such);
        // release them before the exit report so they are reusable.
        let mut keep = vec![self.dev_null_r, self.dev_null_w];
        if let Some(fd) = self.sync_pipe.fd() {
            keep.push(fd);
        }
        if let Some(fd) = self.attach_pipe_fd {
            keep.push(fd);
        }
        close_fds::close_inherited_fds(&keep);

        let status_str = exit_status.to_string();
        if let Some(persist_dir) = self.config.persist_dir() {
            fs::write(persist_dir.join("exit"), &status_str)
                .context("write container exit file")?;
        }
        if let Some(exit_dir) = self.config.exit_dir() {
            fs::write(exit_dir.join(self.config.cid()), &status_str)
                .context("write exit file")?;
        }

        self.sync_pipe.write(exit_status.into(), exit_message)?;

        if let Some(attach) = &self.attach {
            attach.unlink_symlink();
        }

        Ok(exit_status)
    }

    fn dispatch(&mut self, token: Token, flags: EpollFlags) -> Result<()> {
        match token {
            Token::Signal => {
                while let Ok(Some(_)) = self.signal_fd.read_signal() {}
                self.check_child_processes()?;
            }
            Token::Stdout => self.on_stdio(StreamKind::Stdout, flags),
            Token::Stderr => self.on_stdio(StreamKind::Stderr, flags),
            Token::CtlFifo => {
                if let Some(ctl) = self.ctl.as_mut() {
                    ctl.handle_ctl_event(&mut self.sinks);
                }
            }
            Token::WinszFifo => {
                if let Some(ctl) = self.ctl.as_mut() {
                    ctl.handle_winsz_event(self.fabric.mainfd_stdout);
                }
            }
            Token::ConsoleSock => self.on_console_accept()?,
            Token::AttachSock => {
                if let Some(attach) = self.attach.as_mut() {
                    attach.accept(&self.events);
                }
            }
            Token::Client(fd) => self.on_client_event(fd, flags),
            Token::StdinWritable => self.on_stdin_writable(),
            Token::NotifySock => {
                if let Some(notify) = &self.notify {
                    notify.handle_event();
                }
            }
            Token::Oom => {
                let keep = self
                    .oom
                    .as_mut()
                    .map(|oom| oom.handle_event())
                    .unwrap_or(false);
                if !keep {
                    if let Some(oom) = self.oom.take() {
                        self.events.delete(oom.event_fd());
                    }
                }
            }
            Token::TimeoutTimer => {
                if let Some(timer) = &self.timeout_timer {
                    timer.consume();
                }
                info!("Timed out, killing main loop");
                self.state.timed_out = true;
                self.events.quit = true;
            }
            Token::HupTimer => {
                self.hup_timer.consume();
                self.fabric.hup_poll_armed = false;
                if let Some(fd) = self.fabric.mainfd_stdout {
                    self.events.add(fd, Token::Stdout, EpollFlags::EPOLLIN).ok();
                }
            }
        }
        Ok(())
    }

    /// Readable container output, EOF or a PTY HUP.
    fn on_stdio(&mut self, kind: StreamKind, flags: EpollFlags) {
        let has_input = flags.contains(EpollFlags::EPOLLIN);
        let has_hup = flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR);
        let mut read_eof = false;

        // Read any data before handling the hup.
        if has_input {
            match self.fabric.read_once(kind) {
                ReadOutcome::Data(n) => {
                    let Supervisor {
                        fabric,
                        rate,
                        sinks,
                        attach,
                        ..
                    } = self;
                    fabric.fan_out(kind, n, rate, sinks, attach.as_mut());
                }
                ReadOutcome::Eof => read_eof = true,
                ReadOutcome::Again => {}
            }
        }

        // A HUP from the terminal main means no worker has the pty open
        // right now; that changes whenever somebody opens the tty again, so
        // switch to polling mode instead of spinning on the wakeups.
        if has_hup && self.fabric.terminal && kind == StreamKind::Stdout {
            // If we read some data this cycle, wait one more, maybe there
            // is more in the buffer before we handle the hup.
            if has_input && !read_eof {
                return;
            }
            if let Some(fd) = self.fabric.mainfd_stdout {
                self.events.delete(fd);
            }
            if !self.fabric.hup_poll_armed {
                self.hup_timer.arm(Duration::from_millis(100)).ok();
            }
            self.fabric.hup_poll_armed = true;
            return;
        }

        // End of input.
        if read_eof || (has_hup && !has_input) {
            if let Some(fd) = self.fabric.main_fd(kind) {
                self.events.delete(fd);
                close(fd).ok();
            }
            self.fabric.clear_main_fd(kind);
            // Once the container status is known and both outputs hit EOF
            // there is nothing left to wait for.
            if self.state.container_status >= 0 && self.fabric.outputs_closed() {
                self.events.quit = true;
            }
        }
    }

    /// The runtime connected to the console socket and sent the PTY master.
    fn on_console_accept(&mut self) -> Result<()> {
        let (listener_fd, path) = match &self.console {
            Some(console) => (console.fd, console.path.clone()),
            None => return Ok(()),
        };
        let pty = match ctrl::accept_console(listener_fd, &path) {
            Ok(pty) => pty,
            Err(e) => {
                warn!("console socket handover failed: {:#}", e);
                return Ok(());
            }
        };

        // Since we've gotten our console from the runtime, we no longer
        // need to be listening on this socket.
        self.events.delete(listener_fd);
        close(listener_fd).ok();
        self.console = None;

        // We only have a single fd for both pipes, so we just treat it as
        // stdout. stderr is ignored.
        self.fabric.mainfd_stdin = Some(pty);
        self.fabric.mainfd_stdout = Some(dup(pty).context("dup console file descriptor")?);

        // Make sure we handle any pending data that was already buffered by
        // attached clients.
        if self
            .attach
            .as_ref()
            .map(AttachPlane::has_pending_stdin)
            .unwrap_or(false)
        {
            self.arm_stdin_write();
        }

        // Now that mainfd_stdout is valid the resize pipe has an ioctl
        // target and can be watched.
        if let Some(ctl) = &self.ctl {
            if !self.winsz_registered {
                self.events
                    .add(ctl.winsz_r, Token::WinszFifo, EpollFlags::EPOLLIN)
                    .context("watch winsz fifo")?;
                self.winsz_registered = true;
            }
        }
        Ok(())
    }

    fn on_client_event(&mut self, fd: RawFd, flags: EpollFlags) {
        let directive = {
            let Supervisor {
                attach,
                events,
                fabric,
                ..
            } = self;
            match attach.as_mut() {
                Some(attach) => attach.handle_client_event(fd, flags, fabric.mainfd_stdin, events),
                None => ClientDirective::None,
            }
        };
        match directive {
            ClientDirective::ArmStdinWrite => self.arm_stdin_write(),
            ClientDirective::PeerClosed => {
                if self.fabric.mainfd_stdin.is_some() && self.config.stdin() {
                    if self.config.leave_stdin_open() {
                        info!("Not closing input");
                    } else {
                        self.close_container_stdin();
                    }
                }
            }
            ClientDirective::None => {}
        }
    }

    fn close_container_stdin(&mut self) {
        if let Some(fd) = self.fabric.mainfd_stdin.take() {
            if self.stdin_write_armed {
                self.events.delete(fd);
                self.stdin_write_armed = false;
            }
            close(fd).ok();
        }
    }

    fn arm_stdin_write(&mut self) {
        if self.stdin_write_armed {
            return;
        }
        if let Some(fd) = self.fabric.mainfd_stdin {
            if self
                .events
                .add(fd, Token::StdinWritable, EpollFlags::EPOLLOUT)
                .is_ok()
            {
                self.stdin_write_armed = true;
            }
        }
    }

    fn on_stdin_writable(&mut self) {
        let has_data = {
            let Supervisor {
                attach,
                events,
                fabric,
                ..
            } = self;
            match attach.as_mut() {
                Some(attach) => attach.flush_pending_stdin(fabric.mainfd_stdin, events),
                None => false,
            }
        };
        if !has_data {
            if let Some(fd) = self.fabric.mainfd_stdin {
                self.events.delete(fd);
            }
            self.stdin_write_armed = false;
        }
    }

    /// Reap every pending child, routing known pids to their role handler
    /// and caching unknown ones until their callback is registered.
    fn check_child_processes(&mut self) -> Result<()> {
        loop {
            match exit::wait_next_child()? {
                WaitResult::NoChildren => {
                    self.events.quit = true;
                    return Ok(());
                }
                WaitResult::NoneReady => return Ok(()),
                WaitResult::Child { pid, status } => self.dispatch_child(pid, status),
            }
        }
    }

    fn dispatch_child(&mut self, pid: i32, status: i32) {
        match self.pids.get(&pid) {
            Some(PidRole::Runtime) => {
                self.state.runtime_status = status;
                self.state.create_pid = -1;
                exit::set_create_pid(-1);
                self.events.quit = true;
            }
            Some(PidRole::Container) => {
                let exit_status = exit::get_exit_status(status);
                if exit_status != 0 {
                    info!("container {} exited with status {}", pid, exit_status);
                }
                self.state.container_status = status;
                self.state.container_pid = -1;
                exit::set_container_pid(-1);

                // In a quickly exiting exec session the container exit can
                // overtake the runtime exit. Quitting now would report a
                // failed runtime call, so wait for the runtime callback.
                if self.config.api_version() >= 1
                    && self.state.create_pid > 0
                    && self.config.exec()
                    && self.config.terminal()
                {
                    debug!("container pid return handled before runtime pid return, not quitting yet");
                    return;
                }
                self.events.quit = true;
            }
            None => {
                self.status_cache.insert(pid, status);
            }
        }
    }
}
