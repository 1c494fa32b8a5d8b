//! Configuration related structures
use crate::{container_logging::RotationPolicy, log_rate};
use anyhow::{bail, Context, Result};
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf};

macro_rules! prefix {
    () => {
        "CTRMON_"
    };
}

#[derive(
    Builder, CopyGetters, Debug, Deserialize, Eq, Getters, Parser, PartialEq, Serialize, Setters,
)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "kebab-case")]
#[command(disable_version_flag(true))]
/// An OCI container runtime monitor.
pub struct Config {
    #[get_copy = "pub"]
    #[arg(long("version"))]
    /// Print version and git commit, then exit.
    version: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("info"),
        env(concat!(prefix!(), "LOG_LEVEL")),
        long("log-level"),
        value_name("LEVEL")
    )]
    /// The logging level of the application.
    log_level: LevelFilter,

    #[get_copy = "pub"]
    #[arg(
        default_value("0"),
        env(concat!(prefix!(), "API_VERSION")),
        long("api-version"),
        value_name("VERSION")
    )]
    /// API version to use.
    api_version: u8,

    #[getset(get = "pub", set)]
    #[arg(
        env(concat!(prefix!(), "BUNDLE")),
        long("bundle"),
        short('b'),
        value_name("PATH")
    )]
    /// Location of the OCI Bundle path.
    bundle: Option<PathBuf>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "CID")),
        long("cid"),
        short('c'),
        value_name("ID")
    )]
    /// Identification of Container.
    cid: String,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "CONMON_PIDFILE")),
        long("conmon-pidfile"),
        short('P'),
        value_name("PATH")
    )]
    /// PID file for the monitor process itself.
    conmon_pidfile: Option<PathBuf>,

    #[getset(get = "pub", set)]
    #[arg(
        env(concat!(prefix!(), "CONTAINER_PIDFILE")),
        long("container-pidfile"),
        short('p'),
        value_name("PATH")
    )]
    /// PID file for the initial pid inside of container.
    container_pidfile: Option<PathBuf>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "CUUID")),
        long("cuuid"),
        short('u'),
        value_name("ID")
    )]
    /// Container UUID.
    cuuid: Option<String>,

    #[get_copy = "pub"]
    #[arg(
        conflicts_with("restore"),
        env(concat!(prefix!(), "EXEC")),
        long("exec"),
        requires("exec_process_spec"),
        short('e')
    )]
    /// Exec a command into a running container.
    exec: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "EXEC_ATTACH")),
        long("exec-attach"),
        requires("exec")
    )]
    /// Attach to an exec session.
    exec_attach: bool,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "EXEC_PROCESS_SPEC")),
        long("exec-process-spec"),
        value_name("PATH")
    )]
    /// Path to the process spec for execution.
    exec_process_spec: Option<PathBuf>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "EXIT_COMMAND")),
        long("exit-command"),
        value_name("PATH")
    )]
    /// Path to the program to execute when the container terminates its execution.
    exit_command: Option<PathBuf>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "EXIT_COMMAND_ARG")),
        long("exit-command-arg"),
        value_name("ARGS")
    )]
    /// Additional arg to pass to the exit command. Can be specified multiple times.
    exit_command_arg: Vec<String>,

    #[get_copy = "pub"]
    #[arg(
        default_value("0"),
        env(concat!(prefix!(), "EXIT_DELAY")),
        long("exit-delay"),
        value_name("SEC")
    )]
    /// Delay before invoking the exit command (in seconds).
    exit_delay: u32,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "EXIT_DIR")),
        long("exit-dir"),
        value_name("PATH")
    )]
    /// Path to the directory where exit files are written.
    exit_dir: Option<PathBuf>,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "FULL_ATTACH")),
        long("full-attach")
    )]
    /// Don't truncate the path to the attach socket. This option causes the
    /// monitor to ignore --socket-dir-path.
    full_attach: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "LEAVE_STDIN_OPEN")),
        long("leave-stdin-open")
    )]
    /// Leave stdin open when attached client disconnects.
    leave_stdin_open: bool,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "LOG_LABEL")),
        long("log-label"),
        value_name("KEY=VALUE")
    )]
    /// Additional structured field for journald records. Can be specified
    /// multiple times.
    log_label: Vec<String>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "LOG_PATH")),
        long("log-path"),
        required(true),
        short('l'),
        value_name("[DRIVER:]PATH")
    )]
    /// Log file paths to specified. Can also contain colon prefixd path containing the additional
    /// log driver.
    log_path: Vec<String>,

    #[get_copy = "pub"]
    #[arg(
        default_value("-1"),
        env(concat!(prefix!(), "LOG_GLOBAL_SIZE_MAX")),
        long("log-global-size-max"),
        value_name("BYTE")
    )]
    /// Maximum aggregate size of all log files.
    log_global_size_max: i64,

    #[get_copy = "pub"]
    #[arg(
        default_value("passthrough"),
        env(concat!(prefix!(), "LOG_RATE_POLICY")),
        long("log-rate-policy"),
        value_name("POLICY")
    )]
    /// Policy for container output exceeding the log rate limit.
    log_rate_policy: log_rate::Policy,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "LOG_RATE_LIMIT")),
        long("log-rate-limit"),
        value_name("BYTES[K|M|G|T]")
    )]
    /// Maximum bytes of container output logged per second.
    log_rate_limit: Option<String>,

    #[get_copy = "pub"]
    #[arg(
        default_value("truncate"),
        env(concat!(prefix!(), "LOG_ROTATION")),
        long("log-rotation"),
        value_name("POLICY")
    )]
    /// Rotation policy once a log file reaches --log-size-max.
    log_rotation: RotationPolicy,

    #[get_copy = "pub"]
    #[arg(
        default_value("-1"),
        env(concat!(prefix!(), "LOG_SIZE_MAX")),
        long("log-size-max"),
        value_name("BYTE")
    )]
    /// Maximum size of log file.
    log_size_max: i64,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "LOG_TAG")),
        long("log-tag"),
        value_name("TAG")
    )]
    /// Additional tag to use for logging.
    log_tag: Option<String>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "NAME")),
        long("name"),
        short('n'),
        value_name("NAME")
    )]
    /// Container name.
    name: Option<String>,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "NO_NEW_KEYRING")),
        long("no-new-keyring")
    )]
    /// Do not create a new session keyring for the container.
    no_new_keyring: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "NO_PARTIAL_MESSAGE")),
        long("no-partial-message")
    )]
    /// Do not mark partial journald lines with CONTAINER_PARTIAL_MESSAGE.
    no_partial_message: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "NO_PIVOT")),
        long("no-pivot")
    )]
    /// Do not use `pivot_root`.
    no_pivot: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "NO_SYNC_LOG")),
        long("no-sync-log")
    )]
    /// Do not manually call sync on logs after container shutdown.
    no_sync_log: bool,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "PERSIST_DIR")),
        long("persist-dir"),
        value_name("PATH")
    )]
    /// Persistent directory for a container that can be used for storing container data.
    persist_dir: Option<PathBuf>,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "REPLACE_LISTEN_PID")),
        long("replace-listen-pid")
    )]
    /// Replace listen pid if set for oci-runtime pid.
    replace_listen_pid: bool,

    #[get = "pub"]
    #[arg(
        conflicts_with("exec"),
        env(concat!(prefix!(), "RESTORE")),
        long("restore"),
        value_name("PATH")
    )]
    /// Restore a container from a checkpoint.
    restore: Option<PathBuf>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "RUNTIME")),
        long("runtime"),
        short('r'),
        value_name("PATH")
    )]
    /// Path to the OCI runtime executable.
    runtime: PathBuf,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "RUNTIME_ARG")),
        long("runtime-arg"),
        value_name("ARGS")
    )]
    /// Additional arg to pass to the runtime. Can be specified multiple times.
    runtime_arg: Vec<String>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "RUNTIME_OPT")),
        long("runtime-opt"),
        value_name("OPTS")
    )]
    /// Additional opts to pass to the restore or exec command. Can be specified multiple times.
    runtime_opt: Vec<String>,

    #[get = "pub"]
    #[arg(
        env(concat!(prefix!(), "SDNOTIFY_SOCKET")),
        long("sdnotify-socket"),
        value_name("PATH")
    )]
    /// Path to the host's sd-notify socket to relay messages to.
    sdnotify_socket: Option<PathBuf>,

    #[get = "pub"]
    #[arg(
        default_value("/var/run/crio"),
        env(concat!(prefix!(), "SOCKET_DIR_PATH")),
        long("socket-dir-path"),
        value_name("PATH")
    )]
    /// Location of container attach sockets.
    socket_dir_path: PathBuf,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "STDIN")),
        long("stdin"),
        short('i')
    )]
    /// Open up a pipe to pass stdin to the container.
    stdin: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "SYNC")),
        long("sync")
    )]
    /// Keep the main monitor process as its child by only forking once.
    sync: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "SYSLOG")),
        long("syslog")
    )]
    /// Log to syslog (use with cgroupfs cgroup manager).
    syslog: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "SYSTEMD_CGROUP")),
        long("systemd-cgroup"),
        short('s')
    )]
    /// Enable systemd cgroup manager, rather then use the cgroupfs directly.
    systemd_cgroup: bool,

    #[get_copy = "pub"]
    #[arg(
        env(concat!(prefix!(), "TERMINAL")),
        long("terminal"),
        short('t')
    )]
    /// Allocate a pseudo-TTY.
    terminal: bool,

    #[get_copy = "pub"]
    #[arg(
        default_value("0"),
        env(concat!(prefix!(), "TIMEOUT")),
        long("timeout"),
        short('T'),
        value_name("SEC")
    )]
    /// Kill container after specified timeout in seconds.
    timeout: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse()
    }
}

impl Config {
    /// Check cross-option invariants and fill in derived defaults.
    pub fn validate(&mut self) -> Result<()> {
        let legacy_exec = self.exec() && self.api_version() == 0;

        if self.exec_attach() && self.api_version() == 0 {
            bail!("--exec-attach requires --api-version 1 or newer")
        }

        // Only the legacy exec API gets away without a container UUID.
        if self.cuuid().is_none() && !legacy_exec {
            bail!("no container UUID given (--cuuid)")
        }

        if let Some(limit) = self.log_rate_limit() {
            log_rate::parse_rate_limit(limit).context("invalid --log-rate-limit")?;
        }

        if !self.runtime().exists() {
            bail!(
                "OCI runtime binary {} not found",
                self.runtime().display()
            )
        }

        let cwd = env::current_dir().context("get current dir")?;

        // Without a bundle there is nowhere to place the attach socket and
        // the control FIFOs. Fall back to the working directory, except for
        // exec sessions where an absent bundle just disables attach.
        if self.bundle().is_none() && !self.exec() {
            debug!("Defaulting bundle path to {}", cwd.display());
            self.set_bundle(cwd.clone().into());
        }

        // The runtime always needs somewhere to leave the container pid.
        if self.container_pidfile().is_none() {
            let pidfile = cwd.join(format!("pidfile-{}", self.cid()));
            debug!("Defaulting container pidfile to {}", pidfile.display());
            self.set_container_pidfile(pidfile.into());
        }

        Ok(())
    }

    /// The effective log rate limit in bytes per second, zero meaning
    /// unlimited.
    pub fn parsed_log_rate_limit(&self) -> u64 {
        self.log_rate_limit()
            .as_deref()
            .and_then(|limit| log_rate::parse_rate_limit(limit).ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["ctrmon"];
        argv.extend(args);
        Config::parse_from(argv)
    }

    fn minimal(extra: &[&str]) -> Config {
        let mut args = vec![
            "--cid",
            "ctr",
            "--cuuid",
            "1234567890abcdef",
            "--runtime",
            "/bin/true",
            "--log-path",
            "/tmp/ctr.log",
        ];
        args.extend(extra);
        parse(&args)
    }

    #[test]
    fn validate_defaults_bundle_and_pidfile() -> Result<()> {
        let mut config = minimal(&[]);
        config.validate()?;
        assert!(config.bundle().is_some());
        assert!(config
            .container_pidfile()
            .as_ref()
            .map(|p| p.to_string_lossy().contains("pidfile-ctr"))
            .unwrap_or_default());
        Ok(())
    }

    #[test]
    fn validate_rejects_legacy_exec_attach() {
        let mut config = minimal(&[
            "--exec",
            "--exec-process-spec",
            "/spec.json",
            "--exec-attach",
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_cuuid() {
        let mut config = parse(&[
            "--cid",
            "ctr",
            "--runtime",
            "/bin/true",
            "--log-path",
            "/tmp/ctr.log",
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_runtime() {
        let mut config = minimal(&[]);
        config.runtime = "/does/not/exist".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_rate_limit() {
        let mut config = minimal(&["--log-rate-limit", "10X"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_new_logging_options() {
        let config = minimal(&[
            "--log-global-size-max",
            "4096",
            "--log-rotation",
            "backup",
            "--log-rate-policy",
            "drop",
            "--log-rate-limit",
            "10K",
            "--log-label",
            "FOO=bar",
        ]);
        assert_eq!(config.log_global_size_max(), 4096);
        assert_eq!(config.log_rotation(), RotationPolicy::Backup);
        assert_eq!(config.log_rate_policy(), log_rate::Policy::Drop);
        assert_eq!(config.parsed_log_rate_limit(), 10 * 1024);
        assert_eq!(config.log_label(), &["FOO=bar".to_string()]);
    }
}
