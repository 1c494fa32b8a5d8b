//! Assembly of the OCI runtime command line.

use crate::config::Config;
use log::trace;
use std::path::Path;

/// Build the argv for the runtime invocation:
/// `<runtime> [--systemd-cgroup] [runtime-args..] <subcommand>
/// [subcommand-flags] [runtime-opts..] [--console-socket <csname>] <cid>`.
pub(crate) fn runtime_args(config: &Config, csname: Option<&Path>) -> Vec<String> {
    let mut argv = vec![config.runtime().display().to_string()];

    if !config.exec() && config.systemd_cgroup() {
        argv.push("--systemd-cgroup".into());
    }

    argv.extend(config.runtime_arg().iter().cloned());

    let pidfile = config
        .container_pidfile()
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    if config.exec() {
        argv.push("exec".into());
        argv.extend(["--pid-file".into(), pidfile]);
        if let Some(spec) = config.exec_process_spec() {
            argv.extend(["--process".into(), spec.display().to_string()]);
        }
        argv.push("--detach".into());
        if config.terminal() {
            argv.push("--tty".into());
        }
    } else {
        let bundle = config
            .bundle()
            .as_ref()
            .map(|b| b.display().to_string())
            .unwrap_or_default();
        argv.push(if config.restore().is_some() {
            "restore".into()
        } else {
            "create".into()
        });
        argv.extend(["--bundle".into(), bundle.clone(), "--pid-file".into(), pidfile]);
        if config.no_pivot() {
            argv.push("--no-pivot".into());
        }
        if config.no_new_keyring() {
            argv.push("--no-new-keyring".into());
        }
        if let Some(restore) = config.restore() {
            // A restored container is immediately running, so the runtime
            // has to detach like it does for exec.
            argv.push("--detach".into());
            argv.extend(["--image-path".into(), restore.display().to_string()]);
            argv.extend(["--work-path".into(), bundle]);
        }
    }

    argv.extend(config.runtime_opt().iter().cloned());

    if let Some(csname) = csname {
        argv.extend(["--console-socket".into(), csname.display().to_string()]);
    }

    // Container name comes last.
    argv.push(config.cid().clone());

    trace!("calling runtime args: {}", argv.join(" "));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use clap::Parser;
    use std::path::PathBuf;

    fn config(extra: &[&str]) -> Config {
        let mut args = vec![
            "ctrmon",
            "--cid",
            "ctr",
            "--cuuid",
            "1234567890abcdef",
            "--runtime",
            "/bin/true",
            "--log-path",
            "/tmp/ctr.log",
            "--bundle",
            "/bundle",
            "--container-pidfile",
            "/bundle/pidfile",
        ];
        args.extend(extra);
        Config::parse_from(args)
    }

    #[test]
    fn create_args() -> Result<()> {
        let argv = runtime_args(&config(&[]), None);
        assert_eq!(
            argv,
            vec![
                "/bin/true",
                "create",
                "--bundle",
                "/bundle",
                "--pid-file",
                "/bundle/pidfile",
                "ctr"
            ]
        );
        Ok(())
    }

    #[test]
    fn create_args_with_options() -> Result<()> {
        let argv = runtime_args(
            &config(&[
                "--systemd-cgroup",
                "--no-pivot",
                "--no-new-keyring",
                "--runtime-arg",
                "--root=/run/runc",
            ]),
            Some(&PathBuf::from("/tmp/term.sock")),
        );
        assert_eq!(
            argv,
            vec![
                "/bin/true",
                "--systemd-cgroup",
                "--root=/run/runc",
                "create",
                "--bundle",
                "/bundle",
                "--pid-file",
                "/bundle/pidfile",
                "--no-pivot",
                "--no-new-keyring",
                "--console-socket",
                "/tmp/term.sock",
                "ctr"
            ]
        );
        Ok(())
    }

    #[test]
    fn exec_args() -> Result<()> {
        let argv = runtime_args(
            &config(&[
                "--exec",
                "--exec-process-spec",
                "/bundle/process.json",
                "--terminal",
                "--systemd-cgroup",
            ]),
            None,
        );
        // No --systemd-cgroup for exec sessions.
        assert_eq!(
            argv,
            vec![
                "/bin/true",
                "exec",
                "--pid-file",
                "/bundle/pidfile",
                "--process",
                "/bundle/process.json",
                "--detach",
                "--tty",
                "ctr"
            ]
        );
        Ok(())
    }

    #[test]
    fn restore_args() -> Result<()> {
        let argv = runtime_args(&config(&["--restore", "/checkpoint"]), None);
        assert_eq!(
            argv,
            vec![
                "/bin/true",
                "restore",
                "--bundle",
                "/bundle",
                "--pid-file",
                "/bundle/pidfile",
                "--detach",
                "--image-path",
                "/checkpoint",
                "--work-path",
                "/bundle",
                "ctr"
            ]
        );
        Ok(())
    }
}
