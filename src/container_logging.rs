//! Container logging related implementations

use crate::{
    config::Config,
    journald::JournaldWriter,
    stdio::StreamKind,
};
use anyhow::{bail, Context, Result};
use jiff::{tz::TimeZone, Timestamp};
use log::warn;
use nix::{
    errno::Errno,
    fcntl::{fcntl, open, FcntlArg, OFlag},
    sys::{
        stat::Mode,
        uio::writev,
    },
    unistd::{close, fsync, isatty},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::IoSlice,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    str::FromStr,
};
use strum::{AsRefStr, EnumString};

/// Upper bound of gathered segments per `writev` call.
const WRITEV_BUFFER_N_IOV: usize = 128;

#[derive(AsRefStr, Clone, Debug, Eq, EnumString, PartialEq)]
#[strum(serialize_all = "kebab-case")]
/// Available logging drivers.
pub(crate) enum Driver {
    /// Kubernetes file based logging.
    K8sFile(PathBuf),

    /// Journald based logging.
    Journald,

    /// Dup the runtime stdio over the monitor's own, bypassing the fabric.
    Passthrough,

    /// No logging.
    Off,

    /// No logging.
    Null,

    /// No logging.
    None,
}

#[derive(AsRefStr, Clone, Copy, Debug, Deserialize, EnumString, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
/// How the k8s-file writer behaves when a file outgrows its size cap.
pub enum RotationPolicy {
    /// Replace the file with a freshly truncated one.
    Truncate,

    /// Keep numbered backups, guarded by an advisory lock.
    Backup,
}

/// All log sinks the user configured, in driver-declaration order.
pub(crate) struct LogSinks {
    k8s: Option<K8sFileWriter>,
    journald: Option<JournaldWriter>,
    passthrough: bool,
}

impl LogSinks {
    /// Parse the configured log drivers and open their sinks.
    pub fn configure(config: &Config) -> Result<Self> {
        let mut k8s_path = None;
        let mut journald_requested = false;
        let mut passthrough = false;

        for log_path in config.log_path() {
            match Self::parse_log_path(log_path)? {
                Driver::K8sFile(path) => k8s_path = Some(path),
                Driver::Journald => journald_requested = true,
                Driver::Passthrough => passthrough = true,
                Driver::Off | Driver::Null | Driver::None => continue,
            }
        }

        if passthrough
            && (isatty(libc::STDIN_FILENO).unwrap_or(false)
                || isatty(libc::STDOUT_FILENO).unwrap_or(false)
                || isatty(libc::STDERR_FILENO).unwrap_or(false))
        {
            bail!("cannot use a tty with passthrough logging mode to prevent attacks via TIOCSTI")
        }

        if config.log_tag().is_some() && !journald_requested {
            bail!("--log-tag requires the journald log driver")
        }
        if !config.log_label().is_empty() && !journald_requested {
            bail!("--log-label requires the journald log driver")
        }
        for label in config.log_label() {
            validate_log_label(label)?;
        }

        let k8s = match k8s_path {
            Some(path) => Some(K8sFileWriter::new(
                path,
                config.log_size_max(),
                config.log_global_size_max(),
                config.log_rotation(),
                config.no_sync_log(),
            )?),
            None => None,
        };

        let journald = if journald_requested {
            let cuuid = config
                .cuuid()
                .as_ref()
                .context("journald logging requires a container UUID")?;
            Some(JournaldWriter::new(
                cuuid,
                config.name().as_deref(),
                config.log_tag().as_deref(),
                config.log_label(),
                !config.no_partial_message(),
            )?)
        } else {
            None
        };

        Ok(Self {
            k8s,
            journald,
            passthrough,
        })
    }

    pub fn passthrough(&self) -> bool {
        self.passthrough
    }

    /// Write container output to all sinks. A zero-length `buf` flushes
    /// buffered partial lines. Failures are warned about, never fatal.
    pub fn write(&mut self, kind: StreamKind, buf: &[u8]) {
        if let Some(k8s) = &mut self.k8s {
            k8s.write(kind, buf);
        }
        if let Some(journald) = &mut self.journald {
            journald.write(kind, buf);
        }
    }

    /// Re-establish the k8s-file fd against the current path. Journald has
    /// nothing to reopen.
    pub fn reopen(&mut self) {
        if let Some(k8s) = &mut self.k8s {
            if let Err(e) = k8s.reopen() {
                warn!("failed to reopen log file: {:#}", e);
            }
        }
    }

    /// Sync the k8s-file sink to disk.
    pub fn sync(&mut self) {
        if let Some(k8s) = &mut self.k8s {
            k8s.sync();
        }
    }

    /// Turn one `--log-path` value into a driver.
    ///
    /// Accepted forms are `<driver>:<path>` and a bare `<path>`, the latter
    /// selecting k8s-file. Only k8s-file consumes the path part; drivers
    /// like `journald:` simply ignore it.
    fn parse_log_path(log_path: &str) -> Result<Driver> {
        let (driver, path) = match log_path.split_once(':') {
            Some(parts) => parts,
            // A bare token is either a driver name or a file for the
            // default k8s-file driver.
            None => {
                return Ok(Driver::from_str(log_path)
                    .unwrap_or_else(|_| Driver::K8sFile(log_path.into())))
            }
        };

        let mut driver = Driver::from_str(driver)
            .with_context(|| format!("unknown log driver in '{}'", log_path))?;
        if let Driver::K8sFile(ref mut file) = driver {
            if path.is_empty() {
                bail!("k8s-file requires a log file path");
            }
            *file = path.into();
        }
        Ok(driver)
    }
}

/// Structured log labels are KEY=VALUE with the key restricted to
/// uppercase, digits and underscores.
fn validate_log_label(label: &str) -> Result<()> {
    let (key, _) = label
        .split_once('=')
        .with_context(|| format!("log label '{}' is not KEY=VALUE", label))?;
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        bail!(
            "log label key '{}' may only contain uppercase, digits and underscore",
            key
        );
    }
    Ok(())
}

/// CRI format log file writer: one `<timestamp> <stream> <F|P> <payload>`
/// record per newline-separated line, bounded by per-file and aggregate
/// size caps.
pub(crate) struct K8sFileWriter {
    path: PathBuf,
    fd: RawFd,
    bytes_in_file: i64,
    total_bytes_written: i64,
    max_per_file: i64,
    max_total: i64,
    rotation: RotationPolicy,
    no_sync: bool,
    tz: TimeZone,
}

impl K8sFileWriter {
    pub fn new(
        path: PathBuf,
        max_per_file: i64,
        max_total: i64,
        rotation: RotationPolicy,
        no_sync: bool,
    ) -> Result<Self> {
        let fd = Self::open_log(&path)?;
        Ok(Self {
            path,
            fd,
            bytes_in_file: 0,
            total_bytes_written: 0,
            max_per_file,
            max_total,
            rotation,
            no_sync,
            // The tz database lookup happens once, every timestamp reuses it.
            tz: TimeZone::system(),
        })
    }

    fn open_log(path: &Path) -> Result<RawFd> {
        open(
            path,
            OFlag::O_WRONLY | OFlag::O_APPEND | OFlag::O_CREAT | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o600),
        )
        .with_context(|| format!("open log file {}", path.display()))
    }

    #[cfg(test)]
    pub fn total_bytes_written(&self) -> i64 {
        self.total_bytes_written
    }

    /// Write every newline-separated line of `buf` as one record. The
    /// timestamp is computed once per buffer.
    pub fn write(&mut self, kind: StreamKind, buf: &[u8]) {
        if self.fd < 0 || buf.is_empty() {
            return;
        }

        let (ts_full, ts_partial) = k8s_timestamps(&self.tz, kind);
        let mut wv = WritevBuffer::new(self.fd);
        let mut rest = buf;

        while !rest.is_empty() {
            if self.max_total > 0 && self.total_bytes_written >= self.max_total {
                // Saturated, the remaining input is discarded.
                break;
            }

            let (line_len, partial) = line_len(rest);
            let line = &rest[..line_len];
            let ts: &[u8] = if partial { &ts_partial } else { &ts_full };
            let record_len = (ts.len() + line_len + usize::from(partial)) as i64;

            if self.max_per_file > 0 && self.bytes_in_file + record_len > self.max_per_file {
                wv.flush();
                if let Err(e) = self.rotate() {
                    // Keep writing to the current file, growing past the cap
                    // is preferred over losing records.
                    warn!("log rotation refused: {:#}", e);
                }
                wv = WritevBuffer::new(self.fd);
                if self.fd < 0 {
                    return;
                }
            }

            wv.push(ts);
            wv.push(line);
            if partial {
                wv.push(b"\n");
            }
            self.bytes_in_file += record_len;
            self.total_bytes_written += line_len as i64;
            rest = &rest[line_len..];
        }

        wv.flush();
    }

    fn rotate(&mut self) -> Result<()> {
        match self.rotation {
            RotationPolicy::Truncate => self.reopen(),
            RotationPolicy::Backup => self.rotate_backup(),
        }
    }

    /// Replace the log file with a freshly truncated one, atomically via a
    /// `.tmp` rename. Also serves the reopen-logs control event.
    pub fn reopen(&mut self) -> Result<()> {
        if self.fd >= 0 {
            if !self.no_sync {
                if let Err(e) = fsync(self.fd) {
                    warn!("failed to sync log file on reopen: {}", e);
                }
            }
            close(self.fd).ok();
            self.fd = -1;
        }

        let tmp = tmp_path(&self.path);
        let fd = open(
            &tmp,
            OFlag::O_WRONLY | OFlag::O_TRUNC | OFlag::O_CREAT | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o600),
        )
        .with_context(|| format!("open log file {}", tmp.display()))?;

        if let Err(e) = fs::rename(&tmp, &self.path) {
            close(fd).ok();
            return Err(e).context("rename log file");
        }

        self.fd = fd;
        self.bytes_in_file = 0;
        Ok(())
    }

    /// Shift `.N` backups up, move the current file to `.1` and continue on
    /// a fresh file. Refuses symlinked paths and concurrent writers.
    fn rotate_backup(&mut self) -> Result<()> {
        ensure_no_symlink_components(&self.path)?;

        // Another supervisor writing the same path holds the lock.
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = libc::F_WRLCK as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        fcntl(self.fd, FcntlArg::F_SETLK(&lock)).context("acquire rotation lock")?;

        if !self.no_sync {
            fsync(self.fd).ok();
        }

        // Stage the replacement before touching the backup chain.
        let tmp = tmp_path(&self.path);
        let new_fd = open(
            &tmp,
            OFlag::O_WRONLY | OFlag::O_TRUNC | OFlag::O_CREAT | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o600),
        )
        .context("open replacement log file")?;

        let backup = |n: u64| -> PathBuf {
            let mut os = self.path.as_os_str().to_os_string();
            os.push(format!(".{}", n));
            os.into()
        };
        let mut free = 1;
        while backup(free).exists() {
            free += 1;
        }
        for n in (1..free).rev() {
            if let Err(e) = fs::rename(backup(n), backup(n + 1)) {
                close(new_fd).ok();
                return Err(e).context("shift log backups");
            }
        }
        if let Err(e) = fs::rename(&self.path, backup(1)) {
            close(new_fd).ok();
            return Err(e).context("move current log to backup");
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            close(new_fd).ok();
            return Err(e).context("move replacement log in place");
        }

        close(self.fd).ok();
        self.fd = new_fd;
        self.bytes_in_file = 0;
        Ok(())
    }

    /// Sync the log file to disk, unless disabled.
    pub fn sync(&mut self) {
        if self.fd >= 0 && !self.no_sync {
            if let Err(e) = fsync(self.fd) {
                warn!("failed to sync log file before exit: {}", e);
            }
        }
    }
}

impl Drop for K8sFileWriter {
    fn drop(&mut self) {
        if self.fd >= 0 {
            close(self.fd).ok();
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    os.into()
}

/// Reject paths with a symlink anywhere in their components.
fn ensure_no_symlink_components(path: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if let Ok(meta) = fs::symlink_metadata(&current) {
            if meta.file_type().is_symlink() {
                bail!("log path component {} is a symlink", current.display());
            }
        }
    }
    Ok(())
}

/// Find the end of the line, or alternatively the end of the buffer.
/// The second value is true when the slice is a partial line.
fn line_len(buf: &[u8]) -> (usize, bool) {
    match buf.iter().position(|&b| b == b'\n') {
        Some(pos) => (pos + 1, false),
        None => (buf.len(), true),
    }
}

/// Render the `YYYY-MM-DDThh:mm:ss.<9-digit-ns><sign>HH:MM <stream> <tag> `
/// prefix once per input buffer, in both full and partial flavors.
fn k8s_timestamps(tz: &TimeZone, kind: StreamKind) -> (Vec<u8>, Vec<u8>) {
    let zoned = Timestamp::now().to_zoned(tz.clone());
    let offset = zoned.offset().seconds();
    let (sign, offset) = if offset < 0 {
        ('-', -offset)
    } else {
        ('+', offset)
    };
    let base = format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}{}{:02}:{:02} {} ",
        zoned.year(),
        zoned.month(),
        zoned.day(),
        zoned.hour(),
        zoned.minute(),
        zoned.second(),
        zoned.subsec_nanosecond(),
        sign,
        offset / 3600,
        (offset % 3600) / 60,
        kind.name(),
    );
    (
        format!("{}F ", base).into_bytes(),
        format!("{}P ", base).into_bytes(),
    )
}

/// Gathers record segments and flushes them with `writev`, retrying
/// `EINTR` and consuming partial writes.
struct WritevBuffer<'a> {
    fd: RawFd,
    segments: Vec<&'a [u8]>,
}

impl<'a> WritevBuffer<'a> {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            segments: Vec::with_capacity(WRITEV_BUFFER_N_IOV),
        }
    }

    fn push(&mut self, data: &'a [u8]) {
        if data.is_empty() {
            return;
        }
        if self.segments.len() == WRITEV_BUFFER_N_IOV {
            self.flush();
        }
        self.segments.push(data);
    }

    fn flush(&mut self) {
        while !self.segments.is_empty() {
            let iov = self
                .segments
                .iter()
                .map(|s| IoSlice::new(s))
                .collect::<Vec<_>>();
            let mut written = match writev(self.fd, &iov) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("failed to flush buffer to log: {}", e);
                    self.segments.clear();
                    return;
                }
            };
            let mut consumed = 0;
            while consumed < self.segments.len() && written >= self.segments[consumed].len() {
                written -= self.segments[consumed].len();
                consumed += 1;
            }
            self.segments.drain(..consumed);
            if written > 0 && !self.segments.is_empty() {
                self.segments[0] = &self.segments[0][written..];
            }
        }
    }
}

#[cfg(test)]
impl LogSinks {
    /// Sink set without any active driver, for tests of the callers.
    pub(crate) fn empty() -> Self {
        Self {
            k8s: None,
            journald: None,
            passthrough: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_path() -> Result<()> {
        struct Tc {
            input: &'static str,
            should_error: bool,
            expected: Option<Driver>,
        }
        let test_cases = vec![
            Tc {
                input: "/some/path",
                should_error: false,
                expected: Driver::K8sFile("/some/path".into()).into(),
            },
            Tc {
                input: "k8s-file:/some/path",
                should_error: false,
                expected: Driver::K8sFile("/some/path".into()).into(),
            },
            Tc {
                input: "journald:/some/path",
                should_error: false,
                expected: Driver::Journald.into(),
            },
            Tc {
                input: "journald",
                should_error: false,
                expected: Driver::Journald.into(),
            },
            Tc {
                input: "journald:",
                should_error: false,
                expected: Driver::Journald.into(),
            },
            Tc {
                input: "passthrough",
                should_error: false,
                expected: Driver::Passthrough.into(),
            },
            Tc {
                input: ":/some/path",
                should_error: true,
                expected: None,
            },
            Tc {
                input: "wrong:/some/path",
                should_error: true,
                expected: None,
            },
            Tc {
                input: "none",
                should_error: false,
                expected: Driver::None.into(),
            },
            Tc {
                input: "off",
                should_error: false,
                expected: Driver::Off.into(),
            },
            Tc {
                input: "null",
                should_error: false,
                expected: Driver::Null.into(),
            },
        ];
        for tc in test_cases {
            let res = LogSinks::parse_log_path(tc.input);
            if tc.should_error {
                assert!(res.is_err())
            } else {
                assert_eq!(res?, tc.expected.context("no driver provided")?)
            }
        }
        Ok(())
    }

    #[test]
    fn validate_log_labels() {
        assert!(validate_log_label("KEY=value").is_ok());
        assert!(validate_log_label("KEY_2=x=y").is_ok());
        assert!(validate_log_label("lower=value").is_err());
        assert!(validate_log_label("SPA CE=value").is_err());
        assert!(validate_log_label("novalue").is_err());
        assert!(validate_log_label("=value").is_err());
    }

    fn writer(dir: &tempfile::TempDir, max_per_file: i64, max_total: i64) -> K8sFileWriter {
        K8sFileWriter::new(
            dir.path().join("ctr.log"),
            max_per_file,
            max_total,
            RotationPolicy::Truncate,
            true,
        )
        .expect("create writer")
    }

    fn read_log(dir: &tempfile::TempDir) -> String {
        fs::read_to_string(dir.path().join("ctr.log")).expect("read log")
    }

    fn assert_timestamp(ts: &str) {
        // YYYY-MM-DDThh:mm:ss.nnnnnnnnn+HH:MM
        assert_eq!(ts.len(), 35, "timestamp length: {}", ts);
        let bytes = ts.as_bytes();
        assert_eq!(bytes[4], b'-');
        assert_eq!(bytes[7], b'-');
        assert_eq!(bytes[10], b'T');
        assert_eq!(bytes[13], b':');
        assert_eq!(bytes[16], b':');
        assert_eq!(bytes[19], b'.');
        assert!(bytes[29] == b'+' || bytes[29] == b'-');
        assert_eq!(bytes[32], b':');
    }

    #[test]
    fn k8s_full_line_format() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = writer(&dir, 0, 0);
        w.write(StreamKind::Stdout, b"hello\nworld\n");
        let content = read_log(&dir);
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        for (line, payload) in lines.iter().zip(["hello", "world"]) {
            let parts = line.splitn(4, ' ').collect::<Vec<_>>();
            assert_timestamp(parts[0]);
            assert_eq!(parts[1], "stdout");
            assert_eq!(parts[2], "F");
            assert_eq!(parts[3], payload);
        }
        assert_eq!(w.total_bytes_written(), 12);
        Ok(())
    }

    #[test]
    fn k8s_partial_line_format() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = writer(&dir, 0, 0);
        w.write(StreamKind::Stderr, b"abc");
        let content = read_log(&dir);
        assert!(content.ends_with(" stderr P abc\n"), "got: {}", content);
        Ok(())
    }

    #[test]
    fn k8s_rotation_truncate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // Every record is 35 + 10 + 10 = 55 bytes, two fit per file.
        let mut w = writer(&dir, 120, 0);
        for _ in 0..10 {
            w.write(StreamKind::Stdout, b"123456789\n");
        }
        let len = fs::metadata(dir.path().join("ctr.log"))?.len();
        assert!(len <= 120, "file too large: {}", len);
        assert_eq!(w.total_bytes_written(), 100);
        // No record spans a rotation boundary.
        for line in read_log(&dir).lines() {
            assert!(line.ends_with("123456789"));
        }
        Ok(())
    }

    #[test]
    fn k8s_global_cap_discards() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = writer(&dir, 0, 10);
        w.write(StreamKind::Stdout, b"0123456789\n");
        w.write(StreamKind::Stdout, b"dropped\n");
        let content = read_log(&dir);
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("0123456789"));
        assert!(!content.contains("dropped"));
        Ok(())
    }

    #[test]
    fn k8s_reopen_truncates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = writer(&dir, 0, 0);
        w.write(StreamKind::Stdout, b"before\n");
        assert!(!read_log(&dir).is_empty());
        w.reopen()?;
        assert!(read_log(&dir).is_empty());
        w.write(StreamKind::Stdout, b"after\n");
        assert!(read_log(&dir).contains("after"));
        Ok(())
    }

    #[test]
    fn k8s_rotation_backup_keeps_bytes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = K8sFileWriter::new(
            dir.path().join("ctr.log"),
            120,
            0,
            RotationPolicy::Backup,
            true,
        )?;
        for _ in 0..6 {
            w.write(StreamKind::Stdout, b"123456789\n");
        }
        // Current file plus rotated remnants carry every emitted byte.
        let mut total = fs::metadata(dir.path().join("ctr.log"))?.len();
        let mut n = 1;
        loop {
            let backup = dir.path().join(format!("ctr.log.{}", n));
            match fs::metadata(&backup) {
                Ok(meta) => total += meta.len(),
                Err(_) => break,
            }
            n += 1;
        }
        assert!(n > 1, "no backups created");
        assert_eq!(total, 6 * 55);
        Ok(())
    }

    #[test]
    fn symlink_components_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let real = dir.path().join("real");
        fs::create_dir(&real)?;
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link)?;
        assert!(ensure_no_symlink_components(&link.join("ctr.log")).is_err());
        assert!(ensure_no_symlink_components(&real.join("ctr.log")).is_ok());
        Ok(())
    }
}
