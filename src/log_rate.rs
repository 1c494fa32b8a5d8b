//! Rate enforcement in front of the log sinks.
//!
//! The gate meters container output per one-second period before it reaches
//! the log writers. Console clients are not affected.

use crate::{container_logging::LogSinks, stdio::StreamKind};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    str::FromStr,
    time::{Duration, Instant},
};
use strum::{AsRefStr, EnumString};

const SECS_PER_PERIOD: Duration = Duration::from_secs(1);

/// Writes to the sinks are chunked so a single oversized buffer cannot
/// monopolize one period.
const IO_BUF_SIZE: usize = 65536;

/// What to do with output that exceeds the configured rate.
#[derive(AsRefStr, Clone, Copy, Debug, Deserialize, EnumString, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Sleep out the remainder of the period, back-pressuring the container.
    Backpressure,

    /// Discard output until the period ends.
    Drop,

    /// Discard all output.
    Ignore,

    /// No rate enforcement.
    Passthrough,
}

/// Parse a byte rate with an optional binary `K`/`M`/`G`/`T` suffix.
pub(crate) fn parse_rate_limit(input: &str) -> Result<u64> {
    let (digits, suffix) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => input.split_at(idx),
        None => (input, ""),
    };
    let unscaled = u64::from_str(digits).context("parse rate limit")?;
    let scale: u64 = match suffix {
        "" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        "T" => 1024 * 1024 * 1024 * 1024,
        _ => bail!("invalid rate limit suffix '{}'", suffix),
    };
    Ok(unscaled * scale)
}

/// Period state for the rate gate.
pub(crate) struct LogRate {
    policy: Policy,
    bytes_per_period: u64,
    written_this_period: u64,
    period_start: Instant,
    dropping: bool,
    drop_until: Instant,
}

impl LogRate {
    pub fn new(policy: Policy, bytes_per_period: u64) -> Self {
        let now = Instant::now();
        Self {
            // A policy without a limit cannot meter anything.
            policy: if bytes_per_period == 0 {
                Policy::Passthrough
            } else {
                policy
            },
            bytes_per_period,
            written_this_period: 0,
            period_start: now,
            dropping: false,
            drop_until: now,
        }
    }

    /// Pass `buf` to the sinks, enforcing the policy. Zero-length writes are
    /// flush requests and always pass through.
    pub fn write(&mut self, sinks: &mut LogSinks, kind: StreamKind, buf: &[u8]) {
        if buf.is_empty() {
            sinks.write(kind, buf);
            return;
        }
        match self.policy {
            Policy::Passthrough => {
                write_chunked(sinks, kind, buf);
                return;
            }
            Policy::Ignore => return,
            Policy::Drop if self.dropping => {
                if Instant::now() < self.drop_until {
                    return;
                }
                self.dropping = false;
                self.start_new_period();
            }
            _ => {}
        }

        let mut rest = buf;
        if Instant::now().duration_since(self.period_start) < SECS_PER_PERIOD {
            let writable = (self.bytes_per_period - self.written_this_period) as usize;
            if rest.len() <= writable {
                write_chunked(sinks, kind, rest);
                self.written_this_period += rest.len() as u64;
                return;
            }
            write_chunked(sinks, kind, &rest[..writable]);
            self.written_this_period += writable as u64;
            rest = &rest[writable..];
            if self.finish_period() {
                return;
            }
            self.start_new_period();
        } else {
            self.start_new_period();
        }

        let period = self.bytes_per_period as usize;
        while rest.len() >= period {
            write_chunked(sinks, kind, &rest[..period]);
            rest = &rest[period..];
            if self.finish_period() {
                return;
            }
            self.start_new_period();
        }
        if !rest.is_empty() {
            write_chunked(sinks, kind, rest);
            self.written_this_period += rest.len() as u64;
        }
    }

    /// Spend the remainder of the current period. Returns true when the
    /// policy decided to drop instead of wait.
    fn finish_period(&mut self) -> bool {
        if self.policy == Policy::Drop {
            self.dropping = true;
            self.drop_until = self.period_start + SECS_PER_PERIOD;
            return true;
        }
        let elapsed = Instant::now().duration_since(self.period_start);
        if let Some(sleep) = SECS_PER_PERIOD.checked_sub(elapsed) {
            std::thread::sleep(sleep);
        }
        false
    }

    fn start_new_period(&mut self) {
        self.written_this_period = 0;
        self.period_start = Instant::now();
    }
}

fn write_chunked(sinks: &mut LogSinks, kind: StreamKind, buf: &[u8]) {
    for chunk in buf.chunks(IO_BUF_SIZE) {
        sinks.write(kind, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rate_limits() -> Result<()> {
        struct Tc {
            input: &'static str,
            should_error: bool,
            expected: u64,
        }
        let test_cases = vec![
            Tc {
                input: "1024",
                should_error: false,
                expected: 1024,
            },
            Tc {
                input: "10K",
                should_error: false,
                expected: 10 * 1024,
            },
            Tc {
                input: "2M",
                should_error: false,
                expected: 2 * 1024 * 1024,
            },
            Tc {
                input: "1G",
                should_error: false,
                expected: 1024 * 1024 * 1024,
            },
            Tc {
                input: "1T",
                should_error: false,
                expected: 1024u64 * 1024 * 1024 * 1024,
            },
            Tc {
                input: "10X",
                should_error: true,
                expected: 0,
            },
            Tc {
                input: "X",
                should_error: true,
                expected: 0,
            },
        ];
        for tc in test_cases {
            let res = parse_rate_limit(tc.input);
            if tc.should_error {
                assert!(res.is_err());
            } else {
                assert_eq!(res?, tc.expected);
            }
        }
        Ok(())
    }

    #[test]
    fn parse_policies() -> Result<()> {
        assert_eq!(Policy::from_str("backpressure")?, Policy::Backpressure);
        assert_eq!(Policy::from_str("drop")?, Policy::Drop);
        assert_eq!(Policy::from_str("ignore")?, Policy::Ignore);
        assert_eq!(Policy::from_str("passthrough")?, Policy::Passthrough);
        assert!(Policy::from_str("unknown").is_err());
        Ok(())
    }

    #[test]
    fn zero_limit_means_passthrough() {
        let rate = LogRate::new(Policy::Drop, 0);
        assert_eq!(rate.policy, Policy::Passthrough);
    }
}
