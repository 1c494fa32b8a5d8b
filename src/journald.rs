//! Journal log driver: every newline-terminated container line becomes one
//! structured journal record, partial lines are buffered per stream until a
//! newline or an explicit flush arrives.

use crate::stdio::{StreamKind, STDIO_BUF_SIZE};
use anyhow::{bail, Result};
use libsystemd::logging::{journal_send, Priority};
use log::warn;

const TRUNC_ID_LEN: usize = 12;

/// A record ready for submission to the journal.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct JournalRecord {
    pub priority: u8,
    pub message: Vec<u8>,
    pub partial: bool,
}

/// Journal driver state: the constant field set plus the per-stream
/// partial-line buffers.
pub(crate) struct JournaldWriter {
    fields: Vec<(String, String)>,
    mark_partials: bool,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
}

impl JournaldWriter {
    /// Build the constant per-container field set. The container ID must be
    /// long enough to derive the truncated `CONTAINER_ID`.
    pub fn new(
        cuuid: &str,
        name: Option<&str>,
        tag: Option<&str>,
        labels: &[String],
        mark_partials: bool,
    ) -> Result<Self> {
        if cuuid.len() <= TRUNC_ID_LEN {
            bail!("container ID must be longer than {} characters", TRUNC_ID_LEN);
        }
        let short_cuuid = truncate(cuuid, TRUNC_ID_LEN);

        let mut fields = vec![
            ("CONTAINER_ID_FULL".into(), cuuid.into()),
            ("CONTAINER_ID".into(), short_cuuid.into()),
        ];
        if let Some(tag) = tag {
            fields.push(("CONTAINER_TAG".into(), tag.into()));
        }
        if let Some(name) = name {
            fields.push(("CONTAINER_NAME".into(), name.into()));
        }
        for label in labels {
            let (key, value) = label
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .unwrap_or_else(|| (label.clone(), String::new()));
            fields.push((key, value));
        }
        let identifier = tag.or(name).unwrap_or(short_cuuid);
        fields.push(("SYSLOG_IDENTIFIER".into(), identifier.into()));

        Ok(Self {
            fields,
            mark_partials,
            stdout_buf: vec![],
            stderr_buf: vec![],
        })
    }

    /// Publish container output. A zero-length `buf` flushes any buffered
    /// partial line of that stream as a partial record.
    pub fn write(&mut self, kind: StreamKind, buf: &[u8]) {
        for record in self.build_records(kind, buf) {
            self.emit(&record);
        }
    }

    fn stream_buf(&mut self, kind: StreamKind) -> &mut Vec<u8> {
        match kind {
            StreamKind::Stderr => &mut self.stderr_buf,
            _ => &mut self.stdout_buf,
        }
    }

    /// Cut `buf` into records, consulting and updating the stream's
    /// partial-line buffer.
    fn build_records(&mut self, kind: StreamKind, buf: &[u8]) -> Vec<JournalRecord> {
        let default_priority = if kind == StreamKind::Stderr { 3 } else { 6 };
        let mut records = vec![];
        let pending = self.stream_buf(kind);

        if buf.is_empty() {
            if !pending.is_empty() {
                records.push(new_record(
                    std::mem::take(pending),
                    default_priority,
                    true,
                ));
            }
            return records;
        }

        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let mut message = std::mem::take(pending);
            message.extend_from_slice(&rest[..pos]);
            records.push(new_record(message, default_priority, false));
            rest = &rest[pos + 1..];
        }

        if !rest.is_empty() {
            // Flush oversized partials, buffer the remainder.
            while pending.len() + rest.len() > STDIO_BUF_SIZE {
                let fit = STDIO_BUF_SIZE - pending.len();
                let mut message = std::mem::take(pending);
                message.extend_from_slice(&rest[..fit]);
                records.push(new_record(message, default_priority, true));
                rest = &rest[fit..];
            }
            pending.extend_from_slice(rest);
        }
        records
    }

    fn emit(&self, record: &JournalRecord) {
        let message = String::from_utf8_lossy(&record.message);
        let partial_field = ("CONTAINER_PARTIAL_MESSAGE".to_string(), "true".to_string());
        let vars = self
            .fields
            .iter()
            .chain((record.partial && self.mark_partials).then(|| &partial_field))
            .map(|(k, v)| (k.as_str(), v.as_str()));

        if let Err(e) = journal_send(priority_from(record.priority), &message, vars) {
            warn!("write to journald failed: {}", e);
        }
    }

    /// Flush a buffered partial line of `kind`.
    pub fn flush(&mut self, kind: StreamKind) {
        self.write(kind, &[]);
    }
}

/// Build a record, honoring a leading `<N>` syslog-style priority prefix
/// which overrides the stream default and is stripped from the payload.
fn new_record(mut message: Vec<u8>, default_priority: u8, partial: bool) -> JournalRecord {
    let mut priority = default_priority;
    if message.len() >= 3 && message[0] == b'<' && message[2] == b'>' && message[1].is_ascii_digit()
    {
        let level = message[1] - b'0';
        if level <= 7 {
            priority = level;
            message.drain(..3);
        }
    }
    JournalRecord {
        priority,
        message,
        partial,
    }
}

fn priority_from(level: u8) -> Priority {
    match level {
        0 => Priority::Emergency,
        1 => Priority::Alert,
        2 => Priority::Critical,
        3 => Priority::Error,
        4 => Priority::Warning,
        5 => Priority::Notice,
        7 => Priority::Debug,
        _ => Priority::Info,
    }
}

/// Truncate a string slice to at most `max_chars` characters.
fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        None => s,
        Some((idx, _)) => &s[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> JournaldWriter {
        JournaldWriter::new("0123456789abcdef", None, None, &[], true).expect("create writer")
    }

    #[test]
    fn requires_long_container_id() {
        assert!(JournaldWriter::new("tooshort", None, None, &[], true).is_err());
    }

    #[test]
    fn field_set_precedence() -> Result<()> {
        let w = JournaldWriter::new(
            "0123456789abcdef",
            Some("name"),
            Some("tag"),
            &["FOO=bar".into()],
            true,
        )?;
        let get = |key: &str| {
            w.fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("CONTAINER_ID_FULL").as_deref(), Some("0123456789abcdef"));
        assert_eq!(get("CONTAINER_ID").as_deref(), Some("0123456789ab"));
        assert_eq!(get("CONTAINER_NAME").as_deref(), Some("name"));
        assert_eq!(get("CONTAINER_TAG").as_deref(), Some("tag"));
        assert_eq!(get("FOO").as_deref(), Some("bar"));
        // Tag wins over name and short id.
        assert_eq!(get("SYSLOG_IDENTIFIER").as_deref(), Some("tag"));
        Ok(())
    }

    #[test]
    fn full_lines_become_full_records() {
        let mut w = writer();
        let records = w.build_records(StreamKind::Stdout, b"hello\nworld\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, b"hello");
        assert_eq!(records[1].message, b"world");
        assert!(records.iter().all(|r| !r.partial && r.priority == 6));
    }

    #[test]
    fn partial_lines_are_buffered_until_newline() {
        let mut w = writer();
        assert!(w.build_records(StreamKind::Stderr, b"abc").is_empty());
        let records = w.build_records(StreamKind::Stderr, b"def\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, b"abcdef");
        assert_eq!(records[0].priority, 3);
        assert!(!records[0].partial);
    }

    #[test]
    fn flush_emits_partial_record() {
        let mut w = writer();
        assert!(w.build_records(StreamKind::Stderr, b"abc").is_empty());
        let records = w.build_records(StreamKind::Stderr, b"");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, b"abc");
        assert!(records[0].partial);
    }

    #[test]
    fn oversized_partial_is_split() {
        let mut w = writer();
        let big = vec![b'x'; STDIO_BUF_SIZE + 10];
        let records = w.build_records(StreamKind::Stdout, &big);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message.len(), STDIO_BUF_SIZE);
        assert!(records[0].partial);
        assert_eq!(w.stdout_buf.len(), 10);
    }

    #[test]
    fn priority_prefix_overrides_and_strips() {
        let mut w = writer();
        let records = w.build_records(StreamKind::Stdout, b"<2>critical\n<9>not a level\n");
        assert_eq!(records[0].priority, 2);
        assert_eq!(records[0].message, b"critical");
        assert_eq!(records[1].priority, 6);
        assert_eq!(records[1].message, b"<9>not a level");
    }

    #[test]
    fn stream_reconstruction() {
        // Concatenating MESSAGE payloads plus newlines for full records
        // reproduces the container output.
        let mut w = writer();
        let mut records = w.build_records(StreamKind::Stdout, b"one\ntwo");
        records.extend(w.build_records(StreamKind::Stdout, b" half\n"));
        records.extend(w.build_records(StreamKind::Stdout, b"tail"));
        records.extend(w.build_records(StreamKind::Stdout, b""));

        let mut reconstructed = vec![];
        for r in &records {
            reconstructed.extend_from_slice(&r.message);
            if !r.partial {
                reconstructed.push(b'\n');
            }
        }
        assert_eq!(reconstructed, b"one\ntwo half\ntail");
    }
}
