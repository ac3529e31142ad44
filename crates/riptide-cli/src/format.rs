//! Terminal output for reports, summaries and stream entries.
//!
//! Keys and values come straight from a store, so anything printed is
//! passed through [`sanitize`] first.

use colored::Colorize;
use riptide_core::{
    KeyComparison, KeyspaceComparison, ReplicationSummary, Status, StreamMessage,
};

/// Strips ANSI escape sequences and other control characters from
/// store-supplied strings so they can't manipulate the terminal.
/// Retains printable characters, tabs and newlines.
pub fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if let Some('[') = chars.next() {
                // CSI sequence: consume until the final letter
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if ch == '\t' || ch == '\n' || !ch.is_control() {
            out.push(ch);
        }
    }
    out
}

/// Quoted text for UTF-8 data, hex otherwise.
pub fn display_bytes(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(s) => format!("\"{}\"", sanitize(s)),
        Err(_) => data.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

fn paint(status: Status, text: &str) -> String {
    match status {
        Status::Ok => text.green().to_string(),
        Status::Inconclusive => text.yellow().to_string(),
        _ => text.red().to_string(),
    }
}

fn ttl(ttl: Option<i64>) -> String {
    ttl.map_or_else(|| "none".to_string(), |t| t.to_string())
}

/// One line explaining why a key didn't match.
pub fn describe(cmp: &KeyComparison) -> String {
    let key = display_bytes(&cmp.key);
    let detail = match (cmp.status, &cmp.source, &cmp.target) {
        (Status::Inconclusive, _, _) => cmp.error.clone().unwrap_or_default(),
        (Status::Type, Some(s), Some(t)) => format!("{} vs {}", s.data_type, t.data_type),
        (Status::Ttl, Some(s), Some(t)) => format!("{} vs {}", ttl(s.ttl), ttl(t.ttl)),
        _ => String::new(),
    };
    let status = paint(cmp.status, cmp.status.as_str());
    if detail.is_empty() {
        format!("{key} {status}")
    } else {
        format!("{key} {status} {}", sanitize(&detail))
    }
}

/// Counts per status, then up to `show` mismatching keys.
pub fn format_report(report: &KeyspaceComparison, show: usize) -> String {
    let mut lines = vec![format!("compared {} keys", report.total())];
    for status in Status::ALL {
        let n = report.count(status);
        if n > 0 || status == Status::Ok {
            let label = format!("{:<13}", status.as_str());
            lines.push(format!("  {} {n}", paint(status, &label)));
        }
    }
    for (i, cmp) in report.mismatches.iter().take(show).enumerate() {
        if i == 0 {
            lines.push("mismatches:".to_string());
        }
        lines.push(format!("{}) {}", i + 1, describe(cmp)));
    }
    if report.mismatches.len() > show {
        let more = report.mismatches.len() - show;
        lines.push(format!("... and {more} more").dimmed().to_string());
    }
    for e in &report.errors {
        lines.push(format!("{} {e}", "(error)".red()));
    }
    lines.join("\n")
}

pub fn format_summary(summary: &ReplicationSummary) -> String {
    let mut lines = vec![format!(
        "read {}, written {}, deleted {}, skipped {}",
        summary.read,
        summary.written.to_string().green(),
        summary.deleted,
        summary.skipped
    )];
    for failure in &summary.failures {
        lines.push(format!("{} {}", "(error)".red(), sanitize(failure).red()));
    }
    lines.join("\n")
}

/// `id field="value" ...`
pub fn format_message(msg: &StreamMessage) -> String {
    let fields: Vec<String> = msg
        .fields
        .iter()
        .map(|(f, v)| format!("{}={}", sanitize(&String::from_utf8_lossy(f)), display_bytes(v)))
        .collect();
    format!("{} {}", sanitize(&msg.id).yellow(), fields.join(" "))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use riptide_core::{KeyValue, Value};

    use super::*;

    // colors stay off for every test in this module; the override is
    // process-wide, so it is never switched back on
    fn no_color<F: FnOnce() -> String>(f: F) -> String {
        colored::control::set_override(false);
        f()
    }

    fn comparison(status: Status, source: KeyValue, target: KeyValue) -> KeyComparison {
        KeyComparison {
            key: source.key.clone(),
            source: Some(source),
            target: Some(target),
            status,
            error: None,
        }
    }

    #[test]
    fn sanitize_strips_escapes_and_controls() {
        assert_eq!(sanitize("hello\x1b[31mworld\x1b[0m"), "helloworld");
        assert_eq!(sanitize("a\x07b\tc"), "ab\tc");
    }

    #[test]
    fn binary_keys_print_as_hex() {
        assert_eq!(display_bytes(b"user:1"), "\"user:1\"");
        assert_eq!(display_bytes(&[0xff, 0x00]), "ff00");
    }

    #[test]
    fn describes_ttl_and_type_drift() {
        let s = KeyValue::new("k", Value::String(Bytes::from_static(b"v"))).with_ttl(1_000);
        let t = KeyValue::new("k", Value::String(Bytes::from_static(b"v")));
        let out = no_color(|| describe(&comparison(Status::Ttl, s.clone(), t)));
        assert_eq!(out, "\"k\" ttl 1000 vs none");

        let list = KeyValue::new("k", Value::List(vec![Bytes::from_static(b"v")]));
        let out = no_color(|| describe(&comparison(Status::Type, s, list)));
        assert_eq!(out, "\"k\" type string vs list");
    }

    #[test]
    fn report_lists_limited_mismatches() {
        let mut report = KeyspaceComparison::default();
        report.counts.insert(Status::Ok, 7);
        report.counts.insert(Status::Missing, 3);
        for key in ["a", "b", "c"] {
            let src = KeyValue::new(key, Value::String(Bytes::from_static(b"v")));
            report
                .mismatches
                .push(comparison(Status::Missing, src, KeyValue::missing(key)));
        }
        let out = no_color(|| format_report(&report, 2));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "compared 10 keys");
        assert_eq!(lines[1].split_whitespace().collect::<Vec<_>>(), ["ok", "7"]);
        assert_eq!(lines[2].split_whitespace().collect::<Vec<_>>(), ["missing", "3"]);
        assert_eq!(lines[3], "mismatches:");
        assert_eq!(lines[4], "1) \"a\" missing");
        assert_eq!(lines[6], "... and 1 more");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn summary_and_messages() {
        let summary = ReplicationSummary {
            read: 5,
            written: 4,
            deleted: 1,
            skipped: 0,
            failures: vec!["2 keys: timed out".into()],
        };
        let out = no_color(|| format_summary(&summary));
        assert_eq!(out, "read 5, written 4, deleted 1, skipped 0\n(error) 2 keys: timed out");

        let msg = StreamMessage::new(
            "1-1",
            vec![(Bytes::from_static(b"amount"), Bytes::from_static(b"12"))],
        );
        assert_eq!(no_color(|| format_message(&msg)), "1-1 amount=\"12\"");
    }
}
