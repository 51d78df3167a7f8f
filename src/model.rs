//! Log and error records kept by a runtime supervisor.
//!
//! Entries are immutable once created. Log entries carry a monotonic ULID so
//! consumers can tell which lines they have already seen, even after the
//! sequence has been cleared and refilled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strip_ansi_escapes::strip;
use ulid::Ulid;

/// Classification of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Output from stderr or a supervisor failure notice.
    Error,
    /// Regular output.
    Normal,
    /// A line that was cut to the configured maximum length.
    Truncation,
}

/// A single log line recorded by a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Ulid,
    pub created_at: DateTime<Utc>,
    pub message: String,
    pub kind: LogKind,
}

/// Origin of an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Reported by the spawn actor during startup or while running.
    Runtime,
    /// Handed to the supervisor by an outside observer.
    Saved,
}

/// A startup or runtime failure kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub created_at: DateTime<Utc>,
    pub message: String,
    pub kind: ErrorKind,
}

impl ErrorEntry {
    /// Builds an entry, prefixing the message with the failing command when known.
    pub fn new(
        kind: ErrorKind,
        message: &str,
        command: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let message = match command {
            Some(command) => format!("{}: {}", command, message),
            None => message.to_string(),
        };
        Self {
            created_at,
            message,
            kind,
        }
    }
}

/// Strips ANSI escape codes. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Cuts `line` to at most `max_chars` characters.
///
/// Returns the (possibly shortened) line and whether anything was removed.
pub fn truncate_line(line: &str, max_chars: usize) -> (String, bool) {
    match line.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (format!("{}… (truncated)", &line[..byte_idx]), true),
        None => (line.to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_entry_prefixes_command() {
        let now = Utc::now();
        let entry = ErrorEntry::new(ErrorKind::Runtime, "exit 1", Some("pnpm install"), now);
        assert_eq!(entry.message, "pnpm install: exit 1");
        let entry = ErrorEntry::new(ErrorKind::Saved, "boom", None, now);
        assert_eq!(entry.message, "boom");
    }

    #[test]
    fn sanitize_removes_color_codes() {
        assert_eq!(sanitize_text("\x1b[32mready\x1b[0m in 20ms"), "ready in 20ms");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let (line, cut) = truncate_line("héllo world", 5);
        assert!(cut);
        assert_eq!(line, "héllo… (truncated)");

        let (line, cut) = truncate_line("short", 5);
        assert!(!cut);
        assert_eq!(line, "short");
    }
}
