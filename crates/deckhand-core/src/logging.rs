//! Per-agent transcript files.
//!
//! When a log directory is configured, every raw line an agent produces is
//! appended to `{log_dir}/{agent_id}.log` as `[timestamp] STREAM: line`.
//! Write failures are ignored.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

/// Thread-safe handle to an append-only transcript.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Current UTC time as ISO 8601 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Write a timestamped line to the transcript (if open).
pub fn log_line(handle: &LogHandle, stream: &str, data: &str) {
    let mut guard = handle.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(ref mut file) = *guard {
        let _ = writeln!(file, "[{}] {}: {}", utc_timestamp(), stream, data);
        let _ = file.flush();
    }
}

/// Open (or create) `{log_dir}/{log_id}.log`. Without a directory, or if the
/// file cannot be opened, the handle is empty and writes are no-ops.
pub fn open_log_file(log_dir: Option<&Path>, log_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", log_id)))
            .map_err(|e| log::warn!("Cannot open transcript for {}: {}", log_id, e))
            .ok()
    });
    Arc::new(Mutex::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn utc_timestamp_format() {
        let ts = utc_timestamp();
        // YYYY-MM-DDTHH:MM:SS.mmmZ
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 24);
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn open_log_file_creates_nested_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("transcripts");

        let handle = open_log_file(Some(&nested), "agent-1");
        assert!(handle.lock().unwrap().is_some());
        assert!(nested.join("agent-1.log").exists());
    }

    #[test]
    fn no_dir_means_no_file() {
        let handle = open_log_file(None, "agent-1");
        assert!(handle.lock().unwrap().is_none());
        log_line(&handle, "STDOUT", "dropped");
    }

    #[test]
    fn lines_are_appended_across_handles() {
        let dir = tempdir().unwrap();

        let first = open_log_file(Some(dir.path()), "agent-2");
        log_line(&first, "STDOUT", "hello world");
        drop(first);
        let second = open_log_file(Some(dir.path()), "agent-2");
        log_line(&second, "STDERR", "boom");

        let contents = std::fs::read_to_string(dir.path().join("agent-2.log")).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] STDOUT: hello world"));
        assert!(lines[1].ends_with("] STDERR: boom"));
    }
}
