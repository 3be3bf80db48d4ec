//! Output parser for the CLI's stream-json output.
//!
//! Raw chunks arrive from the process in arbitrary sizes. [`LineSplitter`]
//! reassembles them into lines, and [`decode_line`] turns each line into an
//! [`OutputRecord`]. Decoding never fails: anything that is not a recognized
//! JSON record comes back as [`OutputRecord::Unrecognized`].

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Phrases the assistant uses when it stops to ask for a human decision.
static APPROVAL_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(do you approve this plan|approve this plan\?|awaiting approval|needs approval)")
        .unwrap()
});

/// Reassembles byte chunks into lines.
///
/// Splits on `\n`, `\r\n` and a lone `\r`. A `\r` that ends one chunk and a
/// `\n` that starts the next are treated as a single line break. Blank lines
/// are dropped; the rest are decoded as lossy UTF-8 so that a multi-byte
/// character split across chunks survives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
    pending_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut bytes = chunk.iter().copied().peekable();

        if self.pending_cr && bytes.peek() == Some(&b'\n') {
            bytes.next();
        }
        self.pending_cr = false;

        while let Some(b) = bytes.next() {
            match b {
                b'\n' => self.take_line(&mut lines),
                b'\r' => {
                    match bytes.peek() {
                        Some(b'\n') => {
                            bytes.next();
                        }
                        None => self.pending_cr = true,
                        Some(_) => {}
                    }
                    self.take_line(&mut lines);
                }
                _ => self.buffer.push(b),
            }
        }

        lines
    }

    /// Return whatever partial line is left. Call when the stream ends.
    pub fn flush(&mut self) -> Option<String> {
        self.pending_cr = false;
        let mut lines = Vec::with_capacity(1);
        self.take_line(&mut lines);
        lines.pop()
    }

    fn take_line(&mut self, out: &mut Vec<String>) {
        let bytes = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&bytes);
        if !line.trim().is_empty() {
            out.push(line.into_owned());
        }
    }
}

/// A decoded output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRecord {
    /// `{"type":"assistant","message":{"content":[...]}}`; `text` is the
    /// text blocks joined with newlines.
    Assistant {
        session_id: Option<String>,
        text: String,
    },
    /// `{"type":"result","result":"..."}`
    Result {
        session_id: Option<String>,
        text: String,
    },
    /// Any other JSON object that carries a session id.
    Session { session_id: String },
    /// Not JSON, or JSON we have no use for.
    Unrecognized,
}

impl OutputRecord {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            OutputRecord::Assistant { session_id, .. } | OutputRecord::Result { session_id, .. } => {
                session_id.as_deref()
            }
            OutputRecord::Session { session_id } => Some(session_id),
            OutputRecord::Unrecognized => None,
        }
    }

    /// Text to test against the approval pattern, if this record has any.
    pub fn candidate_text(&self) -> Option<&str> {
        match self {
            OutputRecord::Assistant { text, .. } | OutputRecord::Result { text, .. } => {
                Some(text.as_str()).filter(|t| !t.is_empty())
            }
            _ => None,
        }
    }

    /// Whether this record asks a human to approve before continuing.
    pub fn requests_approval(&self) -> bool {
        self.candidate_text().is_some_and(is_approval_request)
    }
}

/// Loosely typed line as the CLI emits it. Fields are probed, never required.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type", default)]
    record_type: Option<Value>,
    #[serde(default)]
    session_id: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(rename = "type", default)]
    block_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// Decode one raw output line.
pub fn decode_line(line: &str) -> OutputRecord {
    let clean = strip_ansi(line);
    let raw: RawRecord = match serde_json::from_str(clean.trim()) {
        Ok(raw) => raw,
        Err(_) => return OutputRecord::Unrecognized,
    };

    let session_id = raw
        .session_id
        .as_ref()
        .and_then(Value::as_str)
        .map(str::to_string);

    match raw.record_type.as_ref().and_then(Value::as_str) {
        Some("assistant") => {
            let text = raw
                .message
                .and_then(|m| serde_json::from_value::<RawMessage>(m).ok())
                .map(|m| {
                    m.content
                        .into_iter()
                        .filter(|b| b.block_type.as_deref() == Some("text"))
                        .filter_map(|b| b.text)
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            OutputRecord::Assistant { session_id, text }
        }
        Some("result") => {
            let text = raw
                .result
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            OutputRecord::Result { session_id, text }
        }
        _ => match session_id {
            Some(session_id) => OutputRecord::Session { session_id },
            None => OutputRecord::Unrecognized,
        },
    }
}

/// Case-insensitive match against the approval-request phrases.
pub fn is_approval_request(text: &str) -> bool {
    APPROVAL_REQUEST.is_match(text)
}

/// Remove ANSI escape sequences (CSI, OSC and two-byte escapes).
///
/// Pseudo-terminal output can carry these even with color disabled; they
/// would otherwise break JSON decoding of an otherwise valid line.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('[') => {
                // Parameter and intermediate bytes, then one final byte.
                while let Some(&p) = chars.peek() {
                    chars.next();
                    if ('\u{40}'..='\u{7e}').contains(&p) {
                        break;
                    }
                }
            }
            Some(']') => {
                // Until BEL or ESC \
                while let Some(p) = chars.next() {
                    if p == '\u{07}' {
                        break;
                    }
                    if p == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    mod line_splitter {
        use super::*;

        #[test]
        fn splits_every_newline_style() {
            let mut splitter = LineSplitter::new();
            let lines = splitter.feed(b"one\ntwo\r\nthree\rfour\n");
            assert_eq!(lines, vec!["one", "two", "three", "four"]);
        }

        #[test]
        fn buffers_partial_lines() {
            let mut splitter = LineSplitter::new();
            assert!(splitter.feed(br#"{"type":"res"#).is_empty());
            assert!(splitter.feed(br#"ult"}"#).is_empty());
            assert_eq!(splitter.feed(b"\n"), vec![r#"{"type":"result"}"#]);
        }

        #[test]
        fn crlf_split_across_chunks_is_one_break() {
            let mut splitter = LineSplitter::new();
            assert_eq!(splitter.feed(b"first\r"), vec!["first"]);
            assert_eq!(splitter.feed(b"\nsecond\n"), vec!["second"]);
        }

        #[test]
        fn drops_blank_lines() {
            let mut splitter = LineSplitter::new();
            assert_eq!(splitter.feed(b"\n\n  \nx\n\r\n"), vec!["x"]);
        }

        #[test]
        fn multibyte_char_split_across_chunks() {
            let mut splitter = LineSplitter::new();
            let text = "héllo\n".as_bytes();
            assert!(splitter.feed(&text[..2]).is_empty());
            assert_eq!(splitter.feed(&text[2..]), vec!["héllo"]);
        }

        #[test]
        fn flush_returns_trailing_line() {
            let mut splitter = LineSplitter::new();
            splitter.feed(b"done\npartial");
            assert_eq!(splitter.flush().as_deref(), Some("partial"));
            assert_eq!(splitter.flush(), None);
        }
    }

    mod decode {
        use super::*;

        #[test]
        fn bare_session_record() {
            let record = decode_line(r#"{"session_id":"abc123"}"#);
            assert_eq!(
                record,
                OutputRecord::Session {
                    session_id: "abc123".into()
                }
            );
            assert_eq!(record.session_id(), Some("abc123"));
        }

        #[test]
        fn assistant_text_blocks_are_joined() {
            let line = r#"{"type":"assistant","session_id":"s1","message":{"content":[{"type":"text","text":"First"},{"type":"tool_use","name":"Bash"},{"type":"text","text":"Second"}]}}"#;
            let record = decode_line(line);
            assert_eq!(record.session_id(), Some("s1"));
            assert_eq!(record.candidate_text(), Some("First\nSecond"));
        }

        #[test]
        fn assistant_with_string_content_keeps_session() {
            let line = r#"{"type":"assistant","session_id":"s2","message":{"content":"plain"}}"#;
            let record = decode_line(line);
            assert_eq!(record.session_id(), Some("s2"));
            assert_eq!(record.candidate_text(), None);
        }

        #[test]
        fn result_text() {
            let record = decode_line(r#"{"type":"result","result":"Do you approve this plan?"}"#);
            assert_eq!(record.candidate_text(), Some("Do you approve this plan?"));
            assert!(record.requests_approval());
        }

        #[test]
        fn other_record_types_have_no_candidate_text() {
            let record = decode_line(r#"{"type":"system","subtype":"init","session_id":"s3"}"#);
            assert_eq!(record.session_id(), Some("s3"));
            assert_eq!(record.candidate_text(), None);
        }

        #[test]
        fn malformed_lines_are_unrecognized() {
            assert_eq!(decode_line("not json at all"), OutputRecord::Unrecognized);
            assert_eq!(decode_line("{\"type\":"), OutputRecord::Unrecognized);
            assert_eq!(decode_line("42"), OutputRecord::Unrecognized);
            assert_eq!(decode_line(r#"{"type":"system"}"#), OutputRecord::Unrecognized);
        }

        #[test]
        fn non_string_session_id_is_ignored() {
            assert_eq!(
                decode_line(r#"{"session_id":17}"#),
                OutputRecord::Unrecognized
            );
        }

        #[test]
        fn ansi_wrapped_json_still_decodes() {
            let line = "\u{1b}[0m{\"session_id\":\"tty\"}\u{1b}[K";
            assert_eq!(decode_line(line).session_id(), Some("tty"));
        }
    }

    mod approval {
        use super::*;

        #[test]
        fn recognizes_phrases_in_any_case() {
            assert!(is_approval_request("Do you approve this plan?"));
            assert!(is_approval_request("Please APPROVE THIS PLAN?"));
            assert!(is_approval_request("Status: Awaiting approval"));
            assert!(is_approval_request("this change needs approval first"));
        }

        #[test]
        fn ignores_unrelated_text() {
            assert!(!is_approval_request("Plan approved, continuing"));
            assert!(!is_approval_request("approve this plan"));
            assert!(!is_approval_request(""));
        }

        #[test]
        fn empty_assistant_text_never_requests_approval() {
            let record = OutputRecord::Assistant {
                session_id: None,
                text: String::new(),
            };
            assert!(!record.requests_approval());
        }
    }

    mod ansi {
        use super::*;

        #[test]
        fn strips_csi_and_osc() {
            assert_eq!(strip_ansi("\u{1b}[1;31mred\u{1b}[0m"), "red");
            assert_eq!(strip_ansi("\u{1b}]0;title\u{07}text"), "text");
            assert_eq!(strip_ansi("\u{1b}]8;;url\u{1b}\\link"), "link");
        }

        #[test]
        fn plain_text_unchanged() {
            assert_eq!(strip_ansi("plain {\"a\":1}"), "plain {\"a\":1}");
        }
    }
}
