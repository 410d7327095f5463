//! Embedded-JSON recognizer for the CodeWhisperer event stream.
//!
//! The upstream wraps JSON records in a binary event-stream envelope whose
//! headers are not worth parsing; the records themselves are reliably
//! delimited. The recognizer scans for known leading patterns and extracts
//! each record with a brace-balanced, string-aware scan. It is restartable:
//! bytes left over from an incomplete record carry into the next push.

use serde_json::Value;
use tracing::trace;

/// Leading patterns that open an embedded record.
const PATTERNS: &[&str] = &[
    r#"{"content":"#,
    r#"{"name":"#,
    r#"{"followupPrompt":"#,
    r#"{"input":"#,
    r#"{"stop":"#,
];

/// Longest pattern, bounding how much unmatched tail to retain.
const MAX_PATTERN_LEN: usize = 18;

/// A classified record from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    /// Assistant text chunk.
    Text(String),
    /// Tool call opening, possibly with inline input and stop.
    ToolStart {
        name: String,
        tool_use_id: String,
        input: String,
        stop: bool,
    },
    /// Tool input continuation.
    ToolInput(String),
    /// Tool call closed.
    ToolStop,
}

/// Brace-scanner states.
#[derive(Clone, Copy, PartialEq)]
enum ScanState {
    Idle,
    InJson,
    InString,
    Escape,
}

/// Restartable recognizer over the upstream byte stream.
#[derive(Default)]
pub struct Recognizer {
    buffer: String,
}

impl Recognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete record it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WireEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        loop {
            let Some(start) = self.earliest_pattern() else {
                // No pattern in the buffer: drop everything except a tail
                // that could still be a pattern prefix.
                let keep_from = self.buffer.len().saturating_sub(MAX_PATTERN_LEN - 1);
                let keep_from = floor_char_boundary(&self.buffer, keep_from);
                self.buffer.drain(..keep_from);
                break;
            };

            match scan_balanced(&self.buffer[start..]) {
                Some(len) => {
                    let record = &self.buffer[start..start + len];
                    if let Some(event) = classify(record) {
                        events.push(event);
                    }
                    self.buffer.drain(..start + len);
                }
                None => {
                    // Incomplete record: keep it for the next push.
                    self.buffer.drain(..start);
                    break;
                }
            }
        }
        events
    }

    fn earliest_pattern(&self) -> Option<usize> {
        PATTERNS
            .iter()
            .filter_map(|p| self.buffer.find(p))
            .min()
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Find the byte length of the balanced JSON object starting at `s[0]`.
///
/// Explicit four-state machine: idle → in_json on `{`, in_string inside
/// quotes, escape after a backslash. Returns `None` when the record is not
/// yet complete.
fn scan_balanced(s: &str) -> Option<usize> {
    let mut state = ScanState::Idle;
    let mut depth: u32 = 0;

    for (idx, byte) in s.bytes().enumerate() {
        state = match state {
            ScanState::Idle => match byte {
                b'{' => {
                    depth = 1;
                    ScanState::InJson
                }
                _ => return None,
            },
            ScanState::InJson => match byte {
                b'{' => {
                    depth += 1;
                    ScanState::InJson
                }
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(idx + 1);
                    }
                    ScanState::InJson
                }
                b'"' => ScanState::InString,
                _ => ScanState::InJson,
            },
            ScanState::InString => match byte {
                b'"' => ScanState::InJson,
                b'\\' => ScanState::Escape,
                _ => ScanState::InString,
            },
            ScanState::Escape => ScanState::InString,
        };
    }
    None
}

/// Classify one complete record.
fn classify(record: &str) -> Option<WireEvent> {
    let data: Value = match serde_json::from_str(record) {
        Ok(v) => v,
        Err(e) => {
            trace!(error = %e, "unparseable stream record skipped");
            return None;
        }
    };

    let has_name = data.get("name").is_some();
    let has_content = data.get("content").is_some();
    let has_followup = data.get("followupPrompt").is_some();

    if has_content && !has_followup {
        return Some(WireEvent::Text(
            data["content"].as_str().unwrap_or_default().to_string(),
        ));
    }

    if has_name && data.get("toolUseId").is_some() {
        let input = match data.get("input") {
            Some(Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => String::new(),
        };
        return Some(WireEvent::ToolStart {
            name: data["name"].as_str().unwrap_or_default().to_string(),
            tool_use_id: data["toolUseId"].as_str().unwrap_or_default().to_string(),
            input,
            stop: data["stop"].as_bool().unwrap_or(false),
        });
    }

    if !has_name {
        if let Some(input) = data.get("input").and_then(|v| v.as_str()) {
            return Some(WireEvent::ToolInput(input.to_string()));
        }
        if data["stop"].as_bool() == Some(true) {
            return Some(WireEvent::ToolStop);
        }
    }

    trace!("unclassified stream record skipped");
    None
}
