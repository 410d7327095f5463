//! Assembles recognizer records into the canonical event sequence.
//!
//! Applies the retransmission dedup (the upstream sometimes resends the
//! tail text chunk), tracks tool state, and owns the stop-reason and EOF
//! cleanup rules.

use crate::dialect::completion::{Event, StopReason};
use crate::providers::kiro::recognizer::WireEvent;
use crate::providers::kiro::tokens::text_tokens;

/// Stateful wire-event → canonical-event assembler for one stream.
pub struct EventAssembler {
    model: String,
    input_tokens: u32,
    started: bool,
    in_tool: bool,
    saw_tool: bool,
    /// Last emitted text record, for consecutive-duplicate suppression.
    last_text: Option<String>,
    /// Accumulated text length drives the output token estimate.
    text_len: usize,
    finished: bool,
}

impl EventAssembler {
    pub fn new(model: &str, input_tokens: u32) -> Self {
        Self {
            model: model.to_string(),
            input_tokens,
            started: false,
            in_tool: false,
            saw_tool: false,
            last_text: None,
            text_len: 0,
            finished: false,
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<Event>) {
        if !self.started {
            self.started = true;
            out.push(Event::MessageStart {
                model: self.model.clone(),
                input_tokens: self.input_tokens,
            });
        }
    }

    /// Map one recognizer record to canonical events.
    pub fn on_wire(&mut self, wire: WireEvent) -> Vec<Event> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);

        match wire {
            WireEvent::Text(text) => {
                // Consecutive identical records are retransmissions.
                if self.last_text.as_deref() == Some(text.as_str()) {
                    return out;
                }
                self.last_text = Some(text.clone());
                self.text_len += text.len();
                out.push(Event::TextDelta(text));
            }
            WireEvent::ToolStart {
                name,
                tool_use_id,
                input,
                stop,
            } => {
                self.last_text = None;
                if self.in_tool {
                    out.push(Event::ToolUseStop);
                }
                self.in_tool = true;
                self.saw_tool = true;
                let id = if tool_use_id.is_empty() {
                    format!("toolu_{}", uuid::Uuid::new_v4().simple())
                } else {
                    tool_use_id
                };
                out.push(Event::ToolUseStart { id, name });
                if !input.is_empty() {
                    out.push(Event::ToolInputDelta(input));
                }
                if stop {
                    self.in_tool = false;
                    out.push(Event::ToolUseStop);
                }
            }
            WireEvent::ToolInput(input) => {
                if !input.is_empty() {
                    out.push(Event::ToolInputDelta(input));
                }
            }
            WireEvent::ToolStop => {
                if self.in_tool {
                    self.in_tool = false;
                    out.push(Event::ToolUseStop);
                }
            }
        }
        out
    }

    /// EOF: close any open tool block and terminate the message.
    pub fn finish(&mut self) -> Vec<Event> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        self.ensure_started(&mut out);
        if self.in_tool {
            self.in_tool = false;
            out.push(Event::ToolUseStop);
        }
        let stop_reason = if self.saw_tool {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        out.push(Event::MessageStop {
            stop_reason,
            output_tokens: text_tokens(self.text_len),
        });
        out
    }
}
