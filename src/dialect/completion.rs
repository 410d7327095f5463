//! Canonical response and stream-event forms.
//!
//! Executors produce these; the dialect renderers consume them. Within one
//! stream, events are delivered in production order.

use serde_json::Value;

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    /// Claude wire name.
    pub fn as_claude(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
        }
    }

    /// OpenAI `finish_reason`.
    pub fn as_openai(&self) -> &'static str {
        match self {
            Self::EndTurn | Self::StopSequence => "stop",
            Self::ToolUse => "tool_calls",
            Self::MaxTokens => "length",
        }
    }

    /// Gemini `finishReason`.
    pub fn as_gemini(&self) -> &'static str {
        match self {
            Self::EndTurn | Self::StopSequence | Self::ToolUse => "STOP",
            Self::MaxTokens => "MAX_TOKENS",
        }
    }

    pub fn from_claude(s: &str) -> Self {
        match s {
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            _ => Self::EndTurn,
        }
    }

    pub fn from_openai(s: &str) -> Self {
        match s {
            "tool_calls" | "function_call" => Self::ToolUse,
            "length" => Self::MaxTokens,
            _ => Self::EndTurn,
        }
    }

    pub fn from_gemini(s: &str) -> Self {
        match s {
            "MAX_TOKENS" => Self::MaxTokens,
            _ => Self::EndTurn,
        }
    }
}

/// Token counts attached to a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// One content block of a completed response.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Canonical non-stream response.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub id: String,
    pub model: String,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
    pub blocks: Vec<CompletionBlock>,
}

impl Completion {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                CompletionBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.blocks.iter().filter_map(|b| match b {
            CompletionBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }
}

/// Canonical stream event: the intermediate form all executors produce and
/// the stream renderers consume.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MessageStart {
        model: String,
        input_tokens: u32,
    },
    TextDelta(String),
    ToolUseStart {
        id: String,
        name: String,
    },
    ToolInputDelta(String),
    ToolUseStop,
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    MessageStop {
        stop_reason: StopReason,
        output_tokens: u32,
    },
}

/// Fold a full event sequence into a [`Completion`].
///
/// Used by executors that stream internally but answer a non-stream call,
/// and by the stream-sum property tests.
pub fn accumulate(model: &str, events: impl IntoIterator<Item = Event>) -> Completion {
    let mut text = String::new();
    let mut blocks: Vec<CompletionBlock> = Vec::new();
    let mut current_tool: Option<(String, String, String)> = None;
    let mut usage = TokenUsage::default();
    let mut stop_reason = StopReason::EndTurn;
    let mut id = String::new();
    let mut model = model.to_string();

    let mut finish_tool = |blocks: &mut Vec<CompletionBlock>,
                           tool: &mut Option<(String, String, String)>| {
        if let Some((tool_id, name, input_json)) = tool.take() {
            let input: Value =
                serde_json::from_str(&input_json).unwrap_or(Value::Object(Default::default()));
            blocks.push(CompletionBlock::ToolUse {
                id: tool_id,
                name,
                input,
            });
        }
    };

    for event in events {
        match event {
            Event::MessageStart {
                model: m,
                input_tokens,
            } => {
                if !m.is_empty() {
                    model = m;
                }
                usage.input_tokens = input_tokens;
            }
            Event::TextDelta(t) => text.push_str(&t),
            Event::ToolUseStart { id, name } => {
                finish_tool(&mut blocks, &mut current_tool);
                current_tool = Some((id, name, String::new()));
            }
            Event::ToolInputDelta(part) => {
                if let Some((_, _, input)) = &mut current_tool {
                    input.push_str(&part);
                }
            }
            Event::ToolUseStop => finish_tool(&mut blocks, &mut current_tool),
            Event::Usage {
                input_tokens,
                output_tokens,
            } => {
                usage.input_tokens = input_tokens;
                usage.output_tokens = output_tokens;
            }
            Event::MessageStop {
                stop_reason: reason,
                output_tokens,
            } => {
                stop_reason = reason;
                if output_tokens > 0 {
                    usage.output_tokens = output_tokens;
                }
            }
        }
    }
    finish_tool(&mut blocks, &mut current_tool);

    if !text.is_empty() {
        blocks.insert(0, CompletionBlock::Text(text));
    }
    if id.is_empty() {
        id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    }

    Completion {
        id,
        model,
        stop_reason,
        usage,
        blocks,
    }
}
