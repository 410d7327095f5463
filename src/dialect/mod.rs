//! Bidirectional dialect translation.
//!
//! The pairwise matrix over {openai-chat, claude-messages,
//! gemini-generateContent, ollama-chat, ollama-generate} composes through
//! the canonical [`Prompt`]/[`Completion`]/[`Event`] forms: every dialect
//! parses into and renders from them, so any `(from, to)` pair is parse ∘
//! render and the content-preservation contract is stated once.

pub mod claude;
pub mod completion;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod prompt;

pub use completion::{accumulate, Completion, CompletionBlock, Event, StopReason, TokenUsage};
pub use prompt::{Block, ImageData, Params, Prompt, PromptMessage, Role, ToolChoice, ToolSpec};

use serde_json::Value;

use crate::error::{Error, Result};

/// A public request/response wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    OpenAiChat,
    ClaudeMessages,
    GeminiGenerateContent,
    OllamaChat,
    OllamaGenerate,
}

impl Dialect {
    pub const ALL: &'static [Dialect] = &[
        Dialect::OpenAiChat,
        Dialect::ClaudeMessages,
        Dialect::GeminiGenerateContent,
        Dialect::OllamaChat,
        Dialect::OllamaGenerate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAiChat => "openai-chat",
            Self::ClaudeMessages => "claude-messages",
            Self::GeminiGenerateContent => "gemini-generate-content",
            Self::OllamaChat => "ollama-chat",
            Self::OllamaGenerate => "ollama-generate",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai-chat" | "openai" => Ok(Self::OpenAiChat),
            "claude-messages" | "claude" => Ok(Self::ClaudeMessages),
            "gemini-generate-content" | "gemini" => Ok(Self::GeminiGenerateContent),
            "ollama-chat" | "ollama" => Ok(Self::OllamaChat),
            "ollama-generate" => Ok(Self::OllamaGenerate),
            other => Err(Error::Decode(format!("unknown dialect '{other}'"))),
        }
    }
}

/// Parse a request body in the given dialect into the canonical form.
///
/// `model_hint` supplies the model when the dialect carries it out-of-band
/// (Gemini puts it in the URL path).
pub fn parse_request(dialect: Dialect, model_hint: &str, body: &Value) -> Result<Prompt> {
    let mut prompt = match dialect {
        Dialect::OpenAiChat => openai::parse_request(body)?,
        Dialect::ClaudeMessages => claude::parse_request(body)?,
        Dialect::GeminiGenerateContent => gemini::parse_request(model_hint, body)?,
        Dialect::OllamaChat => ollama::parse_chat_request(body)?,
        Dialect::OllamaGenerate => ollama::parse_generate_request(body)?,
    };
    if prompt.model.is_empty() {
        prompt.model = model_hint.to_string();
    }
    Ok(prompt)
}

/// Render the canonical form as a request body in the given dialect.
pub fn render_request(dialect: Dialect, prompt: &Prompt) -> Value {
    match dialect {
        Dialect::OpenAiChat => openai::render_request(prompt),
        Dialect::ClaudeMessages => claude::render_request(prompt),
        Dialect::GeminiGenerateContent => gemini::render_request(prompt),
        // An Ollama-origin prompt renders onward as OpenAI chat; nothing
        // proxies *to* an Ollama back-end.
        Dialect::OllamaChat | Dialect::OllamaGenerate => openai::render_request(prompt),
    }
}

/// Translate a request body between two dialects.
///
/// `strict` rejects requests with no usable messages instead of passing an
/// empty conversation downstream.
pub fn translate_request(
    from: Dialect,
    to: Dialect,
    model_hint: &str,
    body: &Value,
    strict: bool,
) -> Result<Value> {
    let prompt = parse_request(from, model_hint, body)?;
    if strict && prompt.messages.iter().all(|m| m.blocks.is_empty()) {
        return Err(Error::Decode(format!("{from} request carries no content")));
    }
    Ok(render_request(to, &prompt))
}

/// Translate a non-stream upstream response from one dialect to another.
pub fn translate_non_stream(from: Dialect, to: Dialect, upstream: &Value) -> Result<Value> {
    let completion = parse_response(from, upstream)?;
    Ok(render_response(to, &completion))
}

/// Render a canonical completion as a response body in the given dialect.
pub fn render_response(dialect: Dialect, completion: &Completion) -> Value {
    match dialect {
        Dialect::OpenAiChat => openai::render_response(completion),
        Dialect::ClaudeMessages => claude::render_response(completion),
        Dialect::GeminiGenerateContent => gemini::render_response(completion),
        Dialect::OllamaChat => ollama::render_chat_response(completion),
        Dialect::OllamaGenerate => ollama::render_generate_response(completion),
    }
}

/// Parse a provider-native response body into the canonical form.
pub fn parse_response(dialect: Dialect, body: &Value) -> Result<Completion> {
    match dialect {
        Dialect::OpenAiChat | Dialect::OllamaChat | Dialect::OllamaGenerate => {
            openai::parse_response(body)
        }
        Dialect::ClaudeMessages => claude::parse_response(body),
        Dialect::GeminiGenerateContent => gemini::parse_response(body),
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Stateful renderer from canonical events to one dialect's wire frames.
///
/// Invariant: every emitted frame either is the dialect's termination marker
/// (`data: [DONE]`, `{"done":true}`, `message_stop`) or the renderer retains
/// enough state to emit one later; [`StreamRenderer::finish`] flushes it on
/// EOF. No delta is ever dropped.
pub enum StreamRenderer {
    OpenAi(openai::OpenAiStreamRenderer),
    Claude(claude::ClaudeStreamRenderer),
    Gemini(gemini::GeminiStreamRenderer),
    Ollama(ollama::OllamaStreamRenderer),
}

impl StreamRenderer {
    pub fn new(dialect: Dialect, model: &str) -> Self {
        match dialect {
            Dialect::OpenAiChat => Self::OpenAi(openai::OpenAiStreamRenderer::new(model)),
            Dialect::ClaudeMessages => Self::Claude(claude::ClaudeStreamRenderer::new(model)),
            Dialect::GeminiGenerateContent => {
                Self::Gemini(gemini::GeminiStreamRenderer::new(model))
            }
            Dialect::OllamaChat => Self::Ollama(ollama::OllamaStreamRenderer::chat(model)),
            Dialect::OllamaGenerate => Self::Ollama(ollama::OllamaStreamRenderer::generate(model)),
        }
    }

    /// Render one canonical event into zero or more wire frames.
    pub fn render(&mut self, event: &Event) -> Vec<String> {
        match self {
            Self::OpenAi(r) => r.render(event),
            Self::Claude(r) => r.render(event),
            Self::Gemini(r) => r.render(event),
            Self::Ollama(r) => r.render(event),
        }
    }

    /// Flush termination frames if the event sequence ended early.
    pub fn finish(&mut self) -> Vec<String> {
        match self {
            Self::OpenAi(r) => r.finish(),
            Self::Claude(r) => r.finish(),
            Self::Gemini(r) => r.finish(),
            Self::Ollama(r) => r.finish(),
        }
    }
}

/// Stateful parser from one dialect's stream payloads to canonical events.
pub enum StreamParser {
    OpenAi(openai::OpenAiStreamParser),
    Claude(claude::ClaudeStreamParser),
    Gemini(gemini::GeminiStreamParser),
}

impl StreamParser {
    pub fn new(dialect: Dialect) -> Result<Self> {
        match dialect {
            Dialect::OpenAiChat => Ok(Self::OpenAi(openai::OpenAiStreamParser::new())),
            Dialect::ClaudeMessages => Ok(Self::Claude(claude::ClaudeStreamParser::new())),
            Dialect::GeminiGenerateContent => Ok(Self::Gemini(gemini::GeminiStreamParser::new())),
            other => Err(Error::Decode(format!("{other} is not an upstream stream dialect"))),
        }
    }

    /// Parse one stream payload (an SSE `data:` value).
    pub fn parse(&mut self, data: &str) -> Result<Vec<Event>> {
        match self {
            Self::OpenAi(p) => p.parse(data),
            Self::Claude(p) => p.parse(data),
            Self::Gemini(p) => p.parse(data),
        }
    }
}
