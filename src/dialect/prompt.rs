//! Canonical request form shared by all dialect translators.
//!
//! Every inbound wire dialect parses into a `Prompt`; every outbound dialect
//! renders from one. Translation between any two dialects composes parse and
//! render, so the preservation contract (roles, text, tool specs, tool
//! uses/results, images, system prompts) is stated once, here.

use serde_json::Value;

/// Conversation role after system extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Image payload: inline base64 or a remote URL.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageData {
    Base64(String),
    Url(String),
}

/// One content block within a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Text(String),
    Image {
        media_type: String,
        data: ImageData,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl Block {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub blocks: Vec<Block>,
}

impl PromptMessage {
    pub fn user(blocks: Vec<Block>) -> Self {
        Self {
            role: Role::User,
            blocks,
        }
    }

    pub fn assistant(blocks: Vec<Block>) -> Self {
        Self {
            role: Role::Assistant,
            blocks,
        }
    }

    /// Concatenated text content of the turn.
    pub fn joined_text(&self) -> String {
        let texts: Vec<&str> = self.blocks.iter().filter_map(Block::as_text).collect();
        texts.join("\n")
    }
}

/// Tool definition carried across dialects.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool input.
    pub schema: Value,
}

/// Tool invocation preference.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    Required,
    None,
    Tool(String),
}

/// Sampling and length parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub stop: Vec<String>,
    pub stream: bool,
}

/// The canonical request tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub model: String,
    /// System prompt, already concatenated with `\n` when the source dialect
    /// carried an array of system blocks.
    pub system: Option<String>,
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    pub params: Params,
}

impl Default for PromptMessage {
    fn default() -> Self {
        Self {
            role: Role::User,
            blocks: Vec::new(),
        }
    }
}

impl Prompt {
    /// All text across all turns, in order. Used by the token estimator and
    /// the stream-sum property tests.
    pub fn all_text(&self) -> String {
        self.messages
            .iter()
            .map(PromptMessage::joined_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
