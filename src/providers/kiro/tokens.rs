//! Character-based token estimation.
//!
//! The upstream exposes no tokenizer, so counts are approximated at four
//! characters per token plus fixed overheads per structural element. The
//! numbers are estimates for usage reporting, never enforcement.

use crate::dialect::prompt::{Block, Prompt};

/// Per-request base overhead.
const REQUEST_BASE: u32 = 4;
/// Overhead per message.
const PER_MESSAGE: u32 = 4;
/// Overhead per role marker.
const PER_ROLE: u32 = 1;
/// Overhead for the system-prompt envelope.
const SYSTEM_ENVELOPE: u32 = 2;
/// Flat cost per image.
const PER_IMAGE: u32 = 1500;
/// Structural overhead per tool-use / tool-result block.
const PER_TOOL_BLOCK: u32 = 4;

/// `ceil(len / 4)` text approximation.
pub fn text_tokens(len: usize) -> u32 {
    (len.div_ceil(4)) as u32
}

/// Tool-definition overhead scales down as the tool list grows.
fn tool_overheads(count: usize) -> (u32, u32) {
    match count {
        0 => (0, 0),
        1 => (0, 50),
        2..=5 => (100, 30),
        _ => (180, 20),
    }
}

/// Estimate the input token count of a canonical request.
pub fn estimate_prompt(prompt: &Prompt) -> u32 {
    let mut tokens = REQUEST_BASE;

    if let Some(system) = &prompt.system {
        tokens += SYSTEM_ENVELOPE + text_tokens(system.len());
    }

    for msg in &prompt.messages {
        tokens += PER_MESSAGE + PER_ROLE;
        for block in &msg.blocks {
            match block {
                Block::Text(t) => tokens += text_tokens(t.len()),
                Block::Image { .. } => tokens += PER_IMAGE,
                Block::ToolUse { input, .. } => {
                    let serialized = serde_json::to_string(input).unwrap_or_default();
                    tokens += PER_TOOL_BLOCK + text_tokens(serialized.len());
                }
                Block::ToolResult { content, .. } => {
                    tokens += PER_TOOL_BLOCK + text_tokens(content.len());
                }
            }
        }
    }

    let (base, per_tool) = tool_overheads(prompt.tools.len());
    tokens += base;
    for tool in &prompt.tools {
        let schema = serde_json::to_string(&tool.schema).unwrap_or_default();
        tokens += per_tool
            + text_tokens(tool.name.len())
            + text_tokens(tool.description.len())
            + text_tokens(schema.len());
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::prompt::{PromptMessage, ToolSpec};
    use serde_json::json;

    #[test]
    fn test_text_tokens_rounds_up() {
        assert_eq!(text_tokens(0), 0);
        assert_eq!(text_tokens(1), 1);
        assert_eq!(text_tokens(4), 1);
        assert_eq!(text_tokens(5), 2);
        assert_eq!(text_tokens(8), 2);
    }

    // Pins current estimator behavior; the counts are not authoritative.
    #[test]
    fn test_estimate_plain_message() {
        let prompt = Prompt {
            messages: vec![PromptMessage::user(vec![Block::text("say hi")])],
            ..Default::default()
        };
        // base 4 + message 4 + role 1 + ceil(6/4)=2
        assert_eq!(estimate_prompt(&prompt), 11);
    }

    #[test]
    fn test_estimate_system_envelope() {
        let prompt = Prompt {
            system: Some("S".into()),
            messages: vec![PromptMessage::user(vec![Block::text("hi")])],
            ..Default::default()
        };
        // base 4 + system 2+1 + message 4+1 + ceil(2/4)=1
        assert_eq!(estimate_prompt(&prompt), 13);
    }

    #[test]
    fn test_estimate_image_flat_cost() {
        let with_image = Prompt {
            messages: vec![PromptMessage::user(vec![Block::Image {
                media_type: "image/png".into(),
                data: crate::dialect::prompt::ImageData::Base64("AAAA".into()),
            }])],
            ..Default::default()
        };
        let without = Prompt {
            messages: vec![PromptMessage::user(vec![])],
            ..Default::default()
        };
        assert_eq!(
            estimate_prompt(&with_image) - estimate_prompt(&without),
            PER_IMAGE
        );
    }

    #[test]
    fn test_tool_overhead_tiers() {
        let tool = |n: usize| ToolSpec {
            name: format!("tool{n}"),
            description: String::new(),
            schema: json!({}),
        };
        let with_tools = |count: usize| {
            let prompt = Prompt {
                tools: (0..count).map(tool).collect(),
                ..Default::default()
            };
            estimate_prompt(&prompt)
        };
        let base = with_tools(0);
        // 1 tool: 0 base + 50 each (+ name ~2 + schema "{}" 1).
        assert_eq!(with_tools(1) - base, 50 + 2 + 1);
        // 6 tools: 180 base + 20 each.
        assert_eq!(with_tools(6) - base, 180 + 6 * (20 + 2 + 1));
    }

    #[test]
    fn test_more_text_never_costs_less() {
        let make = |text: &str| Prompt {
            messages: vec![PromptMessage::user(vec![Block::text(text)])],
            ..Default::default()
        };
        let mut text = String::new();
        let mut last = estimate_prompt(&make(&text));
        for _ in 0..64 {
            text.push('x');
            let next = estimate_prompt(&make(&text));
            assert!(next >= last);
            last = next;
        }
    }
}
