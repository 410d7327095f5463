//! CodeWhisperer request envelope construction.
//!
//! Folds a canonical (Claude-form) request into the
//! `conversationState` payload: component split per turn, adjacent-role
//! merge, system-prompt folding, history/current split, and the guards the
//! upstream needs (non-empty content, deduplicated tool results, the stray
//! `"{"` tail the model sometimes emits).

use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::KIRO_ORIGIN;
use crate::dialect::prompt::{Block, ImageData, Prompt, Role};
use crate::error::{Error, Result};

/// Filler for a synthesized trailing user turn.
const CONTINUE_FILLER: &str = "Continue";
/// Filler when the current turn only carries tool results.
const TOOL_RESULTS_FILLER: &str = "Tool results provided.";

/// One turn split into its wire components.
#[derive(Default, Clone)]
struct Turn {
    assistant: bool,
    text: String,
    tool_uses: Vec<(String, String, Value)>,
    /// (tool_use_id, content, is_error)
    tool_results: Vec<(String, String, bool)>,
    /// (format, base64)
    images: Vec<(String, String)>,
}

impl Turn {
    fn append_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }

    fn merge(&mut self, other: Turn) {
        self.append_text(&other.text);
        self.tool_uses.extend(other.tool_uses);
        self.tool_results.extend(other.tool_results);
        self.images.extend(other.images);
    }
}

/// Build the full request payload for `generateAssistantResponse`.
///
/// `model_id` is the upstream identifier after aliasing; `profile_arn` is
/// attached only when the caller decided it applies (social auth).
pub fn build_payload(prompt: &Prompt, model_id: &str, profile_arn: Option<&str>) -> Result<Value> {
    if prompt.messages.is_empty() {
        return Err(Error::Decode("kiro request: no messages".into()));
    }

    let mut turns: Vec<Turn> = prompt.messages.iter().map(split_message).collect();

    // The upstream sometimes leaves a lone "{" as the final assistant text.
    if let Some(last) = turns.last() {
        if last.assistant
            && last.text.trim() == "{"
            && last.tool_uses.is_empty()
            && last.tool_results.is_empty()
        {
            turns.pop();
        }
    }

    let mut merged: Vec<Turn> = Vec::with_capacity(turns.len());
    for turn in turns {
        match merged.last_mut() {
            Some(last) if last.assistant == turn.assistant => last.merge(turn),
            _ => merged.push(turn),
        }
    }

    // Fold the system prompt into the first user turn, or stand it up as a
    // synthetic user turn when none exists.
    if let Some(system) = prompt.system.as_deref().filter(|s| !s.is_empty()) {
        match merged.iter_mut().find(|t| !t.assistant) {
            Some(first_user) => {
                first_user.text = if first_user.text.is_empty() {
                    system.to_string()
                } else {
                    format!("{system}\n\n{}", first_user.text)
                };
            }
            None => merged.insert(
                0,
                Turn {
                    assistant: false,
                    text: system.to_string(),
                    ..Default::default()
                },
            ),
        }
    }

    // All but the final turn become history; an assistant tail moves into
    // history with a synthesized user turn taking its place.
    let Some(mut current) = merged.pop() else {
        return Err(Error::Decode("kiro request: no content after folding".into()));
    };
    if current.assistant {
        merged.push(current);
        current = Turn {
            assistant: false,
            text: CONTINUE_FILLER.to_string(),
            ..Default::default()
        };
    }

    // Within the current turn, duplicate tool-use ids keep the first result.
    let mut seen_ids = std::collections::HashSet::new();
    current
        .tool_results
        .retain(|(id, _, _)| seen_ids.insert(id.clone()));

    if current.text.is_empty() {
        current.text = if current.tool_results.is_empty() {
            CONTINUE_FILLER.to_string()
        } else {
            TOOL_RESULTS_FILLER.to_string()
        };
    }

    let mut payload = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": Uuid::new_v4().to_string(),
            "currentMessage": {
                "userInputMessage": user_input_message(&current, model_id, &prompt_tools(prompt)),
            },
        }
    });

    if !merged.is_empty() {
        let history: Vec<Value> = merged
            .iter()
            .map(|turn| history_entry(turn, model_id))
            .collect();
        payload["conversationState"]["history"] = Value::Array(history);
    }

    if let Some(arn) = profile_arn.filter(|a| !a.is_empty()) {
        payload["profileArn"] = json!(arn);
    }

    Ok(payload)
}

fn split_message(msg: &crate::dialect::prompt::PromptMessage) -> Turn {
    let mut turn = Turn {
        assistant: msg.role == Role::Assistant,
        ..Default::default()
    };
    for block in &msg.blocks {
        match block {
            Block::Text(t) => turn.append_text(t),
            Block::ToolUse { id, name, input } => {
                turn.tool_uses.push((id.clone(), name.clone(), input.clone()))
            }
            Block::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => turn
                .tool_results
                .push((tool_use_id.clone(), content.clone(), *is_error)),
            Block::Image { media_type, data } => {
                if let ImageData::Base64(b64) = data {
                    let format = media_type.strip_prefix("image/").unwrap_or("png");
                    turn.images.push((format.to_string(), b64.clone()));
                }
            }
        }
    }
    turn
}

/// Claude tool specs in the `toolSpecification` wrapper.
fn prompt_tools(prompt: &Prompt) -> Vec<Value> {
    prompt
        .tools
        .iter()
        .map(|tool| {
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": {"json": tool.schema},
                }
            })
        })
        .collect()
}

fn user_input_message(turn: &Turn, model_id: &str, tools: &[Value]) -> Value {
    let mut msg = json!({
        "content": turn.text,
        "modelId": model_id,
        "origin": KIRO_ORIGIN,
    });

    if !turn.images.is_empty() {
        msg["images"] = Value::Array(
            turn.images
                .iter()
                .map(|(format, b64)| json!({"format": format, "source": {"bytes": b64}}))
                .collect(),
        );
    }

    let mut context = serde_json::Map::new();
    if !tools.is_empty() {
        context.insert("tools".into(), Value::Array(tools.to_vec()));
    }
    if !turn.tool_results.is_empty() {
        context.insert(
            "toolResults".into(),
            Value::Array(
                turn.tool_results
                    .iter()
                    .map(|(id, content, is_error)| {
                        json!({
                            "content": [{"text": content}],
                            "status": if *is_error { "error" } else { "success" },
                            "toolUseId": id,
                        })
                    })
                    .collect(),
            ),
        );
    }
    if !context.is_empty() {
        msg["userInputMessageContext"] = Value::Object(context);
    }
    msg
}

fn history_entry(turn: &Turn, model_id: &str) -> Value {
    if turn.assistant {
        let mut msg = json!({"content": turn.text});
        if !turn.tool_uses.is_empty() {
            msg["toolUses"] = Value::Array(
                turn.tool_uses
                    .iter()
                    .map(|(id, name, input)| {
                        json!({"toolUseId": id, "name": name, "input": input})
                    })
                    .collect(),
            );
        }
        json!({"assistantResponseMessage": msg})
    } else {
        json!({"userInputMessage": user_input_message(turn, model_id, &[])})
    }
}
