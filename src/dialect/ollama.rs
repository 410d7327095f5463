//! Ollama chat/generate dialect and `show` model-descriptor synthesis.
//!
//! Ollama requests flatten to the canonical form the same way the chat
//! dialects do; responses are NDJSON frames with a terminal `done:true`.
//! The `show` endpoint is answered from a closed per-family context table.

use serde_json::{json, Value};

use crate::dialect::completion::{Completion, Event, StopReason, TokenUsage};
use crate::dialect::prompt::{Block, ImageData, Params, Prompt, PromptMessage, ToolSpec};
use crate::error::{Error, Result};

/// Context window and max output tokens per model family prefix.
///
/// The table is closed: unknown names fall back to 4096/2048.
const CONTEXT_TABLE: &[(&str, u32, u32)] = &[
    ("claude-opus-4", 200_000, 32_000),
    ("claude-sonnet-4-5", 200_000, 64_000),
    ("claude-sonnet-4", 200_000, 64_000),
    ("claude-haiku-4-5", 200_000, 64_000),
    ("claude-3-7-sonnet", 200_000, 64_000),
    ("claude-3-5", 200_000, 8_192),
    ("claude", 200_000, 8_192),
    ("gemini-2.5-pro", 1_048_576, 65_536),
    ("gemini-2.5-flash", 1_048_576, 65_536),
    ("gemini-2.0", 1_048_576, 8_192),
    ("gemini-1.5-pro", 2_097_152, 8_192),
    ("gemini-1.5", 1_048_576, 8_192),
    ("gpt-4o", 128_000, 16_384),
    ("gpt-4-turbo", 128_000, 4_096),
    ("gpt-4", 8_192, 8_192),
    ("gpt-3.5", 16_385, 4_096),
    ("qwen3-coder", 262_144, 65_536),
    ("qwen-vl", 131_072, 8_192),
];

const FALLBACK_CONTEXT: u32 = 4096;
const FALLBACK_OUTPUT: u32 = 2048;

/// Look up (context_length, max_output_tokens) for a model name.
pub fn context_limits(model: &str) -> (u32, u32) {
    let normalized = crate::config::normalize_model_name(model);
    for (prefix, ctx, out) in CONTEXT_TABLE {
        if normalized.starts_with(prefix) {
            return (*ctx, *out);
        }
    }
    (FALLBACK_CONTEXT, FALLBACK_OUTPUT)
}

fn is_vision_family(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.starts_with("claude") || m.starts_with("gemini") || m.starts_with("gpt-4o") || m.contains("vl")
}

/// Parse an Ollama chat request into the canonical form.
pub fn parse_chat_request(body: &Value) -> Result<Prompt> {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let messages = body["messages"]
        .as_array()
        .ok_or_else(|| Error::Decode("ollama chat request: messages is not an array".into()))?;

    let mut system_parts = Vec::new();
    let mut out = Vec::new();
    for msg in messages {
        let content = msg["content"].as_str().unwrap_or_default().to_string();
        match msg["role"].as_str().unwrap_or("user") {
            "system" => {
                if !content.is_empty() {
                    system_parts.push(content);
                }
            }
            "assistant" => out.push(PromptMessage::assistant(vec![Block::Text(content)])),
            _ => {
                let mut blocks = Vec::new();
                if !content.is_empty() {
                    blocks.push(Block::Text(content));
                }
                // Ollama images are raw base64 with no media type.
                for image in msg["images"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
                    if let Some(b64) = image.as_str() {
                        blocks.push(Block::Image {
                            media_type: "image/png".into(),
                            data: ImageData::Base64(b64.to_string()),
                        });
                    }
                }
                out.push(PromptMessage::user(blocks));
            }
        }
    }

    let tools = body["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let func = t.get("function")?;
                    Some(ToolSpec {
                        name: func["name"].as_str()?.to_string(),
                        description: func["description"].as_str().unwrap_or_default().to_string(),
                        schema: func.get("parameters").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Prompt {
        model,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        messages: out,
        tools,
        tool_choice: None,
        params: parse_options(body),
    })
}

/// Parse an Ollama generate request (single prompt string).
pub fn parse_generate_request(body: &Value) -> Result<Prompt> {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let prompt_text = body["prompt"].as_str().unwrap_or_default();

    Ok(Prompt {
        model,
        system: body["system"].as_str().filter(|s| !s.is_empty()).map(String::from),
        messages: vec![PromptMessage::user(vec![Block::text(prompt_text)])],
        tools: Vec::new(),
        tool_choice: None,
        params: parse_options(body),
    })
}

/// Map `options.*` to the canonical params. Ollama streams by default.
fn parse_options(body: &Value) -> Params {
    let options = &body["options"];
    Params {
        max_tokens: options["num_predict"].as_u64().map(|v| v as u32),
        temperature: options["temperature"].as_f64(),
        top_p: options["top_p"].as_f64(),
        top_k: options["top_k"].as_u64().map(|v| v as u32),
        stop: match &options["stop"] {
            Value::String(s) => vec![s.clone()],
            Value::Array(arr) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        },
        stream: body["stream"].as_bool().unwrap_or(true),
    }
}

fn zeroed_durations(body: &mut Value) {
    body["total_duration"] = json!(0);
    body["load_duration"] = json!(0);
    body["prompt_eval_duration"] = json!(0);
    body["eval_duration"] = json!(0);
}

fn done_reason(reason: StopReason) -> &'static str {
    match reason {
        StopReason::MaxTokens => "length",
        _ => "stop",
    }
}

/// Render a canonical completion as an Ollama chat response.
pub fn render_chat_response(completion: &Completion) -> Value {
    let mut body = json!({
        "model": completion.model,
        "created_at": chrono::Utc::now().to_rfc3339(),
        "message": {"role": "assistant", "content": completion.text()},
        "done": true,
        "done_reason": done_reason(completion.stop_reason),
        "prompt_eval_count": completion.usage.input_tokens,
        "eval_count": completion.usage.output_tokens,
    });
    let tool_calls: Vec<Value> = completion
        .tool_uses()
        .map(|(_, name, input)| json!({"function": {"name": name, "arguments": input}}))
        .collect();
    if !tool_calls.is_empty() {
        body["message"]["tool_calls"] = Value::Array(tool_calls);
    }
    zeroed_durations(&mut body);
    body
}

/// Render a canonical completion as an Ollama generate response.
pub fn render_generate_response(completion: &Completion) -> Value {
    let mut body = json!({
        "model": completion.model,
        "created_at": chrono::Utc::now().to_rfc3339(),
        "response": completion.text(),
        "done": true,
        "done_reason": done_reason(completion.stop_reason),
        "prompt_eval_count": completion.usage.input_tokens,
        "eval_count": completion.usage.output_tokens,
    });
    zeroed_durations(&mut body);
    body
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Renders canonical events as Ollama NDJSON frames.
///
/// Incremental frames carry `done:false`; the stream always terminates with
/// a `done:true` frame carrying counts and the done reason.
pub struct OllamaStreamRenderer {
    model: String,
    /// chat endpoint wraps text in `message`; generate uses `response`.
    chat: bool,
    usage: TokenUsage,
    finished: bool,
}

impl OllamaStreamRenderer {
    pub fn chat(model: &str) -> Self {
        Self {
            model: model.to_string(),
            chat: true,
            usage: TokenUsage::default(),
            finished: false,
        }
    }

    pub fn generate(model: &str) -> Self {
        Self {
            model: model.to_string(),
            chat: false,
            usage: TokenUsage::default(),
            finished: false,
        }
    }

    fn delta_frame(&self, text: &str) -> String {
        let mut body = json!({
            "model": self.model,
            "created_at": chrono::Utc::now().to_rfc3339(),
            "done": false,
        });
        if self.chat {
            body["message"] = json!({"role": "assistant", "content": text});
        } else {
            body["response"] = json!(text);
        }
        format!("{body}\n")
    }

    pub fn render(&mut self, event: &Event) -> Vec<String> {
        match event {
            Event::MessageStart { input_tokens, .. } => {
                self.usage.input_tokens = *input_tokens;
                Vec::new()
            }
            Event::TextDelta(text) => vec![self.delta_frame(text)],
            // Tool streaming has no Ollama wire shape; the terminal frame
            // carries the done reason.
            Event::ToolUseStart { .. } | Event::ToolInputDelta(_) | Event::ToolUseStop => {
                Vec::new()
            }
            Event::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.usage = TokenUsage {
                    input_tokens: *input_tokens,
                    output_tokens: *output_tokens,
                };
                Vec::new()
            }
            Event::MessageStop {
                stop_reason,
                output_tokens,
            } => {
                if *output_tokens > 0 {
                    self.usage.output_tokens = *output_tokens;
                }
                self.finished = true;
                let mut body = json!({
                    "model": self.model,
                    "created_at": chrono::Utc::now().to_rfc3339(),
                    "done": true,
                    "done_reason": done_reason(*stop_reason),
                    "prompt_eval_count": self.usage.input_tokens,
                    "eval_count": self.usage.output_tokens,
                });
                if self.chat {
                    body["message"] = json!({"role": "assistant", "content": ""});
                } else {
                    body["response"] = json!("");
                }
                zeroed_durations(&mut body);
                vec![format!("{body}\n")]
            }
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.render(&Event::MessageStop {
            stop_reason: StopReason::EndTurn,
            output_tokens: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// `show` synthesis
// ---------------------------------------------------------------------------

/// Synthesize the Ollama `show` response for a proxied model.
pub fn show_response(model: &str) -> Value {
    let (context_length, max_output) = context_limits(model);
    let mut capabilities = vec!["completion", "tools"];
    if is_vision_family(model) {
        capabilities.push("vision");
    }

    json!({
        "modelfile": format!("# Modelfile generated for {model}"),
        "parameters": format!("num_ctx {context_length}\nnum_predict {max_output}"),
        "template": "{{ .Prompt }}",
        "details": {
            "parent_model": "",
            "format": "gguf",
            "family": model_family(model),
            "families": [model_family(model)],
            "parameter_size": "",
            "quantization_level": "",
        },
        "model_info": {
            "general.architecture": model_family(model),
            "general.context_length": context_length,
            "general.max_output_tokens": max_output,
        },
        "capabilities": capabilities,
    })
}

fn model_family(model: &str) -> &'static str {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude") {
        "claude"
    } else if m.starts_with("gemini") {
        "gemini"
    } else if m.starts_with("gpt") {
        "gpt"
    } else if m.starts_with("qwen") {
        "qwen"
    } else {
        "unknown"
    }
}

/// Synthesize the Ollama `tags` (model list) entry for a proxied model.
pub fn tags_entry(model: &str) -> Value {
    json!({
        "name": model,
        "model": model,
        "modified_at": chrono::Utc::now().to_rfc3339(),
        "size": 0,
        "digest": "",
        "details": {
            "format": "gguf",
            "family": model_family(model),
            "families": [model_family(model)],
            "parameter_size": "",
            "quantization_level": "",
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::completion::CompletionBlock;

    #[test]
    fn test_parse_chat_request_options() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "S"},
                {"role": "user", "content": "U"}
            ],
            "options": {
                "temperature": 0.3,
                "top_p": 0.9,
                "top_k": 40,
                "num_predict": 128,
                "stop": ["END"]
            },
            "stream": false
        });
        let prompt = parse_chat_request(&body).unwrap();
        assert_eq!(prompt.system.as_deref(), Some("S"));
        assert_eq!(prompt.params.temperature, Some(0.3));
        assert_eq!(prompt.params.top_k, Some(40));
        assert_eq!(prompt.params.max_tokens, Some(128));
        assert_eq!(prompt.params.stop, vec!["END"]);
        assert!(!prompt.params.stream);
    }

    #[test]
    fn test_stream_defaults_on() {
        let body = json!({"model": "m", "messages": []});
        let prompt = parse_chat_request(&body).unwrap();
        assert!(prompt.params.stream);
    }

    #[test]
    fn test_parse_generate_request() {
        let body = json!({"model": "m", "prompt": "P", "system": "S"});
        let prompt = parse_generate_request(&body).unwrap();
        assert_eq!(prompt.system.as_deref(), Some("S"));
        assert_eq!(prompt.messages[0].joined_text(), "P");
    }

    #[test]
    fn test_render_chat_response_shape() {
        let completion = Completion {
            id: "msg_1".into(),
            model: "claude-sonnet-4-5".into(),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 4,
                output_tokens: 2,
            },
            blocks: vec![CompletionBlock::Text("Hi".into())],
        };
        let body = render_chat_response(&completion);
        assert_eq!(body["message"]["content"], "Hi");
        assert_eq!(body["done"], true);
        assert_eq!(body["done_reason"], "stop");
        assert_eq!(body["prompt_eval_count"], 4);
        assert_eq!(body["eval_count"], 2);
        assert_eq!(body["total_duration"], 0);
    }

    #[test]
    fn test_stream_renderer_terminates_with_done_true() {
        let mut renderer = OllamaStreamRenderer::chat("m");
        let mut frames = Vec::new();
        frames.extend(renderer.render(&Event::TextDelta("Hi".into())));
        frames.extend(renderer.render(&Event::MessageStop {
            stop_reason: StopReason::EndTurn,
            output_tokens: 1,
        }));
        assert_eq!(frames.len(), 2);
        let first: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["done"], false);
        assert_eq!(first["message"]["content"], "Hi");
        let last: Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(last["done"], true);
        assert_eq!(last["eval_count"], 1);
    }

    #[test]
    fn test_show_synthesis_claude() {
        let body = show_response("claude-sonnet-4-5");
        assert_eq!(body["model_info"]["general.context_length"], 200_000);
        assert!(body["parameters"]
            .as_str()
            .unwrap()
            .contains("num_ctx 200000"));
        let caps: Vec<&str> = body["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(caps.contains(&"tools"));
        assert!(caps.contains(&"vision"));
    }

    #[test]
    fn test_tags_entry_shape() {
        let entry = tags_entry("gemini-2.5-pro");
        assert_eq!(entry["name"], "gemini-2.5-pro");
        assert_eq!(entry["details"]["family"], "gemini");
    }

    #[test]
    fn test_show_synthesis_tiers() {
        assert_eq!(context_limits("gemini-1.5-pro").0, 2_097_152);
        assert_eq!(context_limits("gemini-2.5-flash").0, 1_048_576);
        assert_eq!(context_limits("gpt-4o").0, 128_000);
        assert_eq!(context_limits("gpt-3.5-turbo").0, 16_385);
        assert_eq!(context_limits("qwen3-coder-plus").0, 262_144);
        // Dated snapshots resolve through normalization.
        assert_eq!(context_limits("claude-sonnet-4-5-20250929").0, 200_000);
        // Unknown models fall back.
        assert_eq!(context_limits("mystery-model"), (4096, 2048));
    }
}
