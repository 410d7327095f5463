//! Claude messages dialect: request/response/SSE conversion.
//!
//! The SSE renderer owns the content-block index discipline: text is block
//! 0, each tool use opens the next index, and EOF closes whatever block is
//! still open.

use serde_json::{json, Value};

use crate::dialect::completion::{Completion, CompletionBlock, Event, StopReason, TokenUsage};
use crate::dialect::prompt::{
    Block, ImageData, Params, Prompt, PromptMessage, Role, ToolChoice, ToolSpec,
};
use crate::error::{Error, Result};

/// Parse a Claude messages request into the canonical form.
pub fn parse_request(body: &Value) -> Result<Prompt> {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let messages = body["messages"]
        .as_array()
        .ok_or_else(|| Error::Decode("claude request: messages is not an array".into()))?;

    let mut out = Vec::new();
    for msg in messages {
        let role = match msg["role"].as_str() {
            Some("assistant") => Role::Assistant,
            _ => Role::User,
        };
        out.push(PromptMessage {
            role,
            blocks: parse_content(&msg["content"]),
        });
    }

    let tools = body["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    Some(ToolSpec {
                        name: t["name"].as_str()?.to_string(),
                        description: t["description"].as_str().unwrap_or_default().to_string(),
                        schema: t.get("input_schema").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Prompt {
        model,
        system: parse_system(&body["system"]),
        messages: out,
        tools,
        tool_choice: parse_tool_choice(&body["tool_choice"]),
        params: Params {
            max_tokens: body["max_tokens"].as_u64().map(|v| v as u32),
            temperature: body["temperature"].as_f64(),
            top_p: body["top_p"].as_f64(),
            top_k: body["top_k"].as_u64().map(|v| v as u32),
            stop: body["stop_sequences"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            stream: body["stream"].as_bool().unwrap_or(false),
        },
    })
}

/// System prompt: verbatim string, or text blocks concatenated with `\n`.
pub fn parse_system(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|p| match p["type"].as_str() {
                    Some("text") => p["text"].as_str(),
                    _ => None,
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

fn parse_tool_choice(value: &Value) -> Option<ToolChoice> {
    match value["type"].as_str()? {
        "auto" => Some(ToolChoice::Auto),
        "any" => Some(ToolChoice::Required),
        "none" => Some(ToolChoice::None),
        "tool" => value["name"].as_str().map(|n| ToolChoice::Tool(n.to_string())),
        _ => None,
    }
}

fn parse_content(content: &Value) -> Vec<Block> {
    match content {
        Value::String(s) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![Block::Text(s.clone())]
            }
        }
        Value::Array(parts) => parts.iter().filter_map(parse_block).collect(),
        _ => Vec::new(),
    }
}

fn parse_block(part: &Value) -> Option<Block> {
    match part["type"].as_str()? {
        "text" => part["text"].as_str().map(Block::text),
        "image" => {
            let source = &part["source"];
            let media_type = source["media_type"].as_str().unwrap_or("image/png").to_string();
            match source["type"].as_str() {
                Some("url") => Some(Block::Image {
                    media_type,
                    data: ImageData::Url(source["url"].as_str()?.to_string()),
                }),
                _ => Some(Block::Image {
                    media_type,
                    data: ImageData::Base64(source["data"].as_str()?.to_string()),
                }),
            }
        }
        "tool_use" => Some(Block::ToolUse {
            id: part["id"].as_str().unwrap_or_default().to_string(),
            name: part["name"].as_str().unwrap_or_default().to_string(),
            input: part.get("input").cloned().unwrap_or(json!({})),
        }),
        "tool_result" => {
            let content = match &part["content"] {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            Some(Block::ToolResult {
                tool_use_id: part["tool_use_id"].as_str().unwrap_or_default().to_string(),
                content,
                is_error: part["is_error"].as_bool().unwrap_or(false),
            })
        }
        _ => None,
    }
}

/// Render the canonical form as a Claude messages request.
pub fn render_request(prompt: &Prompt) -> Value {
    let messages: Vec<Value> = prompt
        .messages
        .iter()
        .map(|msg| {
            let blocks: Vec<Value> = msg.blocks.iter().map(render_block).collect();
            // Single text block uses the string shorthand.
            let content = if blocks.len() == 1 && blocks[0]["type"] == "text" {
                blocks[0]["text"].clone()
            } else {
                Value::Array(blocks)
            };
            json!({"role": msg.role.as_str(), "content": content})
        })
        .collect();

    let mut body = json!({
        "model": prompt.model,
        "max_tokens": prompt.params.max_tokens.unwrap_or(4096),
        "messages": messages,
    });
    if let Some(system) = &prompt.system {
        body["system"] = json!(system);
    }
    if let Some(t) = prompt.params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(tp) = prompt.params.top_p {
        body["top_p"] = json!(tp);
    }
    if let Some(tk) = prompt.params.top_k {
        body["top_k"] = json!(tk);
    }
    if !prompt.params.stop.is_empty() {
        body["stop_sequences"] = json!(prompt.params.stop);
    }
    if prompt.params.stream {
        body["stream"] = json!(true);
    }
    if !prompt.tools.is_empty() {
        body["tools"] = Value::Array(
            prompt
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.schema,
                    })
                })
                .collect(),
        );
    }
    if let Some(choice) = &prompt.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Required => json!({"type": "any"}),
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
        };
    }
    body
}

fn render_block(block: &Block) -> Value {
    match block {
        Block::Text(t) => json!({"type": "text", "text": t}),
        Block::Image { media_type, data } => match data {
            ImageData::Base64(b64) => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": b64}
            }),
            ImageData::Url(url) => json!({
                "type": "image",
                "source": {"type": "url", "media_type": media_type, "url": url}
            }),
        },
        Block::ToolUse { id, name, input } => json!({
            "type": "tool_use", "id": id, "name": name, "input": input
        }),
        Block::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut out = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                out["is_error"] = json!(true);
            }
            out
        }
    }
}

/// Render a canonical completion as a Claude messages response.
pub fn render_response(completion: &Completion) -> Value {
    let content: Vec<Value> = completion
        .blocks
        .iter()
        .map(|b| match b {
            CompletionBlock::Text(t) => json!({"type": "text", "text": t}),
            CompletionBlock::ToolUse { id, name, input } => {
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
        })
        .collect();

    json!({
        "id": completion.id,
        "type": "message",
        "role": "assistant",
        "model": completion.model,
        "content": content,
        "stop_reason": completion.stop_reason.as_claude(),
        "stop_sequence": null,
        "usage": {
            "input_tokens": completion.usage.input_tokens,
            "output_tokens": completion.usage.output_tokens,
        }
    })
}

/// Parse a Claude messages response into the canonical form.
pub fn parse_response(body: &Value) -> Result<Completion> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| Error::Decode("claude response: content is not an array".into()))?;

    let mut blocks = Vec::new();
    for part in content {
        match part["type"].as_str() {
            Some("text") => {
                if let Some(t) = part["text"].as_str() {
                    blocks.push(CompletionBlock::Text(t.to_string()));
                }
            }
            Some("tool_use") => blocks.push(CompletionBlock::ToolUse {
                id: part["id"].as_str().unwrap_or_default().to_string(),
                name: part["name"].as_str().unwrap_or_default().to_string(),
                input: part.get("input").cloned().unwrap_or(json!({})),
            }),
            _ => {}
        }
    }

    Ok(Completion {
        id: body["id"].as_str().unwrap_or_default().to_string(),
        model: body["model"].as_str().unwrap_or_default().to_string(),
        stop_reason: StopReason::from_claude(body["stop_reason"].as_str().unwrap_or("end_turn")),
        usage: TokenUsage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        },
        blocks,
    })
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(PartialEq)]
enum OpenBlock {
    None,
    Text,
    Tool,
}

/// Renders canonical events as Claude SSE frames.
///
/// Emits `message_start` + `content_block_start(0, text)` up front, tool
/// blocks at advancing indices, and always terminates with `message_delta`
/// + `message_stop` even on a truncated event sequence.
pub struct ClaudeStreamRenderer {
    id: String,
    model: String,
    block_index: usize,
    open: OpenBlock,
    saw_tool: bool,
    started: bool,
    finished: bool,
    usage: TokenUsage,
}

impl ClaudeStreamRenderer {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            block_index: 0,
            open: OpenBlock::None,
            saw_tool: false,
            started: false,
            finished: false,
            usage: TokenUsage::default(),
        }
    }

    fn frame(event_type: &str, data: Value) -> String {
        format!("event: {event_type}\ndata: {data}\n\n")
    }

    fn start_frames(&mut self, input_tokens: u32) -> Vec<String> {
        self.started = true;
        self.open = OpenBlock::Text;
        self.usage.input_tokens = input_tokens;
        vec![
            Self::frame(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": self.id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "usage": {"input_tokens": input_tokens, "output_tokens": 0},
                    }
                }),
            ),
            Self::frame(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""},
                }),
            ),
        ]
    }

    fn ensure_started(&mut self, frames: &mut Vec<String>) {
        if !self.started {
            frames.extend(self.start_frames(0));
        }
    }

    fn close_open_block(&mut self, frames: &mut Vec<String>) {
        if self.open != OpenBlock::None {
            frames.push(Self::frame(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": self.block_index}),
            ));
            self.open = OpenBlock::None;
        }
    }

    pub fn render(&mut self, event: &Event) -> Vec<String> {
        let mut frames = Vec::new();
        match event {
            Event::MessageStart { input_tokens, .. } => {
                if !self.started {
                    frames.extend(self.start_frames(*input_tokens));
                }
            }
            Event::TextDelta(text) => {
                self.ensure_started(&mut frames);
                if self.open == OpenBlock::None {
                    // Text after a tool block opens a fresh text block.
                    self.block_index += 1;
                    self.open = OpenBlock::Text;
                    frames.push(Self::frame(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {"type": "text", "text": ""},
                        }),
                    ));
                }
                frames.push(Self::frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
            Event::ToolUseStart { id, name } => {
                self.ensure_started(&mut frames);
                self.close_open_block(&mut frames);
                self.block_index += 1;
                self.open = OpenBlock::Tool;
                self.saw_tool = true;
                frames.push(Self::frame(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                    }),
                ));
            }
            Event::ToolInputDelta(part) => {
                self.ensure_started(&mut frames);
                frames.push(Self::frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "input_json_delta", "partial_json": part},
                    }),
                ));
            }
            Event::ToolUseStop => {
                if self.open == OpenBlock::Tool {
                    self.close_open_block(&mut frames);
                }
            }
            Event::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.usage = TokenUsage {
                    input_tokens: *input_tokens,
                    output_tokens: *output_tokens,
                };
            }
            Event::MessageStop {
                stop_reason,
                output_tokens,
            } => {
                self.ensure_started(&mut frames);
                if *output_tokens > 0 {
                    self.usage.output_tokens = *output_tokens;
                }
                self.close_open_block(&mut frames);
                let reason = if self.saw_tool {
                    StopReason::ToolUse
                } else {
                    *stop_reason
                };
                frames.push(Self::frame(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": reason.as_claude(), "stop_sequence": null},
                        "usage": {"output_tokens": self.usage.output_tokens},
                    }),
                ));
                frames.push(Self::frame("message_stop", json!({"type": "message_stop"})));
                self.finished = true;
            }
        }
        frames
    }

    /// EOF cleanup: close any still-open block and terminate the message.
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

/// Parses Claude SSE payloads into canonical events.
#[derive(Default)]
pub struct ClaudeStreamParser {
    in_tool: bool,
    stop_reason: Option<StopReason>,
    output_tokens: u32,
    stopped: bool,
}

impl ClaudeStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one SSE `data:` payload.
    pub fn parse(&mut self, data: &str) -> Result<Vec<Event>> {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| Error::Decode(format!("claude stream event: {e}")))?;
        let mut events = Vec::new();

        match value["type"].as_str().unwrap_or("") {
            "message_start" => {
                let msg = &value["message"];
                events.push(Event::MessageStart {
                    model: msg["model"].as_str().unwrap_or_default().to_string(),
                    input_tokens: msg["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                });
            }
            "content_block_start" => {
                let block = &value["content_block"];
                if block["type"] == "tool_use" {
                    self.in_tool = true;
                    events.push(Event::ToolUseStart {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                    });
                }
            }
            "content_block_delta" => match value["delta"]["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    if let Some(t) = value["delta"]["text"].as_str() {
                        events.push(Event::TextDelta(t.to_string()));
                    }
                }
                "input_json_delta" => {
                    if let Some(p) = value["delta"]["partial_json"].as_str() {
                        events.push(Event::ToolInputDelta(p.to_string()));
                    }
                }
                _ => {}
            },
            "content_block_stop" => {
                if self.in_tool {
                    self.in_tool = false;
                    events.push(Event::ToolUseStop);
                }
            }
            "message_delta" => {
                if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(StopReason::from_claude(reason));
                }
                if let Some(out) = value["usage"]["output_tokens"].as_u64() {
                    self.output_tokens = out as u32;
                }
            }
            "message_stop" => {
                self.stopped = true;
                events.push(Event::MessageStop {
                    stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                    output_tokens: self.output_tokens,
                });
            }
            // ping and unknown event types are ignored.
            _ => {}
        }
        Ok(events)
    }

    /// Whether a `message_stop` was observed.
    pub fn stopped(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_system_array() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 512,
            "system": [
                {"type": "text", "text": "Line one."},
                {"type": "text", "text": "Line two."}
            ],
            "messages": [{"role": "user", "content": "U"}]
        });
        let prompt = parse_request(&body).unwrap();
        assert_eq!(prompt.system.as_deref(), Some("Line one.\nLine two."));
    }

    #[test]
    fn test_request_round_trip_with_tools() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 256,
            "system": "S",
            "messages": [
                {"role": "user", "content": "U"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "A"},
                    {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "found"}
                ]}
            ],
            "tools": [{"name": "search", "description": "d", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "auto"}
        });
        let prompt = parse_request(&body).unwrap();
        let reparsed = parse_request(&render_request(&prompt)).unwrap();
        assert_eq!(prompt, reparsed);
    }

    #[test]
    fn test_response_round_trip() {
        let completion = Completion {
            id: "msg_1".into(),
            model: "claude-sonnet-4-5".into(),
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens: 9,
                output_tokens: 4,
            },
            blocks: vec![
                CompletionBlock::Text("Let me check.".into()),
                CompletionBlock::ToolUse {
                    id: "tu_9".into(),
                    name: "lookup".into(),
                    input: json!({"key": "v"}),
                },
            ],
        };
        let reparsed = parse_response(&render_response(&completion)).unwrap();
        assert_eq!(reparsed, completion);
    }

    /// The streamed frame sequence for text-then-tool matches the wire shape
    /// clients expect: blocks 0 (text) and 1 (tool) with stop events between.
    #[test]
    fn test_stream_renderer_block_discipline() {
        let mut renderer = ClaudeStreamRenderer::new("claude-sonnet-4-5");
        let events = [
            Event::MessageStart {
                model: "claude-sonnet-4-5".into(),
                input_tokens: 12,
            },
            Event::TextDelta("Thinking…".into()),
            Event::ToolUseStart {
                id: "tu_1".into(),
                name: "search".into(),
            },
            Event::ToolInputDelta("{\"".into()),
            Event::ToolInputDelta("q\":\"x\"}".into()),
            Event::ToolUseStop,
            Event::MessageStop {
                stop_reason: StopReason::EndTurn,
                output_tokens: 6,
            },
        ];
        let frames: Vec<String> = events.iter().flat_map(|e| renderer.render(e)).collect();
        let types: Vec<&str> = frames
            .iter()
            .map(|f| f.split('\n').next().unwrap().trim_start_matches("event: "))
            .collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        // Tool block carries index 1.
        assert!(frames[4].contains("\"index\":1"));
        assert!(frames[4].contains("\"tu_1\""));
        // Tool presence forces the tool_use stop reason.
        assert!(frames[8].contains("\"stop_reason\":\"tool_use\""));
        assert!(frames[8].contains("\"output_tokens\":6"));
    }

    #[test]
    fn test_stream_renderer_eof_closes_open_tool() {
        let mut renderer = ClaudeStreamRenderer::new("m");
        renderer.render(&Event::MessageStart {
            model: "m".into(),
            input_tokens: 0,
        });
        renderer.render(&Event::ToolUseStart {
            id: "tu".into(),
            name: "t".into(),
        });
        let frames = renderer.finish();
        let joined = frames.join("");
        assert!(joined.contains("content_block_stop"));
        assert!(joined.contains("message_stop"));
        // Second finish is a no-op.
        assert!(renderer.finish().is_empty());
    }

    #[test]
    fn test_stream_renderer_text_only_closes_block_zero() {
        let mut renderer = ClaudeStreamRenderer::new("m");
        let mut frames = Vec::new();
        frames.extend(renderer.render(&Event::TextDelta("hi".into())));
        frames.extend(renderer.finish());
        let joined = frames.join("");
        assert!(joined.contains("\"index\":0"));
        assert!(joined.contains("content_block_stop"));
        assert!(joined.contains("\"stop_reason\":\"end_turn\""));
    }

    #[test]
    fn test_stream_parser_round_trip() {
        // Render a sequence, feed the SSE payloads back through the parser,
        // and check the events survive.
        let mut renderer = ClaudeStreamRenderer::new("m");
        let original = [
            Event::MessageStart {
                model: "m".into(),
                input_tokens: 3,
            },
            Event::TextDelta("abc".into()),
            Event::ToolUseStart {
                id: "tu_1".into(),
                name: "f".into(),
            },
            Event::ToolInputDelta("{}".into()),
            Event::ToolUseStop,
            Event::MessageStop {
                stop_reason: StopReason::ToolUse,
                output_tokens: 2,
            },
        ];
        let frames: Vec<String> = original.iter().flat_map(|e| renderer.render(e)).collect();

        let mut parser = ClaudeStreamParser::new();
        let mut events = Vec::new();
        for frame in &frames {
            let data = frame
                .lines()
                .find_map(|l| l.strip_prefix("data: "))
                .unwrap();
            events.extend(parser.parse(data).unwrap());
        }
        assert_eq!(events.len(), original.len());
        assert!(matches!(&events[1], Event::TextDelta(t) if t == "abc"));
        assert!(matches!(
            events.last().unwrap(),
            Event::MessageStop { stop_reason: StopReason::ToolUse, output_tokens: 2 }
        ));
        assert!(parser.stopped());
    }
}
