//! OpenAI chat-completions dialect: request/response/stream conversion.

use serde_json::{json, Value};

use crate::dialect::completion::{Completion, CompletionBlock, Event, StopReason, TokenUsage};
use crate::dialect::prompt::{
    Block, ImageData, Params, Prompt, PromptMessage, Role, ToolChoice, ToolSpec,
};
use crate::error::{Error, Result};

/// Parse an OpenAI chat request into the canonical form.
pub fn parse_request(body: &Value) -> Result<Prompt> {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let messages = body["messages"]
        .as_array()
        .ok_or_else(|| Error::Decode("openai request: messages is not an array".into()))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut out: Vec<PromptMessage> = Vec::new();

    for msg in messages {
        let role = msg["role"].as_str().unwrap_or("user");
        match role {
            "system" | "developer" => {
                let text = content_text(&msg["content"]);
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" => out.push(PromptMessage::user(parse_user_content(&msg["content"]))),
            "assistant" => {
                let mut blocks = Vec::new();
                let text = content_text(&msg["content"]);
                if !text.is_empty() {
                    blocks.push(Block::Text(text));
                }
                if let Some(calls) = msg["tool_calls"].as_array() {
                    for call in calls {
                        let args = call["function"]["arguments"].as_str().unwrap_or("{}");
                        blocks.push(Block::ToolUse {
                            id: call["id"].as_str().unwrap_or_default().to_string(),
                            name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                            input: serde_json::from_str(args).unwrap_or(json!({})),
                        });
                    }
                }
                out.push(PromptMessage::assistant(blocks));
            }
            "tool" => {
                out.push(PromptMessage::user(vec![Block::ToolResult {
                    tool_use_id: msg["tool_call_id"].as_str().unwrap_or_default().to_string(),
                    content: content_text(&msg["content"]),
                    is_error: false,
                }]));
            }
            _ => {}
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
        tool_choice: parse_tool_choice(&body["tool_choice"]),
        params: Params {
            max_tokens: body["max_tokens"]
                .as_u64()
                .or_else(|| body["max_completion_tokens"].as_u64())
                .map(|v| v as u32),
            temperature: body["temperature"].as_f64(),
            top_p: body["top_p"].as_f64(),
            top_k: None,
            stop: parse_stop(&body["stop"]),
            stream: body["stream"].as_bool().unwrap_or(false),
        },
    })
}

fn parse_tool_choice(value: &Value) -> Option<ToolChoice> {
    if let Some(s) = value.as_str() {
        return match s {
            "auto" => Some(ToolChoice::Auto),
            "required" => Some(ToolChoice::Required),
            "none" => Some(ToolChoice::None),
            _ => None,
        };
    }
    value["function"]["name"]
        .as_str()
        .map(|name| ToolChoice::Tool(name.to_string()))
}

fn parse_stop(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(arr) => arr
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Flatten `content` (string or parts array) to plain text.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p["type"].as_str() {
                Some("text") => p["text"].as_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn parse_user_content(content: &Value) -> Vec<Block> {
    match content {
        Value::String(s) => vec![Block::Text(s.clone())],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p["type"].as_str() {
                Some("text") => p["text"].as_str().map(Block::text),
                Some("image_url") => {
                    let url = p["image_url"]["url"].as_str()?;
                    Some(parse_image_url(url))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Split a `data:` URL into media type and payload; anything else stays a URL.
pub fn parse_image_url(url: &str) -> Block {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(";base64,") {
            return Block::Image {
                media_type: meta.to_string(),
                data: ImageData::Base64(data.to_string()),
            };
        }
    }
    let media_type = match url.rsplit('.').next() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Block::Image {
        media_type: media_type.to_string(),
        data: ImageData::Url(url.to_string()),
    }
}

/// Render the canonical form as an OpenAI chat request.
pub fn render_request(prompt: &Prompt) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = &prompt.system {
        messages.push(json!({"role": "system", "content": system}));
    }

    for msg in &prompt.messages {
        match msg.role {
            Role::User => {
                // Tool results become their own `tool` turns; the remainder
                // renders as user content.
                let mut user_parts: Vec<Value> = Vec::new();
                let mut has_image = false;
                for block in &msg.blocks {
                    match block {
                        Block::Text(t) => user_parts.push(json!({"type": "text", "text": t})),
                        Block::Image { media_type, data } => {
                            has_image = true;
                            let url = match data {
                                ImageData::Base64(b64) => format!("data:{media_type};base64,{b64}"),
                                ImageData::Url(u) => u.clone(),
                            };
                            user_parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                        }
                        Block::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        })),
                        Block::ToolUse { .. } => {}
                    }
                }
                if !user_parts.is_empty() {
                    let content = if !has_image && user_parts.len() == 1 {
                        // Single text part uses the string shorthand.
                        user_parts[0]["text"].clone()
                    } else {
                        Value::Array(user_parts)
                    };
                    messages.push(json!({"role": "user", "content": content}));
                }
            }
            Role::Assistant => {
                let text = msg.joined_text();
                let tool_calls: Vec<Value> = msg
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        Block::ToolUse { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": serde_json::to_string(input).unwrap_or_default(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();

                let mut message = json!({"role": "assistant"});
                message["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                if !tool_calls.is_empty() {
                    message["tool_calls"] = Value::Array(tool_calls);
                }
                messages.push(message);
            }
        }
    }

    let mut body = json!({
        "model": prompt.model,
        "messages": messages,
    });
    if let Some(mt) = prompt.params.max_tokens {
        body["max_tokens"] = json!(mt);
    }
    if let Some(t) = prompt.params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(tp) = prompt.params.top_p {
        body["top_p"] = json!(tp);
    }
    if !prompt.params.stop.is_empty() {
        body["stop"] = json!(prompt.params.stop);
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
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.schema,
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(choice) = &prompt.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
        };
    }
    body
}

/// Render a canonical completion as an OpenAI chat response.
pub fn render_response(completion: &Completion) -> Value {
    let text = completion.text();
    let tool_calls: Vec<Value> = completion
        .tool_uses()
        .map(|(id, name, input)| {
            json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": serde_json::to_string(input).unwrap_or_default(),
                }
            })
        })
        .collect();

    let mut message = json!({"role": "assistant"});
    message["content"] = if text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": format!("chatcmpl-{}", completion.id.trim_start_matches("msg_")),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": completion.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": completion.stop_reason.as_openai(),
        }],
        "usage": {
            "prompt_tokens": completion.usage.input_tokens,
            "completion_tokens": completion.usage.output_tokens,
            "total_tokens": completion.usage.total(),
        }
    })
}

/// Parse an OpenAI chat response into the canonical form.
pub fn parse_response(body: &Value) -> Result<Completion> {
    let choice = body["choices"]
        .as_array()
        .and_then(|c| c.first())
        .ok_or_else(|| Error::Decode("openai response: empty choices".into()))?;

    let mut blocks = Vec::new();
    if let Some(text) = choice["message"]["content"].as_str() {
        if !text.is_empty() {
            blocks.push(CompletionBlock::Text(text.to_string()));
        }
    }
    if let Some(calls) = choice["message"]["tool_calls"].as_array() {
        for call in calls {
            let args = call["function"]["arguments"].as_str().unwrap_or("{}");
            blocks.push(CompletionBlock::ToolUse {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                input: serde_json::from_str(args).unwrap_or(json!({})),
            });
        }
    }

    Ok(Completion {
        id: body["id"].as_str().unwrap_or_default().to_string(),
        model: body["model"].as_str().unwrap_or_default().to_string(),
        stop_reason: StopReason::from_openai(
            choice["finish_reason"].as_str().unwrap_or("stop"),
        ),
        usage: TokenUsage {
            input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        },
        blocks,
    })
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Renders canonical events as OpenAI SSE chunk frames.
pub struct OpenAiStreamRenderer {
    id: String,
    model: String,
    created: i64,
    usage: TokenUsage,
    tool_index: i64,
    saw_tool: bool,
    finished: bool,
}

impl OpenAiStreamRenderer {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            usage: TokenUsage::default(),
            tool_index: -1,
            saw_tool: false,
            finished: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<&TokenUsage>) -> String {
        let mut body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(u) = usage {
            body["usage"] = json!({
                "prompt_tokens": u.input_tokens,
                "completion_tokens": u.output_tokens,
                "total_tokens": u.total(),
            });
        }
        format!("data: {body}\n\n")
    }

    /// Render one canonical event into zero or more wire frames.
    pub fn render(&mut self, event: &Event) -> Vec<String> {
        match event {
            Event::MessageStart { input_tokens, .. } => {
                self.usage.input_tokens = *input_tokens;
                vec![self.chunk(json!({"role": "assistant", "content": ""}), None, None)]
            }
            Event::TextDelta(text) => {
                vec![self.chunk(json!({"content": text}), None, None)]
            }
            Event::ToolUseStart { id, name } => {
                self.tool_index += 1;
                self.saw_tool = true;
                vec![self.chunk(
                    json!({"tool_calls": [{
                        "index": self.tool_index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""},
                    }]}),
                    None,
                    None,
                )]
            }
            Event::ToolInputDelta(part) => {
                let index = self.tool_index.max(0);
                vec![self.chunk(
                    json!({"tool_calls": [{
                        "index": index,
                        "function": {"arguments": part},
                    }]}),
                    None,
                    None,
                )]
            }
            Event::ToolUseStop => Vec::new(),
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
                let reason = if self.saw_tool {
                    StopReason::ToolUse
                } else {
                    *stop_reason
                };
                let usage = self.usage;
                vec![
                    self.chunk(json!({}), Some(reason.as_openai()), Some(&usage)),
                    "data: [DONE]\n\n".to_string(),
                ]
            }
        }
    }

    /// EOF without a `MessageStop`: close the stream anyway so the client
    /// always sees the termination marker.
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

/// Parses OpenAI SSE chunk payloads into canonical events.
#[derive(Default)]
pub struct OpenAiStreamParser {
    started: bool,
    in_tool: bool,
}

impl OpenAiStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `data:` payload (already stripped of the prefix).
    pub fn parse(&mut self, data: &str) -> Result<Vec<Event>> {
        if data.trim() == "[DONE]" {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(data)
            .map_err(|e| Error::Decode(format!("openai stream chunk: {e}")))?;
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(Event::MessageStart {
                model: value["model"].as_str().unwrap_or_default().to_string(),
                input_tokens: 0,
            });
        }

        let Some(choice) = value["choices"].as_array().and_then(|c| c.first()) else {
            // Usage-only tail chunk.
            if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
                events.push(Event::Usage {
                    input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                });
            }
            return Ok(events);
        };

        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(Event::TextDelta(text.to_string()));
            }
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let name = call["function"]["name"].as_str().unwrap_or_default();
                if !name.is_empty() || call["id"].as_str().is_some_and(|s| !s.is_empty()) {
                    if self.in_tool {
                        events.push(Event::ToolUseStop);
                    }
                    self.in_tool = true;
                    events.push(Event::ToolUseStart {
                        id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: name.to_string(),
                    });
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        events.push(Event::ToolInputDelta(args.to_string()));
                    }
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            if self.in_tool {
                self.in_tool = false;
                events.push(Event::ToolUseStop);
            }
            let output_tokens = value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
            events.push(Event::MessageStop {
                stop_reason: StopReason::from_openai(reason),
                output_tokens,
            });
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_basic() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "say hi"}
            ],
            "max_tokens": 100,
            "stream": true
        });
        let prompt = parse_request(&body).unwrap();
        assert_eq!(prompt.model, "claude-sonnet-4-5");
        assert_eq!(prompt.system.as_deref(), Some("Be terse."));
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].joined_text(), "say hi");
        assert_eq!(prompt.params.max_tokens, Some(100));
        assert!(prompt.params.stream);
    }

    #[test]
    fn test_parse_request_tool_round() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ],
            "tools": [{
                "type": "function",
                "function": {"name": "get_weather", "description": "Get weather", "parameters": {"type": "object"}}
            }]
        });
        let prompt = parse_request(&body).unwrap();
        assert_eq!(prompt.tools.len(), 1);
        assert_eq!(prompt.tools[0].name, "get_weather");
        assert_eq!(prompt.messages.len(), 3);
        match &prompt.messages[1].blocks[0] {
            Block::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "get_weather");
                assert_eq!(*input, json!({"city": "SF"}));
            }
            other => panic!("expected tool use, got {other:?}"),
        }
        match &prompt.messages[2].blocks[0] {
            Block::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                assert_eq!(tool_use_id, "call_1");
                assert_eq!(content, "sunny");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn test_request_round_trip() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "S"},
                {"role": "user", "content": "U"},
                {"role": "assistant", "content": "A"},
            ],
            "temperature": 0.5,
            "stop": ["END"]
        });
        let prompt = parse_request(&body).unwrap();
        let rendered = render_request(&prompt);
        let reparsed = parse_request(&rendered).unwrap();
        assert_eq!(prompt, reparsed);
    }

    #[test]
    fn test_render_response_tool_use() {
        let completion = Completion {
            id: "msg_1".into(),
            model: "gpt-4o".into(),
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 5,
            },
            blocks: vec![CompletionBlock::ToolUse {
                id: "tu_1".into(),
                name: "search".into(),
                input: json!({"q": "x"}),
            }],
        };
        let body = render_response(&completion);
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert!(body["choices"][0]["message"]["content"].is_null());
        assert_eq!(
            body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "search"
        );
        assert_eq!(body["usage"]["total_tokens"], 8);
    }

    #[test]
    fn test_response_round_trip() {
        let completion = Completion {
            id: "msg_2".into(),
            model: "gpt-4o".into(),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 1,
                output_tokens: 2,
            },
            blocks: vec![CompletionBlock::Text("Hello.".into())],
        };
        let reparsed = parse_response(&render_response(&completion)).unwrap();
        assert_eq!(reparsed.text(), "Hello.");
        assert_eq!(reparsed.stop_reason, StopReason::EndTurn);
        assert_eq!(reparsed.usage, completion.usage);
    }

    #[test]
    fn test_stream_renderer_terminates() {
        let mut renderer = OpenAiStreamRenderer::new("gpt-4o");
        let frames: Vec<String> = [
            Event::MessageStart {
                model: "gpt-4o".into(),
                input_tokens: 2,
            },
            Event::TextDelta("Hi".into()),
            Event::MessageStop {
                stop_reason: StopReason::EndTurn,
                output_tokens: 1,
            },
        ]
        .iter()
        .flat_map(|e| renderer.render(e))
        .collect();

        assert!(frames[0].contains("\"role\":\"assistant\""));
        assert!(frames[1].contains("\"content\":\"Hi\""));
        assert!(frames[frames.len() - 2].contains("\"finish_reason\":\"stop\""));
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
        // finish() after a MessageStop emits nothing extra.
        assert!(renderer.finish().is_empty());
    }

    #[test]
    fn test_stream_renderer_finish_without_stop() {
        let mut renderer = OpenAiStreamRenderer::new("gpt-4o");
        renderer.render(&Event::TextDelta("x".into()));
        let frames = renderer.finish();
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn test_stream_parser_tool_sequence() {
        let mut parser = OpenAiStreamParser::new();
        let mut events = Vec::new();
        events.extend(parser.parse(r#"{"model":"gpt-4o","choices":[{"delta":{"role":"assistant","content":"Hi"}}]}"#).unwrap());
        events.extend(parser.parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search","arguments":""}}]}}]}"#).unwrap());
        events.extend(parser.parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":1}"}}]}}]}"#).unwrap());
        events.extend(parser.parse(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#).unwrap());
        events.extend(parser.parse("[DONE]").unwrap());

        assert!(matches!(events[0], Event::MessageStart { .. }));
        assert!(matches!(&events[1], Event::TextDelta(t) if t == "Hi"));
        assert!(matches!(&events[2], Event::ToolUseStart { id, name } if id == "call_1" && name == "search"));
        assert!(matches!(&events[3], Event::ToolInputDelta(p) if p == "{\"q\":1}"));
        assert!(matches!(events[4], Event::ToolUseStop));
        assert!(
            matches!(events[5], Event::MessageStop { stop_reason, .. } if stop_reason == StopReason::ToolUse)
        );
    }
}
