//! Gemini generateContent dialect: request/response/stream conversion.
//!
//! Gemini function calls carry no ids; parse generates `toolu_` ids and
//! keeps a name map so the matching `functionResponse` parts can be paired
//! back up, and render resolves ids back to names from the prompt's own
//! tool-use blocks.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::dialect::completion::{Completion, CompletionBlock, Event, StopReason, TokenUsage};
use crate::dialect::prompt::{
    Block, ImageData, Params, Prompt, PromptMessage, Role, ToolChoice, ToolSpec,
};
use crate::error::{Error, Result};

/// Parse a Gemini generateContent request into the canonical form.
///
/// `model` comes from the URL path in the Gemini API, so it is passed in
/// separately by the host.
pub fn parse_request(model: &str, body: &Value) -> Result<Prompt> {
    let contents = body["contents"]
        .as_array()
        .ok_or_else(|| Error::Decode("gemini request: contents is not an array".into()))?;

    // functionCall parts carry no id: assign one per call and remember it by
    // name so the later functionResponse can be paired.
    let mut ids_by_name: HashMap<String, Vec<String>> = HashMap::new();
    let mut messages = Vec::new();

    for content in contents {
        let role = match content["role"].as_str() {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        let mut blocks = Vec::new();
        for part in content["parts"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
            if let Some(text) = part["text"].as_str() {
                blocks.push(Block::Text(text.to_string()));
            } else if let Some(call) = part.get("functionCall").filter(|v| v.is_object()) {
                let name = call["name"].as_str().unwrap_or_default().to_string();
                let id = call["id"]
                    .as_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                ids_by_name.entry(name.clone()).or_default().push(id.clone());
                blocks.push(Block::ToolUse {
                    id,
                    name,
                    input: call.get("args").cloned().unwrap_or(json!({})),
                });
            } else if let Some(resp) = part.get("functionResponse").filter(|v| v.is_object()) {
                let name = resp["name"].as_str().unwrap_or_default();
                let id = resp["id"]
                    .as_str()
                    .map(|s| s.to_string())
                    .or_else(|| {
                        ids_by_name
                            .get_mut(name)
                            .and_then(|ids| (!ids.is_empty()).then(|| ids.remove(0)))
                    })
                    .unwrap_or_default();
                let content = match &resp["response"] {
                    Value::String(s) => s.clone(),
                    other if other.is_object() => other["result"]
                        .as_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| other.to_string()),
                    other => other.to_string(),
                };
                blocks.push(Block::ToolResult {
                    tool_use_id: id,
                    content,
                    is_error: false,
                });
            } else if let Some(inline) = part.get("inlineData").filter(|v| v.is_object()) {
                blocks.push(Block::Image {
                    media_type: inline["mimeType"].as_str().unwrap_or("image/png").to_string(),
                    data: ImageData::Base64(inline["data"].as_str().unwrap_or_default().to_string()),
                });
            }
        }
        messages.push(PromptMessage { role, blocks });
    }

    let tools = body["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .flat_map(|t| {
                    t["functionDeclarations"]
                        .as_array()
                        .map(|a| a.as_slice())
                        .unwrap_or(&[])
                        .iter()
                        .filter_map(|f| {
                            Some(ToolSpec {
                                name: f["name"].as_str()?.to_string(),
                                description: f["description"].as_str().unwrap_or_default().to_string(),
                                schema: f.get("parameters").cloned().unwrap_or(json!({})),
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        })
        .unwrap_or_default();

    let gen = &body["generationConfig"];
    Ok(Prompt {
        model: model.to_string(),
        system: system_text(&body["systemInstruction"]),
        messages,
        tools,
        tool_choice: parse_tool_choice(&body["toolConfig"]),
        params: Params {
            max_tokens: gen["maxOutputTokens"].as_u64().map(|v| v as u32),
            temperature: gen["temperature"].as_f64(),
            top_p: gen["topP"].as_f64(),
            top_k: gen["topK"].as_u64().map(|v| v as u32),
            stop: gen["stopSequences"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            stream: false,
        },
    })
}

fn system_text(value: &Value) -> Option<String> {
    let parts = value["parts"].as_array()?;
    let texts: Vec<&str> = parts.iter().filter_map(|p| p["text"].as_str()).collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

fn parse_tool_choice(value: &Value) -> Option<ToolChoice> {
    match value["functionCallingConfig"]["mode"].as_str()? {
        "AUTO" => Some(ToolChoice::Auto),
        "ANY" => Some(ToolChoice::Required),
        "NONE" => Some(ToolChoice::None),
        _ => None,
    }
}

/// Render the canonical form as a Gemini generateContent request body.
pub fn render_request(prompt: &Prompt) -> Value {
    // Resolve tool_use ids back to function names for functionResponse parts.
    let mut name_by_id: HashMap<&str, &str> = HashMap::new();
    for msg in &prompt.messages {
        for block in &msg.blocks {
            if let Block::ToolUse { id, name, .. } = block {
                name_by_id.insert(id, name);
            }
        }
    }

    let contents: Vec<Value> = prompt
        .messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            let parts: Vec<Value> = msg
                .blocks
                .iter()
                .map(|block| match block {
                    Block::Text(t) => json!({"text": t}),
                    Block::Image { media_type, data } => match data {
                        ImageData::Base64(b64) => {
                            json!({"inlineData": {"mimeType": media_type, "data": b64}})
                        }
                        ImageData::Url(url) => json!({"fileData": {"mimeType": media_type, "fileUri": url}}),
                    },
                    Block::ToolUse { id, name, input } => {
                        json!({"functionCall": {"id": id, "name": name, "args": input}})
                    }
                    Block::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        let name = name_by_id.get(tool_use_id.as_str()).copied().unwrap_or("");
                        json!({"functionResponse": {
                            "id": tool_use_id,
                            "name": name,
                            "response": {"result": content},
                        }})
                    }
                })
                .collect();
            json!({"role": role, "parts": parts})
        })
        .collect();

    let mut body = json!({"contents": contents});

    if let Some(system) = &prompt.system {
        body["systemInstruction"] = json!({"role": "user", "parts": [{"text": system}]});
    }

    let mut gen = serde_json::Map::new();
    if let Some(mt) = prompt.params.max_tokens {
        gen.insert("maxOutputTokens".into(), json!(mt));
    }
    if let Some(t) = prompt.params.temperature {
        gen.insert("temperature".into(), json!(t));
    }
    if let Some(tp) = prompt.params.top_p {
        gen.insert("topP".into(), json!(tp));
    }
    if let Some(tk) = prompt.params.top_k {
        gen.insert("topK".into(), json!(tk));
    }
    if !prompt.params.stop.is_empty() {
        gen.insert("stopSequences".into(), json!(prompt.params.stop));
    }
    if !gen.is_empty() {
        body["generationConfig"] = Value::Object(gen);
    }

    if !prompt.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": prompt
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.schema,
                }))
                .collect::<Vec<_>>()
        }]);
    }
    if let Some(choice) = &prompt.tool_choice {
        let mode = match choice {
            ToolChoice::Auto => "AUTO",
            ToolChoice::Required | ToolChoice::Tool(_) => "ANY",
            ToolChoice::None => "NONE",
        };
        body["toolConfig"] = json!({"functionCallingConfig": {"mode": mode}});
    }
    body
}

/// Render a canonical completion as a Gemini generateContent response.
pub fn render_response(completion: &Completion) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    for block in &completion.blocks {
        match block {
            CompletionBlock::Text(t) => parts.push(json!({"text": t})),
            CompletionBlock::ToolUse { id, name, input } => {
                parts.push(json!({"functionCall": {"id": id, "name": name, "args": input}}))
            }
        }
    }

    json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": completion.stop_reason.as_gemini(),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": completion.usage.input_tokens,
            "candidatesTokenCount": completion.usage.output_tokens,
            "totalTokenCount": completion.usage.total(),
        },
        "modelVersion": completion.model,
    })
}

/// Parse a Gemini generateContent response into the canonical form.
pub fn parse_response(body: &Value) -> Result<Completion> {
    let candidate = body["candidates"]
        .as_array()
        .and_then(|c| c.first())
        .ok_or_else(|| Error::Decode("gemini response: empty candidates".into()))?;

    let mut blocks = Vec::new();
    let mut has_tool = false;
    for part in candidate["content"]["parts"]
        .as_array()
        .map(|a| a.as_slice())
        .unwrap_or(&[])
    {
        if let Some(text) = part["text"].as_str() {
            blocks.push(CompletionBlock::Text(text.to_string()));
        } else if let Some(call) = part.get("functionCall").filter(|v| v.is_object()) {
            has_tool = true;
            blocks.push(CompletionBlock::ToolUse {
                id: call["id"]
                    .as_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple())),
                name: call["name"].as_str().unwrap_or_default().to_string(),
                input: call.get("args").cloned().unwrap_or(json!({})),
            });
        }
    }

    let finish = candidate["finishReason"].as_str().unwrap_or("STOP");
    let stop_reason = if has_tool {
        StopReason::ToolUse
    } else {
        StopReason::from_gemini(finish)
    };

    Ok(Completion {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        model: body["modelVersion"].as_str().unwrap_or_default().to_string(),
        stop_reason,
        usage: TokenUsage {
            input_tokens: body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0)
                as u32,
        },
        blocks,
    })
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Renders canonical events as Gemini streaming SSE frames.
pub struct GeminiStreamRenderer {
    model: String,
    usage: TokenUsage,
    tool_input: Option<(String, String, String)>,
    saw_tool: bool,
    finished: bool,
}

impl GeminiStreamRenderer {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            usage: TokenUsage::default(),
            tool_input: None,
            saw_tool: false,
            finished: false,
        }
    }

    fn frame(&self, parts: Vec<Value>, finish: Option<&str>) -> String {
        let mut candidate = json!({"content": {"role": "model", "parts": parts}, "index": 0});
        if let Some(reason) = finish {
            candidate["finishReason"] = json!(reason);
        }
        let mut body = json!({"candidates": [candidate], "modelVersion": self.model});
        if finish.is_some() {
            body["usageMetadata"] = json!({
                "promptTokenCount": self.usage.input_tokens,
                "candidatesTokenCount": self.usage.output_tokens,
                "totalTokenCount": self.usage.total(),
            });
        }
        format!("data: {body}\n\n")
    }

    /// Gemini carries complete function calls per frame, so tool input is
    /// buffered until the tool stops.
    pub fn render(&mut self, event: &Event) -> Vec<String> {
        match event {
            Event::MessageStart { input_tokens, .. } => {
                self.usage.input_tokens = *input_tokens;
                Vec::new()
            }
            Event::TextDelta(text) => vec![self.frame(vec![json!({"text": text})], None)],
            Event::ToolUseStart { id, name } => {
                self.saw_tool = true;
                self.tool_input = Some((id.clone(), name.clone(), String::new()));
                Vec::new()
            }
            Event::ToolInputDelta(part) => {
                if let Some((_, _, input)) = &mut self.tool_input {
                    input.push_str(part);
                }
                Vec::new()
            }
            Event::ToolUseStop => match self.tool_input.take() {
                Some((id, name, input)) => {
                    let args: Value = serde_json::from_str(&input).unwrap_or(json!({}));
                    vec![self.frame(
                        vec![json!({"functionCall": {"id": id, "name": name, "args": args}})],
                        None,
                    )]
                }
                None => Vec::new(),
            },
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
                let mut frames = Vec::new();
                // A dangling tool flushes before the terminal frame.
                if self.tool_input.is_some() {
                    frames.extend(self.render(&Event::ToolUseStop));
                    self.finished = true;
                }
                let reason = if self.saw_tool {
                    StopReason::ToolUse
                } else {
                    *stop_reason
                };
                frames.push(self.frame(Vec::new(), Some(reason.as_gemini())));
                frames
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

/// Parses Gemini streaming chunks into canonical events.
#[derive(Default)]
pub struct GeminiStreamParser {
    started: bool,
}

impl GeminiStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, data: &str) -> Result<Vec<Event>> {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| Error::Decode(format!("gemini stream chunk: {e}")))?;
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(Event::MessageStart {
                model: value["modelVersion"].as_str().unwrap_or_default().to_string(),
                input_tokens: value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0)
                    as u32,
            });
        }

        let Some(candidate) = value["candidates"].as_array().and_then(|c| c.first()) else {
            return Ok(events);
        };

        let mut saw_tool = false;
        for part in candidate["content"]["parts"]
            .as_array()
            .map(|a| a.as_slice())
            .unwrap_or(&[])
        {
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(Event::TextDelta(text.to_string()));
                }
            } else if let Some(call) = part.get("functionCall").filter(|v| v.is_object()) {
                saw_tool = true;
                events.push(Event::ToolUseStart {
                    id: call["id"]
                        .as_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple())),
                    name: call["name"].as_str().unwrap_or_default().to_string(),
                });
                events.push(Event::ToolInputDelta(
                    serde_json::to_string(call.get("args").unwrap_or(&json!({})))
                        .unwrap_or_default(),
                ));
                events.push(Event::ToolUseStop);
            }
        }

        if let Some(reason) = candidate["finishReason"].as_str() {
            let output = value["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;
            let stop_reason = if saw_tool {
                StopReason::ToolUse
            } else {
                StopReason::from_gemini(reason)
            };
            events.push(Event::MessageStop {
                stop_reason,
                output_tokens: output,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "U"}]},
                {"role": "model", "parts": [
                    {"text": "A"},
                    {"functionCall": {"id": "toolu_1", "name": "search", "args": {"q": "x"}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"id": "toolu_1", "name": "search", "response": {"result": "found"}}}
                ]}
            ],
            "systemInstruction": {"role": "user", "parts": [{"text": "S"}]},
            "generationConfig": {"maxOutputTokens": 256, "temperature": 0.5},
            "tools": [{"functionDeclarations": [{"name": "search", "description": "d", "parameters": {"type": "object"}}]}]
        });
        let prompt = parse_request("gemini-2.5-pro", &body).unwrap();
        assert_eq!(prompt.system.as_deref(), Some("S"));
        assert_eq!(prompt.tools.len(), 1);

        let reparsed = parse_request("gemini-2.5-pro", &render_request(&prompt)).unwrap();
        assert_eq!(prompt, reparsed);
    }

    #[test]
    fn test_function_call_without_id_gets_one() {
        let body = json!({
            "contents": [
                {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "f", "response": {"result": "r"}}}]}
            ]
        });
        let prompt = parse_request("gemini-2.5-pro", &body).unwrap();
        let Block::ToolUse { id, .. } = &prompt.messages[0].blocks[0] else {
            panic!("expected tool use");
        };
        let Block::ToolResult { tool_use_id, .. } = &prompt.messages[1].blocks[0] else {
            panic!("expected tool result");
        };
        assert!(!id.is_empty());
        // The generated id pairs the response back to the call.
        assert_eq!(id, tool_use_id);
    }

    #[test]
    fn test_response_round_trip() {
        let completion = Completion {
            id: "msg_x".into(),
            model: "gemini-2.5-pro".into(),
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens: 5,
                output_tokens: 3,
            },
            blocks: vec![
                CompletionBlock::Text("checking".into()),
                CompletionBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "f".into(),
                    input: json!({"a": 1}),
                },
            ],
        };
        let reparsed = parse_response(&render_response(&completion)).unwrap();
        assert_eq!(reparsed.text(), "checking");
        assert_eq!(reparsed.stop_reason, StopReason::ToolUse);
        assert_eq!(reparsed.usage, completion.usage);
        assert_eq!(reparsed.tool_uses().count(), 1);
    }

    #[test]
    fn test_stream_renderer_buffers_tool_input() {
        let mut renderer = GeminiStreamRenderer::new("gemini-2.5-pro");
        assert!(renderer
            .render(&Event::ToolUseStart {
                id: "toolu_1".into(),
                name: "f".into(),
            })
            .is_empty());
        assert!(renderer.render(&Event::ToolInputDelta("{\"a\":".into())).is_empty());
        assert!(renderer.render(&Event::ToolInputDelta("1}".into())).is_empty());
        let frames = renderer.render(&Event::ToolUseStop);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"functionCall\""));
        assert!(frames[0].contains("\"args\":{\"a\":1}"));

        let finals = renderer.render(&Event::MessageStop {
            stop_reason: StopReason::EndTurn,
            output_tokens: 2,
        });
        assert!(finals.last().unwrap().contains("\"finishReason\":\"STOP\""));
        assert!(finals.last().unwrap().contains("\"candidatesTokenCount\":2"));
    }

    #[test]
    fn test_stream_parser_text_and_finish() {
        let mut parser = GeminiStreamParser::new();
        let mut events = Vec::new();
        events.extend(
            parser
                .parse(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#)
                .unwrap(),
        );
        events.extend(
            parser
                .parse(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"candidatesTokenCount":2}}"#)
                .unwrap(),
        );
        assert!(matches!(events[0], Event::MessageStart { .. }));
        assert!(matches!(&events[1], Event::TextDelta(t) if t == "Hel"));
        assert!(matches!(&events[2], Event::TextDelta(t) if t == "lo"));
        assert!(matches!(
            events[3],
            Event::MessageStop { stop_reason: StopReason::EndTurn, output_tokens: 2 }
        ));
    }
}
