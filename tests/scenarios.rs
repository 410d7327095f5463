//! End-to-end scenarios against scripted upstreams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use switchboard::auth::{
    Account, AuthManager, AuthMethod, Credential, MemoryCredentialStore, Provider, RefreshDriver,
    TokenUpdate,
};
use switchboard::dialect::{
    self, accumulate, Block, Dialect, Event, Prompt, PromptMessage, StopReason, StreamRenderer,
};
use switchboard::providers::{CancelToken, ExecOpts, ExecRequest, Executor, KiroExecutor};
use switchboard::Error;

struct ScriptedDriver {
    calls: Arc<AtomicUsize>,
    token: String,
}

#[async_trait]
impl RefreshDriver for ScriptedDriver {
    fn provider(&self) -> Provider {
        Provider::Kiro
    }
    async fn refresh(
        &self,
        _http: &reqwest::Client,
        _account: &Account,
    ) -> switchboard::Result<TokenUpdate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TokenUpdate {
            access_token: self.token.clone(),
            refresh_token: None,
            expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            profile_arn: None,
        })
    }
}

fn kiro_account(token: &str, expired: bool) -> Account {
    Account::new(
        "kiro-us-east-1",
        Credential::Kiro {
            access_token: token.into(),
            refresh_token: "rt".into(),
            expires_at: Some(if expired {
                chrono::Utc::now() - chrono::Duration::hours(1)
            } else {
                chrono::Utc::now() + chrono::Duration::hours(6)
            }),
            region: "us-east-1".into(),
            profile_arn: None,
            client_id: None,
            client_secret: None,
            auth_method: AuthMethod::Social,
        },
    )
}

struct Harness {
    auth: Arc<AuthManager>,
    store: Arc<MemoryCredentialStore>,
    executor: KiroExecutor,
    refresh_calls: Arc<AtomicUsize>,
}

async fn harness(server: &MockServer, account: Account) -> Harness {
    let refresh_calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(MemoryCredentialStore::new());
    let auth = Arc::new(AuthManager::new(
        store.clone(),
        vec![Box::new(ScriptedDriver {
            calls: refresh_calls.clone(),
            token: "T-prime".into(),
        })],
    ));
    auth.register(account).await.unwrap();
    let executor =
        KiroExecutor::new(Arc::clone(&auth)).with_endpoint(format!("{}/generate", server.uri()));
    Harness {
        auth,
        store,
        executor,
        refresh_calls,
    }
}

fn openai_request(model: &str, content: &str) -> ExecRequest {
    let body = json!({"model": model, "messages": [{"role": "user", "content": content}]});
    ExecRequest::new(Dialect::OpenAiChat, model, serde_json::to_vec(&body).unwrap())
}

/// S1: non-stream text-only request translates to the expected
/// CodeWhisperer envelope and back to an OpenAI response.
#[tokio::test]
async fn s1_non_stream_text_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "conversationState": {
                "currentMessage": {
                    "userInputMessage": {
                        "content": "say hi",
                        "modelId": "CLAUDE_SONNET_4_5_20250929_V1_0",
                        "origin": "AI_EDITOR",
                    }
                }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"content":"Hello."}"#))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, kiro_account("at", false)).await;
    let bytes = h
        .executor
        .execute(
            &CancelToken::new(),
            &kiro_account("at", false),
            &openai_request("claude-sonnet-4-5", "say hi"),
            &ExecOpts::default(),
        )
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello.");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    // No history for a single-turn conversation: the recorded request body
    // must not carry one.
    let requests = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(sent["conversationState"].get("history").is_none());
}

/// S2: streamed tool use renders the exact Claude SSE event sequence.
#[tokio::test]
async fn s2_stream_tool_use_claude_sse() {
    let server = MockServer::start().await;
    let upstream = concat!(
        r#"{"content":"Thinking…"}"#,
        r#"{"name":"search","toolUseId":"tu_1","input":"{\""}"#,
        r#"{"input":"q\":\"x\"}"}"#,
        r#"{"stop":true}"#,
    );
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(upstream))
        .mount(&server)
        .await;

    let h = harness(&server, kiro_account("at", false)).await;
    let mut rx = h
        .executor
        .execute_stream(
            &CancelToken::new(),
            &kiro_account("at", false),
            &openai_request("claude-sonnet-4-5", "hi"),
            &ExecOpts::default(),
        )
        .await
        .unwrap();

    // Render the canonical events the way the host would for a
    // Claude-dialect client.
    let mut renderer = StreamRenderer::new(Dialect::ClaudeMessages, "claude-sonnet-4-5");
    let mut frames = Vec::new();
    while let Some(event) = rx.recv().await {
        frames.extend(renderer.render(&event.unwrap()));
    }
    frames.extend(renderer.finish());

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
    assert!(frames[1].contains("\"index\":0"));
    assert!(frames[2].contains("Thinking…"));
    assert!(frames[4].contains("\"index\":1"));
    assert!(frames[4].contains("\"name\":\"search\""));
    assert!(frames[4].contains("\"tu_1\""));
    assert!(frames[5].contains("{\\\""));
    assert!(frames[8].contains("\"stop_reason\":\"tool_use\""));
}

/// S3: consecutive identical text records are emitted exactly once.
#[tokio::test]
async fn s3_duplicate_text_records_deduplicated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
            r#"{"content":"abc"}"#,
            r#"{"content":"abc"}"#,
            r#"{"content":"def"}"#,
        )))
        .mount(&server)
        .await;

    let h = harness(&server, kiro_account("at", false)).await;
    let mut rx = h
        .executor
        .execute_stream(
            &CancelToken::new(),
            &kiro_account("at", false),
            &openai_request("claude-sonnet-4-5", "hi"),
            &ExecOpts::default(),
        )
        .await
        .unwrap();

    let mut texts = Vec::new();
    while let Some(event) = rx.recv().await {
        if let Event::TextDelta(t) = event.unwrap() {
            texts.push(t);
        }
    }
    assert_eq!(texts, vec!["abc", "def"]);
}

/// S4: a Claude-dialect system prompt folds into the first user turn with
/// no synthetic history entry.
#[tokio::test]
async fn s4_system_prompt_folding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"content":"ok"}"#))
        .mount(&server)
        .await;

    let h = harness(&server, kiro_account("at", false)).await;
    let inbound = json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 32,
        "system": "S",
        "messages": [{"role": "user", "content": "U"}]
    });
    let request = ExecRequest::new(
        Dialect::ClaudeMessages,
        "claude-sonnet-4-5",
        serde_json::to_vec(&inbound).unwrap(),
    );
    h.executor
        .execute(
            &CancelToken::new(),
            &kiro_account("at", false),
            &request,
            &ExecOpts::default(),
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        sent["conversationState"]["currentMessage"]["userInputMessage"]["content"],
        "S\n\nU"
    );
    assert!(sent["conversationState"].get("history").is_none());
}

/// S5: a 403 triggers exactly one refresh and one re-send; the rotated
/// token reaches the wire and the store.
#[tokio::test]
async fn s5_refresh_on_403() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer T-prime"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"content":"ok"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, kiro_account("stale", true)).await;
    let before = chrono::Utc::now();
    let bytes = h
        .executor
        .execute(
            &CancelToken::new(),
            &kiro_account("stale", true),
            &openai_request("claude-sonnet-4-5", "hi"),
            &ExecOpts::default(),
        )
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "ok");
    assert_eq!(h.refresh_calls.load(Ordering::SeqCst), 1);

    // Rotated token and refresh timestamp persisted through the store.
    use switchboard::auth::CredentialStore as _;
    let stored = h.store.load("kiro-us-east-1").unwrap();
    assert_eq!(stored.access_token(), "T-prime");
    let last_refresh = h
        .auth
        .get("kiro-us-east-1")
        .await
        .unwrap()
        .last_refresh
        .expect("refresh recorded");
    assert!(last_refresh >= before);
    assert!(last_refresh <= chrono::Utc::now() + chrono::Duration::seconds(1));
}

/// Retry-once property: 403 then 403 makes exactly two upstream calls and
/// surfaces the second.
#[tokio::test]
async fn retry_once_second_403_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .expect(2)
        .mount(&server)
        .await;

    let h = harness(&server, kiro_account("stale", true)).await;
    let err = h
        .executor
        .execute(
            &CancelToken::new(),
            &kiro_account("stale", true),
            &openai_request("claude-sonnet-4-5", "hi"),
            &ExecOpts::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Upstream { status: 403, .. }));
    assert_eq!(h.refresh_calls.load(Ordering::SeqCst), 1);
}

/// S6: the synthesized Ollama `show` descriptor for a Claude model.
#[test]
fn s6_ollama_show_synthesis() {
    let body = dialect::ollama::show_response("claude-sonnet-4-5");
    assert_eq!(body["model_info"]["general.context_length"], 200_000);
    assert!(body["parameters"].as_str().unwrap().contains("num_ctx 200000"));
    let caps: Vec<&str> = body["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(caps.contains(&"tools"));
}

/// Stream-sum invariant: the streamed deltas concatenate to the non-stream
/// text for the same scripted upstream.
#[tokio::test]
async fn stream_sum_matches_non_stream() {
    let upstream = concat!(
        r#"{"content":"Hello, "}"#,
        r#"{"content":"world"}"#,
        r#"{"content":"!"}"#,
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(upstream))
        .mount(&server)
        .await;
    let h = harness(&server, kiro_account("at", false)).await;
    let account = kiro_account("at", false);

    let bytes = h
        .executor
        .execute(
            &CancelToken::new(),
            &account,
            &openai_request("claude-sonnet-4-5", "hi"),
            &ExecOpts::default(),
        )
        .await
        .unwrap();
    let non_stream: Value = serde_json::from_slice(&bytes).unwrap();
    let non_stream_text = non_stream["choices"][0]["message"]["content"]
        .as_str()
        .unwrap()
        .to_string();

    let mut rx = h
        .executor
        .execute_stream(
            &CancelToken::new(),
            &account,
            &openai_request("claude-sonnet-4-5", "hi"),
            &ExecOpts::default(),
        )
        .await
        .unwrap();
    let mut streamed = String::new();
    while let Some(event) = rx.recv().await {
        if let Event::TextDelta(t) = event.unwrap() {
            streamed.push_str(&t);
        }
    }

    assert_eq!(streamed, non_stream_text);
    assert_eq!(streamed, "Hello, world!");
}

/// Refresh monotonicity: expiry strictly advances across refreshes.
#[tokio::test]
async fn refresh_expiry_monotonic() {
    let server = MockServer::start().await;
    let h = harness(&server, kiro_account("at", true)).await;

    let mut last = h.auth.get("kiro-us-east-1").await.unwrap().expires_at().unwrap();
    for _ in 0..3 {
        let refreshed = h.auth.refresh_now("kiro-us-east-1").await.unwrap();
        let next = refreshed.expires_at().unwrap();
        assert!(next > last, "expiry must strictly advance");
        last = next;
    }
}

/// Cancellation aborts the stream and surfaces `Canceled`.
#[tokio::test]
async fn cancellation_closes_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"content":"slow"}"#)
                .set_delay(std::time::Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let h = harness(&server, kiro_account("at", false)).await;
    let ctx = CancelToken::new();
    let canceller = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            ctx.cancel();
        })
    };

    let err = h
        .executor
        .execute(
            &ctx,
            &kiro_account("at", false),
            &openai_request("claude-sonnet-4-5", "hi"),
            &ExecOpts::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled));
    canceller.await.unwrap();
}

// ---------------------------------------------------------------------------
// Property tests
// ---------------------------------------------------------------------------

fn arb_text() -> impl Strategy<Value = String> {
    // Printable text without lone control chars; keeps the JSON wire forms
    // honest without fighting escaping in assertions.
    proptest::string::string_regex("[ -~]{1,40}").unwrap()
}

proptest! {
    /// Translator round-trip preserves roles and text for every dialect
    /// pair, on arbitrary conversations.
    #[test]
    fn prop_round_trip_preserves_text(
        system in proptest::option::of(arb_text()),
        turns in proptest::collection::vec((any::<bool>(), arb_text()), 1..6),
    ) {
        let original = Prompt {
            model: "claude-sonnet-4-5".into(),
            system,
            messages: turns
                .iter()
                .map(|(assistant, text)| {
                    if *assistant {
                        PromptMessage::assistant(vec![Block::text(text.clone())])
                    } else {
                        PromptMessage::user(vec![Block::text(text.clone())])
                    }
                })
                .collect(),
            ..Default::default()
        };

        for from in [Dialect::OpenAiChat, Dialect::ClaudeMessages, Dialect::GeminiGenerateContent] {
            for to in [Dialect::OpenAiChat, Dialect::ClaudeMessages, Dialect::GeminiGenerateContent] {
                let source = dialect::render_request(from, &original);
                let translated =
                    dialect::translate_request(from, to, &original.model, &source, false).unwrap();
                let back = dialect::parse_request(to, &original.model, &translated).unwrap();

                prop_assert_eq!(&back.system, &original.system);
                prop_assert_eq!(back.messages.len(), original.messages.len());
                for (a, b) in original.messages.iter().zip(&back.messages) {
                    prop_assert_eq!(a.role, b.role);
                    prop_assert_eq!(a.joined_text(), b.joined_text());
                }
            }
        }
    }

    /// Accumulating a text-delta sequence always reproduces the
    /// concatenated text, whatever the chunking.
    #[test]
    fn prop_accumulate_concatenates_deltas(chunks in proptest::collection::vec(arb_text(), 0..12)) {
        let mut events = vec![Event::MessageStart { model: "m".into(), input_tokens: 0 }];
        events.extend(chunks.iter().cloned().map(Event::TextDelta));
        events.push(Event::MessageStop { stop_reason: StopReason::EndTurn, output_tokens: 0 });

        let completion = accumulate("m", events);
        prop_assert_eq!(completion.text(), chunks.concat());
    }
}
