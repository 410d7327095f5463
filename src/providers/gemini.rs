//! Gemini generateContent executor.
//!
//! Also serves the Antigravity back-end, which speaks the same wire format
//! behind its own endpoint and OAuth identity.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::account::{Account, Provider};
use crate::auth::manager::AuthManager;
use crate::config;
use crate::dialect::{self, Dialect, Event, StreamParser};
use crate::error::{Error, Result};
use crate::providers::retry::send_with_refresh;
use crate::providers::{spawn_sse_pump, CancelToken, ExecOpts, ExecRequest, Executor};

pub struct GeminiExecutor {
    auth: Arc<AuthManager>,
    http: reqwest::Client,
    provider: Provider,
    endpoint_override: Option<String>,
}

impl GeminiExecutor {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self::for_provider(auth, Provider::Gemini)
    }

    pub fn for_provider(auth: Arc<AuthManager>, provider: Provider) -> Self {
        Self {
            auth,
            http: reqwest::Client::builder()
                .connect_timeout(config::CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            provider,
            endpoint_override: None,
        }
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_override = Some(url.into());
        self
    }

    fn url(&self, model: &str, stream: bool) -> String {
        if let Some(url) = &self.endpoint_override {
            return url.clone();
        }
        let base = config::constants(self.provider).base_url;
        match self.provider {
            Provider::Gemini => {
                let verb = if stream {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                format!("{base}/{model}:{verb}")
            }
            // Antigravity's internal endpoint is verb-complete already.
            _ => base.to_string(),
        }
    }

    fn upstream_body(&self, request: &ExecRequest) -> Result<serde_json::Value> {
        let body = request.body_json()?;
        let prompt = dialect::parse_request(request.source_dialect, &request.model, &body)?;
        Ok(dialect::render_request(Dialect::GeminiGenerateContent, &prompt))
    }

    async fn send(
        &self,
        account: &mut Account,
        url: &str,
        body: &serde_json::Value,
        opts: &ExecOpts,
    ) -> Result<reqwest::Response> {
        if let Some(tap) = opts.tap() {
            let bytes = serde_json::to_vec(body).unwrap_or_default();
            tap.record_request(url, "POST", &[], &bytes, self.provider, &account.id);
        }

        let ua = config::constants(self.provider).user_agent;
        let response = send_with_refresh(&self.auth, account, |account| {
            self.http
                .post(url)
                .bearer_auth(account.access_token().to_string())
                .header("user-agent", ua)
                .json(body)
                .send()
        })
        .await?;

        if let Some(tap) = opts.tap() {
            tap.record_response(response.status().as_u16(), &[]);
        }
        Ok(response)
    }
}

#[async_trait]
impl Executor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        match self.provider {
            Provider::Antigravity => "antigravity",
            _ => "gemini",
        }
    }

    fn provider(&self) -> Provider {
        self.provider
    }

    async fn execute(
        &self,
        ctx: &CancelToken,
        account: &Account,
        request: &ExecRequest,
        opts: &ExecOpts,
    ) -> Result<Vec<u8>> {
        let body = self.upstream_body(request)?;
        let url = self.url(&request.model, false);
        let mut account = account.clone();

        let response = tokio::select! {
            r = self.send(&mut account, &url, &body, opts) => r?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };
        let upstream: serde_json::Value = tokio::select! {
            r = response.json() => r.map_err(|e| Error::Decode(e.to_string()))?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };

        let mut completion = dialect::parse_response(Dialect::GeminiGenerateContent, &upstream)?;
        if completion.model.is_empty() {
            completion.model = request.model.clone();
        }
        debug!(account = %account.id, provider = %self.provider, "request completed");
        let rendered = dialect::render_response(request.source_dialect, &completion);
        serde_json::to_vec(&rendered).map_err(|e| Error::Decode(e.to_string()))
    }

    async fn execute_stream(
        &self,
        ctx: &CancelToken,
        account: &Account,
        request: &ExecRequest,
        opts: &ExecOpts,
    ) -> Result<mpsc::Receiver<Result<Event>>> {
        let body = self.upstream_body(request)?;
        let url = self.url(&request.model, true);
        let mut account = account.clone();

        let response = tokio::select! {
            r = self.send(&mut account, &url, &body, opts) => r?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };

        Ok(spawn_sse_pump(
            response,
            StreamParser::new(Dialect::GeminiGenerateContent)?,
            ctx.clone(),
            opts.wire_tap.clone(),
        ))
    }

    async fn refresh(&self, account: &Account) -> Result<Account> {
        self.auth.refresh_now(&account.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryCredentialStore;
    use crate::auth::Credential;
    use serde_json::json;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn executor(server: &MockServer) -> (GeminiExecutor, Account) {
        let auth = Arc::new(AuthManager::new(
            Arc::new(MemoryCredentialStore::new()),
            Vec::new(),
        ));
        let account = Account::new(
            "gemini-1",
            Credential::OAuth {
                provider: Provider::Gemini,
                access_token: "g-at".into(),
                refresh_token: "rt".into(),
                expires_at: None,
                client_id: None,
                client_secret: None,
                email: None,
            },
        );
        auth.register(account.clone()).await.unwrap();
        let executor = GeminiExecutor::new(auth).with_endpoint(format!("{}/generate", server.uri()));
        (executor, account)
    }

    /// Claude-messages in, Gemini upstream, Claude-messages out.
    #[tokio::test]
    async fn test_execute_claude_to_gemini() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer g-at"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Bonjour."}]},
                    "finishReason": "STOP",
                    "index": 0
                }],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2},
                "modelVersion": "gemini-2.5-pro"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (executor, account) = executor(&server).await;
        let inbound = json!({
            "model": "gemini-2.5-pro",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "bonjour"}]
        });
        let request = ExecRequest::new(
            Dialect::ClaudeMessages,
            "gemini-2.5-pro",
            serde_json::to_vec(&inbound).unwrap(),
        );

        let bytes = executor
            .execute(&CancelToken::new(), &account, &request, &ExecOpts::default())
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["content"][0]["text"], "Bonjour.");
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["usage"]["input_tokens"], 3);
    }

    #[tokio::test]
    async fn test_execute_stream_gemini_sse() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Bon\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"jour\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"candidatesTokenCount\":3}}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse)
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let (executor, account) = executor(&server).await;
        let inbound = json!({
            "model": "gemini-2.5-pro",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "bonjour"}]
        });
        let request = ExecRequest::new(
            Dialect::ClaudeMessages,
            "gemini-2.5-pro",
            serde_json::to_vec(&inbound).unwrap(),
        );

        let mut rx = executor
            .execute_stream(&CancelToken::new(), &account, &request, &ExecOpts::default())
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            match event.unwrap() {
                Event::TextDelta(t) => text.push_str(&t),
                Event::MessageStop { output_tokens, .. } => assert_eq!(output_tokens, 3),
                _ => {}
            }
        }
        assert_eq!(text, "Bonjour");
    }
}
