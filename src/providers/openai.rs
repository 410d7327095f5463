//! OpenAI-style executor.
//!
//! Serves the official OpenAI API and the OpenAI-compatible back-ends
//! (Qwen, iFlow): the constants row supplies the endpoint and the account
//! supplies the bearer, everything else is identical.

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

pub struct OpenAiExecutor {
    auth: Arc<AuthManager>,
    http: reqwest::Client,
    provider: Provider,
    endpoint_override: Option<String>,
}

impl OpenAiExecutor {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self::for_provider(auth, Provider::OpenAi)
    }

    /// Qwen and iFlow speak the same wire format behind different
    /// endpoints.
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

    fn url(&self, account: &Account) -> String {
        if let Some(url) = &self.endpoint_override {
            return url.clone();
        }
        if let crate::auth::account::Credential::ApiKey {
            base_url: Some(base),
            ..
        } = &account.credential
        {
            return format!("{}/chat/completions", base.trim_end_matches('/'));
        }
        config::constants(self.provider).base_url.to_string()
    }

    fn upstream_body(&self, request: &ExecRequest, stream: bool) -> Result<serde_json::Value> {
        let body = request.body_json()?;
        let mut prompt = dialect::parse_request(request.source_dialect, &request.model, &body)?;
        prompt.params.stream = stream;
        prompt.model = request.model.clone();
        Ok(dialect::render_request(Dialect::OpenAiChat, &prompt))
    }

    async fn send(
        &self,
        account: &mut Account,
        body: &serde_json::Value,
        opts: &ExecOpts,
    ) -> Result<reqwest::Response> {
        let url = self.url(account);
        if let Some(tap) = opts.tap() {
            let bytes = serde_json::to_vec(body).unwrap_or_default();
            tap.record_request(&url, "POST", &[], &bytes, self.provider, &account.id);
        }

        let ua = config::constants(self.provider).user_agent;
        let response = send_with_refresh(&self.auth, account, |account| {
            self.http
                .post(&url)
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
impl Executor for OpenAiExecutor {
    fn identifier(&self) -> &'static str {
        match self.provider {
            Provider::Qwen => "qwen",
            Provider::IFlow => "iflow",
            _ => "openai",
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
        let body = self.upstream_body(request, false)?;
        let mut account = account.clone();

        let response = tokio::select! {
            r = self.send(&mut account, &body, opts) => r?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };
        let upstream: serde_json::Value = tokio::select! {
            r = response.json() => r.map_err(|e| Error::Decode(e.to_string()))?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };

        let completion = dialect::parse_response(Dialect::OpenAiChat, &upstream)?;
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
        let body = self.upstream_body(request, true)?;
        let mut account = account.clone();

        let response = tokio::select! {
            r = self.send(&mut account, &body, opts) => r?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };

        Ok(spawn_sse_pump(
            response,
            StreamParser::new(Dialect::OpenAiChat)?,
            ctx.clone(),
            opts.wire_tap.clone(),
        ))
    }

    async fn refresh(&self, account: &Account) -> Result<Account> {
        self.auth.refresh_now(&account.id).await
    }
}
