//! Claude messages executor.
//!
//! OAuth accounts present a bearer token; API-key accounts use the
//! `x-api-key` header. Streaming is standard Claude SSE.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::account::{Account, Credential, Provider};
use crate::auth::manager::AuthManager;
use crate::config;
use crate::dialect::{self, Dialect, Event, StreamParser};
use crate::error::{Error, Result};
use crate::providers::retry::send_with_refresh;
use crate::providers::{spawn_sse_pump, CancelToken, ExecOpts, ExecRequest, Executor};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeExecutor {
    auth: Arc<AuthManager>,
    http: reqwest::Client,
    endpoint_override: Option<String>,
}

impl ClaudeExecutor {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self {
            auth,
            http: reqwest::Client::builder()
                .connect_timeout(config::CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            endpoint_override: None,
        }
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_override = Some(url.into());
        self
    }

    fn url(&self) -> String {
        self.endpoint_override
            .clone()
            .unwrap_or_else(|| config::constants(Provider::Claude).base_url.to_string())
    }

    fn upstream_body(&self, request: &ExecRequest, stream: bool) -> Result<serde_json::Value> {
        let body = request.body_json()?;
        let mut prompt = dialect::parse_request(request.source_dialect, &request.model, &body)?;
        prompt.params.stream = stream;
        prompt.model = request.model.clone();
        Ok(dialect::render_request(Dialect::ClaudeMessages, &prompt))
    }

    async fn send(
        &self,
        account: &mut Account,
        body: &serde_json::Value,
        opts: &ExecOpts,
    ) -> Result<reqwest::Response> {
        let url = self.url();
        if let Some(tap) = opts.tap() {
            let bytes = serde_json::to_vec(body).unwrap_or_default();
            tap.record_request(&url, "POST", &[], &bytes, Provider::Claude, &account.id);
        }

        let response = send_with_refresh(&self.auth, account, |account| {
            let request = self
                .http
                .post(&url)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(body);
            let request = match &account.credential {
                Credential::ApiKey { key, .. } => request.header("x-api-key", key.clone()),
                _ => request.bearer_auth(account.access_token().to_string()),
            };
            request.send()
        })
        .await?;

        if let Some(tap) = opts.tap() {
            tap.record_response(response.status().as_u16(), &[]);
        }
        Ok(response)
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    fn identifier(&self) -> &'static str {
        "claude"
    }

    fn provider(&self) -> Provider {
        Provider::Claude
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

        let completion = dialect::parse_response(Dialect::ClaudeMessages, &upstream)?;
        debug!(account = %account.id, "claude request completed");
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
            StreamParser::new(Dialect::ClaudeMessages)?,
            ctx.clone(),
            opts.wire_tap.clone(),
        ))
    }

    async fn refresh(&self, account: &Account) -> Result<Account> {
        self.auth.refresh_now(&account.id).await
    }
}
