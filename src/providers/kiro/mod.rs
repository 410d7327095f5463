//! Kiro / AWS CodeWhisperer executor.
//!
//! Translates the inbound dialect to the CodeWhisperer conversation
//! payload, speaks the AWS event-stream framing on the way back, and
//! synthesizes the canonical event sequence.

pub mod payload;
pub mod recognizer;
pub mod stream;
pub mod tokens;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::account::{Account, AuthMethod, Credential, Provider};
use crate::auth::manager::AuthManager;
use crate::config;
use crate::dialect::{self, Event};
use crate::error::{Error, Result};
use crate::net::inflate;
use crate::providers::retry::send_with_refresh;
use crate::providers::{CancelToken, ExecOpts, ExecRequest, Executor};

use recognizer::Recognizer;
use stream::EventAssembler;

/// SHA-256 hex of the first non-loopback MAC address, falling back to the
/// all-zero address when none is available.
pub fn machine_fingerprint() -> String {
    let mac = mac_address::get_mac_address()
        .ok()
        .flatten()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "00:00:00:00:00:00".to_string());
    let digest = Sha256::digest(mac.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct KiroExecutor {
    auth: Arc<AuthManager>,
    http: reqwest::Client,
    fingerprint: String,
    /// Overrides the region-templated endpoint; tests point this at a mock.
    endpoint_override: Option<String>,
}

impl KiroExecutor {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config::CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            auth,
            http,
            fingerprint: machine_fingerprint(),
            endpoint_override: None,
        }
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_override = Some(url.into());
        self
    }

    fn api_url(&self, account: &Account) -> String {
        match &self.endpoint_override {
            Some(url) => url.clone(),
            None => config::kiro_api_url(account.region()),
        }
    }

    fn headers(&self, token: &str) -> reqwest::header::HeaderMap {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert("authorization", value);
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("amz-sdk-request"),
            HeaderValue::from_static("attempt=1; max=1"),
        );
        headers.insert(
            "x-amzn-kiro-agent-mode",
            HeaderValue::from_static(config::KIRO_AGENT_MODE),
        );

        let ua = format!(
            "aws-sdk-js/{sdk} ua/2.1 os/other lang/js md/nodejs#{node} \
             api/codewhispererstreaming#{sdk} m/E KiroIDE-{f}",
            sdk = config::KIRO_SDK_VERSION,
            node = config::KIRO_NODE_VERSION,
            f = self.fingerprint,
        );
        if let Ok(value) = HeaderValue::from_str(&ua) {
            headers.insert("user-agent", value);
        }
        let amz_ua = format!(
            "aws-sdk-js/{sdk} KiroIDE-{f}",
            sdk = config::KIRO_SDK_VERSION,
            f = self.fingerprint,
        );
        if let Ok(value) = HeaderValue::from_str(&amz_ua) {
            headers.insert("x-amz-user-agent", value);
        }
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(HeaderName::from_static("amz-sdk-invocation-id"), value);
        }
        headers
    }

    /// The profile ARN rides along only for social-auth accounts.
    fn profile_arn(account: &Account) -> Option<&str> {
        match &account.credential {
            Credential::Kiro {
                profile_arn: Some(arn),
                auth_method: AuthMethod::Social,
                ..
            } => Some(arn.as_str()),
            _ => None,
        }
    }

    /// Translate the inbound request and build the upstream payload, with
    /// the estimated input token count of the translated request.
    fn prepare(
        &self,
        account: &Account,
        request: &ExecRequest,
    ) -> Result<(serde_json::Value, u32)> {
        let body = request.body_json()?;
        let prompt = dialect::parse_request(request.source_dialect, &request.model, &body)?;
        let model_id = config::resolve_kiro_model(&request.model);
        let upstream = payload::build_payload(&prompt, &model_id, Self::profile_arn(account))?;
        let input_tokens = tokens::estimate_prompt(&prompt);
        Ok((upstream, input_tokens))
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
            tap.record_request(url, "POST", &[], &bytes, Provider::Kiro, &account.id);
        }

        let response = send_with_refresh(&self.auth, account, |account| {
            self.http
                .post(url)
                .headers(self.headers(account.access_token()))
                .json(body)
                .send()
        })
        .await?;

        if let Some(tap) = opts.tap() {
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect();
            tap.record_response(response.status().as_u16(), &headers);
        }
        Ok(response)
    }
}

#[async_trait]
impl Executor for KiroExecutor {
    fn identifier(&self) -> &'static str {
        "kiro"
    }

    fn provider(&self) -> Provider {
        Provider::Kiro
    }

    async fn execute(
        &self,
        ctx: &CancelToken,
        account: &Account,
        request: &ExecRequest,
        opts: &ExecOpts,
    ) -> Result<Vec<u8>> {
        let (upstream, input_tokens) = self.prepare(account, request)?;
        let url = self.api_url(account);
        let mut account = account.clone();

        let response = tokio::select! {
            r = self.send(&mut account, &url, &upstream, opts) => r?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };

        let encoding = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let raw = tokio::select! {
            r = response.bytes() => r.map_err(Error::Http)?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };
        let body = inflate(&raw, encoding.as_deref())?;

        // The non-stream body is the same event framing, drained in one go.
        let mut recognizer = Recognizer::new();
        let mut assembler = EventAssembler::new(&request.model, input_tokens);
        let mut events = Vec::new();
        for wire in recognizer.push(&body) {
            events.extend(assembler.on_wire(wire));
        }
        events.extend(assembler.finish());

        let completion = dialect::accumulate(&request.model, events);
        debug!(
            account = %account.id,
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "kiro request completed"
        );
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
        let (upstream, input_tokens) = self.prepare(account, request)?;
        let url = self.api_url(account);
        let mut account = account.clone();

        let response = tokio::select! {
            r = self.send(&mut account, &url, &upstream, opts) => r?,
            _ = ctx.canceled() => return Err(Error::Canceled),
        };

        let (tx, rx) = mpsc::channel(config::EVENT_CHANNEL_CAPACITY);
        let ctx = ctx.clone();
        let model = request.model.clone();
        let tap = opts.wire_tap.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut recognizer = Recognizer::new();
            let mut assembler = EventAssembler::new(&model, input_tokens);

            loop {
                let chunk = tokio::select! {
                    c = byte_stream.next() => c,
                    _ = ctx.canceled() => {
                        let _ = tx.send(Err(Error::Canceled)).await;
                        return;
                    }
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        if let Some(tap) = &tap {
                            tap.append_chunk(&bytes);
                        }
                        for wire in recognizer.push(&bytes) {
                            for event in assembler.on_wire(wire) {
                                // A full channel blocks here, back-pressuring
                                // the upstream read.
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "kiro stream read failed");
                        let _ = tx.send(Err(Error::Stream(e.to_string()))).await;
                        return;
                    }
                    None => break,
                }
            }

            for event in assembler.finish() {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn count_tokens(&self, _account: &Account, request: &ExecRequest) -> Result<u32> {
        let body = request.body_json()?;
        let prompt = dialect::parse_request(request.source_dialect, &request.model, &body)?;
        Ok(tokens::estimate_prompt(&prompt))
    }

    async fn refresh(&self, account: &Account) -> Result<Account> {
        self.auth.refresh_now(&account.id).await
    }
}
