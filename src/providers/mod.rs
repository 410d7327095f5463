//! Provider executors: the per-provider adapters that issue upstream
//! requests and emit the canonical event stream.

pub mod claude;
pub mod gemini;
pub mod kiro;
pub mod openai;
pub mod retry;

pub use kiro::KiroExecutor;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::auth::account::{Account, Provider};
use crate::dialect::{Dialect, Event};
use crate::error::{Error, Result};

/// Cancellation handle propagated into every executor call.
///
/// Cancelling aborts the in-flight upstream request and closes the outbound
/// event channel; the usage reporter's failure path still runs.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the token is canceled.
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        // wait_for returns immediately if already true.
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One inbound request as the host hands it to an executor. Immutable
/// during execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Wire dialect of `payload`.
    pub source_dialect: Dialect,
    /// Model name after any host-side routing.
    pub model: String,
    /// Raw request body bytes in the source dialect.
    pub payload: Vec<u8>,
    /// The user-facing model name before aliasing, when it differs.
    pub original_model: Option<String>,
}

impl ExecRequest {
    pub fn new(source_dialect: Dialect, model: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            source_dialect,
            model: model.into(),
            payload,
            original_model: None,
        }
    }

    pub fn body_json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::Decode(format!("request body: {e}")))
    }
}

/// Best-effort host callbacks for request logging. All default to no-ops.
pub trait WireTap: Send + Sync {
    fn record_request(
        &self,
        _url: &str,
        _method: &str,
        _headers: &[(String, String)],
        _body: &[u8],
        _provider: Provider,
        _account: &str,
    ) {
    }

    fn record_response(&self, _status: u16, _headers: &[(String, String)]) {}

    fn append_chunk(&self, _bytes: &[u8]) {}

    fn record_error(&self, _error: &Error) {}
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct ExecOpts {
    pub wire_tap: Option<Arc<dyn WireTap>>,
}

impl ExecOpts {
    pub(crate) fn tap(&self) -> Option<&dyn WireTap> {
        self.wire_tap.as_deref()
    }
}

/// The uniform executor contract.
///
/// Executors are stateless beyond their constants and the auth manager
/// reference; everything per-request arrives through the arguments.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable identifier ("kiro", "openai", ...).
    fn identifier(&self) -> &'static str;

    fn provider(&self) -> Provider;

    /// One-shot call. Returns the response body rendered in the request's
    /// source dialect.
    async fn execute(
        &self,
        ctx: &CancelToken,
        account: &Account,
        request: &ExecRequest,
        opts: &ExecOpts,
    ) -> Result<Vec<u8>>;

    /// Streaming call. Emits the canonical event sequence; the host renders
    /// it into the source dialect with a [`crate::dialect::StreamRenderer`].
    async fn execute_stream(
        &self,
        ctx: &CancelToken,
        account: &Account,
        request: &ExecRequest,
        opts: &ExecOpts,
    ) -> Result<mpsc::Receiver<Result<Event>>>;

    /// Estimate the input token count of a request. Providers without an
    /// estimator report `Unsupported`.
    async fn count_tokens(&self, _account: &Account, _request: &ExecRequest) -> Result<u32> {
        Err(Error::Unsupported(self.identifier()))
    }

    /// Rotate the account's token through the auth manager and return the
    /// updated snapshot.
    async fn refresh(&self, account: &Account) -> Result<Account>;
}

/// Adapt an executor's event channel into a `Stream` for hosts that feed
/// the translated frames straight into a response body.
pub fn event_stream(
    rx: mpsc::Receiver<Result<Event>>,
) -> impl futures::Stream<Item = Result<Event>> + Send {
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

/// Pump an SSE response through a dialect stream parser into a bounded
/// event channel. Shared by the SSE-speaking executors.
///
/// The channel capacity bounds buffering: a slow consumer blocks the
/// upstream read. Cancellation closes the channel after a final
/// `Canceled` error.
pub(crate) fn spawn_sse_pump(
    response: reqwest::Response,
    mut parser: crate::dialect::StreamParser,
    ctx: CancelToken,
    tap: Option<Arc<dyn WireTap>>,
) -> mpsc::Receiver<Result<Event>> {
    use futures::StreamExt;

    let (tx, rx) = mpsc::channel(crate::config::EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut sse = crate::net::SseStream::new(response.bytes_stream());
        loop {
            let item = tokio::select! {
                i = sse.next() => i,
                _ = ctx.canceled() => {
                    let _ = tx.send(Err(Error::Canceled)).await;
                    return;
                }
            };
            match item {
                Some(Ok(event)) => {
                    if event.data.is_empty() {
                        continue;
                    }
                    if let Some(tap) = &tap {
                        tap.append_chunk(event.data.as_bytes());
                    }
                    if event.data.trim() == "[DONE]" {
                        continue;
                    }
                    match parser.parse(&event.data) {
                        Ok(events) => {
                            for event in events {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            if let Some(tap) = &tap {
                                tap.record_error(&e);
                            }
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(Error::Stream(e.to_string()))).await;
                    return;
                }
                None => return,
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.canceled().await;
                true
            })
        };
        token.cancel();
        assert!(token.is_canceled());
        assert!(waiter.await.unwrap());
        // Waiting on an already-canceled token returns immediately.
        token.canceled().await;
    }
}
