//! Per-request usage accounting and per-account quota reporting.

pub mod quota;

pub use quota::{fetch_quota, QuotaBonus, QuotaSnapshot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::auth::account::{Account, Provider};
use crate::auth::manager::AuthManager;
use crate::error::Error;

/// Classification label attached to a failed request.
pub fn classify(error: &Error) -> &'static str {
    match error {
        Error::NoAccount(_) => "no_account",
        Error::InvalidCredential(_) => "invalid_credential",
        Error::RefreshFailed { .. } => "refresh_failed",
        Error::RateLimited { .. } => "rate_limited",
        Error::Upstream { status, .. } if *status >= 500 => "upstream_5xx",
        Error::Upstream { .. } => "upstream_4xx",
        Error::Canceled => "canceled",
        Error::Decode(_) => "decode",
        Error::Unsupported(_) => "unsupported",
        Error::Stream(_) => "stream",
        Error::Http(_) => "network",
        Error::Storage { .. } => "storage",
    }
}

/// Records exactly one outcome per request.
///
/// Captures `(provider, model, account)` at entry; `success` / `failure`
/// run at most once between them, and dropping an unresolved recorder runs
/// the failure branch so counters survive abnormal exits. Cancellation
/// counts as a failure and changes no success counter.
pub struct RequestRecorder {
    auth: Arc<AuthManager>,
    provider: Provider,
    model: String,
    account_id: String,
    resolved: AtomicBool,
}

impl RequestRecorder {
    pub fn new(auth: Arc<AuthManager>, account: &Account, model: &str) -> Self {
        Self {
            auth,
            provider: account.provider(),
            model: model.to_string(),
            account_id: account.id.clone(),
            resolved: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Claim the single outcome slot. Returns false if already resolved.
    fn resolve(&self) -> bool {
        !self.resolved.swap(true, Ordering::AcqRel)
    }

    pub async fn success(&self) {
        if self.resolve() {
            self.auth.record_success(&self.account_id).await;
        }
    }

    pub async fn failure(&self, error: &Error) {
        if self.resolve() {
            warn!(
                account = %self.account_id,
                provider = %self.provider,
                model = %self.model,
                kind = classify(error),
                "request failed"
            );
            // Cancellation changes no counters; everything else counts.
            if !matches!(error, Error::Canceled) {
                self.auth.record_failure(&self.account_id, error).await;
            }
        }
    }
}

impl Drop for RequestRecorder {
    fn drop(&mut self) {
        if self.resolve() {
            // Abnormal exit: the failure branch still runs, detached.
            let auth = Arc::clone(&self.auth);
            let account_id = self.account_id.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    auth.record_failure(&account_id, &Error::Stream("request aborted".into()))
                        .await;
                });
            }
        }
    }
}
