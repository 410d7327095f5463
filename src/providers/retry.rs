//! Refresh-once-on-403 shared by all executors.
//!
//! A 403 means the bearer token went stale mid-flight: rotate it through
//! the auth manager (serialized per account) and re-send the same request
//! exactly once. A second 403 surfaces to the caller; 429 and 5xx surface
//! immediately as typed errors so the host can apply backoff.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::auth::account::Account;
use crate::auth::manager::AuthManager;
use crate::error::{Error, Result};

/// Send an upstream request, retrying once with a rotated token on 403.
///
/// `send` is re-invoked from the already-built canonical request, so the
/// retry never duplicates request-construction side effects. Returns the
/// successful response; non-2xx outcomes map to typed errors.
pub async fn send_with_refresh<F, Fut>(
    auth: &AuthManager,
    account: &mut Account,
    send: F,
) -> Result<reqwest::Response>
where
    F: Fn(Account) -> Fut,
    Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let mut retry = true;
    loop {
        let response = send(account.clone()).await.map_err(Error::Http)?;
        let status = response.status();

        if status == reqwest::StatusCode::FORBIDDEN && retry {
            retry = false;
            warn!(account = %account.id, "upstream returned 403, refreshing token and retrying");
            *account = auth.refresh_now(&account.id).await?;
            continue;
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(rate_limited(response.headers()));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upstream(status.as_u16(), body));
        }

        return Ok(response);
    }
}

/// Build a `RateLimited` error from a 429's headers.
pub fn rate_limited(headers: &reqwest::header::HeaderMap) -> Error {
    let retry_after = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    Error::RateLimited {
        retry_after_secs: retry_after.map(|d| d.as_secs()).unwrap_or(60),
        retry_after,
    }
}
