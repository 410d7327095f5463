//! Per-provider token refresh drivers.
//!
//! A driver is a pure function over (account snapshot, HTTP client): it
//! sends the provider's refresh exchange and returns new token material.
//! Pool mutation and persistence are the auth manager's job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::auth::account::{Account, AuthMethod, Credential, Provider, TokenUpdate};
use crate::config;
use crate::error::{Error, Result};

/// Trait implemented by each provider's refresh routine.
#[async_trait]
pub trait RefreshDriver: Send + Sync {
    fn provider(&self) -> Provider;

    /// Exchange the refresh token for new token material.
    async fn refresh(&self, http: &reqwest::Client, account: &Account) -> Result<TokenUpdate>;
}

fn default_expires_in() -> i64 {
    3600
}

/// Response from the Kiro desktop back-channel refresh endpoint.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocialRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(default)]
    profile_arn: Option<String>,
}

/// Response from the AWS SSO OIDC token endpoint.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdcRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn expiry_from_now(expires_in: i64) -> Option<DateTime<Utc>> {
    Some(Utc::now() + chrono::Duration::seconds(expires_in))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::refresh_failed(status.as_u16(), body));
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Kiro
// ---------------------------------------------------------------------------

/// Refresh driver for Kiro / CodeWhisperer accounts.
///
/// Picks the endpoint from the account's auth method: social auth goes
/// through the desktop back-channel, IDC auth through the SSO OIDC token
/// endpoint with client credentials and `grant_type=refresh_token`.
pub struct KiroRefreshDriver;

#[async_trait]
impl RefreshDriver for KiroRefreshDriver {
    fn provider(&self) -> Provider {
        Provider::Kiro
    }

    async fn refresh(&self, http: &reqwest::Client, account: &Account) -> Result<TokenUpdate> {
        let Credential::Kiro {
            refresh_token,
            region,
            client_id,
            client_secret,
            auth_method,
            ..
        } = &account.credential
        else {
            return Err(Error::InvalidCredential(format!(
                "{}: not a kiro account",
                account.id
            )));
        };

        if refresh_token.is_empty() {
            return Err(Error::InvalidCredential(format!(
                "{}: missing refresh token",
                account.id
            )));
        }

        match auth_method {
            AuthMethod::Social => {
                let url = config::kiro_social_refresh_url(region);
                info!(account = %account.id, "refreshing kiro token (social)");

                let response = http
                    .post(&url)
                    .timeout(config::REFRESH_TIMEOUT)
                    .json(&serde_json::json!({ "refreshToken": refresh_token }))
                    .send()
                    .await?;
                let data: SocialRefreshResponse = check_status(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| Error::Decode(format!("social refresh response: {e}")))?;

                if data.access_token.is_empty() {
                    return Err(Error::refresh_failed(200, "response carried no accessToken"));
                }
                debug!(account = %account.id, "kiro token refreshed (social)");
                Ok(TokenUpdate {
                    access_token: data.access_token,
                    refresh_token: data.refresh_token,
                    expires_at: expiry_from_now(data.expires_in),
                    profile_arn: data.profile_arn,
                })
            }
            AuthMethod::Idc => {
                let client_id = client_id.as_deref().ok_or_else(|| {
                    Error::InvalidCredential(format!("{}: idc auth needs clientId", account.id))
                })?;
                let client_secret = client_secret.as_deref().ok_or_else(|| {
                    Error::InvalidCredential(format!("{}: idc auth needs clientSecret", account.id))
                })?;

                let url = config::kiro_idc_refresh_url(region);
                info!(account = %account.id, "refreshing kiro token (idc)");

                let response = http
                    .post(&url)
                    .timeout(config::REFRESH_TIMEOUT)
                    .json(&serde_json::json!({
                        "grantType": "refresh_token",
                        "clientId": client_id,
                        "clientSecret": client_secret,
                        "refreshToken": refresh_token,
                    }))
                    .send()
                    .await?;
                let data: IdcRefreshResponse = check_status(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| Error::Decode(format!("idc refresh response: {e}")))?;

                if data.access_token.is_empty() {
                    return Err(Error::refresh_failed(200, "response carried no accessToken"));
                }
                debug!(account = %account.id, "kiro token refreshed (idc)");
                Ok(TokenUpdate {
                    access_token: data.access_token,
                    refresh_token: data.refresh_token,
                    expires_at: expiry_from_now(data.expires_in),
                    profile_arn: None,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OAuth providers
// ---------------------------------------------------------------------------

/// Standard OAuth refresh response (snake_case).
#[derive(Deserialize)]
struct OAuthRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

/// Generic refresh driver for the desktop-OAuth providers (Claude, Gemini,
/// Qwen, iFlow, Antigravity). The token endpoint comes from the provider's
/// constants row; the exchange is a form-encoded `grant_type=refresh_token`.
pub struct OAuthRefreshDriver {
    provider: Provider,
}

impl OAuthRefreshDriver {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl RefreshDriver for OAuthRefreshDriver {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn refresh(&self, http: &reqwest::Client, account: &Account) -> Result<TokenUpdate> {
        let Credential::OAuth {
            refresh_token,
            client_id,
            client_secret,
            ..
        } = &account.credential
        else {
            return Err(Error::InvalidCredential(format!(
                "{}: not an oauth account",
                account.id
            )));
        };

        if refresh_token.is_empty() {
            return Err(Error::InvalidCredential(format!(
                "{}: missing refresh token",
                account.id
            )));
        }

        let url = config::constants(self.provider).refresh_url;
        info!(account = %account.id, provider = %self.provider, "refreshing oauth token");

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
        ];
        if let Some(id) = client_id {
            form.push(("client_id", id.clone()));
        }
        if let Some(secret) = client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = http
            .post(url)
            .timeout(config::REFRESH_TIMEOUT)
            .form(&form)
            .send()
            .await?;
        let data: OAuthRefreshResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Decode(format!("oauth refresh response: {e}")))?;

        if data.access_token.is_empty() {
            return Err(Error::refresh_failed(200, "response carried no access_token"));
        }
        debug!(account = %account.id, provider = %self.provider, "oauth token refreshed");
        Ok(TokenUpdate {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at: expiry_from_now(data.expires_in),
            profile_arn: None,
        })
    }
}

/// Build the default driver set, one per refreshable provider.
pub fn default_drivers() -> Vec<Box<dyn RefreshDriver>> {
    vec![
        Box::new(KiroRefreshDriver),
        Box::new(OAuthRefreshDriver::new(Provider::Claude)),
        Box::new(OAuthRefreshDriver::new(Provider::Gemini)),
        Box::new(OAuthRefreshDriver::new(Provider::Qwen)),
        Box::new(OAuthRefreshDriver::new(Provider::IFlow)),
        Box::new(OAuthRefreshDriver::new(Provider::Antigravity)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::account::AuthMethod;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn kiro_account(auth_method: AuthMethod) -> Account {
        Account::new(
            "kiro-test",
            Credential::Kiro {
                access_token: "old".into(),
                refresh_token: "rt".into(),
                expires_at: None,
                region: "us-east-1".into(),
                profile_arn: None,
                client_id: Some("cid".into()),
                client_secret: Some("cs".into()),
                auth_method,
            },
        )
    }

    /// Social refresh against a local mock: verifies the body shape and the
    /// expiry arithmetic without touching the real endpoint.
    #[tokio::test]
    async fn test_social_refresh_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refreshToken"))
            .and(body_partial_json(serde_json::json!({"refreshToken": "rt"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "fresh",
                "refreshToken": "rt2",
                "expiresIn": 7200
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let account = kiro_account(AuthMethod::Social);
        // Drive the exchange directly against the mock URL.
        let response = http
            .post(format!("{}/refreshToken", server.uri()))
            .json(&serde_json::json!({"refreshToken": account.refresh_token()}))
            .send()
            .await
            .unwrap();
        let data: SocialRefreshResponse =
            check_status(response).await.unwrap().json().await.unwrap();
        assert_eq!(data.access_token, "fresh");
        assert_eq!(data.refresh_token.as_deref(), Some("rt2"));
        assert_eq!(data.expires_in, 7200);
    }

    #[tokio::test]
    async fn test_refresh_failed_maps_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad refresh token"))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let response = http.post(server.uri()).send().await.unwrap();
        match check_status(response).await {
            Err(Error::RefreshFailed { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad refresh token");
            }
            other => panic!("expected RefreshFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_idc_requires_client_credentials() {
        let mut account = kiro_account(AuthMethod::Idc);
        if let Credential::Kiro { client_id, .. } = &mut account.credential {
            *client_id = None;
        }
        let err = KiroRefreshDriver
            .refresh(&reqwest::Client::new(), &account)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn test_empty_refresh_token_rejected() {
        let mut account = kiro_account(AuthMethod::Social);
        if let Credential::Kiro { refresh_token, .. } = &mut account.credential {
            refresh_token.clear();
        }
        let err = KiroRefreshDriver
            .refresh(&reqwest::Client::new(), &account)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_)));
    }

    #[test]
    fn test_default_drivers_cover_refreshable_providers() {
        let drivers = default_drivers();
        let providers: Vec<Provider> = drivers.iter().map(|d| d.provider()).collect();
        assert!(providers.contains(&Provider::Kiro));
        assert!(providers.contains(&Provider::Claude));
        assert!(providers.contains(&Provider::Qwen));
        // API-key providers have nothing to refresh.
        assert!(!providers.contains(&Provider::OpenAi));
    }
}
