//! Account model: one stored credential bundle per provider identity.
//!
//! The Go-era metadata map is replaced by a tagged credential variant per
//! provider family with a common header, so field access is typed and the
//! JSON (de)serialization lives in one place (`auth::store::file`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider back-end tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Kiro,
    OpenAi,
    Claude,
    Gemini,
    Qwen,
    IFlow,
    Antigravity,
}

impl Provider {
    pub const ALL: &'static [Provider] = &[
        Provider::Kiro,
        Provider::OpenAi,
        Provider::Claude,
        Provider::Gemini,
        Provider::Qwen,
        Provider::IFlow,
        Provider::Antigravity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kiro => "kiro",
            Self::OpenAi => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Qwen => "qwen",
            Self::IFlow => "iflow",
            Self::Antigravity => "antigravity",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kiro" | "codewhisperer" => Ok(Self::Kiro),
            "openai" => Ok(Self::OpenAi),
            "claude" | "anthropic" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            "qwen" => Ok(Self::Qwen),
            "iflow" => Ok(Self::IFlow),
            "antigravity" => Ok(Self::Antigravity),
            other => Err(crate::error::Error::InvalidCredential(format!(
                "unknown provider tag '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kiro authentication mechanism, selecting the refresh endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Desktop back-channel ("social") auth.
    #[default]
    Social,
    /// AWS IAM Identity Center via SSO OIDC.
    Idc,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Social => f.write_str("social"),
            Self::Idc => f.write_str("idc"),
        }
    }
}

/// Lifecycle status reported to the management surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Disabled,
    Cooldown,
    Exhausted,
}

/// Per-provider credential material.
#[derive(Clone, PartialEq)]
pub enum Credential {
    Kiro {
        access_token: String,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
        region: String,
        profile_arn: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
        auth_method: AuthMethod,
    },
    /// Desktop-OAuth identities (Claude, Gemini, Qwen, iFlow, Antigravity).
    OAuth {
        provider: Provider,
        access_token: String,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
        client_id: Option<String>,
        client_secret: Option<String>,
        email: Option<String>,
    },
    /// Plain API-key identities (official APIs).
    ApiKey {
        provider: Provider,
        key: String,
        base_url: Option<String>,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kiro {
                expires_at,
                region,
                profile_arn,
                auth_method,
                ..
            } => f
                .debug_struct("Kiro")
                .field("access_token", &"[REDACTED]")
                .field("refresh_token", &"[REDACTED]")
                .field("expires_at", expires_at)
                .field("region", region)
                .field("profile_arn", profile_arn)
                .field("auth_method", auth_method)
                .finish(),
            Self::OAuth {
                provider,
                expires_at,
                email,
                ..
            } => f
                .debug_struct("OAuth")
                .field("provider", provider)
                .field("access_token", &"[REDACTED]")
                .field("refresh_token", &"[REDACTED]")
                .field("expires_at", expires_at)
                .field("email", email)
                .finish(),
            Self::ApiKey {
                provider, base_url, ..
            } => f
                .debug_struct("ApiKey")
                .field("provider", provider)
                .field("key", &"[REDACTED]")
                .field("base_url", base_url)
                .finish(),
        }
    }
}

/// Token material returned by a refresh driver.
#[derive(Clone, Default)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
}

impl std::fmt::Debug for TokenUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenUpdate")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("profile_arn", &self.profile_arn)
            .finish()
    }
}

/// A stored credential bundle the auth manager schedules.
#[derive(Debug, Clone)]
pub struct Account {
    /// Stable identifier; the credential file name without extension.
    pub id: String,
    /// Human-readable label.
    pub label: String,
    pub credential: Credential,
    /// Higher values are preferred by selection.
    pub priority: i32,
    pub disabled: bool,
    /// Transient flag set after repeated refresh failures.
    pub unavailable: bool,
    pub status: AccountStatus,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(id: impl Into<String>, credential: Credential) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            credential,
            priority: 0,
            disabled: false,
            unavailable: false,
            status: AccountStatus::Active,
            success_count: 0,
            failure_count: 0,
            last_refresh: None,
        }
    }

    pub fn provider(&self) -> Provider {
        match &self.credential {
            Credential::Kiro { .. } => Provider::Kiro,
            Credential::OAuth { provider, .. } | Credential::ApiKey { provider, .. } => *provider,
        }
    }

    /// The bearer token to present upstream.
    pub fn access_token(&self) -> &str {
        match &self.credential {
            Credential::Kiro { access_token, .. } | Credential::OAuth { access_token, .. } => {
                access_token
            }
            Credential::ApiKey { key, .. } => key,
        }
    }

    pub fn refresh_token(&self) -> &str {
        match &self.credential {
            Credential::Kiro { refresh_token, .. } | Credential::OAuth { refresh_token, .. } => {
                refresh_token
            }
            Credential::ApiKey { .. } => "",
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match &self.credential {
            Credential::Kiro { expires_at, .. } | Credential::OAuth { expires_at, .. } => {
                *expires_at
            }
            Credential::ApiKey { .. } => None,
        }
    }

    /// The AWS region for Kiro accounts, default otherwise.
    pub fn region(&self) -> &str {
        match &self.credential {
            Credential::Kiro { region, .. } => region,
            _ => crate::config::DEFAULT_REGION,
        }
    }

    /// An account with neither token is invalid and must never be selected.
    pub fn has_token_material(&self) -> bool {
        !self.access_token().is_empty() || !self.refresh_token().is_empty()
    }

    /// Whether the token expires within the provider's refresh lead.
    pub fn needs_refresh(&self) -> bool {
        match self.expires_at() {
            Some(exp) => {
                let lead = crate::config::constants(self.provider()).refresh_lead;
                let lead = chrono::Duration::from_std(lead).unwrap_or_else(|_| chrono::Duration::zero());
                exp <= Utc::now() + lead
            }
            None => false,
        }
    }

    /// Whether the token is already past (or within a minute of) expiry.
    pub fn is_expired(&self) -> bool {
        match self.expires_at() {
            Some(exp) => exp <= Utc::now() + chrono::Duration::seconds(60),
            None => false,
        }
    }

    /// Fold refreshed token material into the credential.
    ///
    /// `expires_at` only ever advances; a driver response with an earlier
    /// expiry than the current one is ignored for the expiry field.
    pub fn apply_refresh(&mut self, update: TokenUpdate) {
        let new_expiry = update.expires_at;
        match &mut self.credential {
            Credential::Kiro {
                access_token,
                refresh_token,
                expires_at,
                profile_arn,
                ..
            } => {
                *access_token = update.access_token;
                if let Some(rt) = update.refresh_token {
                    if !rt.is_empty() {
                        *refresh_token = rt;
                    }
                }
                if let Some(arn) = update.profile_arn {
                    if !arn.is_empty() {
                        *profile_arn = Some(arn);
                    }
                }
                advance_expiry(expires_at, new_expiry);
            }
            Credential::OAuth {
                access_token,
                refresh_token,
                expires_at,
                ..
            } => {
                *access_token = update.access_token;
                if let Some(rt) = update.refresh_token {
                    if !rt.is_empty() {
                        *refresh_token = rt;
                    }
                }
                advance_expiry(expires_at, new_expiry);
            }
            Credential::ApiKey { .. } => {}
        }
        self.last_refresh = Some(Utc::now());
    }
}

fn advance_expiry(current: &mut Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) {
    if let Some(new) = incoming {
        if current.map_or(true, |cur| new > cur) {
            *current = Some(new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kiro_account(access: &str, refresh: &str) -> Account {
        Account::new(
            "kiro-us-east-1",
            Credential::Kiro {
                access_token: access.into(),
                refresh_token: refresh.into(),
                expires_at: None,
                region: "us-east-1".into(),
                profile_arn: None,
                client_id: None,
                client_secret: None,
                auth_method: AuthMethod::Social,
            },
        )
    }

    #[test]
    fn test_provider_round_trip() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), *p);
        }
    }

    #[test]
    fn test_token_material_validity() {
        assert!(!kiro_account("", "").has_token_material());
        assert!(kiro_account("at", "").has_token_material());
        assert!(kiro_account("", "rt").has_token_material());
    }

    #[test]
    fn test_apply_refresh_advances_expiry() {
        let mut account = kiro_account("old", "rt");
        let first = Utc::now() + chrono::Duration::hours(1);
        account.apply_refresh(TokenUpdate {
            access_token: "new".into(),
            refresh_token: None,
            expires_at: Some(first),
            profile_arn: None,
        });
        assert_eq!(account.access_token(), "new");
        assert_eq!(account.expires_at(), Some(first));

        // Stale expiry is ignored; the field never regresses.
        account.apply_refresh(TokenUpdate {
            access_token: "newer".into(),
            refresh_token: None,
            expires_at: Some(first - chrono::Duration::minutes(30)),
            profile_arn: None,
        });
        assert_eq!(account.access_token(), "newer");
        assert_eq!(account.expires_at(), Some(first));
    }

    #[test]
    fn test_apply_refresh_keeps_refresh_token_on_empty() {
        let mut account = kiro_account("at", "keep-me");
        account.apply_refresh(TokenUpdate {
            access_token: "new".into(),
            refresh_token: Some(String::new()),
            expires_at: None,
            profile_arn: None,
        });
        assert_eq!(account.refresh_token(), "keep-me");
    }

    #[test]
    fn test_needs_refresh_uses_provider_lead() {
        let mut account = kiro_account("at", "rt");
        if let Credential::Kiro { expires_at, .. } = &mut account.credential {
            // Kiro's lead is 30 minutes; 20 minutes out must trigger.
            *expires_at = Some(Utc::now() + chrono::Duration::minutes(20));
        }
        assert!(account.needs_refresh());
        assert!(!account.is_expired());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let account = kiro_account("super-secret", "also-secret");
        let rendered = format!("{account:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("also-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
