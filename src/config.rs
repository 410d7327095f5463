//! Provider constants tables, URL templates, and timing defaults.
//!
//! `{region}` placeholders are interpolated at call time from the account's
//! region field. Everything here is read-only shared state.

use std::time::Duration;

use crate::auth::account::Provider;

/// Default AWS region when an account carries none.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default cooldown after a 429 or 5xx when the table has no entry.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Consecutive refresh failures before an account is marked unavailable.
pub const REFRESH_FAILURE_THRESHOLD: u32 = 3;

/// Refresh scheduler tick interval.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(60);

/// Upper bound on a single refresh-driver exchange.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(300);

/// Connect timeout for provider HTTP clients.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded capacity of the outbound event channel (back-pressure).
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Quota fetch retry attempts.
pub const QUOTA_RETRY_ATTEMPTS: u32 = 3;

/// Spacing between quota fetch attempts.
pub const QUOTA_RETRY_SPACING: Duration = Duration::from_millis(500);

/// AWS SDK for JS version emulated in the Kiro User-Agent.
pub const KIRO_SDK_VERSION: &str = "1.0.7";

/// Node.js version emulated in the Kiro User-Agent.
pub const KIRO_NODE_VERSION: &str = "20.16.0";

/// Kiro agent mode header value.
pub const KIRO_AGENT_MODE: &str = "vibe";

/// Kiro API origin query/field value.
pub const KIRO_ORIGIN: &str = "AI_EDITOR";

/// Kiro assistant-response endpoint template.
pub const KIRO_API_URL_TEMPLATE: &str =
    "https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse";

/// Kiro social-auth (desktop back-channel) refresh endpoint template.
pub const KIRO_SOCIAL_REFRESH_URL_TEMPLATE: &str =
    "https://prod.{region}.auth.desktop.kiro.dev/refreshToken";

/// AWS SSO OIDC token endpoint template (IDC auth).
pub const KIRO_IDC_REFRESH_URL_TEMPLATE: &str = "https://oidc.{region}.amazonaws.com/token";

/// Kiro usage-limits endpoint template.
pub const KIRO_USAGE_URL_TEMPLATE: &str =
    "https://codewhisperer.{region}.amazonaws.com/getUsageLimits";

/// Per-provider constants row.
#[derive(Debug, Clone, Copy)]
pub struct ProviderConstants {
    pub provider: Provider,
    /// Chat/completion endpoint (may contain `{region}`).
    pub base_url: &'static str,
    /// Token refresh endpoint; empty when the provider has a split scheme
    /// handled by its driver (Kiro).
    pub refresh_url: &'static str,
    /// Usage-limits endpoint; empty when the provider exposes none.
    pub usage_url: &'static str,
    pub default_model: &'static str,
    pub user_agent: &'static str,
    /// Lead time before expiry at which the scheduler refreshes.
    pub refresh_lead: Duration,
    /// Cooldown applied after a 429/5xx.
    pub cooldown: Duration,
}

/// The closed constants table. Rows are looked up by provider tag.
pub const PROVIDER_TABLE: &[ProviderConstants] = &[
    ProviderConstants {
        provider: Provider::Kiro,
        base_url: KIRO_API_URL_TEMPLATE,
        refresh_url: "",
        usage_url: KIRO_USAGE_URL_TEMPLATE,
        default_model: "claude-sonnet-4-5",
        user_agent: "aws-sdk-js/1.0.7",
        refresh_lead: Duration::from_secs(30 * 60),
        cooldown: Duration::from_secs(120),
    },
    ProviderConstants {
        provider: Provider::OpenAi,
        base_url: "https://api.openai.com/v1/chat/completions",
        refresh_url: "",
        usage_url: "",
        default_model: "gpt-4o",
        user_agent: "switchboard/0.1",
        refresh_lead: Duration::from_secs(5 * 60),
        cooldown: DEFAULT_COOLDOWN,
    },
    ProviderConstants {
        provider: Provider::Claude,
        base_url: "https://api.anthropic.com/v1/messages",
        refresh_url: "https://console.anthropic.com/v1/oauth/token",
        usage_url: "https://api.anthropic.com/api/oauth/usage",
        default_model: "claude-sonnet-4-5",
        user_agent: "switchboard/0.1",
        refresh_lead: Duration::from_secs(5 * 60),
        cooldown: DEFAULT_COOLDOWN,
    },
    ProviderConstants {
        provider: Provider::Gemini,
        base_url: "https://generativelanguage.googleapis.com/v1beta/models",
        refresh_url: "https://oauth2.googleapis.com/token",
        usage_url: "",
        default_model: "gemini-2.5-pro",
        user_agent: "switchboard/0.1",
        refresh_lead: Duration::from_secs(5 * 60),
        cooldown: DEFAULT_COOLDOWN,
    },
    ProviderConstants {
        provider: Provider::Qwen,
        base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions",
        refresh_url: "https://chat.qwen.ai/api/v1/oauth2/token",
        usage_url: "https://chat.qwen.ai/api/v1/quota",
        default_model: "qwen3-coder-plus",
        user_agent: "switchboard/0.1",
        refresh_lead: Duration::from_secs(5 * 60),
        cooldown: DEFAULT_COOLDOWN,
    },
    ProviderConstants {
        provider: Provider::IFlow,
        base_url: "https://apis.iflow.cn/v1/chat/completions",
        refresh_url: "https://iflow.cn/oauth/token",
        usage_url: "",
        default_model: "qwen3-coder",
        user_agent: "switchboard/0.1",
        refresh_lead: Duration::from_secs(5 * 60),
        cooldown: DEFAULT_COOLDOWN,
    },
    ProviderConstants {
        provider: Provider::Antigravity,
        base_url: "https://cloudcode-pa.googleapis.com/v1internal:generateContent",
        refresh_url: "https://oauth2.googleapis.com/token",
        usage_url: "https://cloudcode-pa.googleapis.com/v1internal:getQuotas",
        default_model: "gemini-2.5-pro",
        user_agent: "antigravity/1.0",
        refresh_lead: Duration::from_secs(5 * 60),
        cooldown: DEFAULT_COOLDOWN,
    },
];

/// Look up the constants row for a provider.
pub fn constants(provider: Provider) -> &'static ProviderConstants {
    PROVIDER_TABLE
        .iter()
        .find(|row| row.provider == provider)
        .expect("every provider has a constants row")
}

/// Interpolate `{region}` into a URL template.
pub fn region_url(template: &str, region: &str) -> String {
    template.replace("{region}", region)
}

/// Kiro assistant-response URL for a region.
pub fn kiro_api_url(region: &str) -> String {
    region_url(KIRO_API_URL_TEMPLATE, region)
}

/// Kiro social-auth refresh URL for a region.
pub fn kiro_social_refresh_url(region: &str) -> String {
    region_url(KIRO_SOCIAL_REFRESH_URL_TEMPLATE, region)
}

/// AWS SSO OIDC token URL for a region.
pub fn kiro_idc_refresh_url(region: &str) -> String {
    region_url(KIRO_IDC_REFRESH_URL_TEMPLATE, region)
}

/// Kiro usage-limits URL for a region.
pub fn kiro_usage_url(region: &str) -> String {
    region_url(KIRO_USAGE_URL_TEMPLATE, region)
}

/// Static alias table from user-facing Claude model names to Kiro model IDs.
///
/// Unknown names pass through [`normalize_model_name`] unchanged.
pub const KIRO_MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-haiku-4-5", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
    ("claude-opus-4-5", "CLAUDE_OPUS_4_5_20251101_V1_0"),
];

/// Resolve a user-facing model name to the Kiro upstream model ID.
pub fn resolve_kiro_model(name: &str) -> String {
    let normalized = normalize_model_name(name);
    for (alias, id) in KIRO_MODEL_ALIASES {
        if normalized == *alias || name == *id {
            return (*id).to_string();
        }
    }
    name.to_string()
}

/// Normalize a model name: strip date suffixes (`-20250929`) and version
/// suffixes (`-v2`).
pub fn normalize_model_name(name: &str) -> String {
    let re_date = regex_lite::Regex::new(r"-\d{8}$").unwrap();
    let result = re_date.replace(name, "").to_string();
    let re_vsuffix = regex_lite::Regex::new(r"-v\d+$").unwrap();
    re_vsuffix.replace(&result, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_provider_has_a_row() {
        for provider in Provider::ALL {
            assert_eq!(constants(*provider).provider, *provider);
        }
    }

    #[test]
    fn test_region_interpolation() {
        assert_eq!(
            kiro_api_url("eu-west-1"),
            "https://codewhisperer.eu-west-1.amazonaws.com/generateAssistantResponse"
        );
        assert_eq!(
            kiro_social_refresh_url("us-east-1"),
            "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"
        );
    }

    #[test]
    fn test_model_alias_resolution() {
        assert_eq!(
            resolve_kiro_model("claude-sonnet-4-5"),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
        // Dated snapshot resolves through normalization.
        assert_eq!(
            resolve_kiro_model("claude-sonnet-4-5-20250929"),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
        // Unknown names pass through unchanged.
        assert_eq!(resolve_kiro_model("auto"), "auto");
    }

    #[test]
    fn test_normalize_model_name() {
        assert_eq!(normalize_model_name("claude-sonnet-4-5-20250929"), "claude-sonnet-4-5");
        assert_eq!(normalize_model_name("claude-3-5-sonnet-v2"), "claude-3-5-sonnet");
        assert_eq!(normalize_model_name("gpt-4o"), "gpt-4o");
    }
}
