//! Per-account quota fetch with bounded retry and response sniffing.
//!
//! Providers disagree on the usage-limits shape; three are recognized:
//! the breakdown list (Kiro), the percent-based quota list (Antigravity),
//! and the absolute used/total object (Qwen). Anything else is a decode
//! failure.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::account::Account;
use crate::config;
use crate::error::{Error, Result};

/// A bonus line item attached to a quota (promotional credit and similar).
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaBonus {
    pub name: String,
    pub amount: f64,
}

/// One quota line for the management surface.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaSnapshot {
    pub resource_type: String,
    pub display_name: String,
    pub unit: String,
    pub current_usage: f64,
    pub usage_limit: f64,
    pub reset_at: Option<DateTime<Utc>>,
    pub free_trial: bool,
    pub bonuses: Vec<QuotaBonus>,
}

/// The usage-limits URL for an account's provider, region-interpolated.
pub fn usage_url(account: &Account) -> Option<String> {
    let template = config::constants(account.provider()).usage_url;
    if template.is_empty() {
        return None;
    }
    Some(config::region_url(template, account.region()))
}

/// Fetch an account's quota with retry (3 attempts, 500 ms spacing).
pub async fn fetch_quota(
    http: &reqwest::Client,
    account: &Account,
    url_override: Option<&str>,
) -> Result<Vec<QuotaSnapshot>> {
    let url = match url_override {
        Some(url) => url.to_string(),
        None => usage_url(account)
            .ok_or(Error::Unsupported(account.provider().as_str()))?,
    };

    let mut last_error = None;
    for attempt in 0..config::QUOTA_RETRY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(config::QUOTA_RETRY_SPACING).await;
        }
        match fetch_once(http, account, &url).await {
            Ok(snapshots) => return Ok(snapshots),
            Err(e) => {
                warn!(account = %account.id, attempt, error = %e, "quota fetch attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.expect("at least one attempt ran"))
}

async fn fetch_once(
    http: &reqwest::Client,
    account: &Account,
    url: &str,
) -> Result<Vec<QuotaSnapshot>> {
    let response = http
        .get(url)
        .bearer_auth(account.access_token())
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::upstream(status.as_u16(), body));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| Error::Decode(format!("quota response: {e}")))?;
    let snapshots = sniff_quota(&body)?;
    debug!(account = %account.id, count = snapshots.len(), "quota fetched");
    Ok(snapshots)
}

/// Recognize one of the three observed quota shapes.
pub fn sniff_quota(body: &Value) -> Result<Vec<QuotaSnapshot>> {
    if let Some(list) = body["usageBreakdownList"].as_array() {
        return Ok(list.iter().map(breakdown_entry).collect());
    }
    if let Some(list) = body["quotas"].as_array() {
        return Ok(list.iter().map(percent_entry).collect());
    }
    if body["data"]["total"].is_number() || body["data"]["used"].is_number() {
        return Ok(vec![absolute_entry(&body["data"])]);
    }
    Err(Error::Decode("unrecognized quota response shape".into()))
}

/// Kiro breakdown list: absolute usage with free-trial and bonus detail.
fn breakdown_entry(entry: &Value) -> QuotaSnapshot {
    let resource_type = entry["resourceType"].as_str().unwrap_or("UNKNOWN").to_string();
    QuotaSnapshot {
        display_name: entry["displayName"]
            .as_str()
            .unwrap_or(&resource_type)
            .to_string(),
        resource_type,
        unit: entry["unit"].as_str().unwrap_or("count").to_string(),
        current_usage: entry["currentUsage"].as_f64().unwrap_or(0.0),
        usage_limit: entry["usageLimit"].as_f64().unwrap_or(0.0),
        reset_at: parse_time(&entry["nextDateReset"]),
        free_trial: entry["freeTrialInfo"].is_object(),
        bonuses: entry["bonuses"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|b| QuotaBonus {
                        name: b["name"].as_str().unwrap_or("bonus").to_string(),
                        amount: b["amount"].as_f64().unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Percent-based list: a remaining fraction per named resource.
fn percent_entry(entry: &Value) -> QuotaSnapshot {
    let remaining = entry["remainingFraction"].as_f64().unwrap_or(0.0);
    let name = entry["name"].as_str().unwrap_or("quota").to_string();
    QuotaSnapshot {
        resource_type: name.clone(),
        display_name: name,
        unit: "percent".to_string(),
        current_usage: ((1.0 - remaining) * 100.0).clamp(0.0, 100.0),
        usage_limit: 100.0,
        reset_at: parse_time(&entry["resetTime"]),
        free_trial: false,
        bonuses: Vec::new(),
    }
}

/// Absolute used/total object.
fn absolute_entry(data: &Value) -> QuotaSnapshot {
    QuotaSnapshot {
        resource_type: "requests".to_string(),
        display_name: "Requests".to_string(),
        unit: "count".to_string(),
        current_usage: data["used"].as_f64().unwrap_or(0.0),
        usage_limit: data["total"].as_f64().unwrap_or(0.0),
        reset_at: parse_time(&data["resetAt"]),
        free_trial: false,
        bonuses: Vec::new(),
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::account::{AuthMethod, Credential};
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn kiro_account() -> Account {
        Account::new(
            "kiro-a",
            Credential::Kiro {
                access_token: "at".into(),
                refresh_token: "rt".into(),
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
    fn test_sniff_breakdown_list() {
        let body = json!({
            "usageBreakdownList": [{
                "resourceType": "CREDIT",
                "displayName": "Credits",
                "unit": "credit",
                "currentUsage": 12.5,
                "usageLimit": 50.0,
                "nextDateReset": "2026-09-01T00:00:00Z",
                "freeTrialInfo": {"status": "ACTIVE"},
                "bonuses": [{"name": "promo", "amount": 10.0}]
            }]
        });
        let snapshots = sniff_quota(&body).unwrap();
        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.resource_type, "CREDIT");
        assert_eq!(snap.current_usage, 12.5);
        assert_eq!(snap.usage_limit, 50.0);
        assert!(snap.free_trial);
        assert!(snap.reset_at.is_some());
        assert_eq!(snap.bonuses, vec![QuotaBonus { name: "promo".into(), amount: 10.0 }]);
    }

    #[test]
    fn test_sniff_percent_list() {
        let body = json!({
            "quotas": [{"name": "daily", "remainingFraction": 0.25, "resetTime": "2026-08-02T00:00:00Z"}]
        });
        let snapshots = sniff_quota(&body).unwrap();
        assert_eq!(snapshots[0].unit, "percent");
        assert!((snapshots[0].current_usage - 75.0).abs() < 1e-9);
        assert_eq!(snapshots[0].usage_limit, 100.0);
    }

    #[test]
    fn test_sniff_absolute() {
        let body = json!({"data": {"used": 40, "total": 1000}});
        let snapshots = sniff_quota(&body).unwrap();
        assert_eq!(snapshots[0].current_usage, 40.0);
        assert_eq!(snapshots[0].usage_limit, 1000.0);
    }

    #[test]
    fn test_sniff_unknown_shape_rejected() {
        assert!(sniff_quota(&json!({"whatever": 1})).is_err());
    }

    /// Two failures then success inside the three allowed attempts.
    #[tokio::test]
    async fn test_fetch_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"used": 1, "total": 10}
            })))
            .mount(&server)
            .await;

        let snapshots = fetch_quota(
            &reqwest::Client::new(),
            &kiro_account(),
            Some(&server.uri()),
        )
        .await
        .unwrap();
        assert_eq!(snapshots[0].usage_limit, 10.0);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .expect(3)
            .mount(&server)
            .await;

        let err = fetch_quota(
            &reqwest::Client::new(),
            &kiro_account(),
            Some(&server.uri()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 500, .. }));
    }

    #[test]
    fn test_usage_url_region_substitution() {
        let account = kiro_account();
        assert_eq!(
            usage_url(&account).unwrap(),
            "https://codewhisperer.us-east-1.amazonaws.com/getUsageLimits"
        );
    }
}
