//! Flat-file credential store.
//!
//! One account per JSON file. Loading sniffs the schema: the canonical
//! format, the nested `token_data` variant, and the external exporter format
//! (identified by `machineId` / `clientIdHash` / `provider`+`label`
//! signature fields) are all accepted; anything else is rejected as an
//! invalid credential.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::auth::account::{Account, AccountStatus, AuthMethod, Credential, Provider};
use crate::auth::store::CredentialStore;
use crate::error::{Error, Result};

/// File permissions (Unix only): owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Directory permissions (Unix only): owner read/write/execute.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// File-based credential store.
pub struct FileCredentialStore {
    dir: PathBuf,
    /// Serializes Save/Delete; loads are lock-free.
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: expand_tilde(dir.into()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn account_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|e| Error::storage(&self.dir, e.to_string()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(DIR_MODE);
                std::fs::set_permissions(&self.dir, perms)
                    .map_err(|e| Error::storage(&self.dir, e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Assign the file name for a freshly logged-in account:
    /// `{provider}-{discriminator}` where the discriminator is the region
    /// for Kiro, an email hash for OAuth identities, and a numeric index
    /// when the slot is already taken.
    pub fn assign_name(&self, account: &Account) -> String {
        let provider = account.provider();
        let discriminator = match &account.credential {
            Credential::Kiro { region, .. } => region.clone(),
            Credential::OAuth { email, .. } => email
                .as_deref()
                .map(email_hash)
                .unwrap_or_else(|| "default".to_string()),
            Credential::ApiKey { .. } => "key".to_string(),
        };
        let base = format!("{provider}-{discriminator}");
        if !self.account_path(&base).exists() {
            return base;
        }
        for idx in 1.. {
            let candidate = format!("{base}-{idx}");
            if !self.account_path(&candidate).exists() {
                return candidate;
            }
        }
        unreachable!()
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, name: &str) -> Result<Account> {
        let path = self.account_path(name);
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::storage(&path, e.to_string()))?;
        let data: Value = serde_json::from_str(&content)
            .map_err(|e| Error::InvalidCredential(format!("{}: {e}", path.display())))?;
        let account = account_from_json(name, &data)?;
        debug!(name, provider = %account.provider(), "credential loaded");
        Ok(account)
    }

    fn load_dir(&self, path: &Path) -> Result<Vec<Account>> {
        let mut values = read_dir_json(path)?;
        if values.is_empty() {
            return Ok(Vec::new());
        }

        // The primary is the provider-named file (`{provider}.json`) when
        // one exists, otherwise the lexicographically first; siblings fill
        // in fields the primary left unset.
        let primary_idx = values
            .iter()
            .position(|(path, _)| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| stem.parse::<Provider>().is_ok())
            })
            .unwrap_or(0);
        let (primary_name, mut merged) = values.remove(primary_idx);
        for (_, sibling) in values {
            merge_missing(&mut merged, &sibling);
        }

        let name = primary_name
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "imported".to_string());
        let account = account_from_json(&name, &merged)?;
        info!(name = %account.id, provider = %account.provider(), "directory credential merged");
        Ok(vec![account])
    }

    fn save(&self, account: &Account) -> Result<()> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        self.ensure_dir()?;

        let path = self.account_path(&account.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&account_to_json(account))
            .map_err(|e| Error::storage(&path, e.to_string()))?;

        std::fs::write(&tmp, body).map_err(|e| Error::storage(&tmp, e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(FILE_MODE);
            std::fs::set_permissions(&tmp, perms).map_err(|e| Error::storage(&tmp, e.to_string()))?;
        }
        std::fs::rename(&tmp, &path).map_err(|e| Error::storage(&path, e.to_string()))?;
        debug!(name = %account.id, "credential saved");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().expect("store write lock poisoned");
        let path = self.account_path(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| Error::storage(&path, e.to_string()))?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<Account>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut accounts = Vec::new();
        for (path, value) in read_dir_json(&self.dir)? {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            match account_from_json(&name, &value) {
                Ok(account) => accounts.push(account),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable credential"),
            }
        }
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Read all `*.json` entries of a directory, sorted by file name.
fn read_dir_json(dir: &Path) -> Result<Vec<(PathBuf, Value)>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::storage(dir, e.to_string()))?;
    let mut values = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::storage(dir, e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        {
            Some(value) if value.is_object() => values.push((path, value)),
            _ => warn!(path = %path.display(), "skipping non-object JSON file"),
        }
    }
    values.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(values)
}

/// Merge `other`'s fields into `target` without overwriting set fields.
fn merge_missing(target: &mut Value, other: &Value) {
    let (Some(target_map), Some(other_map)) = (target.as_object_mut(), other.as_object()) else {
        return;
    };
    for (key, value) in other_map {
        let absent = match target_map.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            _ => false,
        };
        if absent {
            target_map.insert(key.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Format sniffing
// ---------------------------------------------------------------------------

/// Build an account from a credential JSON object, sniffing the schema.
pub(crate) fn account_from_json(name: &str, data: &Value) -> Result<Account> {
    let account = if is_external_export(data) {
        external_export_to_account(name, data)?
    } else if let Some(token_data) = data.get("token_data").filter(|v| v.is_object()) {
        // Nested internal variant: token fields live in the sub-object,
        // header fields at the root.
        let mut flat = data.clone();
        merge_missing(&mut flat, token_data);
        canonical_to_account(name, &flat)?
    } else if data.get("accessToken").is_some() || data.get("refreshToken").is_some() {
        canonical_to_account(name, data)?
    } else {
        return Err(Error::InvalidCredential(format!(
            "{name}: unrecognized credential schema"
        )));
    };

    if !account.has_token_material() {
        return Err(Error::InvalidCredential(format!(
            "{name}: both access and refresh tokens are empty"
        )));
    }
    Ok(account)
}

/// External exporter files carry machine/registration metadata the internal
/// formats never write.
fn is_external_export(data: &Value) -> bool {
    data.get("machineId").is_some()
        || data.get("clientIdHash").is_some()
        || (data.get("provider").is_some() && data.get("label").is_some())
}

fn canonical_to_account(name: &str, data: &Value) -> Result<Account> {
    let provider: Provider = str_field(data, "type")
        .or_else(|| str_field(data, "provider"))
        .unwrap_or_else(|| "kiro".to_string())
        .parse()?;

    let access_token = str_field(data, "accessToken").unwrap_or_default();
    let refresh_token = str_field(data, "refreshToken").unwrap_or_default();
    let expires_at = str_field(data, "expiresAt").as_deref().and_then(parse_rfc3339);

    let credential = match provider {
        Provider::Kiro => Credential::Kiro {
            access_token,
            refresh_token,
            expires_at,
            region: str_field(data, "region")
                .unwrap_or_else(|| crate::config::DEFAULT_REGION.to_string()),
            profile_arn: str_field(data, "profileArn"),
            client_id: str_field(data, "clientId"),
            client_secret: str_field(data, "clientSecret"),
            auth_method: match str_field(data, "authMethod").as_deref() {
                Some("idc") => AuthMethod::Idc,
                Some("social") | None => AuthMethod::Social,
                Some(other) => {
                    return Err(Error::InvalidCredential(format!(
                        "{name}: unknown authMethod '{other}'"
                    )))
                }
            },
        },
        Provider::OpenAi if data.get("apiKey").is_some() => Credential::ApiKey {
            provider,
            key: str_field(data, "apiKey").unwrap_or_default(),
            base_url: str_field(data, "baseUrl"),
        },
        _ => Credential::OAuth {
            provider,
            access_token,
            refresh_token,
            expires_at,
            client_id: str_field(data, "clientId"),
            client_secret: str_field(data, "clientSecret"),
            email: str_field(data, "email"),
        },
    };

    let mut account = Account::new(name, credential);
    account.label = str_field(data, "label").unwrap_or_default();
    account.priority = data.get("priority").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
    account.disabled = data.get("disabled").and_then(|v| v.as_bool()).unwrap_or(false);
    if account.disabled {
        account.status = AccountStatus::Disabled;
    }
    account.last_refresh = str_field(data, "last_refresh").as_deref().and_then(parse_rfc3339);
    Ok(account)
}

fn external_export_to_account(name: &str, data: &Value) -> Result<Account> {
    let mut flat = data.clone();

    // Resolve the clientId/clientSecret indirection: exporters reference
    // the AWS SSO cache registration file by hash instead of inlining it.
    if let Some(hash) = str_field(data, "clientIdHash") {
        if let Some(registration) = load_sso_registration(&hash) {
            merge_missing(&mut flat, &registration);
        }
    }

    canonical_to_account(name, &flat)
}

/// Read `~/.aws/sso/cache/{hash}.json` for clientId/clientSecret.
fn load_sso_registration(client_id_hash: &str) -> Option<Value> {
    // Only hash-shaped names; anything else could escape the cache dir.
    if !client_id_hash
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        warn!("invalid clientIdHash format, skipping registration lookup");
        return None;
    }

    let path = dirs::home_dir()?
        .join(".aws")
        .join("sso")
        .join("cache")
        .join(format!("{client_id_hash}.json"));
    let content = std::fs::read_to_string(&path).ok()?;
    let value = serde_json::from_str::<Value>(&content).ok()?;
    info!(path = %path.display(), "device registration loaded");
    Some(value)
}

/// Serialize an account to the canonical camelCase file schema.
pub(crate) fn account_to_json(account: &Account) -> Value {
    let mut out = json!({
        "type": account.provider().as_str(),
        "label": account.label,
        "priority": account.priority,
        "disabled": account.disabled,
    });
    if let Some(ts) = account.last_refresh {
        out["last_refresh"] = json!(ts.to_rfc3339());
    }

    match &account.credential {
        Credential::Kiro {
            access_token,
            refresh_token,
            expires_at,
            region,
            profile_arn,
            client_id,
            client_secret,
            auth_method,
        } => {
            out["accessToken"] = json!(access_token);
            out["refreshToken"] = json!(refresh_token);
            out["region"] = json!(region);
            out["authMethod"] = json!(auth_method.to_string());
            if let Some(exp) = expires_at {
                out["expiresAt"] = json!(exp.to_rfc3339());
            }
            if let Some(arn) = profile_arn {
                out["profileArn"] = json!(arn);
            }
            if let Some(id) = client_id {
                out["clientId"] = json!(id);
            }
            if let Some(secret) = client_secret {
                out["clientSecret"] = json!(secret);
            }
        }
        Credential::OAuth {
            access_token,
            refresh_token,
            expires_at,
            client_id,
            client_secret,
            email,
            ..
        } => {
            out["accessToken"] = json!(access_token);
            out["refreshToken"] = json!(refresh_token);
            if let Some(exp) = expires_at {
                out["expiresAt"] = json!(exp.to_rfc3339());
            }
            if let Some(id) = client_id {
                out["clientId"] = json!(id);
            }
            if let Some(secret) = client_secret {
                out["clientSecret"] = json!(secret);
            }
            if let Some(email) = email {
                out["email"] = json!(email);
            }
        }
        Credential::ApiKey { key, base_url, .. } => {
            out["apiKey"] = json!(key);
            if let Some(url) = base_url {
                out["baseUrl"] = json!(url);
            }
        }
    }
    out
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn email_hash(email: &str) -> String {
    let digest = Sha256::digest(email.trim().to_lowercase().as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

fn expand_tilde(path: PathBuf) -> PathBuf {
    let Some(s) = path.to_str() else { return path };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path
}
