//! Configuration: TOML file for tunables, environment for secrets.
//!
//! The master encryption key and OAuth client id/secret are consumed from
//! the environment at process start and never written to disk or into
//! credential records.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

use crate::oauth::ProviderConfig;
use crate::rate_limit::{Policy, PolicyTable};

/// Complete keybridge configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub lockout: LockoutConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL the provider redirects back to.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            callback_base_url: default_callback_base_url(),
        }
    }
}

/// OAuth endpoints for the cloud-storage provider. Defaults target Google
/// Drive; override for any standard OAuth 2.0 provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_revoke_url")]
    pub revoke_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_revoke_url() -> String {
    "https://oauth2.googleapis.com/revoke".to_string()
}

fn default_userinfo_url() -> String {
    "https://www.googleapis.com/oauth2/v2/userinfo".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![
        "https://www.googleapis.com/auth/drive.file".to_string(),
        "https://www.googleapis.com/auth/userinfo.email".to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            revoke_url: default_revoke_url(),
            userinfo_url: default_userinfo_url(),
            scopes: default_scopes(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Lifetime of a pending authorization (minutes).
    #[serde(default = "default_pending_ttl_minutes")]
    pub pending_ttl_minutes: i64,
    /// Lifetime of a CSRF token (minutes). Consumed by the embedding
    /// command-dispatch layer when it constructs [`crate::csrf::CsrfTokens`];
    /// the callback binary itself issues no CSRF tokens.
    #[serde(default = "default_csrf_ttl_minutes")]
    pub csrf_ttl_minutes: i64,
    /// How often the cleanup task purges expired flow state (seconds).
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

fn default_pending_ttl_minutes() -> i64 {
    15
}

fn default_csrf_ttl_minutes() -> i64 {
    60
}

fn default_cleanup_interval_seconds() -> u64 {
    300
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            pending_ttl_minutes: default_pending_ttl_minutes(),
            csrf_ttl_minutes: default_csrf_ttl_minutes(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

/// Rate-limit policies per action name plus the default fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_limit_max")]
    pub default_max: u32,
    #[serde(default = "default_limit_window_secs")]
    pub default_window_secs: i64,
    /// Per-action overrides, e.g. `upload = { max = 10, window_secs = 900 }`.
    #[serde(default)]
    pub actions: HashMap<String, PolicyEntry>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PolicyEntry {
    pub max: u32,
    pub window_secs: i64,
}

fn default_limit_max() -> u32 {
    30
}

fn default_limit_window_secs() -> i64 {
    900
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_max: default_limit_max(),
            default_window_secs: default_limit_window_secs(),
            actions: HashMap::new(),
        }
    }
}

impl LimitsConfig {
    pub fn policy_table(&self) -> PolicyTable {
        let mut table = PolicyTable::new(Policy::new(self.default_max, self.default_window_secs));
        for (action, entry) in &self.actions {
            table = table.with_policy(action, Policy::new(entry.max, entry.window_secs));
        }
        table
    }
}

/// Login-attempt lockout knobs. Consumed by the embedding command-dispatch
/// layer when it constructs [`crate::lockout::LoginGuard`]; the callback
/// binary performs no password logins of its own.
#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,
}

fn default_max_failures() -> u32 {
    5
}

fn default_lockout_minutes() -> i64 {
    15
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            lockout_minutes: default_lockout_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
}

fn default_audit_capacity() -> usize {
    1000
}

fn default_retention_hours() -> i64 {
    24
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: default_audit_capacity(),
            retention_hours: default_retention_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credentials_db")]
    pub credentials_db: String,
    #[serde(default = "default_rate_limit_db")]
    pub rate_limit_db: String,
}

fn default_credentials_db() -> String {
    "keybridge-credentials.db".to_string()
}

fn default_rate_limit_db() -> String {
    "keybridge-limits.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_db: default_credentials_db(),
            rate_limit_db: default_rate_limit_db(),
        }
    }
}

/// Secrets consumed from the environment at startup.
pub struct Secrets {
    pub master_key: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            master_key: require_env("KEYBRIDGE_MASTER_KEY")?,
            client_id: require_env("KEYBRIDGE_CLIENT_ID")?,
            client_secret: require_env("KEYBRIDGE_CLIENT_SECRET")?,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("environment variable {} must be set", name),
    }
}

impl AppConfig {
    /// Assembles the provider adapter config from settings plus secrets.
    pub fn provider_config(&self, secrets: &Secrets) -> ProviderConfig {
        ProviderConfig {
            auth_url: self.provider.auth_url.clone(),
            token_url: self.provider.token_url.clone(),
            revoke_url: self.provider.revoke_url.clone(),
            userinfo_url: self.provider.userinfo_url.clone(),
            scopes: self.provider.scopes.clone(),
            client_id: secrets.client_id.clone(),
            client_secret: secrets.client_secret.clone(),
            redirect_uri: format!("{}/oauth/callback", self.server.callback_base_url),
            timeout_secs: self.provider.timeout_secs,
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path))?;
    let config: AppConfig = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.flow.pending_ttl_minutes, 15);
        assert_eq!(config.flow.csrf_ttl_minutes, 60);
        assert_eq!(config.limits.default_max, 30);
        assert_eq!(config.lockout.max_failures, 5);
        assert_eq!(config.audit.retention_hours, 24);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:9090"
            callback_base_url = "https://bot.example.com"

            [provider]
            timeout_secs = 5

            [flow]
            pending_ttl_minutes = 10

            [limits]
            default_max = 20
            default_window_secs = 600

            [limits.actions.upload]
            max = 10
            window_secs = 900

            [lockout]
            max_failures = 3
            lockout_minutes = 30
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.provider.timeout_secs, 5);
        assert_eq!(config.flow.pending_ttl_minutes, 10);
        assert_eq!(config.lockout.max_failures, 3);

        let table = config.limits.policy_table();
        assert_eq!(table.policy_for("upload").max, 10);
        assert_eq!(table.policy_for("unknown").max, 20);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml = r#"
            [lockout]
            max_failures = 3
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.lockout.max_failures, 3);
        assert_eq!(config.lockout.lockout_minutes, 15); // Default
        assert_eq!(config.limits.default_max, 30); // Default
    }

    #[test]
    fn test_redirect_uri_built_from_callback_base() {
        let config = AppConfig::default();
        let secrets = Secrets {
            master_key: "m".repeat(32),
            client_id: "cid".to_string(),
            client_secret: "csec".to_string(),
        };

        let provider = config.provider_config(&secrets);
        assert_eq!(provider.redirect_uri, "http://localhost:8080/oauth/callback");
        assert_eq!(provider.client_id, "cid");
    }
}
