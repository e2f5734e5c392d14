//! Runtime configuration loaded from `EASM_`-prefixed environment
//! variables (with `.env` support via dotenvy).
//!
//! The engine fails fast at boot: [`Settings::validate_runtime`] rejects
//! configurations that would otherwise surface as confusing runtime
//! failures: auth enabled with no API keys, a malformed project ACL, or
//! a redis URL that points at the wrong container port.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("EASM_API_KEYS must not be empty when auth is enabled")]
    #[diagnostic(
        code(recongraph::config::empty_api_keys),
        help("Set EASM_API_KEYS to a comma-separated list of keys, or disable auth.")
    )]
    EmptyApiKeys,

    #[error("EASM_API_KEY_PROJECT_MAP is not valid: {reason}")]
    #[diagnostic(
        code(recongraph::config::bad_acl),
        help("Expected a JSON object mapping api keys to arrays of project ids or \"*\".")
    )]
    BadAcl { reason: String },

    #[error("invalid EASM_REDIS_URL: {reason}")]
    #[diagnostic(code(recongraph::config::bad_redis_url))]
    BadRedisUrl { reason: String },
}

/// Engine settings. Field defaults mirror a local development setup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub app_env: String,
    pub database_url: String,
    pub redis_url: String,
    pub auth_enabled: bool,
    pub api_keys: String,
    pub api_key_project_map: String,
    pub scan_verify_tls: bool,
    pub cors_origins: Vec<String>,
    pub screenshot_dir: String,
    pub fingerprint_db: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            app_env: "dev".to_string(),
            database_url: "sqlite://recongraph.db".to_string(),
            redis_url: "redis://redis:6379/0".to_string(),
            auth_enabled: true,
            api_keys: "dev-change-me".to_string(),
            api_key_project_map: String::new(),
            scan_verify_tls: true,
            cors_origins: Vec::new(),
            screenshot_dir: "data/screenshots".to_string(),
            fingerprint_db: "data/fingerprints/web_fingerprint_v4.json".to_string(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_var(key) {
        Some(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

impl Settings {
    /// Load settings from the process environment, reading `.env` first.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Settings::default();
        Settings {
            app_env: env_var("EASM_APP_ENV").unwrap_or(defaults.app_env),
            database_url: env_var("EASM_DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: env_var("EASM_REDIS_URL").unwrap_or(defaults.redis_url),
            auth_enabled: env_bool("EASM_AUTH_ENABLED", defaults.auth_enabled),
            api_keys: env_var("EASM_API_KEYS").unwrap_or(defaults.api_keys),
            api_key_project_map: env_var("EASM_API_KEY_PROJECT_MAP")
                .unwrap_or(defaults.api_key_project_map),
            scan_verify_tls: env_bool("EASM_SCAN_VERIFY_TLS", defaults.scan_verify_tls),
            cors_origins: env_var("EASM_CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            screenshot_dir: env_var("EASM_SCREENSHOT_DIR").unwrap_or(defaults.screenshot_dir),
            fingerprint_db: env_var("EASM_FINGERPRINT_DB").unwrap_or(defaults.fingerprint_db),
        }
    }

    /// Comma-separated API keys, trimmed and de-duplicated.
    pub fn allowed_api_keys(&self) -> FxHashSet<String> {
        self.api_keys
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// Parse the per-key project ACL.
    ///
    /// Format: `{"api-key-1": ["<project-uuid>", "*"], "api-key-2": [...]}`.
    /// `*` grants access to every project.
    pub fn api_key_acl(&self) -> Result<FxHashMap<String, FxHashSet<String>>, ConfigError> {
        let raw = self.api_key_project_map.trim();
        if raw.is_empty() {
            return Ok(FxHashMap::default());
        }

        let loaded: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::BadAcl {
                reason: format!("must be valid JSON: {e}"),
            })?;
        let object = loaded.as_object().ok_or_else(|| ConfigError::BadAcl {
            reason: "must be a JSON object".to_string(),
        })?;

        let mut acl = FxHashMap::default();
        for (key, project_ids) in object {
            if key.trim().is_empty() {
                return Err(ConfigError::BadAcl {
                    reason: "contains an empty API key".to_string(),
                });
            }
            let list = project_ids.as_array().ok_or_else(|| ConfigError::BadAcl {
                reason: format!("value for key {key:?} must be an array"),
            })?;
            let projects = list
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            acl.insert(key.trim().to_string(), projects);
        }
        Ok(acl)
    }

    /// Whether `api_key` may touch `project_id` under the configured ACL.
    ///
    /// An absent ACL grants every valid key every project; a present ACL
    /// denies keys it does not list.
    pub fn key_can_access(&self, api_key: &str, project_id: Uuid) -> bool {
        let acl = match self.api_key_acl() {
            Ok(acl) => acl,
            Err(_) => return false,
        };
        if acl.is_empty() {
            return true;
        }
        match acl.get(api_key) {
            Some(projects) => {
                projects.contains("*") || projects.contains(&project_id.to_string())
            }
            None => false,
        }
    }

    /// Fail fast on invalid security or wiring settings.
    pub fn validate_runtime(&self) -> Result<(), ConfigError> {
        if self.auth_enabled && self.allowed_api_keys().is_empty() {
            return Err(ConfigError::EmptyApiKeys);
        }
        self.api_key_acl()?;

        let parsed = Url::parse(&self.redis_url).map_err(|e| ConfigError::BadRedisUrl {
            reason: e.to_string(),
        })?;
        let host = parsed.host_str().unwrap_or_default();
        let port = parsed.port().unwrap_or(6379);

        // Inside the compose network the broker container only listens on 6379.
        if host == "redis" && port != 6379 {
            return Err(ConfigError::BadRedisUrl {
                reason: "host 'redis' must use container port 6379".to_string(),
            });
        }
        Ok(())
    }
}
