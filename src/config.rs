//! Process configuration.
//!
//! Everything here is read once at startup. Values come from environment
//! variables (optionally via a `.env` file) and, for the moderation word and
//! pattern lists, an optional JSON file named by `MODERATION_LISTS_PATH`.

use crate::security::analyzer::AnalyzerFailurePolicy;
use crate::security::content_filter::{DEFAULT_BLOCKED_TERMS, DEFAULT_SEXUAL_PATTERNS};
use crate::security::file_validator::{DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_SUSPICIOUS_FILENAME_PATTERNS};
use crate::security::link_validator::{DEFAULT_BLOCKED_DOMAINS, DEFAULT_MALICIOUS_URL_PATTERNS};
use crate::security::rate_limiter::{EscalationPolicy, RateLimitPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("failed to read moderation lists file {path}: {source}")]
    ListsIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse moderation lists file {path}: {source}")]
    ListsJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address (default: 0.0.0.0:3001)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Use the first `X-Forwarded-For` hop as the client address
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Enables the hosted moderation analyzer when set
    #[serde(default, skip_serializing)]
    pub openai_api_key: Option<String>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub moderation: ModerationConfig,
}

/// Limits for the two limiter instances and the IP escalation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Content-creation window per user in seconds (default: 900)
    #[serde(default = "default_content_window_secs")]
    pub content_window_secs: u64,

    /// Content creations allowed per window (default: 5)
    #[serde(default = "default_content_max")]
    pub content_max: usize,

    /// IP window in seconds (default: 60)
    #[serde(default = "default_ip_window_secs")]
    pub ip_window_secs: u64,

    /// Requests allowed per IP window (default: 10)
    #[serde(default = "default_ip_max")]
    pub ip_max: usize,

    /// Violation observation window in seconds (default: 300)
    #[serde(default = "default_violation_window_secs")]
    pub violation_window_secs: u64,

    /// Attempts inside the violation window above which an IP is blacklisted (default: 50)
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: usize,

    /// Idle principals are dropped after this many empty windows (default: 10)
    #[serde(default = "default_idle_eviction_multiple")]
    pub idle_eviction_multiple: u32,

    /// How often idle principals are swept, in seconds (default: 300)
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used by `set` when none is given (default: 60)
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Interval of the expired-entry sweep (default: 120)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Moderation limits and the static term/pattern lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Sanitized free-text fields are truncated to this many characters (default: 1000)
    #[serde(default = "default_max_field_length")]
    pub max_field_length: usize,

    /// Longest description/content accepted, in characters (default: 500)
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,

    /// Uppercase ratio above which text is rejected (default: 0.5)
    #[serde(default = "default_caps_ratio")]
    pub caps_ratio: f64,

    /// Caps check only applies to text longer than this (default: 10)
    #[serde(default = "default_caps_min_length")]
    pub caps_min_length: usize,

    /// Also match blocked terms after undoing common character substitutions
    #[serde(default = "default_true")]
    pub normalize_leet: bool,

    /// Fields that go through text validation (default: description, content)
    #[serde(default = "default_text_fields")]
    pub text_fields: Vec<String>,

    #[serde(default = "default_blocked_terms")]
    pub blocked_terms: Vec<String>,

    #[serde(default = "default_sexual_patterns")]
    pub sexual_patterns: Vec<String>,

    #[serde(default = "default_malicious_url_patterns")]
    pub malicious_url_patterns: Vec<String>,

    #[serde(default = "default_blocked_domains")]
    pub blocked_domains: Vec<String>,

    #[serde(default = "default_suspicious_filename_patterns")]
    pub suspicious_filename_patterns: Vec<String>,

    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Largest accepted attachment in bytes (default: 5 MiB, inclusive)
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,

    /// Content images per submission (default: 5)
    #[serde(default = "default_max_content_images")]
    pub max_content_images: usize,

    /// Custom pin images per submission (default: 1)
    #[serde(default = "default_max_pin_images")]
    pub max_pin_images: usize,

    /// Per-call budget for the external analyzer (default: 3000)
    #[serde(default = "default_analyzer_timeout_ms")]
    pub analyzer_timeout_ms: u64,

    /// What an analyzer error or timeout means (default: fail open)
    #[serde(default)]
    pub analyzer_failure_policy: AnalyzerFailurePolicy,
}

/// Optional overrides for the moderation lists, read from JSON.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModerationLists {
    pub blocked_terms: Option<Vec<String>>,
    pub sexual_patterns: Option<Vec<String>>,
    pub malicious_url_patterns: Option<Vec<String>>,
    pub blocked_domains: Option<Vec<String>>,
    pub suspicious_filename_patterns: Option<Vec<String>>,
    pub allowed_extensions: Option<Vec<String>>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_content_window_secs() -> u64 {
    15 * 60
}

fn default_content_max() -> usize {
    5
}

fn default_ip_window_secs() -> u64 {
    60
}

fn default_ip_max() -> usize {
    10
}

fn default_violation_window_secs() -> u64 {
    5 * 60
}

fn default_blacklist_threshold() -> usize {
    50
}

fn default_idle_eviction_multiple() -> u32 {
    10
}

fn default_eviction_interval_secs() -> u64 {
    300
}

/// Longest cache TTL `validate` accepts (30 days).
pub const MAX_CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    120
}

fn default_max_field_length() -> usize {
    1000
}

fn default_max_text_length() -> usize {
    500
}

fn default_caps_ratio() -> f64 {
    0.5
}

fn default_caps_min_length() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_text_fields() -> Vec<String> {
    vec!["description".to_string(), "content".to_string()]
}

fn to_owned_list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_blocked_terms() -> Vec<String> {
    to_owned_list(DEFAULT_BLOCKED_TERMS)
}

fn default_sexual_patterns() -> Vec<String> {
    to_owned_list(DEFAULT_SEXUAL_PATTERNS)
}

fn default_malicious_url_patterns() -> Vec<String> {
    to_owned_list(DEFAULT_MALICIOUS_URL_PATTERNS)
}

fn default_blocked_domains() -> Vec<String> {
    to_owned_list(DEFAULT_BLOCKED_DOMAINS)
}

fn default_suspicious_filename_patterns() -> Vec<String> {
    to_owned_list(DEFAULT_SUSPICIOUS_FILENAME_PATTERNS)
}

fn default_allowed_extensions() -> Vec<String> {
    to_owned_list(DEFAULT_ALLOWED_EXTENSIONS)
}

fn default_max_file_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_content_images() -> usize {
    5
}

fn default_max_pin_images() -> usize {
    1
}

fn default_analyzer_timeout_ms() -> u64 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            trust_forwarded_for: false,
            openai_api_key: None,
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            moderation: ModerationConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            content_window_secs: default_content_window_secs(),
            content_max: default_content_max(),
            ip_window_secs: default_ip_window_secs(),
            ip_max: default_ip_max(),
            violation_window_secs: default_violation_window_secs(),
            blacklist_threshold: default_blacklist_threshold(),
            idle_eviction_multiple: default_idle_eviction_multiple(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            max_field_length: default_max_field_length(),
            max_text_length: default_max_text_length(),
            caps_ratio: default_caps_ratio(),
            caps_min_length: default_caps_min_length(),
            normalize_leet: default_true(),
            text_fields: default_text_fields(),
            blocked_terms: default_blocked_terms(),
            sexual_patterns: default_sexual_patterns(),
            malicious_url_patterns: default_malicious_url_patterns(),
            blocked_domains: default_blocked_domains(),
            suspicious_filename_patterns: default_suspicious_filename_patterns(),
            allowed_extensions: default_allowed_extensions(),
            max_file_size_bytes: default_max_file_size_bytes(),
            max_content_images: default_max_content_images(),
            max_pin_images: default_max_pin_images(),
            analyzer_timeout_ms: default_analyzer_timeout_ms(),
            analyzer_failure_policy: AnalyzerFailurePolicy::default(),
        }
    }
}

impl RateLimitConfig {
    /// Policy for the per-user content-creation limiter.
    pub fn content_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            window: Duration::from_secs(self.content_window_secs),
            max_requests: self.content_max,
            escalation: None,
        }
    }

    /// Policy for the per-address limiter, including blacklist escalation.
    pub fn ip_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            window: Duration::from_secs(self.ip_window_secs),
            max_requests: self.ip_max,
            escalation: Some(EscalationPolicy {
                violation_window: Duration::from_secs(self.violation_window_secs),
                threshold: self.blacklist_threshold,
            }),
        }
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ModerationConfig {
    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_millis(self.analyzer_timeout_ms)
    }

    /// Replace whichever lists the override file provides.
    pub fn apply_lists(&mut self, lists: ModerationLists) {
        if let Some(v) = lists.blocked_terms {
            self.blocked_terms = v;
        }
        if let Some(v) = lists.sexual_patterns {
            self.sexual_patterns = v;
        }
        if let Some(v) = lists.malicious_url_patterns {
            self.malicious_url_patterns = v;
        }
        if let Some(v) = lists.blocked_domains {
            self.blocked_domains = v;
        }
        if let Some(v) = lists.suspicious_filename_patterns {
            self.suspicious_filename_patterns = v;
        }
        if let Some(v) = lists.allowed_extensions {
            self.allowed_extensions = v;
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Unset variables fall back to defaults; set but unparsable ones are an
    /// error rather than being silently ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let mut config = Config {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            trust_forwarded_for: env_parse("TRUST_FORWARDED_FOR", false)?,
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            rate_limit: RateLimitConfig {
                content_window_secs: env_parse(
                    "CONTENT_RATE_WINDOW_SECS",
                    defaults.rate_limit.content_window_secs,
                )?,
                content_max: env_parse("CONTENT_RATE_MAX", defaults.rate_limit.content_max)?,
                ip_window_secs: env_parse("IP_RATE_WINDOW_SECS", defaults.rate_limit.ip_window_secs)?,
                ip_max: env_parse("IP_RATE_MAX", defaults.rate_limit.ip_max)?,
                violation_window_secs: env_parse(
                    "IP_VIOLATION_WINDOW_SECS",
                    defaults.rate_limit.violation_window_secs,
                )?,
                blacklist_threshold: env_parse(
                    "IP_BLACKLIST_THRESHOLD",
                    defaults.rate_limit.blacklist_threshold,
                )?,
                ..defaults.rate_limit
            },
            cache: CacheConfig {
                default_ttl_secs: env_parse("CACHE_TTL_SECS", defaults.cache.default_ttl_secs)?,
                sweep_interval_secs: env_parse(
                    "CACHE_SWEEP_INTERVAL_SECS",
                    defaults.cache.sweep_interval_secs,
                )?,
            },
            moderation: ModerationConfig {
                max_file_size_bytes: env_parse(
                    "MAX_FILE_SIZE_BYTES",
                    defaults.moderation.max_file_size_bytes,
                )?,
                analyzer_timeout_ms: env_parse(
                    "ANALYZER_TIMEOUT_MS",
                    defaults.moderation.analyzer_timeout_ms,
                )?,
                analyzer_failure_policy: env_parse(
                    "ANALYZER_FAILURE_POLICY",
                    defaults.moderation.analyzer_failure_policy,
                )?,
                ..defaults.moderation
            },
        };

        if let Ok(path) = std::env::var("MODERATION_LISTS_PATH") {
            let lists = load_lists(&path)?;
            config.moderation.apply_lists(lists);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make a component meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if rl.content_window_secs == 0 || rl.ip_window_secs == 0 || rl.violation_window_secs == 0 {
            return Err(ConfigError::Invalid("rate limit windows must be non-zero".into()));
        }
        if rl.content_max == 0 || rl.ip_max == 0 {
            return Err(ConfigError::Invalid("rate limit maxima must be non-zero".into()));
        }
        if rl.eviction_interval_secs == 0 {
            return Err(ConfigError::Invalid("eviction interval must be non-zero".into()));
        }
        let cache = &self.cache;
        if cache.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid("cache TTL must be non-zero".into()));
        }
        if cache.default_ttl_secs > MAX_CACHE_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "cache TTL must not exceed {} seconds",
                MAX_CACHE_TTL_SECS
            )));
        }
        if cache.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("cache sweep interval must be non-zero".into()));
        }
        let m = &self.moderation;
        if m.max_field_length < m.max_text_length {
            // Truncating below the length limit would hide over-long input.
            return Err(ConfigError::Invalid(
                "max_field_length must not be smaller than max_text_length".into(),
            ));
        }
        if !(0.0..=1.0).contains(&m.caps_ratio) {
            return Err(ConfigError::Invalid("caps_ratio must be within 0..=1".into()));
        }
        Ok(())
    }
}

/// Read the JSON list overrides.
pub fn load_lists(path: impl AsRef<Path>) -> Result<ModerationLists, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ListsIo {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::ListsJson {
        path: path.display().to_string(),
        source,
    })
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_limits() {
        let config = Config::default();
        let content = config.rate_limit.content_policy();
        assert_eq!(content.window, Duration::from_secs(900));
        assert_eq!(content.max_requests, 5);
        assert!(content.escalation.is_none());

        let ip = config.rate_limit.ip_policy();
        assert_eq!(ip.window, Duration::from_secs(60));
        assert_eq!(ip.max_requests, 10);
        let escalation = ip.escalation.unwrap();
        assert_eq!(escalation.violation_window, Duration::from_secs(300));
        assert_eq!(escalation.threshold, 50);

        assert_eq!(config.cache.default_ttl(), Duration::from_secs(60));
        assert_eq!(config.moderation.max_file_size_bytes, 5 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"rate_limit": {"ip_max": 3}, "cache": {}}"#).unwrap();
        assert_eq!(config.rate_limit.ip_max, 3);
        assert_eq!(config.rate_limit.content_max, 5);
        assert_eq!(config.moderation.max_text_length, 500);
        assert_eq!(config.moderation.analyzer_failure_policy, AnalyzerFailurePolicy::FailOpen);
    }

    #[test]
    fn test_apply_lists_replaces_only_given() {
        let mut moderation = ModerationConfig::default();
        let domains = moderation.blocked_domains.clone();
        let lists: ModerationLists =
            serde_json::from_str(r#"{"blocked_terms": ["spam-test-badword"]}"#).unwrap();
        moderation.apply_lists(lists);
        assert_eq!(moderation.blocked_terms, vec!["spam-test-badword".to_string()]);
        assert_eq!(moderation.blocked_domains, domains);
    }

    #[test]
    fn test_validate_rejects_short_truncation() {
        let mut config = Config::default();
        config.moderation.max_field_length = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = Config::default();
        config.cache.sweep_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit.eviction_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_cache_ttl() {
        let mut config = Config::default();
        config.cache.default_ttl_secs = MAX_CACHE_TTL_SECS;
        assert!(config.validate().is_ok());

        config.cache.default_ttl_secs = u64::MAX;
        assert!(config.validate().is_err());
    }
}
