//! Centralized configuration for api-server.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than at request time.

use axum::http::HeaderValue;
use domain::Money;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Storage backend provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// In-memory storage (data lost on restart)
    Memory,
    /// SQLite file-based storage
    Sqlite,
}

impl StorageProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("sqlite") {
            Self::Sqlite
        } else {
            Self::Memory
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Server configuration loaded from environment variables.
///
/// All fields are validated at construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 3001)
    pub port: u16,
    /// CORS allow origin
    pub cors_allow_origin: HeaderValue,
    /// Storage provider
    pub storage_provider: StorageProvider,
    /// SQLite database path (default: data/shortlinks.db)
    pub db_path: PathBuf,
    /// Log format
    pub log_format: LogFormat,
    /// Custom shortlink domain for generated URLs
    pub shortlink_domain: Option<String>,
    /// User ids allowed to call /api/admin routes
    pub operator_ids: HashSet<String>,
    /// Lookback for server-side visit dedup
    pub dedup_window: Duration,
    /// Validated clicks between owner milestone notifications
    pub milestone_step: u64,
    /// Minimum time a rule target must stay open
    pub min_rule_dwell: Duration,
    /// Gate sessions older than this are pruned
    pub session_ttl: Duration,
    /// Rate billed when no period covers a click
    pub fallback_cpm: Money,
    /// Rate to open when the ledger is empty at startup
    pub initial_cpm: Option<Money>,
    /// Sponsor attached to every new link
    pub default_sponsor_url: Option<String>,
    /// Remote anomaly advisor; the local burst heuristic is used when unset
    pub advisor_url: Option<String>,
    pub advisor_timeout: Duration,
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// Fails fast on invalid configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Port
        let port = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(3001);

        // CORS allow origin
        let cors_origin_str = get("CORS_ALLOW_ORIGIN").unwrap_or_else(|| "*".into());
        let cors_allow_origin = if cors_origin_str == "*" {
            HeaderValue::from_static("*")
        } else {
            HeaderValue::from_str(&cors_origin_str).map_err(|e| ConfigError {
                field: "CORS_ALLOW_ORIGIN",
                message: format!("Invalid header value '{}': {}", cors_origin_str, e),
            })?
        };

        // Storage provider
        let storage_provider = StorageProvider::from_str(
            &get("STORAGE_PROVIDER").unwrap_or_else(|| "sqlite".into()),
        );

        // DB path (for sqlite)
        let db_path = get("DB_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/shortlinks.db"));

        // Log format
        let log_format = LogFormat::from_str(&get("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        // Shortlink domain
        let shortlink_domain = get("SHORTLINK_DOMAIN").filter(|s| !s.is_empty());

        let operator_ids = get("OPERATOR_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let dedup_window = Duration::from_secs(positive_u64(&get, "DEDUP_WINDOW_SECS", 3600)?);
        let milestone_step = positive_u64(&get, "MILESTONE_STEP", 1000)?;
        let min_rule_dwell = Duration::from_secs(parse_u64(&get, "MIN_RULE_DWELL_SECS", 5)?);
        let session_ttl = Duration::from_secs(positive_u64(&get, "SESSION_TTL_SECS", 3600)?);
        let advisor_timeout = Duration::from_secs(positive_u64(&get, "ADVISOR_TIMEOUT_SECS", 5)?);

        let fallback_cpm = parse_rate(&get, "FALLBACK_CPM")?
            .unwrap_or(domain::rates::DEFAULT_FALLBACK_RATE);
        let initial_cpm = parse_rate(&get, "INITIAL_CPM")?;

        let default_sponsor_url = get("DEFAULT_SPONSOR_URL").filter(|s| !s.is_empty());
        if let Some(url) = &default_sponsor_url {
            domain::validate::validate_url(url).map_err(|e| ConfigError {
                field: "DEFAULT_SPONSOR_URL",
                message: e.to_string(),
            })?;
        }

        let advisor_url = get("ADVISOR_URL").filter(|s| !s.is_empty());
        if let Some(url) = &advisor_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError {
                    field: "ADVISOR_URL",
                    message: format!("Must be an http(s) URL, got '{}'", url),
                });
            }
        }

        Ok(Self {
            port,
            cors_allow_origin,
            storage_provider,
            db_path,
            log_format,
            shortlink_domain,
            operator_ids,
            dedup_window,
            milestone_step,
            min_rule_dwell,
            session_ttl,
            fallback_cpm,
            initial_cpm,
            default_sponsor_url,
            advisor_url,
            advisor_timeout,
        })
    }

    /// Log warnings about insecure configuration.
    pub fn warn_if_insecure(&self) {
        tracing::warn!(
            "Caller identity is taken from the X-Debug-User header. \
             Put an authenticating proxy in front of this server in production."
        );
        if self.operator_ids.is_empty() {
            tracing::warn!("OPERATOR_IDS not set: /api/admin routes will reject every caller.");
        }
        if self.storage_provider == StorageProvider::Memory {
            tracing::warn!("STORAGE_PROVIDER=memory: earnings are lost on restart.");
        }
    }
}

fn parse_u64(
    get: &impl Fn(&str) -> Option<String>,
    field: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get(field).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(s) => s.trim().parse().map_err(|_| ConfigError {
            field,
            message: format!("Expected a non-negative integer, got '{}'", s),
        }),
    }
}

fn positive_u64(
    get: &impl Fn(&str) -> Option<String>,
    field: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    let v = parse_u64(get, field, default)?;
    if v == 0 {
        return Err(ConfigError {
            field,
            message: "Must be greater than zero".into(),
        });
    }
    Ok(v)
}

fn parse_rate(
    get: &impl Fn(&str) -> Option<String>,
    field: &'static str,
) -> Result<Option<Money>, ConfigError> {
    let Some(raw) = get(field).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let rate = Money::parse(&raw)
        .and_then(|m| domain::rates::validate_rate(m).map(|_| m))
        .map_err(|e| ConfigError {
            field,
            message: e.to_string(),
        })?;
    Ok(Some(rate))
}
