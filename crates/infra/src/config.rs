//! Environment-driven configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::jobs::manager::DEFAULT_MAX_ERROR_MESSAGES;
use crate::retry::RetryPolicy;
use crate::upstream::MAX_PAGE_SIZE;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub import: ImportConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Shop connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Bare host, e.g. `my-shop.myshopify.com`.
    pub shop_domain: String,
    pub access_token: String,
    pub api_version: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("shop_domain", &self.shop_domain)
            .field("access_token", &"[REDACTED]")
            .field("api_version", &self.api_version)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl UpstreamConfig {
    pub const DEFAULT_API_VERSION: &'static str = "2025-10";

    pub fn new(shop_domain: &str, access_token: impl Into<String>) -> Self {
        Self {
            shop_domain: normalize_shop_domain(shop_domain),
            access_token: access_token.into(),
            api_version: Self::DEFAULT_API_VERSION.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Admin API root, ending in `/`.
    pub fn admin_base_url(&self) -> String {
        format!("https://{}/admin/api/{}/", self.shop_domain, self.api_version)
    }
}

/// Strip scheme, path, and trailing slashes from a shop domain.
pub fn normalize_shop_domain(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Import tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportConfig {
    /// Orders per page, at most [`MAX_PAGE_SIZE`].
    pub page_size: u32,
    pub poll_interval: Duration,
    pub inter_page_delay: Duration,
    pub retry: RetryPolicy,
    pub max_error_messages: usize,
    /// Bulk lines between checkpoint saves.
    pub bulk_checkpoint_every: u64,
    /// Ask the upstream for a total before paging.
    pub count_total: bool,
    pub list_limit: usize,
    pub timezone: Tz,
    /// Terminal jobs older than this are pruned.
    pub job_retention: Duration,
    pub idempotency_retention: Duration,
    pub janitor_interval: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            poll_interval: Duration::from_secs(5),
            inter_page_delay: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            max_error_messages: DEFAULT_MAX_ERROR_MESSAGES,
            bulk_checkpoint_every: 100,
            count_total: true,
            list_limit: 50,
            timezone: chrono_tz::Europe::Berlin,
            job_retention: Duration::from_secs(24 * 60 * 60),
            idempotency_retention: Duration::from_secs(30 * 24 * 60 * 60),
            janitor_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Where state lives. Without a state dir everything is in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub state_dir: Option<PathBuf>,
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let server = ServerConfig {
            bind_addr: env.parsed("ORDERSYNC_BIND_ADDR")?.unwrap_or(ServerConfig::default().bind_addr),
        };

        let mut upstream = UpstreamConfig::new(
            &env.required("SHOPIFY_SHOP_DOMAIN")?,
            env.required("SHOPIFY_ACCESS_TOKEN")?,
        );
        if upstream.shop_domain.is_empty() {
            return Err(ConfigError::Invalid {
                var: "SHOPIFY_SHOP_DOMAIN",
                value: env.get("SHOPIFY_SHOP_DOMAIN").unwrap_or_default(),
                reason: "no host name".into(),
            });
        }
        if let Some(version) = env.get("SHOPIFY_API_VERSION") {
            upstream.api_version = version;
        }
        if let Some(secs) = env.parsed::<u64>("ORDERSYNC_REQUEST_TIMEOUT_SECS")? {
            upstream.request_timeout = Duration::from_secs(secs);
        }

        let defaults = ImportConfig::default();
        let mut retry = defaults.retry.clone();
        if let Some(max) = env.parsed("ORDERSYNC_MAX_RETRIES")? {
            retry.max_retries = max;
        }
        if let Some(backoff) = env.parsed("ORDERSYNC_RETRY_BACKOFF")? {
            retry.backoff = backoff;
        }
        if let Some(base) = env.millis("ORDERSYNC_RETRY_BASE_DELAY_MS")? {
            retry.base_delay = base;
        }
        if let Some(max) = env.millis("ORDERSYNC_RETRY_MAX_DELAY_MS")? {
            retry.max_delay = max;
        }
        retry.max_delay = retry.max_delay.max(retry.base_delay);
        let page_size = env
            .parsed::<u32>("ORDERSYNC_PAGE_SIZE")?
            .unwrap_or(defaults.page_size)
            .clamp(1, MAX_PAGE_SIZE);
        let timezone = match env.get("ORDERSYNC_TIMEZONE") {
            Some(name) => Tz::from_str(&name).map_err(|e| ConfigError::Invalid {
                var: "ORDERSYNC_TIMEZONE",
                value: name.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.timezone,
        };

        let import = ImportConfig {
            page_size,
            poll_interval: env
                .millis("ORDERSYNC_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            inter_page_delay: env
                .millis("ORDERSYNC_INTER_PAGE_DELAY_MS")?
                .unwrap_or(defaults.inter_page_delay),
            retry,
            max_error_messages: env
                .parsed("ORDERSYNC_MAX_ERROR_MESSAGES")?
                .unwrap_or(defaults.max_error_messages),
            bulk_checkpoint_every: env
                .parsed::<u64>("ORDERSYNC_BULK_CHECKPOINT_EVERY")?
                .unwrap_or(defaults.bulk_checkpoint_every)
                .max(1),
            count_total: env.flag("ORDERSYNC_COUNT_TOTAL")?.unwrap_or(defaults.count_total),
            list_limit: env.parsed("ORDERSYNC_LIST_LIMIT")?.unwrap_or(defaults.list_limit),
            timezone,
            ..defaults
        };

        let storage = StorageConfig {
            state_dir: env.get("ORDERSYNC_STATE_DIR").map(PathBuf::from),
            database_url: env.get("DATABASE_URL"),
        };

        Ok(Self {
            server,
            upstream,
            import,
            storage,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-blank value of `var`.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parsed<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed::<u64>(var)?.map(Duration::from_millis))
    }

    fn flag(&self, var: &'static str) -> Result<Option<bool>, ConfigError> {
        self.get(var)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected a boolean".into(),
                }),
            })
            .transpose()
    }
}
