//! Process configuration.
//!
//! Values come from an optional TOML file, `config/<environment>.toml` unless
//! a path is given, and are then overridden by `MCB_*` environment variables.
//! Every section has defaults, so an empty file (or no file) yields a runnable
//! local setup: memory queue, one million checkboxes.

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{engine::queue::QueueProvider, Error, Result};

pub const ENV_PREFIX: &str = "MCB_";
pub const DEFAULT_ENVIRONMENT: &str = "local";
pub const DEFAULT_CHECKBOX_COUNT: u32 = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: String,
    pub checkbox_count: u32,
    /// Stamped into every published action as its origin server.
    pub server_name: String,
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub consumer: ConsumerConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: DEFAULT_ENVIRONMENT.to_string(),
            checkbox_count: DEFAULT_CHECKBOX_COUNT,
            server_name: "mcb-local".to_string(),
            logging: LoggingConfig::default(),
            queue: QueueConfig::default(),
            database: DatabaseConfig::default(),
            consumer: ConsumerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Console,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "console" | "pretty" => Ok(Self::Console),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub provider: QueueProvider,
    /// Messages requested per receive. SQS caps this at 10.
    pub batch_size: usize,
    pub wait_time_secs: u64,
    pub visibility_timeout_secs: u64,
    /// Un-deleted message limit of the memory transport.
    pub capacity: usize,
    pub sqs: SqsConfig,
}

impl QueueConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: QueueProvider::Memory,
            batch_size: 10,
            wait_time_secs: 20,
            visibility_timeout_secs: 30,
            capacity: 100_000,
            sqs: SqsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    pub queue_url: Option<String>,
    pub profile: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `postgres://…` or `sqlite:…`.
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub min_connections: u32,
    pub max_connections: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub health_check_secs: u64,
    /// Upper bound on any single gateway call, transaction included.
    pub operation_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn require_url(&self) -> Result<&str> {
        self.url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::Config("database.url is required".into()))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            min_connections: 5,
            max_connections: 25,
            max_lifetime_secs: 60 * 60,
            idle_timeout_secs: 30 * 60,
            acquire_timeout_secs: 5,
            health_check_secs: 30,
            operation_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub worker_queue_depth: usize,
    /// Batches larger than this are rejected without dispatching anything.
    pub batch_ceiling: usize,
    pub min_sleep_ms: u64,
    pub backoff_multiplier: u32,
    pub stats_interval_secs: u64,
}

impl ConsumerConfig {
    pub fn min_sleep(&self) -> Duration {
        Duration::from_millis(self.min_sleep_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            worker_queue_depth: 100,
            batch_ceiling: 100,
            min_sleep_ms: 5_000,
            backoff_multiplier: 5,
            stats_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Full reload period; zero disables the periodic refresher.
    pub refresh_interval_secs: u64,
}

impl CacheConfig {
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0)
            .then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or from `config/<environment>.toml`
    /// when no path is given, then applies environment overrides.
    ///
    /// A missing default file is fine; a missing explicit file is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let environment = current_environment();
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path(&environment), false),
        };

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            Self::from_toml(&contents).map_err(|e| match e {
                Error::Config(reason) => {
                    Error::Config(format!("{}: {reason}", path.display()))
                }
                other => other,
            })?
        } else if required {
            return Err(Error::Config(format!(
                "config file {} not found",
                path.display()
            )));
        } else {
            Self::default()
        };

        config.environment = environment;
        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| Err(Error::Config(reason.to_string()));
        if self.checkbox_count == 0 {
            return fail("checkbox_count must be positive");
        }
        if self.consumer.workers == 0 {
            return fail("consumer.workers must be positive");
        }
        if self.consumer.worker_queue_depth == 0 {
            return fail("consumer.worker_queue_depth must be positive");
        }
        if self.queue.batch_size == 0 {
            return fail("queue.batch_size must be positive");
        }
        if self.queue.batch_size > self.consumer.batch_ceiling {
            return fail("queue.batch_size exceeds consumer.batch_ceiling");
        }
        if self.queue.capacity == 0 {
            return fail("queue.capacity must be positive");
        }
        if self.database.max_connections == 0 {
            return fail("database.max_connections must be positive");
        }
        if self.database.min_connections > self.database.max_connections {
            return fail(
                "database.min_connections exceeds database.max_connections",
            );
        }
        if self.database.health_check_secs == 0 {
            return fail("database.health_check_secs must be positive");
        }
        if self.consumer.stats_interval_secs == 0 {
            return fail("consumer.stats_interval_secs must be positive");
        }
        if self.database.operation_timeout_ms == 0 {
            return fail("database.operation_timeout_ms must be positive");
        }
        Ok(())
    }

    /// Looks a value up by dotted key, e.g. `queue.batch_size`. Unknown keys
    /// and unset options yield an empty string.
    pub fn get_string(&self, key: &str) -> String {
        let Ok(mut value) = serde_json::to_value(self) else {
            return String::new();
        };
        for part in key.split('.') {
            value = match value {
                serde_json::Value::Object(mut map) => {
                    map.remove(part).unwrap_or(serde_json::Value::Null)
                }
                _ => serde_json::Value::Null,
            };
        }
        match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        }
    }
}

pub fn current_environment() -> String {
    std::env::var(format!("{ENV_PREFIX}ENVIRONMENT"))
        .or_else(|_| std::env::var("ENVIRONMENT"))
        .map(|env| env.trim().to_ascii_lowercase())
        .ok()
        .filter(|env| !env.is_empty())
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
}

pub fn default_config_path(environment: &str) -> PathBuf {
    Path::new("config").join(format!("{environment}.toml"))
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, &|key| std::env::var(key).ok());
}

fn apply_overrides_from(
    config: &mut Config,
    lookup: &dyn Fn(&str) -> Option<String>,
) {
    let env = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    parse_into(&env, "CHECKBOX_COUNT", &mut config.checkbox_count);
    parse_into(&env, "SERVER_NAME", &mut config.server_name);
    parse_into(&env, "LOG_LEVEL", &mut config.logging.level);
    parse_into(&env, "LOG_FORMAT", &mut config.logging.format);

    parse_into(&env, "QUEUE_PROVIDER", &mut config.queue.provider);
    parse_into(&env, "QUEUE_BATCH_SIZE", &mut config.queue.batch_size);
    parse_into(&env, "QUEUE_WAIT_TIME_SECS", &mut config.queue.wait_time_secs);
    parse_into(
        &env,
        "QUEUE_VISIBILITY_TIMEOUT_SECS",
        &mut config.queue.visibility_timeout_secs,
    );
    parse_into(&env, "QUEUE_CAPACITY", &mut config.queue.capacity);
    optional_into(&env, "SQS_QUEUE_URL", &mut config.queue.sqs.queue_url);
    optional_into(&env, "AWS_PROFILE", &mut config.queue.sqs.profile);
    optional_into(&env, "AWS_REGION", &mut config.queue.sqs.region);

    optional_into(&env, "DATABASE_URL", &mut config.database.url);
    optional_into(&env, "DATABASE_USER", &mut config.database.user);
    optional_into(&env, "DATABASE_PASSWORD", &mut config.database.password);
    parse_into(
        &env,
        "DATABASE_MIN_CONNECTIONS",
        &mut config.database.min_connections,
    );
    parse_into(
        &env,
        "DATABASE_MAX_CONNECTIONS",
        &mut config.database.max_connections,
    );
    parse_into(
        &env,
        "DATABASE_OPERATION_TIMEOUT_MS",
        &mut config.database.operation_timeout_ms,
    );

    parse_into(&env, "CONSUMER_WORKERS", &mut config.consumer.workers);
    parse_into(
        &env,
        "CONSUMER_BATCH_CEILING",
        &mut config.consumer.batch_ceiling,
    );
    parse_into(&env, "CONSUMER_MIN_SLEEP_MS", &mut config.consumer.min_sleep_ms);
    parse_into(
        &env,
        "CONSUMER_BACKOFF_MULTIPLIER",
        &mut config.consumer.backoff_multiplier,
    );

    parse_into(
        &env,
        "CACHE_REFRESH_INTERVAL_SECS",
        &mut config.cache.refresh_interval_secs,
    );
}

fn parse_into<T>(env: &dyn Fn(&str) -> Option<String>, name: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = env(name) else { return };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    match trimmed.parse::<T>() {
        Ok(value) => *slot = value,
        Err(err) => {
            tracing::warn!("invalid {ENV_PREFIX}{name}, ignoring: {err}")
        }
    }
}

fn optional_into(
    env: &dyn Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut Option<String>,
) {
    if let Some(raw) = env(name) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            *slot = Some(trimmed.to_string());
        }
    }
}
