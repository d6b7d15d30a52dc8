use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("hold TTL bounds: need min <= default <= max, got {min:?} / {default:?} / {max:?}")]
    HoldTtlBounds {
        min: Duration,
        default: Duration,
        max: Duration,
    },
}

/// Knobs of the booking engine itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hold_min_ttl: Duration,
    pub hold_max_ttl: Duration,
    /// TTL used when a hold request names none.
    pub hold_default_ttl: Duration,
    /// Retries after the first serializable attempt.
    pub booking_max_retries: u32,
    /// No new attempt starts once this much time has passed.
    pub booking_deadline: Duration,
    /// Backoff before retry `n` is `retry_backoff * 2^(n-1)`.
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_min_ttl: Duration::from_secs(5 * 60),
            hold_max_ttl: Duration::from_secs(30 * 60),
            hold_default_ttl: Duration::from_secs(15 * 60),
            booking_max_retries: 3,
            booking_deadline: Duration::from_millis(2_000),
            retry_backoff: Duration::from_millis(5),
        }
    }
}

impl EngineConfig {
    /// Clamp a requested TTL into `[hold_min_ttl, hold_max_ttl]`.
    pub fn clamp_ttl(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.hold_default_ttl)
            .clamp(self.hold_min_ttl, self.hold_max_ttl)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.hold_min_ttl <= self.hold_default_ttl && self.hold_default_ttl <= self.hold_max_ttl {
            Ok(self)
        } else {
            Err(ConfigError::HoldTtlBounds {
                min: self.hold_min_ttl,
                default: self.hold_default_ttl,
                max: self.hold_max_ttl,
            })
        }
    }
}

/// Everything the server binary reads from its environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    /// `None` disables the expired-hold sweep.
    pub sweep_interval: Option<Duration>,
    pub sweep_grace: Duration,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any `RENTAL_*` variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            hold_min_ttl: env.secs("RENTAL_HOLD_MIN_TTL_SECS", defaults.hold_min_ttl)?,
            hold_max_ttl: env.secs("RENTAL_HOLD_MAX_TTL_SECS", defaults.hold_max_ttl)?,
            hold_default_ttl: env.secs("RENTAL_HOLD_DEFAULT_TTL_SECS", defaults.hold_default_ttl)?,
            booking_max_retries: env.parse("RENTAL_BOOKING_MAX_RETRIES", defaults.booking_max_retries)?,
            booking_deadline: env.millis("RENTAL_BOOKING_DEADLINE_MS", defaults.booking_deadline)?,
            retry_backoff: env.millis("RENTAL_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
        }
        .validate()?;

        let sweep_secs: u64 = env.parse("RENTAL_SWEEP_INTERVAL_SECS", 60)?;
        Ok(Self {
            bind: env.string("RENTAL_BIND", "0.0.0.0"),
            port: env.parse("RENTAL_PORT", 5433)?,
            data_dir: PathBuf::from(env.string("RENTAL_DATA_DIR", "./data")),
            password: env.string("RENTAL_PASSWORD", "rental"),
            max_connections: env.parse("RENTAL_MAX_CONNECTIONS", 256)?,
            metrics_port: env.optional("RENTAL_METRICS_PORT")?,
            compact_threshold: env.parse("RENTAL_COMPACT_THRESHOLD", 1000)?,
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            sweep_grace: env.secs("RENTAL_SWEEP_GRACE_SECS", Duration::from_secs(3600))?,
            engine,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, var: &str, default: &str) -> String {
        (self.0)(var).unwrap_or_else(|| default.to_string())
    }

    fn optional<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        match (self.0)(var) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { var, value }),
        }
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.optional(var)?.unwrap_or(default))
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self.optional(var)?.map_or(default, Duration::from_secs))
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self.optional(var)?.map_or(default, Duration::from_millis))
    }
}
