//! Configuration loaded from environment variables.
//!
//! Every setting has a default suitable for local development. Values that
//! are present but unparsable are reported as [`ConfigError::Invalid`] so the
//! binary can refuse to start instead of silently falling back.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use spheroseg_core::queue::QueueConfig;
use spheroseg_events::BroadcastConfig;
use spheroseg_inference::{BreakerConfig, InferenceConfig};
use spheroseg_pipeline::{PipelineConfig, ReconcilePolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Reads one variable. `std::env::var` in production, a map in tests.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Postgres connection string. Without one the server keeps task rows
    /// in memory.
    pub database_url: Option<String>,
}

impl ServerConfig {
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `DATABASE_URL`         | unset (in-memory store)    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(get: Lookup) -> Result<Self, ConfigError> {
        let cors_origins = get("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(get, "PORT", 3000)?,
            cors_origins,
            request_timeout_secs: parse_or(get, "REQUEST_TIMEOUT_SECS", 30)?,
            database_url: get("DATABASE_URL").filter(|url| !url.trim().is_empty()),
        })
    }
}

// ---------------------------------------------------------------------------
// Everything else
// ---------------------------------------------------------------------------

/// Settings for every component the binary wires together.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub inference: InferenceConfig,
    pub breaker: BreakerConfig,
    pub broadcast: BroadcastConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(get: Lookup) -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_lookup(get)?,
            queue: queue_config(get)?,
            inference: inference_config(get)?,
            breaker: breaker_config(get)?,
            broadcast: broadcast_config(get)?,
            pipeline: pipeline_config(get)?,
        })
    }
}

/// | Env Var                       | Default |
/// |-------------------------------|---------|
/// | `SEGMENTATION_MAX_CONCURRENT` | `2`     |
///
/// Priority, retries, retry delay and time-out keep their queue defaults.
/// The queue is built stopped; the binary starts it after the startup sweep.
fn queue_config(get: Lookup) -> Result<QueueConfig, ConfigError> {
    let max_concurrent: usize = parse_or(get, "SEGMENTATION_MAX_CONCURRENT", 2)?;
    if max_concurrent == 0 {
        return Err(ConfigError::Invalid {
            key: "SEGMENTATION_MAX_CONCURRENT",
            value: "0".into(),
        });
    }
    Ok(QueueConfig {
        max_concurrent,
        auto_start: false,
        ..QueueConfig::default()
    })
}

/// | Env Var                    | Default                 |
/// |----------------------------|-------------------------|
/// | `ML_SERVICE_URL`           | `http://localhost:5002` |
/// | `ML_SEGMENT_TIMEOUT_SECS`  | `300`                   |
/// | `ML_FEATURES_TIMEOUT_SECS` | `60`                    |
/// | `ML_HEALTH_TIMEOUT_SECS`   | `5`                     |
fn inference_config(get: Lookup) -> Result<InferenceConfig, ConfigError> {
    let defaults = InferenceConfig::default();
    Ok(InferenceConfig {
        base_url: get("ML_SERVICE_URL").unwrap_or(defaults.base_url),
        segment_timeout: secs_or(get, "ML_SEGMENT_TIMEOUT_SECS", defaults.segment_timeout)?,
        features_timeout: secs_or(get, "ML_FEATURES_TIMEOUT_SECS", defaults.features_timeout)?,
        health_timeout: secs_or(get, "ML_HEALTH_TIMEOUT_SECS", defaults.health_timeout)?,
    })
}

/// | Env Var                       | Default |
/// |-------------------------------|---------|
/// | `BREAKER_FAILURE_THRESHOLD`   | `5`     |
/// | `BREAKER_ERROR_PERCENTAGE`    | `50`    |
/// | `BREAKER_VOLUME_THRESHOLD`    | `10`    |
/// | `BREAKER_ROLLING_WINDOW_SECS` | `60`    |
/// | `BREAKER_RESET_TIMEOUT_SECS`  | `30`    |
fn breaker_config(get: Lookup) -> Result<BreakerConfig, ConfigError> {
    let defaults = BreakerConfig::default();
    let error_percentage: u8 = parse_or(get, "BREAKER_ERROR_PERCENTAGE", defaults.error_percentage)?;
    if error_percentage > 100 {
        return Err(ConfigError::Invalid {
            key: "BREAKER_ERROR_PERCENTAGE",
            value: error_percentage.to_string(),
        });
    }
    Ok(BreakerConfig {
        failure_threshold: parse_or(get, "BREAKER_FAILURE_THRESHOLD", defaults.failure_threshold)?,
        error_percentage,
        volume_threshold: parse_or(get, "BREAKER_VOLUME_THRESHOLD", defaults.volume_threshold)?,
        rolling_window: secs_or(get, "BREAKER_ROLLING_WINDOW_SECS", defaults.rolling_window)?,
        reset_timeout: secs_or(get, "BREAKER_RESET_TIMEOUT_SECS", defaults.reset_timeout)?,
        call_timeout: None,
    })
}

/// | Env Var                        | Default |
/// |--------------------------------|---------|
/// | `PROGRESS_THROTTLE_MS`         | `500`   |
/// | `PROGRESS_THROTTLE_CACHE_SIZE` | `1024`  |
/// | `PROGRESS_THROTTLE_TTL_SECS`   | `600`   |
fn broadcast_config(get: Lookup) -> Result<BroadcastConfig, ConfigError> {
    let defaults = BroadcastConfig::default();
    let interval_ms: u64 = parse_or(
        get,
        "PROGRESS_THROTTLE_MS",
        defaults.throttle_interval.as_millis() as u64,
    )?;
    Ok(BroadcastConfig {
        throttle_interval: Duration::from_millis(interval_ms),
        cache_capacity: parse_or(get, "PROGRESS_THROTTLE_CACHE_SIZE", defaults.cache_capacity)?,
        cache_ttl: secs_or(get, "PROGRESS_THROTTLE_TTL_SECS", defaults.cache_ttl)?,
    })
}

/// | Env Var              | Default   |
/// |----------------------|-----------|
/// | `MODEL_PATH`         | unset     |
/// | `ML_REQUIRE_HEALTHY` | `false`   |
/// | `EXTRACT_FEATURES`   | `true`    |
/// | `RECONCILE_POLICY`   | `requeue` |
fn pipeline_config(get: Lookup) -> Result<PipelineConfig, ConfigError> {
    let defaults = PipelineConfig::default();
    let reconcile_policy = match get("RECONCILE_POLICY") {
        None => defaults.reconcile_policy,
        Some(raw) => raw.parse::<ReconcilePolicy>().map_err(|_| ConfigError::Invalid {
            key: "RECONCILE_POLICY",
            value: raw,
        })?,
    };
    Ok(PipelineConfig {
        model_path: get("MODEL_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from),
        require_healthy: bool_or(get, "ML_REQUIRE_HEALTHY", defaults.require_healthy)?,
        extract_features: bool_or(get, "EXTRACT_FEATURES", defaults.extract_features)?,
        reconcile_policy,
    })
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_or<T: FromStr>(get: Lookup, key: &'static str, default: T) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn secs_or(get: Lookup, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn bool_or(get: Lookup, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value: raw }),
    }
}
