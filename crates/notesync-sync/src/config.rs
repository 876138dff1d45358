//! Runtime configuration: optional `notesync.yaml`, then environment
//! overrides, then validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notesync_adapters::BoundaryTarget;
use notesync_core::{IntegrityGate, ZoneKind};
use notesync_storage::{
    BreakerConfig, FetcherConfig, HttpClientConfig, RetryPolicy, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "notesync.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("environment variable {name}: cannot parse `{value}`")]
    Env { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherSettings {
    pub max_in_flight: usize,
    pub lease_timeout_secs: u64,
    /// Optional pacing on top of the concurrency ceiling.
    pub requests_per_minute: Option<u32>,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            lease_timeout_secs: 300,
            requests_per_minute: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub cooldown_multiplier: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
            max_cooldown_secs: 600,
            cooldown_multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSettings {
    pub reserve_cores: usize,
    pub partitions_per_worker: usize,
    pub min_available_memory_mb: u64,
    pub max_workers: Option<usize>,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            reserve_cores: 1,
            partitions_per_worker: 3,
            min_available_memory_mb: 512,
            max_workers: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundaryTargetSetting {
    pub kind: ZoneKind,
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub boundaries_dir: Option<PathBuf>,
    pub incremental_url: String,
    pub snapshot_url: String,
    pub boundary_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub integrity_fail_threshold: f64,
    pub incremental_ceiling: usize,
    pub integrity_window_hours: i64,
    pub cycle_cadence_secs: u64,
    pub reconcile_cron: String,
    pub alert_webhook_url: Option<String>,
    pub lock_stale_after_secs: u64,
    pub partition_search_window_bytes: usize,
    pub fetcher: FetcherSettings,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub transform: TransformSettings,
    pub boundary_targets: Vec<BoundaryTargetSetting>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            state_dir: PathBuf::from("./state"),
            artifacts_dir: PathBuf::from("./artifacts"),
            reports_dir: PathBuf::from("./reports"),
            boundaries_dir: None,
            incremental_url: "https://api.openstreetmap.org/api/0.6/notes/search.xml".to_string(),
            snapshot_url: "https://planet.openstreetmap.org/notes/planet-notes-latest.osn".to_string(),
            boundary_url: "http://localhost:8080/boundaries".to_string(),
            user_agent: "notesync/0.1".to_string(),
            http_timeout_secs: 120,
            integrity_fail_threshold: 0.05,
            incremental_ceiling: 10_000,
            integrity_window_hours: 24,
            cycle_cadence_secs: 60,
            reconcile_cron: "0 30 3 * * *".to_string(),
            alert_webhook_url: None,
            lock_stale_after_secs: 900,
            partition_search_window_bytes: 1 << 20,
            fetcher: FetcherSettings::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            transform: TransformSettings::default(),
            boundary_targets: Vec::new(),
        }
    }
}

/// A century; wider windows would push `started_at - window` out of range.
const MAX_INTEGRITY_WINDOW_HOURS: i64 = 24 * 366 * 100;

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { name, value })
}

impl SyncConfig {
    /// Reads `path` (or `notesync.yaml` in the working directory if it
    /// exists), then applies `DATABASE_URL` / `NOTESYNC_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = var("NOTESYNC_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = var("NOTESYNC_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(v);
        }
        if let Some(v) = var("NOTESYNC_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        if let Some(v) = var("NOTESYNC_BOUNDARIES_DIR") {
            self.boundaries_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("NOTESYNC_INCREMENTAL_URL") {
            self.incremental_url = v;
        }
        if let Some(v) = var("NOTESYNC_SNAPSHOT_URL") {
            self.snapshot_url = v;
        }
        if let Some(v) = var("NOTESYNC_BOUNDARY_URL") {
            self.boundary_url = v;
        }
        if let Some(v) = var("NOTESYNC_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = var("NOTESYNC_RECONCILE_CRON") {
            self.reconcile_cron = v;
        }
        if let Some(v) = var("NOTESYNC_ALERT_WEBHOOK_URL") {
            self.alert_webhook_url = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = var("NOTESYNC_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_env("NOTESYNC_HTTP_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = var("NOTESYNC_INTEGRITY_FAIL_THRESHOLD") {
            self.integrity_fail_threshold = parse_env("NOTESYNC_INTEGRITY_FAIL_THRESHOLD", v)?;
        }
        if let Some(v) = var("NOTESYNC_INCREMENTAL_CEILING") {
            self.incremental_ceiling = parse_env("NOTESYNC_INCREMENTAL_CEILING", v)?;
        }
        if let Some(v) = var("NOTESYNC_INTEGRITY_WINDOW_HOURS") {
            self.integrity_window_hours = parse_env("NOTESYNC_INTEGRITY_WINDOW_HOURS", v)?;
        }
        if let Some(v) = var("NOTESYNC_CYCLE_CADENCE_SECS") {
            self.cycle_cadence_secs = parse_env("NOTESYNC_CYCLE_CADENCE_SECS", v)?;
        }
        if let Some(v) = var("NOTESYNC_MAX_IN_FLIGHT") {
            self.fetcher.max_in_flight = parse_env("NOTESYNC_MAX_IN_FLIGHT", v)?;
        }
        if let Some(v) = var("NOTESYNC_MAX_RETRIES") {
            self.retry.max_retries = parse_env("NOTESYNC_MAX_RETRIES", v)?;
        }
        if let Some(v) = var("NOTESYNC_LOCK_STALE_AFTER_SECS") {
            self.lock_stale_after_secs = parse_env("NOTESYNC_LOCK_STALE_AFTER_SECS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.integrity_fail_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "integrity_fail_threshold must be in (0, 1], got {t}"
            )));
        }
        if self.cycle_cadence_secs == 0 {
            return Err(ConfigError::Invalid("cycle_cadence_secs must be positive".into()));
        }
        if self.incremental_ceiling == 0 {
            return Err(ConfigError::Invalid("incremental_ceiling must be positive".into()));
        }
        if !(1..=MAX_INTEGRITY_WINDOW_HOURS).contains(&self.integrity_window_hours) {
            return Err(ConfigError::Invalid(format!(
                "integrity_window_hours must be in 1..={MAX_INTEGRITY_WINDOW_HOURS}, got {}",
                self.integrity_window_hours
            )));
        }
        if self.fetcher.max_in_flight == 0 {
            return Err(ConfigError::Invalid("fetcher.max_in_flight must be positive".into()));
        }
        if self.transform.partitions_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "transform.partitions_per_worker must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid("retry.jitter must be in [0, 1]".into()));
        }
        Ok(())
    }

    pub fn gate(&self) -> IntegrityGate {
        IntegrityGate::new(self.integrity_fail_threshold)
    }

    /// Falls back to the default day for a window `validate` would reject.
    pub fn integrity_window(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.integrity_window_hours)
            .filter(|_| (1..=MAX_INTEGRITY_WINDOW_HOURS).contains(&self.integrity_window_hours))
            .unwrap_or_else(|| chrono::Duration::days(1))
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cycle_cadence_secs)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("notesync.lock")
    }

    pub fn reconcile_lock_path(&self) -> PathBuf {
        self.state_dir.join("reconcile.lock")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.state_dir.join("failed_execution.json")
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            max_in_flight: self.fetcher.max_in_flight,
            retry: RetryPolicy {
                max_retries: self.retry.max_retries,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
            breaker: BreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                cooldown: Duration::from_secs(self.breaker.cooldown_secs),
                max_cooldown: Duration::from_secs(self.breaker.max_cooldown_secs),
                cooldown_multiplier: self.breaker.cooldown_multiplier,
            },
            lease_timeout: Duration::from_secs(self.fetcher.lease_timeout_secs),
            pacing: self.fetcher.requests_per_minute.filter(|n| *n > 0).map(|n| {
                TokenBucketConfig {
                    capacity: n,
                    refill_every: Duration::from_secs(60) / n,
                }
            }),
        }
    }

    pub fn boundary_targets(&self) -> Vec<BoundaryTarget> {
        self.boundary_targets
            .iter()
            .map(|t| BoundaryTarget { kind: t.kind, id: t.id })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config = SyncConfig::from_yaml_str(
            r#"
incremental_ceiling: 2500
retry:
  max_retries: 3
boundary_targets:
  - { kind: maritime, id: 9001 }
"#,
        )
        .unwrap();
        assert_eq!(config.incremental_ceiling, 2500);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.integrity_fail_threshold, 0.05);
        assert_eq!(config.boundary_targets()[0].kind, ZoneKind::Maritime);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = SyncConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://notes@localhost/notes"),
            ("NOTESYNC_INCREMENTAL_CEILING", "50"),
            ("NOTESYNC_STATE_DIR", "/var/lib/notesync"),
        ]);
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://notes@localhost/notes"));
        assert_eq!(config.incremental_ceiling, 50);
        assert_eq!(config.marker_path(), PathBuf::from("/var/lib/notesync/failed_execution.json"));
    }

    #[test]
    fn unparseable_env_value_is_a_config_error() {
        let mut config = SyncConfig::default();
        let err = config
            .apply_env(|k| (k == "NOTESYNC_CYCLE_CADENCE_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "NOTESYNC_CYCLE_CADENCE_SECS", .. }));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let config = SyncConfig {
            integrity_fail_threshold: 0.0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SyncConfig {
            cycle_cadence_secs: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_integrity_window_is_rejected() {
        let mut config = SyncConfig::default();
        config
            .apply_env(|k| {
                (k == "NOTESYNC_INTEGRITY_WINDOW_HOURS").then(|| i64::MAX.to_string())
            })
            .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(config.integrity_window(), chrono::Duration::days(1));

        config.integrity_window_hours = 48;
        assert!(config.validate().is_ok());
        assert_eq!(config.integrity_window(), chrono::Duration::hours(48));
    }

    #[test]
    fn pacing_follows_requests_per_minute() {
        let mut config = SyncConfig::default();
        assert!(config.fetcher_config().pacing.is_none());
        config.fetcher.requests_per_minute = Some(30);
        let pacing = config.fetcher_config().pacing.unwrap();
        assert_eq!(pacing.capacity, 30);
        assert_eq!(pacing.refill_every, Duration::from_secs(2));
    }
}
