//! Worker configuration: TOML file with environment overrides.
//!
//! Configuration is loaded with [Figment]: a TOML file provides the
//! base, and `NIGHTJAR_CONFIG_*` environment variables override it.
//! Double underscores separate nested keys, so
//! `NIGHTJAR_CONFIG_SOURCE__PAGE_SIZE` maps to `source.page_size`.
//!
//! Policy durations are plain integer fields (`*_secs`, `*_ms`) with
//! typed accessors, so a config file stays diffable and env overrides
//! stay trivial.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use figment::providers::{Env, Format as _, Toml};
use figment::Figment;
use serde::Deserialize;

use nightjar_core::day::render_file_name;
use nightjar_core::{FileId, WorkerId};

use crate::error::{Error, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "NIGHTJAR_CONFIG_";

/// Top-level worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Stable workload identity shared by all replicas.
    pub worker_id: String,
    /// Root directory on the shared volume for output files.
    pub output_root_path: PathBuf,
    /// Message bus settings.
    pub bus: BusConfig,
    /// Source view settings.
    pub source: SourceConfig,
    /// Coordination state store settings.
    pub state_store: StateStoreConfig,
    /// Ordered output file definitions.
    pub files: Vec<FileOutputConfig>,
    /// Timing and retry policies.
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Message bus settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Broker addresses, e.g. `["kafka-1:9092", "kafka-2:9092"]`.
    pub bootstrap_servers: Vec<String>,
    /// Topic completion events are published to.
    pub topic: String,
    /// Event type discriminator stamped into each completion record.
    pub event_type: String,
    /// Consumer group downstream consumers are expected to use.
    pub consumer_group: String,
    /// Per-send timeout in milliseconds.
    #[serde(default = "default_bus_timeout_ms")]
    pub timeout_ms: u64,
    /// Partition count of the topic, for key hashing.
    #[serde(default = "default_bus_partitions")]
    pub partitions: u32,
}

impl BusConfig {
    /// Per-send timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Source view settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Connection string of the source database.
    pub connection_string: String,
    /// The view to extract.
    pub view_name: String,
    /// ORDER BY fragment; must describe a total order on the view.
    pub order_by: String,
    /// The key column carrying the total order.
    pub key_column: String,
    /// Rows per page.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

/// Coordination state store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StateStoreConfig {
    /// Connection string of the state database (includes the database
    /// name).
    pub connection_string: String,
    /// Table holding per-file progress records.
    pub status_table: String,
    /// Table holding worker lease records.
    pub lease_table: String,
}

/// One configured output file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileOutputConfig {
    /// Stable identity of this output.
    pub file_id: String,
    /// File name pattern; `{date}` expands to the UTC day, `YYYYMMDD`.
    pub file_name_pattern: String,
    /// Registry identifier of the translator producing this output.
    pub translator_id: String,
}

impl FileOutputConfig {
    /// The validated file identity.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty id.
    pub fn file_id(&self) -> Result<FileId> {
        FileId::new(self.file_id.clone()).map_err(Error::Core)
    }
}

/// Timing and retry policies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Interval between lease renewals.
    pub lease_heartbeat_interval_secs: u64,
    /// Lease time-to-live; several heartbeat intervals, so transient
    /// store latency does not cost leadership.
    pub lease_ttl_secs: u64,
    /// Follower poll interval; comfortably below the TTL so a vacant
    /// lease is discovered promptly.
    pub takeover_polling_interval_secs: u64,
    /// Width of the daily trigger window.
    pub daily_trigger_window_secs: u64,
    /// Retry attempts for transient external failures.
    pub max_retries: u32,
    /// First retry delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            lease_heartbeat_interval_secs: 30,
            lease_ttl_secs: 120,
            takeover_polling_interval_secs: 15,
            daily_trigger_window_secs: 86_400,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl PolicyConfig {
    /// Interval between lease renewals.
    #[must_use]
    pub const fn lease_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lease_heartbeat_interval_secs)
    }

    /// Lease time-to-live.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Follower poll interval.
    #[must_use]
    pub const fn takeover_polling_interval(&self) -> Duration {
        Duration::from_secs(self.takeover_polling_interval_secs)
    }

    /// Width of the daily trigger window.
    #[must_use]
    pub const fn daily_trigger_window(&self) -> Duration {
        Duration::from_secs(self.daily_trigger_window_secs)
    }

    /// First retry delay.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

impl WorkerConfig {
    /// Loads configuration from a TOML file merged with
    /// `NIGHTJAR_CONFIG_*` environment overrides, then validates it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the file cannot be read,
    /// a field fails to deserialize, or validation rejects a value.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// The validated worker identity.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty id.
    pub fn worker_id(&self) -> Result<WorkerId> {
        WorkerId::new(self.worker_id.clone()).map_err(Error::Core)
    }

    /// Resolves the output path of a file for the given instant's UTC
    /// day.
    #[must_use]
    pub fn output_path(&self, file: &FileOutputConfig, now: DateTime<Utc>) -> PathBuf {
        self.output_root_path
            .join(render_file_name(&file.file_name_pattern, now))
    }

    /// Checks cross-field invariants the type system cannot.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        self.worker_id()?;

        if self.bus.bootstrap_servers.is_empty() {
            return Err(Error::configuration("bus.bootstrap_servers cannot be empty"));
        }
        if self.bus.topic.trim().is_empty() {
            return Err(Error::configuration("bus.topic cannot be empty"));
        }
        if self.bus.partitions == 0 {
            return Err(Error::configuration("bus.partitions must be positive"));
        }

        if self.source.page_size == 0 {
            return Err(Error::configuration("source.page_size must be positive"));
        }
        if self.source.order_by.trim().is_empty() {
            return Err(Error::configuration("source.order_by cannot be empty"));
        }
        if self.source.key_column.trim().is_empty() {
            return Err(Error::configuration("source.key_column cannot be empty"));
        }

        if self.files.is_empty() {
            return Err(Error::configuration("at least one output file is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for file in &self.files {
            file.file_id()?;
            if !seen.insert(file.file_id.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate file id: '{}'",
                    file.file_id
                )));
            }
            if file.file_name_pattern.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "file '{}' has an empty file_name_pattern",
                    file.file_id
                )));
            }
            if file.translator_id.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "file '{}' has an empty translator_id",
                    file.file_id
                )));
            }
        }

        if self.policy.backoff_multiplier < 1.0 {
            return Err(Error::configuration(
                "policy.backoff_multiplier must be at least 1.0",
            ));
        }
        if self.policy.lease_ttl_secs <= self.policy.lease_heartbeat_interval_secs {
            return Err(Error::configuration(
                "policy.lease_ttl_secs must exceed the heartbeat interval",
            ));
        }

        Ok(())
    }
}

fn default_bus_timeout_ms() -> u64 {
    5_000
}

fn default_bus_partitions() -> u32 {
    1
}

fn default_page_size() -> u64 {
    10_000
}
