use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub jobs: JobDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Polling dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How often the dispatcher asks the repository for due jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on due jobs claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Capacity of the in-process delivery channel behind `ChannelQueue`.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Defaults applied to schedule definitions that leave these fields unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub default_priority: i32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_priority: 0,
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `CADENCE_WORKER__BATCH_SIZE=10`.
    /// A missing file is not an error; every section falls back to its defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading configuration");

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = CadenceConfig::load(Some("does-not-exist.toml")).unwrap();
            assert_eq!(config.worker.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
            assert_eq!(config.worker.batch_size, DEFAULT_BATCH_SIZE);
            assert_eq!(config.jobs.default_max_retries, DEFAULT_MAX_RETRIES);
            assert!(config.database.path.ends_with("cadence.db"));
            Ok(())
        });
    }

    #[test]
    fn toml_values_are_applied() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [database]
                path = "/tmp/jobs.db"

                [worker]
                batch_size = 5

                [jobs]
                default_max_retries = 7
                "#,
            )?;
            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.database.path, "/tmp/jobs.db");
            assert_eq!(config.worker.batch_size, 5);
            assert_eq!(config.worker.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
            assert_eq!(config.jobs.default_max_retries, 7);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[worker]\npoll_interval_ms = 250\n")?;
            jail.set_env("CADENCE_WORKER__POLL_INTERVAL_MS", "50");
            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.worker.poll_interval_ms, 50);
            Ok(())
        });
    }

    #[test]
    fn malformed_values_are_config_errors() {
        Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[worker]\nbatch_size = \"lots\"\n")?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
