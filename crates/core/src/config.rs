use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled key: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled<F>(lookup: &F, profile: &str, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if !profile.is_empty() {
        if let Some(v) = lookup(&format!("{profile}_{key}")) {
            return Some(v);
        }
    }
    lookup(key)
}

// ── Top-level config ──────────────────────────────────────────

/// Runtime configuration for the roiflow engine.
///
/// Parsed from `roiflow.toml` (every section optional), then overridden by
/// environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoiflowConfig {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ── Sections ──────────────────────────────────────────────────

/// Worker pool settings. The worker count is the only tunable of the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads; 0 = one per available CPU.
    #[serde(default)]
    pub worker_threads: usize,

    /// Worker threads are named `{prefix}-{index}`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_thread_name_prefix() -> String {
    "roiflow-worker".into()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Self::default()
        }
    }

    /// Resolved worker count (never zero).
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

// ── Loading & Validation ──────────────────────────────────────

impl RoiflowConfig {
    /// Parse config from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else build from the environment alone.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::from_env(),
        }
    }

    // ── Environment variable overrides ────────────────────────

    /// Apply environment variable overrides.
    ///
    /// `ROIFLOW_PROFILE` selects a profile; when set (e.g. `BENCH`), every key
    /// is first looked up as `{PROFILE}_{KEY}`:
    /// - `ROIFLOW_WORKERS` → `scheduler.worker_threads`
    /// - `ROIFLOW_THREAD_NAME` → `scheduler.thread_name_prefix`
    /// - `ROIFLOW_LOG` → `logging.filter`
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(env_opt);
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(p) = lookup("ROIFLOW_PROFILE") {
            self.profile = p.to_uppercase();
        }
        let p = self.profile.clone();

        if let Some(v) = profiled(&lookup, &p, "ROIFLOW_WORKERS") {
            match v.parse::<usize>() {
                Ok(n) => self.scheduler.worker_threads = n,
                Err(_) => tracing::warn!(value = %v, "ignoring unparsable ROIFLOW_WORKERS"),
            }
        }
        if let Some(v) = profiled(&lookup, &p, "ROIFLOW_THREAD_NAME") {
            self.scheduler.thread_name_prefix = v;
        }
        if let Some(v) = profiled(&lookup, &p, "ROIFLOW_LOG") {
            self.logging.filter = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.thread_name_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "scheduler.thread_name_prefix must not be empty".into(),
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.filter must not be empty".into()));
        }
        Ok(())
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() {
            "default"
        } else {
            &self.profile
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   workers={} (configured {}), thread_name={}",
            self.scheduler.effective_workers(),
            self.scheduler.worker_threads,
            self.scheduler.thread_name_prefix
        );
        tracing::info!("  logging:     filter={}", self.logging.filter);
    }
}
