//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`WARDEN_*`)
//! - CLI arguments (binary only)
//!
//! Every section rejects unknown keys, so a typo in a config file is an error
//! instead of a silently ignored setting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detection::{Action, ActionMap, Severity};
use crate::error::{Result, WardenError};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Detection engine
    pub engine: EngineConfig,
    /// Worker pool
    pub pool: PoolConfig,
    /// Threat vector store
    pub store: StoreConfig,
    /// Orchestration
    pub pipeline: PipelineConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("Failed to read config file {}: {e}", path.display())))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WardenError::Config(format!("Failed to parse config: {e}")))
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `WARDEN_*` environment variables
    pub fn with_env(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            let raw = std::env::var(key).ok()?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("ignoring {key}={raw}: not a valid value");
                    None
                },
            }
        }

        if let Some(v) = parsed("WARDEN_WORKERS") {
            self.pool.workers = v;
        }
        if let Some(v) = parsed("WARDEN_QUEUE_DEPTH") {
            self.pool.max_queue_depth = v;
        }
        if let Some(v) = parsed("WARDEN_CACHE_CAPACITY") {
            self.store.capacity = v;
        }
        if let Some(v) = parsed("WARDEN_MULTI_STAGE_THRESHOLD") {
            self.engine.multi_stage_threshold = v;
        }
        if let Some(v) = parsed("WARDEN_TASK_DEADLINE_MS") {
            self.pipeline.task_deadline_ms = v;
        }
        if let Ok(level) = std::env::var("WARDEN_LOG_LEVEL") {
            self.logging.level = level;
        }

        self
    }

    /// File (if given) or defaults, then environment, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        let config = base.with_env();
        config.validate()?;
        Ok(config)
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("warden").join("config.toml"))
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(WardenError::Config(msg.to_string()));

        if self.engine.max_content_bytes == 0 {
            return fail("engine.max_content_bytes must be > 0");
        }
        if self.engine.multi_stage_threshold < 1 {
            return fail("engine.multi_stage_threshold must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.engine.action_map.min_block_confidence) {
            return fail("engine.action_map.min_block_confidence must be within [0, 1]");
        }
        if self.pool.workers == 0 {
            return fail("pool.workers must be > 0");
        }
        if self.pool.max_queue_depth == 0 {
            return fail("pool.max_queue_depth must be > 0");
        }
        if self.pool.heartbeat_interval_ms == 0 {
            return fail("pool.heartbeat_interval_ms must be > 0");
        }
        if self.pool.max_task_duration_ms <= self.pool.heartbeat_interval_ms {
            return fail("pool.max_task_duration_ms must exceed pool.heartbeat_interval_ms");
        }
        if self.store.capacity == 0 {
            return fail("store.capacity must be > 0");
        }
        if self.store.ttl_secs == Some(0) {
            return fail("store.ttl_secs must be > 0 when set");
        }
        if self.store.top_k == 0 || self.store.top_k > 100 {
            return fail("store.top_k must be within 1..=100");
        }
        if !(0.0..=1.0).contains(&self.store.similarity_threshold) {
            return fail("store.similarity_threshold must be within [0, 1]");
        }
        if self.store.embedding_dims < 8 || self.store.embedding_dims > 4096 {
            return fail("store.embedding_dims must be within 8..=4096");
        }
        if self.store.query_timeout_ms == 0 {
            return fail("store.query_timeout_ms must be > 0");
        }
        if let BackendConfig::Process { program, .. } = &self.store.backend {
            if program.as_os_str().is_empty() {
                return fail("store.backend.program must not be empty");
            }
        }
        if self.pipeline.task_deadline_ms == 0 {
            return fail("pipeline.task_deadline_ms must be > 0");
        }

        Ok(())
    }
}

/// Detection engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Content above this size is rejected, never truncated
    pub max_content_bytes: usize,
    /// Distinct categories needed for multi-stage escalation
    pub multi_stage_threshold: usize,
    /// Categories below this severity do not count toward escalation
    pub multi_stage_min_severity: Severity,
    /// Load the built-in rule tables
    pub include_builtin_rules: bool,
    /// Extra TOML rule file
    pub rules_path: Option<PathBuf>,
    /// Severity -> action map
    pub action_map: ActionMap,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: 1024 * 1024, // 1MB
            multi_stage_threshold: 2,
            multi_stage_min_severity: Severity::Medium,
            include_builtin_rules: true,
            rules_path: None,
            action_map: ActionMap::default(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Pending tasks accepted before `QueueFull`
    pub max_queue_depth: usize,
    /// Supervisor tick / worker heartbeat interval
    pub heartbeat_interval_ms: u64,
    /// Busy time after which a worker is recycled
    pub max_task_duration_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_queue_depth: 256,
            heartbeat_interval_ms: 100,
            max_task_duration_ms: 2000,
        }
    }
}

impl PoolConfig {
    /// Heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Max task duration
    pub fn max_task_duration(&self) -> Duration {
        Duration::from_millis(self.max_task_duration_ms)
    }
}

/// External similarity backend selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum BackendConfig {
    /// No backend; every external query is a miss
    #[default]
    None,
    /// In-process cosine search over a labelled corpus (JSON lines)
    Memory {
        /// Corpus file
        corpus_path: Option<PathBuf>,
    },
    /// External process, invoked with an argument vector
    Process {
        /// Executable
        program: PathBuf,
        /// Fixed leading arguments
        #[serde(default)]
        args: Vec<String>,
        /// Collection / index name
        #[serde(default)]
        collection: Option<String>,
        /// Also pass the query text as `--text=<value>`
        #[serde(default)]
        pass_text: bool,
        /// Longest query text passed; longer text is truncated
        #[serde(default = "default_max_text_bytes")]
        max_text_bytes: usize,
    },
}

fn default_max_text_bytes() -> usize {
    4096
}

/// Threat vector store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Run the vector stage at all
    pub enabled: bool,
    /// Cache capacity (entries)
    pub capacity: usize,
    /// Per-entry TTL in seconds
    pub ttl_secs: Option<u64>,
    /// Matches requested per query
    pub top_k: usize,
    /// Minimum similarity score
    pub similarity_threshold: f32,
    /// Query vector dimensions
    pub embedding_dims: usize,
    /// External query timeout
    pub query_timeout_ms: u64,
    /// Backend
    pub backend: BackendConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
            ttl_secs: Some(3600), // 1 hour
            top_k: 5,
            similarity_threshold: 0.85,
            embedding_dims: 256,
            query_timeout_ms: 250,
            backend: BackendConfig::None,
        }
    }
}

impl StoreConfig {
    /// Entry TTL
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    /// External query timeout
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Orchestration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Per-request deadline
    pub task_deadline_ms: u64,
    /// Action carried by timeout verdicts
    pub timeout_action: Action,
    /// Consult the vector store when the fast scan is not critical
    pub deep_check: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            task_deadline_ms: 50,
            timeout_action: Action::Flag,
            deep_check: true,
        }
    }
}

impl PipelineConfig {
    /// Per-request deadline
    pub fn task_deadline(&self) -> Duration {
        Duration::from_millis(self.task_deadline_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// JSON output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.multi_stage_threshold, 2);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.store.backend, BackendConfig::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [engine]
            multi_stage_threshold = 3
            max_content_bytes = 65536

            [engine.action_map]
            medium = "block"

            [pool]
            workers = 2
            max_queue_depth = 8

            [store]
            capacity = 100
            ttl_secs = 60

            [store.backend]
            kind = "process"
            program = "/usr/local/bin/vector-search"
            args = ["--index", "threats"]
            collection = "prompts_v2"

            [pipeline]
            task_deadline_ms = 20
            timeout_action = "block"
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.engine.multi_stage_threshold, 3);
        assert_eq!(config.engine.action_map.medium, Action::Block);
        assert_eq!(config.engine.action_map.high, Action::Block);
        assert_eq!(config.pool.workers, 2);
        assert_eq!(config.store.ttl(), Some(Duration::from_secs(60)));
        assert_eq!(config.pipeline.timeout_action, Action::Block);
        match &config.store.backend {
            BackendConfig::Process {
                args,
                collection,
                max_text_bytes,
                ..
            } => {
                assert_eq!(args.len(), 2);
                assert_eq!(collection.as_deref(), Some("prompts_v2"));
                assert_eq!(*max_text_bytes, 4096);
            },
            other => panic!("unexpected backend {other:?}"),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Config::from_toml("[pool]\nworkerz = 3\n").is_err());
        assert!(Config::from_toml("[telemetry]\nenabled = true\n").is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.pool.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.multi_stage_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.max_task_duration_ms = config.pool.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }
}
