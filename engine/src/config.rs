//! Engine configuration loading
//!
//! Loads configuration from `~/.config/directive/engine.toml` (or the
//! `DIRECTIVE_ENGINE_CONFIG` env var). Every field has a default, so an
//! absent file or an empty table yields a working engine.

use crate::errors::{EngineError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for the directive engine
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    /// Default per-directive limits
    #[serde(default)]
    pub limits: ExecutionLimits,

    /// Operation cache capacity and TTL
    #[serde(default)]
    pub cache: CacheConfig,

    /// Research cascade settings
    #[serde(default)]
    pub research: ResearchConfig,

    /// Capability registry settings
    #[serde(default)]
    pub capabilities: CapabilityConfig,

    /// Retry policy for retryable operation timeouts
    #[serde(default)]
    pub retry: RetryConfig,

    /// AI-completion fallback after unrecoverable directive failures
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Durable task registration for long directives
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Project file scan bounds
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Resource limits applied to one directive execution.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock ceiling for the whole directive
    #[serde(default = "default_directive_timeout_ms")]
    pub directive_timeout_ms: u64,

    /// Worker pool size
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,

    /// Ceiling on distinct SessionMemory keys
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,

    /// Per-operation timeout when `timeoutMs` is absent
    #[serde(default = "default_operation_timeout_ms")]
    pub default_operation_timeout_ms: u64,
}

fn default_directive_timeout_ms() -> u64 {
    60_000
}
fn default_max_concurrent_ops() -> usize {
    4
}
fn default_max_memory_entries() -> usize {
    256
}
fn default_operation_timeout_ms() -> u64 {
    10_000
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            directive_timeout_ms: default_directive_timeout_ms(),
            max_concurrent_ops: default_max_concurrent_ops(),
            max_memory_entries: default_max_memory_entries(),
            default_operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl ExecutionLimits {
    pub fn directive_timeout(&self) -> Duration {
        Duration::from_millis(self.directive_timeout_ms)
    }

    /// Timeout for an operation, honouring its own `timeoutMs` first
    pub fn operation_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        Duration::from_millis(timeout_ms.unwrap_or(self.default_operation_timeout_ms))
    }
}

/// Operation cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Maximum approximate total size in bytes (unset = no byte limit)
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: Option<usize>,

    /// Entry time-to-live in seconds (unset = no expiry)
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: Option<u64>,
}

fn default_cache_max_entries() -> usize {
    512
}
fn default_cache_max_bytes() -> Option<usize> {
    Some(16 * 1024 * 1024)
}
fn default_cache_ttl_secs() -> Option<u64> {
    Some(3600)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Research cascade configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ResearchConfig {
    /// Default threshold when a question does not carry one
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Per-tier time bound
    #[serde(default = "default_tier_timeout_ms")]
    pub tier_timeout_ms: u64,

    /// Maximum results requested from web search
    #[serde(default = "default_web_search_limit")]
    pub web_search_limit: usize,

    /// Maximum nodes requested from the knowledge graph
    #[serde(default = "default_graph_limit")]
    pub graph_limit: usize,
}

fn default_confidence_threshold() -> f64 {
    0.6
}
fn default_tier_timeout_ms() -> u64 {
    5_000
}
fn default_web_search_limit() -> usize {
    5
}
fn default_graph_limit() -> usize {
    20
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            tier_timeout_ms: default_tier_timeout_ms(),
            web_search_limit: default_web_search_limit(),
            graph_limit: default_graph_limit(),
        }
    }
}

impl ResearchConfig {
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }
}

/// When the capability snapshot is refreshed
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Probe once, keep for the process lifetime (explicit `refresh()` only)
    #[default]
    Process,
    /// Refresh on the first lookup after each directive starts
    PerDirective,
    /// Refresh once the snapshot is older than `refresh_interval_secs`
    Interval,
}

/// Capability registry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CapabilityConfig {
    /// Timeout for one detection command
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default)]
    pub refresh: RefreshMode,

    /// Used when `refresh = "interval"`
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Additional probe definitions merged into the built-in catalogue
    #[serde(default)]
    pub extra: Vec<ProbeDefinition>,
}

/// A user-defined detection command
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProbeDefinition {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_refresh_interval_secs() -> u64 {
    300
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            refresh: RefreshMode::default(),
            refresh_interval_secs: default_refresh_interval_secs(),
            extra: Vec::new(),
        }
    }
}

/// Backoff policy for retryable operations
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Random variation applied to each sleep (0.2 = ±20%)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    2
}
fn default_initial_backoff_ms() -> u64 {
    50
}
fn default_max_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Fallback completion configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    /// Only takes effect when a completion client is also supplied
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,

    #[serde(default = "default_fallback_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_fallback_enabled() -> bool {
    true
}
fn default_fallback_timeout_ms() -> u64 {
    30_000
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_fallback_enabled(),
            timeout_ms: default_fallback_timeout_ms(),
        }
    }
}

/// Task-tracking configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TaskConfig {
    /// Directives with at least this many operations register a task
    #[serde(default = "default_task_min_operations")]
    pub min_operations: usize,

    /// Finished tasks are dropped this long after their last update
    #[serde(default = "default_task_retention_secs")]
    pub retention_secs: u64,

    /// At most this many finished tasks are kept; oldest go first
    #[serde(default = "default_task_max_finished")]
    pub max_finished: usize,
}

fn default_task_min_operations() -> usize {
    8
}

fn default_task_retention_secs() -> u64 {
    3600
}

fn default_task_max_finished() -> usize {
    1024
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            min_operations: default_task_min_operations(),
            retention_secs: default_task_retention_secs(),
            max_finished: default_task_max_finished(),
        }
    }
}

/// Project scan bounds
#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_scan_max_files")]
    pub max_files: usize,

    /// Files larger than this are matched by name only
    #[serde(default = "default_scan_max_file_bytes")]
    pub max_file_bytes: u64,

    #[serde(default = "default_scan_max_depth")]
    pub max_depth: usize,

    /// Directory names never descended into
    #[serde(default = "default_scan_ignore")]
    pub ignore: Vec<String>,
}

fn default_scan_max_files() -> usize {
    2_000
}
fn default_scan_max_file_bytes() -> u64 {
    256 * 1024
}
fn default_scan_max_depth() -> usize {
    6
}
fn default_scan_ignore() -> Vec<String> {
    [
        ".git",
        "target",
        "node_modules",
        "dist",
        "build",
        ".venv",
        "vendor",
        "__pycache__",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_files: default_scan_max_files(),
            max_file_bytes: default_scan_max_file_bytes(),
            max_depth: default_scan_max_depth(),
            ignore: default_scan_ignore(),
        }
    }
}

impl EngineConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "DIRECTIVE_ENGINE_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "engine.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `DIRECTIVE_ENGINE_CONFIG` environment variable
    /// 2. `~/.config/directive/engine.toml`
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "engine config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config_with_source(
                format!("failed to read config at {}", path.display()),
                e,
            )
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: EngineConfig = toml::from_str(contents)
            .map_err(|e| EngineError::config_with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("directive")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    /// Reject impossible values, warn on odd ones
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_concurrent_ops == 0 {
            return Err(EngineError::config("limits.max_concurrent_ops must be >= 1"));
        }
        if self.limits.directive_timeout_ms == 0 || self.limits.default_operation_timeout_ms == 0 {
            return Err(EngineError::config("limits timeouts must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.research.confidence_threshold) {
            return Err(EngineError::config(format!(
                "research.confidence_threshold must be within 0..=1, got {}",
                self.research.confidence_threshold
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(EngineError::config("cache.max_entries must be >= 1"));
        }

        if self.limits.default_operation_timeout_ms > self.limits.directive_timeout_ms {
            tracing::warn!(
                default_operation_timeout_ms = self.limits.default_operation_timeout_ms,
                directive_timeout_ms = self.limits.directive_timeout_ms,
                "default operation timeout exceeds the directive timeout"
            );
        }
        if self.capabilities.probe_timeout_ms > 10_000 {
            tracing::warn!(
                probe_timeout_ms = self.capabilities.probe_timeout_ms,
                "capability probes are expected to be short; timeout is unusually long"
            );
        }
        if !(0.0..1.0).contains(&self.retry.jitter_factor) {
            tracing::warn!(
                jitter_factor = self.retry.jitter_factor,
                "retry jitter outside 0..1, sleeps may collapse to zero"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.limits.max_concurrent_ops, 4);
        assert_eq!(cfg.research.confidence_threshold, 0.6);
        assert_eq!(cfg.capabilities.probe_timeout_ms, 2_000);
        assert_eq!(cfg.capabilities.refresh, RefreshMode::Process);
        assert!(cfg.fallback.enabled);
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let cfg = EngineConfig::parse("").expect("should parse");
        assert_eq!(cfg.limits, ExecutionLimits::default());
        assert_eq!(cfg.cache.max_entries, 512);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [limits]
            directive_timeout_ms = 5000
            max_concurrent_ops = 2
            max_memory_entries = 10
            default_operation_timeout_ms = 1000

            [cache]
            max_entries = 16
            max_bytes = 4096
            ttl_secs = 60

            [research]
            confidence_threshold = 0.75
            tier_timeout_ms = 750

            [capabilities]
            probe_timeout_ms = 500
            refresh = "per_directive"

            [[capabilities.extra]]
            name = "nomad"
            program = "nomad"
            args = ["version"]

            [retry]
            max_attempts = 3

            [fallback]
            enabled = false

            [scan]
            max_files = 50
            ignore = ["target"]
        "#;

        let cfg = EngineConfig::parse(toml).expect("should parse");
        assert_eq!(cfg.limits.max_concurrent_ops, 2);
        assert_eq!(cfg.cache.max_bytes, Some(4096));
        assert_eq!(cfg.research.confidence_threshold, 0.75);
        assert_eq!(cfg.capabilities.refresh, RefreshMode::PerDirective);
        assert_eq!(cfg.capabilities.extra[0].args, vec!["version".to_string()]);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(!cfg.fallback.enabled);
        assert_eq!(cfg.scan.ignore, vec!["target".to_string()]);
        assert_eq!(cfg.scan.max_depth, 6);
    }

    #[test]
    fn test_rejects_impossible_values() {
        assert!(EngineConfig::parse("[limits]\nmax_concurrent_ops = 0").is_err());
        assert!(EngineConfig::parse("[research]\nconfidence_threshold = 1.5").is_err());
        assert!(EngineConfig::parse("[cache]\nmax_entries = 0").is_err());
    }

    #[test]
    fn test_operation_timeout_prefers_explicit_value() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.operation_timeout(Some(50)), Duration::from_millis(50));
        assert_eq!(limits.operation_timeout(None), Duration::from_millis(10_000));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[tasks]\nmin_operations = 3\nmax_finished = 10\n").expect("write");

        let cfg = tokio_test::assert_ok!(EngineConfig::load_from_path(&path));
        assert_eq!(cfg.tasks.min_operations, 3);
        assert_eq!(cfg.tasks.max_finished, 10);
        assert_eq!(cfg.tasks.retention_secs, 3600);
    }
}
