//! Capability registry
//!
//! Detects host tools (container runtimes, orchestrator and IaC CLIs,
//! language toolchains) with short, timeout-bounded version commands.
//! Results live in an immutable snapshot that is swapped atomically.
//! Directives only read it: the first lookup populates the whole catalogue
//! and every later write is a serialized refresh, so concurrent callers
//! never probe twice. Only catalogued names (built-in plus configured
//! extras) are ever run.

use crate::config::{CapabilityConfig, ProbeDefinition, RefreshMode};
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    ContainerRuntime,
    Orchestrator,
    InfrastructureAsCode,
    VersionControl,
    LanguageRuntime,
    CloudCli,
    Other,
}

/// How to detect one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub category: CapabilityCategory,
    /// Home-relative files whose presence hints at configured usage
    pub config_paths: Vec<String>,
}

impl CapabilitySpec {
    fn new(
        name: &str,
        args: &[&str],
        category: CapabilityCategory,
        config_paths: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            program: name.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            category,
            config_paths: config_paths.iter().map(ToString::to_string).collect(),
        }
    }

    /// Display form of the detection command, e.g. `kubectl version --client`
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<&ProbeDefinition> for CapabilitySpec {
    fn from(def: &ProbeDefinition) -> Self {
        Self {
            name: def.name.clone(),
            program: def.program.clone(),
            args: def.args.clone(),
            category: CapabilityCategory::Other,
            config_paths: Vec::new(),
        }
    }
}

/// Built-in detection catalogue.
pub fn builtin_catalogue() -> Vec<CapabilitySpec> {
    use CapabilityCategory::*;
    vec![
        CapabilitySpec::new("docker", &["--version"], ContainerRuntime, &[".docker/config.json"]),
        CapabilitySpec::new("podman", &["--version"], ContainerRuntime, &[".config/containers"]),
        CapabilitySpec::new("kubectl", &["version", "--client"], Orchestrator, &[".kube/config"]),
        CapabilitySpec::new("oc", &["version", "--client"], Orchestrator, &[".kube/config"]),
        CapabilitySpec::new("helm", &["version", "--short"], Orchestrator, &[".config/helm"]),
        CapabilitySpec::new("terraform", &["version"], InfrastructureAsCode, &[".terraformrc", ".terraform.d"]),
        CapabilitySpec::new("pulumi", &["version"], InfrastructureAsCode, &[".pulumi"]),
        CapabilitySpec::new("ansible", &["--version"], InfrastructureAsCode, &[".ansible.cfg"]),
        CapabilitySpec::new("git", &["--version"], VersionControl, &[".gitconfig"]),
        CapabilitySpec::new("node", &["--version"], LanguageRuntime, &[]),
        CapabilitySpec::new("npm", &["--version"], LanguageRuntime, &[".npmrc"]),
        CapabilitySpec::new("python3", &["--version"], LanguageRuntime, &[]),
        CapabilitySpec::new("aws", &["--version"], CloudCli, &[".aws/config", ".aws/credentials"]),
        CapabilitySpec::new("gcloud", &["--version"], CloudCli, &[".config/gcloud"]),
        CapabilitySpec::new("az", &["version"], CloudCli, &[".azure"]),
    ]
}

/// What a detection command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
    NotFound,
    TimedOut,
    Failed(String),
}

/// Runs detection commands. Swapped for a scripted runner in tests.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> ProbeOutcome;
}

/// Spawns real processes, resolved through `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProbeRunner;

#[async_trait]
impl ProbeRunner for ProcessProbeRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> ProbeOutcome {
        let Ok(path) = which::which(program) else {
            return ProbeOutcome::NotFound;
        };

        let child = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ProbeOutcome::NotFound,
            Err(e) => return ProbeOutcome::Failed(e.to_string()),
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ProbeOutcome::Exited {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    VersionCommand,
    NotFound,
    TimedOut,
    NonZeroExit,
    SpawnError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityProbe {
    pub name: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub detection_method: DetectionMethod,
    /// The command that was run
    pub command: String,
    pub probed_at: DateTime<Utc>,
}

impl CapabilityProbe {
    fn from_outcome(spec: &CapabilitySpec, outcome: ProbeOutcome) -> Self {
        let (available, version, detection_method) = match outcome {
            ProbeOutcome::Exited {
                code: 0,
                stdout,
                stderr,
            } => {
                let version = extract_version(&stdout).or_else(|| extract_version(&stderr));
                (true, version, DetectionMethod::VersionCommand)
            }
            ProbeOutcome::Exited { .. } => (false, None, DetectionMethod::NonZeroExit),
            ProbeOutcome::NotFound => (false, None, DetectionMethod::NotFound),
            ProbeOutcome::TimedOut => (false, None, DetectionMethod::TimedOut),
            ProbeOutcome::Failed(_) => (false, None, DetectionMethod::SpawnError),
        };
        Self {
            name: spec.name.clone(),
            available,
            version,
            detection_method,
            command: spec.command_line(),
            probed_at: Utc::now(),
        }
    }
}

/// First dotted version number in `text` (`Client Version: v1.29.3` -> `1.29.3`).
pub fn extract_version(text: &str) -> Option<String> {
    static VERSION_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = VERSION_RE
        .get_or_init(|| Regex::new(r"\d+\.\d+(?:\.\d+)?(?:[-+][0-9A-Za-z.]+)?").ok())
        .as_ref()?;
    re.find(text).map(|m| m.as_str().to_string())
}

/// Immutable view of every probe run so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySnapshot {
    pub probes: BTreeMap<String, CapabilityProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl CapabilitySnapshot {
    pub fn get(&self, name: &str) -> Option<&CapabilityProbe> {
        self.probes.get(name)
    }

    pub fn available(&self) -> impl Iterator<Item = &CapabilityProbe> {
        self.probes.values().filter(|p| p.available)
    }
}

pub struct CapabilityRegistry {
    catalogue: Vec<CapabilitySpec>,
    runner: Arc<dyn ProbeRunner>,
    probe_timeout: Duration,
    policy: RefreshMode,
    refresh_interval: Duration,
    home: Option<PathBuf>,
    snapshot: RwLock<Arc<CapabilitySnapshot>>,
    /// Next lookup refreshes before reading
    expired: AtomicBool,
    refresh_lock: Mutex<()>,
}

impl CapabilityRegistry {
    pub fn new(config: &CapabilityConfig, runner: Arc<dyn ProbeRunner>) -> Self {
        let mut catalogue = builtin_catalogue();
        for extra in &config.extra {
            let spec = CapabilitySpec::from(extra);
            match catalogue.iter_mut().find(|s| s.name == spec.name) {
                Some(existing) => *existing = spec,
                None => catalogue.push(spec),
            }
        }

        Self {
            catalogue,
            runner,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            policy: config.refresh,
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            home: dirs::home_dir(),
            snapshot: RwLock::new(Arc::new(CapabilitySnapshot::default())),
            expired: AtomicBool::new(false),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Registry probing real processes with default settings.
    pub fn with_process_runner(config: &CapabilityConfig) -> Self {
        Self::new(config, Arc::new(ProcessProbeRunner))
    }

    /// Override the directory used for configuration-file hints.
    pub fn with_home_dir(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Every capability in the catalogue, in catalogue order.
    pub fn list_known(&self) -> &[CapabilitySpec] {
        &self.catalogue
    }

    pub fn spec(&self, name: &str) -> Option<&CapabilitySpec> {
        self.catalogue.iter().find(|s| s.name == name)
    }

    pub async fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Called by the executor before each directive. Under the
    /// per-directive policy the next lookup refreshes the snapshot; readers
    /// keep the previous one until the new one is swapped in.
    pub fn begin_directive(&self) {
        if self.policy == RefreshMode::PerDirective {
            self.expired.store(true, Ordering::SeqCst);
        }
    }

    fn needs_refresh(&self, snapshot: &CapabilitySnapshot) -> bool {
        let Some(refreshed_at) = snapshot.refreshed_at else {
            return true;
        };
        match self.policy {
            RefreshMode::Process => false,
            RefreshMode::PerDirective => self.expired.load(Ordering::SeqCst),
            RefreshMode::Interval => {
                if self.refresh_interval.is_zero() {
                    return true;
                }
                let age = Utc::now().signed_duration_since(refreshed_at);
                age.to_std().is_ok_and(|age| age >= self.refresh_interval)
            }
        }
    }

    /// Result for one catalogued capability, from the current snapshot.
    ///
    /// Names outside the catalogue are rejected without running anything.
    pub async fn probe(&self, name: &str) -> Result<CapabilityProbe> {
        if self.spec(name).is_none() {
            return Err(EngineError::unknown_capability(name));
        }
        let snapshot = self.probe_all().await;
        snapshot.get(name).cloned().ok_or_else(|| {
            EngineError::internal(format!("capability '{name}' missing from refreshed snapshot"))
        })
    }

    async fn probe_specs(&self, specs: Vec<CapabilitySpec>) -> Vec<CapabilityProbe> {
        let mut set = JoinSet::new();
        for spec in specs {
            let runner = Arc::clone(&self.runner);
            let timeout = self.probe_timeout;
            set.spawn(async move {
                let outcome = runner.run(&spec.program, &spec.args, timeout).await;
                CapabilityProbe::from_outcome(&spec, outcome)
            });
        }

        let mut probes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(probe) => {
                    tracing::debug!(
                        capability = %probe.name,
                        available = probe.available,
                        version = probe.version.as_deref().unwrap_or("-"),
                        method = ?probe.detection_method,
                        "capability probed"
                    );
                    probes.push(probe);
                }
                Err(e) => tracing::warn!(error = %e, "capability probe task failed"),
            }
        }
        probes.sort_by(|a, b| a.name.cmp(&b.name));
        probes
    }

    /// Current snapshot, populated (or refreshed, per policy) first when
    /// needed.
    pub async fn probe_all(&self) -> Arc<CapabilitySnapshot> {
        let current = self.snapshot().await;
        if !self.needs_refresh(&current) {
            return current;
        }
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        let current = self.snapshot().await;
        if !self.needs_refresh(&current) {
            return current;
        }
        self.refresh_locked().await
    }

    /// Re-probe the whole catalogue and replace the snapshot.
    pub async fn refresh(&self) -> Arc<CapabilitySnapshot> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Caller holds `refresh_lock`.
    async fn refresh_locked(&self) -> Arc<CapabilitySnapshot> {
        self.expired.store(false, Ordering::SeqCst);
        let probes = self.probe_specs(self.catalogue.clone()).await;
        let next = Arc::new(CapabilitySnapshot {
            probes: probes.into_iter().map(|p| (p.name.clone(), p)).collect(),
            refreshed_at: Some(Utc::now()),
        });
        *self.snapshot.write().await = Arc::clone(&next);
        tracing::info!(
            available = next.available().count(),
            total = next.probes.len(),
            "capability snapshot refreshed"
        );
        next
    }

    /// First existing configuration file hinting that `name` is set up.
    pub fn config_signal(&self, name: &str) -> Option<PathBuf> {
        let home = self.home.as_ref()?;
        self.spec(name)?
            .config_paths
            .iter()
            .map(|rel| home.join(rel))
            .find(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRunner {
        outcomes: HashMap<String, ProbeOutcome>,
        calls: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(outcomes: &[(&str, ProbeOutcome)]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: outcomes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProbeRunner for ScriptedRunner {
        async fn run(&self, program: &str, _args: &[String], _timeout: Duration) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .get(program)
                .cloned()
                .unwrap_or(ProbeOutcome::NotFound)
        }
    }

    fn exited(stdout: &str) -> ProbeOutcome {
        ProbeOutcome::Exited {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn extracts_versions_from_common_outputs() {
        assert_eq!(
            extract_version("Client Version: v1.29.3").as_deref(),
            Some("1.29.3")
        );
        assert_eq!(
            extract_version("Docker version 24.0.7, build afdd53b").as_deref(),
            Some("24.0.7")
        );
        assert_eq!(extract_version("Python 3.12").as_deref(), Some("3.12"));
        assert_eq!(extract_version("no digits here"), None);
    }

    fn calls(runner: &ScriptedRunner) -> usize {
        runner.calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn probe_maps_outcomes_and_reuses_snapshot() {
        let runner = ScriptedRunner::new(&[
            ("kubectl", exited("Client Version: v1.29.3")),
            ("oc", ProbeOutcome::NotFound),
            ("helm", ProbeOutcome::TimedOut),
        ]);
        let registry = CapabilityRegistry::new(&CapabilityConfig::default(), runner.clone());

        let kubectl = registry.probe("kubectl").await.expect("kubectl");
        assert!(kubectl.available);
        assert_eq!(kubectl.version.as_deref(), Some("1.29.3"));
        assert_eq!(kubectl.command, "kubectl version --client");

        let oc = registry.probe("oc").await.expect("oc");
        assert!(!oc.available);
        assert_eq!(oc.detection_method, DetectionMethod::NotFound);

        let helm = registry.probe("helm").await.expect("helm");
        assert_eq!(helm.detection_method, DetectionMethod::TimedOut);

        // The first lookup populated the whole catalogue once.
        registry.probe("kubectl").await.expect("kubectl again");
        assert_eq!(calls(&runner), registry.list_known().len());
    }

    #[tokio::test]
    async fn unknown_names_are_rejected_without_running_anything() {
        let runner = ScriptedRunner::new(&[("shutdown", exited("shutdown 1.0"))]);
        let registry = CapabilityRegistry::new(&CapabilityConfig::default(), runner.clone());

        let err = registry.probe("shutdown").await.expect_err("not catalogued");

        assert_eq!(err.kind(), directive_protocol::ErrorKind::InvalidArguments);
        assert_eq!(err.category(), crate::errors::ErrorCategory::ProbeError);
        assert_eq!(calls(&runner), 0);
        assert!(registry.snapshot().await.get("shutdown").is_none());
    }

    #[tokio::test]
    async fn concurrent_lookups_populate_once() {
        let runner = ScriptedRunner::new(&[("git", exited("git version 2.43.0"))]);
        let registry = Arc::new(CapabilityRegistry::new(&CapabilityConfig::default(), runner.clone()));

        let mut set = JoinSet::new();
        for name in ["git", "docker", "git", "terraform"] {
            let registry = Arc::clone(&registry);
            set.spawn(async move { registry.probe(name).await.map(|p| p.available) });
        }
        while let Some(joined) = set.join_next().await {
            joined.expect("join").expect("probe");
        }

        assert_eq!(calls(&runner), registry.list_known().len());
    }

    #[tokio::test]
    async fn non_zero_exit_is_unavailable() {
        let runner = ScriptedRunner::new(&[(
            "docker",
            ProbeOutcome::Exited {
                code: 1,
                stdout: "24.0.7".to_string(),
                stderr: "daemon not running".to_string(),
            },
        )]);
        let registry = CapabilityRegistry::new(&CapabilityConfig::default(), runner);

        let probe = registry.probe("docker").await.expect("docker");

        assert!(!probe.available);
        assert_eq!(probe.detection_method, DetectionMethod::NonZeroExit);
    }

    #[tokio::test]
    async fn refresh_replaces_snapshot_with_full_catalogue() {
        let runner = ScriptedRunner::new(&[("git", exited("git version 2.43.0"))]);
        let registry = CapabilityRegistry::new(&CapabilityConfig::default(), runner.clone());

        let before = registry.snapshot().await;
        let after = registry.refresh().await;

        assert!(before.probes.is_empty());
        assert_eq!(after.probes.len(), registry.list_known().len());
        assert_eq!(after.available().map(|p| p.name.as_str()).collect::<Vec<_>>(), vec!["git"]);
        assert_eq!(calls(&runner), registry.list_known().len());

        // Already populated; probe_all has nothing left to do.
        registry.probe_all().await;
        assert_eq!(calls(&runner), registry.list_known().len());
    }

    #[tokio::test]
    async fn per_directive_policy_refreshes_without_clearing() {
        let runner = ScriptedRunner::new(&[]);
        let config = CapabilityConfig {
            refresh: RefreshMode::PerDirective,
            ..CapabilityConfig::default()
        };
        let registry = CapabilityRegistry::new(&config, runner.clone());
        let known = registry.list_known().len();

        registry.probe("kubectl").await.expect("first");
        registry.begin_directive();
        assert_eq!(registry.snapshot().await.probes.len(), known);
        registry.probe("kubectl").await.expect("second");
        registry.probe("kubectl").await.expect("third");

        assert_eq!(calls(&runner), 2 * known);
    }

    #[tokio::test]
    async fn zero_interval_always_reprobes() {
        let runner = ScriptedRunner::new(&[]);
        let config = CapabilityConfig {
            refresh: RefreshMode::Interval,
            refresh_interval_secs: 0,
            ..CapabilityConfig::default()
        };
        let registry = CapabilityRegistry::new(&config, runner.clone());

        registry.probe("git").await.expect("first");
        registry.probe("git").await.expect("second");

        assert_eq!(calls(&runner), 2 * registry.list_known().len());
    }

    #[tokio::test]
    async fn extra_definitions_extend_the_catalogue() {
        let config = CapabilityConfig {
            extra: vec![ProbeDefinition {
                name: "nomad".to_string(),
                program: "nomad".to_string(),
                args: vec!["version".to_string()],
            }],
            ..CapabilityConfig::default()
        };
        let runner = ScriptedRunner::new(&[("nomad", exited("Nomad v1.7.2"))]);
        let registry = CapabilityRegistry::new(&config, runner);

        assert_eq!(
            registry.spec("nomad").map(CapabilitySpec::command_line).as_deref(),
            Some("nomad version")
        );
        let nomad = registry.probe("nomad").await.expect("configured extras are probeable");
        assert_eq!(nomad.version.as_deref(), Some("1.7.2"));
    }

    #[test]
    fn config_signal_checks_home_relative_paths() {
        let home = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(home.path().join(".kube")).expect("mkdir");
        std::fs::write(home.path().join(".kube/config"), "apiVersion: v1").expect("write");
        let registry = CapabilityRegistry::new(&CapabilityConfig::default(), ScriptedRunner::new(&[]))
            .with_home_dir(Some(home.path().to_path_buf()));

        assert!(registry.config_signal("kubectl").is_some());
        assert!(registry.config_signal("terraform").is_none());
    }
}
