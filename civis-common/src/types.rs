//! Common types used across civis components.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of the runtime a worker executes tests on.
///
/// Settings are computed once per distinct identity, so two workers on
/// different runtime versions get independently computed snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub vendor: String,
}

impl WorkerIdentity {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        vendor: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            vendor: vendor.into(),
        }
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.vendor.is_empty() {
            write!(f, "{} {}", self.name, self.version)
        } else {
            write!(f, "{} {} ({})", self.name, self.version, self.vendor)
        }
    }
}

/// Identifies a test across processes (skip lists, known tests, flaky tests).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestIdentifier {
    pub suite: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
}

impl TestIdentifier {
    pub fn new(suite: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            name: name.into(),
            parameters: None,
        }
    }
}

impl std::fmt::Display for TestIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parameters {
            Some(params) => write!(f, "{}.{}{}", self.suite, self.name, params),
            None => write!(f, "{}.{}", self.suite, self.name),
        }
    }
}

/// Number of executions for a new test whose duration is below `max_duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionThreshold {
    pub max_duration_ms: u64,
    pub executions: u32,
}

/// Early flake detection policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyFlakeDetectionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub execution_thresholds: Vec<ExecutionThreshold>,
    /// Percentage of new tests above which a module is considered faulty.
    #[serde(default = "default_faulty_session_threshold")]
    pub faulty_session_threshold: u32,
}

fn default_faulty_session_threshold() -> u32 {
    30
}

impl Default for EarlyFlakeDetectionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            execution_thresholds: Vec::new(),
            faulty_session_threshold: default_faulty_session_threshold(),
        }
    }
}

/// Execution settings computed for one worker identity.
///
/// `known_tests` distinguishes "unknown" (`None`) from "known to be empty"
/// (`Some` map with an empty entry); the former disables early flake detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleExecutionSettings {
    #[serde(default)]
    pub code_coverage_enabled: bool,
    #[serde(default)]
    pub skip_enabled: bool,
    #[serde(default)]
    pub flaky_test_retries_enabled: bool,
    #[serde(default)]
    pub early_flake_detection: EarlyFlakeDetectionSettings,
    /// Properties forwarded verbatim to the worker's test runtime.
    #[serde(default)]
    pub system_properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_correlation_id: Option<String>,
    #[serde(default)]
    pub skippable_tests: BTreeMap<String, Vec<TestIdentifier>>,
    #[serde(default)]
    pub flaky_tests: BTreeMap<String, Vec<TestIdentifier>>,
    #[serde(default)]
    pub known_tests: Option<BTreeMap<String, Vec<TestIdentifier>>>,
    #[serde(default)]
    pub coverage_enabled_packages: Vec<String>,
}

impl ModuleExecutionSettings {
    /// Tests that may be skipped in `module`; empty when the module has no entry.
    pub fn skippable_tests(&self, module: &str) -> &[TestIdentifier] {
        self.skippable_tests
            .get(module)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Flaky tests of `module`; empty when the module has no entry.
    pub fn flaky_tests(&self, module: &str) -> &[TestIdentifier] {
        self.flaky_tests
            .get(module)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Known tests of `module`, or `None` when they were never computed for it.
    pub fn known_tests(&self, module: &str) -> Option<&[TestIdentifier]> {
        self.known_tests
            .as_ref()
            .and_then(|known| known.get(module))
            .map(Vec::as_slice)
    }

    /// Copy of these settings restricted to a single module.
    pub fn narrow_to_module(&self, module: &str) -> Self {
        let only_module = |tests: &[TestIdentifier]| {
            if tests.is_empty() {
                BTreeMap::new()
            } else {
                BTreeMap::from([(module.to_string(), tests.to_vec())])
            }
        };
        let skippable_tests = only_module(self.skippable_tests(module));
        let flaky_tests = only_module(self.flaky_tests(module));

        let known_tests = self
            .known_tests(module)
            .map(|known| BTreeMap::from([(module.to_string(), known.to_vec())]));

        Self {
            code_coverage_enabled: self.code_coverage_enabled,
            skip_enabled: self.skip_enabled,
            flaky_test_retries_enabled: self.flaky_test_retries_enabled,
            early_flake_detection: self.early_flake_detection.clone(),
            system_properties: self.system_properties.clone(),
            skip_correlation_id: self.skip_correlation_id.clone(),
            skippable_tests,
            flaky_tests,
            known_tests,
            coverage_enabled_packages: self.coverage_enabled_packages.clone(),
        }
    }

    /// Whether early flake detection can run for `module`.
    pub fn early_flake_detection_enabled(&self, module: &str) -> bool {
        self.early_flake_detection.enabled && self.known_tests(module).is_some()
    }
}

/// Index of the repository's source files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIndex {
    /// Repo-relative directories that contain indexed sources.
    pub source_roots: Vec<String>,
    /// Package-qualified class path (`com/acme/Parser`) to repo-relative path.
    pub sources: BTreeMap<String, String>,
}

impl RepoIndex {
    /// Repo-relative source path for a fully qualified or simple class name.
    ///
    /// An exact package match wins. Otherwise the simple name is used, but
    /// only when exactly one indexed file carries it.
    pub fn source_path(&self, class_name: &str) -> Option<&str> {
        let slashed = class_name.replace('.', "/");
        // Nested classes share their outer class's file.
        let qualified = slashed.split('$').next().unwrap_or(&slashed);
        if let Some(path) = self.sources.get(qualified) {
            return Some(path.as_str());
        }
        let simple = qualified.rsplit('/').next().unwrap_or(qualified);
        let mut candidates = self
            .sources
            .iter()
            .filter(|(key, _)| key.rsplit('/').next() == Some(simple));
        match (candidates.next(), candidates.next()) {
            (Some((_, path)), None) => Some(path.as_str()),
            _ => None,
        }
    }
}
