use super::{ModuleParent, StatusCounts, Suite, TagValue, Tags, TestStatus, tags};
use crate::config::{self, vars};
use crate::coverage::ExecutionDataStore;
use crate::protocol::ModuleExecutionResult;
use crate::types::{ModuleExecutionSettings, TestIdentifier};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Identifying fields of a module.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub session_id: String,
    pub id: u64,
    pub name: String,
    pub output_dirs: Vec<PathBuf>,
    /// Address of the session's signal server, when one is running.
    pub signal_address: Option<SocketAddr>,
}

#[derive(Debug, Default)]
struct ModuleCounters {
    suites: StatusCounts,
    tests_total: u64,
    new_tests: u64,
}

/// One independently runnable unit of work within a session.
pub struct Module {
    descriptor: ModuleDescriptor,
    settings: ModuleExecutionSettings,
    parent: Arc<dyn ModuleParent>,
    started_at: DateTime<Utc>,
    tags: Tags,
    counters: Mutex<ModuleCounters>,
    tests_skipped: AtomicU64,
    coverage: Mutex<ExecutionDataStore>,
    ended: AtomicBool,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.descriptor.id)
            .field("name", &self.descriptor.name)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Module {
    pub fn new(
        descriptor: ModuleDescriptor,
        settings: ModuleExecutionSettings,
        parent: Arc<dyn ModuleParent>,
    ) -> Arc<Self> {
        let tags = Tags::new();
        tags.set(tags::TEST_MODULE, descriptor.name.as_str());
        Arc::new(Self {
            descriptor,
            settings,
            parent,
            started_at: Utc::now(),
            tags,
            counters: Mutex::new(ModuleCounters::default()),
            tests_skipped: AtomicU64::new(0),
            coverage: Mutex::new(ExecutionDataStore::new()),
            ended: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn session_id(&self) -> &str {
        &self.descriptor.session_id
    }

    pub fn output_dirs(&self) -> &[PathBuf] {
        &self.descriptor.output_dirs
    }

    pub fn settings(&self) -> &ModuleExecutionSettings {
        &self.settings
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn set_tag(&self, key: &str, value: impl Into<TagValue>) -> bool {
        self.tags.set(key, value)
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Environment a spawned worker needs to report back to this module's session.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (
                config::env_var_name(vars::SESSION_ID),
                self.descriptor.session_id.clone(),
            ),
            (
                config::env_var_name(vars::MODULE_ID),
                self.descriptor.id.to_string(),
            ),
            (
                config::env_var_name(vars::MODULE_NAME),
                self.descriptor.name.clone(),
            ),
        ];
        if let Some(addr) = self.descriptor.signal_address {
            env.push((
                config::env_var_name(vars::SIGNAL_SERVER_HOST),
                addr.ip().to_string(),
            ));
            env.push((
                config::env_var_name(vars::SIGNAL_SERVER_PORT),
                addr.port().to_string(),
            ));
        }
        env
    }

    /// Open a suite in this module.
    pub fn suite_start(
        self: &Arc<Self>,
        name: impl Into<String>,
        code_unit: Option<String>,
        parallelized: bool,
    ) -> Arc<Suite> {
        if self.is_ended() {
            warn!(module = %self.name(), "Suite started after module end");
        }
        Suite::new(name.into(), code_unit, parallelized, Some(Arc::clone(self)))
    }

    /// Count a test started in this module; returns whether it is new.
    ///
    /// A test is only "new" when known tests were computed for the module.
    pub(crate) fn record_test(&self, test: &TestIdentifier) -> bool {
        let is_new = self
            .settings
            .known_tests(self.name())
            .is_some_and(|known| !known.contains(test));
        let mut counters = self.counters.lock().unwrap();
        counters.tests_total += 1;
        if is_new {
            counters.new_tests += 1;
        }
        is_new
    }

    pub(crate) fn on_suite_end(&self, status: TestStatus) {
        self.counters.lock().unwrap().suites.record(status);
    }

    /// Count one test skipped because the settings listed it as skippable.
    pub fn record_skipped_test(&self) {
        self.tests_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tests_skipped(&self) -> u64 {
        self.tests_skipped.load(Ordering::Relaxed)
    }

    /// Merge coverage collected while running this module's tests.
    pub fn add_coverage(&self, record: &ExecutionDataStore) {
        if self.is_ended() {
            debug!(module = %self.name(), "Ignoring coverage after module end");
            return;
        }
        self.coverage.lock().unwrap().merge(record);
    }

    pub fn status(&self) -> TestStatus {
        self.counters.lock().unwrap().suites.status()
    }

    fn early_flake_state(&self) -> (bool, bool) {
        let enabled = self.settings.early_flake_detection_enabled(self.name());
        if !enabled {
            return (false, false);
        }
        let counters = self.counters.lock().unwrap();
        let threshold = u64::from(self.settings.early_flake_detection.faulty_session_threshold);
        let faulty =
            counters.tests_total > 0 && counters.new_tests * 100 / counters.tests_total > threshold;
        (true, faulty)
    }

    fn build_result(&self) -> ModuleExecutionResult {
        let (early_flake_enabled, early_flake_faulty) = self.early_flake_state();
        let coverage = {
            let store = self.coverage.lock().unwrap();
            (!store.is_empty()).then(|| store.clone())
        };
        ModuleExecutionResult {
            session_id: self.descriptor.session_id.clone(),
            module_id: self.descriptor.id,
            module_name: self.descriptor.name.clone(),
            coverage_enabled: self.settings.code_coverage_enabled,
            skip_enabled: self.settings.skip_enabled,
            early_flake_enabled,
            early_flake_faulty,
            status: Some(self.status().as_str().to_string()),
            tests_skipped_total: self.tests_skipped(),
            coverage,
        }
    }

    fn apply_result_tags(&self, result: &ModuleExecutionResult) {
        if let Some(status) = &result.status {
            self.tags.set(tags::TEST_STATUS, status.as_str());
        }
        if result.coverage_enabled {
            self.tags.set(tags::CODE_COVERAGE_ENABLED, true);
        }
        if result.skip_enabled {
            self.tags.set(tags::TESTS_SKIPPING_ENABLED, true);
            self.tags.set(tags::TESTS_SKIPPING_COUNT, result.tests_skipped_total);
        }
        if result.early_flake_enabled {
            self.tags.set(tags::EARLY_FLAKE_ENABLED, true);
            if result.early_flake_faulty {
                self.tags.set(tags::EARLY_FLAKE_ABORT_REASON, "faulty");
            }
        }
    }

    /// End the module locally and hand its result to the parent.
    ///
    /// Returns `false` if the module had already ended.
    pub fn end(&self) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            warn!(module = %self.name(), "Module already ended");
            return false;
        }
        let result = self.build_result();
        self.apply_result_tags(&result);
        self.tags.close();
        debug!(
            module = %self.name(),
            tests_skipped = result.tests_skipped_total,
            "Module ended"
        );
        self.parent.on_module_end(result);
        true
    }

    /// End the module with a result a worker process reported for it.
    ///
    /// The parent is not notified: the result already went through it.
    pub fn end_with_result(&self, result: &ModuleExecutionResult) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            debug!(module = %self.name(), "Module already ended");
            return false;
        }
        self.apply_result_tags(result);
        self.tags.close();
        true
    }
}
