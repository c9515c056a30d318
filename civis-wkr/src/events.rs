//! Test events handler: the surface test-framework instrumentation calls.
//!
//! Frameworks report the same suite more than once (per listener, per
//! parallel branch), so suite starts and finishes go through an
//! [`ActivationTracker`]: only the first start creates the suite and only
//! the matching last finish ends it. The worker's module is created lazily,
//! exactly once, on the first event that needs it.

use civis_common::coverage::ExecutionDataStore;
use civis_common::domain::{ErrorInfo, Module, ModuleDescriptor, ModuleParent, Suite, Test, tags};
use civis_common::tracker::ActivationTracker;
use civis_common::types::{ModuleExecutionSettings, TestIdentifier};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SuiteDescriptor {
    pub name: String,
    pub code_unit: Option<String>,
}

impl SuiteDescriptor {
    pub fn new(name: impl Into<String>, code_unit: Option<String>) -> Self {
        Self {
            name: name.into(),
            code_unit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestDescriptor {
    pub suite: SuiteDescriptor,
    pub name: String,
    pub parameters: Option<String>,
    /// Distinguishes repeated invocations of the same parametrized test.
    pub qualifier: Option<String>,
}

impl TestDescriptor {
    pub fn new(suite: SuiteDescriptor, name: impl Into<String>, parameters: Option<String>) -> Self {
        Self {
            suite,
            name: name.into(),
            parameters,
            qualifier: None,
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn identifier(&self) -> TestIdentifier {
        TestIdentifier {
            suite: self.suite.name.clone(),
            name: self.name.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

pub struct TestEventsHandler {
    descriptor: ModuleDescriptor,
    settings: ModuleExecutionSettings,
    parent: Arc<dyn ModuleParent>,
    module: Mutex<Option<Arc<Module>>>,
    suite_activations: ActivationTracker<SuiteDescriptor>,
    suites: Mutex<HashMap<SuiteDescriptor, Arc<Suite>>>,
    tests: Mutex<HashMap<TestDescriptor, Arc<Test>>>,
}

impl std::fmt::Debug for TestEventsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEventsHandler")
            .field("module", &self.descriptor.name)
            .field("suites", &self.suite_activations.active_keys())
            .finish()
    }
}

impl TestEventsHandler {
    pub fn new(
        descriptor: ModuleDescriptor,
        settings: ModuleExecutionSettings,
        parent: Arc<dyn ModuleParent>,
    ) -> Self {
        Self {
            descriptor,
            settings,
            parent,
            module: Mutex::new(None),
            suite_activations: ActivationTracker::new(),
            suites: Mutex::new(HashMap::new()),
            tests: Mutex::new(HashMap::new()),
        }
    }

    /// The worker's module, created on first use.
    pub fn module(&self) -> Arc<Module> {
        let mut module = self.module.lock().unwrap();
        let module = module.get_or_insert_with(|| {
            debug!(module = %self.descriptor.name, "Creating worker module");
            Module::new(
                self.descriptor.clone(),
                self.settings.clone(),
                Arc::clone(&self.parent),
            )
        });
        Arc::clone(module)
    }

    pub fn settings(&self) -> &ModuleExecutionSettings {
        &self.settings
    }

    /// Whether the settings list this test as skippable for the module.
    pub fn is_skippable(&self, test: &TestDescriptor) -> bool {
        self.settings.skip_enabled
            && self
                .settings
                .skippable_tests(&self.descriptor.name)
                .contains(&test.identifier())
    }

    /// Open a suite. Activation and registration happen under the `suites`
    /// lock, so a repeated opener always finds the suite already registered.
    pub fn on_suite_start(&self, suite: &SuiteDescriptor, parallelized: bool) {
        let mut suites = self.suites.lock().unwrap();
        if !self.suite_activations.try_start(suite) {
            return;
        }
        let created = self
            .module()
            .suite_start(suite.name.clone(), suite.code_unit.clone(), parallelized);
        suites.insert(suite.clone(), created);
    }

    pub fn on_suite_finish(&self, suite: &SuiteDescriptor) {
        let mut suites = self.suites.lock().unwrap();
        if !self.suite_activations.try_finish(suite) {
            return;
        }
        let Some(running) = suites.remove(suite) else {
            debug!(suite = %suite.name, "Suite finished but was never created");
            return;
        };
        drop(suites);
        running.end();
    }

    pub fn on_suite_skip(&self, suite: &SuiteDescriptor, reason: Option<String>) {
        match self.suites.lock().unwrap().get(suite) {
            Some(running) => running.set_skip_reason(reason),
            None => debug!(suite = %suite.name, "Skip for a suite that is not running"),
        }
    }

    pub fn on_suite_failure(&self, suite: &SuiteDescriptor, error: ErrorInfo) {
        match self.suites.lock().unwrap().get(suite) {
            Some(running) => running.set_error(error),
            None => debug!(suite = %suite.name, "Failure for a suite that is not running"),
        }
    }

    /// Start a test. A test whose suite is not running gets a suite of its own.
    pub fn on_test_start(&self, test: &TestDescriptor) {
        let mut tests = self.tests.lock().unwrap();
        if tests.contains_key(test) {
            warn!(suite = %test.suite.name, test = %test.name, "Test already started");
            return;
        }
        let suite = self.suites.lock().unwrap().get(&test.suite).cloned();
        let suite = suite.unwrap_or_else(|| {
            debug!(suite = %test.suite.name, "Test started outside a running suite");
            Suite::detached(test.suite.name.clone(), test.suite.code_unit.clone())
        });
        let started = suite.test_start(test.name.clone(), test.parameters.clone());
        tests.insert(test.clone(), started);
    }

    /// Mark a test skipped; skips by test impact analysis count towards the module.
    pub fn on_test_skip(&self, test: &TestDescriptor, reason: Option<String>) {
        let tests = self.tests.lock().unwrap();
        let Some(running) = tests.get(test) else {
            debug!(test = %test.name, "Skip for a test that is not running");
            return;
        };
        if reason.as_deref() == Some(tags::SKIP_REASON_SKIPPABLE) {
            self.module().record_skipped_test();
        }
        running.set_skip_reason(reason);
    }

    pub fn on_test_failure(&self, test: &TestDescriptor, error: ErrorInfo) {
        match self.tests.lock().unwrap().get(test) {
            Some(running) => running.set_error(error),
            None => debug!(test = %test.name, "Failure for a test that is not running"),
        }
    }

    pub fn on_test_finish(&self, test: &TestDescriptor) {
        let Some(running) = self.tests.lock().unwrap().remove(test) else {
            warn!(suite = %test.suite.name, test = %test.name, "Test finished without being started");
            return;
        };
        running.end();
    }

    pub fn add_coverage(&self, coverage: &ExecutionDataStore) {
        self.module().add_coverage(coverage);
    }

    /// End everything still running, then the module, which reports its result.
    ///
    /// Returns `false` if the module had already been finished.
    pub fn finish_module(&self) -> bool {
        let tests: Vec<_> = self.tests.lock().unwrap().drain().collect();
        for (descriptor, test) in tests {
            warn!(test = %descriptor.name, "Ending test still running at module end");
            test.end();
        }
        let suites: Vec<_> = self.suites.lock().unwrap().drain().collect();
        for (descriptor, suite) in suites {
            warn!(suite = %descriptor.name, "Ending suite still running at module end");
            while self.suite_activations.depth(&descriptor) > 0 {
                self.suite_activations.try_finish(&descriptor);
            }
            suite.end();
        }
        self.module().end()
    }

    /// Feed one scripted event through the handler.
    pub fn apply(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::SuiteStart {
                suite,
                code_unit,
                parallelized,
            } => self.on_suite_start(&SuiteDescriptor::new(suite, code_unit), parallelized),
            WorkerEvent::SuiteSkip {
                suite,
                code_unit,
                reason,
            } => self.on_suite_skip(&SuiteDescriptor::new(suite, code_unit), reason),
            WorkerEvent::SuiteFailure {
                suite,
                code_unit,
                error,
            } => self.on_suite_failure(&SuiteDescriptor::new(suite, code_unit), error),
            WorkerEvent::SuiteFinish { suite, code_unit } => {
                self.on_suite_finish(&SuiteDescriptor::new(suite, code_unit))
            }
            WorkerEvent::TestStart {
                suite,
                code_unit,
                name,
                parameters,
                qualifier,
            } => self.on_test_start(&test_descriptor(suite, code_unit, name, parameters, qualifier)),
            WorkerEvent::TestSkip {
                suite,
                code_unit,
                name,
                parameters,
                qualifier,
                reason,
            } => self.on_test_skip(
                &test_descriptor(suite, code_unit, name, parameters, qualifier),
                reason,
            ),
            WorkerEvent::TestFailure {
                suite,
                code_unit,
                name,
                parameters,
                qualifier,
                error,
            } => self.on_test_failure(
                &test_descriptor(suite, code_unit, name, parameters, qualifier),
                error,
            ),
            WorkerEvent::TestFinish {
                suite,
                code_unit,
                name,
                parameters,
                qualifier,
            } => self.on_test_finish(&test_descriptor(suite, code_unit, name, parameters, qualifier)),
            WorkerEvent::Coverage { classes } => self.add_coverage(&classes),
        }
    }
}

fn test_descriptor(
    suite: String,
    code_unit: Option<String>,
    name: String,
    parameters: Option<String>,
    qualifier: Option<String>,
) -> TestDescriptor {
    TestDescriptor {
        suite: SuiteDescriptor::new(suite, code_unit),
        name,
        parameters,
        qualifier,
    }
}

/// One line of a replay script, tagged by `"event"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    SuiteStart {
        suite: String,
        #[serde(default)]
        code_unit: Option<String>,
        #[serde(default)]
        parallelized: bool,
    },
    SuiteSkip {
        suite: String,
        #[serde(default)]
        code_unit: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    SuiteFailure {
        suite: String,
        #[serde(default)]
        code_unit: Option<String>,
        error: ErrorInfo,
    },
    SuiteFinish {
        suite: String,
        #[serde(default)]
        code_unit: Option<String>,
    },
    TestStart {
        suite: String,
        #[serde(default)]
        code_unit: Option<String>,
        name: String,
        #[serde(default)]
        parameters: Option<String>,
        #[serde(default)]
        qualifier: Option<String>,
    },
    TestSkip {
        suite: String,
        #[serde(default)]
        code_unit: Option<String>,
        name: String,
        #[serde(default)]
        parameters: Option<String>,
        #[serde(default)]
        qualifier: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    TestFailure {
        suite: String,
        #[serde(default)]
        code_unit: Option<String>,
        name: String,
        #[serde(default)]
        parameters: Option<String>,
        #[serde(default)]
        qualifier: Option<String>,
        error: ErrorInfo,
    },
    TestFinish {
        suite: String,
        #[serde(default)]
        code_unit: Option<String>,
        name: String,
        #[serde(default)]
        parameters: Option<String>,
        #[serde(default)]
        qualifier: Option<String>,
    },
    Coverage {
        classes: ExecutionDataStore,
    },
}
