use super::{ErrorInfo, Module, StatusCounts, TagValue, Tags, Test, TestStatus, tags};
use crate::types::TestIdentifier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Default)]
struct SuiteState {
    tests: StatusCounts,
    skip_reason: Option<String>,
    error: Option<ErrorInfo>,
}

/// A named group of tests, optionally tied to a code unit (e.g. a class).
pub struct Suite {
    name: String,
    code_unit: Option<String>,
    parallelized: bool,
    module: Option<Arc<Module>>,
    tags: Tags,
    state: Mutex<SuiteState>,
    ended: AtomicBool,
}

impl std::fmt::Debug for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suite")
            .field("name", &self.name)
            .field("code_unit", &self.code_unit)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Suite {
    pub(crate) fn new(
        name: String,
        code_unit: Option<String>,
        parallelized: bool,
        module: Option<Arc<Module>>,
    ) -> Arc<Self> {
        let tags = Tags::new();
        tags.set(tags::TEST_SUITE, name.as_str());
        if let Some(module) = &module {
            tags.set(tags::TEST_MODULE, module.name());
        }
        Arc::new(Self {
            name,
            code_unit,
            parallelized,
            module,
            tags,
            state: Mutex::new(SuiteState::default()),
            ended: AtomicBool::new(false),
        })
    }

    /// Synthetic suite for frameworks that never report suite boundaries.
    ///
    /// Tests in a detached suite do not roll up into any module.
    pub fn detached(name: impl Into<String>, code_unit: Option<String>) -> Arc<Self> {
        Self::new(name.into(), code_unit, false, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code_unit(&self) -> Option<&str> {
        self.code_unit.as_deref()
    }

    pub fn is_parallelized(&self) -> bool {
        self.parallelized
    }

    pub fn module(&self) -> Option<&Arc<Module>> {
        self.module.as_ref()
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn set_tag(&self, key: &str, value: impl Into<TagValue>) -> bool {
        self.tags.set(key, value)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn set_skip_reason(&self, reason: Option<String>) {
        let mut state = self.state.lock().unwrap();
        state.skip_reason = Some(reason.unwrap_or_default());
    }

    pub fn set_error(&self, error: ErrorInfo) {
        self.state.lock().unwrap().error = Some(error);
    }

    /// Start a test in this suite.
    pub fn test_start(
        self: &Arc<Self>,
        name: impl Into<String>,
        parameters: Option<String>,
    ) -> Arc<Test> {
        let name = name.into();
        let mut identifier = TestIdentifier::new(self.name.as_str(), name.as_str());
        identifier.parameters = parameters.clone();
        let is_new = self
            .module
            .as_ref()
            .is_some_and(|module| module.record_test(&identifier));
        Test::new(Arc::clone(self), name, parameters, is_new)
    }

    pub(crate) fn on_test_end(&self, status: TestStatus) {
        self.state.lock().unwrap().tests.record(status);
    }

    pub fn status(&self) -> TestStatus {
        let state = self.state.lock().unwrap();
        if state.error.is_some() {
            TestStatus::Fail
        } else if state.skip_reason.is_some() {
            TestStatus::Skip
        } else {
            state.tests.status()
        }
    }

    /// End the suite and roll its status into the module.
    pub fn end(&self) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            warn!(suite = %self.name, "Suite already ended");
            return false;
        }
        let status = self.status();
        {
            let state = self.state.lock().unwrap();
            if let Some(reason) = state.skip_reason.as_deref().filter(|r| !r.is_empty()) {
                self.tags.set(tags::TEST_SKIP_REASON, reason);
            }
            if let Some(error) = &state.error {
                error.apply(&self.tags);
            }
        }
        self.tags.set(tags::TEST_STATUS, status.as_str());
        self.tags.close();
        if let Some(module) = &self.module {
            module.on_suite_end(status);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ModuleDescriptor, ModuleParent};
    use crate::protocol::ModuleExecutionResult;
    use crate::types::ModuleExecutionSettings;

    struct NullParent;

    impl ModuleParent for NullParent {
        fn on_module_end(&self, _result: ModuleExecutionResult) {}
    }

    fn module() -> Arc<Module> {
        Module::new(
            ModuleDescriptor {
                session_id: "s".to_string(),
                id: 1,
                name: "core".to_string(),
                output_dirs: Vec::new(),
                signal_address: None,
            },
            ModuleExecutionSettings::default(),
            Arc::new(NullParent),
        )
    }

    #[test]
    fn suite_status_follows_tests() {
        let module = module();
        let suite = module.suite_start("FooTest", Some("com.acme.FooTest".into()), false);
        let ok = suite.test_start("ok", None);
        let bad = suite.test_start("bad", None);
        ok.end();
        bad.set_error(ErrorInfo::new("assertion failed"));
        bad.end();
        assert!(suite.end());
        assert_eq!(suite.status(), TestStatus::Fail);
        assert_eq!(module.status(), TestStatus::Fail);
        assert_eq!(suite.tags().get(tags::TEST_STATUS), Some(TagValue::from("fail")));
    }

    #[test]
    fn explicitly_skipped_suite_is_skipped() {
        let module = module();
        let suite = module.suite_start("Ignored", None, false);
        suite.set_skip_reason(Some("disabled".into()));
        suite.end();
        assert_eq!(module.status(), TestStatus::Skip);
        assert_eq!(
            suite.tags().get(tags::TEST_SKIP_REASON),
            Some(TagValue::from("disabled"))
        );
    }

    #[test]
    fn suite_error_fails_suite_even_if_tests_pass() {
        let module = module();
        let suite = module.suite_start("Setup", None, true);
        suite.test_start("t", None).end();
        suite.set_error(ErrorInfo::new("before-all failed").with_kind("IOError"));
        suite.end();
        assert_eq!(suite.status(), TestStatus::Fail);
        assert_eq!(suite.tags().get(tags::ERROR_TYPE), Some(TagValue::from("IOError")));
        assert!(suite.is_parallelized());
    }

    #[test]
    fn ending_twice_rolls_up_once() {
        let module = module();
        let suite = module.suite_start("Twice", None, false);
        assert!(suite.end());
        assert!(!suite.end());
        assert_eq!(module.status(), TestStatus::Pass);
    }

    #[test]
    fn detached_suite_has_no_module() {
        let suite = Suite::detached("Cucumber", None);
        assert!(suite.module().is_none());
        suite.test_start("scenario", None).end();
        assert!(suite.end());
    }
}
