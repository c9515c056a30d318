use super::{ErrorInfo, Suite, TagValue, Tags, TestStatus, tags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Default)]
struct TestState {
    skip_reason: Option<String>,
    error: Option<ErrorInfo>,
}

/// A single executable test case.
pub struct Test {
    suite: Arc<Suite>,
    name: String,
    parameters: Option<String>,
    is_new: bool,
    tags: Tags,
    state: Mutex<TestState>,
    ended: AtomicBool,
}

impl std::fmt::Debug for Test {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Test")
            .field("suite", &self.suite.name())
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Test {
    pub(crate) fn new(
        suite: Arc<Suite>,
        name: String,
        parameters: Option<String>,
        is_new: bool,
    ) -> Arc<Self> {
        let tags = Tags::new();
        tags.set(tags::TEST_SUITE, suite.name());
        tags.set(tags::TEST_NAME, name.as_str());
        if let Some(module) = suite.module() {
            tags.set(tags::TEST_MODULE, module.name());
        }
        if let Some(params) = &parameters {
            tags.set(tags::TEST_PARAMETERS, params.as_str());
        }
        if is_new {
            tags.set(tags::TEST_IS_NEW, true);
        }
        Arc::new(Self {
            suite,
            name,
            parameters,
            is_new,
            tags,
            state: Mutex::new(TestState::default()),
            ended: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> Option<&str> {
        self.parameters.as_deref()
    }

    pub fn suite(&self) -> &Arc<Suite> {
        &self.suite
    }

    /// Whether the test is absent from the module's known tests.
    pub fn is_new(&self) -> bool {
        self.is_new
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
        self.state.lock().unwrap().skip_reason = Some(reason.unwrap_or_default());
    }

    pub fn set_error(&self, error: ErrorInfo) {
        self.state.lock().unwrap().error = Some(error);
    }

    pub fn status(&self) -> TestStatus {
        let state = self.state.lock().unwrap();
        if state.error.is_some() {
            TestStatus::Fail
        } else if state.skip_reason.is_some() {
            TestStatus::Skip
        } else {
            TestStatus::Pass
        }
    }

    /// End the test and roll its status into the suite.
    ///
    /// Ending twice is a logged no-op.
    pub fn end(&self) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            warn!(suite = %self.suite.name(), test = %self.name, "Test already ended");
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
        self.suite.on_test_end(status);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ends_once() {
        let suite = Suite::detached("S", None);
        let test = suite.test_start("t", Some("[1]".to_string()));
        assert!(test.end());
        assert!(!test.end());
        assert_eq!(suite.status(), TestStatus::Pass);
        assert_eq!(test.tags().get(tags::TEST_PARAMETERS), Some(TagValue::from("[1]")));
    }

    #[test]
    fn skipped_test_reports_reason() {
        let suite = Suite::detached("S", None);
        let test = suite.test_start("t", None);
        test.set_skip_reason(Some(tags::SKIP_REASON_SKIPPABLE.to_string()));
        test.end();
        assert_eq!(test.status(), TestStatus::Skip);
        assert_eq!(
            test.tags().get(tags::TEST_SKIP_REASON),
            Some(TagValue::from(tags::SKIP_REASON_SKIPPABLE))
        );
        assert_eq!(suite.status(), TestStatus::Skip);
    }

    #[test]
    fn failure_wins_over_skip() {
        let suite = Suite::detached("S", None);
        let test = suite.test_start("t", None);
        test.set_skip_reason(None);
        test.set_error(ErrorInfo::new("boom"));
        test.end();
        assert_eq!(test.status(), TestStatus::Fail);
        assert_eq!(test.tags().get(tags::ERROR_MESSAGE), Some(TagValue::from("boom")));
    }

    #[test]
    fn tags_after_end_are_ignored() {
        let suite = Suite::detached("S", None);
        let test = suite.test_start("t", None);
        test.end();
        assert!(!test.set_tag("late", true));
    }
}
