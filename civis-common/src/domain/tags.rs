//! Tag names written on session, module, suite and test entities.

pub const TEST_COMMAND: &str = "test.command";
pub const TEST_MODULE: &str = "test.module";
pub const TEST_SUITE: &str = "test.suite";
pub const TEST_NAME: &str = "test.name";
pub const TEST_STATUS: &str = "test.status";
pub const TEST_SKIP_REASON: &str = "test.skip_reason";
pub const TEST_FRAMEWORK: &str = "test.framework";
pub const TEST_FRAMEWORK_VERSION: &str = "test.framework_version";
pub const TEST_PARAMETERS: &str = "test.parameters";
pub const TEST_TRAITS: &str = "test.traits";
pub const TEST_IS_NEW: &str = "test.is_new";

pub const ERROR_TYPE: &str = "error.type";
pub const ERROR_MESSAGE: &str = "error.message";

pub const CODE_COVERAGE_ENABLED: &str = "test.code_coverage.enabled";
pub const CODE_COVERAGE_LINES_PCT: &str = "test.code_coverage.lines_pct";

pub const TESTS_SKIPPING_ENABLED: &str = "test.itr.tests_skipping.enabled";
pub const TESTS_SKIPPING_TYPE: &str = "test.itr.tests_skipping.type";
pub const TESTS_SKIPPING_COUNT: &str = "test.itr.tests_skipping.count";
pub const TESTS_SKIPPED: &str = "test.itr.tests_skipped";

pub const EARLY_FLAKE_ENABLED: &str = "test.early_flake.enabled";
pub const EARLY_FLAKE_ABORT_REASON: &str = "test.early_flake.abort_reason";

/// Skip reason recorded when a test is skipped because the settings list it as skippable.
pub const SKIP_REASON_SKIPPABLE: &str = "Skipped by test impact analysis";
