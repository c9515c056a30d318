//! Configuration shared by the orchestrator and worker processes.
//!
//! Everything is read from `CIVIS_`-prefixed environment variables, with
//! source tracking so diagnostics can say where a value came from.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

/// Prefix shared by every environment variable civis reads or exports.
pub const ENV_PREFIX: &str = "CIVIS_";

/// Unprefixed environment variable names.
pub mod vars {
    pub const SESSION_ID: &str = "SESSION_ID";
    pub const MODULE_ID: &str = "MODULE_ID";
    pub const MODULE_NAME: &str = "MODULE_NAME";
    pub const SIGNAL_SERVER_HOST: &str = "SIGNAL_SERVER_HOST";
    pub const SIGNAL_SERVER_PORT: &str = "SIGNAL_SERVER_PORT";
    pub const SIGNAL_CLIENT_TIMEOUT_MS: &str = "SIGNAL_CLIENT_TIMEOUT_MS";
    pub const CODE_COVERAGE_REPORT_DUMP_DIR: &str = "CODE_COVERAGE_REPORT_DUMP_DIR";
    pub const SETTINGS_FILE: &str = "SETTINGS_FILE";
    pub const REPO_ROOT: &str = "REPO_ROOT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const WORKER_RUNTIME_NAME: &str = "WORKER_RUNTIME_NAME";
    pub const WORKER_RUNTIME_VERSION: &str = "WORKER_RUNTIME_VERSION";
    pub const WORKER_RUNTIME_VENDOR: &str = "WORKER_RUNTIME_VENDOR";
}

/// Full environment variable name for an unprefixed one.
pub fn env_var_name(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
