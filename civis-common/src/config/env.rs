//! Typed parsing of `CIVIS_` environment variables.
//!
//! Parse errors are collected rather than returned so a process can report
//! every misconfigured variable at once and still fall back to defaults.

use super::ENV_PREFIX;
use super::source::{ConfigSource, Sourced};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Path not found for {var}: {path}")]
    PathNotFound { var: String, path: PathBuf },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },

    #[error("Required variable {var} is not set")]
    Missing { var: String },
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Environment parser that accumulates errors.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: ENV_PREFIX,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(value, var_name),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Optional string; unset and empty both read as `None`.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }

    /// Non-empty string that must be set; records [`EnvError::Missing`] otherwise.
    pub fn require_string(&mut self, name: &str) -> Option<String> {
        let value = self.get_optional_string(name).value;
        if value.is_none() {
            self.errors.push(EnvError::Missing {
                var: self.var_name(name),
            });
        }
        value
    }

    /// Accepts 1/true/yes/on and 0/false/no/off/"" (case-insensitive).
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default);
        };
        let parsed = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name.clone(),
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                default
            }
        };
        Sourced::from_env(parsed, var_name)
    }

    fn get_ranged<T>(&mut self, name: &str, default: T, min: T, max: T, expected: &str) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<T>() {
            Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: var_name.clone(),
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::from_env(default, var_name)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: expected.to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_u16_range(&mut self, name: &str, default: u16, min: u16, max: u16) -> Sourced<u16> {
        self.get_ranged(name, default, min, max, "unsigned 16-bit integer")
    }

    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        self.get_ranged(name, default, min, max, "unsigned 64-bit integer")
    }

    /// Optional path with `~/` expansion; `None` when unset or empty.
    ///
    /// If `must_exist` is true, records an error if the path doesn't exist.
    pub fn get_optional_path(&mut self, name: &str, must_exist: bool) -> Sourced<Option<PathBuf>> {
        let var_name = self.var_name(name);
        let raw = self.get_optional_string(name);
        let source = raw.source;
        let Some(value) = raw.value else {
            return raw.map_none();
        };
        let expanded = expand_home(&value);
        if must_exist && !expanded.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var_name.clone(),
                path: expanded.clone(),
            });
        }
        match source {
            ConfigSource::Environment => Sourced::from_env(Some(expanded), var_name),
            _ => Sourced::default_value(Some(expanded)),
        }
    }

    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return Sourced::default_value(default.to_string());
        };
        let lower = value.to_lowercase();
        if LOG_LEVELS.contains(&lower.as_str()) {
            Sourced::from_env(lower, var_name)
        } else {
            self.errors.push(EnvError::InvalidLogLevel {
                var: var_name.clone(),
                value,
            });
            Sourced::from_env(default.to_string(), var_name)
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Sourced<Option<String>> {
    fn map_none<U>(self) -> Sourced<Option<U>> {
        Sourced {
            value: None,
            source: self.source,
            env_var: self.env_var,
        }
    }
}

fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(stripped), Some(home)) => home.join(stripped),
        _ => PathBuf::from(value),
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use proptest::prelude::*;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env mutation is serialized by env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: env mutation is serialized by env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_accepts_common_spellings() {
        let _guard = env_test_lock();
        let var = "CIVIS_TEST_BOOL";
        for (raw, expected) in [("1", true), ("YES", true), ("on", true), ("off", false), ("", false)] {
            set_env(var, raw);
            let mut parser = EnvParser::new();
            assert_eq!(parser.get_bool("TEST_BOOL", !expected).value, expected, "{raw}");
            assert!(!parser.has_errors());
        }
        cleanup_env(&[var]);
    }

    #[test]
    fn test_get_bool_invalid_uses_default() {
        let _guard = env_test_lock();
        set_env("CIVIS_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert!(parser.get_bool("BAD_BOOL", true).value);
        assert!(matches!(parser.errors()[0], EnvError::InvalidValue { .. }));
        cleanup_env(&["CIVIS_BAD_BOOL"]);
    }

    #[test]
    fn test_get_u16_range_out_of_range() {
        let _guard = env_test_lock();
        set_env("CIVIS_TEST_PORT", "0");
        let mut parser = EnvParser::new();
        let result = parser.get_u16_range("TEST_PORT", 8080, 1, u16::MAX);
        assert_eq!(result.value, 8080);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));
        cleanup_env(&["CIVIS_TEST_PORT"]);
    }

    #[test]
    fn test_get_u64_range_trims_whitespace() {
        let _guard = env_test_lock();
        set_env("CIVIS_TEST_TIMEOUT", " 2500 ");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_TIMEOUT", 10, 1, 60_000).value, 2500);
        cleanup_env(&["CIVIS_TEST_TIMEOUT"]);
    }

    #[test]
    fn test_require_string_records_missing() {
        let _guard = env_test_lock();
        cleanup_env(&["CIVIS_TEST_REQUIRED"]);
        let mut parser = EnvParser::new();
        assert!(parser.require_string("TEST_REQUIRED").is_none());
        let errors = parser.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "Required variable CIVIS_TEST_REQUIRED is not set"
        );
        assert!(!parser.has_errors());
    }

    #[test]
    fn test_get_optional_path_expands_home() {
        let _guard = env_test_lock();
        set_env("CIVIS_TEST_DIR", "~/reports");
        let mut parser = EnvParser::new();
        let result = parser.get_optional_path("TEST_DIR", false);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result.value, Some(home.join("reports")));
        }
        assert_eq!(result.source, ConfigSource::Environment);
        cleanup_env(&["CIVIS_TEST_DIR"]);

        let mut parser = EnvParser::new();
        assert!(parser.get_optional_path("TEST_DIR", true).value.is_none());
        assert!(!parser.has_errors());
    }

    #[test]
    fn test_get_optional_path_missing_dir_is_error() {
        let _guard = env_test_lock();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        set_env("CIVIS_TEST_MISSING_DIR", missing.to_str().unwrap());
        let mut parser = EnvParser::new();
        parser.get_optional_path("TEST_MISSING_DIR", true);
        assert!(matches!(parser.errors()[0], EnvError::PathNotFound { .. }));
        cleanup_env(&["CIVIS_TEST_MISSING_DIR"]);
    }

    #[test]
    fn test_source_tracking() {
        let _guard = env_test_lock();
        cleanup_env(&["CIVIS_TEST_SRC"]);
        let mut parser = EnvParser::new();
        let result = parser.get_string("TEST_SRC", "default");
        assert!(result.is_default());
        assert!(result.env_var.is_none());

        set_env("CIVIS_TEST_SRC", "from_env");
        let result = parser.get_string("TEST_SRC", "default");
        assert_eq!(result.source, ConfigSource::Environment);
        assert_eq!(result.env_var.as_deref(), Some("CIVIS_TEST_SRC"));
        assert_eq!(result.into_inner(), "from_env");
        cleanup_env(&["CIVIS_TEST_SRC"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_get_log_level_accepts_only_known_levels(value in "[a-zA-Z]{0,8}") {
            let _guard = env_test_lock();
            let var = "CIVIS_PROPTEST_LOG";
            set_env(var, &value);
            let mut parser = EnvParser::new();
            let result = parser.get_log_level("PROPTEST_LOG", "info");
            let lower = value.to_lowercase();
            if LOG_LEVELS.contains(&lower.as_str()) {
                prop_assert_eq!(result.value, lower);
                prop_assert!(!parser.has_errors());
            } else {
                prop_assert_eq!(result.value, "info");
                prop_assert!(parser.has_errors());
            }
            cleanup_env(&[var]);
        }

        #[test]
        fn test_get_u64_range_never_panics(value in "[-0-9a-z. ]{0,24}") {
            let _guard = env_test_lock();
            let var = "CIVIS_PROPTEST_U64";
            set_env(var, &value);
            let mut parser = EnvParser::new();
            let result = parser.get_u64_range("PROPTEST_U64", 50, 0, 100);
            match value.trim().parse::<u64>() {
                Ok(n) if n <= 100 => prop_assert_eq!(result.value, n),
                _ => prop_assert_eq!(result.value, 50),
            }
            cleanup_env(&[var]);
        }
    }
}
