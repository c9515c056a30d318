//! Module / suite / test lifecycle objects.
//!
//! Each entity ends exactly once (an atomic terminal transition) and rolls
//! its outcome into its parent when it does. Tags are accepted until the
//! entity ends; later writes are dropped with a warning.

mod module;
mod suite;
mod test;
pub mod tags;

pub use module::{Module, ModuleDescriptor};
pub use suite::Suite;
pub use test::Test;

use crate::protocol::ModuleExecutionResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::warn;

/// Value of a single tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

#[derive(Debug, Default)]
struct TagLog {
    entries: Vec<(String, TagValue)>,
    closed: bool,
}

/// Append-only tag log, closed when its owner ends.
#[derive(Debug, Default)]
pub struct Tags {
    log: Mutex<TagLog>,
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tag; returns `false` if the owner already ended.
    pub fn set(&self, key: &str, value: impl Into<TagValue>) -> bool {
        let mut log = self.log.lock().unwrap();
        if log.closed {
            warn!(tag = key, "Ignoring tag set after end");
            return false;
        }
        log.entries.push((key.to_string(), value.into()));
        true
    }

    /// Latest value written for `key`.
    pub fn get(&self, key: &str) -> Option<TagValue> {
        let log = self.log.lock().unwrap();
        log.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Final value of every key.
    pub fn snapshot(&self) -> BTreeMap<String, TagValue> {
        let log = self.log.lock().unwrap();
        log.entries.iter().cloned().collect()
    }

    pub fn close(&self) {
        self.log.lock().unwrap().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }
}

/// Final status of a test, suite, module or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome counts rolled up from children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: TestStatus) {
        match status {
            TestStatus::Pass => self.passed += 1,
            TestStatus::Fail => self.failed += 1,
            TestStatus::Skip => self.skipped += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.passed + self.failed + self.skipped
    }

    /// Any failure fails the parent; all-skipped children skip it.
    pub fn status(&self) -> TestStatus {
        if self.failed > 0 {
            TestStatus::Fail
        } else if self.total() > 0 && self.skipped == self.total() {
            TestStatus::Skip
        } else {
            TestStatus::Pass
        }
    }
}

/// Failure reported by the test framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub kind: Option<String>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    fn apply(&self, tags: &Tags) {
        if let Some(kind) = &self.kind {
            tags.set(tags::ERROR_TYPE, kind.as_str());
        }
        tags.set(tags::ERROR_MESSAGE, self.message.as_str());
    }
}

/// Receives a module's result when it ends.
///
/// In the orchestrator this is the session itself; in a worker process it
/// forwards the result to the session's signal server.
pub trait ModuleParent: Send + Sync {
    fn on_module_end(&self, result: ModuleExecutionResult);
}
