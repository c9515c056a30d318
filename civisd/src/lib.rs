//! civis orchestrator.
//!
//! Runs a build session: starts the signal server workers report to,
//! serves per-module execution settings and the repository index, and
//! aggregates module results (status, skipped tests, coverage) into the
//! session before it ends.

pub mod aggregator;
pub mod config;
pub mod registry;
pub mod repo_index;
pub mod session;
pub mod settings;
pub mod signal_server;

pub use aggregator::{AggregateSnapshot, ResultAggregator};
pub use config::{ConfigError, SessionConfig};
pub use registry::{ModuleRegistry, RegistryError};
pub use repo_index::{FsRepoIndexProvider, RepoIndexProvider};
pub use session::{BuildSession, SessionError, SessionOptions, SessionState, SessionSummary};
pub use settings::{FileSettingsProvider, SettingsCache, SettingsProvider, StaticSettingsProvider};
pub use signal_server::{SignalServer, SignalServerError};
