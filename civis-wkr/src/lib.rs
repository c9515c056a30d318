//! civis worker agent.
//!
//! Runs inside a worker process: reads the discovery variables the session
//! exported, asks the session for module settings, turns test-framework
//! events into module/suite/test entities and reports the module result back
//! when the module finishes.

pub mod config;
pub mod events;
pub mod reporter;

pub use config::{WorkerConfig, WorkerConfigError};
pub use events::{SuiteDescriptor, TestDescriptor, TestEventsHandler, WorkerEvent};
pub use reporter::{
    LogModuleParent, ReportError, SignalModuleParent, module_parent, request_repo_index,
    request_settings,
};
