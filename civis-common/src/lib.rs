//! Shared building blocks for civis.
//!
//! This crate holds everything both sides of a build session need: the
//! signal protocol and its blocking client, the module/suite/test entity
//! model, the activation tracker, the coverage merge engine, environment
//! configuration and logging setup.

pub mod client;
pub mod config;
pub mod coverage;
pub mod domain;
pub mod logging;
pub mod protocol;
pub mod tracker;
pub mod types;

pub use client::{ClientError, SignalClient};
pub use config::{EnvError, EnvParser};
pub use coverage::{CoverageBundle, CoverageError, ExecutionData, ExecutionDataStore};
pub use domain::{ErrorInfo, Module, ModuleDescriptor, ModuleParent, Suite, Test, TestStatus};
pub use logging::{LogConfig, init_logging};
pub use protocol::{
    CodecError, ModuleExecutionResult, ModuleSettingsRequest, RepoIndexRequest, Signal,
    SignalPayload, SignalResponse, SignalType,
};
pub use tracker::ActivationTracker;
pub use types::{ModuleExecutionSettings, RepoIndex, TestIdentifier, WorkerIdentity};
