//! Signal protocol between worker processes and the build session.
//!
//! Every request is a [`Signal`] and every reply a [`SignalResponse`]. On the
//! wire both are JSON objects internally tagged by `"type"`, one per line;
//! a connection may carry several request/response pairs in sequence.

use crate::coverage::ExecutionDataStore;
use crate::types::{ModuleExecutionSettings, RepoIndex, WorkerIdentity};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of signal kinds the session understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    ModuleExecutionResult,
    RepoIndexRequest,
    ModuleSettingsRequest,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModuleExecutionResult => write!(f, "module_execution_result"),
            Self::RepoIndexRequest => write!(f, "repo_index_request"),
            Self::ModuleSettingsRequest => write!(f, "module_settings_request"),
        }
    }
}

/// Outcome a worker reports once it has finished a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleExecutionResult {
    pub session_id: String,
    pub module_id: u64,
    pub module_name: String,
    #[serde(default)]
    pub coverage_enabled: bool,
    #[serde(default)]
    pub skip_enabled: bool,
    #[serde(default)]
    pub early_flake_enabled: bool,
    #[serde(default)]
    pub early_flake_faulty: bool,
    /// Worker-side outcome of the module (`pass`, `fail`, `skip`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub tests_skipped_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<ExecutionDataStore>,
}

/// Request for the repository source index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIndexRequest {}

/// Request for the settings of one module, computed for the worker's runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSettingsRequest {
    pub worker_identity: WorkerIdentity,
    pub module_name: String,
}

/// A request sent from a worker to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    ModuleExecutionResult(ModuleExecutionResult),
    RepoIndexRequest(RepoIndexRequest),
    ModuleSettingsRequest(ModuleSettingsRequest),
}

impl Signal {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::ModuleExecutionResult(_) => SignalType::ModuleExecutionResult,
            Self::RepoIndexRequest(_) => SignalType::RepoIndexRequest,
            Self::ModuleSettingsRequest(_) => SignalType::ModuleSettingsRequest,
        }
    }
}

/// Reply sent back for a [`Signal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalResponse {
    /// Acknowledges a module execution result.
    ModuleAck { module_removed: bool },
    ModuleSettings { settings: ModuleExecutionSettings },
    RepoIndex { index: RepoIndex },
    Error { message: String },
}

impl SignalResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// A concrete signal body that can be routed to a typed handler.
pub trait SignalPayload: Sized + Send + 'static {
    const TYPE: SignalType;

    /// Extract the payload, handing the signal back if it is of another type.
    fn from_signal(signal: Signal) -> Result<Self, Signal>;
}

macro_rules! impl_signal_payload {
    ($payload:ident) => {
        impl SignalPayload for $payload {
            const TYPE: SignalType = SignalType::$payload;

            fn from_signal(signal: Signal) -> Result<Self, Signal> {
                match signal {
                    Signal::$payload(payload) => Ok(payload),
                    other => Err(other),
                }
            }
        }

        impl From<$payload> for Signal {
            fn from(payload: $payload) -> Self {
                Signal::$payload(payload)
            }
        }
    };
}

impl_signal_payload!(ModuleExecutionResult);
impl_signal_payload!(RepoIndexRequest);
impl_signal_payload!(ModuleSettingsRequest);

/// Errors from encoding or decoding a protocol line.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("empty message")]
    Empty,
}

/// Encode a message as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let mut line = serde_json::to_vec(message).map_err(CodecError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one JSON line (trailing whitespace allowed).
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CodecError::Empty);
    }
    serde_json::from_str(trimmed).map_err(CodecError::Decode)
}
