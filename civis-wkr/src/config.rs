//! Worker configuration, read from the discovery variables a session exports.

use civis_common::client::{ClientError, DEFAULT_CLIENT_TIMEOUT, SignalClient};
use civis_common::config::{EnvError, EnvParser, vars};
use civis_common::domain::ModuleDescriptor;
use civis_common::types::WorkerIdentity;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid worker environment: {}", format_errors(.0))]
pub struct WorkerConfigError(pub Vec<EnvError>);

fn format_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub session_id: String,
    pub module_id: u64,
    pub module_name: String,
    pub signal_host: Option<String>,
    pub signal_port: u16,
    pub client_timeout: Duration,
    pub identity: WorkerIdentity,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        let mut parser = EnvParser::new();
        let session_id = parser.require_string(vars::SESSION_ID);
        let module_name = parser.require_string(vars::MODULE_NAME);
        let module_id = parser.get_u64_range(vars::MODULE_ID, 0, 0, u64::MAX).value;
        let signal_host = parser.get_optional_string(vars::SIGNAL_SERVER_HOST).value;
        let signal_port = parser
            .get_u16_range(vars::SIGNAL_SERVER_PORT, 0, 0, u16::MAX)
            .value;
        let timeout_ms = parser
            .get_u64_range(
                vars::SIGNAL_CLIENT_TIMEOUT_MS,
                DEFAULT_CLIENT_TIMEOUT.as_millis() as u64,
                1,
                3_600_000,
            )
            .value;
        let identity = WorkerIdentity::new(
            parser.get_string(vars::WORKER_RUNTIME_NAME, "unknown").value,
            parser.get_string(vars::WORKER_RUNTIME_VERSION, "").value,
            parser.get_string(vars::WORKER_RUNTIME_VENDOR, "").value,
        );

        let errors = parser.take_errors();
        match (session_id, module_name) {
            (Some(session_id), Some(module_name)) if errors.is_empty() => Ok(Self {
                session_id,
                module_id,
                module_name,
                signal_host,
                signal_port,
                client_timeout: Duration::from_millis(timeout_ms),
                identity,
            }),
            _ => Err(WorkerConfigError(errors)),
        }
    }

    /// Client for the session's signal server; `None` when no server is advertised.
    pub fn client(&self) -> Result<Option<SignalClient>, ClientError> {
        match &self.signal_host {
            Some(host) if self.signal_port != 0 => {
                let client = SignalClient::connect_to(host, self.signal_port)?;
                Ok(Some(client.with_timeout(self.client_timeout)))
            }
            _ => Ok(None),
        }
    }

    pub fn module_descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            session_id: self.session_id.clone(),
            id: self.module_id,
            name: self.module_name.clone(),
            output_dirs: Vec::new(),
            signal_address: None,
        }
    }
}
