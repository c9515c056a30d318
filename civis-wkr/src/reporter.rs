//! Talking to the build session from a worker process.
//!
//! [`SignalModuleParent`] is the module parent used inside a worker: when the
//! worker's module ends, its result is sent to the session's signal server.
//! Without a session the result is only logged.

use civis_common::client::{ClientError, SignalClient};
use civis_common::domain::ModuleParent;
use civis_common::protocol::{
    ModuleExecutionResult, ModuleSettingsRequest, RepoIndexRequest, Signal, SignalResponse,
};
use civis_common::types::{ModuleExecutionSettings, RepoIndex, WorkerIdentity};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("unexpected response to {request}: {response:?}")]
    UnexpectedResponse {
        request: &'static str,
        response: SignalResponse,
    },
}

/// Sends the module result to the session when the module ends.
#[derive(Debug)]
pub struct SignalModuleParent {
    client: SignalClient,
}

impl SignalModuleParent {
    pub fn new(client: SignalClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &SignalClient {
        &self.client
    }
}

impl ModuleParent for SignalModuleParent {
    fn on_module_end(&self, result: ModuleExecutionResult) {
        let module = result.module_name.clone();
        match self.client.request(&Signal::ModuleExecutionResult(result)) {
            Ok(SignalResponse::ModuleAck { module_removed }) => {
                debug!(%module, module_removed, "Module result delivered");
            }
            Ok(other) => warn!(%module, response = ?other, "Unexpected response to module result"),
            Err(e) => warn!(%module, "Could not report module result: {}", e),
        }
    }
}

/// Parent for a worker running without a session; logs the result.
#[derive(Debug, Default)]
pub struct LogModuleParent;

impl ModuleParent for LogModuleParent {
    fn on_module_end(&self, result: ModuleExecutionResult) {
        info!(
            module = %result.module_name,
            status = ?result.status,
            tests_skipped = result.tests_skipped_total,
            "Module finished without a build session"
        );
    }
}

pub fn module_parent(client: Option<SignalClient>) -> Arc<dyn ModuleParent> {
    match client {
        Some(client) => Arc::new(SignalModuleParent::new(client)),
        None => Arc::new(LogModuleParent),
    }
}

/// Ask the session for the settings of `module_name`.
pub fn request_settings(
    client: &SignalClient,
    identity: &WorkerIdentity,
    module_name: &str,
) -> Result<ModuleExecutionSettings, ReportError> {
    let signal = Signal::ModuleSettingsRequest(ModuleSettingsRequest {
        worker_identity: identity.clone(),
        module_name: module_name.to_string(),
    });
    match client.request(&signal)? {
        SignalResponse::ModuleSettings { settings } => Ok(settings),
        response => Err(ReportError::UnexpectedResponse {
            request: "module settings request",
            response,
        }),
    }
}

pub fn request_repo_index(client: &SignalClient) -> Result<RepoIndex, ReportError> {
    match client.request(&Signal::RepoIndexRequest(RepoIndexRequest {}))? {
        SignalResponse::RepoIndex { index } => Ok(index),
        response => Err(ReportError::UnexpectedResponse {
            request: "repo index request",
            response,
        }),
    }
}
