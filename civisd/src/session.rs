//! The build session: one orchestrator run across every worker.
//!
//! A session owns the signal server, the module registry, the settings
//! cache and the result aggregator. It moves through
//! `created → running → ending → ended` with compare-and-swap transitions;
//! `end()` stops the server (letting in-flight signals finish), ends any
//! module still active locally, seals the aggregator and only then
//! finalizes tags and coverage.

use crate::aggregator::{AggregateSnapshot, ResultAggregator};
use crate::registry::{ModuleRegistry, RegistryError};
use crate::repo_index::RepoIndexProvider;
use crate::settings::{SettingsCache, SettingsProvider};
use crate::signal_server::{DEFAULT_BIND_ADDR, SignalServer, SignalServerError};
use anyhow::Context;
use chrono::{DateTime, Utc};
use civis_common::coverage::{build_bundle, dump_report, percentage};
use civis_common::domain::{
    Module, ModuleDescriptor, ModuleParent, StatusCounts, TagValue, Tags, TestStatus, tags,
};
use civis_common::protocol::{
    ModuleExecutionResult, ModuleSettingsRequest, RepoIndexRequest, SignalResponse,
};
use civis_common::types::WorkerIdentity;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Running = 1,
    Ending = 2,
    Ended = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Ending,
            _ => Self::Ended,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Ending => write!(f, "ending"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Server(#[from] SignalServerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("session is {0}, not running")]
    NotRunning(SessionState),
}

/// Identifying fields and environment of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub project_name: String,
    pub command: String,
    pub repo_root: PathBuf,
    pub bind_addr: SocketAddr,
    pub report_dump_dir: Option<PathBuf>,
    /// Identity used to compute settings for modules that run in-process.
    pub local_identity: WorkerIdentity,
}

impl SessionOptions {
    pub fn new(project_name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            command: command.into(),
            repo_root: PathBuf::from("."),
            bind_addr: DEFAULT_BIND_ADDR,
            report_dump_dir: None,
            local_identity: WorkerIdentity::new("civisd", env!("CARGO_PKG_VERSION"), "civis"),
        }
    }

    pub fn with_repo_root(mut self, repo_root: impl Into<PathBuf>) -> Self {
        self.repo_root = repo_root.into();
        self
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_report_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dump_dir = Some(dir.into());
        self
    }
}

/// What a finished session reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub project_name: String,
    pub state: SessionState,
    pub status: TestStatus,
    pub started_at: DateTime<Utc>,
    pub modules: StatusCounts,
    pub tests_skipped: u64,
    pub coverage_percentage: Option<u64>,
    pub report_folder: Option<PathBuf>,
    pub tags: BTreeMap<String, TagValue>,
}

struct SessionCore {
    id: String,
    options: SessionOptions,
    started_at: DateTime<Utc>,
    state: AtomicU8,
    tags: Tags,
    registry: Arc<ModuleRegistry>,
    aggregator: ResultAggregator,
    settings: SettingsCache,
    repo_index: Arc<dyn RepoIndexProvider>,
    next_module_id: AtomicU64,
    signal_address: OnceLock<SocketAddr>,
}

impl SessionCore {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }

    fn on_module_settings_request(
        &self,
        request: ModuleSettingsRequest,
    ) -> anyhow::Result<SignalResponse> {
        let settings = self
            .settings
            .module_settings(&request.worker_identity, &request.module_name)
            .context("Error while getting module execution settings")?;
        debug!(
            module = %request.module_name,
            identity = %request.worker_identity,
            "Serving module settings"
        );
        Ok(SignalResponse::ModuleSettings { settings })
    }

    fn on_repo_index_request(&self) -> anyhow::Result<SignalResponse> {
        let index = self
            .repo_index
            .index()
            .context("Error while building repo index")?;
        Ok(SignalResponse::RepoIndex {
            index: (*index).clone(),
        })
    }

    fn finalize(&self) -> SessionSummary {
        let snapshot = self.aggregator.snapshot();
        self.apply_finalization_tags(&snapshot);

        let (coverage_percentage, report_folder) = self.finalize_coverage();
        if let Some(pct) = coverage_percentage {
            self.tags.set(tags::CODE_COVERAGE_LINES_PCT, pct);
        }
        let status = snapshot.modules.status();
        self.tags.set(tags::TEST_STATUS, status.as_str());
        self.tags.close();
        self.state.store(SessionState::Ended as u8, Ordering::SeqCst);

        info!(
            session = %self.id,
            %status,
            modules = snapshot.modules.total(),
            tests_skipped = snapshot.tests_skipped,
            coverage = ?coverage_percentage,
            "Session ended"
        );
        SessionSummary {
            id: self.id.clone(),
            project_name: self.options.project_name.clone(),
            state: SessionState::Ended,
            status,
            started_at: self.started_at,
            modules: snapshot.modules,
            tests_skipped: snapshot.tests_skipped,
            coverage_percentage,
            report_folder,
            tags: self.tags.snapshot(),
        }
    }

    fn apply_finalization_tags(&self, snapshot: &AggregateSnapshot) {
        if snapshot.coverage_enabled {
            self.tags.set(tags::CODE_COVERAGE_ENABLED, true);
        }
        if snapshot.skip_enabled {
            self.tags.set(tags::TESTS_SKIPPING_ENABLED, true);
            self.tags.set(tags::TESTS_SKIPPING_TYPE, "test");
            self.tags.set(tags::TESTS_SKIPPING_COUNT, snapshot.tests_skipped);
            if snapshot.tests_skipped > 0 {
                self.tags.set(tags::TESTS_SKIPPED, true);
            }
        }
        if snapshot.early_flake_enabled {
            self.tags.set(tags::EARLY_FLAKE_ENABLED, true);
            if snapshot.early_flake_faulty {
                self.tags.set(tags::EARLY_FLAKE_ABORT_REASON, "faulty");
            }
        }
    }

    /// Resolve merged coverage and write the report; never fails the session.
    fn finalize_coverage(&self) -> (Option<u64>, Option<PathBuf>) {
        let (store, output_dirs) = self.aggregator.coverage();
        let bundle = match build_bundle(&store, &output_dirs) {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                debug!(
                    classes = store.len(),
                    dirs = output_dirs.len(),
                    "No coverage to aggregate"
                );
                return (None, None);
            }
            Err(e) => {
                warn!("Could not build aggregated coverage: {}", e);
                return (None, None);
            }
        };
        let pct = percentage(&bundle);

        let Some(dump_dir) = &self.options.report_dump_dir else {
            return (pct, None);
        };
        let folder = dump_dir
            .join(format!("session-{}", self.id))
            .join("aggregated");
        let index = match self.repo_index.index() {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("Coverage report will use raw source names: {:#}", e);
                None
            }
        };
        match dump_report(&bundle, index.as_deref(), &self.options.repo_root, &folder) {
            Ok(folder) => {
                info!(?folder, "Wrote aggregated coverage report");
                (pct, Some(folder))
            }
            Err(e) => {
                warn!("Could not write coverage report: {}", e);
                (pct, None)
            }
        }
    }
}

/// Parent of modules the session starts; routes local module ends through the aggregator.
struct SessionModuleParent {
    core: Weak<SessionCore>,
}

impl ModuleParent for SessionModuleParent {
    fn on_module_end(&self, result: ModuleExecutionResult) {
        match self.core.upgrade() {
            Some(core) => {
                core.aggregator.on_module_execution_result(&result);
            }
            None => debug!(module = %result.module_name, "Module ended after session was dropped"),
        }
    }
}

pub struct BuildSession {
    core: Arc<SessionCore>,
    server: Mutex<Option<SignalServer>>,
}

impl std::fmt::Debug for BuildSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildSession")
            .field("id", &self.core.id)
            .field("project", &self.core.options.project_name)
            .field("state", &self.core.state())
            .finish()
    }
}

impl BuildSession {
    /// Create the session, start its signal server and move it to `running`.
    ///
    /// Failing to bind the signal server is the only fatal error.
    pub async fn start(
        options: SessionOptions,
        settings: Arc<dyn SettingsProvider>,
        repo_index: Arc<dyn RepoIndexProvider>,
    ) -> Result<Self, SessionError> {
        let registry = Arc::new(ModuleRegistry::new());
        let core = Arc::new(SessionCore {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            state: AtomicU8::new(SessionState::Created as u8),
            tags: Tags::new(),
            aggregator: ResultAggregator::new(Arc::clone(&registry)),
            registry,
            settings: SettingsCache::new(settings),
            repo_index,
            next_module_id: AtomicU64::new(1),
            signal_address: OnceLock::new(),
            options,
        });

        let mut server = SignalServer::new(core.options.bind_addr);
        let handler_core = Arc::clone(&core);
        server.register_signal_handler(move |result: ModuleExecutionResult| {
            Ok(handler_core.aggregator.on_module_execution_result(&result))
        })?;
        let handler_core = Arc::clone(&core);
        server.register_signal_handler(move |request: ModuleSettingsRequest| {
            handler_core.on_module_settings_request(request)
        })?;
        let handler_core = Arc::clone(&core);
        server.register_signal_handler(move |_: RepoIndexRequest| {
            handler_core.on_repo_index_request()
        })?;

        let address = server.start().await?;
        let _ = core.signal_address.set(address);
        core.tags.set(tags::TEST_COMMAND, core.options.command.as_str());
        if let Err(state) = core.transition(SessionState::Created, SessionState::Running) {
            return Err(SessionError::NotRunning(state));
        }
        info!(
            session = %core.id,
            project = %core.options.project_name,
            %address,
            "Session started"
        );

        Ok(Self {
            core,
            server: Mutex::new(Some(server)),
        })
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn project_name(&self) -> &str {
        &self.core.options.project_name
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.core.started_at
    }

    /// Address workers connect to.
    pub fn signal_address(&self) -> Option<SocketAddr> {
        self.core.signal_address.get().copied()
    }

    pub fn tags(&self) -> &Tags {
        &self.core.tags
    }

    pub fn active_modules(&self) -> usize {
        self.core.registry.len()
    }

    /// Snapshot of what the aggregator has folded so far.
    pub fn aggregate(&self) -> AggregateSnapshot {
        self.core.aggregator.snapshot()
    }

    /// Start a module; its [`Module::child_env`] tells a worker how to report back.
    pub fn module_start(
        &self,
        name: impl Into<String>,
        output_dirs: Vec<PathBuf>,
    ) -> Result<Arc<Module>, SessionError> {
        let state = self.core.state();
        if state != SessionState::Running {
            return Err(SessionError::NotRunning(state));
        }
        let name = name.into();
        let settings = match self
            .core
            .settings
            .module_settings(&self.core.options.local_identity, &name)
        {
            Ok(settings) => settings,
            Err(e) => {
                warn!(module = %name, "Using default settings for local module: {:#}", e);
                Default::default()
            }
        };
        let descriptor = ModuleDescriptor {
            session_id: self.core.id.clone(),
            id: self.core.next_module_id.fetch_add(1, Ordering::SeqCst),
            name,
            output_dirs,
            signal_address: self.signal_address(),
        };
        let parent = Arc::new(SessionModuleParent {
            core: Arc::downgrade(&self.core),
        });
        let module = Module::new(descriptor, settings, parent);
        self.core.registry.add(Arc::clone(&module))?;
        self.core.aggregator.add_output_dirs(module.output_dirs());
        debug!(module = %module.name(), id = module.id(), "Module started");
        Ok(module)
    }

    /// End the session. Returns `None` if it was not running.
    pub async fn end(&self) -> Option<SessionSummary> {
        if let Err(state) = self
            .core
            .transition(SessionState::Running, SessionState::Ending)
        {
            warn!(session = %self.core.id, %state, "Ignoring session end");
            return None;
        }

        let server = self.server.lock().unwrap().take();
        if let Some(mut server) = server {
            server.stop().await;
        }

        for module in self.core.registry.active() {
            debug!(module = %module.name(), "Ending module still active at session end");
            module.end();
        }
        self.core.aggregator.seal();

        let core = Arc::clone(&self.core);
        match tokio::task::spawn_blocking(move || core.finalize()).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(session = %self.core.id, "Session finalization failed: {}", e);
                self.core
                    .state
                    .store(SessionState::Ended as u8, Ordering::SeqCst);
                None
            }
        }
    }
}
