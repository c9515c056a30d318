//! Orchestrator configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `CIVIS_` environment variables, then command-line flags (applied by the
//! binary).

use crate::repo_index::{FsRepoIndexProvider, RepoIndexProvider};
use crate::session::SessionOptions;
use crate::settings::{FileSettingsProvider, SettingsProvider, StaticSettingsProvider};
use civis_common::config::{EnvError, EnvParser, vars};
use civis_common::types::ModuleExecutionSettings;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid signal server address '{0}'")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignalServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for SignalServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoverageConfig {
    /// Where aggregated coverage reports are written; unset skips the report.
    pub report_dump_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub project_name: Option<String>,
    pub repo_root: Option<PathBuf>,
    pub signal_server: SignalServerConfig,
    pub coverage: CoverageConfig,
    /// JSON settings snapshot; takes precedence over `settings`.
    pub settings_file: Option<PathBuf>,
    /// Inline settings used when no settings file is configured.
    pub settings: ModuleExecutionSettings,
}

impl SessionConfig {
    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `CIVIS_` environment variables; returns the variables that failed to parse.
    pub fn apply_env(&mut self) -> Vec<EnvError> {
        let mut parser = EnvParser::new();
        if let Some(host) = parser.get_optional_string(vars::SIGNAL_SERVER_HOST).value {
            self.signal_server.host = host;
        }
        let port = parser.get_u16_range(
            vars::SIGNAL_SERVER_PORT,
            self.signal_server.port,
            0,
            u16::MAX,
        );
        self.signal_server.port = port.value;
        if let Some(dir) = parser
            .get_optional_path(vars::CODE_COVERAGE_REPORT_DUMP_DIR, false)
            .value
        {
            self.coverage.report_dump_dir = Some(dir);
        }
        if let Some(file) = parser.get_optional_path(vars::SETTINGS_FILE, true).value {
            self.settings_file = Some(file);
        }
        if let Some(root) = parser.get_optional_path(vars::REPO_ROOT, true).value {
            self.repo_root = Some(root);
        }
        parser.take_errors()
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let target = format!("{}:{}", self.signal_server.host, self.signal_server.port);
        target
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(ConfigError::InvalidAddress(target))
    }

    pub fn settings_provider(&self) -> Arc<dyn SettingsProvider> {
        match &self.settings_file {
            Some(path) => Arc::new(FileSettingsProvider::new(path)),
            None => Arc::new(StaticSettingsProvider::new(self.settings.clone())),
        }
    }

    pub fn repo_root(&self) -> PathBuf {
        self.repo_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn repo_index_provider(&self) -> Arc<dyn RepoIndexProvider> {
        Arc::new(FsRepoIndexProvider::new(self.repo_root()))
    }

    pub fn session_options(
        &self,
        project_name: Option<String>,
        command: impl Into<String>,
    ) -> Result<SessionOptions, ConfigError> {
        let project_name = project_name
            .or_else(|| self.project_name.clone())
            .unwrap_or_else(|| default_project_name(&self.repo_root()));
        let mut options = SessionOptions::new(project_name, command)
            .with_repo_root(self.repo_root())
            .with_bind_addr(self.bind_addr()?);
        if let Some(dir) = &self.coverage.report_dump_dir {
            options = options.with_report_dump_dir(dir.clone());
        }
        Ok(options)
    }
}

fn default_project_name(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("project")
        .to_string()
}
