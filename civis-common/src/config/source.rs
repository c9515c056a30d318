//! Where a configuration value came from.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    File,
    Environment,
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Default => "default",
            Self::File => "file",
            Self::Environment => "environment",
            Self::CommandLine => "command line",
        };
        f.write_str(label)
    }
}

/// A value paired with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable the value was read from, for environment values.
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
        }
    }

    pub fn from_env(value: T, var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var),
        }
    }

    pub fn is_default(&self) -> bool {
        self.source == ConfigSource::Default
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}
