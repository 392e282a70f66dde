use crate::resolution::Strategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Engine settings, read from a TOML file where every field is optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Strategy of the entity types a merge request does not mention
    pub default_strategy: Strategy,
    /// Insert the tables of one copy layer from several threads
    pub parallel_copy: bool,
    /// Compare the target counts with the source totals after a merge or a split
    pub verify_counts: bool,
    /// Used when a merge request does not say whether to activate the new feed
    pub activate_on_success_default: bool,
    /// `env_logger` filter used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            default_strategy: Strategy::FailOnConflict,
            parallel_copy: true,
            verify_counts: true,
            activate_on_success_default: false,
            log_level: "info".to_owned(),
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}", p.display(), self.message),
            None => write!(f, "config error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Configuration {
    /// Reads `path`. A missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                })
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start].matches('\n').count() + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }
}
