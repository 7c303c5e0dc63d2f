use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
///
/// All of these are fatal: the daemon refuses to start on any of them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", describe(.path))]
    Parse {
        path: Option<PathBuf>,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn describe(path: &Option<PathBuf>) -> String {
    match path.as_deref().map(Path::display) {
        Some(path) => format!("configuration file {}", path),
        None => "configuration".to_string(),
    }
}
