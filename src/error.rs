use std::path::PathBuf;
use thiserror::Error;

use crate::rules::ValidationError;

#[derive(Error, Debug)]
pub enum SmartlistError {
    #[error("Smartlist error: {0}")]
    Generic(String),
    #[error(transparent)]
    Expected(#[from] SmartlistExpectedError),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors caused by user input, as opposed to bugs or environment failures. These are safe to show
/// to the user verbatim.
#[derive(Error, Debug)]
pub enum SmartlistExpectedError {
    #[error("{0}")]
    Generic(String),
    #[error("Smart playlist {name} does not exist")]
    PlaylistDoesNotExist { name: String },
    #[error("Smart playlist {name} already exists")]
    PlaylistAlreadyExists { name: String },
    #[error("Invalid rules for smart playlist {name}: {}", format_validation_errors(.errors))]
    InvalidRuleTree { name: String, errors: Vec<ValidationError> },
    #[error("{0}")]
    InvalidRuleSyntax(String),
    #[error("Configuration file not found ({path})")]
    ConfigNotFound { path: PathBuf },
    #[error("Failed to decode configuration file: invalid TOML: {0}")]
    ConfigDecode(String),
    #[error("Missing key {key} in configuration file ({path})")]
    MissingConfigKey { key: String, path: PathBuf },
    #[error("Invalid value for {key} in configuration file ({path}): {reason}")]
    InvalidConfigValue { key: String, path: PathBuf, reason: String },
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

pub type Result<T> = std::result::Result<T, SmartlistError>;
