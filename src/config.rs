/// The config module provides the configuration model and parsing logic.
///
/// We take special care to optimize for a good user experience: detailed errors are raised when
/// invalid configuration is detected, and warnings are emitted when unrecognized keys are found.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use toml::{Table, Value};
use tracing::{debug, warn};

use crate::error::{Result, SmartlistExpectedError};

const DEFAULT_REFRESH_DEBOUNCE_MS: u64 = 500;
const DEFAULT_PARALLEL_FILTER_THRESHOLD: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// The library's SQLite database. Track records are read from it and smart playlists are
    /// stored in it.
    pub library_database: PathBuf,
    pub cache_dir: PathBuf,
    /// Size of the thread pool used for parallel filtering.
    pub max_proc: usize,
    /// How long the library must be quiet before queued change events are re-evaluated.
    pub refresh_debounce_ms: u64,
    /// Libraries with at least this many tracks are filtered in parallel.
    pub parallel_filter_threshold: usize,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "smartlist")
}

pub fn default_config_path() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.config_dir().join("config.toml"),
        None => dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("smartlist").join("config.toml"),
    }
}

fn default_cache_dir() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.cache_dir().to_path_buf(),
        None => dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("smartlist"),
    }
}

fn default_max_proc() -> usize {
    (num_cpus::get() / 2).max(1)
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

impl Config {
    /// Reads the configuration file at `config_path_override`, or at the default location if None.
    pub fn parse(config_path_override: Option<&Path>) -> Result<Config> {
        let cfgpath = config_path_override.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let cfgtext = match fs::read_to_string(&cfgpath) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SmartlistExpectedError::ConfigNotFound { path: cfgpath }.into());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse_str(&cfgtext, &cfgpath)
    }

    /// Parses configuration text. `cfgpath` is only used in error messages.
    pub fn parse_str(cfgtext: &str, cfgpath: &Path) -> Result<Config> {
        // As we parse, remove consumed values from the table. Anything left over at the end is an
        // unknown key, which we warn about.
        let mut data: Table = cfgtext.parse().map_err(|e: toml::de::Error| SmartlistExpectedError::ConfigDecode(e.to_string()))?;

        let invalid = |key: &str, reason: &str| SmartlistExpectedError::InvalidConfigValue {
            key: key.to_string(),
            path: cfgpath.to_path_buf(),
            reason: reason.to_string(),
        };

        let library_database = match data.remove("library_database") {
            Some(Value::String(s)) => expand_path(&s),
            Some(_) => return Err(invalid("library_database", "must be a path").into()),
            None => {
                return Err(SmartlistExpectedError::MissingConfigKey {
                    key: "library_database".to_string(),
                    path: cfgpath.to_path_buf(),
                }
                .into())
            }
        };

        let cache_dir = match data.remove("cache_dir") {
            Some(Value::String(s)) => expand_path(&s),
            Some(_) => return Err(invalid("cache_dir", "must be a path").into()),
            None => default_cache_dir(),
        };
        fs::create_dir_all(&cache_dir)?;

        let max_proc = match data.remove("max_proc") {
            Some(Value::Integer(n)) if n > 0 => n as usize,
            Some(_) => return Err(invalid("max_proc", "must be a positive integer").into()),
            None => default_max_proc(),
        };

        let refresh_debounce_ms = match data.remove("refresh_debounce_ms") {
            Some(Value::Integer(n)) if n >= 0 => n as u64,
            Some(_) => return Err(invalid("refresh_debounce_ms", "must be a non-negative integer").into()),
            None => DEFAULT_REFRESH_DEBOUNCE_MS,
        };

        let parallel_filter_threshold = match data.remove("parallel_filter_threshold") {
            Some(Value::Integer(n)) if n > 0 => n as usize,
            Some(_) => return Err(invalid("parallel_filter_threshold", "must be a positive integer").into()),
            None => DEFAULT_PARALLEL_FILTER_THRESHOLD,
        };

        let unrecognized = unrecognized_accessors(&data);
        if !unrecognized.is_empty() {
            warn!("Unrecognized options found in configuration file: {}", unrecognized.join(", "));
        }

        let config = Config {
            library_database,
            cache_dir,
            max_proc,
            refresh_debounce_ms,
            parallel_filter_threshold,
        };
        debug!("Parsed configuration from {}: {:?}", cfgpath.display(), config);
        Ok(config)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

/// DFS over the leftover keys, returning the dotted accessor of every leaf.
pub(crate) fn unrecognized_accessors(data: &Table) -> Vec<String> {
    let mut result = Vec::new();
    let mut stack: Vec<(String, &Value)> = data.iter().map(|(k, v)| (k.clone(), v)).collect();
    while let Some((accessor, node)) = stack.pop() {
        match node {
            Value::Table(t) if !t.is_empty() => {
                for (k, v) in t {
                    stack.push((format!("{accessor}.{k}"), v));
                }
            }
            _ => result.push(accessor),
        }
    }
    result.sort();
    result
}
