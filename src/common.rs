/// The common module is our grab bag of small shared helpers: logging setup and a few collection
/// utilities.
use std::collections::HashSet;
use std::fs;
use std::hash::Hash;
use std::sync::Mutex;

use directories::ProjectDirs;
use once_cell::sync::Lazy;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, SmartlistError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Deduplicates `xs`, keeping the first occurrence of each element in order.
pub fn uniq<T: Clone + Eq + Hash>(xs: Vec<T>) -> Vec<T> {
    let mut rv = Vec::new();
    let mut seen = HashSet::new();
    for x in xs {
        if seen.insert(x.clone()) {
            rv.push(x);
        }
    }
    rv
}

static LOGGING_INITIALIZED: Lazy<Mutex<HashSet<Option<String>>>> = Lazy::new(|| Mutex::new(HashSet::new()));
// The file writer flushes on a background thread that lives as long as this guard.
static FILE_LOG_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

/// Installs the global tracing subscriber. `output` is either "stderr" or "file"; file logs go to
/// the project state directory. Calling this more than once per logger is a no-op.
///
/// Logging is silenced under `cargo test` (CARGO_TEST set) unless LOG_TEST is also set.
pub fn initialize_logging(logger_name: Option<&str>, output: &str) -> Result<()> {
    {
        let mut initialized = LOGGING_INITIALIZED
            .lock()
            .map_err(|_| SmartlistError::Generic("Logging state lock was poisoned".to_string()))?;
        if !initialized.insert(logger_name.map(|s| s.to_string())) {
            return Ok(());
        }
    }

    let log_despite_testing = std::env::var("LOG_TEST").is_ok();
    let is_testing = std::env::var("CARGO_TEST").is_ok();
    if is_testing && !log_despite_testing {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = match output {
        "stderr" => fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(!log_despite_testing)
            .with_thread_ids(log_despite_testing)
            .with_line_number(log_despite_testing)
            .with_file(log_despite_testing)
            .try_init(),
        "file" => {
            let proj_dirs = ProjectDirs::from("", "", "smartlist")
                .ok_or_else(|| SmartlistError::Generic("Failed to get project directories".to_string()))?;
            let log_dir = if cfg!(target_os = "macos") {
                proj_dirs.cache_dir()
            } else {
                proj_dirs.state_dir().unwrap_or(proj_dirs.cache_dir())
            };
            fs::create_dir_all(log_dir)?;

            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(10)
                .filename_prefix(logger_name.unwrap_or("smartlist"))
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|e| SmartlistError::Generic(format!("Failed to open log file in {}: {e}", log_dir.display())))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            if let Ok(mut slot) = FILE_LOG_GUARD.lock() {
                *slot = Some(guard);
            }

            fmt()
                .with_env_filter(env_filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .try_init()
        }
        other => return Err(SmartlistError::Generic(format!("Unknown log output {other:?}: must be stderr or file"))),
    };
    installed.map_err(|e| SmartlistError::Generic(format!("Failed to install logger: {e}")))
}
