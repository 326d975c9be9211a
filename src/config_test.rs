use std::path::Path;

use tempfile::TempDir;

use crate::config::*;
use crate::error::{SmartlistError, SmartlistExpectedError};

fn write_config(temp_dir: &TempDir, content: &str) -> std::path::PathBuf {
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, content).unwrap();
    config_path
}

fn expected_error(content: &str) -> (String, std::path::PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let cache_dir = temp_dir.path().join("cache");
    let content = format!("cache_dir = {:?}\n{}", cache_dir.to_string_lossy(), content);
    let config_path = write_config(&temp_dir, &content);
    match Config::parse(Some(&config_path)) {
        Err(SmartlistError::Expected(e)) => (e.to_string(), config_path),
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[test]
fn test_config_minimal() {
    let temp_dir = TempDir::new().unwrap();
    let cache_dir = temp_dir.path().join("cache");
    let config_path = write_config(
        &temp_dir,
        &format!(
            r#"
            library_database = "~/.local/share/music/library.sqlite3"
            cache_dir = {:?}
            "#,
            cache_dir.to_string_lossy()
        ),
    );

    let config = Config::parse(Some(&config_path)).unwrap();
    let home = dirs::home_dir().unwrap();
    assert_eq!(config.library_database, home.join(".local/share/music/library.sqlite3"));
    assert_eq!(config.cache_dir, cache_dir);
    assert!(cache_dir.is_dir());
    assert_eq!(config.max_proc, (num_cpus::get() / 2).max(1));
    assert_eq!(config.refresh_debounce_ms, 500);
    assert_eq!(config.refresh_debounce(), std::time::Duration::from_millis(500));
    assert_eq!(config.parallel_filter_threshold, 2048);
}

#[test]
fn test_config_full() {
    let temp_dir = TempDir::new().unwrap();
    let cache_dir = temp_dir.path().join("cache");
    let config_path = write_config(
        &temp_dir,
        &format!(
            r#"
            library_database = "/srv/music/library.sqlite3"
            cache_dir = {:?}
            max_proc = 8
            refresh_debounce_ms = 0
            parallel_filter_threshold = 10000
            "#,
            cache_dir.to_string_lossy()
        ),
    );

    let config = Config::parse(Some(&config_path)).unwrap();
    assert_eq!(
        config,
        Config {
            library_database: Path::new("/srv/music/library.sqlite3").to_path_buf(),
            cache_dir,
            max_proc: 8,
            refresh_debounce_ms: 0,
            parallel_filter_threshold: 10000,
        }
    );
}

#[test]
fn test_config_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("nope.toml");
    let err = Config::parse(Some(&config_path)).unwrap_err();
    assert!(matches!(err, SmartlistError::Expected(SmartlistExpectedError::ConfigNotFound { .. })));
    assert_eq!(err.to_string(), format!("Configuration file not found ({})", config_path.display()));
}

#[test]
fn test_config_decode_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, "library_database = ");
    let err = Config::parse(Some(&config_path)).unwrap_err();
    assert!(matches!(err, SmartlistError::Expected(SmartlistExpectedError::ConfigDecode(_))));
    assert!(err.to_string().starts_with("Failed to decode configuration file: invalid TOML:"));
}

#[test]
fn test_config_missing_key_validation() {
    let (err, path) = expected_error("");
    assert_eq!(err, format!("Missing key library_database in configuration file ({})", path.display()));
}

#[test]
fn test_config_value_validation() {
    let cases = [
        ("library_database = 1", "library_database", "must be a path"),
        ("library_database = '/l.db'\nmax_proc = 0", "max_proc", "must be a positive integer"),
        ("library_database = '/l.db'\nmax_proc = 'lala'", "max_proc", "must be a positive integer"),
        ("library_database = '/l.db'\nrefresh_debounce_ms = -1", "refresh_debounce_ms", "must be a non-negative integer"),
        ("library_database = '/l.db'\nparallel_filter_threshold = 0", "parallel_filter_threshold", "must be a positive integer"),
    ];
    for (content, key, reason) in cases {
        let (err, path) = expected_error(content);
        assert_eq!(err, format!("Invalid value for {key} in configuration file ({}): {reason}", path.display()));
    }

    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, "library_database = '/l.db'\ncache_dir = 5");
    let err = Config::parse(Some(&config_path)).unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("Invalid value for cache_dir in configuration file ({}): must be a path", config_path.display())
    );
}

#[test]
fn test_config_unrecognized_keys() {
    let temp_dir = TempDir::new().unwrap();
    let cache_dir = temp_dir.path().join("cache");
    let content = format!(
        "library_database = '/l.db'\ncache_dir = {:?}\nmusic_source_dir = '~/music'\n[vfs]\nmount_dir = '~/mnt'\nhide = true\n",
        cache_dir.to_string_lossy()
    );
    let config_path = write_config(&temp_dir, &content);
    // Unknown keys only produce a warning.
    assert!(Config::parse(Some(&config_path)).is_ok());

    let table: toml::Table = "music_source_dir = 1\n[vfs]\nmount_dir = 2\nhide = true\n[empty]\n".parse().unwrap();
    assert_eq!(unrecognized_accessors(&table), vec!["empty", "music_source_dir", "vfs.hide", "vfs.mount_dir"]);
}

#[test]
fn test_default_config_path() {
    let path = default_config_path();
    assert!(path.ends_with("config.toml"));
}
