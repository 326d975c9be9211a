use std::sync::mpsc::channel;
use std::time::Duration;

use rusqlite::{params, Connection};
use smartlist::library::{initialize_database, list_tracks};
use smartlist::playlists::{create_smart_playlist, get_smart_playlist, smart_playlist_track_ids};
use smartlist::{Config, LibraryEvent, LogicalOperator, RefreshScheduler, RuleEngine, RuleGroup, SmartPlaylist, TrackId};
use tempfile::TempDir;

fn library() -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        library_database: temp_dir.path().join("library.sqlite3"),
        cache_dir: temp_dir.path().join("cache"),
        max_proc: 2,
        refresh_debounce_ms: 20,
        parallel_filter_threshold: 2048,
    };
    initialize_database(&config).unwrap();

    let conn = Connection::open(&config.library_database).unwrap();
    for (id, title, genre, bpm, key) in [
        (1, "Footprints", "Jazz", 100.0, "C minor"),
        (2, "Giant Steps", "Jazz", 286.0, "B major"),
        (3, "Paranoid", "Rock", 100.0, "E minor"),
    ] {
        conn.execute(
            "INSERT INTO tracks (id, file_path, title, genre, bpm, musical_key) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, format!("/music/{title}.flac"), title, genre, bpm, key],
        )
        .unwrap();
    }
    (config, temp_dir)
}

#[test]
fn test_jazz_between_90_and_120() {
    let (config, _tmp) = library();
    let rules = RuleGroup::parse_flat(LogicalOperator::And, &["genre:equals:Jazz", "bpm:between:90,120"]).unwrap();

    let tracks = list_tracks(&config).unwrap();
    let engine = RuleEngine::new();
    let matched: Vec<TrackId> = engine.filter(&rules, &tracks).iter().map(|t| t.id).collect();
    assert_eq!(matched, vec![1]);

    let playlist = create_smart_playlist(&config, &SmartPlaylist::new("Mellow Jazz", rules.clone())).unwrap();
    assert_eq!(playlist.rules, rules);
    assert_eq!(smart_playlist_track_ids(&config, "Mellow Jazz").unwrap(), vec![1]);
}

#[test]
fn test_rules_survive_storage() {
    let (config, _tmp) = library();
    let rules = RuleGroup::any(vec![
        RuleGroup::parse_flat(LogicalOperator::And, &["key:compatible_with:A minor,3", "title:contains:Op.:: 2"]).unwrap().not().into(),
        smartlist::Rule::parse("date_added:in_last_days:30").unwrap().disabled().into(),
    ]);
    create_smart_playlist(&config, &SmartPlaylist::new("Odd", rules.clone()).manual().with_limit(10)).unwrap();
    let stored = get_smart_playlist(&config, "Odd").unwrap().unwrap();
    assert_eq!(stored.rules, rules);
    assert_eq!(stored.limit, Some(10));
    assert!(!stored.auto_refresh);
}

#[test]
fn test_library_changes_reach_the_sink() {
    let (config, _tmp) = library();
    let rules = RuleGroup::parse_flat(LogicalOperator::And, &["genre:equals:Jazz", "bpm:between:90,120"]).unwrap();
    create_smart_playlist(&config, &SmartPlaylist::new("Mellow Jazz", rules)).unwrap();

    let (tx, rx) = channel();
    let scheduler = RefreshScheduler::start(config.clone(), move |name: &str, ids: &[TrackId]| {
        let _ = tx.send((name.to_string(), ids.to_vec()));
    })
    .unwrap();

    let conn = Connection::open(&config.library_database).unwrap();
    conn.execute("UPDATE tracks SET bpm = 112 WHERE id = 2", []).unwrap();
    scheduler.notify(LibraryEvent::TracksChanged(vec![2]));
    let (name, ids) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(name, "Mellow Jazz");
    assert_eq!(ids, vec![1, 2]);

    conn.execute("DELETE FROM tracks WHERE id = 1", []).unwrap();
    scheduler.notify(LibraryEvent::TracksRemoved(vec![1]));
    let (_, ids) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(ids, vec![2]);

    scheduler.shutdown();
    assert_eq!(smart_playlist_track_ids(&config, "Mellow Jazz").unwrap(), vec![2]);
}
