use std::fs;
use std::sync::Once;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use tempfile::TempDir;

use crate::config::Config;
use crate::keys::{Mode, MusicalKey, PitchClass};
use crate::library::LIBRARY_SCHEMA;
use crate::rule_parser::{Comparator, Field, Rule, RuleGroup, RuleNode, Value};
use crate::tracks::{AnalysisBundle, Track};

static INIT: Once = Once::new();

pub fn init() -> TempDir {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")))
            .with_test_writer()
            .try_init();
    });
    TempDir::new().expect("failed to create temp dir")
}

// Creates a test config pointing at an empty library database.
pub fn config() -> (Config, TempDir) {
    let temp_dir = init();
    let base_path = temp_dir.path();
    fs::create_dir_all(base_path.join("cache")).expect("failed to create cache dir");

    let config = Config {
        library_database: base_path.join("library.sqlite3"),
        cache_dir: base_path.join("cache"),
        max_proc: 2,
        refresh_debounce_ms: 50,
        parallel_filter_threshold: 2048,
    };
    let conn = Connection::open(&config.library_database).expect("failed to open database");
    conn.execute_batch(LIBRARY_SCHEMA).expect("failed to create schema");
    (config, temp_dir)
}

pub fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().expect("invalid date")
}

pub fn key(tonic: PitchClass, mode: Mode) -> MusicalKey {
    MusicalKey::new(tonic, mode)
}

pub fn rule(field: Field, comparator: Comparator, value: Value) -> RuleNode {
    RuleNode::Rule(Rule::new(field, comparator, value))
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// genre == Jazz AND bpm in [90, 120]
pub fn jazz_90_120() -> RuleGroup {
    RuleGroup::all(vec![
        rule(Field::Genre, Comparator::Equals, text("Jazz")),
        rule(Field::Bpm, Comparator::Between, Value::Range { low: 90.0, high: 120.0 }),
    ])
}

/// Five tracks. Clair de Lune has never been analyzed, the rest have.
pub fn library_tracks() -> Vec<Track> {
    let mut so_what = Track::new(1, "/music/miles davis/kind of blue/01 so what.flac");
    so_what.title = Some("So What".to_string());
    so_what.artist = Some("Miles Davis".to_string());
    so_what.album = Some("Kind of Blue".to_string());
    so_what.genre = Some("Jazz".to_string());
    so_what.year = Some(1959);
    so_what.duration = Some(562.0);
    so_what.play_count = 12;
    so_what.rating = Some(5.0);
    so_what.date_added = Some(utc(2024, 1, 10));
    so_what.last_played = Some(utc(2024, 6, 14));
    so_what.analysis = AnalysisBundle {
        bpm: Some(136.0),
        key: Some(key(PitchClass::D, Mode::Minor)),
        energy: Some(0.41),
        danceability: Some(0.52),
    };

    let mut take_five = Track::new(2, "/music/dave brubeck/time out/03 take five.flac");
    take_five.title = Some("Take Five".to_string());
    take_five.artist = Some("Dave Brubeck".to_string());
    take_five.album = Some("Time Out".to_string());
    take_five.genre = Some("Jazz".to_string());
    take_five.year = Some(1959);
    take_five.duration = Some(324.0);
    take_five.play_count = 3;
    take_five.rating = Some(4.0);
    take_five.date_added = Some(utc(2024, 3, 2));
    take_five.analysis = AnalysisBundle {
        bpm: Some(104.0),
        key: Some(key(PitchClass::DSharp, Mode::Minor)),
        energy: Some(0.38),
        danceability: Some(0.61),
    };

    let mut blue_monday = Track::new(3, "/music/new order/power, corruption & lies/blue monday.mp3");
    blue_monday.title = Some("Blue Monday".to_string());
    blue_monday.artist = Some("New Order".to_string());
    blue_monday.genre = Some("Electronic".to_string());
    blue_monday.year = Some(1983);
    blue_monday.duration = Some(448.0);
    blue_monday.play_count = 30;
    blue_monday.date_added = Some(utc(2024, 6, 1));
    blue_monday.last_played = Some(utc(2024, 6, 15));
    blue_monday.analysis = AnalysisBundle {
        bpm: Some(130.0),
        key: Some(key(PitchClass::F, Mode::Minor)),
        energy: Some(0.88),
        danceability: Some(0.79),
    };

    let mut clair_de_lune = Track::new(4, "/music/debussy/suite bergamasque/03 clair de lune.ogg");
    clair_de_lune.title = Some("Clair de Lune".to_string());
    clair_de_lune.artist = Some("Claude Debussy".to_string());
    clair_de_lune.genre = Some("Classical".to_string());
    clair_de_lune.year = Some(1905);
    clair_de_lune.duration = Some(300.0);
    clair_de_lune.date_added = Some(utc(2023, 11, 20));

    let mut teardrop = Track::new(5, "/music/massive attack/mezzanine/03 teardrop.flac");
    teardrop.title = Some("Teardrop".to_string());
    teardrop.artist = Some("Massive Attack".to_string());
    teardrop.album = Some("Mezzanine".to_string());
    teardrop.genre = Some("Trip Hop".to_string());
    teardrop.year = Some(1998);
    teardrop.duration = Some(331.0);
    teardrop.play_count = 7;
    teardrop.rating = Some(4.5);
    teardrop.date_added = Some(utc(2024, 6, 12));
    teardrop.analysis = AnalysisBundle {
        bpm: Some(77.0),
        key: Some(key(PitchClass::A, Mode::Major)),
        energy: Some(0.45),
        danceability: Some(0.62),
    };

    vec![so_what, take_five, blue_monday, clair_de_lune, teardrop]
}

pub fn insert_track(conn: &Connection, t: &Track) {
    conn.execute(
        "INSERT OR REPLACE INTO tracks
            (id, file_path, title, artist, album, genre, year, duration, play_count, rating, date_added, date_modified, last_played, bpm, musical_key, energy, danceability)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            t.id,
            t.file_path.to_string_lossy(),
            t.title,
            t.artist,
            t.album,
            t.genre,
            t.year,
            t.duration,
            t.play_count,
            t.rating,
            t.date_added,
            t.date_modified,
            t.last_played,
            t.analysis.bpm,
            t.analysis.key.map(|k| k.to_string()),
            t.analysis.energy,
            t.analysis.danceability,
        ],
    )
    .expect("failed to insert track");
}

// Creates a test environment with a library database seeded with `library_tracks`. The files on
// disk are not real.
pub fn seeded_library() -> (Config, TempDir) {
    let (config, temp_dir) = config();
    let conn = Connection::open(&config.library_database).expect("failed to open database");
    for t in library_tracks() {
        insert_track(&conn, &t);
    }
    (config, temp_dir)
}
