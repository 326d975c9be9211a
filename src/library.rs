/// The library module is the read side of the library repository: it opens the library SQLite
/// database and loads track snapshots for the rule engine.
///
/// The importer owns the track rows. We never write them outside of tests; the only tables this
/// crate writes are the smart playlist tables, see the playlists module.
use rusqlite::types::FromSql;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::keys::MusicalKey;
use crate::tracks::{AnalysisBundle, Track, TrackId};

pub(crate) static LIBRARY_SCHEMA: &str = include_str!("library.sql");

const TRACK_COLUMNS: &str = "
    id, file_path, title, artist, album, genre, year, duration, play_count, rating
  , date_added, date_modified, last_played, bpm, musical_key, energy, danceability
";

pub fn connect(c: &Config) -> Result<Connection> {
    let conn = Connection::open(&c.library_database)?;
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        PRAGMA busy_timeout = 15000;
        ",
    )?;
    Ok(conn)
}

/// Creates any missing tables. Existing tables are left alone: migrating them is the importer's
/// job.
pub fn initialize_database(c: &Config) -> Result<()> {
    let conn = connect(c)?;
    conn.execute_batch(LIBRARY_SCHEMA)?;
    debug!("Initialized library database at {}", c.library_database.display());
    Ok(())
}

/// Reads an optional column. A value that does not convert is logged and treated as missing, so
/// one corrupt row cannot fail a whole library load.
fn lenient<T: FromSql>(row: &Row, id: TrackId, column: &str) -> Option<T> {
    match row.get::<_, Option<T>>(column) {
        Ok(v) => v,
        Err(e) => {
            warn!("Ignoring unreadable {} on track {}: {}", column, id, e);
            None
        }
    }
}

fn track_from_row(row: &Row) -> rusqlite::Result<Track> {
    let id: TrackId = row.get("id")?;
    let raw_key: Option<String> = lenient(row, id, "musical_key");
    let key = raw_key.and_then(|raw| match raw.parse::<MusicalKey>() {
        Ok(k) => Some(k),
        Err(e) => {
            warn!("Ignoring unparseable musical key {:?} on track {}: {}", raw, id, e);
            None
        }
    });
    let file_path: String = row.get("file_path")?;
    let play_count: i64 = lenient(row, id, "play_count").unwrap_or(0);
    Ok(Track {
        id,
        file_path: file_path.into(),
        title: lenient(row, id, "title"),
        artist: lenient(row, id, "artist"),
        album: lenient(row, id, "album"),
        genre: lenient(row, id, "genre"),
        year: lenient(row, id, "year"),
        duration: lenient(row, id, "duration"),
        play_count: u32::try_from(play_count).unwrap_or(0),
        rating: lenient(row, id, "rating"),
        date_added: lenient(row, id, "date_added"),
        date_modified: lenient(row, id, "date_modified"),
        last_played: lenient(row, id, "last_played"),
        analysis: AnalysisBundle {
            bpm: lenient(row, id, "bpm"),
            key,
            energy: lenient(row, id, "energy"),
            danceability: lenient(row, id, "danceability"),
        },
    })
}

/// Every track in the library, in the library's canonical order (ascending id).
pub fn list_tracks(c: &Config) -> Result<Vec<Track>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare(&format!("SELECT {TRACK_COLUMNS} FROM tracks ORDER BY id"))?;
    let tracks = stmt.query_map([], track_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
    debug!("Loaded {} tracks from the library", tracks.len());
    Ok(tracks)
}

pub fn get_track(c: &Config, id: TrackId) -> Result<Option<Track>> {
    let conn = connect(c)?;
    let track = conn
        .query_row(&format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?1"), params![id], track_from_row)
        .optional()?;
    Ok(track)
}

/// Fetches the tracks with the given ids, ordered by id. Ids that no longer exist are skipped, so
/// callers can diff the result against the request to find deleted tracks.
pub fn list_tracks_by_id(c: &Config, ids: &[TrackId]) -> Result<Vec<Track>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let conn = connect(c)?;
    let placeholders = vec!["?"; ids.len()].join(",");
    let mut stmt = conn.prepare(&format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id IN ({placeholders}) ORDER BY id"))?;
    let tracks = stmt
        .query_map(rusqlite::params_from_iter(ids.iter()), track_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tracks)
}
