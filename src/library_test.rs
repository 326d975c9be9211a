use rusqlite::Connection;

use crate::keys::{Mode, MusicalKey, PitchClass};
use crate::library::*;
use crate::testing;

#[test]
fn test_list_tracks_roundtrip() {
    let (config, _tmp) = testing::seeded_library();
    let tracks = list_tracks(&config).unwrap();
    assert_eq!(tracks, testing::library_tracks());
}

#[test]
fn test_list_tracks_ordered_by_id() {
    let (config, _tmp) = testing::config();
    let conn = Connection::open(&config.library_database).unwrap();
    let mut reversed = testing::library_tracks();
    reversed.reverse();
    for t in &reversed {
        testing::insert_track(&conn, t);
    }
    let ids: Vec<i64> = list_tracks(&config).unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_get_track() {
    let (config, _tmp) = testing::seeded_library();
    let track = get_track(&config, 2).unwrap().unwrap();
    assert_eq!(track.title.as_deref(), Some("Take Five"));
    assert_eq!(track.analysis.key, Some(MusicalKey::new(PitchClass::DSharp, Mode::Minor)));
    assert!(get_track(&config, 99).unwrap().is_none());
}

#[test]
fn test_unanalyzed_track_has_empty_bundle() {
    let (config, _tmp) = testing::seeded_library();
    let track = get_track(&config, 4).unwrap().unwrap();
    assert!(track.analysis.is_empty());
    assert_eq!(track.logtext(), "Claude Debussy - Clair de Lune");
}

#[test]
fn test_invalid_stored_key_is_ignored() {
    let (config, _tmp) = testing::seeded_library();
    let conn = connect(&config).unwrap();
    conn.execute("UPDATE tracks SET musical_key = 'X lydian' WHERE id = 1", []).unwrap();
    let track = get_track(&config, 1).unwrap().unwrap();
    assert_eq!(track.analysis.key, None);
    assert_eq!(track.analysis.bpm, Some(136.0));
}

#[test]
fn test_list_tracks_by_id() {
    let (config, _tmp) = testing::seeded_library();
    let ids: Vec<i64> = list_tracks_by_id(&config, &[5, 99, 1]).unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 5]);
    assert!(list_tracks_by_id(&config, &[]).unwrap().is_empty());
}

#[test]
fn test_initialize_database_is_idempotent() {
    let (config, _tmp) = testing::seeded_library();
    initialize_database(&config).unwrap();
    initialize_database(&config).unwrap();
    assert_eq!(list_tracks(&config).unwrap().len(), 5);
}

#[test]
fn test_corrupt_columns_are_ignored() {
    let (config, _tmp) = testing::seeded_library();
    let conn = connect(&config).unwrap();
    conn.execute("UPDATE tracks SET date_added = 'not a date', bpm = 'fast', year = 'unknown' WHERE id = 1", []).unwrap();

    let tracks = list_tracks(&config).unwrap();
    assert_eq!(tracks.len(), 5);
    let so_what = &tracks[0];
    assert_eq!(so_what.date_added, None);
    assert_eq!(so_what.analysis.bpm, None);
    assert_eq!(so_what.year, None);
    assert_eq!(so_what.genre.as_deref(), Some("Jazz"));
    assert_eq!(so_what.analysis.key, Some(MusicalKey::new(PitchClass::D, Mode::Minor)));
    assert_eq!(tracks[1].analysis.bpm, Some(104.0));
}
