/// The playlists module provides functions for interacting with smart playlists.
///
/// A smart playlist is a named rule tree plus the membership it last evaluated to. Both live in
/// the library database. Rule trees are validated before they are written, so a stored tree is
/// always evaluable.
use chrono::{DateTime, Utc};
use rayon::{ThreadPool, ThreadPoolBuilder};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, SmartlistError, SmartlistExpectedError};
use crate::library::{connect, list_tracks};
use crate::rule_parser::RuleGroup;
use crate::rules::{validate, RuleEngine};
use crate::tracks::{Track, TrackId};

#[derive(Debug, Clone, PartialEq)]
pub struct SmartPlaylist {
    pub name: String,
    pub description: String,
    pub rules: RuleGroup,
    /// Auto playlists are re-evaluated in the background whenever the library changes. Manual ones
    /// only when asked to, or when their rules change.
    pub auto_refresh: bool,
    /// Keep at most this many matches, in library order.
    pub limit: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl SmartPlaylist {
    pub fn new(name: impl Into<String>, rules: RuleGroup) -> Self {
        let now = Utc::now();
        SmartPlaylist {
            name: name.into(),
            description: String::new(),
            rules,
            auto_refresh: true,
            limit: None,
            created_at: now,
            updated_at: now,
            refreshed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn manual(mut self) -> Self {
        self.auto_refresh = false;
        self
    }

    pub fn settings(&self) -> SmartPlaylistSettings {
        SmartPlaylistSettings {
            description: self.description.clone(),
            auto_refresh: self.auto_refresh,
            limit: self.limit,
        }
    }
}

/// The editable attributes of a smart playlist, other than its name and rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartPlaylistSettings {
    pub description: String,
    pub auto_refresh: bool,
    pub limit: Option<usize>,
}

fn check_rules(name: &str, rules: &RuleGroup) -> Result<()> {
    let errors = validate(rules);
    if !errors.is_empty() {
        return Err(SmartlistExpectedError::InvalidRuleTree {
            name: name.to_string(),
            errors,
        }
        .into());
    }
    Ok(())
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SmartlistExpectedError::Generic("Smart playlist name must not be empty".to_string()).into());
    }
    Ok(())
}

fn playlist_exists(conn: &Connection, name: &str) -> Result<bool> {
    let exists: bool = conn.query_row("SELECT EXISTS(SELECT * FROM smart_playlists WHERE name = ?1)", params![name], |row| row.get(0))?;
    Ok(exists)
}

fn playlist_from_row(row: &Row) -> rusqlite::Result<(SmartPlaylist, String)> {
    let limit: Option<i64> = row.get("track_limit")?;
    let playlist = SmartPlaylist {
        name: row.get("name")?,
        description: row.get("description")?,
        rules: RuleGroup::default(),
        auto_refresh: row.get("auto_refresh")?,
        limit: limit.and_then(|l| usize::try_from(l).ok()),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        refreshed_at: row.get("refreshed_at")?,
    };
    Ok((playlist, row.get("rules")?))
}

fn decode_playlist((mut playlist, rules_json): (SmartPlaylist, String)) -> Result<SmartPlaylist> {
    playlist.rules = serde_json::from_str(&rules_json)?;
    Ok(playlist)
}

/// Persists a new smart playlist. Auto playlists are evaluated right away so that they never
/// start out empty. The playlist and its first membership are written in one transaction, so a
/// failed evaluation leaves nothing behind.
pub fn create_smart_playlist(c: &Config, playlist: &SmartPlaylist) -> Result<SmartPlaylist> {
    check_name(&playlist.name)?;
    check_rules(&playlist.name, &playlist.rules)?;

    let mut conn = connect(c)?;
    if playlist_exists(&conn, &playlist.name)? {
        return Err(SmartlistExpectedError::PlaylistAlreadyExists {
            name: playlist.name.clone(),
        }
        .into());
    }
    let membership = if playlist.auto_refresh {
        let tracks = list_tracks(c)?;
        let pool = filter_pool(c, tracks.len())?;
        evaluate_smart_playlist(&RuleEngine::new(), playlist, &tracks, pool.as_ref(), &|| false)?
    } else {
        None
    };

    let now = Utc::now();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO smart_playlists (name, description, rules, auto_refresh, track_limit, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            playlist.name,
            playlist.description,
            serde_json::to_string(&playlist.rules)?,
            playlist.auto_refresh,
            playlist.limit.map(|l| l as i64),
            now,
        ],
    )?;
    if let Some(ids) = &membership {
        write_membership(&tx, &playlist.name, ids)?;
    }
    tx.commit()?;
    match &membership {
        Some(ids) => info!("Created smart playlist {} with rules {}: {} tracks", playlist.name, playlist.rules, ids.len()),
        None => info!("Created smart playlist {} with rules {}", playlist.name, playlist.rules),
    }
    drop(conn);

    get_smart_playlist(c, &playlist.name)?.ok_or_else(|| {
        SmartlistError::from(SmartlistExpectedError::PlaylistDoesNotExist {
            name: playlist.name.clone(),
        })
    })
}

pub fn get_smart_playlist(c: &Config, name: &str) -> Result<Option<SmartPlaylist>> {
    let conn = connect(c)?;
    let row = conn
        .query_row("SELECT * FROM smart_playlists WHERE name = ?1", params![name], playlist_from_row)
        .optional()?;
    row.map(decode_playlist).transpose()
}

fn require_smart_playlist(c: &Config, name: &str) -> Result<SmartPlaylist> {
    get_smart_playlist(c, name)?.ok_or_else(|| SmartlistExpectedError::PlaylistDoesNotExist { name: name.to_string() }.into())
}

/// All smart playlists, ordered by name.
pub fn list_smart_playlists(c: &Config) -> Result<Vec<SmartPlaylist>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare("SELECT * FROM smart_playlists ORDER BY name")?;
    let rows = stmt.query_map([], playlist_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(decode_playlist).collect()
}

/// Replaces the rules of a smart playlist and re-evaluates it, whether or not it auto-refreshes.
/// Returns the new membership.
pub fn update_smart_playlist_rules(c: &Config, name: &str, rules: &RuleGroup) -> Result<Vec<TrackId>> {
    check_rules(name, rules)?;
    let conn = connect(c)?;
    let updated = conn.execute(
        "UPDATE smart_playlists SET rules = ?1, updated_at = ?2 WHERE name = ?3",
        params![serde_json::to_string(rules)?, Utc::now(), name],
    )?;
    if updated == 0 {
        return Err(SmartlistExpectedError::PlaylistDoesNotExist { name: name.to_string() }.into());
    }
    info!("Updated rules of smart playlist {} to {}", name, rules);
    drop(conn);
    refresh_smart_playlist(c, name)
}

/// Updates the description, refresh mode and limit of a smart playlist. A changed limit
/// re-evaluates the playlist.
pub fn update_smart_playlist(c: &Config, name: &str, settings: &SmartPlaylistSettings) -> Result<()> {
    let existing = require_smart_playlist(c, name)?;
    let conn = connect(c)?;
    conn.execute(
        "UPDATE smart_playlists SET description = ?1, auto_refresh = ?2, track_limit = ?3, updated_at = ?4 WHERE name = ?5",
        params![settings.description, settings.auto_refresh, settings.limit.map(|l| l as i64), Utc::now(), name],
    )?;
    info!("Updated settings of smart playlist {}: {:?}", name, settings);
    drop(conn);
    if existing.limit != settings.limit {
        refresh_smart_playlist(c, name)?;
    }
    Ok(())
}

pub fn rename_smart_playlist(c: &Config, old_name: &str, new_name: &str) -> Result<()> {
    check_name(new_name)?;
    let conn = connect(c)?;
    if !playlist_exists(&conn, old_name)? {
        return Err(SmartlistExpectedError::PlaylistDoesNotExist { name: old_name.to_string() }.into());
    }
    if playlist_exists(&conn, new_name)? {
        return Err(SmartlistExpectedError::PlaylistAlreadyExists { name: new_name.to_string() }.into());
    }
    // Membership rows follow via ON UPDATE CASCADE.
    conn.execute(
        "UPDATE smart_playlists SET name = ?1, updated_at = ?2 WHERE name = ?3",
        params![new_name, Utc::now(), old_name],
    )?;
    info!("Renamed smart playlist {} to {}", old_name, new_name);
    Ok(())
}

pub fn delete_smart_playlist(c: &Config, name: &str) -> Result<()> {
    let conn = connect(c)?;
    let deleted = conn.execute("DELETE FROM smart_playlists WHERE name = ?1", params![name])?;
    if deleted == 0 {
        return Err(SmartlistExpectedError::PlaylistDoesNotExist { name: name.to_string() }.into());
    }
    info!("Deleted smart playlist {}", name);
    Ok(())
}

/// The membership a smart playlist last evaluated to, in playlist order.
pub fn smart_playlist_track_ids(c: &Config, name: &str) -> Result<Vec<TrackId>> {
    let conn = connect(c)?;
    if !playlist_exists(&conn, name)? {
        return Err(SmartlistExpectedError::PlaylistDoesNotExist { name: name.to_string() }.into());
    }
    let mut stmt = conn.prepare("SELECT track_id FROM smart_playlists_tracks WHERE playlist_name = ?1 ORDER BY position")?;
    let ids = stmt.query_map(params![name], |row| row.get(0))?.collect::<rusqlite::Result<Vec<TrackId>>>()?;
    Ok(ids)
}

/// Overwrites the stored membership of a smart playlist and stamps its refresh time.
pub fn store_smart_playlist_tracks(c: &Config, name: &str, track_ids: &[TrackId]) -> Result<()> {
    let mut conn = connect(c)?;
    let tx = conn.transaction()?;
    write_membership(&tx, name, track_ids)?;
    tx.commit()?;
    debug!("Stored {} tracks for smart playlist {}", track_ids.len(), name);
    Ok(())
}

fn write_membership(conn: &Connection, name: &str, track_ids: &[TrackId]) -> Result<()> {
    let updated = conn.execute("UPDATE smart_playlists SET refreshed_at = ?1 WHERE name = ?2", params![Utc::now(), name])?;
    if updated == 0 {
        return Err(SmartlistExpectedError::PlaylistDoesNotExist { name: name.to_string() }.into());
    }
    conn.execute("DELETE FROM smart_playlists_tracks WHERE playlist_name = ?1", params![name])?;
    let mut stmt = conn.prepare("INSERT INTO smart_playlists_tracks (playlist_name, track_id, position) VALUES (?1, ?2, ?3)")?;
    for (position, id) in track_ids.iter().enumerate() {
        stmt.execute(params![name, id, position as i64 + 1])?;
    }
    Ok(())
}

/// A pool of `max_proc` filter threads for a library of `track_count` tracks, or None when the
/// library is small enough to filter on the calling thread. Build one per pass and share it
/// between playlists.
pub(crate) fn filter_pool(c: &Config, track_count: usize) -> Result<Option<ThreadPool>> {
    if track_count < c.parallel_filter_threshold || c.max_proc <= 1 {
        return Ok(None);
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(c.max_proc)
        .thread_name(|i| format!("smartlist-filter-{i}"))
        .build()
        .map_err(|e| SmartlistError::Generic(format!("Failed to start filter thread pool: {e}")))?;
    debug!("Started filter thread pool with {} threads", c.max_proc);
    Ok(Some(pool))
}

/// Evaluates `playlist` against the whole library, on `pool` if one is given. Returns None if
/// `is_stale` reports that the pass was superseded.
pub(crate) fn evaluate_smart_playlist(
    engine: &RuleEngine,
    playlist: &SmartPlaylist,
    tracks: &[Track],
    pool: Option<&ThreadPool>,
    is_stale: &(dyn Fn() -> bool + Sync),
) -> Result<Option<Vec<TrackId>>> {
    let matched = match pool {
        Some(pool) => {
            let matched = pool.install(|| engine.filter_parallel(&playlist.rules, tracks));
            if is_stale() {
                None
            } else {
                Some(matched)
            }
        }
        None => engine.filter_until_stale(&playlist.rules, tracks, is_stale),
    };
    Ok(matched.map(|m| apply_limit(playlist, m.into_iter().map(|t| t.id).collect())))
}

/// Incrementally updates a playlist's membership. Returns None when only a full pass gives the
/// right answer: a truncated membership cannot be patched, because a removed track may let an
/// unseen one in, and rules relative to the current time can drop tracks that never changed.
pub(crate) fn reevaluate_smart_playlist(
    engine: &RuleEngine,
    playlist: &SmartPlaylist,
    previous: &[TrackId],
    changed: &[Track],
    removed: &[TrackId],
) -> Option<Vec<TrackId>> {
    if playlist.limit.is_some() || playlist.rules.is_time_dependent() {
        return None;
    }
    Some(engine.reevaluate(&playlist.rules, previous, changed, removed))
}

fn apply_limit(playlist: &SmartPlaylist, mut ids: Vec<TrackId>) -> Vec<TrackId> {
    if let Some(limit) = playlist.limit {
        ids.truncate(limit);
    }
    ids
}

/// Fully re-evaluates one smart playlist against the library and stores the result.
pub fn refresh_smart_playlist(c: &Config, name: &str) -> Result<Vec<TrackId>> {
    let playlist = require_smart_playlist(c, name)?;
    let tracks = list_tracks(c)?;
    let pool = filter_pool(c, tracks.len())?;
    let ids = evaluate_smart_playlist(&RuleEngine::new(), &playlist, &tracks, pool.as_ref(), &|| false)?.unwrap_or_default();
    store_smart_playlist_tracks(c, name, &ids)?;
    info!("Refreshed smart playlist {}: {} tracks", name, ids.len());
    Ok(ids)
}

/// Fully re-evaluates every auto-refreshing smart playlist. The library is loaded once. Returns
/// the new membership of each refreshed playlist.
pub fn refresh_auto_smart_playlists(c: &Config) -> Result<Vec<(String, Vec<TrackId>)>> {
    let playlists: Vec<SmartPlaylist> = list_smart_playlists(c)?.into_iter().filter(|p| p.auto_refresh).collect();
    if playlists.is_empty() {
        return Ok(vec![]);
    }
    let tracks = list_tracks(c)?;
    let pool = filter_pool(c, tracks.len())?;
    let engine = RuleEngine::new();
    let mut results = Vec::with_capacity(playlists.len());
    for playlist in playlists {
        let ids = evaluate_smart_playlist(&engine, &playlist, &tracks, pool.as_ref(), &|| false)?.unwrap_or_default();
        store_smart_playlist_tracks(c, &playlist.name, &ids)?;
        info!("Refreshed smart playlist {}: {} tracks", playlist.name, ids.len());
        results.push((playlist.name, ids));
    }
    Ok(results)
}
