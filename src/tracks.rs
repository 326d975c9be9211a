/// The tracks module holds the track records that the rule engine evaluates. Tracks are owned by the
/// library repository; the engine only ever sees read-only snapshots of them.
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::MusicalKey;

pub type TrackId = i64;

/// Derived audio features. Every feature is optional: it is only populated once the external
/// analyzer has run on the track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBundle {
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default)]
    pub key: Option<MusicalKey>,
    #[serde(default)]
    pub energy: Option<f64>,
    #[serde(default)]
    pub danceability: Option<f64>,
}

impl AnalysisBundle {
    pub fn is_empty(&self) -> bool {
        self.bpm.is_none() && self.key.is_none() && self.energy.is_none() && self.danceability.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub file_path: PathBuf,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
    /// Seconds.
    pub duration: Option<f64>,
    #[serde(default)]
    pub play_count: u32,
    /// Average rating on a 0-5 scale, if the track was ever rated.
    pub rating: Option<f64>,
    pub date_added: Option<DateTime<Utc>>,
    pub date_modified: Option<DateTime<Utc>>,
    pub last_played: Option<DateTime<Utc>>,
    #[serde(default)]
    pub analysis: AnalysisBundle,
}

impl Track {
    /// A track with only the mandatory attributes set. Mostly useful for building fixtures.
    pub fn new(id: TrackId, file_path: impl Into<PathBuf>) -> Self {
        Track {
            id,
            file_path: file_path.into(),
            title: None,
            artist: None,
            album: None,
            genre: None,
            year: None,
            duration: None,
            play_count: 0,
            rating: None,
            date_added: None,
            date_modified: None,
            last_played: None,
            analysis: AnalysisBundle::default(),
        }
    }

    /// "Artist - Title" for log lines, falling back to the file path for untagged tracks.
    pub fn logtext(&self) -> String {
        match (&self.artist, &self.title) {
            (Some(artist), Some(title)) => format!("{artist} - {title}"),
            (None, Some(title)) => title.clone(),
            _ => self.file_path.display().to_string(),
        }
    }
}
