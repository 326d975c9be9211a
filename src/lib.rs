pub mod common;
pub mod config;
pub mod error;
pub mod keys;
pub mod library;
pub mod playlists;
pub mod refresh;
pub mod rule_parser;
pub mod rules;
pub mod tracks;

pub use config::Config;
pub use error::{Result, SmartlistError, SmartlistExpectedError};
pub use keys::{compatible_keys, Mode, MusicalKey, PitchClass};
pub use playlists::{SmartPlaylist, SmartPlaylistSettings};
pub use refresh::{LibraryEvent, RefreshScheduler, RefreshSink};
pub use rule_parser::{Comparator, Field, FieldKind, LogicalOperator, Rule, RuleGroup, RuleNode, RuleSyntaxError, Value};
pub use rules::{validate, EvaluationError, FieldValue, RuleEngine, ValidationError, ValidationErrorKind, MAX_RULE_DEPTH};
pub use tracks::{AnalysisBundle, Track, TrackId};

#[cfg(test)]
mod testing;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod keys_test;
#[cfg(test)]
mod library_test;
