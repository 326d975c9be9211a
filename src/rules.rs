// The rules module implements the Rule Engine, which decides smart playlist membership.
//
// The engine evaluates a rule tree against read-only track snapshots. It runs in three flavors:
//
// 1. Single track evaluation, with errors either surfaced (`try_evaluate`) or degraded to a
//    non-match with a logged warning (`evaluate`).
// 2. Filtering a track sequence, sequentially or across the rayon pool. Both keep input order.
// 3. Incremental re-evaluation of a previous match set after some tracks changed.
//
// Rule trees are validated before they are persisted; see `validate`.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::keys::MusicalKey;
use crate::rule_parser::{expected_value_shape, Comparator, Field, FieldKind, LogicalOperator, Rule, RuleGroup, RuleNode, Value, ValueShape};
use crate::tracks::{Track, TrackId};

/// Rule trees nested deeper than this are rejected by validation and by evaluation.
pub const MAX_RULE_DEPTH: usize = 32;

/// How many tracks are evaluated between two staleness checks in `filter_until_stale`.
const STALENESS_CHECK_INTERVAL: usize = 256;

const NUMBER_EPSILON: f64 = 1e-9;

/// Location of a node in a rule tree: the child index at each level, starting from the root group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodePath(pub Vec<usize>);

impl NodePath {
    fn child(&self, idx: usize) -> NodePath {
        let mut path = self.0.clone();
        path.push(idx);
        NodePath(path)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root")?;
        for idx in &self.0 {
            write!(f, "/{idx}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationErrorKind {
    #[error("comparator {comparator} is not supported for {kind} field {field}")]
    UnsupportedComparator { field: Field, kind: FieldKind, comparator: Comparator },
    #[error("comparator {comparator} on field {field} requires a {expected} value, got {found}")]
    ValueMismatch {
        field: Field,
        comparator: Comparator,
        expected: ValueShape,
        found: ValueShape,
    },
    #[error("range for field {field} is inverted: {low} is greater than {high}")]
    InvertedRange { field: Field, low: String, high: String },
    #[error("value for field {field} is not a finite number")]
    NonFiniteNumber { field: Field },
    #[error("rule groups are nested deeper than {max_depth} levels")]
    TooDeep { max_depth: usize },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} (at {path})")]
pub struct ValidationError {
    pub path: NodePath,
    pub kind: ValidationErrorKind,
}

/// Raised when a rule that slipped past validation cannot be evaluated against a track.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("comparator {comparator} is not supported for field {field}")]
    UnsupportedComparator { field: Field, comparator: Comparator },
    #[error("comparator {comparator} on field {field} cannot compare against a {found} value")]
    ValueMismatch { field: Field, comparator: Comparator, found: ValueShape },
    #[error("rule groups are nested deeper than {max_depth} levels")]
    DepthExceeded { max_depth: usize },
}

/// A typed view of one track attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Number(f64),
    Date(DateTime<Utc>),
    Key(MusicalKey),
}

/// Reads `field` off `track`. Returns None when the track has no value for it, e.g. an untagged
/// album or a track that has not been analyzed.
pub fn field_value(track: &Track, field: Field) -> Option<FieldValue<'_>> {
    match field {
        Field::Title => track.title.as_deref().map(FieldValue::Text),
        Field::Artist => track.artist.as_deref().map(FieldValue::Text),
        Field::Album => track.album.as_deref().map(FieldValue::Text),
        Field::Genre => track.genre.as_deref().map(FieldValue::Text),
        Field::FilePath => track.file_path.to_str().map(FieldValue::Text),
        Field::Year => track.year.map(|y| FieldValue::Number(f64::from(y))),
        Field::Duration => track.duration.map(FieldValue::Number),
        Field::PlayCount => Some(FieldValue::Number(f64::from(track.play_count))),
        Field::Rating => track.rating.map(FieldValue::Number),
        Field::Bpm => track.analysis.bpm.map(FieldValue::Number),
        Field::Energy => track.analysis.energy.map(FieldValue::Number),
        Field::Danceability => track.analysis.danceability.map(FieldValue::Number),
        Field::Key => track.analysis.key.map(FieldValue::Key),
        Field::DateAdded => track.date_added.map(FieldValue::Date),
        Field::DateModified => track.date_modified.map(FieldValue::Date),
        Field::LastPlayed => track.last_played.map(FieldValue::Date),
    }
}

/// Evaluates rule trees. The engine pins "now" so that relative date rules (`this_week`,
/// `in_last_days`, ...) give the same answer for every track of a pass.
#[derive(Debug, Clone, Copy)]
pub struct RuleEngine {
    now: DateTime<Utc>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        RuleEngine::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        RuleEngine { now: Utc::now() }
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        RuleEngine { now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Evaluates `node` against `track`. Evaluation errors degrade to a non-match and are logged.
    pub fn evaluate(&self, node: &RuleNode, track: &Track) -> bool {
        self.try_evaluate(node, track).unwrap_or_else(|e| {
            warn!("Failed to evaluate rules against track {} ({}), treating it as a non-match: {}", track.id, track.logtext(), e);
            false
        })
    }

    pub fn try_evaluate(&self, node: &RuleNode, track: &Track) -> Result<bool, EvaluationError> {
        self.evaluate_node(node, track, 0)
    }

    /// Whether `track` belongs to the smart playlist whose root group is `root`.
    pub fn matches(&self, root: &RuleGroup, track: &Track) -> bool {
        self.try_matches(root, track).unwrap_or_else(|e| {
            warn!("Failed to evaluate rules against track {} ({}), treating it as a non-match: {}", track.id, track.logtext(), e);
            false
        })
    }

    pub fn try_matches(&self, root: &RuleGroup, track: &Track) -> Result<bool, EvaluationError> {
        self.evaluate_group(root, track, 0)
    }

    /// Returns the tracks matching `root`, in their original relative order.
    pub fn filter<'a>(&self, root: &RuleGroup, tracks: &'a [Track]) -> Vec<&'a Track> {
        let matched: Vec<&Track> = tracks.iter().filter(|t| self.matches(root, t)).collect();
        debug!("Filtered {} tracks down to {} matches", tracks.len(), matched.len());
        matched
    }

    /// Same result as `filter`, but evaluates tracks across the current rayon pool.
    pub fn filter_parallel<'a>(&self, root: &RuleGroup, tracks: &'a [Track]) -> Vec<&'a Track> {
        let matched: Vec<&Track> = tracks.par_iter().filter(|t| self.matches(root, t)).collect();
        debug!("Filtered {} tracks down to {} matches in parallel", tracks.len(), matched.len());
        matched
    }

    /// Like `filter`, but gives up and returns None as soon as `is_stale` reports that a newer
    /// request superseded this one.
    pub fn filter_until_stale<'a>(&self, root: &RuleGroup, tracks: &'a [Track], is_stale: &dyn Fn() -> bool) -> Option<Vec<&'a Track>> {
        let mut matched = Vec::new();
        for (i, track) in tracks.iter().enumerate() {
            if i % STALENESS_CHECK_INTERVAL == 0 && is_stale() {
                debug!("Abandoning stale filter pass after {} of {} tracks", i, tracks.len());
                return None;
            }
            if self.matches(root, track) {
                matched.push(track);
            }
        }
        Some(matched)
    }

    /// Ids of the tracks matching `root`, in their original relative order.
    pub fn matching_ids(&self, root: &RuleGroup, tracks: &[Track]) -> Vec<TrackId> {
        self.filter(root, tracks).into_iter().map(|t| t.id).collect()
    }

    /// Incrementally updates a previous match set. `changed` holds fresh snapshots of every track
    /// that was imported or edited since `previous` was computed, and `removed` the ids of deleted
    /// tracks. The result is ordered by track id, which is the library's canonical order.
    ///
    /// Unchanged tracks keep their previous result, so this only equals a full filter when the
    /// tree is not time dependent (see `RuleGroup::is_time_dependent`) and `previous` was computed
    /// by an engine with the same `now`.
    pub fn reevaluate(&self, root: &RuleGroup, previous: &[TrackId], changed: &[Track], removed: &[TrackId]) -> Vec<TrackId> {
        let removed: HashSet<TrackId> = removed.iter().copied().collect();
        let touched: HashSet<TrackId> = changed.iter().map(|t| t.id).chain(removed.iter().copied()).collect();

        let mut ids: Vec<TrackId> = previous.iter().copied().filter(|id| !touched.contains(id)).collect();
        ids.extend(changed.iter().filter(|t| !removed.contains(&t.id) && self.matches(root, t)).map(|t| t.id));
        ids.sort_unstable();
        ids.dedup();

        debug!(
            "Re-evaluated {} changed and {} removed tracks: {} -> {} matches",
            changed.len(),
            removed.len(),
            previous.len(),
            ids.len()
        );
        ids
    }

    fn evaluate_node(&self, node: &RuleNode, track: &Track, depth: usize) -> Result<bool, EvaluationError> {
        match node {
            RuleNode::Rule(rule) => self.evaluate_rule(rule, track),
            RuleNode::Group(group) => self.evaluate_group(group, track, depth),
        }
    }

    fn evaluate_group(&self, group: &RuleGroup, track: &Track, depth: usize) -> Result<bool, EvaluationError> {
        if depth >= MAX_RULE_DEPTH {
            return Err(EvaluationError::DepthExceeded { max_depth: MAX_RULE_DEPTH });
        }
        let mut children = group.children.iter().filter(|c| !matches!(c, RuleNode::Rule(r) if !r.enabled));
        let result = match group.operator {
            LogicalOperator::And => {
                let mut all = true;
                for child in children.by_ref() {
                    if !self.evaluate_node(child, track, depth + 1)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            LogicalOperator::Or => {
                let mut any = false;
                for child in children.by_ref() {
                    if self.evaluate_node(child, track, depth + 1)? {
                        any = true;
                        break;
                    }
                }
                any
            }
        };
        Ok(result != group.negate)
    }

    fn evaluate_rule(&self, rule: &Rule, track: &Track) -> Result<bool, EvaluationError> {
        let expected = expected_value_shape(rule.field.kind(), rule.comparator).ok_or(EvaluationError::UnsupportedComparator {
            field: rule.field,
            comparator: rule.comparator,
        })?;
        let mismatch = || EvaluationError::ValueMismatch {
            field: rule.field,
            comparator: rule.comparator,
            found: rule.value.shape(),
        };
        if rule.value.shape() != expected {
            return Err(mismatch());
        }

        // Missing and unanalyzed fields never match.
        let Some(actual) = field_value(track, rule.field) else {
            return Ok(false);
        };

        match actual {
            FieldValue::Text(actual) => match &rule.value {
                Value::Text(needle) => Ok(compare_text(actual, rule.comparator, needle)),
                _ => Err(mismatch()),
            },
            FieldValue::Number(actual) => compare_number(actual, rule.comparator, &rule.value).ok_or_else(mismatch),
            FieldValue::Date(actual) => self.compare_date(actual, rule.comparator, &rule.value).ok_or_else(mismatch),
            FieldValue::Key(actual) => compare_key(&actual, rule.comparator, &rule.value).ok_or_else(mismatch),
        }
    }

    fn compare_date(&self, actual: DateTime<Utc>, comparator: Comparator, value: &Value) -> Option<bool> {
        let day = actual.date_naive();
        let today = self.now.date_naive();
        let result = match (comparator, value) {
            (Comparator::Equals, Value::Date(d)) => day == *d,
            (Comparator::Before, Value::Date(d)) => day < *d,
            (Comparator::After, Value::Date(d)) => day > *d,
            (Comparator::Between, Value::DateRange { start, end }) => *start <= day && day <= *end,
            (Comparator::InLastDays, Value::Days(n)) => {
                // A window reaching past the earliest representable date covers everything.
                let start = self.now.checked_sub_signed(Duration::days(i64::from(*n)));
                start.map_or(true, |start| actual >= start) && actual <= self.now
            }
            (Comparator::ThisWeek, Value::None) => day.iso_week() == today.iso_week(),
            (Comparator::ThisMonth, Value::None) => same_month(day, today),
            (Comparator::ThisYear, Value::None) => day.year() == today.year(),
            _ => return None,
        };
        Some(result)
    }
}

fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

/// Text comparisons are case-insensitive.
fn compare_text(actual: &str, comparator: Comparator, needle: &str) -> bool {
    let actual = actual.to_lowercase();
    let needle = needle.to_lowercase();
    match comparator {
        Comparator::Equals => actual == needle,
        Comparator::NotEquals => actual != needle,
        Comparator::Contains => actual.contains(&needle),
        Comparator::NotContains => !actual.contains(&needle),
        Comparator::StartsWith => actual.starts_with(&needle),
        Comparator::EndsWith => actual.ends_with(&needle),
        _ => false,
    }
}

fn compare_number(actual: f64, comparator: Comparator, value: &Value) -> Option<bool> {
    let result = match (comparator, value) {
        (Comparator::Equals, Value::Number(n)) => (actual - n).abs() < NUMBER_EPSILON,
        (Comparator::NotEquals, Value::Number(n)) => (actual - n).abs() >= NUMBER_EPSILON,
        (Comparator::Greater, Value::Number(n)) => actual > *n,
        (Comparator::GreaterEqual, Value::Number(n)) => actual >= *n,
        (Comparator::Less, Value::Number(n)) => actual < *n,
        (Comparator::LessEqual, Value::Number(n)) => actual <= *n,
        // An inverted range can never hold, so it matches nothing.
        (Comparator::Between, Value::Range { low, high }) => *low <= actual && actual <= *high,
        _ => return None,
    };
    Some(result)
}

fn compare_key(actual: &MusicalKey, comparator: Comparator, value: &Value) -> Option<bool> {
    let result = match (comparator, value) {
        (Comparator::Equals, Value::Key(k)) => actual == k,
        (Comparator::NotEquals, Value::Key(k)) => actual != k,
        (Comparator::CompatibleWith, Value::KeyDistance { key, max_distance }) => actual.is_compatible_with(key, *max_distance),
        _ => return None,
    };
    Some(result)
}

/// Checks that every rule in the tree can be evaluated: comparators are supported by their
/// fields, values have the shape their comparator expects, numbers are finite, ranges are not
/// inverted, and the tree is not nested too deeply. An empty result means the tree is valid.
pub fn validate(root: &RuleGroup) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_group(root, &NodePath::default(), 0, &mut errors);
    if !errors.is_empty() {
        debug!("Rule tree {} has {} validation errors", root, errors.len());
    }
    errors
}

fn validate_group(group: &RuleGroup, path: &NodePath, depth: usize, errors: &mut Vec<ValidationError>) {
    if depth >= MAX_RULE_DEPTH {
        errors.push(ValidationError {
            path: path.clone(),
            kind: ValidationErrorKind::TooDeep { max_depth: MAX_RULE_DEPTH },
        });
        return;
    }
    for (idx, child) in group.children.iter().enumerate() {
        let child_path = path.child(idx);
        match child {
            RuleNode::Rule(rule) => {
                if let Some(kind) = validate_rule(rule) {
                    errors.push(ValidationError { path: child_path, kind });
                }
            }
            RuleNode::Group(g) => validate_group(g, &child_path, depth + 1, errors),
        }
    }
}

fn validate_rule(rule: &Rule) -> Option<ValidationErrorKind> {
    let kind = rule.field.kind();
    let Some(expected) = expected_value_shape(kind, rule.comparator) else {
        return Some(ValidationErrorKind::UnsupportedComparator {
            field: rule.field,
            kind,
            comparator: rule.comparator,
        });
    };
    let found = rule.value.shape();
    if found != expected {
        return Some(ValidationErrorKind::ValueMismatch {
            field: rule.field,
            comparator: rule.comparator,
            expected,
            found,
        });
    }
    match &rule.value {
        Value::Number(n) if !n.is_finite() => Some(ValidationErrorKind::NonFiniteNumber { field: rule.field }),
        Value::Range { low, high } if !low.is_finite() || !high.is_finite() => Some(ValidationErrorKind::NonFiniteNumber { field: rule.field }),
        Value::Range { low, high } if low > high => Some(ValidationErrorKind::InvertedRange {
            field: rule.field,
            low: low.to_string(),
            high: high.to_string(),
        }),
        Value::DateRange { start, end } if start > end => Some(ValidationErrorKind::InvertedRange {
            field: rule.field,
            low: start.to_string(),
            high: end.to_string(),
        }),
        _ => None,
    }
}
