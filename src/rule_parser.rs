use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::SmartlistExpectedError;
use crate::keys::MusicalKey;

/// The rule_parser module defines the smart playlist rule tree and a parser for the compact textual
/// form of a single rule: `field:comparator[:value]`.
///
/// Examples: `genre:equals:Jazz`, `bpm:between:90,120`, `date_added:this_month`,
/// `key:compatible_with:A minor,2`. A literal colon inside a value is written as `::`.
///
/// This is split out from the rules engine so that the playlists and config modules can depend on
/// the data model without pulling in evaluation.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSyntaxError {
    rule_name: String,
    rule: String,
    index: usize,
    feedback: String,
}

impl fmt::Display for RuleSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to parse {}, invalid syntax:\n\n    {}\n    {}^\n    {}{}",
            self.rule_name,
            self.rule,
            " ".repeat(self.index),
            " ".repeat(self.index),
            self.feedback
        )
    }
}

impl std::error::Error for RuleSyntaxError {}

impl From<RuleSyntaxError> for SmartlistExpectedError {
    fn from(err: RuleSyntaxError) -> Self {
        SmartlistExpectedError::InvalidRuleSyntax(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Artist,
    Album,
    Genre,
    FilePath,
    Year,
    Duration,
    PlayCount,
    Rating,
    Bpm,
    Energy,
    Danceability,
    Key,
    DateAdded,
    DateModified,
    LastPlayed,
}

pub const ALL_FIELDS: [Field; 16] = [
    Field::Title,
    Field::Artist,
    Field::Album,
    Field::Genre,
    Field::FilePath,
    Field::Year,
    Field::Duration,
    Field::PlayCount,
    Field::Rating,
    Field::Bpm,
    Field::Energy,
    Field::Danceability,
    Field::Key,
    Field::DateAdded,
    Field::DateModified,
    Field::LastPlayed,
];

/// The value type behind a field. Decides which comparators a field supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Text,
    Number,
    Date,
    Key,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Date => "date",
            FieldKind::Key => "key",
        };
        write!(f, "{s}")
    }
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Artist => "artist",
            Field::Album => "album",
            Field::Genre => "genre",
            Field::FilePath => "file_path",
            Field::Year => "year",
            Field::Duration => "duration",
            Field::PlayCount => "play_count",
            Field::Rating => "rating",
            Field::Bpm => "bpm",
            Field::Energy => "energy",
            Field::Danceability => "danceability",
            Field::Key => "key",
            Field::DateAdded => "date_added",
            Field::DateModified => "date_modified",
            Field::LastPlayed => "last_played",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Title | Field::Artist | Field::Album | Field::Genre | Field::FilePath => FieldKind::Text,
            Field::Year
            | Field::Duration
            | Field::PlayCount
            | Field::Rating
            | Field::Bpm
            | Field::Energy
            | Field::Danceability => FieldKind::Number,
            Field::Key => FieldKind::Key,
            Field::DateAdded | Field::DateModified | Field::LastPlayed => FieldKind::Date,
        }
    }

    /// Whether the field comes from the analysis bundle, and is therefore absent on tracks that
    /// have not been analyzed yet.
    pub fn is_analysis(&self) -> bool {
        matches!(self, Field::Bpm | Field::Energy | Field::Danceability | Field::Key)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Field {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_FIELDS.iter().find(|f| f.as_str() == s).copied().ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Between,
    Before,
    After,
    InLastDays,
    ThisWeek,
    ThisMonth,
    ThisYear,
    CompatibleWith,
}

pub const ALL_COMPARATORS: [Comparator; 18] = [
    Comparator::Equals,
    Comparator::NotEquals,
    Comparator::Contains,
    Comparator::NotContains,
    Comparator::StartsWith,
    Comparator::EndsWith,
    Comparator::Greater,
    Comparator::GreaterEqual,
    Comparator::Less,
    Comparator::LessEqual,
    Comparator::Between,
    Comparator::Before,
    Comparator::After,
    Comparator::InLastDays,
    Comparator::ThisWeek,
    Comparator::ThisMonth,
    Comparator::ThisYear,
    Comparator::CompatibleWith,
];

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Equals => "equals",
            Comparator::NotEquals => "not_equals",
            Comparator::Contains => "contains",
            Comparator::NotContains => "not_contains",
            Comparator::StartsWith => "starts_with",
            Comparator::EndsWith => "ends_with",
            Comparator::Greater => "greater",
            Comparator::GreaterEqual => "greater_equal",
            Comparator::Less => "less",
            Comparator::LessEqual => "less_equal",
            Comparator::Between => "between",
            Comparator::Before => "before",
            Comparator::After => "after",
            Comparator::InLastDays => "in_last_days",
            Comparator::ThisWeek => "this_week",
            Comparator::ThisMonth => "this_month",
            Comparator::ThisYear => "this_year",
            Comparator::CompatibleWith => "compatible_with",
        }
    }

    /// Whether the comparator is relative to the evaluation time.
    pub fn is_relative(&self) -> bool {
        matches!(self, Comparator::InLastDays | Comparator::ThisWeek | Comparator::ThisMonth | Comparator::ThisYear)
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Comparator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_COMPARATORS.iter().find(|c| c.as_str() == s).copied().ok_or(())
    }
}

/// The shape of value a comparator expects. Used by both the parser and the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueShape {
    None,
    Text,
    Number,
    Range,
    Date,
    DateRange,
    Days,
    Key,
    KeyDistance,
}

impl fmt::Display for ValueShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueShape::None => "no value",
            ValueShape::Text => "text",
            ValueShape::Number => "number",
            ValueShape::Range => "numeric range",
            ValueShape::Date => "date",
            ValueShape::DateRange => "date range",
            ValueShape::Days => "number of days",
            ValueShape::Key => "musical key",
            ValueShape::KeyDistance => "musical key with distance",
        };
        write!(f, "{s}")
    }
}

/// The value shape that `comparator` expects on a field of `kind`, or None if the comparator is not
/// supported on that kind of field.
pub fn expected_value_shape(kind: FieldKind, comparator: Comparator) -> Option<ValueShape> {
    use Comparator::*;
    match (kind, comparator) {
        (FieldKind::Text, Equals | NotEquals | Contains | NotContains | StartsWith | EndsWith) => Some(ValueShape::Text),
        (FieldKind::Number, Equals | NotEquals | Greater | GreaterEqual | Less | LessEqual) => Some(ValueShape::Number),
        (FieldKind::Number, Between) => Some(ValueShape::Range),
        (FieldKind::Date, Equals | Before | After) => Some(ValueShape::Date),
        (FieldKind::Date, Between) => Some(ValueShape::DateRange),
        (FieldKind::Date, InLastDays) => Some(ValueShape::Days),
        (FieldKind::Date, ThisWeek | ThisMonth | ThisYear) => Some(ValueShape::None),
        (FieldKind::Key, Equals | NotEquals) => Some(ValueShape::Key),
        (FieldKind::Key, CompatibleWith) => Some(ValueShape::KeyDistance),
        _ => None,
    }
}

pub fn supported_comparators(kind: FieldKind) -> Vec<Comparator> {
    ALL_COMPARATORS.iter().copied().filter(|c| expected_value_shape(kind, *c).is_some()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    None,
    Text(String),
    Number(f64),
    /// Inclusive on both ends.
    Range { low: f64, high: f64 },
    Date(NaiveDate),
    /// Inclusive on both ends.
    DateRange { start: NaiveDate, end: NaiveDate },
    Days(u32),
    Key(MusicalKey),
    KeyDistance { key: MusicalKey, max_distance: u8 },
}

impl Value {
    pub fn shape(&self) -> ValueShape {
        match self {
            Value::None => ValueShape::None,
            Value::Text(_) => ValueShape::Text,
            Value::Number(_) => ValueShape::Number,
            Value::Range { .. } => ValueShape::Range,
            Value::Date(_) => ValueShape::Date,
            Value::DateRange { .. } => ValueShape::DateRange,
            Value::Days(_) => ValueShape::Days,
            Value::Key(_) => ValueShape::Key,
            Value::KeyDistance { .. } => ValueShape::KeyDistance,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Text(s) => write!(f, "{s}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Range { low, high } => write!(f, "{low},{high}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateRange { start, end } => write!(f, "{},{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d")),
            Value::Days(n) => write!(f, "{n}"),
            Value::Key(k) => write!(f, "{k}"),
            Value::KeyDistance { key, max_distance } => write!(f, "{key},{max_distance}"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A leaf condition of a smart playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub field: Field,
    pub comparator: Comparator,
    #[serde(default = "default_value_none")]
    pub value: Value,
    /// Disabled rules are skipped by their parent group, as if they were not there.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_value_none() -> Value {
    Value::None
}

impl Rule {
    pub fn new(field: Field, comparator: Comparator, value: Value) -> Self {
        Rule {
            field,
            comparator,
            value,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn parse(raw: &str) -> Result<Rule, RuleSyntaxError> {
        Self::parse_with_name(raw, "rule")
    }

    pub fn parse_with_name(raw: &str, rule_name: &str) -> Result<Rule, RuleSyntaxError> {
        let error = |byte_idx: usize, feedback: String| RuleSyntaxError {
            rule_name: rule_name.to_string(),
            rule: raw.to_string(),
            index: raw[..byte_idx.min(raw.len())].chars().count(),
            feedback,
        };

        // First, parse the field.
        let mut idx = 0;
        let (field_str, fwd) = take(raw, ':');
        let field = Field::from_str(&field_str).map_err(|_| {
            let all_fields = ALL_FIELDS.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", ");
            error(idx, format!("Invalid field: must be one of {{{all_fields}}}. The next character after a field must be ':'."))
        })?;
        idx += fwd;
        if idx >= raw.len() {
            return Err(error(idx, "Expected to find ':', found end of string.".to_string()));
        }
        idx += 1;

        // Then the comparator. It decides how the rest of the input is read.
        let (comparator_str, fwd) = take(&raw[idx..], ':');
        let kind = field.kind();
        let comparator = Comparator::from_str(&comparator_str).ok();
        let shape = comparator.and_then(|c| expected_value_shape(kind, c));
        let (comparator, shape) = match (comparator, shape) {
            (Some(c), Some(s)) => (c, s),
            (parsed, _) => {
                let valid = supported_comparators(kind).iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ");
                let feedback = match parsed {
                    Some(c) => format!("Comparator {c} is not supported for {kind} field {field}: must be one of {{{valid}}}."),
                    None => format!("Invalid comparator: must be one of {{{valid}}}."),
                };
                return Err(error(idx, feedback));
            }
        };
        idx += fwd;

        // Finally the value, which must be the last section.
        if shape == ValueShape::None {
            if idx < raw.len() {
                return Err(error(idx, format!("Found a value section, but the comparator {comparator} takes no value. Please remove this section.")));
            }
            let rule = Rule::new(field, comparator, Value::None);
            tracing::debug!("Parsed rule raw={} as rule={:?}", raw, rule);
            return Ok(rule);
        }
        if idx >= raw.len() {
            return Err(error(idx, format!("Value not found: comparator {comparator} requires a {shape} value.")));
        }
        idx += 1;

        let (value_str, fwd) = take(&raw[idx..], ':');
        if idx + fwd < raw.len() {
            return Err(error(
                idx + fwd,
                "Found another section after the value, but the value must be the last section. Perhaps you meant to escape this colon?".to_string(),
            ));
        }
        let value = parse_value(shape, &value_str).map_err(|feedback| error(idx, feedback))?;

        let rule = Rule::new(field, comparator, value);
        tracing::debug!("Parsed rule raw={} as rule={:?}", raw, rule);
        Ok(rule)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.comparator)?;
        if self.value != Value::None {
            write!(f, ":{}", escape(&self.value.to_string()))?;
        }
        Ok(())
    }
}

fn parse_value(shape: ValueShape, raw: &str) -> Result<Value, String> {
    let raw_trimmed = raw.trim();
    match shape {
        ValueShape::None => Ok(Value::None),
        ValueShape::Text => Ok(Value::Text(raw.to_string())),
        ValueShape::Number => parse_number(raw_trimmed).map(Value::Number),
        ValueShape::Range => {
            let (low, high) = split_pair(raw_trimmed, "90,120")?;
            Ok(Value::Range {
                low: parse_number(low)?,
                high: parse_number(high)?,
            })
        }
        ValueShape::Date => parse_date(raw_trimmed).map(Value::Date),
        ValueShape::DateRange => {
            let (start, end) = split_pair(raw_trimmed, "2024-01-01,2024-12-31")?;
            Ok(Value::DateRange {
                start: parse_date(start)?,
                end: parse_date(end)?,
            })
        }
        ValueShape::Days => raw_trimmed
            .parse::<u32>()
            .map(Value::Days)
            .map_err(|_| format!("Invalid number of days: must be a non-negative integer, got {raw_trimmed:?}.")),
        ValueShape::Key => parse_key(raw_trimmed).map(Value::Key),
        ValueShape::KeyDistance => {
            let (key, distance) = split_pair(raw_trimmed, "A minor,2")?;
            let max_distance = distance
                .parse::<u8>()
                .map_err(|_| format!("Invalid key distance: must be a small non-negative integer, got {distance:?}."))?;
            Ok(Value::KeyDistance {
                key: parse_key(key)?,
                max_distance,
            })
        }
    }
}

fn split_pair<'a>(raw: &'a str, example: &str) -> Result<(&'a str, &'a str), String> {
    match raw.split_once(',') {
        Some((a, b)) if !b.contains(',') => Ok((a.trim(), b.trim())),
        _ => Err(format!("Invalid value: expected two comma-separated values, like {example}.")),
    }
}

fn parse_number(raw: &str) -> Result<f64, String> {
    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(format!("Invalid number: {raw:?} is not a finite number.")),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| format!("Invalid date: {raw:?} is not a YYYY-MM-DD date."))
}

fn parse_key(raw: &str) -> Result<MusicalKey, String> {
    raw.parse::<MusicalKey>().map_err(|e| format!("{e}: expected something like `A minor` or `F#`."))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    /// Every enabled child must match. An empty AND group matches everything.
    #[default]
    And,
    /// At least one enabled child must match. An empty OR group matches nothing.
    Or,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOperator::And => write!(f, "AND"),
            LogicalOperator::Or => write!(f, "OR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleGroup {
    #[serde(default)]
    pub operator: LogicalOperator,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub children: Vec<RuleNode>,
}

impl RuleGroup {
    pub fn all(children: Vec<RuleNode>) -> Self {
        RuleGroup {
            operator: LogicalOperator::And,
            negate: false,
            children,
        }
    }

    pub fn any(children: Vec<RuleNode>) -> Self {
        RuleGroup {
            operator: LogicalOperator::Or,
            negate: false,
            children,
        }
    }

    /// Flips the negation flag.
    pub fn not(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// Parses each raw rule and combines them under `operator`. This is how the smart playlist
    /// dialog's flat rule list ("match all" / "match any") is expressed as a tree.
    pub fn parse_flat(operator: LogicalOperator, raw_rules: &[&str]) -> Result<RuleGroup, RuleSyntaxError> {
        let children = raw_rules
            .iter()
            .enumerate()
            .map(|(i, raw)| Rule::parse_with_name(raw, &format!("rule {}", i + 1)).map(RuleNode::Rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleGroup {
            operator,
            negate: false,
            children,
        })
    }

    /// Number of nodes in the tree, including this group.
    pub fn size(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|c| match c {
                RuleNode::Rule(_) => 1,
                RuleNode::Group(g) => g.size(),
            })
            .sum::<usize>()
    }

    /// Whether any enabled rule in the tree compares against the evaluation time. Such trees can
    /// change their result without any track changing.
    pub fn is_time_dependent(&self) -> bool {
        self.children.iter().any(|c| match c {
            RuleNode::Rule(r) => r.enabled && r.comparator.is_relative(),
            RuleNode::Group(g) => g.is_time_dependent(),
        })
    }
}

impl fmt::Display for RuleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            write!(f, "NOT ")?;
        }
        write!(f, "(")?;
        for (i, child) in self.children.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", self.operator)?;
            }
            write!(f, "{child}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "lowercase")]
pub enum RuleNode {
    Rule(Rule),
    Group(RuleGroup),
}

impl From<Rule> for RuleNode {
    fn from(rule: Rule) -> Self {
        RuleNode::Rule(rule)
    }
}

impl From<RuleGroup> for RuleNode {
    fn from(group: RuleGroup) -> Self {
        RuleNode::Group(group)
    }
}

impl fmt::Display for RuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleNode::Rule(r) => write!(f, "{r}"),
            RuleNode::Group(g) => write!(f, "{g}"),
        }
    }
}

/// Reads until the next unescaped `until` or end of string. Returns the unescaped string and the
/// number of bytes consumed, not counting the terminating `until`. A doubled `until` is an escaped
/// literal.
pub(crate) fn take(x: &str, until: char) -> (String, usize) {
    let mut result = String::new();
    let mut chars = x.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == until {
            if matches!(chars.peek(), Some((_, next)) if *next == until) {
                result.push(c);
                chars.next();
                continue;
            }
            return (result, i);
        }
        result.push(c);
    }
    (result, x.len())
}

/// Escape the special characters in a string.
fn escape(x: &str) -> String {
    x.replace(':', "::")
}
