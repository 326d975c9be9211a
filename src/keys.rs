/// The keys module models the musical key produced by the audio analyzer, and the circle-of-fifths
/// distance used to find harmonically compatible keys.
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SmartlistExpectedError;

lazy_static::lazy_static! {
    static ref KEY_REGEX: Regex =
        Regex::new(r"^(?i)([a-g])([#b♯♭]?)\s*(major|minor|maj|min|m)?$").unwrap();
}

/// Pitch classes, ordered by position on the circle of fifths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PitchClass {
    C,
    G,
    D,
    A,
    E,
    B,
    FSharp,
    CSharp,
    GSharp,
    DSharp,
    ASharp,
    F,
}

pub const ALL_PITCH_CLASSES: [PitchClass; 12] = [
    PitchClass::C,
    PitchClass::G,
    PitchClass::D,
    PitchClass::A,
    PitchClass::E,
    PitchClass::B,
    PitchClass::FSharp,
    PitchClass::CSharp,
    PitchClass::GSharp,
    PitchClass::DSharp,
    PitchClass::ASharp,
    PitchClass::F,
];

impl PitchClass {
    pub fn circle_position(self) -> u8 {
        match self {
            PitchClass::C => 0,
            PitchClass::G => 1,
            PitchClass::D => 2,
            PitchClass::A => 3,
            PitchClass::E => 4,
            PitchClass::B => 5,
            PitchClass::FSharp => 6,
            PitchClass::CSharp => 7,
            PitchClass::GSharp => 8,
            PitchClass::DSharp => 9,
            PitchClass::ASharp => 10,
            PitchClass::F => 11,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PitchClass::C => "C",
            PitchClass::G => "G",
            PitchClass::D => "D",
            PitchClass::A => "A",
            PitchClass::E => "E",
            PitchClass::B => "B",
            PitchClass::FSharp => "F#",
            PitchClass::CSharp => "C#",
            PitchClass::GSharp => "G#",
            PitchClass::DSharp => "D#",
            PitchClass::ASharp => "A#",
            PitchClass::F => "F",
        }
    }

    /// Semitones above C. Used to resolve enharmonic spellings such as Bb == A#.
    fn semitone(self) -> u8 {
        match self {
            PitchClass::C => 0,
            PitchClass::CSharp => 1,
            PitchClass::D => 2,
            PitchClass::DSharp => 3,
            PitchClass::E => 4,
            PitchClass::F => 5,
            PitchClass::FSharp => 6,
            PitchClass::G => 7,
            PitchClass::GSharp => 8,
            PitchClass::A => 9,
            PitchClass::ASharp => 10,
            PitchClass::B => 11,
        }
    }

    fn from_semitone(semitone: u8) -> PitchClass {
        match semitone % 12 {
            0 => PitchClass::C,
            1 => PitchClass::CSharp,
            2 => PitchClass::D,
            3 => PitchClass::DSharp,
            4 => PitchClass::E,
            5 => PitchClass::F,
            6 => PitchClass::FSharp,
            7 => PitchClass::G,
            8 => PitchClass::GSharp,
            9 => PitchClass::A,
            10 => PitchClass::ASharp,
            _ => PitchClass::B,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Major,
    Minor,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Major => "major",
            Mode::Minor => "minor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MusicalKey {
    pub tonic: PitchClass,
    pub mode: Mode,
}

/// Changing between major and minor costs this many steps on top of the circle distance.
const MODE_CHANGE_PENALTY: u8 = 3;

impl MusicalKey {
    pub fn new(tonic: PitchClass, mode: Mode) -> Self {
        MusicalKey { tonic, mode }
    }

    /// Distance between two keys on the circle of fifths, taking the shorter way around.
    pub fn distance(&self, other: &MusicalKey) -> u8 {
        let a = self.tonic.circle_position();
        let b = other.tonic.circle_position();
        let diff = a.abs_diff(b);
        let mut distance = diff.min(12 - diff);
        if self.mode != other.mode {
            distance += MODE_CHANGE_PENALTY;
        }
        distance
    }

    pub fn is_compatible_with(&self, other: &MusicalKey, max_distance: u8) -> bool {
        self.distance(other) <= max_distance
    }
}

/// Every key within `max_distance` of `key`, in circle-of-fifths order with majors first.
pub fn compatible_keys(key: &MusicalKey, max_distance: u8) -> Vec<MusicalKey> {
    let mut result = Vec::new();
    for tonic in ALL_PITCH_CLASSES {
        for mode in [Mode::Major, Mode::Minor] {
            let candidate = MusicalKey::new(tonic, mode);
            if key.is_compatible_with(&candidate, max_distance) {
                result.push(candidate);
            }
        }
    }
    result
}

impl fmt::Display for MusicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tonic.as_str(), self.mode.as_str())
    }
}

impl FromStr for MusicalKey {
    type Err = SmartlistExpectedError;

    /// Accepts `C major`, `A minor`, `F# minor`, `Bb`, `Am`, `Ebmaj` and friends. A bare tonic is
    /// major.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let caps = KEY_REGEX
            .captures(trimmed)
            .ok_or_else(|| SmartlistExpectedError::Generic(format!("Invalid musical key: {s:?}")))?;

        let letter = caps[1].to_ascii_uppercase();
        let natural = match letter.as_str() {
            "C" => PitchClass::C,
            "D" => PitchClass::D,
            "E" => PitchClass::E,
            "F" => PitchClass::F,
            "G" => PitchClass::G,
            "A" => PitchClass::A,
            _ => PitchClass::B,
        };
        let tonic = match caps.get(2).map(|m| m.as_str()).unwrap_or("") {
            "#" | "♯" => PitchClass::from_semitone(natural.semitone() + 1),
            "b" | "♭" => PitchClass::from_semitone(natural.semitone() + 11),
            _ => natural,
        };
        let mode = match caps.get(3).map(|m| m.as_str()) {
            Some("m") => Mode::Minor,
            Some(m) if m.eq_ignore_ascii_case("minor") || m.eq_ignore_ascii_case("min") => Mode::Minor,
            _ => Mode::Major,
        };
        Ok(MusicalKey { tonic, mode })
    }
}

impl Serialize for MusicalKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MusicalKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
