//! Opaque identifiers and polymorphic grant subjects.
//!
//! Every persisted entity is keyed by a 64-bit [`Id`]. Ids are generated
//! locally (no database round-trip) with the timestamp in the high bits so
//! that insertion order roughly matches id order, which the store relies on
//! for keyset pagination.
//!
//! A [`Subject`] is the tagged string form used by grants to reference either
//! a user or a group without two separate tables: `u:<id>` or `g:<id>`.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Milliseconds between the Unix epoch and 2020-01-01, the id epoch.
const ID_EPOCH_MS: i64 = 1_577_836_800_000;

/// Number of low bits filled with random entropy.
const RANDOM_BITS: u32 = 20;

/// An opaque 64-bit identifier.
///
/// Rendered as a decimal string in JSON: 64-bit integers do not survive
/// JavaScript number precision, and clients treat ids as opaque anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id(i64);

impl Id {
    /// Generate a new id: millisecond timestamp in the high bits, random
    /// entropy in the low bits. Uniqueness is enforced by the database.
    pub fn generate() -> Self {
        let now = chrono::Utc::now().timestamp_millis() - ID_EPOCH_MS;
        let random: i64 = rand::thread_rng().gen_range(0..(1 << RANDOM_BITS));
        Id((now << RANDOM_BITS) | random)
    }

    /// The zero id, used as a sentinel for "unset" in options structs.
    pub const fn zero() -> Self {
        Id(0)
    }

    /// Construct from a known raw value.
    pub const fn from_raw(value: i64) -> Self {
        Id(value)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for Id {
    fn from(v: i64) -> Self {
        Id(v)
    }
}

impl From<Id> for i64 {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when an id or subject string fails to parse.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("invalid id: {0:?}")]
    InvalidId(String),

    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
}

impl FromStr for Id {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Id)
            .map_err(|_| ParseError::InvalidId(s.to_string()))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A polymorphic grant subject: either a user or a group.
///
/// Stored and transmitted as a tagged string (`u:12345` / `g:67890`) so that
/// grants remain a single flat table. Parsing is unambiguous: a well-formed
/// subject yields exactly one of the two variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    User(Id),
    Group(Id),
}

impl Subject {
    pub fn user(id: Id) -> Self {
        Subject::User(id)
    }

    pub fn group(id: Id) -> Self {
        Subject::Group(id)
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Subject::User(_))
    }

    /// The user id, if this subject is a user.
    pub fn user_id(&self) -> Option<Id> {
        match self {
            Subject::User(id) => Some(*id),
            Subject::Group(_) => None,
        }
    }

    /// The group id, if this subject is a group.
    pub fn group_id(&self) -> Option<Id> {
        match self {
            Subject::Group(id) => Some(*id),
            Subject::User(_) => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User(id) => write!(f, "u:{id}"),
            Subject::Group(id) => write!(f, "g:{id}"),
        }
    }
}

impl FromStr for Subject {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidSubject(s.to_string());
        let (tag, id) = s.split_once(':').ok_or_else(invalid)?;
        let id: Id = id.parse().map_err(|_| invalid())?;
        match tag {
            "u" => Ok(Subject::User(id)),
            "g" => Ok(Subject::Group(id)),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_ordered_by_time() {
        let a = Id::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Id::generate();
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn id_string_round_trip() {
        let id = Id::generate();
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn id_serializes_as_json_string() {
        let id = Id::from(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
        let back: Id = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn subject_round_trip() {
        let user = Subject::user(Id::from(123));
        assert_eq!(user.to_string(), "u:123");
        assert_eq!("u:123".parse::<Subject>().unwrap(), user);

        let group = Subject::group(Id::from(456));
        assert_eq!(group.to_string(), "g:456");
        assert_eq!("g:456".parse::<Subject>().unwrap(), group);
    }

    #[test]
    fn subject_parse_is_unambiguous() {
        let s: Subject = "u:7".parse().unwrap();
        assert_eq!(s.user_id(), Some(Id::from(7)));
        assert_eq!(s.group_id(), None);
    }

    #[test]
    fn subject_rejects_malformed_input() {
        for input in ["", "u:", "x:1", "u:abc", "123", "u:1:2"] {
            assert!(input.parse::<Subject>().is_err(), "{input:?} should fail");
        }
    }
}
