//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `SessionId`: UUID-based identifier for one connection
//! - `Timestamp`: local wall-clock time with microsecond precision

use std::fmt;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::AppError;

/// Wire and backup timestamp format (output)
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Accepted input format. `%.f` also matches a missing fraction.
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Unique identifier of one connection (newtype pattern)
///
/// A username can outlive many sessions; the session id tells the
/// registry which connection currently owns a username.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local timestamp truncated to microseconds
///
/// Truncation keeps every value exactly representable in the
/// `YYYY-MM-DD HH:MM:SS.ffffff` text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub NaiveDateTime);

impl Timestamp {
    /// Current local time
    pub fn now() -> Self {
        Self(Local::now().naive_local().trunc_subsecs(6))
    }

    /// Parse the textual form used on the wire and in backups
    pub fn parse(s: &str) -> Result<Self, AppError> {
        NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_PARSE_FORMAT)
            .map(|dt| Self(dt.trunc_subsecs(6)))
            .map_err(|e| AppError::MalformedMessage(format!("bad timestamp '{}': {}", s, e)))
    }

    /// This timestamp shifted forward by `delay`, `None` past the calendar's end
    pub fn after(self, delay: Duration) -> Option<Self> {
        let delta = chrono::Duration::from_std(delay).ok()?;
        self.0.checked_add_signed(delta).map(Self)
    }

    /// Time elapsed from `self` until `later`, zero if `later` is earlier
    pub fn elapsed_until(self, later: Timestamp) -> Duration {
        (later.0 - self.0).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timestamp::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper storing a `Duration` as whole seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
