// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value types shared by the verifier and the replicator.
//!
//! # Content Keys
//!
//! A [`ContentKey`] names one stored item. Keys are totally ordered by
//! `(time, hash)` and serialize to a compact URL-safe token:
//!
//! ```text
//! 2026/03/14/09/26/53/589/3b9f0c2a1d7e
//! └─ yyyy/MM/dd/HH/mm/ss/SSS ─┘ └ hash ┘
//! ```
//!
//! # Time Buckets
//!
//! A [`MinutePath`] is a minute-granularity bucket (`yyyy/MM/dd/HH/mm`).
//! Buckets are contiguous: [`MinutePath::next()`] always advances by exactly
//! one minute. They double as query windows and as persisted cursor values.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Sequence number meaning "nothing has ever been replicated into this channel".
pub const SEQUENCE_START: u64 = 999;

/// Number of hex characters kept from the content digest.
const HASH_LEN: usize = 12;

// ═══════════════════════════════════════════════════════════════════════════════
// TimeUnit
// ═══════════════════════════════════════════════════════════════════════════════

/// Granularity of a time query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Length of one unit.
    pub fn duration(&self) -> ChronoDuration {
        match self {
            TimeUnit::Seconds => ChronoDuration::seconds(1),
            TimeUnit::Minutes => ChronoDuration::minutes(1),
            TimeUnit::Hours => ChronoDuration::hours(1),
            TimeUnit::Days => ChronoDuration::days(1),
        }
    }

    /// Truncate `time` to the start of its unit.
    pub fn round(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let seconds = time.timestamp();
        let step = self.duration().num_seconds();
        let floored = seconds - seconds.rem_euclid(step);
        Utc.timestamp_opt(floored, 0).single().unwrap_or(time)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ContentKey
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered identifier for one stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey {
    time: DateTime<Utc>,
    hash: String,
}

impl ContentKey {
    /// Create a key from a time and an explicit tiebreak hash.
    ///
    /// The time is truncated to millisecond precision so the URL form
    /// round-trips exactly.
    pub fn new(time: DateTime<Utc>, hash: impl Into<String>) -> Self {
        Self {
            time: truncate_millis(time),
            hash: hash.into(),
        }
    }

    /// Create a key whose tiebreak is derived from the item bytes.
    ///
    /// The same bytes written at the same instant always produce the same key.
    pub fn for_content(time: DateTime<Utc>, bytes: &[u8]) -> Self {
        let digest = hex::encode(Sha256::digest(bytes));
        Self::new(time, &digest[..HASH_LEN])
    }

    /// The smallest key at `time`; every real key at `time` sorts after it.
    pub fn first_key(time: DateTime<Utc>) -> Self {
        Self::new(time, "")
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The minute bucket this key falls into.
    pub fn minute_path(&self) -> MinutePath {
        MinutePath::new(self.time)
    }

    /// Serialize to the URL token form.
    pub fn to_url(&self) -> String {
        format!("{}/{}", self.time.format("%Y/%m/%d/%H/%M/%S/%3f"), self.hash)
    }

    /// Parse a URL token. Returns `None` for anything malformed.
    pub fn from_url(url: &str) -> Option<Self> {
        let parts: Vec<&str> = url.trim_matches('/').split('/').collect();
        if parts.len() != 8 {
            return None;
        }
        let hash = parts[7];
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
        let time = parse_time(&parts[..7])?;
        Some(Self::new(time, hash))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

fn truncate_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(time.timestamp_millis())
        .single()
        .unwrap_or(time)
}

/// Parse `[yyyy, MM, dd, HH, mm, ss?, SSS?]` segments.
fn parse_time(parts: &[&str]) -> Option<DateTime<Utc>> {
    let mut numbers = Vec::with_capacity(parts.len());
    for part in parts {
        if part.is_empty() || part.len() > 4 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        numbers.push(part.parse::<u32>().ok()?);
    }
    let get = |i: usize| numbers.get(i).copied().unwrap_or(0);
    let base = Utc
        .with_ymd_and_hms(get(0) as i32, get(1), get(2), get(3), get(4), get(5))
        .single()?;
    let millis = get(6);
    if millis > 999 {
        return None;
    }
    Some(base + ChronoDuration::milliseconds(millis as i64))
}

// ═══════════════════════════════════════════════════════════════════════════════
// MinutePath
// ═══════════════════════════════════════════════════════════════════════════════

/// A minute-granularity time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinutePath {
    time: DateTime<Utc>,
}

impl MinutePath {
    /// The bucket containing `time`.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: TimeUnit::Minutes.round(time),
        }
    }

    /// Start of the bucket.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// The following bucket.
    pub fn next(&self) -> Self {
        self.plus_minutes(1)
    }

    pub fn plus_minutes(&self, minutes: i64) -> Self {
        Self::new(self.time + ChronoDuration::minutes(minutes))
    }

    pub fn minus_minutes(&self, minutes: i64) -> Self {
        Self::new(self.time - ChronoDuration::minutes(minutes))
    }

    /// Minutes since the Unix epoch; used as the persisted ordering value.
    pub fn ordinal(&self) -> i64 {
        self.time.timestamp().div_euclid(60)
    }

    /// Rebuild a bucket from [`ordinal()`](Self::ordinal).
    pub fn from_ordinal(ordinal: i64) -> Option<Self> {
        Utc.timestamp_opt(ordinal.checked_mul(60)?, 0)
            .single()
            .map(Self::new)
    }

    /// Key that sorts before every key inside this bucket.
    pub fn first_key(&self) -> ContentKey {
        ContentKey::first_key(self.time)
    }

    pub fn to_url(&self) -> String {
        format!(
            "{:04}/{:02}/{:02}/{:02}/{:02}",
            self.time.year(),
            self.time.month(),
            self.time.day(),
            self.time.hour(),
            self.time.minute()
        )
    }

    pub fn from_url(url: &str) -> Option<Self> {
        let parts: Vec<&str> = url.trim_matches('/').split('/').collect();
        if parts.len() != 5 {
            return None;
        }
        parse_time(&parts).map(Self::new)
    }
}

impl fmt::Display for MinutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChannelContentKey
// ═══════════════════════════════════════════════════════════════════════════════

/// A key qualified by its channel; the unit of repair work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelContentKey {
    pub channel: String,
    pub key: ContentKey,
}

impl ChannelContentKey {
    pub fn new(channel: impl Into<String>, key: ContentKey) -> Self {
        Self {
            channel: channel.into(),
            key,
        }
    }
}

impl fmt::Display for ChannelContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SequenceKey / VerificationRange
// ═══════════════════════════════════════════════════════════════════════════════

/// Position of one item in a sequence-ordered channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceKey {
    pub channel: String,
    pub sequence: u64,
}

impl SequenceKey {
    pub fn new(channel: impl Into<String>, sequence: u64) -> Self {
        Self {
            channel: channel.into(),
            sequence,
        }
    }

    /// True when this is the placeholder written before any real item.
    pub fn is_start(&self) -> bool {
        self.sequence == SEQUENCE_START
    }
}

/// Half-open window `[start, end)` to reconcile for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRange {
    pub channel: String,
    pub start: MinutePath,
    pub end: MinutePath,
}

impl VerificationRange {
    /// Number of minute buckets covered.
    pub fn minutes(&self) -> i64 {
        (self.end.ordinal() - self.start.ordinal()).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.minutes() == 0
    }
}

impl fmt::Display for VerificationRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {})", self.channel, self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_key_start_sentinel() {
        assert!(SequenceKey::new("c", SEQUENCE_START).is_start());
        assert!(!SequenceKey::new("c", SEQUENCE_START + 1).is_start());
    }

    #[test]
    fn test_verification_range_minutes() {
        let start = MinutePath::new(at(9, 0, 0, 0));
        let range = VerificationRange {
            channel: "c".into(),
            start,
            end: start.plus_minutes(15),
        };
        assert_eq!(range.minutes(), 15);
        assert!(!range.is_empty());
        let inverted = VerificationRange {
            channel: "c".into(),
            start: start.plus_minutes(5),
            end: start,
        };
        assert!(inverted.is_empty());
    }

    fn at(h: u32, m: u32, s: u32, ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap() + ChronoDuration::milliseconds(ms)
    }

    #[test]
    fn test_content_key_url_format() {
        let key = ContentKey::new(at(9, 26, 53, 589), "abc123");
        assert_eq!(key.to_url(), "2026/03/14/09/26/53/589/abc123");
    }

    #[test]
    fn test_content_key_parses_own_url() {
        let key = ContentKey::new(at(23, 59, 59, 999), "ff00");
        assert_eq!(ContentKey::from_url(&key.to_url()), Some(key));
    }

    #[test]
    fn test_content_key_rejects_malformed() {
        assert!(ContentKey::from_url("").is_none());
        assert!(ContentKey::from_url("2026/03/14").is_none());
        assert!(ContentKey::from_url("2026/13/14/09/26/53/589/abc").is_none());
        assert!(ContentKey::from_url("2026/03/14/09/26/53/5890/abc").is_none());
        assert!(ContentKey::from_url("2026/03/14/09/26/53/589/").is_none());
        assert!(ContentKey::from_url("2026/03/14/09/26/53/589/a?b").is_none());
    }

    #[test]
    fn test_content_key_orders_by_time_then_hash() {
        let early = ContentKey::new(at(9, 0, 0, 0), "zzz");
        let late_a = ContentKey::new(at(9, 0, 0, 1), "aaa");
        let late_b = ContentKey::new(at(9, 0, 0, 1), "bbb");
        assert!(early < late_a);
        assert!(late_a < late_b);
    }

    #[test]
    fn test_first_key_sorts_before_bucket() {
        let t = at(9, 0, 0, 0);
        assert!(ContentKey::first_key(t) < ContentKey::new(t, "0"));
    }

    #[test]
    fn test_for_content_is_deterministic() {
        let t = at(10, 0, 0, 0);
        let a = ContentKey::for_content(t, b"payload");
        let b = ContentKey::for_content(t, b"payload");
        let c = ContentKey::for_content(t, b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.hash().len(), HASH_LEN);
    }

    #[test]
    fn test_minute_path_truncates() {
        let path = MinutePath::new(at(9, 26, 53, 589));
        assert_eq!(path.time(), at(9, 26, 0, 0));
        assert_eq!(path.to_url(), "2026/03/14/09/26");
    }

    #[test]
    fn test_minute_path_next_is_contiguous() {
        let path = MinutePath::new(at(23, 59, 0, 0));
        let next = path.next();
        assert_eq!(next.time() - path.time(), ChronoDuration::minutes(1));
        assert_eq!(next.to_url(), "2026/03/15/00/00");
    }

    #[test]
    fn test_minute_path_ordinal_roundtrip() {
        let path = MinutePath::new(at(12, 34, 0, 0));
        assert_eq!(MinutePath::from_ordinal(path.ordinal()), Some(path));
        assert_eq!(path.next().ordinal(), path.ordinal() + 1);
    }

    #[test]
    fn test_minute_path_from_url() {
        let path = MinutePath::from_url("2026/03/14/09/26").unwrap();
        assert_eq!(path.time(), at(9, 26, 0, 0));
        assert!(MinutePath::from_url("2026/03/14/09").is_none());
        assert!(MinutePath::from_url("2026/03/14/25/00").is_none());
    }

    #[test]
    fn test_key_minute_path() {
        let key = ContentKey::new(at(9, 26, 53, 589), "x");
        assert_eq!(key.minute_path(), MinutePath::new(at(9, 26, 0, 0)));
    }

    #[test]
    fn test_time_unit_round() {
        let t = at(9, 26, 53, 589);
        assert_eq!(TimeUnit::Seconds.round(t), at(9, 26, 53, 0));
        assert_eq!(TimeUnit::Minutes.round(t), at(9, 26, 0, 0));
        assert_eq!(TimeUnit::Hours.round(t), at(9, 0, 0, 0));
        assert_eq!(TimeUnit::Days.round(t), at(0, 0, 0, 0));
    }

    #[test]
    fn test_channel_content_key_display() {
        let key = ChannelContentKey::new("flights", ContentKey::new(at(1, 2, 3, 4), "h"));
        assert_eq!(key.to_string(), "flights/2026/03/14/01/02/03/004/h");
    }
}
