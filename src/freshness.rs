//! Freshness and staleness predicates over stored timestamps.
//!
//! A [`Predicate`] classifies a record as fresh (updated recently enough to
//! use as is) or stale (old enough, or never stored, so it needs a refresh).
//! The same predicate can be evaluated in memory, rendered as a SQL fragment,
//! or rendered as a document-database filter.
//!
//! The boundary instant is inclusive on both sides: a record stamped exactly
//! at the boundary satisfies `fresh_since` and `stale_since` alike.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::cache::CacheRecord;

/// Where the boundary sits: relative to evaluation time, or fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
  /// Resolved to `now - duration` when evaluated.
  Duration(chrono::Duration),
  /// Used as is.
  Instant(DateTime<Utc>),
}

impl Bound {
  pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    match self {
      Self::Duration(age) => now
        .checked_sub_signed(*age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC),
      Self::Instant(at) => *at,
    }
  }
}

impl From<chrono::Duration> for Bound {
  fn from(age: chrono::Duration) -> Self {
    Self::Duration(age)
  }
}

impl From<std::time::Duration> for Bound {
  fn from(age: std::time::Duration) -> Self {
    Self::Duration(chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX))
  }
}

impl From<DateTime<Utc>> for Bound {
  fn from(at: DateTime<Utc>) -> Self {
    Self::Instant(at)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Fresh,
  Stale,
}

/// Anything carrying an identifier and a "last stored/edited" timestamp.
///
/// A missing identifier means the record was never stored.
pub trait Timestamped {
  fn record_id(&self) -> Option<&str>;
  fn timestamp(&self) -> Option<DateTime<Utc>>;
}

impl Timestamped for CacheRecord {
  fn record_id(&self) -> Option<&str> {
    Some(&self.key)
  }

  fn timestamp(&self) -> Option<DateTime<Utc>> {
    Some(self.stored_at)
  }
}

impl<T: Timestamped> Timestamped for Option<T> {
  fn record_id(&self) -> Option<&str> {
    self.as_ref().and_then(Timestamped::record_id)
  }

  fn timestamp(&self) -> Option<DateTime<Utc>> {
    self.as_ref().and_then(Timestamped::timestamp)
  }
}

/// A SQL `WHERE` fragment with its single bound parameter (epoch millis).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFilter {
  pub clause: String,
  pub boundary_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predicate {
  direction: Direction,
  bound: Bound,
}

impl Predicate {
  /// Timestamp at or after the boundary.
  pub fn fresh_since(bound: impl Into<Bound>) -> Self {
    Self {
      direction: Direction::Fresh,
      bound: bound.into(),
    }
  }

  /// Timestamp missing, or at or before the boundary.
  pub fn stale_since(bound: impl Into<Bound>) -> Self {
    Self {
      direction: Direction::Stale,
      bound: bound.into(),
    }
  }

  pub fn direction(&self) -> Direction {
    self.direction
  }

  pub fn bound(&self) -> Bound {
    self.bound
  }

  pub fn boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    self.bound.resolve(now)
  }

  pub fn matches<R: Timestamped + ?Sized>(&self, record: &R, now: DateTime<Utc>) -> bool {
    self.evaluate(record.record_id(), record.timestamp(), now)
  }

  pub fn evaluate(
    &self,
    id: Option<&str>,
    timestamp: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
  ) -> bool {
    let boundary = self.boundary(now);
    let stored = id.and(timestamp);

    match self.direction {
      Direction::Fresh => stored.is_some_and(|ts| ts >= boundary),
      Direction::Stale => stored.map_or(true, |ts| ts <= boundary),
    }
  }

  /// Render against an INTEGER epoch-millis column.
  pub fn to_sql(&self, column: &str, now: DateTime<Utc>) -> SqlFilter {
    let boundary_ms = self.boundary(now).timestamp_millis();
    let clause = match self.direction {
      Direction::Fresh => format!("{column} >= ?1"),
      Direction::Stale => format!("({column} IS NULL OR {column} <= ?1)"),
    };
    SqlFilter {
      clause,
      boundary_ms,
    }
  }

  /// Render as a document-database filter on an RFC 3339 timestamp field.
  pub fn to_document_filter(&self, field: &str, now: DateTime<Utc>) -> Value {
    let boundary = document_timestamp(self.boundary(now));
    match self.direction {
      Direction::Fresh => json!({ field: { "$gte": boundary } }),
      Direction::Stale => json!({
        "$or": [
          { field: { "$exists": false } },
          { field: null },
          { field: { "$lte": boundary } },
        ]
      }),
    }
  }
}

/// Fixed-width RFC 3339 rendering, so lexical order matches time order.
pub fn document_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  struct Row {
    id: Option<&'static str>,
    at: Option<DateTime<Utc>>,
  }

  impl Timestamped for Row {
    fn record_id(&self) -> Option<&str> {
      self.id
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
      self.at
    }
  }

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, 9, 30, 0).unwrap()
  }

  #[test]
  fn test_boundary_is_both_fresh_and_stale() {
    let boundary = now() - chrono::Duration::hours(6);
    let row = Row {
      id: Some("r1"),
      at: Some(boundary),
    };

    assert!(Predicate::fresh_since(boundary).matches(&row, now()));
    assert!(Predicate::stale_since(boundary).matches(&row, now()));
  }

  #[test]
  fn test_duration_bound_is_relative_to_now() {
    let day = chrono::Duration::days(1);
    let old = Row {
      id: Some("r1"),
      at: Some(now() - chrono::Duration::days(2)),
    };
    let recent = Row {
      id: Some("r2"),
      at: Some(now() - chrono::Duration::hours(1)),
    };

    assert!(Predicate::stale_since(day).matches(&old, now()));
    assert!(!Predicate::fresh_since(day).matches(&old, now()));
    assert!(Predicate::fresh_since(day).matches(&recent, now()));
    assert!(!Predicate::stale_since(day).matches(&recent, now()));

    let exactly_a_day = Row {
      id: Some("r3"),
      at: Some(now() - day),
    };
    assert!(Predicate::stale_since(day).matches(&exactly_a_day, now()));
    assert!(Predicate::fresh_since(day).matches(&exactly_a_day, now()));
  }

  #[test]
  fn test_never_stored_is_stale_not_fresh() {
    let missing_id = Row {
      id: None,
      at: Some(now()),
    };
    let missing_ts = Row {
      id: Some("r1"),
      at: None,
    };
    let bound = chrono::Duration::minutes(5);

    for row in [&missing_id, &missing_ts] {
      assert!(Predicate::stale_since(bound).matches(row, now()));
      assert!(!Predicate::fresh_since(bound).matches(row, now()));
    }

    let absent: Option<CacheRecord> = None;
    assert!(Predicate::stale_since(bound).matches(&absent, now()));
  }

  #[test]
  fn test_std_duration_bound() {
    let predicate = Predicate::stale_since(std::time::Duration::from_secs(60));
    assert_eq!(predicate.boundary(now()), now() - chrono::Duration::seconds(60));
  }

  #[test]
  fn test_sql_rendering() {
    let at = now() - chrono::Duration::hours(1);
    let fresh = Predicate::fresh_since(at).to_sql("stored_at", now());
    assert_eq!(fresh.clause, "stored_at >= ?1");
    assert_eq!(fresh.boundary_ms, at.timestamp_millis());

    let stale = Predicate::stale_since(at).to_sql("stored_at", now());
    assert_eq!(stale.clause, "(stored_at IS NULL OR stored_at <= ?1)");
  }

  #[test]
  fn test_document_filter_rendering() {
    let at = now();
    let fresh = Predicate::fresh_since(at).to_document_filter("updatedAt", now());
    assert_eq!(
      fresh,
      json!({ "updatedAt": { "$gte": "2024-05-10T09:30:00.000Z" } })
    );

    let stale = Predicate::stale_since(at).to_document_filter("updatedAt", now());
    assert_eq!(stale["$or"].as_array().map(Vec::len), Some(3));
  }
}
