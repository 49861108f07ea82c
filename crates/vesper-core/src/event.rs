use std::fmt;
use std::str::FromStr;

use chrono::{
  Duration,
  NaiveDate,
  NaiveDateTime,
  NaiveTime
};
use serde::{
  Deserialize,
  Serialize
};

use crate::datetime::clock_time_serde;

/// Row identifier. Stores written by this
/// crate use numbers; rows imported from
/// elsewhere may carry text ids.
#[derive(
  Debug,
  Clone,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize
)]
#[serde(untagged)]
pub enum EventId {
  Number(u64),
  Text(String)
}

impl fmt::Display for EventId {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    match self {
      | EventId::Number(value) => {
        write!(f, "{value}")
      }
      | EventId::Text(value) => {
        f.write_str(value)
      }
    }
  }
}

impl FromStr for EventId {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
      anyhow::bail!(
        "event id cannot be empty"
      );
    }
    Ok(trimmed
      .parse::<u64>()
      .map(EventId::Number)
      .unwrap_or_else(|_| {
        EventId::Text(trimmed.to_string())
      }))
  }
}

impl From<u64> for EventId {
  fn from(value: u64) -> Self {
    EventId::Number(value)
  }
}

#[derive(
  Debug,
  Clone,
  PartialEq,
  Eq,
  Serialize,
  Deserialize
)]
pub struct Event {
  pub id: EventId,

  pub date: NaiveDate,

  #[serde(with = "clock_time_serde")]
  pub start_time: NaiveTime,

  pub title: String,

  pub location: String,

  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub celebrant_name: Option<String>,

  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub note: Option<String>,

  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub last_updated_by: Option<String>
}

impl Event {
  pub fn new(
    id: impl Into<EventId>,
    date: NaiveDate,
    start_time: NaiveTime,
    title: impl Into<String>,
    location: impl Into<String>
  ) -> Self {
    Self {
      id: id.into(),
      date,
      start_time,
      title: title.into(),
      location: location.into(),
      celebrant_name: None,
      note: None,
      last_updated_by: None
    }
  }

  pub fn starts_at(&self) -> NaiveDateTime {
    self.date.and_time(self.start_time)
  }

  pub fn ends_at(
    &self,
    duration: Duration
  ) -> NaiveDateTime {
    self.starts_at() + duration
  }

  /// `start <= now < start + duration`.
  pub fn is_happening_at(
    &self,
    now: NaiveDateTime,
    duration: Duration
  ) -> bool {
    let start = self.starts_at();
    start <= now && now < start + duration
  }
}

/// Stable sort by date, then start time.
/// Events sharing a start keep their
/// relative order.
pub fn sort_chronologically(
  events: &mut [Event]
) {
  events.sort_by_key(|event| {
    (event.date, event.start_time)
  });
}
