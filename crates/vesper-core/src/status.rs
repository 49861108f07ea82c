use chrono::{
  Duration,
  NaiveDateTime
};
use serde::{
  Deserialize,
  Serialize
};

use crate::event::Event;

pub const DEFAULT_EVENT_DURATION_MINUTES: u32 =
  30;
pub const DEFAULT_COUNTDOWN_THRESHOLD_MINUTES: u32 =
  15;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize
)]
pub struct EngineConfig {
  pub event_duration_minutes:      u32,
  pub countdown_threshold_minutes: u32
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      event_duration_minutes:
        DEFAULT_EVENT_DURATION_MINUTES,
      countdown_threshold_minutes:
        DEFAULT_COUNTDOWN_THRESHOLD_MINUTES
    }
  }
}

impl EngineConfig {
  pub fn event_duration(&self) -> Duration {
    Duration::minutes(i64::from(
      self.event_duration_minutes
    ))
  }

  pub fn countdown_threshold(
    &self
  ) -> Duration {
    Duration::minutes(i64::from(
      self.countdown_threshold_minutes
    ))
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize
)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
  Happening,
  Countdown,
  Upcoming,
  Finished
}

#[derive(
  Debug,
  Clone,
  PartialEq,
  Eq,
  Default,
  Serialize
)]
#[serde(
  tag = "kind",
  rename_all = "snake_case"
)]
pub enum Status {
  Happening {
    events: Vec<Event>
  },
  Countdown {
    events:  Vec<Event>,
    seconds: u64
  },
  Upcoming {
    events:   Vec<Event>,
    /// Events come from the day after
    /// the query day.
    next_day: bool
  },
  #[default]
  Finished
}

impl Status {
  pub fn kind(&self) -> StatusKind {
    match self {
      | Status::Happening { .. } => {
        StatusKind::Happening
      }
      | Status::Countdown { .. } => {
        StatusKind::Countdown
      }
      | Status::Upcoming { .. } => {
        StatusKind::Upcoming
      }
      | Status::Finished => {
        StatusKind::Finished
      }
    }
  }

  pub fn events(&self) -> &[Event] {
    match self {
      | Status::Happening { events }
      | Status::Countdown { events, .. }
      | Status::Upcoming { events, .. } => {
        events
      }
      | Status::Finished => &[]
    }
  }

  pub fn countdown_seconds(
    &self
  ) -> Option<u64> {
    match self {
      | Status::Countdown {
        seconds, ..
      } => Some(*seconds),
      | _ => None
    }
  }

  pub fn is_fallback_to_next_day(
    &self
  ) -> Option<bool> {
    match self {
      | Status::Upcoming {
        next_day, ..
      } => Some(*next_day),
      | _ => None
    }
  }
}

/// Derives the display status from
/// today's events, tomorrow's earliest
/// event and the current venue-local
/// instant.
///
/// The result depends only on the
/// arguments, so calling it every second
/// is idempotent and a clock jump is
/// absorbed on the next call.
///
/// Every event whose window
/// `[start, start + duration)` contains
/// `now` is happening. Otherwise the
/// earliest start after `now` is the only
/// candidate for a countdown, and all
/// events sharing that start travel
/// together.
pub fn compute_status(
  today_events: &[Event],
  fallback: Option<&Event>,
  now: NaiveDateTime,
  config: &EngineConfig
) -> Status {
  let duration = config.event_duration();

  let happening: Vec<Event> = today_events
    .iter()
    .filter(|event| {
      event.is_happening_at(now, duration)
    })
    .cloned()
    .collect();
  if !happening.is_empty() {
    return Status::Happening {
      events: happening
    };
  }

  let first_next = today_events
    .iter()
    .map(Event::starts_at)
    .filter(|start| *start > now)
    .min();

  if let Some(first_next) = first_next {
    let events: Vec<Event> = today_events
      .iter()
      .filter(|event| {
        event.starts_at() == first_next
      })
      .cloned()
      .collect();

    let remaining = first_next - now;
    if remaining
      <= config.countdown_threshold()
    {
      let seconds = u64::try_from(
        remaining.num_seconds()
      )
      .unwrap_or(0);
      return Status::Countdown {
        events,
        seconds
      };
    }

    return Status::Upcoming {
      events,
      next_day: false
    };
  }

  match fallback {
    | Some(event) => Status::Upcoming {
      events:   vec![event.clone()],
      next_day: true
    },
    | None => Status::Finished
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize
)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
  Past,
  Active,
  Next,
  Later
}

#[derive(
  Debug,
  Clone,
  PartialEq,
  Eq,
  Serialize
)]
pub struct ScheduleRow {
  pub event: Event,
  pub state: RowState
}

/// Marks each of today's events for the
/// schedule list shown beside the status
/// card.
pub fn classify_rows(
  today_events: &[Event],
  status: &Status,
  now: NaiveDateTime
) -> Vec<ScheduleRow> {
  today_events
    .iter()
    .map(|event| {
      let in_group =
        status.events().contains(event);
      let state = match status {
        | Status::Happening { .. }
          if in_group =>
        {
          RowState::Active
        }
        | Status::Countdown { .. }
          if in_group =>
        {
          RowState::Next
        }
        | Status::Upcoming {
          next_day: false,
          ..
        } if in_group => RowState::Next,
        | _ if event.starts_at() <= now => {
          RowState::Past
        }
        | _ => RowState::Later
      };
      ScheduleRow {
        event: event.clone(),
        state
      }
    })
    .collect()
}
