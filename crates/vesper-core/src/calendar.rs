use std::collections::BTreeMap;

use chrono::{
  Datelike,
  Duration,
  NaiveDate,
  Weekday
};
use serde::{
  Deserialize,
  Serialize
};

use crate::event::Event;

/// Weeks always start on Monday.
pub const WEEK_START: Weekday =
  Weekday::Mon;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize
)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
  Day,
  Week,
  Month,
  Year
}

impl Granularity {
  pub fn from_key(
    raw: &str
  ) -> Option<Self> {
    match raw
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "day" => Some(Self::Day),
      | "week" => Some(Self::Week),
      | "month" => Some(Self::Month),
      | "year" => Some(Self::Year),
      | _ => None
    }
  }

  pub fn as_key(self) -> &'static str {
    match self {
      | Self::Day => "day",
      | Self::Week => "week",
      | Self::Month => "month",
      | Self::Year => "year"
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq
)]
pub enum Direction {
  Prev,
  Next
}

impl Direction {
  fn sign(self) -> i32 {
    match self {
      | Self::Prev => -1,
      | Self::Next => 1
    }
  }
}

/// Inclusive date span for one view.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize
)]
pub struct CalendarRange {
  pub granularity: Granularity,
  pub anchor:      NaiveDate,
  pub start:       NaiveDate,
  pub end:         NaiveDate
}

impl CalendarRange {
  pub fn contains(
    &self,
    date: NaiveDate
  ) -> bool {
    self.start <= date
      && date <= self.end
  }

  pub fn len_days(&self) -> i64 {
    (self.end - self.start).num_days()
      + 1
  }

  pub fn days(
    &self
  ) -> impl Iterator<Item = NaiveDate>
  {
    self
      .start
      .iter_days()
      .take_while({
        let end = self.end;
        move |day| *day <= end
      })
  }
}

pub fn resolve_range(
  granularity: Granularity,
  anchor: NaiveDate
) -> CalendarRange {
  let (start, end) = match granularity
  {
    | Granularity::Day => {
      (anchor, anchor)
    }
    | Granularity::Week => {
      let start = start_of_week(anchor);
      (start, add_days(start, 6))
    }
    | Granularity::Month => {
      (
        first_day_of_month(
          anchor.year(),
          anchor.month()
        ),
        last_day_of_month(
          anchor.year(),
          anchor.month()
        )
      )
    }
    | Granularity::Year => {
      (
        first_day_of_month(
          anchor.year(),
          1
        ),
        last_day_of_month(
          anchor.year(),
          12
        )
      )
    }
  };

  CalendarRange {
    granularity,
    anchor,
    start,
    end
  }
}

/// Month and year steps keep the day of
/// month, clamped to the target month's
/// last day.
pub fn navigate(
  granularity: Granularity,
  anchor: NaiveDate,
  direction: Direction
) -> NaiveDate {
  let step = direction.sign();
  match granularity {
    | Granularity::Day => {
      add_days(anchor, step as i64)
    }
    | Granularity::Week => {
      add_days(
        anchor,
        (step * 7) as i64
      )
    }
    | Granularity::Month => {
      shift_months(anchor, step)
    }
    | Granularity::Year => {
      shift_years(anchor, step)
    }
  }
}

/// Dates for a seven-column month grid
/// with no partial weeks.
pub fn weeks_grid_for(
  anchor: NaiveDate
) -> Vec<NaiveDate> {
  let month = resolve_range(
    Granularity::Month,
    anchor
  );
  let grid = CalendarRange {
    granularity: Granularity::Month,
    anchor,
    start: start_of_week(month.start),
    end: add_days(
      start_of_week(month.end),
      6
    )
  };
  grid.days().collect()
}

pub fn months_of_year(
  anchor: NaiveDate
) -> [NaiveDate; 12] {
  std::array::from_fn(|idx| {
    first_day_of_month(
      anchor.year(),
      idx as u32 + 1
    )
  })
}

/// `from ..= from + days - 1`.
pub fn rolling_window(
  from: NaiveDate,
  days: u32
) -> (NaiveDate, NaiveDate) {
  let span =
    i64::from(days.max(1)) - 1;
  (from, add_days(from, span))
}

pub fn group_by_day(
  events: &[Event],
  start: NaiveDate,
  end: NaiveDate
) -> BTreeMap<NaiveDate, Vec<Event>> {
  let mut grouped: BTreeMap<
    NaiveDate,
    Vec<Event>
  > = BTreeMap::new();

  let mut day = start;
  while day <= end {
    grouped.insert(day, Vec::new());
    let Some(next) = day.succ_opt()
    else {
      break;
    };
    day = next;
  }

  for event in events {
    if let Some(bucket) =
      grouped.get_mut(&event.date)
    {
      bucket.push(event.clone());
    }
  }

  grouped
}

pub fn range_title(
  range: &CalendarRange
) -> String {
  match range.granularity {
    | Granularity::Day => {
      range
        .anchor
        .format("%A, %d/%m/%Y")
        .to_string()
    }
    | Granularity::Week => {
      format!(
        "{} - {}",
        range.start.format("%d/%m"),
        range.end.format("%d/%m/%Y")
      )
    }
    | Granularity::Month => {
      format!(
        "Month {}",
        range.anchor.format("%m/%Y")
      )
    }
    | Granularity::Year => {
      format!(
        "Year {}",
        range.anchor.year()
      )
    }
  }
}

fn shift_years(
  date: NaiveDate,
  years: i32
) -> NaiveDate {
  let year =
    date.year().saturating_add(years);
  let month = date.month();
  let day = date
    .day()
    .min(days_in_month(year, month));
  NaiveDate::from_ymd_opt(
    year, month, day
  )
  .unwrap_or(date)
}

fn shift_months(
  date: NaiveDate,
  months: i32
) -> NaiveDate {
  let mut year = date.year();
  let mut month =
    date.month() as i32 + months;

  while month < 1 {
    month += 12;
    year = year.saturating_sub(1);
  }
  while month > 12 {
    month -= 12;
    year = year.saturating_add(1);
  }

  let month = month as u32;
  let day = date
    .day()
    .min(days_in_month(year, month));
  NaiveDate::from_ymd_opt(
    year, month, day
  )
  .unwrap_or(date)
}

fn first_day_of_month(
  year: i32,
  month: u32
) -> NaiveDate {
  NaiveDate::from_ymd_opt(
    year, month, 1
  )
  .unwrap_or(NaiveDate::MIN)
}

fn last_day_of_month(
  year: i32,
  month: u32
) -> NaiveDate {
  let (next_year, next_month) =
    if month >= 12 {
      (year.saturating_add(1), 1_u32)
    } else {
      (year, month + 1)
    };
  add_days(
    first_day_of_month(
      next_year, next_month
    ),
    -1
  )
}

fn days_in_month(
  year: i32,
  month: u32
) -> u32 {
  last_day_of_month(year, month).day()
}

fn add_days(
  date: NaiveDate,
  days: i64
) -> NaiveDate {
  date
    .checked_add_signed(Duration::days(
      days
    ))
    .unwrap_or(date)
}

fn start_of_week(
  day: NaiveDate
) -> NaiveDate {
  let day_idx = day
    .weekday()
    .num_days_from_monday()
    as i64;
  let start_idx = WEEK_START
    .num_days_from_monday()
    as i64;
  let diff =
    (7 + day_idx - start_idx) % 7;
  add_days(day, -diff)
}
