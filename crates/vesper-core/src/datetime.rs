use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::anyhow;
use chrono::{
  Duration,
  NaiveDate,
  NaiveDateTime,
  NaiveTime,
  Utc
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

const TIMEZONE_CONFIG_FILE: &str =
  "vesper-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "VESPER_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "VESPER_TIME_CONFIG";
const DEFAULT_VENUE_TIMEZONE: &str =
  "Asia/Ho_Chi_Minh";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Source of the venue's local wall-clock time.
pub trait Clock:
  Send + Sync + 'static
{
  fn now(&self) -> NaiveDateTime;

  fn today(&self) -> NaiveDate {
    self.now().date()
  }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
  timezone: Tz
}

impl SystemClock {
  pub fn new(timezone: Tz) -> Self {
    Self { timezone }
  }

  pub fn venue() -> Self {
    Self::new(*venue_timezone())
  }
}

impl Clock for SystemClock {
  fn now(&self) -> NaiveDateTime {
    Utc::now()
      .with_timezone(&self.timezone)
      .naive_local()
  }
}

pub fn venue_timezone() -> &'static Tz {
  static VENUE_TZ: OnceLock<Tz> =
    OnceLock::new();
  VENUE_TZ.get_or_init(
    resolve_venue_timezone
  )
}

fn resolve_venue_timezone() -> Tz {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) =
      parse_timezone(
        &raw,
        TIMEZONE_ENV_VAR
      )
  {
    return tz;
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  parse_timezone(
    DEFAULT_VENUE_TIMEZONE,
    "DEFAULT_VENUE_TIMEZONE"
  )
  .unwrap_or_else(|| {
    tracing::error!(
      "failed to parse fallback \
       timezone; using UTC"
    );
    chrono_tz::UTC
  })
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &PathBuf
) -> Option<Tz> {
  if !path.exists() {
    tracing::info!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured venue timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// Parses `YYYY-MM-DD` or one of
/// `today`, `tomorrow`, `yesterday`.
#[tracing::instrument(skip(today), fields(input = input))]
pub fn parse_date(
  input: &str,
  today: NaiveDate
) -> anyhow::Result<NaiveDate> {
  let token = input.trim();
  let shifted = match token
    .to_ascii_lowercase()
    .as_str()
  {
    | "today" => Some(0),
    | "tomorrow" => Some(1),
    | "yesterday" => Some(-1),
    | _ => None
  };
  if let Some(days) = shifted {
    return today
      .checked_add_signed(
        Duration::days(days)
      )
      .ok_or_else(|| {
        anyhow!(
          "date out of range: {token}"
        )
      });
  }

  NaiveDate::parse_from_str(
    token, "%Y-%m-%d"
  )
  .map_err(|_| {
    anyhow!(
      "invalid date '{token}', \
       expected YYYY-MM-DD"
    )
  })
}

/// Parses `HH:MM` or `HH:MM:SS`,
/// 24-hour clock.
pub fn parse_clock_time(
  token: &str
) -> Option<NaiveTime> {
  static CLOCK_RE: OnceLock<
    Option<Regex>
  > = OnceLock::new();
  let clock_re = CLOCK_RE
    .get_or_init(|| {
      Regex::new(
        r"^(?P<hour>\d{1,2}):(?P<minute>\d{2})(?::(?P<second>\d{2}))?$",
      )
      .ok()
    })
    .as_ref()?;
  let captures =
    clock_re.captures(token.trim())?;

  let hour = captures
    .name("hour")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let minute = captures
    .name("minute")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let second = match captures
    .name("second")
  {
    | Some(raw) => {
      raw.as_str().parse::<u32>().ok()?
    }
    | None => 0
  };

  if hour > 23
    || minute > 59
    || second > 59
  {
    return None;
  }

  NaiveTime::from_hms_opt(
    hour, minute, second
  )
}

/// Parses an instant in venue local
/// time: `YYYY-MM-DDTHH:MM[:SS]`,
/// `YYYY-MM-DD HH:MM[:SS]`, or a bare
/// clock time on `today`.
pub fn parse_local_datetime(
  input: &str,
  today: NaiveDate
) -> anyhow::Result<NaiveDateTime> {
  let token = input.trim();

  if let Some(time) =
    parse_clock_time(token)
  {
    return Ok(today.and_time(time));
  }

  let (date_part, time_part) = token
    .split_once('T')
    .or_else(|| token.split_once(' '))
    .ok_or_else(|| {
      anyhow!(
        "invalid datetime '{token}', \
         expected YYYY-MM-DDTHH:MM"
      )
    })?;

  let date =
    parse_date(date_part, today)?;
  let time = parse_clock_time(time_part)
    .ok_or_else(|| {
      anyhow!(
        "invalid time '{time_part}', \
         expected HH:MM or HH:MM:SS"
      )
    })?;

  Ok(date.and_time(time))
}

pub mod clock_time_serde {
  use chrono::NaiveTime;
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  pub fn serialize<S>(
    time: &NaiveTime,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    serializer.serialize_str(
      &time
        .format("%H:%M:%S")
        .to_string()
    )
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<NaiveTime, D::Error>
  where
    D: Deserializer<'de>
  {
    let raw = String::deserialize(
      deserializer
    )?;
    super::parse_clock_time(&raw)
      .ok_or_else(|| {
        serde::de::Error::custom(
          format!(
            "invalid start_time '{raw}', \
             expected HH:MM or HH:MM:SS"
          )
        )
      })
  }
}

#[cfg(test)]
mod tests {
  use chrono::{
    NaiveDate,
    NaiveTime
  };

  use super::{
    parse_clock_time,
    parse_date,
    parse_local_datetime
  };

  fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(
      2026, 2, 17
    )
    .expect("valid date")
  }

  #[test]
  fn parses_short_and_long_clock_times()
  {
    assert_eq!(
      parse_clock_time("05:30"),
      NaiveTime::from_hms_opt(5, 30, 0)
    );
    assert_eq!(
      parse_clock_time("7:05:09"),
      NaiveTime::from_hms_opt(7, 5, 9)
    );
  }

  #[test]
  fn rejects_out_of_range_clock_times()
  {
    assert!(
      parse_clock_time("24:00")
        .is_none()
    );
    assert!(
      parse_clock_time("12:60")
        .is_none()
    );
    assert!(
      parse_clock_time("noon").is_none()
    );
  }

  #[test]
  fn parses_relative_date_words() {
    assert_eq!(
      parse_date("tomorrow", today())
        .expect("parse tomorrow"),
      NaiveDate::from_ymd_opt(
        2026, 2, 18
      )
      .expect("valid date")
    );
    assert!(
      parse_date("2026-02-30", today())
        .is_err()
    );
  }

  #[test]
  fn parses_local_datetime_forms() {
    let expected = NaiveDate::from_ymd_opt(
      2026, 3, 1
    )
    .expect("valid date")
    .and_hms_opt(7, 50, 0)
    .expect("valid time");

    assert_eq!(
      parse_local_datetime(
        "2026-03-01T07:50",
        today()
      )
      .expect("parse T form"),
      expected
    );
    assert_eq!(
      parse_local_datetime(
        "2026-03-01 07:50:00",
        today()
      )
      .expect("parse space form"),
      expected
    );
    assert_eq!(
      parse_local_datetime(
        "08:10",
        today()
      )
      .expect("parse bare time")
      .date(),
      today()
    );
  }
}
