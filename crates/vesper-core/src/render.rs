use std::collections::BTreeMap;
use std::io::{
  self,
  IsTerminal,
  Write
};

use anyhow::anyhow;
use chrono::{
  Datelike,
  NaiveDate
};
use unicode_width::UnicodeWidthStr;

use crate::calendar::{
  self,
  CalendarRange
};
use crate::config::Config;
use crate::countdown::format_countdown;
use crate::event::Event;
use crate::status::{
  RowState,
  ScheduleRow,
  Status
};

#[derive(Debug, Clone)]
pub struct Renderer {
  color: bool
}

impl Renderer {
  pub fn new(
    cfg: &Config
  ) -> anyhow::Result<Self> {
    let color_cfg = cfg
      .get("color")
      .unwrap_or_else(|| "on".to_string());
    let color = match color_cfg
      .to_ascii_lowercase()
      .as_str()
    {
      | "on" | "yes" | "true" | "1" => true,
      | "off" | "no" | "false" | "0" => {
        false
      }
      | other => {
        return Err(anyhow!(
          "invalid color setting: {other}"
        ));
      }
    };

    Ok(Self { color })
  }

  #[tracing::instrument(skip(
    self, events
  ))]
  pub fn print_event_table(
    &mut self,
    events: &[Event]
  ) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    let rows = events
      .iter()
      .map(|event| {
        vec![
          self.paint(
            &event.id.to_string(),
            "33"
          ),
          event
            .date
            .format("%Y-%m-%d")
            .to_string(),
          event
            .start_time
            .format("%H:%M")
            .to_string(),
          event.title.clone(),
          event.location.clone(),
          event
            .celebrant_name
            .clone()
            .unwrap_or_default(),
        ]
      })
      .collect();

    write_table(
      &mut out,
      [
        "ID",
        "Date",
        "Time",
        "Title",
        "Location",
        "Celebrant"
      ]
      .map(String::from)
      .to_vec(),
      rows
    )?;
    Ok(())
  }

  #[tracing::instrument(
    skip(self, event),
    fields(id = %event.id)
  )]
  pub fn print_event_info(
    &mut self,
    event: &Event
  ) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();

    writeln!(out, "id         {}", event.id)?;
    writeln!(
      out,
      "date       {}",
      event.date.format("%Y-%m-%d (%A)")
    )?;
    writeln!(
      out,
      "time       {}",
      event.start_time.format("%H:%M")
    )?;
    writeln!(
      out,
      "title      {}",
      event.title
    )?;
    writeln!(
      out,
      "location   {}",
      event.location
    )?;
    if let Some(celebrant) =
      &event.celebrant_name
    {
      writeln!(
        out,
        "celebrant  {celebrant}"
      )?;
    }
    if let Some(note) = &event.note {
      writeln!(out, "note       {note}")?;
    }
    if let Some(by) = &event.last_updated_by
    {
      writeln!(out, "updated by {by}")?;
    }

    Ok(())
  }

  pub fn print_status(
    &mut self,
    status: &Status
  ) -> anyhow::Result<()> {
    let line = self.status_line(status);
    writeln!(io::stdout().lock(), "{line}")?;
    Ok(())
  }

  /// One display line for `status`,
  /// coloured by kind.
  pub fn status_line(
    &self,
    status: &Status
  ) -> String {
    let text = format_status_line(status);
    match status {
      | Status::Happening { .. } => {
        self.paint(&text, "1;32")
      }
      | Status::Countdown { .. } => {
        self.paint(&text, "1;33")
      }
      | Status::Upcoming { .. } => {
        self.paint(&text, "36")
      }
      | Status::Finished => {
        self.paint(&text, "2")
      }
    }
  }

  #[tracing::instrument(skip(self, rows))]
  pub fn print_schedule(
    &mut self,
    rows: &[ScheduleRow]
  ) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    let table_rows = rows
      .iter()
      .map(|row| {
        let (marker, code) = match row.state
        {
          | RowState::Active => {
            ("now", "1;32")
          }
          | RowState::Next => ("next", "33"),
          | RowState::Past => ("done", "2"),
          | RowState::Later => ("", "0")
        };
        vec![
          self.paint(marker, code),
          self.paint(
            &row
              .event
              .start_time
              .format("%H:%M")
              .to_string(),
            code
          ),
          row.event.title.clone(),
          row.event.location.clone(),
        ]
      })
      .collect();

    write_table(
      &mut out,
      ["", "Time", "Title", "Location"]
        .map(String::from)
        .to_vec(),
      table_rows
    )?;
    Ok(())
  }

  pub fn print_range(
    &mut self,
    range: &CalendarRange,
    events: &[Event]
  ) -> anyhow::Result<()> {
    {
      let mut out = io::stdout().lock();
      writeln!(
        out,
        "{}",
        self.paint(
          &calendar::range_title(range),
          "1"
        )
      )?;
      writeln!(
        out,
        "{} .. {} ({} days)",
        range.start,
        range.end,
        range.len_days()
      )?;
    }
    if events.is_empty() {
      println!("No events.");
      return Ok(());
    }
    self.print_event_table(events)
  }

  /// Seven columns starting Monday; days
  /// outside `anchor`'s month are dimmed
  /// and days with events carry their
  /// count.
  #[tracing::instrument(skip(
    self, grid, counts
  ))]
  pub fn print_month_grid(
    &mut self,
    anchor: NaiveDate,
    grid: &[NaiveDate],
    counts: &BTreeMap<NaiveDate, usize>,
    today: NaiveDate
  ) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    let range = calendar::resolve_range(
      calendar::Granularity::Month,
      anchor
    );
    writeln!(
      out,
      "{}",
      self.paint(
        &calendar::range_title(&range),
        "1"
      )
    )?;

    let headers = [
      "Mon", "Tue", "Wed", "Thu", "Fri",
      "Sat", "Sun"
    ]
    .map(String::from)
    .to_vec();
    let rows = grid
      .chunks(7)
      .map(|week| {
        week
          .iter()
          .map(|day| {
            let mut cell =
              format!("{:>2}", day.day());
            if let Some(count) = counts
              .get(day)
              .filter(|count| **count > 0)
            {
              cell.push_str(&format!(
                " ({count})"
              ));
            }
            if *day == today {
              self.paint(&cell, "7")
            } else if !range.contains(*day)
            {
              self.paint(&cell, "2")
            } else {
              cell
            }
          })
          .collect()
      })
      .collect();

    write_table(&mut out, headers, rows)?;
    Ok(())
  }

  pub fn print_year(
    &mut self,
    year: i32,
    months: &[(NaiveDate, usize)]
  ) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(
      out,
      "{}",
      self.paint(
        &format!("Year {year}"),
        "1"
      )
    )?;
    let rows = months
      .iter()
      .map(|(first, count)| {
        let count = if *count == 0 {
          self.paint("-", "2")
        } else {
          count.to_string()
        };
        vec![
          first.format("%m/%Y").to_string(),
          first.format("%B").to_string(),
          count,
        ]
      })
      .collect();

    write_table(
      &mut out,
      ["Month", "Name", "Events"]
        .map(String::from)
        .to_vec(),
      rows
    )?;
    Ok(())
  }

  #[tracing::instrument(skip(
    self, grouped
  ))]
  pub fn print_week(
    &mut self,
    grouped: &BTreeMap<NaiveDate, Vec<Event>>
  ) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    for (day, events) in grouped {
      writeln!(
        out,
        "{}",
        self.paint(
          &day
            .format("%A, %d/%m/%Y")
            .to_string(),
          "1"
        )
      )?;
      if events.is_empty() {
        writeln!(
          out,
          "  {}",
          self.paint("no events", "2")
        )?;
        continue;
      }
      for event in events {
        writeln!(
          out,
          "  {}  {}  {}",
          event.start_time.format("%H:%M"),
          event.title,
          event.location
        )?;
      }
    }
    Ok(())
  }

  fn paint(
    &self,
    text: &str,
    code: &str
  ) -> String {
    if !self.color
      || !io::stdout().is_terminal()
    {
      return text.to_string();
    }
    format!("\x1b[{code}m{text}\x1b[0m")
  }
}

pub fn format_status_line(
  status: &Status
) -> String {
  match status {
    | Status::Happening { events } => {
      format!(
        "Happening now: {}",
        describe(events)
      )
    }
    | Status::Countdown {
      events,
      seconds
    } => format!(
      "Starting in {}: {}",
      format_countdown(*seconds),
      describe(events)
    ),
    | Status::Upcoming {
      events,
      next_day
    } => {
      let when = if *next_day {
        "Tomorrow"
      } else {
        "Next"
      };
      format!("{when}: {}", describe(events))
    }
    | Status::Finished => {
      "All events for today have \
       finished."
        .to_string()
    }
  }
}

fn describe(events: &[Event]) -> String {
  events
    .iter()
    .map(|event| {
      format!(
        "{} {} ({})",
        event.start_time.format("%H:%M"),
        event.title,
        event.location
      )
    })
    .collect::<Vec<_>>()
    .join(" | ")
}

fn write_table<W: Write>(
  mut writer: W,
  headers: Vec<String>,
  rows: Vec<Vec<String>>
) -> anyhow::Result<()> {
  let column_count = headers.len();
  let mut widths = vec![0usize; column_count];

  for (idx, header) in
    headers.iter().enumerate()
  {
    widths[idx] = widths[idx].max(
      UnicodeWidthStr::width(
        header.as_str()
      )
    );
  }

  for row in &rows {
    for (idx, cell) in row
      .iter()
      .enumerate()
      .take(column_count)
    {
      widths[idx] = widths[idx].max(
        UnicodeWidthStr::width(
          strip_ansi(cell).as_str()
        )
      );
    }
  }

  for idx in 0..column_count {
    write!(
      writer,
      "{:width$} ",
      headers[idx],
      width = widths[idx]
    )?;
  }
  writeln!(writer)?;

  for width in &widths {
    write!(
      writer,
      "{:-<width$} ",
      "",
      width = *width
    )?;
  }
  writeln!(writer)?;

  for row in rows {
    for (idx, cell) in row
      .iter()
      .enumerate()
      .take(column_count)
    {
      let visible_width =
        UnicodeWidthStr::width(
          strip_ansi(cell).as_str()
        );
      let padding = widths[idx]
        .saturating_sub(visible_width);
      write!(
        writer,
        "{}{} ",
        cell,
        " ".repeat(padding)
      )?;
    }
    writeln!(writer)?;
  }

  Ok(())
}

fn strip_ansi(s: &str) -> String {
  let mut out =
    String::with_capacity(s.len());
  let mut escaped = false;

  for ch in s.chars() {
    if escaped {
      if ch == 'm' {
        escaped = false;
      }
      continue;
    }

    if ch == '\x1b' {
      escaped = true;
      continue;
    }

    out.push(ch);
  }

  out
}
