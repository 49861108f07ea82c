use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{
  Context,
  anyhow,
  bail
};
use chrono::{
  Datelike,
  NaiveDate,
  NaiveDateTime,
  NaiveTime
};
use serde::Serialize;
use tracing::{
  debug,
  error,
  info,
  instrument,
  warn
};

use crate::calendar::{
  self,
  Direction,
  Granularity
};
use crate::cli::{
  AddArgs,
  Command,
  EditArgs
};
use crate::config::Config;
use crate::countdown::format_countdown;
use crate::datastore::DataStore;
use crate::datetime::{
  Clock,
  SystemClock,
  parse_clock_time,
  parse_date,
  parse_local_datetime
};
use crate::event::{
  Event,
  EventId
};
use crate::refresh::{
  RefreshLoop,
  RefreshOptions
};
use crate::render::Renderer;
use crate::status::{
  Status,
  classify_rows,
  compute_status
};
use crate::store::JsonlEventStore;

const WEEK_WINDOW_DAYS: u32 = 7;
const FILE_WATCH_INTERVAL: Duration =
  Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
  at:        NaiveDateTime,
  #[serde(flatten)]
  status:    &'a Status,
  countdown: Option<String>
}

#[instrument(skip(
  store, cfg, renderer, command
))]
pub fn dispatch(
  store: &DataStore,
  cfg: &Config,
  renderer: &mut Renderer,
  command: Command
) -> anyhow::Result<()> {
  let clock = SystemClock::venue();
  let now = clock.now();
  let today = now.date();

  debug!(
    ?command,
    %now,
    "dispatching command"
  );

  match command {
    | Command::Status { at, json } => {
      cmd_status(
        store,
        cfg,
        renderer,
        at.as_deref(),
        json,
        now
      )
    }
    | Command::Today { at } => {
      cmd_today(
        store,
        cfg,
        renderer,
        at.as_deref(),
        now
      )
    }
    | Command::Range {
      view,
      anchor,
      step
    } => cmd_range(
      store,
      cfg,
      renderer,
      view,
      anchor.as_deref(),
      step,
      today
    ),
    | Command::Grid { anchor } => {
      cmd_grid(
        store,
        renderer,
        anchor.as_deref(),
        today
      )
    }
    | Command::Year { anchor } => {
      cmd_year(
        store,
        renderer,
        anchor.as_deref(),
        today
      )
    }
    | Command::Week { from } => {
      cmd_week(
        store,
        renderer,
        from.as_deref(),
        today
      )
    }
    | Command::List { from, to } => {
      cmd_list(
        store,
        renderer,
        from.as_deref(),
        to.as_deref(),
        today
      )
    }
    | Command::Info { id } => {
      cmd_info(store, renderer, &id)
    }
    | Command::Add(args) => {
      cmd_add(store, args, today)
    }
    | Command::Edit(args) => {
      cmd_edit(store, args, today)
    }
    | Command::Delete { id, by } => {
      cmd_delete(
        store,
        &id,
        by.as_deref()
      )
    }
    | Command::Display { view } => {
      cmd_display(
        store, cfg, renderer, view
      )
    }
    | Command::Show => cmd_show(cfg)
  }
}

/// Today's events on `date` plus
/// tomorrow's earliest event, if any.
fn load_day(
  store: &DataStore,
  date: NaiveDate
) -> anyhow::Result<(
  Vec<Event>,
  Option<Event>
)> {
  let events =
    store.events_for_date(date)?;
  let fallback = match date.succ_opt() {
    | Some(tomorrow) => store
      .earliest_on_or_after(tomorrow)?
      .filter(|event| {
        event.date == tomorrow
      }),
    | None => None
  };
  Ok((events, fallback))
}

fn resolve_instant(
  at: Option<&str>,
  now: NaiveDateTime
) -> anyhow::Result<NaiveDateTime> {
  match at {
    | Some(raw) => {
      parse_local_datetime(raw, now.date())
    }
    | None => Ok(now)
  }
}

fn resolve_date(
  raw: Option<&str>,
  today: NaiveDate
) -> anyhow::Result<NaiveDate> {
  match raw {
    | Some(raw) => parse_date(raw, today),
    | None => Ok(today)
  }
}

fn count_by_day(
  events: &[Event]
) -> BTreeMap<NaiveDate, usize> {
  let mut counts = BTreeMap::new();
  for event in events {
    *counts
      .entry(event.date)
      .or_insert(0) += 1;
  }
  counts
}

#[instrument(skip(
  store, cfg, renderer, now
))]
fn cmd_status(
  store: &DataStore,
  cfg: &Config,
  renderer: &mut Renderer,
  at: Option<&str>,
  json: bool,
  now: NaiveDateTime
) -> anyhow::Result<()> {
  info!("command status");

  let instant =
    resolve_instant(at, now)?;
  let (events, fallback) =
    load_day(store, instant.date())?;
  let status = compute_status(
    &events,
    fallback.as_ref(),
    instant,
    &cfg.engine()?
  );

  if json {
    let report = StatusReport {
      at:        instant,
      status:    &status,
      countdown: status
        .countdown_seconds()
        .map(format_countdown)
    };
    println!(
      "{}",
      serde_json::to_string_pretty(
        &report
      )?
    );
    return Ok(());
  }

  renderer.print_status(&status)
}

#[instrument(skip(
  store, cfg, renderer, now
))]
fn cmd_today(
  store: &DataStore,
  cfg: &Config,
  renderer: &mut Renderer,
  at: Option<&str>,
  now: NaiveDateTime
) -> anyhow::Result<()> {
  info!("command today");

  let instant =
    resolve_instant(at, now)?;
  let (events, fallback) =
    load_day(store, instant.date())?;
  let status = compute_status(
    &events,
    fallback.as_ref(),
    instant,
    &cfg.engine()?
  );

  renderer.print_status(&status)?;
  if events.is_empty() {
    println!(
      "No events on {}.",
      instant.date()
    );
    return Ok(());
  }
  println!();
  renderer.print_schedule(
    &classify_rows(
      &events, &status, instant
    )
  )
}

#[instrument(skip(
  store, cfg, renderer, today
))]
fn cmd_range(
  store: &DataStore,
  cfg: &Config,
  renderer: &mut Renderer,
  view: Option<Granularity>,
  anchor: Option<&str>,
  step: i32,
  today: NaiveDate
) -> anyhow::Result<()> {
  info!("command range");

  let granularity = match view {
    | Some(view) => view,
    | None => cfg.default_view()?
  };
  let direction = if step < 0 {
    Direction::Prev
  } else {
    Direction::Next
  };
  let mut anchor =
    resolve_date(anchor, today)?;
  for _ in 0..step.unsigned_abs() {
    anchor = calendar::navigate(
      granularity,
      anchor,
      direction
    );
  }

  let range = calendar::resolve_range(
    granularity,
    anchor
  );
  let events = store.events_for_range(
    range.start,
    range.end
  )?;
  renderer.print_range(&range, &events)
}

#[instrument(skip(
  store, renderer, today
))]
fn cmd_grid(
  store: &DataStore,
  renderer: &mut Renderer,
  anchor: Option<&str>,
  today: NaiveDate
) -> anyhow::Result<()> {
  info!("command grid");

  let anchor =
    resolve_date(anchor, today)?;
  let grid =
    calendar::weeks_grid_for(anchor);
  let (Some(first), Some(last)) =
    (grid.first(), grid.last())
  else {
    bail!(
      "empty month grid for {anchor}"
    );
  };
  let events =
    store.events_for_range(*first, *last)?;
  renderer.print_month_grid(
    anchor,
    &grid,
    &count_by_day(&events),
    today
  )
}

#[instrument(skip(
  store, renderer, today
))]
fn cmd_year(
  store: &DataStore,
  renderer: &mut Renderer,
  anchor: Option<&str>,
  today: NaiveDate
) -> anyhow::Result<()> {
  info!("command year");

  let anchor =
    resolve_date(anchor, today)?;
  let range = calendar::resolve_range(
    Granularity::Year,
    anchor
  );
  let events = store.events_for_range(
    range.start,
    range.end
  )?;

  let months: Vec<(NaiveDate, usize)> =
    calendar::months_of_year(anchor)
      .into_iter()
      .map(|first| {
        let count = events
          .iter()
          .filter(|event| {
            event.date.month()
              == first.month()
          })
          .count();
        (first, count)
      })
      .collect();
  renderer.print_year(
    anchor.year(),
    &months
  )
}

#[instrument(skip(
  store, renderer, today
))]
fn cmd_week(
  store: &DataStore,
  renderer: &mut Renderer,
  from: Option<&str>,
  today: NaiveDate
) -> anyhow::Result<()> {
  info!("command week");

  let from = resolve_date(from, today)?;
  let (start, end) =
    calendar::rolling_window(
      from,
      WEEK_WINDOW_DAYS
    );
  let events =
    store.events_for_range(start, end)?;
  renderer.print_week(
    &calendar::group_by_day(
      &events, start, end
    )
  )
}

#[instrument(skip(
  store, renderer, today
))]
fn cmd_list(
  store: &DataStore,
  renderer: &mut Renderer,
  from: Option<&str>,
  to: Option<&str>,
  today: NaiveDate
) -> anyhow::Result<()> {
  info!("command list");

  let from = from
    .map(|raw| parse_date(raw, today))
    .transpose()?;
  let to = to
    .map(|raw| parse_date(raw, today))
    .transpose()?;
  if let (Some(from), Some(to)) =
    (from, to)
    && from > to
  {
    bail!(
      "--from {from} is after --to {to}"
    );
  }

  let events: Vec<Event> = store
    .load_events()?
    .into_iter()
    .filter(|event| {
      from.is_none_or(|from| {
        event.date >= from
      })
    })
    .filter(|event| {
      to.is_none_or(|to| event.date <= to)
    })
    .collect();

  if events.is_empty() {
    println!("No matching events.");
    return Ok(());
  }
  renderer.print_event_table(&events)
}

#[instrument(
  skip(store, renderer),
  fields(id = %id)
)]
fn cmd_info(
  store: &DataStore,
  renderer: &mut Renderer,
  id: &EventId
) -> anyhow::Result<()> {
  info!("command info");

  let event = store
    .find_event(id)?
    .ok_or_else(|| {
      anyhow!("event not found: {id}")
    })?;
  renderer.print_event_info(&event)
}

fn required_text(
  field: &str,
  raw: &str
) -> anyhow::Result<String> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    bail!("{field} cannot be empty");
  }
  Ok(trimmed.to_string())
}

/// Empty input clears an optional field.
fn optional_text(
  raw: String
) -> Option<String> {
  let trimmed = raw.trim();
  (!trimmed.is_empty())
    .then(|| trimmed.to_string())
}

fn parse_start_time(
  raw: &str
) -> anyhow::Result<NaiveTime> {
  parse_clock_time(raw).ok_or_else(|| {
    anyhow!(
      "invalid time '{raw}', expected \
       HH:MM or HH:MM:SS"
    )
  })
}

#[instrument(skip(store, args, today))]
fn cmd_add(
  store: &DataStore,
  args: AddArgs,
  today: NaiveDate
) -> anyhow::Result<()> {
  info!("command add");

  let date = parse_date(&args.date, today)?;
  let start_time =
    parse_start_time(&args.time)?;
  let title =
    required_text("title", &args.title)?;
  let location = required_text(
    "location",
    &args.location
  )?;

  let next_id =
    store.next_id(&store.load_events()?);
  let mut event = Event::new(
    next_id, date, start_time, title,
    location
  );
  event.celebrant_name =
    args.celebrant.and_then(optional_text);
  event.note =
    args.note.and_then(optional_text);
  event.last_updated_by =
    args.by.and_then(optional_text);

  let event = store.add_event(event)?;
  println!("Created event {}.", event.id);
  Ok(())
}

#[instrument(
  skip(store, args, today),
  fields(id = %args.id)
)]
fn cmd_edit(
  store: &DataStore,
  args: EditArgs,
  today: NaiveDate
) -> anyhow::Result<()> {
  info!("command edit");

  let mut event = store
    .find_event(&args.id)?
    .ok_or_else(|| {
      anyhow!(
        "event not found: {}",
        args.id
      )
    })?;
  let before = event.clone();

  if let Some(raw) = &args.date {
    event.date = parse_date(raw, today)?;
  }
  if let Some(raw) = &args.time {
    event.start_time =
      parse_start_time(raw)?;
  }
  if let Some(raw) = &args.title {
    event.title =
      required_text("title", raw)?;
  }
  if let Some(raw) = &args.location {
    event.location =
      required_text("location", raw)?;
  }
  if let Some(raw) = args.celebrant {
    event.celebrant_name =
      optional_text(raw);
  }
  if let Some(raw) = args.note {
    event.note = optional_text(raw);
  }

  if event == before {
    warn!("edit changed nothing");
    println!(
      "Event {} unchanged.",
      event.id
    );
    return Ok(());
  }

  if let Some(by) =
    args.by.and_then(optional_text)
  {
    event.last_updated_by = Some(by);
  }
  let event = store.update_event(event)?;
  println!("Modified event {}.", event.id);
  Ok(())
}

#[instrument(
  skip(store),
  fields(id = %id)
)]
fn cmd_delete(
  store: &DataStore,
  id: &EventId,
  by: Option<&str>
) -> anyhow::Result<()> {
  info!(by, "command delete");

  let removed = store.delete_event(id)?;
  println!(
    "Deleted event {} ({} {} {}).",
    removed.id,
    removed.date,
    removed.start_time.format("%H:%M"),
    removed.title
  );
  Ok(())
}

#[instrument(skip(store, cfg, renderer))]
fn cmd_display(
  store: &DataStore,
  cfg: &Config,
  renderer: &mut Renderer,
  view: Option<Granularity>
) -> anyhow::Result<()> {
  info!("command display");

  let options = RefreshOptions {
    engine:        cfg.engine()?,
    data_interval: cfg.refresh_interval()?,
    granularity:   match view {
      | Some(view) => view,
      | None => cfg.default_view()?
    },
    anchor:        None
  };

  let runtime =
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context(
        "failed to start async runtime"
      )?;

  runtime.block_on(async {
    let event_store = Arc::new(
      JsonlEventStore::new(store.clone())
    );
    let watcher = event_store
      .spawn_file_watcher(
        FILE_WATCH_INTERVAL
      );
    let handle = RefreshLoop::spawn(
      event_store,
      Arc::new(SystemClock::venue()),
      options
    );
    let mut updates = handle.subscribe();

    let shutdown =
      wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    let mut last_line = String::new();
    loop {
      let line = renderer.status_line(
        &updates
          .borrow_and_update()
          .status
      );
      if line != last_line {
        println!("{line}");
        last_line = line;
      }

      tokio::select! {
        changed = updates.changed() => {
          if changed.is_err() {
            warn!(
              "refresh loop stopped \
               publishing"
            );
            break;
          }
        }
        _ = &mut shutdown => {
          warn!(
            "received shutdown signal; \
             stopping display"
          );
          break;
        }
      }
    }

    handle.shutdown().await;
    watcher.abort();
  });

  Ok(())
}

fn cmd_show(
  cfg: &Config
) -> anyhow::Result<()> {
  for path in &cfg.loaded_files {
    println!("# {}", path.display());
  }
  for (k, v) in cfg.iter() {
    println!("{k}={v}");
  }
  Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
  use tokio::signal::unix::{
    SignalKind,
    signal
  };

  let mut sigint =
    match signal(SignalKind::interrupt()) {
      | Ok(stream) => stream,
      | Err(error) => {
        error!(
          %error,
          "failed to register SIGINT \
           handler; falling back to ctrl_c"
        );
        let _ =
          tokio::signal::ctrl_c().await;
        return;
      }
    };

  let mut sigterm =
    match signal(SignalKind::terminate()) {
      | Ok(stream) => stream,
      | Err(error) => {
        error!(
          %error,
          "failed to register SIGTERM \
           handler; falling back to ctrl_c"
        );
        let _ =
          tokio::signal::ctrl_c().await;
        return;
      }
    };

  tokio::select! {
    _ = sigint.recv() => {}
    _ = sigterm.recv() => {}
  }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
  if let Err(error) =
    tokio::signal::ctrl_c().await
  {
    error!(
      %error,
      "failed waiting for ctrl_c signal"
    );
  }
}
