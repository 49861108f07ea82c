use std::fs;
use std::io::{
  BufRead,
  BufReader,
  Write
};
use std::path::{
  Path,
  PathBuf
};
use std::time::SystemTime;

use anyhow::{
  Context,
  anyhow,
  bail
};
use chrono::NaiveDate;
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tracing::{
  debug,
  info,
  trace
};

use crate::event::{
  Event,
  EventId,
  sort_chronologically
};
use crate::store::StoreChange;

const EVENTS_FILE: &str = "events.data";
const CHANGE_CHANNEL_CAPACITY: usize =
  64;

/// Event rows kept as one JSON object per
/// line in `events.data`.
#[derive(Debug, Clone)]
pub struct DataStore {
  pub data_dir:    PathBuf,
  pub events_path: PathBuf,
  changes: broadcast::Sender<StoreChange>
}

/// What the file watcher compares between
/// polls.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq
)]
pub struct FileStamp {
  pub modified: Option<SystemTime>,
  pub len:      u64
}

impl DataStore {
  #[tracing::instrument(skip(data_dir))]
  pub fn open(
    data_dir: &Path
  ) -> anyhow::Result<Self> {
    let data_dir = data_dir.to_path_buf();
    fs::create_dir_all(&data_dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          data_dir.display()
        )
      })?;

    let events_path =
      data_dir.join(EVENTS_FILE);
    if !events_path.exists() {
      fs::write(&events_path, "")
        .with_context(|| {
          format!(
            "failed to create {}",
            events_path.display()
          )
        })?;
    }

    info!(
      data_dir = %data_dir.display(),
      events = %events_path.display(),
      "opened datastore"
    );

    let (changes, _) = broadcast::channel(
      CHANGE_CHANNEL_CAPACITY
    );
    Ok(Self {
      data_dir,
      events_path,
      changes
    })
  }

  pub fn subscribe(
    &self
  ) -> broadcast::Receiver<StoreChange> {
    self.changes.subscribe()
  }

  pub(crate) fn notify(
    &self,
    change: StoreChange
  ) {
    trace!(
      ?change,
      receivers = self.changes.receiver_count(),
      "publishing store change"
    );
    let _ = self.changes.send(change);
  }

  #[tracing::instrument(skip(self))]
  pub fn load_events(
    &self
  ) -> anyhow::Result<Vec<Event>> {
    let mut events =
      load_jsonl(&self.events_path)
        .context(
          "failed to load events.data"
        )?;
    sort_chronologically(&mut events);
    Ok(events)
  }

  #[tracing::instrument(skip(
    self, events
  ))]
  pub fn save_events(
    &self,
    events: &[Event]
  ) -> anyhow::Result<()> {
    save_jsonl_atomic(
      &self.events_path,
      events
    )
    .context("failed to save events.data")
  }

  pub fn next_id(
    &self,
    events: &[Event]
  ) -> u64 {
    events
      .iter()
      .filter_map(|event| {
        match event.id {
          | EventId::Number(value) => {
            Some(value)
          }
          | EventId::Text(_) => None
        }
      })
      .max()
      .unwrap_or(0)
      + 1
  }

  #[tracing::instrument(
    skip(self),
    fields(id = %id)
  )]
  pub fn find_event(
    &self,
    id: &EventId
  ) -> anyhow::Result<Option<Event>> {
    Ok(self
      .load_events()?
      .into_iter()
      .find(|event| &event.id == id))
  }

  #[tracing::instrument(
    skip(self, event),
    fields(id = %event.id, date = %event.date)
  )]
  pub fn add_event(
    &self,
    event: Event
  ) -> anyhow::Result<Event> {
    let mut events = self.load_events()?;
    if events
      .iter()
      .any(|existing| existing.id == event.id)
    {
      bail!(
        "duplicate event id: {}",
        event.id
      );
    }

    events.push(event.clone());
    sort_chronologically(&mut events);
    self.save_events(&events)?;
    self.notify(StoreChange::Inserted(
      event.id.clone()
    ));
    Ok(event)
  }

  #[tracing::instrument(
    skip(self, event),
    fields(id = %event.id)
  )]
  pub fn update_event(
    &self,
    event: Event
  ) -> anyhow::Result<Event> {
    let mut events = self.load_events()?;
    let slot = events
      .iter_mut()
      .find(|existing| existing.id == event.id)
      .ok_or_else(|| {
        anyhow!(
          "event not found: {}",
          event.id
        )
      })?;
    *slot = event.clone();

    sort_chronologically(&mut events);
    self.save_events(&events)?;
    self.notify(StoreChange::Updated(
      event.id.clone()
    ));
    Ok(event)
  }

  #[tracing::instrument(
    skip(self),
    fields(id = %id)
  )]
  pub fn delete_event(
    &self,
    id: &EventId
  ) -> anyhow::Result<Event> {
    let mut events = self.load_events()?;
    let idx = events
      .iter()
      .position(|event| &event.id == id)
      .ok_or_else(|| {
        anyhow!("event not found: {id}")
      })?;

    let removed = events.remove(idx);
    self.save_events(&events)?;
    self.notify(StoreChange::Deleted(
      removed.id.clone()
    ));
    Ok(removed)
  }

  #[tracing::instrument(skip(self))]
  pub fn events_for_date(
    &self,
    date: NaiveDate
  ) -> anyhow::Result<Vec<Event>> {
    self.events_for_range(date, date)
  }

  #[tracing::instrument(skip(self))]
  pub fn events_for_range(
    &self,
    start: NaiveDate,
    end: NaiveDate
  ) -> anyhow::Result<Vec<Event>> {
    let events: Vec<Event> = self
      .load_events()?
      .into_iter()
      .filter(|event| {
        start <= event.date
          && event.date <= end
      })
      .collect();
    debug!(
      count = events.len(),
      "selected events in range"
    );
    Ok(events)
  }

  #[tracing::instrument(skip(self))]
  pub fn earliest_on_or_after(
    &self,
    date: NaiveDate
  ) -> anyhow::Result<Option<Event>> {
    Ok(self
      .load_events()?
      .into_iter()
      .find(|event| event.date >= date))
  }

  /// `None` while the events file is
  /// missing.
  pub fn modified_stamp(
    &self
  ) -> anyhow::Result<Option<FileStamp>> {
    match fs::metadata(&self.events_path) {
      | Ok(meta) => Ok(Some(FileStamp {
        modified: meta.modified().ok(),
        len:      meta.len()
      })),
      | Err(err)
        if err.kind()
          == std::io::ErrorKind::NotFound =>
      {
        Ok(None)
      }
      | Err(err) => Err(err).with_context(
        || {
          format!(
            "failed reading {}",
            self.events_path.display()
          )
        }
      )
    }
  }
}

#[tracing::instrument(skip(path))]
fn load_jsonl(
  path: &Path
) -> anyhow::Result<Vec<Event>> {
  debug!(
    file = %path.display(),
    "loading jsonl"
  );
  let file = fs::File::open(path)?;
  let reader = BufReader::new(file);

  let mut out = Vec::new();
  for (idx, line) in
    reader.lines().enumerate()
  {
    let line = line?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let event: Event =
      serde_json::from_str(trimmed)
        .with_context(|| {
          format!(
            "failed parsing {} line {}",
            path.display(),
            idx + 1
          )
        })?;
    out.push(event);
  }

  debug!(
    count = out.len(),
    "loaded events from jsonl"
  );
  Ok(out)
}

#[tracing::instrument(skip(
  path, events
))]
fn save_jsonl_atomic(
  path: &Path,
  events: &[Event]
) -> anyhow::Result<()> {
  debug!(
    file = %path.display(),
    count = events.len(),
    "saving jsonl atomically"
  );

  let dir = path
    .parent()
    .unwrap_or_else(|| Path::new("."));
  let mut temp =
    NamedTempFile::new_in(dir)?;
  for event in events {
    let serialized =
      serde_json::to_string(event)?;
    writeln!(temp, "{serialized}")?;
  }
  temp.flush()?;

  temp.persist(path).map_err(|err| {
    anyhow!(
      "failed to persist {}: {}",
      path.display(),
      err
    )
  })?;

  Ok(())
}
