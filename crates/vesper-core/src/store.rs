use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{
  debug,
  trace,
  warn
};

use crate::datastore::DataStore;
use crate::event::{
  Event,
  EventId
};

/// Notification that stored events
/// changed. Subscribers treat every
/// variant as "re-fetch now".
#[derive(
  Debug,
  Clone,
  PartialEq,
  Eq
)]
pub enum StoreChange {
  Inserted(EventId),
  Updated(EventId),
  Deleted(EventId),
  Reloaded
}

/// Read side of the event store, as the
/// refresh loop consumes it.
pub trait EventStore:
  Send + Sync + 'static
{
  /// Events on `date`, ordered by start
  /// time.
  fn fetch_events_for_date(
    &self,
    date: NaiveDate
  ) -> impl Future<
    Output = anyhow::Result<Vec<Event>>
  > + Send;

  /// Events with `start <= date <= end`,
  /// ordered by date then start time.
  fn fetch_events_for_range(
    &self,
    start: NaiveDate,
    end: NaiveDate
  ) -> impl Future<
    Output = anyhow::Result<Vec<Event>>
  > + Send;

  fn fetch_earliest_on_or_after(
    &self,
    date: NaiveDate
  ) -> impl Future<
    Output = anyhow::Result<Option<Event>>
  > + Send;

  fn subscribe(
    &self
  ) -> broadcast::Receiver<StoreChange>;
}

#[derive(Debug, Clone)]
pub struct JsonlEventStore {
  store: DataStore
}

impl JsonlEventStore {
  pub fn new(store: DataStore) -> Self {
    Self { store }
  }

  /// Polls the events file and publishes
  /// [`StoreChange::Reloaded`] when it
  /// changes on disk. Writes made through
  /// this process already publish their
  /// own change and are not reported a
  /// second time.
  pub fn spawn_file_watcher(
    &self,
    poll: Duration
  ) -> JoinHandle<()> {
    let store = self.store.clone();
    let mut own_writes = store.subscribe();
    tokio::spawn(async move {
      let mut last_seen =
        store.modified_stamp().ok().flatten();
      let mut ticker =
        tokio::time::interval(poll);
      ticker.set_missed_tick_behavior(
        MissedTickBehavior::Delay
      );
      loop {
        tokio::select! {
          biased;

          change = own_writes.recv() => match change {
            | Ok(StoreChange::Reloaded) => {}
            | Ok(change) => {
              trace!(
                ?change,
                "write from this process; \
                 resyncing file stamp"
              );
              last_seen = store
                .modified_stamp()
                .ok()
                .flatten();
            }
            | Err(broadcast::error::RecvError::Lagged(_)) => {
              last_seen = store
                .modified_stamp()
                .ok()
                .flatten();
            }
            | Err(broadcast::error::RecvError::Closed) => break
          },
          _ = ticker.tick() => match store.modified_stamp() {
            | Ok(stamp) if stamp != last_seen => {
              debug!(
                file = %store.events_path.display(),
                "events file changed on disk"
              );
              last_seen = stamp;
              store.notify(StoreChange::Reloaded);
            }
            | Ok(_) => {}
            | Err(err) => warn!(
              error = %err,
              "failed to stat events file"
            )
          }
        }
      }
    })
  }

  async fn blocking<T, F>(
    &self,
    op: F
  ) -> anyhow::Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&DataStore) -> anyhow::Result<T>
      + Send
      + 'static
  {
    let store = self.store.clone();
    tokio::task::spawn_blocking(move || {
      op(&store)
    })
    .await
    .context("datastore task failed")?
  }
}

impl EventStore for JsonlEventStore {
  async fn fetch_events_for_date(
    &self,
    date: NaiveDate
  ) -> anyhow::Result<Vec<Event>> {
    self
      .blocking(move |store| {
        store.events_for_date(date)
      })
      .await
  }

  async fn fetch_events_for_range(
    &self,
    start: NaiveDate,
    end: NaiveDate
  ) -> anyhow::Result<Vec<Event>> {
    self
      .blocking(move |store| {
        store.events_for_range(start, end)
      })
      .await
  }

  async fn fetch_earliest_on_or_after(
    &self,
    date: NaiveDate
  ) -> anyhow::Result<Option<Event>> {
    self
      .blocking(move |store| {
        store.earliest_on_or_after(date)
      })
      .await
  }

  fn subscribe(
    &self
  ) -> broadcast::Receiver<StoreChange> {
    self.store.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use chrono::NaiveTime;
  use tempfile::tempdir;

  use super::*;

  fn dawn_mass() -> Event {
    Event::new(
      1,
      NaiveDate::from_ymd_opt(2026, 10, 18)
        .expect("valid date"),
      NaiveTime::from_hms_opt(5, 0, 0)
        .expect("valid time"),
      "Dawn Mass",
      "Main Church"
    )
  }

  #[tokio::test]
  async fn watcher_reports_outside_edits_once_and_skips_own_writes()
  {
    let temp = tempdir().expect("tempdir");
    let data = DataStore::open(temp.path())
      .expect("open datastore");
    let store =
      JsonlEventStore::new(data.clone());
    let mut changes = store.subscribe();
    let watcher = store.spawn_file_watcher(
      Duration::from_millis(20)
    );
    tokio::time::sleep(
      Duration::from_millis(60)
    )
    .await;

    data.add_event(dawn_mass()).expect("add");
    tokio::time::sleep(
      Duration::from_millis(200)
    )
    .await;
    assert_eq!(
      changes.try_recv().expect("insert"),
      StoreChange::Inserted(
        EventId::Number(1)
      )
    );
    assert!(changes.try_recv().is_err());

    fs::write(&data.events_path, "")
      .expect("outside edit");
    let change = tokio::time::timeout(
      Duration::from_secs(5),
      changes.recv()
    )
    .await
    .expect("reload within timeout")
    .expect("change channel open");
    assert_eq!(change, StoreChange::Reloaded);
    tokio::time::sleep(
      Duration::from_millis(100)
    )
    .await;
    assert!(changes.try_recv().is_err());

    watcher.abort();
  }
}
