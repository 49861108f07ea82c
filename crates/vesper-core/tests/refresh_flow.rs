use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{
  AtomicBool,
  Ordering
};
use std::time::Duration;

use chrono::{
  Datelike,
  NaiveDate,
  NaiveDateTime,
  NaiveTime
};
use tokio::sync::{
  broadcast,
  watch
};
use vesper_core::calendar::{
  Direction,
  Granularity
};
use vesper_core::datetime::Clock;
use vesper_core::event::Event;
use vesper_core::refresh::{
  DisplayState,
  LoadPhase,
  RefreshLoop,
  RefreshOptions
};
use vesper_core::status::Status;
use vesper_core::store::{
  EventStore,
  StoreChange
};

fn date(raw: &str) -> NaiveDate {
  NaiveDate::parse_from_str(
    raw, "%Y-%m-%d"
  )
  .expect("valid date")
}

fn instant(
  day: &str,
  hh: u32,
  mm: u32,
  ss: u32
) -> NaiveDateTime {
  date(day).and_time(
    NaiveTime::from_hms_opt(hh, mm, ss)
      .expect("valid time")
  )
}

fn mass(
  id: u64,
  day: &str,
  hh: u32,
  mm: u32,
  location: &str
) -> Event {
  Event::new(
    id,
    date(day),
    NaiveTime::from_hms_opt(hh, mm, 0)
      .expect("valid time"),
    "Mass",
    location
  )
}

struct ManualClock {
  now: Mutex<NaiveDateTime>
}

impl ManualClock {
  fn new(now: NaiveDateTime) -> Arc<Self> {
    Arc::new(Self {
      now: Mutex::new(now)
    })
  }

  fn set(&self, now: NaiveDateTime) {
    *self.now.lock().expect("clock lock") =
      now;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> NaiveDateTime {
    *self.now.lock().expect("clock lock")
  }
}

/// In-memory store. Reads copy the rows
/// when they start, so a read that stalls
/// returns what the store held back then.
struct MemoryStore {
  events:                Mutex<Vec<Event>>,
  offline:               AtomicBool,
  /// Range reads that start in October
  /// take 10 s.
  slow_october:          AtomicBool,
  /// The next day read takes 10 s.
  stall_next_day_read:   AtomicBool,
  /// The next range read takes 10 s.
  stall_next_range_read: AtomicBool,
  changes: broadcast::Sender<StoreChange>
}

impl MemoryStore {
  fn new(events: Vec<Event>) -> Arc<Self> {
    let (changes, _) =
      broadcast::channel(16);
    Arc::new(Self {
      events: Mutex::new(events),
      offline: AtomicBool::new(false),
      slow_october: AtomicBool::new(false),
      stall_next_day_read: AtomicBool::new(
        false
      ),
      stall_next_range_read:
        AtomicBool::new(false),
      changes
    })
  }

  fn insert(&self, event: Event) {
    let id = event.id.clone();
    self
      .events
      .lock()
      .expect("events lock")
      .push(event);
    let _ = self
      .changes
      .send(StoreChange::Inserted(id));
  }

  fn select(
    &self,
    start: NaiveDate,
    end: NaiveDate
  ) -> anyhow::Result<Vec<Event>> {
    if self.offline.load(Ordering::SeqCst) {
      anyhow::bail!("store offline");
    }
    let mut events: Vec<Event> = self
      .events
      .lock()
      .expect("events lock")
      .iter()
      .filter(|event| {
        start <= event.date
          && event.date <= end
      })
      .cloned()
      .collect();
    events.sort_by_key(|event| {
      (event.date, event.start_time)
    });
    Ok(events)
  }
}

impl EventStore for MemoryStore {
  async fn fetch_events_for_date(
    &self,
    date: NaiveDate
  ) -> anyhow::Result<Vec<Event>> {
    let snapshot = self.select(date, date);
    if self
      .stall_next_day_read
      .swap(false, Ordering::SeqCst)
    {
      tokio::time::sleep(
        Duration::from_secs(10)
      )
      .await;
    }
    snapshot
  }

  async fn fetch_events_for_range(
    &self,
    start: NaiveDate,
    end: NaiveDate
  ) -> anyhow::Result<Vec<Event>> {
    let snapshot = self.select(start, end);
    let stalled = self
      .stall_next_range_read
      .swap(false, Ordering::SeqCst)
      || (self
        .slow_october
        .load(Ordering::SeqCst)
        && start.month() == 10);
    let delay = if stalled {
      Duration::from_secs(10)
    } else {
      Duration::from_millis(100)
    };
    tokio::time::sleep(delay).await;
    snapshot
  }

  async fn fetch_earliest_on_or_after(
    &self,
    date: NaiveDate
  ) -> anyhow::Result<Option<Event>> {
    Ok(self
      .select(date, NaiveDate::MAX)?
      .into_iter()
      .next())
  }

  fn subscribe(
    &self
  ) -> broadcast::Receiver<StoreChange> {
    self.changes.subscribe()
  }
}

fn options(
  granularity: Granularity
) -> RefreshOptions {
  RefreshOptions {
    granularity,
    data_interval: Duration::from_secs(
      3600
    ),
    ..RefreshOptions::default()
  }
}

async fn wait_until(
  rx: &mut watch::Receiver<DisplayState>,
  what: &str,
  predicate: impl FnMut(&DisplayState) -> bool
) -> DisplayState {
  tokio::time::timeout(
    Duration::from_secs(600),
    rx.wait_for(predicate)
  )
  .await
  .unwrap_or_else(|_| {
    panic!("timed out waiting for {what}")
  })
  .expect("refresh loop alive")
  .clone()
}

async fn first_load(
  rx: &mut watch::Receiver<DisplayState>
) -> DisplayState {
  wait_until(rx, "first load", |state| {
    state.phase == LoadPhase::Ready
      && state.refreshed_at.is_some()
  })
  .await
}

fn twin_masses() -> Vec<Event> {
  vec![
    mass(1, "2026-10-18", 8, 0, "Main Church"),
    mass(2, "2026-10-18", 8, 0, "Square"),
    mass(3, "2026-10-19", 5, 0, "Main Church"),
  ]
}

#[tokio::test(start_paused = true)]
async fn publishes_countdown_then_happening() {
  let store = MemoryStore::new(twin_masses());
  let clock = ManualClock::new(instant(
    "2026-10-18",
    7,
    50,
    0
  ));
  let handle = RefreshLoop::spawn(
    store,
    clock.clone(),
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();

  let state =
    wait_until(&mut rx, "countdown", |state| {
      matches!(
        state.status,
        Status::Countdown { .. }
      )
    })
    .await;
  assert_eq!(
    state.countdown.as_deref(),
    Some("10:00")
  );
  assert_eq!(state.status.events().len(), 2);

  clock.set(instant("2026-10-18", 8, 5, 0));
  let state =
    wait_until(&mut rx, "happening", |state| {
      matches!(
        state.status,
        Status::Happening { .. }
      )
    })
    .await;
  assert_eq!(state.countdown, None);
  assert_eq!(
    handle.current_status(),
    state.status
  );

  clock.set(instant("2026-10-18", 8, 30, 0));
  let state = wait_until(
    &mut rx,
    "tomorrow's first mass",
    |state| {
      state.status.is_fallback_to_next_day()
        == Some(true)
    }
  )
  .await;
  assert_eq!(
    state.status.events()[0].date,
    date("2026-10-19")
  );

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn keeps_last_snapshot_when_fetch_fails() {
  let store = MemoryStore::new(twin_masses());
  let clock = ManualClock::new(instant(
    "2026-10-18",
    7,
    50,
    0
  ));
  let handle = RefreshLoop::spawn(
    store.clone(),
    clock,
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();
  first_load(&mut rx).await;

  store.offline.store(true, Ordering::SeqCst);
  handle.refresh();
  let state = wait_until(
    &mut rx,
    "fetch failure",
    |state| {
      state.phase == LoadPhase::Ready
        && state.last_error.is_some()
    }
  )
  .await;

  assert!(
    state
      .last_error
      .as_deref()
      .is_some_and(|message| {
        message.contains("store offline")
      })
  );
  assert_eq!(state.today_events.len(), 2);
  assert!(matches!(
    state.status,
    Status::Countdown { seconds: 600, .. }
  ));

  store.offline.store(false, Ordering::SeqCst);
  handle.refresh();
  wait_until(&mut rx, "recovery", |state| {
    state.last_error.is_none()
  })
  .await;

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn successful_range_fetch_clears_the_error()
{
  let store = MemoryStore::new(twin_masses());
  let clock = ManualClock::new(instant(
    "2026-10-18",
    7,
    0,
    0
  ));
  let handle = RefreshLoop::spawn(
    store.clone(),
    clock,
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();
  first_load(&mut rx).await;

  store.offline.store(true, Ordering::SeqCst);
  handle.set_granularity(Granularity::Week);
  wait_until(
    &mut rx,
    "range failure",
    |state| {
      state.phase == LoadPhase::Ready
        && state.last_error.is_some()
    }
  )
  .await;

  store.offline.store(false, Ordering::SeqCst);
  handle.navigate(Direction::Prev);
  let state = wait_until(
    &mut rx,
    "range success",
    |state| {
      state.phase == LoadPhase::Ready
        && state.last_error.is_none()
    }
  )
  .await;
  assert_eq!(
    (state.range.start, state.range.end),
    (date("2026-10-05"), date("2026-10-11"))
  );

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn navigation_updates_range_before_fetch_lands()
{
  let store = MemoryStore::new(vec![
    mass(1, "2026-10-13", 5, 0, "Main Church"),
    mass(2, "2026-10-18", 8, 0, "Square"),
    mass(3, "2026-11-02", 5, 0, "Main Church"),
  ]);
  let clock = ManualClock::new(instant(
    "2026-10-18",
    7,
    0,
    0
  ));
  let handle = RefreshLoop::spawn(
    store,
    clock,
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();

  let state =
    wait_until(&mut rx, "day range", |state| {
      state.range_events.len() == 1
    })
    .await;
  assert_eq!(
    state.range.start,
    date("2026-10-18")
  );

  handle.set_granularity(Granularity::Week);
  let range = handle.current_range();
  assert_eq!(
    (range.start, range.end),
    (date("2026-10-12"), date("2026-10-18"))
  );
  assert!(handle.state().range_events.is_empty());
  wait_until(&mut rx, "week events", |state| {
    state.range_events.len() == 2
  })
  .await;

  handle.set_granularity(Granularity::Month);
  handle.navigate(Direction::Next);
  let range = handle.current_range();
  assert_eq!(
    (range.start, range.end),
    (date("2026-11-01"), date("2026-11-30"))
  );
  let state = wait_until(
    &mut rx,
    "november events",
    |state| {
      state.range_events.iter().any(|event| {
        event.date == date("2026-11-02")
      })
    }
  )
  .await;
  assert_eq!(state.range_events.len(), 1);

  handle.jump_to(date("2026-10-01"));
  assert_eq!(
    handle.current_range().start,
    date("2026-10-01")
  );
  wait_until(
    &mut rx,
    "october events",
    |state| state.range_events.len() == 2
  )
  .await;

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn discards_results_for_a_range_left_behind()
{
  let store = MemoryStore::new(vec![
    mass(1, "2026-10-18", 8, 0, "Square"),
    mass(2, "2026-11-02", 5, 0, "Main Church"),
  ]);
  let clock = ManualClock::new(instant(
    "2026-10-18",
    7,
    0,
    0
  ));
  let handle = RefreshLoop::spawn(
    store.clone(),
    clock,
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();
  wait_until(&mut rx, "first load", |state| {
    state.range_events.len() == 1
  })
  .await;

  store
    .slow_october
    .store(true, Ordering::SeqCst);
  handle.set_granularity(Granularity::Month);
  handle.navigate(Direction::Next);

  wait_until(
    &mut rx,
    "november events",
    |state| {
      state.range_events.iter().any(|event| {
        event.date == date("2026-11-02")
      })
    }
  )
  .await;
  tokio::time::sleep(Duration::from_secs(30))
    .await;

  let state = handle.state();
  assert_eq!(
    state.range.start,
    date("2026-11-01")
  );
  assert!(
    state
      .range_events
      .iter()
      .all(|event| state.range.contains(event.date))
  );
  assert_eq!(state.range_events.len(), 1);

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn older_overlapping_fetches_never_replace_newer_ones()
{
  let store = MemoryStore::new(twin_masses());
  let clock = ManualClock::new(instant(
    "2026-10-18",
    6,
    0,
    0
  ));
  let handle = RefreshLoop::spawn(
    store.clone(),
    clock,
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();
  let state = first_load(&mut rx).await;
  assert_eq!(state.today_events.len(), 2);

  store
    .stall_next_day_read
    .store(true, Ordering::SeqCst);
  store
    .stall_next_range_read
    .store(true, Ordering::SeqCst);
  handle.refresh();
  tokio::time::sleep(Duration::from_millis(1))
    .await;

  store.insert(mass(
    4,
    "2026-10-18",
    6,
    10,
    "Chapel"
  ));
  wait_until(
    &mut rx,
    "newer snapshot",
    |state| {
      state.today_events.len() == 3
        && state.range_events.len() == 3
    }
  )
  .await;

  tokio::time::sleep(Duration::from_secs(30))
    .await;
  let state = handle.state();
  assert_eq!(state.today_events.len(), 3);
  assert_eq!(state.range_events.len(), 3);
  assert!(matches!(
    state.status,
    Status::Countdown { seconds: 600, .. }
  ));

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn store_changes_trigger_an_early_fetch() {
  let store = MemoryStore::new(twin_masses());
  let clock = ManualClock::new(instant(
    "2026-10-18",
    6,
    0,
    0
  ));
  let handle = RefreshLoop::spawn(
    store.clone(),
    clock,
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();
  wait_until(&mut rx, "first load", |state| {
    state.today_events.len() == 2
  })
  .await;

  store.insert(mass(
    4,
    "2026-10-18",
    6,
    10,
    "Chapel"
  ));
  let state = wait_until(
    &mut rx,
    "inserted event",
    |state| state.today_events.len() == 3
  )
  .await;
  assert!(matches!(
    state.status,
    Status::Countdown { seconds: 600, .. }
  ));

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rolls_over_to_the_new_day() {
  let store = MemoryStore::new(twin_masses());
  let clock = ManualClock::new(instant(
    "2026-10-18",
    23,
    59,
    0
  ));
  let handle = RefreshLoop::spawn(
    store,
    clock.clone(),
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();

  wait_until(
    &mut rx,
    "tomorrow fallback",
    |state| {
      state.status.is_fallback_to_next_day()
        == Some(true)
    }
  )
  .await;

  clock.set(instant("2026-10-19", 0, 0, 30));
  let state = wait_until(
    &mut rx,
    "same-day upcoming",
    |state| {
      state.today == date("2026-10-19")
        && state.status.is_fallback_to_next_day()
          == Some(false)
    }
  )
  .await;
  assert_eq!(state.today_events.len(), 1);

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rollover_promotes_the_fallback_while_offline()
{
  let store = MemoryStore::new(twin_masses());
  let clock = ManualClock::new(instant(
    "2026-10-18",
    23,
    59,
    0
  ));
  let handle = RefreshLoop::spawn(
    store.clone(),
    clock.clone(),
    options(Granularity::Day)
  );
  let mut rx = handle.subscribe();
  wait_until(
    &mut rx,
    "tomorrow fallback",
    |state| {
      state.phase == LoadPhase::Ready
        && state.fallback.is_some()
    }
  )
  .await;

  store.offline.store(true, Ordering::SeqCst);
  clock.set(instant("2026-10-19", 4, 50, 0));
  let state = wait_until(
    &mut rx,
    "countdown on the new day",
    |state| {
      state.today == date("2026-10-19")
        && matches!(
          state.status,
          Status::Countdown { .. }
        )
    }
  )
  .await;
  assert_eq!(
    state.countdown.as_deref(),
    Some("10:00")
  );
  assert_eq!(state.today_events.len(), 1);
  assert_eq!(
    state.today_events[0].location,
    "Main Church"
  );
  assert!(state.fallback.is_none());

  wait_until(&mut rx, "fetch failure", |state| {
    state.last_error.is_some()
  })
  .await;

  clock.set(instant("2026-10-19", 5, 5, 0));
  wait_until(&mut rx, "happening", |state| {
    matches!(
      state.status,
      Status::Happening { .. }
    )
  })
  .await;

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rollover_uses_loaded_range_rows_for_the_new_day()
{
  let store = MemoryStore::new(vec![
    mass(1, "2026-10-19", 5, 0, "Main Church"),
    mass(2, "2026-10-19", 5, 0, "Square"),
  ]);
  let clock = ManualClock::new(instant(
    "2026-10-18",
    23,
    59,
    0
  ));
  let handle = RefreshLoop::spawn(
    store.clone(),
    clock.clone(),
    options(Granularity::Month)
  );
  let mut rx = handle.subscribe();
  wait_until(&mut rx, "month rows", |state| {
    state.phase == LoadPhase::Ready
      && state.range_events.len() == 2
  })
  .await;

  store.offline.store(true, Ordering::SeqCst);
  clock.set(instant("2026-10-19", 4, 50, 0));
  let state = wait_until(
    &mut rx,
    "twin countdown on the new day",
    |state| {
      state.today == date("2026-10-19")
        && matches!(
          state.status,
          Status::Countdown { .. }
        )
    }
  )
  .await;
  assert_eq!(state.status.events().len(), 2);

  handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_state_channel() {
  let store = MemoryStore::new(twin_masses());
  let clock = ManualClock::new(instant(
    "2026-10-18",
    7,
    50,
    0
  ));
  let handle = RefreshLoop::spawn(
    store,
    clock,
    options(Granularity::Day)
  );
  let rx = handle.subscribe();
  assert_eq!(
    handle.state().phase,
    LoadPhase::Idle
  );

  handle.shutdown().await;
  assert!(rx.has_changed().is_err());
}
