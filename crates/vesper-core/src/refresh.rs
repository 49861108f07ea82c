use std::sync::Arc;
use std::time::Duration;

use chrono::{
  NaiveDate,
  NaiveDateTime
};
use serde::Serialize;
use tokio::sync::{
  broadcast,
  mpsc,
  watch
};
use tokio::task::{
  JoinError,
  JoinHandle,
  JoinSet
};
use tokio::time::MissedTickBehavior;
use tracing::{
  debug,
  info,
  warn
};

use crate::calendar::{
  self,
  CalendarRange,
  Direction,
  Granularity
};
use crate::countdown::format_countdown;
use crate::datetime::Clock;
use crate::event::Event;
use crate::status::{
  EngineConfig,
  Status,
  compute_status
};
use crate::store::{
  EventStore,
  StoreChange
};

const SECOND_TICK: Duration =
  Duration::from_secs(1);

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize
)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
  Idle,
  Loading,
  Ready
}

/// Everything the display and the admin
/// browser read. Replaced as a whole on
/// every update.
#[derive(Debug, Clone)]
pub struct DisplayState {
  pub phase:        LoadPhase,
  pub today:        NaiveDate,
  pub status:       Status,
  pub countdown:    Option<String>,
  pub today_events: Arc<Vec<Event>>,
  pub fallback:     Option<Event>,
  pub range:        CalendarRange,
  pub range_events: Arc<Vec<Event>>,
  /// Last fetch failure, for
  /// administrative consumers only.
  pub last_error:   Option<String>,
  pub refreshed_at: Option<NaiveDateTime>
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshOptions {
  pub engine:        EngineConfig,
  pub data_interval: Duration,
  pub granularity:   Granularity,
  pub anchor:        Option<NaiveDate>
}

impl Default for RefreshOptions {
  fn default() -> Self {
    Self {
      engine:        EngineConfig::default(),
      data_interval: Duration::from_secs(
        30
      ),
      granularity:   Granularity::Day,
      anchor:        None
    }
  }
}

#[derive(Debug)]
enum Command {
  FetchRange,
  Refresh,
  Shutdown
}

enum FetchOutcome {
  Today {
    date:       NaiveDate,
    generation: u64,
    result: anyhow::Result<(
      Vec<Event>,
      Option<Event>
    )>
  },
  Range {
    range:      CalendarRange,
    generation: u64,
    result:     anyhow::Result<Vec<Event>>
  }
}

pub struct RefreshLoop<S, C> {
  store:         Arc<S>,
  clock:         Arc<C>,
  engine:        EngineConfig,
  state:         Arc<watch::Sender<DisplayState>>,
  fetches:       JoinSet<FetchOutcome>,
  today:         NaiveDate,
  /// Stamped on every fetch in start
  /// order.
  generation:    u64,
  applied_today: u64,
  applied_range: u64
}

impl<S, C> RefreshLoop<S, C>
where
  S: EventStore,
  C: Clock
{
  /// Starts the loop on the current
  /// tokio runtime.
  pub fn spawn(
    store: Arc<S>,
    clock: Arc<C>,
    options: RefreshOptions
  ) -> RefreshHandle {
    let today = clock.today();
    let range = calendar::resolve_range(
      options.granularity,
      options.anchor.unwrap_or(today)
    );
    let (state, receiver) =
      watch::channel(DisplayState {
        phase: LoadPhase::Idle,
        today,
        status: Status::Finished,
        countdown: None,
        today_events: Arc::new(
          Vec::new()
        ),
        fallback: None,
        range,
        range_events: Arc::new(
          Vec::new()
        ),
        last_error: None,
        refreshed_at: None
      });
    let state = Arc::new(state);
    let (commands, command_rx) =
      mpsc::unbounded_channel();
    let changes = store.subscribe();

    let refresh_loop = RefreshLoop {
      store,
      clock,
      engine: options.engine,
      state: Arc::clone(&state),
      fetches: JoinSet::new(),
      today,
      generation: 0,
      applied_today: 0,
      applied_range: 0
    };
    info!(
      %today,
      granularity = range.granularity.as_key(),
      interval_secs = options.data_interval.as_secs(),
      "starting refresh loop"
    );
    let task =
      tokio::spawn(refresh_loop.run(
        command_rx,
        changes,
        options.data_interval
      ));

    RefreshHandle {
      state,
      receiver,
      commands,
      task
    }
  }

  async fn run(
    mut self,
    mut commands: mpsc::UnboundedReceiver<
      Command
    >,
    mut changes: broadcast::Receiver<
      StoreChange
    >,
    data_interval: Duration
  ) {
    let mut second =
      tokio::time::interval(SECOND_TICK);
    second.set_missed_tick_behavior(
      MissedTickBehavior::Skip
    );
    let mut data =
      tokio::time::interval(data_interval);
    data.set_missed_tick_behavior(
      MissedTickBehavior::Delay
    );
    let mut changes_open = true;

    loop {
      tokio::select! {
        _ = second.tick() => self.on_second_tick(),
        _ = data.tick() => self.start_data_tick(),
        change = changes.recv(), if changes_open => match change {
          | Ok(change) => {
            debug!(
              ?change,
              "store changed; refreshing early"
            );
            self.start_data_tick();
            data.reset();
          }
          | Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(
              skipped,
              "missed store changes; refreshing early"
            );
            self.start_data_tick();
            data.reset();
          }
          | Err(broadcast::error::RecvError::Closed) => {
            warn!(
              "store change channel closed; \
               relying on interval refresh"
            );
            changes_open = false;
          }
        },
        command = commands.recv() => match command {
          | Some(Command::FetchRange) => {
            self.start_range_fetch()
          }
          | Some(Command::Refresh) => {
            self.start_data_tick()
          }
          | Some(Command::Shutdown)
          | None => break
        },
        Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => {
          self.apply(joined);
        }
      }
    }

    self.fetches.abort_all();
    info!("refresh loop stopped");
  }

  fn on_second_tick(&mut self) {
    let now = self.clock.now();
    if now.date() != self.today {
      info!(
        from = %self.today,
        to = %now.date(),
        "venue date rolled over"
      );
      self.today = now.date();
      let today = self.today;
      self.state.send_modify(|state| {
        carry_into_new_day(state, today)
      });
      self.start_data_tick();
    }
    self.recompute(now);
  }

  fn recompute(
    &self,
    now: NaiveDateTime
  ) {
    let engine = self.engine;
    self.state.send_if_modified(
      |state| {
        let status = compute_status(
          &state.today_events,
          state.fallback.as_ref(),
          now,
          &engine
        );
        let countdown = status
          .countdown_seconds()
          .map(format_countdown);
        if state.status == status
          && state.countdown == countdown
        {
          return false;
        }
        state.status = status;
        state.countdown = countdown;
        true
      }
    );
  }

  fn start_data_tick(&mut self) {
    self.start_today_fetch();
    self.start_range_fetch();
  }

  fn next_generation(&mut self) -> u64 {
    self.generation += 1;
    self.generation
  }

  fn start_today_fetch(&mut self) {
    let store = Arc::clone(&self.store);
    let date = self.today;
    let generation =
      self.next_generation();
    self.fetches.spawn(async move {
      let result = async {
        let events = store
          .fetch_events_for_date(date)
          .await?;
        let fallback =
          match date.succ_opt() {
            | Some(tomorrow) => store
              .fetch_earliest_on_or_after(
                tomorrow
              )
              .await?
              .filter(|event| {
                event.date == tomorrow
              }),
            | None => None
          };
        Ok::<_, anyhow::Error>((
          events, fallback
        ))
      }
      .await;
      FetchOutcome::Today {
        date,
        generation,
        result
      }
    });
    self.mark_loading();
  }

  fn start_range_fetch(&mut self) {
    let store = Arc::clone(&self.store);
    let range = self.state.borrow().range;
    let generation =
      self.next_generation();
    self.fetches.spawn(async move {
      let result = store
        .fetch_events_for_range(
          range.start,
          range.end
        )
        .await;
      FetchOutcome::Range {
        range,
        generation,
        result
      }
    });
    self.mark_loading();
  }

  fn mark_loading(&self) {
    self.state.send_if_modified(
      |state| {
        if state.phase == LoadPhase::Loading
        {
          return false;
        }
        state.phase = LoadPhase::Loading;
        true
      }
    );
  }

  fn apply(
    &mut self,
    joined: Result<FetchOutcome, JoinError>
  ) {
    match joined {
      | Ok(FetchOutcome::Today {
        date,
        generation,
        result
      }) => {
        self.apply_today(
          date, generation, result
        )
      }
      | Ok(FetchOutcome::Range {
        range,
        generation,
        result
      }) => {
        self.apply_range(
          range, generation, result
        )
      }
      | Err(err) if err.is_cancelled() => {}
      | Err(err) => self.record_failure(
        &anyhow::Error::new(err)
      )
    }

    if self.fetches.is_empty() {
      self.state.send_if_modified(
        |state| {
          if state.phase == LoadPhase::Ready
          {
            return false;
          }
          state.phase = LoadPhase::Ready;
          true
        }
      );
    }
  }

  fn apply_today(
    &mut self,
    date: NaiveDate,
    generation: u64,
    result: anyhow::Result<(
      Vec<Event>,
      Option<Event>
    )>
  ) {
    if date != self.today {
      debug!(
        %date,
        today = %self.today,
        "discarding fetch for a past day"
      );
      return;
    }
    if generation < self.applied_today {
      debug!(
        generation,
        applied = self.applied_today,
        "discarding today fetch overtaken \
         by a newer one"
      );
      return;
    }

    match result {
      | Ok((events, fallback)) => {
        debug!(
          %date,
          generation,
          count = events.len(),
          has_fallback = fallback.is_some(),
          "loaded today's events"
        );
        self.applied_today = generation;
        let now = self.clock.now();
        self.state.send_modify(|state| {
          state.today_events =
            Arc::new(events);
          state.fallback = fallback;
          state.last_error = None;
          state.refreshed_at = Some(now);
        });
        self.recompute(now);
      }
      | Err(err) => {
        self.record_failure(&err)
      }
    }
  }

  fn apply_range(
    &mut self,
    range: CalendarRange,
    generation: u64,
    result: anyhow::Result<Vec<Event>>
  ) {
    if self.state.borrow().range != range {
      debug!(
        start = %range.start,
        end = %range.end,
        "discarding fetch for a stale range"
      );
      return;
    }
    if generation < self.applied_range {
      debug!(
        generation,
        applied = self.applied_range,
        "discarding range fetch overtaken \
         by a newer one"
      );
      return;
    }

    match result {
      | Ok(events) => {
        debug!(
          generation,
          count = events.len(),
          "loaded range events"
        );
        self.applied_range = generation;
        self.state.send_modify(|state| {
          state.range_events =
            Arc::new(events);
          state.last_error = None;
        });
      }
      | Err(err) => {
        self.record_failure(&err)
      }
    }
  }

  fn record_failure(
    &self,
    err: &anyhow::Error
  ) {
    let message = format!("{err:#}");
    warn!(
      error = %message,
      "event fetch failed; keeping last \
       snapshot"
    );
    self.state.send_modify(|state| {
      state.last_error = Some(message)
    });
  }
}

/// Rebuilds the day snapshot from rows
/// already held, so the new day shows its
/// events even while the store is
/// unreachable.
fn carry_into_new_day(
  state: &mut DisplayState,
  today: NaiveDate
) {
  let from_range: Vec<Event> =
    if state.range.contains(today) {
      state
        .range_events
        .iter()
        .filter(|event| event.date == today)
        .cloned()
        .collect()
    } else {
      Vec::new()
    };

  let carried = if !from_range.is_empty()
  {
    from_range
  } else {
    state
      .fallback
      .take()
      .filter(|event| event.date == today)
      .into_iter()
      .collect()
  };

  state.today = today;
  state.today_events = Arc::new(carried);
  state.fallback = None;
}

/// Presentation-side handle to a running
/// [`RefreshLoop`].
pub struct RefreshHandle {
  state:    Arc<watch::Sender<DisplayState>>,
  receiver: watch::Receiver<DisplayState>,
  commands: mpsc::UnboundedSender<Command>,
  task:     JoinHandle<()>
}

impl RefreshHandle {
  pub fn current_status(&self) -> Status {
    self.receiver.borrow().status.clone()
  }

  pub fn current_range(
    &self
  ) -> CalendarRange {
    self.receiver.borrow().range
  }

  pub fn state(&self) -> DisplayState {
    self.receiver.borrow().clone()
  }

  pub fn subscribe(
    &self
  ) -> watch::Receiver<DisplayState> {
    self.receiver.clone()
  }

  pub fn set_granularity(
    &self,
    granularity: Granularity
  ) {
    self.update_range(|range| {
      calendar::resolve_range(
        granularity,
        range.anchor
      )
    });
  }

  pub fn navigate(
    &self,
    direction: Direction
  ) {
    self.update_range(|range| {
      let anchor = calendar::navigate(
        range.granularity,
        range.anchor,
        direction
      );
      calendar::resolve_range(
        range.granularity,
        anchor
      )
    });
  }

  pub fn jump_to(&self, date: NaiveDate) {
    self.update_range(|range| {
      calendar::resolve_range(
        range.granularity,
        date
      )
    });
  }

  /// Runs a data tick now instead of
  /// waiting for the interval.
  pub fn refresh(&self) {
    let _ =
      self.commands.send(Command::Refresh);
  }

  /// Stops every timer and abandons
  /// in-flight fetches.
  pub async fn shutdown(self) {
    let _ =
      self.commands.send(Command::Shutdown);
    if let Err(err) = self.task.await
      && !err.is_cancelled()
    {
      warn!(
        error = %err,
        "refresh loop ended abnormally"
      );
    }
  }

  fn update_range(
    &self,
    next: impl FnOnce(
      &CalendarRange
    ) -> CalendarRange
  ) {
    let changed =
      self.state.send_if_modified(
        |state| {
          let range = next(&state.range);
          if range == state.range {
            return false;
          }
          debug!(
            granularity = range.granularity.as_key(),
            start = %range.start,
            end = %range.end,
            "calendar range changed"
          );
          state.range = range;
          state.range_events =
            Arc::new(Vec::new());
          true
        }
      );
    if changed {
      let _ = self
        .commands
        .send(Command::FetchRange);
    }
  }
}
