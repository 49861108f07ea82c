use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{
  ArgAction,
  Args,
  Parser,
  Subcommand
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::calendar::Granularity;
use crate::event::EventId;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
  pub cleaned_args: Vec<OsString>,
  pub rc_overrides: Vec<(String, String)>
}

#[derive(Debug, Clone)]
pub struct KeyVal {
  pub key:   String,
  pub value: String
}

impl std::str::FromStr for KeyVal {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    let (k, v) =
      s.split_once('=').ok_or_else(|| {
        anyhow!(
          "expected KEY=VALUE, got: {s}"
        )
      })?;
    Ok(Self {
      key:   k.trim().to_string(),
      value: v.trim().to_string()
    })
  }
}

fn parse_granularity(
  raw: &str
) -> Result<Granularity, String> {
  Granularity::from_key(raw).ok_or_else(
    || {
      format!(
        "expected day, week, month or \
         year, got: {raw}"
      )
    }
  )
}

fn parse_event_id(
  raw: &str
) -> Result<EventId, String> {
  raw
    .parse::<EventId>()
    .map_err(|err| err.to_string())
}

#[derive(Parser, Debug, Clone)]
#[command(
  name = "vesper",
  version,
  about = "Vesper: live status board and \
           calendar for a venue's event \
           schedule",
  disable_help_subcommand = true
)]
pub struct GlobalCli {
  #[arg(
    short = 'v',
    long = "verbose",
    action = ArgAction::Count,
    global = true
  )]
  pub verbose: u8,

  #[arg(
    short = 'q',
    long = "quiet",
    action = ArgAction::Count,
    global = true
  )]
  pub quiet: u8,

  #[arg(
    long = "rc",
    value_parser = clap::builder::ValueParser::new(
      |s: &str| s.parse::<KeyVal>()
    ),
    action = ArgAction::Append,
    global = true
  )]
  pub rc_overrides: Vec<KeyVal>,

  #[arg(long = "vesperrc", global = true)]
  pub vesperrc: Option<PathBuf>,

  #[arg(long = "data", global = true)]
  pub data: Option<PathBuf>,

  #[command(subcommand)]
  pub command: Option<Command>
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// What the display shows right now.
  Status {
    /// Evaluate at this venue-local
    /// instant instead of now.
    #[arg(long)]
    at:   Option<String>,
    #[arg(long)]
    json: bool
  },
  /// Today's schedule with past, active
  /// and next rows marked.
  Today {
    #[arg(long)]
    at: Option<String>
  },
  /// Resolve a calendar view and list its
  /// events.
  Range {
    #[arg(
      long,
      value_parser = parse_granularity
    )]
    view:   Option<Granularity>,
    #[arg(long)]
    anchor: Option<String>,
    /// Navigate this many views forward
    /// (negative goes back).
    #[arg(
      long,
      default_value_t = 0,
      allow_negative_numbers = true
    )]
    step:   i32
  },
  /// Month grid with per-day event counts.
  Grid {
    #[arg(long)]
    anchor: Option<String>
  },
  /// Twelve month tiles with event counts.
  Year {
    #[arg(long)]
    anchor: Option<String>
  },
  /// Seven days starting at --from,
  /// grouped by day.
  Week {
    #[arg(long)]
    from: Option<String>
  },
  List {
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to:   Option<String>
  },
  Info {
    #[arg(value_parser = parse_event_id)]
    id: EventId
  },
  Add(AddArgs),
  Edit(EditArgs),
  Delete {
    #[arg(value_parser = parse_event_id)]
    id: EventId,
    #[arg(long)]
    by: Option<String>
  },
  /// Run the live status display until
  /// interrupted.
  Display {
    #[arg(
      long,
      value_parser = parse_granularity
    )]
    view: Option<Granularity>
  },
  /// Print the effective configuration.
  Show
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
  #[arg(long)]
  pub date:      String,
  #[arg(long)]
  pub time:      String,
  #[arg(long)]
  pub title:     String,
  #[arg(long)]
  pub location:  String,
  #[arg(long)]
  pub celebrant: Option<String>,
  #[arg(long)]
  pub note:      Option<String>,
  #[arg(long)]
  pub by:        Option<String>
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
  #[arg(value_parser = parse_event_id)]
  pub id:        EventId,
  #[arg(long)]
  pub date:      Option<String>,
  #[arg(long)]
  pub time:      Option<String>,
  #[arg(long)]
  pub title:     Option<String>,
  #[arg(long)]
  pub location:  Option<String>,
  /// Empty string clears the field.
  #[arg(long)]
  pub celebrant: Option<String>,
  /// Empty string clears the field.
  #[arg(long)]
  pub note:      Option<String>,
  #[arg(long)]
  pub by:        Option<String>
}

pub fn init_tracing(
  verbose: u8,
  quiet: u8
) -> anyhow::Result<()> {
  let default_level = if quiet >= 2 {
    "error"
  } else if quiet == 1 {
    "warn"
  } else if verbose >= 3 {
    "trace"
  } else if verbose == 2 {
    "debug"
  } else if verbose == 1 {
    "info"
  } else {
    "warn"
  };

  let env_filter =
    EnvFilter::try_from_default_env()
      .or_else(|_| {
        EnvFilter::try_new(default_level)
      })
      .map_err(|e| {
        anyhow!(
          "invalid RUST_LOG / log filter: \
           {e}"
        )
      })?;

  let init_result =
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_writer(std::io::stderr)
      .with_target(true)
      .with_level(true)
      .with_thread_ids(true)
      .with_ansi(
        std::io::stderr().is_terminal()
      )
      .try_init();

  if let Err(err) = init_result {
    debug!(
      error = %err,
      "tracing subscriber already set, \
       continuing"
    );
  }

  Ok(())
}

/// Pulls positional `rc.KEY=VALUE` (or
/// `rc.KEY:VALUE`) overrides out of the
/// argument list before clap sees it.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(
  raw: &[OsString]
) -> anyhow::Result<PreprocessedArgs> {
  let mut cleaned =
    Vec::with_capacity(raw.len());
  let mut overrides: Vec<(
    String,
    String
  )> = Vec::new();

  let mut iter = raw.iter().cloned();
  if let Some(bin) = iter.next() {
    cleaned.push(bin);
  }

  for arg in iter {
    let s = arg.to_string_lossy();
    if let Some(rest) = s.strip_prefix("rc.")
    {
      let parsed = rest
        .split_once('=')
        .or_else(|| rest.split_once(':'));
      if let Some((k, v)) = parsed {
        debug!(
          key = %k,
          value = %v,
          "captured positional rc override"
        );
        overrides.push((
          k.to_string(),
          v.to_string()
        ));
        continue;
      }
    }

    cleaned.push(arg);
  }

  Ok(PreprocessedArgs {
    cleaned_args: cleaned,
    rc_overrides: overrides
  })
}

#[cfg(test)]
mod tests {
  use std::ffi::OsString;

  use clap::Parser;

  use super::{
    Command,
    GlobalCli,
    preprocess_args
  };
  use crate::calendar::Granularity;
  use crate::event::EventId;

  fn args(items: &[&str]) -> Vec<OsString> {
    items
      .iter()
      .map(OsString::from)
      .collect()
  }

  #[test]
  fn positional_rc_overrides_are_extracted()
  {
    let pre = preprocess_args(&args(&[
      "vesper",
      "rc.color=off",
      "status",
      "rc.event.duration:45"
    ]))
    .expect("preprocess");
    assert_eq!(
      pre.cleaned_args,
      args(&["vesper", "status"])
    );
    assert_eq!(
      pre.rc_overrides,
      vec![
        (
          "color".to_string(),
          "off".to_string()
        ),
        (
          "event.duration".to_string(),
          "45".to_string()
        ),
      ]
    );
  }

  #[test]
  fn range_accepts_negative_steps_and_views()
  {
    let cli = GlobalCli::try_parse_from([
      "vesper", "range", "--view", "month",
      "--step", "-2"
    ])
    .expect("parse range");
    match cli.command {
      | Some(Command::Range {
        view,
        step,
        ..
      }) => {
        assert_eq!(
          view,
          Some(Granularity::Month)
        );
        assert_eq!(step, -2);
      }
      | other => {
        panic!("unexpected command: {other:?}")
      }
    }
  }

  #[test]
  fn global_flags_follow_subcommands() {
    let cli = GlobalCli::try_parse_from([
      "vesper",
      "info",
      "12",
      "--rc",
      "color=off",
      "-vv"
    ])
    .expect("parse info");
    assert_eq!(cli.verbose, 2);
    assert_eq!(cli.rc_overrides.len(), 1);
    assert!(matches!(
      cli.command,
      Some(Command::Info {
        id: EventId::Number(12)
      })
    ));
  }

  #[test]
  fn rejects_unknown_view() {
    assert!(
      GlobalCli::try_parse_from([
        "vesper", "display", "--view",
        "decade"
      ])
      .is_err()
    );
  }
}
