use std::collections::BTreeMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow,
  bail
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::calendar::Granularity;
use crate::status::{
  DEFAULT_COUNTDOWN_THRESHOLD_MINUTES,
  DEFAULT_EVENT_DURATION_MINUTES,
  EngineConfig
};

const RC_ENV_VAR: &str = "VESPERRC";
const RC_FILE_NAME: &str = ".vesperrc";
const DEFAULT_REFRESH_SECONDS: u64 =
  30;

#[derive(Debug, Clone)]
pub struct Config {
  map: BTreeMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Config {
  pub fn defaults() -> Self {
    let mut cfg = Config {
      map:          BTreeMap::new(),
      loaded_files: vec![]
    };

    cfg.map.insert(
      "data.location".to_string(),
      "~/.vesper".to_string()
    );
    cfg.map.insert(
      "event.duration".to_string(),
      DEFAULT_EVENT_DURATION_MINUTES
        .to_string()
    );
    cfg.map.insert(
      "countdown.threshold".to_string(),
      DEFAULT_COUNTDOWN_THRESHOLD_MINUTES
        .to_string()
    );
    cfg.map.insert(
      "refresh.interval".to_string(),
      DEFAULT_REFRESH_SECONDS
        .to_string()
    );
    cfg.map.insert(
      "calendar.view".to_string(),
      "day".to_string()
    );
    cfg.map.insert(
      "color".to_string(),
      "on".to_string()
    );

    cfg
  }

  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::defaults();

    let rc = resolve_rc_path(
      rc_override
    )?;
    if let Some(path) = rc {
      info!(rc = %path.display(), "loading vesperrc");
      cfg.load_file(&path)?;
    } else {
      warn!(
        "no vesperrc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn iter(
    &self
  ) -> impl Iterator<Item = (&String, &String)>
  {
    self.map.iter()
  }

  pub fn engine(
    &self
  ) -> anyhow::Result<EngineConfig> {
    let event_duration_minutes = self
      .get_u32(
        "event.duration",
        DEFAULT_EVENT_DURATION_MINUTES
      )?;
    if event_duration_minutes == 0 {
      bail!(
        "event.duration must be at \
         least 1 minute"
      );
    }

    let countdown_threshold_minutes =
      self.get_u32(
        "countdown.threshold",
        DEFAULT_COUNTDOWN_THRESHOLD_MINUTES
      )?;

    Ok(EngineConfig {
      event_duration_minutes,
      countdown_threshold_minutes
    })
  }

  pub fn refresh_interval(
    &self
  ) -> anyhow::Result<Duration> {
    let secs = match self
      .get("refresh.interval")
    {
      | Some(raw) => {
        raw.trim().parse::<u64>().map_err(
          |_| {
            anyhow!(
              "invalid refresh.interval \
               '{raw}', expected seconds"
            )
          }
        )?
      }
      | None => DEFAULT_REFRESH_SECONDS
    };
    if secs == 0 {
      bail!(
        "refresh.interval must be \
         greater than zero"
      );
    }
    Ok(Duration::from_secs(secs))
  }

  pub fn default_view(
    &self
  ) -> anyhow::Result<Granularity> {
    let raw = self
      .get("calendar.view")
      .unwrap_or_else(|| {
        "day".to_string()
      });
    Granularity::from_key(&raw)
      .ok_or_else(|| {
        anyhow!(
          "invalid calendar.view \
           '{raw}', expected day, \
           week, month or year"
        )
      })
  }

  fn get_u32(
    &self,
    key: &str,
    default: u32
  ) -> anyhow::Result<u32> {
    match self.get(key) {
      | Some(raw) => {
        raw.trim().parse::<u32>().map_err(
          |_| {
            anyhow!(
              "invalid {key} '{raw}', \
               expected whole minutes"
            )
          }
        )
      }
      | None => Ok(default)
    }
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let mut line = raw_line.trim();
      if line.is_empty()
        || line.starts_with('#')
      {
        continue;
      }

      if let Some((before, _)) =
        line.split_once('#')
      {
        line = before.trim();
      }

      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var(RC_ENV_VAR)
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    warn!(
      "cannot determine home \
       directory; skipping vesperrc"
    );
    return Ok(None);
  };
  let candidate = home.join(RC_FILE_NAME);
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".vesper"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::tempdir;

  use super::*;

  #[test]
  fn defaults_build_engine_config() {
    let cfg = Config::defaults();
    let engine =
      cfg.engine().expect("engine");
    assert_eq!(
      engine,
      EngineConfig::default()
    );
    assert_eq!(
      cfg
        .refresh_interval()
        .expect("interval"),
      Duration::from_secs(30)
    );
    assert_eq!(
      cfg
        .default_view()
        .expect("view"),
      Granularity::Day
    );
  }

  #[test]
  fn loads_file_with_comments_and_include()
  {
    let dir =
      tempdir().expect("tempdir");
    let extra = dir.path().join("extra.rc");
    fs::write(
      &extra,
      "countdown.threshold = 60\n"
    )
    .expect("write include");
    let main = dir.path().join("main.rc");
    fs::write(
      &main,
      "# venue settings\n\
       event.duration = 45 # minutes\n\
       include extra.rc\n\
       calendar.view = week\n"
    )
    .expect("write rc");

    let cfg = Config::load(Some(&main))
      .expect("load rc");
    let engine =
      cfg.engine().expect("engine");
    assert_eq!(
      engine.event_duration_minutes,
      45
    );
    assert_eq!(
      engine
        .countdown_threshold_minutes,
      60
    );
    assert_eq!(
      cfg
        .default_view()
        .expect("view"),
      Granularity::Week
    );
    assert_eq!(cfg.loaded_files.len(), 2);
  }

  #[test]
  fn overrides_strip_rc_prefix() {
    let mut cfg = Config::defaults();
    cfg.apply_overrides(vec![(
      "rc.event.duration".to_string(),
      "20".to_string()
    )]);
    assert_eq!(
      cfg
        .engine()
        .expect("engine")
        .event_duration_minutes,
      20
    );
  }

  #[test]
  fn rejects_invalid_values() {
    let mut cfg = Config::defaults();
    cfg.apply_overrides(vec![(
      "event.duration".to_string(),
      "0".to_string()
    )]);
    assert!(cfg.engine().is_err());

    let mut cfg = Config::defaults();
    cfg.apply_overrides(vec![(
      "countdown.threshold".to_string(),
      "soon".to_string()
    )]);
    let err = cfg
      .engine()
      .expect_err("bad threshold");
    assert!(
      err
        .to_string()
        .contains("countdown.threshold")
    );

    let mut cfg = Config::defaults();
    cfg.apply_overrides(vec![(
      "calendar.view".to_string(),
      "quarter".to_string()
    )]);
    assert!(cfg.default_view().is_err());
  }

  #[test]
  fn rejects_line_without_equals() {
    let dir =
      tempdir().expect("tempdir");
    let main = dir.path().join("bad.rc");
    fs::write(&main, "color on\n")
      .expect("write rc");
    let err = Config::load(Some(&main))
      .expect_err("bad line");
    assert!(
      err
        .to_string()
        .contains("invalid config line")
    );
  }
}
