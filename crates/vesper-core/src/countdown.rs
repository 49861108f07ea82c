/// Renders remaining seconds as `MM:SS`.
/// Minutes do not roll over into hours, so
/// 4000 seconds is `66:40`.
pub fn format_countdown(
  seconds: u64
) -> String {
  format!(
    "{:02}:{:02}",
    seconds / 60,
    seconds % 60
  )
}

#[cfg(test)]
mod tests {
  use super::format_countdown;

  #[test]
  fn pads_both_fields() {
    assert_eq!(format_countdown(0), "00:00");
    assert_eq!(
      format_countdown(75),
      "01:15"
    );
    assert_eq!(
      format_countdown(900),
      "15:00"
    );
  }

  #[test]
  fn sub_minute_values_stay_in_seconds_field()
  {
    for s in 0..60 {
      assert_eq!(
        format_countdown(s),
        format!("00:{s:02}")
      );
    }
  }

  #[test]
  fn minutes_are_unbounded() {
    assert_eq!(
      format_countdown(4000),
      "66:40"
    );
    assert_eq!(
      format_countdown(6000 * 60 + 5),
      "6000:05"
    );
  }
}
