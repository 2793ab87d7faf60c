use crate::common::types::Timestamp;
use crate::config::Resolution;
use crate::error::{TsdbError, TsdbResult};
use std::time::Duration;

/// Returns the time duration since UNIX_EPOCH in milliseconds.
pub fn current_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current wall clock in ticks of the given resolution.
pub fn now_ticks(resolution: Resolution) -> Timestamp {
    match resolution {
        Resolution::Ms => current_time_millis(),
        Resolution::Sec => current_time_millis() / 1000,
    }
}

/// Milliseconds per unit suffix. `n` is the OpenTSDB month (30 days).
fn unit_millis(unit: &str) -> Option<i64> {
    let ms = match unit {
        "ms" => 1,
        "s" => 1000,
        "m" => 60 * 1000,
        "h" => 3600 * 1000,
        "d" => 24 * 3600 * 1000,
        "w" => 7 * 24 * 3600 * 1000,
        "n" => 30 * 24 * 3600 * 1000,
        "y" => 365 * 24 * 3600 * 1000,
        _ => return None,
    };
    Some(ms)
}

fn split_unit(arg: &str) -> (&str, &str) {
    let digits = arg
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(arg.len());
    arg.split_at(digits)
}

/// Parse a duration string like `100ms`, `30s`, `1m`, `2h`, `1d`, `1w`.
/// A bare number is taken as seconds.
pub fn parse_duration(arg: &str) -> TsdbResult<Duration> {
    let (digits, unit) = split_unit(arg);
    let n: u64 = digits
        .parse()
        .map_err(|_| TsdbError::InvalidDuration(arg.to_string()))?;
    let millis = if unit.is_empty() {
        n.checked_mul(1000)
    } else {
        unit_millis(unit).and_then(|m| n.checked_mul(m as u64))
    };
    match millis {
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Err(TsdbError::InvalidDuration(arg.to_string())),
    }
}

/// Parse a duration string into ticks of the given resolution, e.g. the
/// `60000ms` / `1m` prefix of a downsample spec.
pub fn parse_interval(arg: &str, resolution: Resolution) -> TsdbResult<i64> {
    let d = parse_duration(arg)?;
    let ticks = resolution.duration_to_ticks(d);
    // sub-resolution intervals round up to a single tick
    Ok(ticks.max(1))
}

/// Parse an absolute or relative timestamp. Relative timestamps take the
/// OpenTSDB form `<N><unit>-ago`, resolved against `now` in the resolution of
/// the data directory.
pub fn parse_timestamp(arg: &str, now: Timestamp, resolution: Resolution) -> TsdbResult<Timestamp> {
    if let Some(rel) = arg.strip_suffix("-ago") {
        let back = parse_interval(rel, resolution)
            .map_err(|_| TsdbError::InvalidTimestamp(arg.to_string()))?;
        return Ok(now - back);
    }
    arg.parse::<i64>()
        .map_err(|_| TsdbError::InvalidTimestamp(arg.to_string()))
}
