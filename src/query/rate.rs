use crate::common::types::DataPoint;
use crate::config::Resolution;

/// Options for the rate post-processor, shaped after the POST JSON form.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RateOptions {
    /// Treat the series as a monotonically increasing counter: a negative
    /// delta means the counter wrapped at `counter_max`.
    pub counter: bool,
    pub counter_max: u64,
    /// Emit 0 instead of a spike when a computed rate exceeds this
    /// (0 disables the check).
    pub reset_value: u64,
    /// Skip negative deltas entirely instead of interpreting a wrap.
    pub drop_resets: bool,
}

impl RateOptions {
    pub fn simple() -> RateOptions {
        RateOptions {
            counter: false,
            counter_max: u64::MAX,
            reset_value: 0,
            drop_resets: false,
        }
    }
}

/// Derivative over one series, in per-second units regardless of timestamp
/// resolution. The first input point anchors the first delta and is dropped
/// from the output.
pub fn calculate_rate(dps: &mut Vec<DataPoint>, options: RateOptions, resolution: Resolution) {
    if dps.is_empty() {
        return;
    }

    let ticks_per_sec = resolution.ticks_per_sec() as f64;
    let mut prev = dps[0];
    let mut emitted = 0usize;

    for i in 1..dps.len() {
        let curr = dps[i];
        let dt_secs = (curr.timestamp - prev.timestamp) as f64 / ticks_per_sec;
        let delta = curr.value - prev.value;

        if options.counter && delta < 0.0 {
            if options.drop_resets {
                prev = curr;
                continue;
            }
            let wrapped = options.counter_max as f64 - prev.value + curr.value;
            let rate = wrapped / dt_secs;
            let value = if options.reset_value != 0 && rate > options.reset_value as f64 {
                0.0
            } else {
                rate
            };
            dps[emitted] = DataPoint::new(curr.timestamp, value);
        } else {
            dps[emitted] = DataPoint::new(curr.timestamp, delta / dt_secs);
        }
        emitted += 1;
        prev = curr;
    }

    dps.truncate(emitted);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dps(points: &[(i64, f64)]) -> Vec<DataPoint> {
        points.iter().map(|(t, v)| DataPoint::new(*t, *v)).collect()
    }

    #[test]
    fn simple_rate_is_delta_over_seconds() {
        let mut series = dps(&[(0, 10.0), (10_000, 30.0), (20_000, 30.0)]);
        calculate_rate(&mut series, RateOptions::simple(), Resolution::Ms);
        assert_eq!(series, dps(&[(10_000, 2.0), (20_000, 0.0)]));
    }

    #[test]
    fn counter_wrap_crosses_zero() {
        // wrap at counter_max=100: (100 - 10 + 3) / 10s
        let mut series = dps(&[(0, 10.0), (10_000, 3.0)]);
        let options = RateOptions {
            counter: true,
            counter_max: 100,
            reset_value: 0,
            drop_resets: false,
        };
        calculate_rate(&mut series, options, Resolution::Ms);
        assert_eq!(series, dps(&[(10_000, 9.3)]));
    }

    #[test]
    fn drop_resets_skips_negative_deltas() {
        let mut series = dps(&[(0, 10.0), (10, 3.0), (20, 5.0)]);
        let options = RateOptions {
            counter: true,
            counter_max: u64::MAX,
            reset_value: 0,
            drop_resets: true,
        };
        calculate_rate(&mut series, options, Resolution::Sec);
        // the reset delta disappears; the next rate uses the reset point
        assert_eq!(series, dps(&[(20, 0.2)]));
    }

    #[test]
    fn reset_value_clamps_spikes_to_zero() {
        let mut series = dps(&[(0, 90.0), (10, 1.0)]);
        let options = RateOptions {
            counter: true,
            counter_max: 1_000_000,
            reset_value: 100,
            drop_resets: false,
        };
        calculate_rate(&mut series, options, Resolution::Sec);
        assert_eq!(series, dps(&[(10, 0.0)]));
    }

    #[test]
    fn seconds_resolution_uses_raw_tick_delta() {
        let mut series = dps(&[(0, 0.0), (10, 50.0)]);
        calculate_rate(&mut series, RateOptions::simple(), Resolution::Sec);
        assert_eq!(series, dps(&[(10, 5.0)]));
    }
}
