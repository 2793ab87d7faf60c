use crate::common::time::parse_interval;
use crate::common::types::{DataPoint, Timestamp};
use crate::config::Resolution;
use crate::error::{TsdbError, TsdbResult};

/// Per-interval reduction applied to one series before aggregation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DownsampleFunc {
    Avg,
    Count,
    Dev,
    First,
    Last,
    Max,
    Min,
    /// Quantile in percent, e.g. 99.0 or 99.9.
    Percentile(f64),
    Sum,
    /// Pass samples through untouched.
    None,
}

/// What to emit for empty intervals between samples.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FillPolicy {
    #[default]
    None,
    Nan,
    Null,
    Zero,
}

impl FillPolicy {
    fn value(&self) -> f64 {
        match self {
            FillPolicy::Zero => 0.0,
            // null renders the same as nan on the wire
            _ => f64::NAN,
        }
    }
}

/// Parse an aggregation function name shared by downsamplers and
/// aggregators, e.g. `avg`, `p99`, `p999`.
pub fn parse_function(name: &str) -> TsdbResult<DownsampleFunc> {
    let func = match name {
        "avg" => DownsampleFunc::Avg,
        "count" => DownsampleFunc::Count,
        "dev" => DownsampleFunc::Dev,
        "first" => DownsampleFunc::First,
        "last" => DownsampleFunc::Last,
        "max" => DownsampleFunc::Max,
        "min" => DownsampleFunc::Min,
        "sum" => DownsampleFunc::Sum,
        "none" => DownsampleFunc::None,
        _ => {
            let q = name
                .strip_prefix('p')
                .and_then(|digits| digits.parse::<u32>().ok())
                .filter(|q| (50..=99).contains(q) || *q == 999)
                .ok_or_else(|| TsdbError::InvalidAggregator(name.to_string()))?;
            let quantile = if q == 999 { 99.9 } else { q as f64 };
            DownsampleFunc::Percentile(quantile)
        }
    };
    Ok(func)
}

/// A parsed downsample spec: `<interval>-<function>[-<fill>]`.
#[derive(Clone, Debug, PartialEq)]
pub struct DownsampleSpec {
    pub interval: i64,
    pub func: DownsampleFunc,
    pub fill: FillPolicy,
}

impl DownsampleSpec {
    pub fn parse(spec: &str, resolution: Resolution) -> TsdbResult<DownsampleSpec> {
        let mut parts = spec.splitn(3, '-');
        let interval_str = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TsdbError::InvalidDuration(spec.to_string()))?;
        let func_str = parts
            .next()
            .ok_or_else(|| TsdbError::InvalidAggregator(spec.to_string()))?;

        let interval = parse_interval(interval_str, resolution)?;
        let func = parse_function(func_str)?;
        let fill = match parts.next() {
            None | Some("none") => FillPolicy::None,
            Some("nan") => FillPolicy::Nan,
            Some("null") => FillPolicy::Null,
            Some("zero") => FillPolicy::Zero,
            Some(other) => {
                return Err(TsdbError::InvalidAggregator(format!(
                    "unknown fill policy `{other}`"
                )))
            }
        };
        Ok(DownsampleSpec {
            interval,
            func,
            fill,
        })
    }
}

#[derive(Default)]
struct Accum {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    first: f64,
    last: f64,
    mean: f64,
    m2: f64,
    values: Vec<f64>,
}

impl Accum {
    fn reset(&mut self, value: f64, keep_values: bool) {
        self.count = 1;
        self.sum = value;
        self.min = value;
        self.max = value;
        self.first = value;
        self.last = value;
        self.mean = value;
        self.m2 = 0.0;
        self.values.clear();
        if keep_values {
            self.values.push(value);
        }
    }

    fn add(&mut self, value: f64, keep_values: bool) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
        let new_mean = self.mean + (value - self.mean) / self.count as f64;
        self.m2 += (value - self.mean) * (value - new_mean);
        self.mean = new_mean;
        if keep_values {
            self.values.push(value);
        }
    }
}

/// Linear-interpolation percentile with rank `q/100 * (len + 1)` clamped to
/// `[1, len]`. Empty input is NaN, single value is itself.
pub fn percentile(values: &mut [f64], quantile: f64) -> f64 {
    match values.len() {
        0 => f64::NAN,
        1 => values[0],
        len => {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = quantile / 100.0 * (len + 1) as f64;
            if idx < 1.0 {
                values[0]
            } else if idx >= len as f64 {
                values[len - 1]
            } else {
                let lower = values[idx as usize - 1];
                let upper = values[idx as usize];
                lower + (idx - idx.floor()) * (upper - lower)
            }
        }
    }
}

/// Population standard deviation via Welford; a single value has zero
/// deviation.
pub fn stddev(count: u64, m2: f64) -> f64 {
    if count < 2 {
        0.0
    } else {
        (m2 / count as f64).sqrt()
    }
}

/// Feeds one series' samples in timestamp order and emits one point per
/// aligned interval, filling gaps per the policy. Interval boundaries
/// satisfy `b % interval == 0`.
pub struct Downsampler {
    spec: DownsampleSpec,
    range_start: Timestamp,
    range_end: Timestamp, // inclusive
    current: Option<Timestamp>,
    acc: Accum,
    out: Vec<DataPoint>,
}

impl Downsampler {
    pub fn new(spec: DownsampleSpec, range_start: Timestamp, range_end: Timestamp) -> Downsampler {
        Downsampler {
            spec,
            range_start,
            range_end,
            current: None,
            acc: Accum::default(),
            out: Vec::new(),
        }
    }

    fn step_down(&self, ts: Timestamp) -> Timestamp {
        ts - ts.rem_euclid(self.spec.interval)
    }

    /// First interval boundary at or after the query start.
    fn first_fill_boundary(&self) -> Timestamp {
        let aligned = self.step_down(self.range_start);
        if aligned < self.range_start {
            aligned + self.spec.interval
        } else {
            aligned
        }
    }

    fn keeps_values(&self) -> bool {
        matches!(self.spec.func, DownsampleFunc::Percentile(_))
    }

    fn emit(&mut self, bucket: Timestamp) {
        let value = match self.spec.func {
            DownsampleFunc::Avg => self.acc.sum / self.acc.count as f64,
            DownsampleFunc::Count => self.acc.count as f64,
            DownsampleFunc::Dev => stddev(self.acc.count, self.acc.m2),
            DownsampleFunc::First => self.acc.first,
            DownsampleFunc::Last => self.acc.last,
            DownsampleFunc::Max => self.acc.max,
            DownsampleFunc::Min => self.acc.min,
            DownsampleFunc::Percentile(q) => percentile(&mut self.acc.values, q),
            DownsampleFunc::Sum => self.acc.sum,
            DownsampleFunc::None => unreachable!("pass-through emits directly"),
        };
        self.out.push(DataPoint::new(bucket, value));
    }

    fn fill_to(&mut self, to: Timestamp) {
        if self.spec.fill == FillPolicy::None {
            return;
        }
        let mut ts = match self.current {
            Some(bucket) => bucket + self.spec.interval,
            None => self.first_fill_boundary(),
        };
        while ts < to {
            self.out.push(DataPoint::new(ts, self.spec.fill.value()));
            ts += self.spec.interval;
        }
    }

    pub fn add(&mut self, dp: DataPoint) {
        if self.spec.func == DownsampleFunc::None {
            self.out.push(dp);
            return;
        }
        let bucket = self.step_down(dp.timestamp);
        match self.current {
            Some(current) if current == bucket => {
                self.acc.add(dp.value, self.keeps_values());
            }
            _ => {
                if let Some(open) = self.current {
                    self.emit(open);
                }
                self.fill_to(bucket);
                let keep = self.keeps_values();
                self.acc.reset(dp.value, keep);
                self.current = Some(bucket);
            }
        }
    }

    /// Emit the open interval and trailing fill up to the query end.
    pub fn finish(mut self) -> Vec<DataPoint> {
        if let Some(bucket) = self.current {
            self.emit(bucket);
            if self.spec.fill != FillPolicy::None {
                let mut ts = bucket + self.spec.interval;
                while ts <= self.range_end {
                    self.out.push(DataPoint::new(ts, self.spec.fill.value()));
                    ts += self.spec.interval;
                }
            }
        }
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(spec: &str, range: (i64, i64), points: &[(i64, f64)]) -> Vec<(i64, f64)> {
        let spec = DownsampleSpec::parse(spec, Resolution::Ms).unwrap();
        let mut ds = Downsampler::new(spec, range.0, range.1);
        for (ts, value) in points {
            ds.add(DataPoint::new(*ts, *value));
        }
        ds.finish().iter().map(|dp| (dp.timestamp, dp.value)).collect()
    }

    #[test]
    fn parses_spec_forms() {
        let spec = DownsampleSpec::parse("1m-avg", Resolution::Ms).unwrap();
        assert_eq!(spec.interval, 60_000);
        assert_eq!(spec.func, DownsampleFunc::Avg);
        assert_eq!(spec.fill, FillPolicy::None);

        let spec = DownsampleSpec::parse("60000ms-avg-zero", Resolution::Ms).unwrap();
        assert_eq!(spec.interval, 60_000);
        assert_eq!(spec.fill, FillPolicy::Zero);

        let spec = DownsampleSpec::parse("30s-p99", Resolution::Sec).unwrap();
        assert_eq!(spec.interval, 30);
        assert_eq!(spec.func, DownsampleFunc::Percentile(99.0));

        assert!(DownsampleSpec::parse("1m-wat", Resolution::Ms).is_err());
        assert!(DownsampleSpec::parse("1m-avg-sideways", Resolution::Ms).is_err());
    }

    #[test]
    fn averages_within_aligned_intervals() {
        let got = run(
            "60000ms-avg",
            (0, 240_000),
            &[(10_000, 1.0), (20_000, 3.0), (70_000, 5.0)],
        );
        assert_eq!(got, vec![(0, 2.0), (60_000, 5.0)]);
    }

    #[test]
    fn fill_zero_covers_gaps_and_tail() {
        // gaps inside the range fill with zero, and so does the tail out to
        // the query end
        let got = run(
            "60000ms-avg-zero",
            (3_000_000, 3_240_000),
            &[(3_000_000, 1.0), (3_060_000, 2.0), (3_180_000, 4.0)],
        );
        assert_eq!(
            got,
            vec![
                (3_000_000, 1.0),
                (3_060_000, 2.0),
                (3_120_000, 0.0),
                (3_180_000, 4.0),
                (3_240_000, 0.0),
            ]
        );
    }

    #[test]
    fn fill_nan_emits_nan_gaps() {
        let got = run(
            "60000ms-sum-nan",
            (0, 120_000),
            &[(0, 1.0), (120_000, 2.0)],
        );
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], (0, 1.0));
        assert_eq!(got[1].0, 60_000);
        assert!(got[1].1.is_nan());
        assert_eq!(got[2], (120_000, 2.0));
    }

    #[test]
    fn functions_reduce_each_interval() {
        let points = [(0i64, 4.0), (1_000, 2.0), (2_000, 6.0)];
        assert_eq!(run("1m-min", (0, 60_000), &points)[0].1, 2.0);
        assert_eq!(run("1m-max", (0, 60_000), &points)[0].1, 6.0);
        assert_eq!(run("1m-sum", (0, 60_000), &points)[0].1, 12.0);
        assert_eq!(run("1m-count", (0, 60_000), &points)[0].1, 3.0);
        assert_eq!(run("1m-first", (0, 60_000), &points)[0].1, 4.0);
        assert_eq!(run("1m-last", (0, 60_000), &points)[0].1, 6.0);
    }

    #[test]
    fn dev_is_population_stddev() {
        let got = run("1m-dev", (0, 60_000), &[(0, 2.0), (1_000, 4.0)]);
        assert!((got[0].1 - 1.0).abs() < 1e-12);
        let got = run("1m-dev", (0, 60_000), &[(0, 2.0)]);
        assert_eq!(got[0].1, 0.0);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let mut values = vec![15.0, 20.0, 35.0, 40.0, 50.0];
        // rank = 0.4 * 6 = 2.4 -> 20 + 0.4 * 15
        assert!((percentile(&mut values, 40.0) - 26.0).abs() < 1e-12);
        assert!(percentile(&mut [], 99.0).is_nan());
        assert_eq!(percentile(&mut [7.0], 99.0), 7.0);
    }

    #[test]
    fn leading_gap_fills_from_query_start() {
        let got = run("1m-avg-zero", (0, 180_000), &[(120_000, 9.0)]);
        assert_eq!(
            got,
            vec![(0, 0.0), (60_000, 0.0), (120_000, 9.0), (180_000, 0.0)]
        );
    }

    #[test]
    fn no_samples_means_no_fill() {
        let got = run("1m-avg-zero", (0, 180_000), &[]);
        assert!(got.is_empty());
    }
}
