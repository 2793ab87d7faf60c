use crate::common::types::DataPoint;
use crate::error::{TsdbError, TsdbResult};
use crate::query::downsample::{percentile, stddev};

/// Merges the (downsampled) streams of several series into one. `None`,
/// `Top` and `Bottom` keep input series separate instead.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AggregateFunc {
    Avg,
    Count,
    Dev,
    Max,
    Min,
    Sum,
    None,
    Percentile(f64),
    Top(usize),
    Bottom(usize),
}

pub fn parse_aggregator(name: &str) -> TsdbResult<AggregateFunc> {
    let func = match name {
        "avg" => AggregateFunc::Avg,
        "count" => AggregateFunc::Count,
        "dev" => AggregateFunc::Dev,
        "max" => AggregateFunc::Max,
        "min" => AggregateFunc::Min,
        "sum" => AggregateFunc::Sum,
        "none" => AggregateFunc::None,
        _ => {
            if let Some(n) = name.strip_prefix("top").and_then(|d| d.parse::<usize>().ok()) {
                if n == 0 {
                    return Err(TsdbError::InvalidAggregator(name.to_string()));
                }
                return Ok(AggregateFunc::Top(n));
            }
            if let Some(n) = name
                .strip_prefix("bottom")
                .and_then(|d| d.parse::<usize>().ok())
            {
                if n == 0 {
                    return Err(TsdbError::InvalidAggregator(name.to_string()));
                }
                return Ok(AggregateFunc::Bottom(n));
            }
            let q = name
                .strip_prefix('p')
                .and_then(|digits| digits.parse::<u32>().ok())
                .filter(|q| (50..=99).contains(q) || *q == 999)
                .ok_or_else(|| TsdbError::InvalidAggregator(name.to_string()))?;
            AggregateFunc::Percentile(if q == 999 { 99.9 } else { q as f64 })
        }
    };
    Ok(func)
}

impl AggregateFunc {
    /// Functions that emit per-input-series results rather than one merged
    /// stream.
    pub fn keeps_series_apart(&self) -> bool {
        matches!(
            self,
            AggregateFunc::None | AggregateFunc::Top(_) | AggregateFunc::Bottom(_)
        )
    }

    fn apply(&self, values: &mut Vec<f64>) -> f64 {
        match self {
            AggregateFunc::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregateFunc::Count => values.len() as f64,
            AggregateFunc::Dev => {
                let mut mean = values[0];
                let mut m2 = 0.0;
                for (i, value) in values.iter().enumerate().skip(1) {
                    let new_mean = mean + (value - mean) / (i + 1) as f64;
                    m2 += (value - mean) * (value - new_mean);
                    mean = new_mean;
                }
                stddev(values.len() as u64, m2)
            }
            AggregateFunc::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            AggregateFunc::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            AggregateFunc::Sum => values.iter().sum(),
            AggregateFunc::Percentile(q) => percentile(values, *q),
            AggregateFunc::None | AggregateFunc::Top(_) | AggregateFunc::Bottom(_) => {
                unreachable!("per-series functions never merge")
            }
        }
    }
}

/// Merge N timestamp-sorted streams into one: for every distinct timestamp,
/// apply the function over the series that have a point there.
pub fn aggregate(func: AggregateFunc, series: &[&[DataPoint]]) -> Vec<DataPoint> {
    debug_assert!(!func.keeps_series_apart());
    if series.is_empty() {
        return Vec::new();
    }
    if series.len() == 1 && matches!(func, AggregateFunc::Avg | AggregateFunc::Sum | AggregateFunc::Max | AggregateFunc::Min) {
        return series[0].to_vec();
    }

    let mut cursors = vec![0usize; series.len()];
    let mut out = Vec::new();
    let mut values: Vec<f64> = Vec::with_capacity(series.len());

    loop {
        let mut ts = None;
        for (i, cursor) in cursors.iter().enumerate() {
            if let Some(dp) = series[i].get(*cursor) {
                ts = Some(ts.map_or(dp.timestamp, |t: i64| t.min(dp.timestamp)));
            }
        }
        let Some(ts) = ts else { break };

        values.clear();
        for (i, cursor) in cursors.iter_mut().enumerate() {
            if let Some(dp) = series[i].get(*cursor) {
                if dp.timestamp == ts {
                    values.push(dp.value);
                    *cursor += 1;
                }
            }
        }
        out.push(DataPoint::new(ts, func.apply(&mut values)));
    }
    out
}

/// Rank series for `top<n>`/`bottom<n>`: by the maximum (or minimum) value
/// across their points. Returns the indexes of the kept series, best first.
pub fn select_ranked(func: AggregateFunc, series: &[&[DataPoint]]) -> Vec<usize> {
    let (n, want_top) = match func {
        AggregateFunc::Top(n) => (n, true),
        AggregateFunc::Bottom(n) => (n, false),
        _ => return (0..series.len()).collect(),
    };

    let combine: fn(f64, f64) -> f64 = if want_top { f64::max } else { f64::min };
    let seed = if want_top {
        f64::NEG_INFINITY
    } else {
        f64::INFINITY
    };
    let mut scored: Vec<(usize, f64)> = series
        .iter()
        .enumerate()
        .map(|(i, dps)| {
            let score = dps
                .iter()
                .map(|dp| dp.value)
                .filter(|v| !v.is_nan())
                .fold(seed, combine);
            (i, score)
        })
        .collect();

    scored.sort_by(|a, b| {
        let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
        if want_top {
            ord.reverse()
        } else {
            ord
        }
    });
    scored.truncate(n);
    scored.into_iter().map(|(i, _)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn dps(points: &[(i64, f64)]) -> Vec<DataPoint> {
        points.iter().map(|(t, v)| DataPoint::new(*t, *v)).collect()
    }

    #[test]
    fn parses_names() {
        assert_eq!(parse_aggregator("sum").unwrap(), AggregateFunc::Sum);
        assert_eq!(parse_aggregator("p999").unwrap(), AggregateFunc::Percentile(99.9));
        assert_eq!(parse_aggregator("top3").unwrap(), AggregateFunc::Top(3));
        assert_eq!(parse_aggregator("bottom1").unwrap(), AggregateFunc::Bottom(1));
        assert!(parse_aggregator("p42").is_err());
        assert!(parse_aggregator("top0").is_err());
        assert!(parse_aggregator("median").is_err());
    }

    #[test]
    fn sums_across_aligned_series() {
        let a = dps(&[(0, 1.0), (60, 2.0)]);
        let b = dps(&[(0, 10.0), (60, 20.0)]);
        let got = aggregate(AggregateFunc::Sum, &[&a, &b]);
        assert_eq!(got, dps(&[(0, 11.0), (60, 22.0)]));
    }

    #[test]
    fn unaligned_timestamps_interleave() {
        let a = dps(&[(0, 1.0), (120, 3.0)]);
        let b = dps(&[(60, 2.0)]);
        let got = aggregate(AggregateFunc::Sum, &[&a, &b]);
        assert_eq!(got, dps(&[(0, 1.0), (60, 2.0), (120, 3.0)]));
    }

    #[test_case(AggregateFunc::Avg, 15.0; "avg")]
    #[test_case(AggregateFunc::Max, 20.0; "max")]
    #[test_case(AggregateFunc::Min, 10.0; "min")]
    #[test_case(AggregateFunc::Count, 2.0; "count")]
    fn applies_function_per_timestamp(func: AggregateFunc, want: f64) {
        let a = dps(&[(0, 10.0)]);
        let b = dps(&[(0, 20.0)]);
        let got = aggregate(func, &[&a, &b]);
        assert_eq!(got, dps(&[(0, want)]));
    }

    #[test]
    fn top_and_bottom_rank_by_extremes() {
        let a = dps(&[(0, 1.0), (60, 9.0)]);
        let b = dps(&[(0, 5.0), (60, 5.0)]);
        let c = dps(&[(0, 2.0), (60, 0.5)]);
        let series: Vec<&[DataPoint]> = vec![&a, &b, &c];

        assert_eq!(select_ranked(AggregateFunc::Top(2), &series), vec![0, 1]);
        assert_eq!(select_ranked(AggregateFunc::Bottom(1), &series), vec![2]);
    }
}
