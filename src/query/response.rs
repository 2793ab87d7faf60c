use crate::config::Resolution;
use crate::query::SeriesResult;
use serde_json::{json, Map, Number, Value};

/// Convert stored ticks to the resolution the client asked for.
fn output_timestamp(ts: i64, ms_resolution: bool, resolution: Resolution) -> i64 {
    match (resolution, ms_resolution) {
        (Resolution::Ms, false) => ts / 1000,
        (Resolution::Sec, true) => ts * 1000,
        _ => ts,
    }
}

/// Non-finite values serialize as quoted tokens; everything else as a JSON
/// number.
fn output_value(value: f64) -> Value {
    if value.is_nan() {
        Value::String("NaN".to_string())
    } else if value == f64::INFINITY {
        Value::String("Inf".to_string())
    } else if value == f64::NEG_INFINITY {
        Value::String("-Inf".to_string())
    } else {
        Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String("NaN".to_string()))
    }
}

/// Serialize query results in the OpenTSDB response shape:
/// `[{"metric", "tags": {...}, "aggregateTags": [...], "dps": {...}}, ...]`.
pub fn results_to_json(
    results: &[SeriesResult],
    ms_resolution: bool,
    resolution: Resolution,
) -> Value {
    let array: Vec<Value> = results
        .iter()
        .map(|result| {
            let mut tags = Map::new();
            for (k, v) in &result.tags {
                tags.insert(k.clone(), Value::String(v.clone()));
            }
            let mut dps = Map::new();
            for dp in &result.dps {
                let ts = output_timestamp(dp.timestamp, ms_resolution, resolution);
                dps.insert(ts.to_string(), output_value(dp.value));
            }
            json!({
                "metric": result.metric,
                "tags": tags,
                "aggregateTags": result.aggregate_tags,
                "dps": dps,
            })
        })
        .collect();
    Value::Array(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::DataPoint;

    fn result() -> SeriesResult {
        SeriesResult {
            metric: "m.a".to_string(),
            tags: vec![("host".to_string(), "h1".to_string())],
            aggregate_tags: vec!["dc".to_string()],
            dps: vec![
                DataPoint::new(1_000_000, 1.5),
                DataPoint::new(1_030_000, f64::NAN),
                DataPoint::new(1_060_000, f64::INFINITY),
                DataPoint::new(1_090_000, f64::NEG_INFINITY),
            ],
        }
    }

    #[test]
    fn serializes_opents_shape() {
        let value = results_to_json(&[result()], true, Resolution::Ms);
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        let s = &arr[0];
        assert_eq!(s["metric"], "m.a");
        assert_eq!(s["tags"]["host"], "h1");
        assert_eq!(s["aggregateTags"][0], "dc");
        assert_eq!(s["dps"]["1000000"], 1.5);
    }

    #[test]
    fn non_finite_values_quote_as_tokens() {
        let value = results_to_json(&[result()], true, Resolution::Ms);
        let dps = &value[0]["dps"];
        assert_eq!(dps["1030000"], "NaN");
        assert_eq!(dps["1060000"], "Inf");
        assert_eq!(dps["1090000"], "-Inf");
    }

    #[test]
    fn second_resolution_output_divides_millis() {
        let value = results_to_json(&[result()], false, Resolution::Ms);
        let dps = &value[0]["dps"];
        assert_eq!(dps["1000"], 1.5);
    }
}
