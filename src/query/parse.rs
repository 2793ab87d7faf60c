use crate::common::time::parse_timestamp;
use crate::common::types::Timestamp;
use crate::config::Settings;
use crate::error::{TsdbError, TsdbResult};
use crate::index::{parse_tag_filter, TagPredicate};
use crate::query::aggregate::parse_aggregator;
use crate::query::downsample::DownsampleSpec;
use crate::query::rate::RateOptions;
use crate::query::{Query, SubQuery};
use serde::Deserialize;
use std::collections::BTreeMap;

/// `POST /api/query` body. This shape is canonical; the GET form maps onto
/// it.
#[derive(Debug, Deserialize)]
struct QueryBody {
    start: serde_json::Value,
    #[serde(default)]
    end: Option<serde_json::Value>,
    #[serde(default, rename = "msResolution")]
    ms_resolution: bool,
    queries: Vec<SubQueryBody>,
}

#[derive(Debug, Deserialize)]
struct SubQueryBody {
    metric: String,
    aggregator: String,
    #[serde(default)]
    downsample: Option<String>,
    #[serde(default)]
    rate: bool,
    #[serde(default, rename = "rateOptions")]
    rate_options: Option<RateOptionsBody>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default, alias = "explicitTags")]
    explicit_tags: bool,
}

#[derive(Debug, Deserialize)]
struct RateOptionsBody {
    #[serde(default)]
    counter: bool,
    #[serde(default, rename = "counterMax")]
    counter_max: Option<u64>,
    #[serde(default, rename = "resetValue")]
    reset_value: Option<u64>,
    #[serde(default, rename = "dropResets")]
    drop_resets: bool,
}

impl RateOptionsBody {
    fn resolve(&self, settings: &Settings) -> RateOptions {
        RateOptions {
            counter: self.counter,
            counter_max: self.counter_max.unwrap_or(settings.counter_max),
            reset_value: self.reset_value.unwrap_or(settings.reset_value),
            drop_resets: self.drop_resets,
        }
    }
}

fn timestamp_value(
    value: &serde_json::Value,
    now: Timestamp,
    settings: &Settings,
) -> TsdbResult<Timestamp> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| TsdbError::InvalidTimestamp(n.to_string())),
        serde_json::Value::String(s) => parse_timestamp(s, now, settings.resolution),
        other => Err(TsdbError::InvalidTimestamp(other.to_string())),
    }
}

/// Parse a JSON query request. `now` anchors relative timestamps.
pub fn parse_query_json(body: &str, now: Timestamp, settings: &Settings) -> TsdbResult<Query> {
    let body: QueryBody =
        serde_json::from_str(body).map_err(|e| TsdbError::ProtocolError(e.to_string()))?;

    let start = timestamp_value(&body.start, now, settings)?;
    let end = match &body.end {
        Some(value) => timestamp_value(value, now, settings)?,
        None => now,
    };
    if body.queries.is_empty() {
        return Err(TsdbError::ProtocolError("no queries given".to_string()));
    }

    let mut sub = Vec::with_capacity(body.queries.len());
    for q in &body.queries {
        let mut predicates = Vec::with_capacity(q.tags.len());
        for (key, raw) in &q.tags {
            // POST tag filters group by their key
            predicates.push(TagPredicate::grouping(key.clone(), parse_tag_filter(raw)?));
        }
        let rate = if q.rate || q.rate_options.is_some() {
            Some(
                q.rate_options
                    .as_ref()
                    .map(|o| o.resolve(settings))
                    .unwrap_or_else(RateOptions::simple),
            )
        } else {
            None
        };
        sub.push(SubQuery {
            metric: q.metric.clone(),
            aggregator: parse_aggregator(&q.aggregator)?,
            downsample: q
                .downsample
                .as_deref()
                .map(|spec| DownsampleSpec::parse(spec, settings.resolution))
                .transpose()?,
            rate,
            predicates,
            explicit_tags: q.explicit_tags,
        });
    }

    Ok(Query {
        start,
        end,
        ms_resolution: body.ms_resolution,
        sub,
    })
}

/// Parse the `GET /api/query` form:
/// `start=...&end=...&m=<agg>:[rate{...}:][<downsample>:][explicit_tags:]<metric>{k=v}[{k=v}]`.
pub fn parse_query_uri(query_string: &str, now: Timestamp, settings: &Settings) -> TsdbResult<Query> {
    let mut start = None;
    let mut end = None;
    let mut ms_resolution = false;
    let mut sub = Vec::new();

    for pair in query_string.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "start" => start = Some(parse_timestamp(value, now, settings.resolution)?),
            "end" => end = Some(parse_timestamp(value, now, settings.resolution)?),
            "msResolution" | "ms" => ms_resolution = value.is_empty() || value == "true",
            "m" => sub.push(parse_metric_spec(value, settings)?),
            _ => {} // unknown parameters are ignored, as OpenTSDB does
        }
    }

    let start =
        start.ok_or_else(|| TsdbError::ProtocolError("missing start parameter".to_string()))?;
    if sub.is_empty() {
        return Err(TsdbError::ProtocolError("missing m parameter".to_string()));
    }

    Ok(Query {
        start,
        end: end.unwrap_or(now),
        ms_resolution,
        sub,
    })
}

/// `rate{counter[,<counter_max>[,<reset_value>]]}` positional arguments,
/// mapped onto the POST shape.
fn parse_rate_spec(token: &str, settings: &Settings) -> TsdbResult<RateOptions> {
    let mut options = RateOptions {
        counter_max: settings.counter_max,
        reset_value: settings.reset_value,
        ..RateOptions::simple()
    };
    let Some(args) = token.strip_prefix("rate{").and_then(|s| s.strip_suffix('}')) else {
        return Ok(options);
    };
    for (i, arg) in args.split(',').enumerate() {
        let arg = arg.trim();
        if arg.is_empty() {
            continue;
        }
        match i {
            0 => match arg {
                "counter" => options.counter = true,
                "dropcounter" => {
                    options.counter = true;
                    options.drop_resets = true;
                }
                _ => {
                    return Err(TsdbError::ProtocolError(format!(
                        "unknown rate option `{arg}`"
                    )))
                }
            },
            1 => {
                options.counter_max = arg
                    .parse()
                    .map_err(|_| TsdbError::InvalidNumber(arg.to_string()))?
            }
            2 => {
                options.reset_value = arg
                    .parse()
                    .map_err(|_| TsdbError::InvalidNumber(arg.to_string()))?
            }
            _ => return Err(TsdbError::ProtocolError("too many rate options".to_string())),
        }
    }
    Ok(options)
}

fn parse_tag_block(block: &str, group_by: bool, predicates: &mut Vec<TagPredicate>) -> TsdbResult<()> {
    for pair in block.split(',').filter(|p| !p.is_empty()) {
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            TsdbError::ProtocolError(format!("tag filter `{pair}` is not k=v"))
        })?;
        let filter = parse_tag_filter(raw)?;
        predicates.push(TagPredicate {
            key: key.trim().to_string(),
            filter,
            group_by,
        });
    }
    Ok(())
}

fn parse_metric_spec(spec: &str, settings: &Settings) -> TsdbResult<SubQuery> {
    // the metric token may carry one grouping and one non-grouping tag
    // block; everything before it is colon-separated modifiers
    let mut tokens: Vec<&str> = spec.split(':').collect();
    if tokens.len() < 2 {
        return Err(TsdbError::ProtocolError(format!(
            "metric spec `{spec}` needs at least aggregator:metric"
        )));
    }

    let aggregator = parse_aggregator(tokens.remove(0))?;
    let metric_token = tokens.pop().unwrap();

    let mut rate = None;
    let mut downsample = None;
    let mut explicit_tags = false;
    for token in tokens {
        if token == "rate" || token.starts_with("rate{") {
            rate = Some(parse_rate_spec(token, settings)?);
        } else if token == "explicit_tags" {
            explicit_tags = true;
        } else {
            downsample = Some(DownsampleSpec::parse(token, settings.resolution)?);
        }
    }

    let (metric, blocks) = match metric_token.find('{') {
        Some(at) => (&metric_token[..at], &metric_token[at..]),
        None => (metric_token, ""),
    };
    if metric.is_empty() {
        return Err(TsdbError::ProtocolError("empty metric name".to_string()));
    }

    let mut predicates = Vec::new();
    let mut rest = blocks;
    let mut group_by = true;
    while let Some(stripped) = rest.strip_prefix('{') {
        let close = stripped
            .find('}')
            .ok_or_else(|| TsdbError::ProtocolError(format!("unbalanced braces in `{spec}`")))?;
        parse_tag_block(&stripped[..close], group_by, &mut predicates)?;
        rest = &stripped[close + 1..];
        group_by = false; // the second block filters without grouping
    }
    if !rest.is_empty() {
        return Err(TsdbError::ProtocolError(format!(
            "trailing characters after tag blocks in `{spec}`"
        )));
    }

    Ok(SubQuery {
        metric: metric.to_string(),
        aggregator,
        downsample,
        rate,
        predicates,
        explicit_tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TagFilter;
    use crate::query::aggregate::AggregateFunc;
    use crate::query::downsample::{DownsampleFunc, FillPolicy};

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn parses_post_body() {
        let body = r#"{
            "start": 1000000,
            "end": "1h-ago",
            "msResolution": true,
            "queries": [{
                "metric": "sys.cpu.user",
                "aggregator": "sum",
                "downsample": "1m-avg-zero",
                "rate": true,
                "rateOptions": {"counter": true, "counterMax": 100},
                "tags": {"host": "web*", "dc": "east"}
            }]
        }"#;
        let query = parse_query_json(body, 10_000_000, &settings()).unwrap();
        assert_eq!(query.start, 1_000_000);
        assert_eq!(query.end, 10_000_000 - 3_600_000);
        assert!(query.ms_resolution);

        let sub = &query.sub[0];
        assert_eq!(sub.metric, "sys.cpu.user");
        assert_eq!(sub.aggregator, AggregateFunc::Sum);
        let ds = sub.downsample.as_ref().unwrap();
        assert_eq!(ds.interval, 60_000);
        assert_eq!(ds.func, DownsampleFunc::Avg);
        assert_eq!(ds.fill, FillPolicy::Zero);
        let rate = sub.rate.unwrap();
        assert!(rate.counter);
        assert_eq!(rate.counter_max, 100);
        assert_eq!(sub.predicates.len(), 2);
        assert!(sub.predicates.iter().all(|p| p.group_by));
        assert_eq!(
            sub.predicates
                .iter()
                .find(|p| p.key == "host")
                .map(|p| p.filter.clone()),
            Some(TagFilter::Wildcard("web*".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            parse_query_json("{nope", 0, &settings()),
            Err(TsdbError::ProtocolError(_))
        ));
    }

    #[test]
    fn parses_get_metric_spec() {
        let query = parse_query_uri(
            "start=1h-ago&m=avg:rate{counter,100,0}:1m-avg:explicit_tags:sys.if.in{host=*}{dc=east}",
            7_200_000,
            &settings(),
        )
        .unwrap();
        assert_eq!(query.start, 7_200_000 - 3_600_000);
        let sub = &query.sub[0];
        assert_eq!(sub.metric, "sys.if.in");
        assert_eq!(sub.aggregator, AggregateFunc::Avg);
        assert!(sub.explicit_tags);
        assert!(sub.downsample.is_some());
        let rate = sub.rate.unwrap();
        assert!(rate.counter);
        assert_eq!(rate.counter_max, 100);

        assert_eq!(sub.predicates.len(), 2);
        let host = sub.predicates.iter().find(|p| p.key == "host").unwrap();
        assert!(host.group_by);
        assert_eq!(host.filter, TagFilter::Any);
        let dc = sub.predicates.iter().find(|p| p.key == "dc").unwrap();
        assert!(!dc.group_by);
    }

    #[test]
    fn get_requires_start_and_metric() {
        assert!(parse_query_uri("m=sum:m1", 0, &settings()).is_err());
        assert!(parse_query_uri("start=0", 0, &settings()).is_err());
        assert!(parse_query_uri("start=0&m=sum:m1", 0, &settings()).is_ok());
    }
}
