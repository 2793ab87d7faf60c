//! The write ingress: line-protocol parsing and tag-set canonicalization.
//! Listeners hand parsed samples to [`crate::Tsdb::put`]; one bad line never
//! aborts the rest of a batch.

use crate::common::types::Timestamp;
use crate::error::{TsdbError, TsdbResult};

/// A sample parsed off the wire, not yet resolved to a series id.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedSample {
    pub metric: String,
    pub timestamp: Timestamp,
    pub value: f64,
    pub tags: Vec<(String, String)>,
}

/// Characters that may not appear in metric names, tag keys or tag values.
fn has_invalid_chars(s: &str) -> bool {
    s.chars().any(|c| c == ' ' || c == '"' || c == '=' || c == '\u{1f}')
}

/// Validate and canonicalize a tag set: non-empty unique keys, clean
/// characters, sorted lexicographically by key.
pub fn canonicalize_tags(mut tags: Vec<(String, String)>) -> TsdbResult<Vec<(String, String)>> {
    for (key, value) in &tags {
        if key.is_empty() || value.is_empty() {
            return Err(TsdbError::Rejected("empty tag key or value".to_string()));
        }
        if has_invalid_chars(key) || has_invalid_chars(value) {
            return Err(TsdbError::Rejected(format!(
                "invalid character in tag `{key}={value}`"
            )));
        }
    }
    tags.sort_by(|a, b| a.0.cmp(&b.0));
    for pair in tags.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(TsdbError::Rejected(format!(
                "duplicate tag key `{}`",
                pair[0].0
            )));
        }
    }
    Ok(tags)
}

pub fn validate_metric(metric: &str) -> TsdbResult<()> {
    if metric.is_empty() {
        return Err(TsdbError::Rejected("empty metric name".to_string()));
    }
    if has_invalid_chars(metric) {
        return Err(TsdbError::Rejected(format!(
            "invalid character in metric `{metric}`"
        )));
    }
    Ok(())
}

/// Parse one `put <metric> <ts> <value> [<k=v> ...]` line. Structural
/// problems are `ProtocolError`; invariant violations are `Rejected`.
pub fn parse_put_line(line: &str) -> TsdbResult<ParsedSample> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = line.split_ascii_whitespace();

    match fields.next() {
        Some("put") => {}
        _ => return Err(TsdbError::ProtocolError(format!("not a put line: `{line}`"))),
    }
    let metric = fields
        .next()
        .ok_or_else(|| TsdbError::ProtocolError("missing metric".to_string()))?;
    let ts_str = fields
        .next()
        .ok_or_else(|| TsdbError::ProtocolError("missing timestamp".to_string()))?;
    let value_str = fields
        .next()
        .ok_or_else(|| TsdbError::ProtocolError("missing value".to_string()))?;

    let timestamp: Timestamp = ts_str
        .parse()
        .map_err(|_| TsdbError::ProtocolError(format!("bad timestamp `{ts_str}`")))?;
    // `NaN`, `Inf` and `-Inf` parse as their IEEE values
    let value: f64 = value_str
        .parse()
        .map_err(|_| TsdbError::ProtocolError(format!("bad value `{value_str}`")))?;

    let mut tags = Vec::new();
    for token in fields {
        let (key, tag_value) = token
            .split_once('=')
            .ok_or_else(|| TsdbError::ProtocolError(format!("bad tag `{token}`")))?;
        tags.push((key.to_string(), tag_value.to_string()));
    }

    validate_metric(metric)?;
    let tags = canonicalize_tags(tags)?;

    Ok(ParsedSample {
        metric: metric.to_string(),
        timestamp,
        value,
        tags,
    })
}

/// Parse a multi-line payload, one result per non-empty line.
pub fn parse_put_lines(payload: &str) -> Vec<TsdbResult<ParsedSample>> {
    payload
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_put_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_line() {
        let sample = parse_put_line("put sys.cpu.user 1000000 1.5 host=web01 dc=east\n").unwrap();
        assert_eq!(sample.metric, "sys.cpu.user");
        assert_eq!(sample.timestamp, 1_000_000);
        assert_eq!(sample.value, 1.5);
        // tags come back in canonical order
        assert_eq!(
            sample.tags,
            vec![
                ("dc".to_string(), "east".to_string()),
                ("host".to_string(), "web01".to_string())
            ]
        );
    }

    #[test]
    fn parses_signed_exponent_and_special_values() {
        assert_eq!(parse_put_line("put m 1 -1.5e3").unwrap().value, -1500.0);
        assert!(parse_put_line("put m 1 NaN").unwrap().value.is_nan());
        assert_eq!(parse_put_line("put m 1 Inf").unwrap().value, f64::INFINITY);
        assert_eq!(
            parse_put_line("put m 1 -Inf").unwrap().value,
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn structural_errors_are_protocol_errors() {
        for line in [
            "get m 1 1.0",
            "put",
            "put m",
            "put m 1",
            "put m abc 1.0",
            "put m 1 xyz",
            "put m 1 1.0 hostweb01",
        ] {
            assert!(
                matches!(parse_put_line(line), Err(TsdbError::ProtocolError(_))),
                "line `{line}`"
            );
        }
    }

    #[test]
    fn invariant_violations_are_rejected() {
        assert!(matches!(
            parse_put_line("put m 1 1.0 host=\"web\""),
            Err(TsdbError::Rejected(_))
        ));
        assert!(matches!(
            parse_put_line("put m 1 1.0 host=a host=b"),
            Err(TsdbError::Rejected(_))
        ));
    }

    #[test]
    fn batch_keeps_going_past_bad_lines() {
        let results = parse_put_lines("put m 1 1.0\nbogus\nput m 2 2.0\n");
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn empty_tag_value_is_rejected() {
        assert!(matches!(
            parse_put_line("put m 1 1.0 host="),
            Err(TsdbError::Rejected(_))
        ));
    }
}
