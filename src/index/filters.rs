use crate::error::{TsdbError, TsdbResult};
use regex::Regex;

/// How a tag predicate matches values. The OpenTSDB filter functions map
/// onto these; bare values parse by shape (`*`, `a|b`, `web*`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagFilter {
    /// Any value; matches every series carrying the key.
    Any,
    Exact(String),
    AnyOf(Vec<String>),
    NotAnyOf(Vec<String>),
    Wildcard(String),
    NotWildcard(String),
    Regex(String),
    NotRegex(String),
}

/// One parsed tag predicate from a query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagPredicate {
    pub key: String,
    pub filter: TagFilter,
    /// Grouping predicates split matched series into result series by this
    /// key's value; non-grouping ones only filter.
    pub group_by: bool,
}

impl TagPredicate {
    pub fn grouping(key: impl Into<String>, filter: TagFilter) -> Self {
        TagPredicate {
            key: key.into(),
            filter,
            group_by: true,
        }
    }

    pub fn filtering(key: impl Into<String>, filter: TagFilter) -> Self {
        TagPredicate {
            key: key.into(),
            filter,
            group_by: false,
        }
    }
}

fn call_argument<'a>(raw: &'a str, function: &str) -> Option<&'a str> {
    raw.strip_prefix(function)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn split_alternatives(arg: &str) -> Vec<String> {
    arg.split('|')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a filter expression. Explicit filter functions
/// (`literal_or(...)`, `wildcard(...)`, `regexp(...)`, `not_...`) take
/// precedence; otherwise the shape of the bare value decides.
pub fn parse_tag_filter(raw: &str) -> TsdbResult<TagFilter> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TsdbError::InvalidTagFilter("empty filter".to_string()));
    }

    if let Some(arg) = call_argument(raw, "literal_or") {
        return Ok(TagFilter::AnyOf(split_alternatives(arg)));
    }
    if let Some(arg) = call_argument(raw, "not_literal_or") {
        return Ok(TagFilter::NotAnyOf(split_alternatives(arg)));
    }
    if let Some(arg) = call_argument(raw, "wildcard") {
        return Ok(TagFilter::Wildcard(arg.to_string()));
    }
    if let Some(arg) = call_argument(raw, "not_wildcard") {
        return Ok(TagFilter::NotWildcard(arg.to_string()));
    }
    if let Some(arg) = call_argument(raw, "regexp") {
        return Ok(TagFilter::Regex(arg.to_string()));
    }
    if let Some(arg) = call_argument(raw, "not_regexp") {
        return Ok(TagFilter::NotRegex(arg.to_string()));
    }

    if raw == "*" {
        return Ok(TagFilter::Any);
    }
    if raw.contains('*') {
        return Ok(TagFilter::Wildcard(raw.to_string()));
    }
    if raw.contains('|') {
        return Ok(TagFilter::AnyOf(split_alternatives(raw)));
    }
    Ok(TagFilter::Exact(raw.to_string()))
}

/// A filter with its pattern compiled, ready to test values.
#[derive(Debug)]
pub enum CompiledMatcher {
    Any,
    Exact(String),
    AnyOf(Vec<String>),
    NotAnyOf(Vec<String>),
    Pattern { regex: Regex, negate: bool },
}

pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        if c == '*' {
            re.push_str(".*");
        } else {
            re.push_str(&regex::escape(&c.to_string()));
        }
    }
    re.push('$');
    re
}

impl TagFilter {
    pub fn compile(&self) -> TsdbResult<CompiledMatcher> {
        let compiled = match self {
            TagFilter::Any => CompiledMatcher::Any,
            TagFilter::Exact(v) => CompiledMatcher::Exact(v.clone()),
            TagFilter::AnyOf(vs) => CompiledMatcher::AnyOf(vs.clone()),
            TagFilter::NotAnyOf(vs) => CompiledMatcher::NotAnyOf(vs.clone()),
            TagFilter::Wildcard(p) | TagFilter::NotWildcard(p) => {
                let regex = Regex::new(&wildcard_to_regex(p))
                    .map_err(|e| TsdbError::InvalidTagFilter(format!("{p}: {e}")))?;
                CompiledMatcher::Pattern {
                    regex,
                    negate: matches!(self, TagFilter::NotWildcard(_)),
                }
            }
            TagFilter::Regex(p) | TagFilter::NotRegex(p) => {
                let anchored = format!("^(?:{p})$");
                let regex = Regex::new(&anchored)
                    .map_err(|e| TsdbError::InvalidTagFilter(format!("{p}: {e}")))?;
                CompiledMatcher::Pattern {
                    regex,
                    negate: matches!(self, TagFilter::NotRegex(_)),
                }
            }
        };
        Ok(compiled)
    }
}

impl CompiledMatcher {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            CompiledMatcher::Any => true,
            CompiledMatcher::Exact(v) => v == value,
            CompiledMatcher::AnyOf(vs) => vs.iter().any(|v| v == value),
            CompiledMatcher::NotAnyOf(vs) => !vs.iter().any(|v| v == value),
            CompiledMatcher::Pattern { regex, negate } => regex.is_match(value) != *negate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("web01", TagFilter::Exact("web01".to_string()); "bare exact")]
    #[test_case("*", TagFilter::Any; "star")]
    #[test_case("web*", TagFilter::Wildcard("web*".to_string()); "bare glob")]
    #[test_case("web01|web02", TagFilter::AnyOf(vec!["web01".into(), "web02".into()]); "bare alternation")]
    #[test_case("literal_or(a|b)", TagFilter::AnyOf(vec!["a".into(), "b".into()]); "literal or fn")]
    #[test_case("not_literal_or(a)", TagFilter::NotAnyOf(vec!["a".into()]); "not literal or fn")]
    #[test_case("wildcard(web*.example.com)", TagFilter::Wildcard("web*.example.com".to_string()); "wildcard fn")]
    #[test_case("regexp(web\\d+)", TagFilter::Regex("web\\d+".to_string()); "regexp fn")]
    fn parses(raw: &str, want: TagFilter) {
        assert_eq!(parse_tag_filter(raw).unwrap(), want);
    }

    #[test]
    fn wildcard_matching_anchors_both_ends() {
        let m = TagFilter::Wildcard("web*.example.com".to_string())
            .compile()
            .unwrap();
        assert!(m.matches("web01.example.com"));
        assert!(m.matches("web.example.com"));
        assert!(!m.matches("web01.example.com.evil"));
        assert!(!m.matches("xweb.example.com"));
    }

    #[test]
    fn wildcard_escapes_regex_metacharacters() {
        let m = TagFilter::Wildcard("a.b*".to_string()).compile().unwrap();
        assert!(m.matches("a.bcd"));
        assert!(!m.matches("axbcd"));
    }

    #[test]
    fn regexp_is_anchored() {
        let m = TagFilter::Regex("web\\d+".to_string()).compile().unwrap();
        assert!(m.matches("web42"));
        assert!(!m.matches("web42x"));
    }

    #[test]
    fn negated_filters_invert() {
        let m = TagFilter::NotAnyOf(vec!["a".into(), "b".into()])
            .compile()
            .unwrap();
        assert!(m.matches("c"));
        assert!(!m.matches("a"));

        let m = TagFilter::NotWildcard("web*".to_string()).compile().unwrap();
        assert!(!m.matches("web01"));
        assert!(m.matches("db01"));
    }
}
