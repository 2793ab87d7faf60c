pub mod aggregate;
pub mod downsample;
pub mod executor;
pub mod parse;
pub mod rate;
pub mod response;

use crate::common::types::{DataPoint, Timestamp};
use crate::index::TagPredicate;
use crate::query::aggregate::AggregateFunc;
use crate::query::downsample::DownsampleSpec;
use crate::query::rate::RateOptions;

pub use parse::{parse_query_json, parse_query_uri};
pub use response::results_to_json;

/// A fully parsed range query: one time range shared by one or more
/// sub-queries.
#[derive(Clone, Debug)]
pub struct Query {
    pub start: Timestamp,
    /// Inclusive.
    pub end: Timestamp,
    pub ms_resolution: bool,
    pub sub: Vec<SubQuery>,
}

/// One metric expression within a query.
#[derive(Clone, Debug)]
pub struct SubQuery {
    pub metric: String,
    pub aggregator: AggregateFunc,
    pub downsample: Option<DownsampleSpec>,
    pub rate: Option<RateOptions>,
    pub predicates: Vec<TagPredicate>,
    pub explicit_tags: bool,
}

/// One output series.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesResult {
    pub metric: String,
    /// Tags common to every series merged into this result, canonical
    /// order.
    pub tags: Vec<(String, String)>,
    /// Keys carried by every merged series but with differing values.
    pub aggregate_tags: Vec<String>,
    pub dps: Vec<DataPoint>,
}

/// Query results plus whether the deadline cut them short. A timed-out
/// response still serializes normally (HTTP 200) with the flag set.
#[derive(Clone, Debug, Default)]
pub struct QueryOutcome {
    pub results: Vec<SeriesResult>,
    pub timed_out: bool,
}
