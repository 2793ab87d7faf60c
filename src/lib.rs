//! tickdb is a single-node time-series database. Samples arrive tagged with
//! a metric name and a set of key/value labels, land in Gorilla-compressed
//! pages inside memory-mapped, time-bucketed files, and are served back
//! through OpenTSDB-shaped range queries with downsampling, aggregation and
//! rate derivation.
//!
//! The crate is the engine only: listeners parse the wire and call into
//! [`Tsdb::put`] / [`Tsdb::query_json`], and a [`server::Scheduler`] drives
//! flushing, bucket lifecycle and compaction in the background.

pub mod common;
pub mod config;
mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod meta;
pub mod query;
pub mod server;
pub mod storage;

pub use config::{Resolution, Settings};
pub use db::Tsdb;
pub use error::{TsdbError, TsdbResult};
pub use ingest::parse_put_line;
pub use query::{Query, QueryOutcome, SeriesResult, SubQuery};
