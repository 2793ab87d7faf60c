use crate::common::types::{DataPoint, SeriesId, Timestamp};
use crate::db::Tsdb;
use crate::error::TsdbResult;
use crate::query::aggregate::{aggregate, select_ranked};
use crate::query::downsample::Downsampler;
use crate::query::rate::calculate_rate;
use crate::query::{Query, QueryOutcome, SeriesResult, SubQuery};
use ahash::AHashMap;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::debug;

/// One matched series being fetched and downsampled for a sub-query.
struct QueryTask {
    id: SeriesId,
    tags: Vec<(String, String)>,
    dps: Vec<DataPoint>,
}

/// Run a query to completion: resolve, fetch per series, group, aggregate,
/// rate. Per-series phases run on the worker pool; the deadline is checked
/// between them and exceeding it returns whatever was finished.
pub fn execute(db: &Tsdb, query: &Query) -> TsdbResult<QueryOutcome> {
    let deadline = Instant::now() + db.settings().query_deadline;
    let mut outcome = QueryOutcome::default();

    for sub in &query.sub {
        let (results, timed_out) = execute_sub(db, sub, query.start, query.end, deadline)?;
        outcome.results.extend(results);
        outcome.timed_out |= timed_out;
    }
    Ok(outcome)
}

fn execute_sub(
    db: &Tsdb,
    sub: &SubQuery,
    start: Timestamp,
    end: Timestamp,
    deadline: Instant,
) -> TsdbResult<(Vec<SeriesResult>, bool)> {
    let ids = db.index().resolve(&sub.metric, &sub.predicates, sub.explicit_tags)?;
    debug!(metric = %sub.metric, series = ids.len(), "resolved query");

    let mut tasks: Vec<QueryTask> = ids
        .iter()
        .map(|id| QueryTask {
            id,
            tags: db.index().series_tags(id),
            dps: Vec::new(),
        })
        .collect();

    let buckets = db.buckets_overlapping(start, end);
    let timed_out = AtomicBool::new(false);

    db.query_pool().install(|| {
        tasks.par_iter_mut().try_for_each(|task| -> TsdbResult<()> {
            if Instant::now() >= deadline {
                timed_out.store(true, Ordering::SeqCst);
                return Ok(());
            }
            // buckets are disjoint and sorted, so concatenation stays in
            // timestamp order for the downsampler
            task.dps = match &sub.downsample {
                Some(spec) => {
                    // the raw stream is scratch; borrow it from the pool
                    let mut raw = db.pools().acquire_data_points(0)?;
                    for bucket in &buckets {
                        bucket.read_series(task.id, start, end, &mut raw)?;
                    }
                    let mut downsampler = Downsampler::new(spec.clone(), start, end);
                    for dp in raw.iter() {
                        downsampler.add(*dp);
                    }
                    downsampler.finish()
                }
                None => {
                    let mut raw = Vec::new();
                    for bucket in &buckets {
                        bucket.read_series(task.id, start, end, &mut raw)?;
                    }
                    raw
                }
            };
            Ok(())
        })
    })?;

    let mut results = group_and_aggregate(sub, &tasks);

    if let Some(options) = sub.rate {
        for result in &mut results {
            calculate_rate(&mut result.dps, options, db.settings().resolution);
        }
    }

    // stable output order: by tags, then metric
    results.sort_by(|a, b| a.tags.cmp(&b.tags));
    Ok((results, timed_out.load(Ordering::SeqCst)))
}

fn group_and_aggregate(sub: &SubQuery, tasks: &[QueryTask]) -> Vec<SeriesResult> {
    if sub.aggregator.keeps_series_apart() {
        let streams: Vec<&[DataPoint]> = tasks.iter().map(|t| t.dps.as_slice()).collect();
        return select_ranked(sub.aggregator, &streams)
            .into_iter()
            .map(|i| SeriesResult {
                metric: sub.metric.clone(),
                tags: tasks[i].tags.clone(),
                aggregate_tags: Vec::new(),
                dps: tasks[i].dps.clone(),
            })
            .collect();
    }

    // grouping keys: queried keys marked group-by
    let mut grouping_keys: Vec<&str> = sub
        .predicates
        .iter()
        .filter(|p| p.group_by)
        .map(|p| p.key.as_str())
        .collect();
    grouping_keys.sort_unstable();
    grouping_keys.dedup();

    // tasks with equal values on every grouping key collapse into one
    // result series
    let mut groups: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
    for (i, task) in tasks.iter().enumerate() {
        let group_key: Vec<String> = grouping_keys
            .iter()
            .map(|key| {
                task.tags
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            })
            .collect();
        groups.entry(group_key).or_default().push(i);
    }

    groups
        .values()
        .map(|members| {
            let (tags, aggregate_tags) = common_tags(tasks, members);
            let streams: Vec<&[DataPoint]> =
                members.iter().map(|i| tasks[*i].dps.as_slice()).collect();
            SeriesResult {
                metric: sub.metric.clone(),
                tags,
                aggregate_tags,
                dps: aggregate(sub.aggregator, &streams),
            }
        })
        .collect()
}

/// Tags shared with equal values by every member stay on the result; keys
/// every member carries with differing values become aggregate tags; keys
/// missing from some member drop entirely.
fn common_tags(
    tasks: &[QueryTask],
    members: &[usize],
) -> (Vec<(String, String)>, Vec<String>) {
    let first = &tasks[members[0]];
    let mut key_values: AHashMap<&str, (&str, usize)> = AHashMap::new();
    let mut equal: AHashMap<&str, bool> = AHashMap::new();

    for (k, v) in &first.tags {
        key_values.insert(k.as_str(), (v.as_str(), 1));
        equal.insert(k.as_str(), true);
    }
    for i in &members[1..] {
        for (k, v) in &tasks[*i].tags {
            if let Some((value, count)) = key_values.get_mut(k.as_str()) {
                *count += 1;
                if *value != v.as_str() {
                    equal.insert(k.as_str(), false);
                }
            }
        }
    }

    let mut tags = Vec::new();
    let mut aggregate_tags = Vec::new();
    for (k, v) in &first.tags {
        let (_, count) = key_values[k.as_str()];
        if count != members.len() {
            continue;
        }
        if equal[k.as_str()] {
            tags.push((k.clone(), v.clone()));
        } else {
            aggregate_tags.push(k.clone());
        }
    }
    (tags, aggregate_tags)
}
