use crate::common::pool::EnginePools;
use crate::common::time::now_ticks;
use crate::common::types::Timestamp;
use crate::config::Settings;
use crate::error::{TsdbError, TsdbResult};
use crate::index::TagIndex;
use crate::ingest::{canonicalize_tags, parse_put_line, validate_metric};
use crate::meta::MetaLog;
use crate::query::{executor, Query, QueryOutcome};
use crate::storage::bucket::{Bucket, LifecycleState};
use crate::storage::compact::compact_bucket;
use ahash::AHashMap;
use chrono::Timelike;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// The database handle: owns the identity layer, the bucket registry and
/// the maintenance machinery for one data directory.
pub struct Tsdb {
    settings: Arc<Settings>,
    data_dir: PathBuf,
    meta: MetaLog,
    index: TagIndex,
    buckets: RwLock<BTreeMap<Timestamp, Arc<Bucket>>>,
    pools: EnginePools,
    query_pool: rayon::ThreadPool,
}

impl Tsdb {
    /// Open (creating if necessary) a data directory: replay the meta log,
    /// rebuild the tag index, and re-open every bucket it mentions.
    pub fn open(data_dir: impl Into<PathBuf>, settings: Settings) -> TsdbResult<Arc<Tsdb>> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let (meta, replay) = MetaLog::open(&data_dir)?;
        let index = TagIndex::new();
        index.load(&replay.series)?;

        let now = now_ticks(settings.resolution);
        let mut buckets = BTreeMap::new();
        let mut starts: Vec<Timestamp> = replay
            .placements
            .keys()
            .copied()
            .chain(replay.compacted.iter().copied())
            .collect();
        starts.sort_unstable();
        starts.dedup();
        for start in starts {
            let placements = replay.placements.get(&start).cloned().unwrap_or_default();
            let bucket = Bucket::open(
                &data_dir,
                start,
                Arc::clone(&settings),
                placements,
                replay.compacted.contains(&start),
                now,
            )?;
            buckets.insert(start, Arc::new(bucket));
        }

        let query_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads)
            .thread_name(|i| format!("tickdb-query-{i}"))
            .build()
            .map_err(|e| TsdbError::InvalidConfiguration(e.to_string()))?;

        let pools = EnginePools::new(settings.recycle_pool_cap, settings.page_size);

        info!(
            dir = %data_dir.display(),
            series = index.series_count(),
            buckets = buckets.len(),
            "tsdb open"
        );

        Ok(Arc::new(Tsdb {
            settings,
            data_dir,
            meta,
            index,
            buckets: RwLock::new(buckets),
            pools,
            query_pool,
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn index(&self) -> &TagIndex {
        &self.index
    }

    pub(crate) fn query_pool(&self) -> &rayon::ThreadPool {
        &self.query_pool
    }

    pub(crate) fn pools(&self) -> &EnginePools {
        &self.pools
    }

    /// Write one sample. Canonicalizes the tag set, resolves or creates the
    /// series id, routes by timestamp to its bucket and appends.
    pub fn put(
        &self,
        metric: &str,
        tags: Vec<(String, String)>,
        ts: Timestamp,
        value: f64,
    ) -> TsdbResult<()> {
        validate_metric(metric)?;
        let tags = canonicalize_tags(tags)?;
        if self.pools.shutdown_requested() {
            return Err(TsdbError::OutOfMemory);
        }

        let (id, created) = self.index.get_or_create(metric, &tags);
        if created {
            self.meta.append_new_series(id, metric, &tags)?;
        }

        let bucket = self.bucket_for(ts)?;
        bucket.append(id, ts, value, &self.meta)
    }

    /// Accept one line of the put protocol.
    pub fn put_line(&self, line: &str) -> TsdbResult<()> {
        let sample = parse_put_line(line)?;
        self.put(&sample.metric, sample.tags, sample.timestamp, sample.value)
    }

    /// Accept a whole payload of put lines; per-line outcomes, bad lines
    /// never abort the batch.
    pub fn put_lines(&self, payload: &str) -> Vec<TsdbResult<()>> {
        payload
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| self.put_line(line))
            .collect()
    }

    /// The bucket owning `ts`, created on first write into its window.
    fn bucket_for(&self, ts: Timestamp) -> TsdbResult<Arc<Bucket>> {
        let start = self.settings.bucket_start_for(ts);
        {
            let buckets = self.buckets.read().unwrap();
            if let Some(bucket) = buckets.get(&start) {
                return Ok(Arc::clone(bucket));
            }
        }
        let mut buckets = self.buckets.write().unwrap();
        if let Some(bucket) = buckets.get(&start) {
            return Ok(Arc::clone(bucket));
        }
        let bucket = Arc::new(Bucket::create(&self.data_dir, start, Arc::clone(&self.settings))?);
        buckets.insert(start, Arc::clone(&bucket));
        Ok(bucket)
    }

    /// Buckets whose window intersects `[start, end]`, in start order.
    pub(crate) fn buckets_overlapping(&self, start: Timestamp, end: Timestamp) -> Vec<Arc<Bucket>> {
        let buckets = self.buckets.read().unwrap();
        buckets
            .values()
            .filter(|b| b.window.start <= end && b.window.end > start)
            .cloned()
            .collect()
    }

    pub fn query(&self, query: &Query) -> TsdbResult<QueryOutcome> {
        executor::execute(self, query)
    }

    /// Parse and run a `POST /api/query` body; returns the response JSON and
    /// the timed-out flag.
    pub fn query_json(&self, body: &str) -> TsdbResult<(serde_json::Value, bool)> {
        let now = now_ticks(self.settings.resolution);
        let query = crate::query::parse_query_json(body, now, &self.settings)?;
        let outcome = self.query(&query)?;
        let json = crate::query::results_to_json(
            &outcome.results,
            query.ms_resolution,
            self.settings.resolution,
        );
        Ok((json, outcome.timed_out))
    }

    /// Parse and run a `GET /api/query?...` query string.
    pub fn query_uri(&self, query_string: &str) -> TsdbResult<(serde_json::Value, bool)> {
        let now = now_ticks(self.settings.resolution);
        let query = crate::query::parse_query_uri(query_string, now, &self.settings)?;
        let outcome = self.query(&query)?;
        let json = crate::query::results_to_json(
            &outcome.results,
            query.ms_resolution,
            self.settings.resolution,
        );
        Ok((json, outcome.timed_out))
    }

    fn bucket_snapshot(&self) -> Vec<Arc<Bucket>> {
        self.buckets.read().unwrap().values().cloned().collect()
    }

    /// Flush every mapped bucket.
    pub fn flush_all(&self) -> TsdbResult<()> {
        for bucket in self.bucket_snapshot() {
            bucket.flush()?;
        }
        Ok(())
    }

    fn in_compaction_window(&self) -> bool {
        let start = self.settings.compact_window_start_hour;
        let end = self.settings.compact_window_end_hour;
        if start == end {
            return false;
        }
        let hour = chrono::Local::now().hour() as u8;
        if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// One maintenance pass: flush, lifecycle transitions, pool GC, and
    /// (inside the configured window) compaction of archived buckets. The
    /// scheduler calls this on its cadence.
    pub fn run_maintenance(&self) -> TsdbResult<()> {
        let now_wall = crate::common::time::current_time_millis();
        for bucket in self.bucket_snapshot() {
            if bucket.state() == LifecycleState::Active {
                bucket.flush()?;
            }
            bucket.maybe_transition(now_wall)?;
        }
        self.pools.gc();

        if self.in_compaction_window() {
            self.compact_archived()?;
        }

        if self.pools.shutdown_requested() {
            warn!("pools exhausted; shut down and restart with a larger recycle_pool_cap");
        }
        Ok(())
    }

    /// Compact every archived bucket now, regardless of the window.
    pub fn compact_archived(&self) -> TsdbResult<()> {
        for bucket in self.bucket_snapshot() {
            if bucket.state() == LifecycleState::Archived {
                compact_bucket(&bucket, &self.meta)?;
            }
        }
        Ok(())
    }

    /// Force the bucket holding `ts` through read-only into archived, for
    /// admin tooling and tests.
    pub fn seal_bucket_containing(&self, ts: Timestamp) -> TsdbResult<()> {
        let start = self.settings.bucket_start_for(ts);
        let bucket = {
            let buckets = self.buckets.read().unwrap();
            buckets.get(&start).cloned()
        };
        let Some(bucket) = bucket else {
            return Ok(());
        };
        bucket.make_read_only()?;
        bucket.archive()
    }

    /// Orderly shutdown: flush everything and sync the meta log so replay
    /// reproduces the exact logical state.
    pub fn close(&self) -> TsdbResult<()> {
        self.flush_all()?;
        self.meta.sync()?;
        info!(dir = %self.data_dir.display(), "tsdb closed");
        Ok(())
    }

    /// Pages placed for a series in the bucket holding `ts`.
    pub fn page_count_for(&self, metric: &str, tags: &[(String, String)], ts: Timestamp) -> usize {
        let Some(id) = self
            .index
            .resolve_identity(metric, tags)
        else {
            return 0;
        };
        let start = self.settings.bucket_start_for(ts);
        let buckets = self.buckets.read().unwrap();
        buckets.get(&start).map_or(0, |b| b.page_count_for(id))
    }

    /// Metadata for listeners: placements by bucket, for diagnostics.
    pub fn bucket_states(&self) -> AHashMap<Timestamp, LifecycleState> {
        self.bucket_snapshot()
            .iter()
            .map(|b| (b.start, b.state()))
            .collect()
    }
}
