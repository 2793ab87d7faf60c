use crate::common::time::current_time_millis;
use crate::common::types::{DataPoint, SeriesId, TimeRange, Timestamp};
use crate::config::Settings;
use crate::error::{TsdbError, TsdbResult};
use crate::meta::MetaLog;
use crate::storage::compress::Compressor;
use crate::storage::data_file::{PageFile, PageFileReader};
use crate::storage::page::Page;
use crate::storage::time_series::{
    merge_page_streams, AppendOutcome, PageStream, SeriesState, TimeSeries,
};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub const MANIFEST_MAGIC: &str = "TICKDB";
pub const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest";

/// Durable description of a bucket directory, written once at creation and
/// checked on every open.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub magic: String,
    pub version: u32,
    pub page_size: usize,
    pub compressor_version: u8,
    pub bucket_start: Timestamp,
    pub bucket_duration: i64,
    pub page_count: usize,
    pub timestamp_resolution: crate::config::Resolution,
}

impl Manifest {
    fn for_settings(start: Timestamp, settings: &Settings) -> Manifest {
        Manifest {
            magic: MANIFEST_MAGIC.to_string(),
            version: MANIFEST_VERSION,
            page_size: settings.page_size,
            compressor_version: settings.compressor_version,
            bucket_start: start,
            bucket_duration: settings.bucket_duration_ticks(),
            page_count: settings.page_count_per_file,
            timestamp_resolution: settings.resolution,
        }
    }

    fn write(&self, dir: &Path) -> TsdbResult<()> {
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|e| TsdbError::Fatal(format!("manifest encode: {e}")))?;
        fs::write(dir.join(MANIFEST_FILE), payload)?;
        Ok(())
    }

    fn read(dir: &Path) -> TsdbResult<Manifest> {
        let payload = fs::read(dir.join(MANIFEST_FILE))?;
        serde_json::from_slice(&payload)
            .map_err(|e| TsdbError::Fatal(format!("{}: bad manifest: {e}", dir.display())))
    }

    fn check(&self, start: Timestamp, settings: &Settings) -> TsdbResult<()> {
        let expected = Manifest::for_settings(start, settings);
        if *self != expected {
            return Err(TsdbError::Fatal(format!(
                "bucket {start}: manifest mismatch (found {self:?}, expected {expected:?})"
            )));
        }
        Ok(())
    }
}

/// Where a bucket is in its life. Writes are only accepted while `Active`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    ReadOnly,
    Archived,
    Compacted,
}

/// A page placement within the bucket, in the order it was recorded. The
/// ordinal position doubles as the merge sequence for duplicate resolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageRef {
    pub file_id: u32,
    pub page_index: u32,
    pub is_ooo: bool,
}

pub(crate) struct BucketInner {
    pub state: LifecycleState,
    pub files: Vec<PageFile>,
    pub series: AHashMap<SeriesId, Arc<TimeSeries>>,
    pub placements: AHashMap<SeriesId, Vec<PageRef>>,
}

/// All state for one contiguous time window: the mapped page files, the
/// per-series write targets, and the lifecycle position.
pub struct Bucket {
    pub start: Timestamp,
    pub window: TimeRange,
    dir: PathBuf,
    settings: Arc<Settings>,
    pub(crate) inner: RwLock<BucketInner>,
    last_write_ms: AtomicI64,
    last_flush_ms: AtomicI64,
    degraded: AtomicBool,
}

impl Bucket {
    pub fn create(root: &Path, start: Timestamp, settings: Arc<Settings>) -> TsdbResult<Bucket> {
        let dir = root.join(start.to_string());
        fs::create_dir_all(&dir)?;
        Manifest::for_settings(start, &settings).write(&dir)?;
        info!(start, dir = %dir.display(), "created bucket");
        Ok(Self::empty(dir, start, settings, LifecycleState::Active))
    }

    fn empty(dir: PathBuf, start: Timestamp, settings: Arc<Settings>, state: LifecycleState) -> Bucket {
        let window = TimeRange::new(start, start + settings.bucket_duration_ticks());
        Bucket {
            start,
            window,
            dir,
            settings,
            inner: RwLock::new(BucketInner {
                state,
                files: Vec::new(),
                series: AHashMap::new(),
                placements: AHashMap::new(),
            }),
            last_write_ms: AtomicI64::new(current_time_millis()),
            last_flush_ms: AtomicI64::new(current_time_millis()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Open an existing bucket directory. `placements` comes from meta log
    /// replay. The bucket re-activates only if its window still covers the
    /// current wall clock; otherwise it opens read-only.
    pub fn open(
        root: &Path,
        start: Timestamp,
        settings: Arc<Settings>,
        placements: AHashMap<SeriesId, Vec<PageRef>>,
        compacted: bool,
        now: Timestamp,
    ) -> TsdbResult<Bucket> {
        let dir = root.join(start.to_string());
        let manifest = Manifest::read(&dir)?;
        manifest.check(start, &settings)?;

        let state = if compacted {
            LifecycleState::Compacted
        } else {
            let window = TimeRange::new(start, start + settings.bucket_duration_ticks());
            if window.contains(now) {
                LifecycleState::Active
            } else {
                LifecycleState::ReadOnly
            }
        };

        let bucket = Self::empty(dir, start, settings, state);
        {
            let mut inner = bucket.inner.write().unwrap();
            inner.placements = placements;

            if matches!(state, LifecycleState::Active | LifecycleState::ReadOnly) {
                bucket.map_files(&mut inner)?;
            }
            if state == LifecycleState::Active {
                bucket.reopen_append_targets(&mut inner)?;
            }
        }
        debug!(start, ?state, "opened bucket");
        Ok(bucket)
    }

    fn map_files(&self, inner: &mut BucketInner) -> TsdbResult<()> {
        let mut ids: Vec<u32> = inner
            .placements
            .values()
            .flatten()
            .map(|r| r.file_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        inner.files.clear();
        for id in ids {
            let file = PageFile::open(
                &self.dir,
                id,
                self.settings.page_size,
                self.settings.page_count_per_file,
            )?;
            inner.files.push(file);
        }
        // allocation resumes past the highest placed slot even if the header
        // was never flushed
        for refs in inner.placements.values() {
            for r in refs {
                if let Some(file) = inner.files.iter_mut().find(|f| f.id == r.file_id) {
                    file.note_used(r.page_index);
                }
            }
        }
        Ok(())
    }

    /// Restore the last non-full page of each kind as the live append
    /// target.
    fn reopen_append_targets(&self, inner: &mut BucketInner) -> TsdbResult<()> {
        let resolution = self.settings.resolution;
        let page_size = self.settings.page_size;
        let series_ids: Vec<SeriesId> = inner.placements.keys().copied().collect();

        for id in series_ids {
            let mut in_order: Option<Page> = None;
            let mut ooo: Option<Page> = None;

            let refs = inner.placements.get(&id).cloned().unwrap_or_default();
            for r in refs.iter().rev() {
                let slot = if r.is_ooo { &mut ooo } else { &mut in_order };
                if slot.is_some() {
                    continue;
                }
                let Some(file) = inner.files.iter().find(|f| f.id == r.file_id) else {
                    continue;
                };
                let Some(header) = file.read_header(r.page_index) else {
                    continue;
                };
                if header.is_full {
                    continue;
                }
                let mut scratch = Vec::new();
                let page = Page::restore(
                    r.file_id,
                    r.page_index,
                    &header,
                    self.window,
                    resolution,
                    file.page_ptr(r.page_index),
                    page_size,
                    &mut scratch,
                )?;
                *slot = Some(page);
                if in_order.is_some() && ooo.is_some() {
                    break;
                }
            }

            if in_order.is_some() || ooo.is_some() {
                let series = inner
                    .series
                    .entry(id)
                    .or_insert_with(|| Arc::new(TimeSeries::new(id)))
                    .clone();
                let mut state = series.state.lock().unwrap();
                state.in_order = in_order;
                state.ooo = ooo;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.read().unwrap().state
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(AtomicOrdering::SeqCst)
    }

    pub fn last_write_wall_ms(&self) -> i64 {
        self.last_write_ms.load(AtomicOrdering::SeqCst)
    }

    fn guard_io<T>(&self, result: TsdbResult<T>) -> TsdbResult<T> {
        if let Err(e) = &result {
            if e.is_bucket_local() {
                warn!(start = self.start, error = %e, "bucket degraded");
                self.degraded.store(true, AtomicOrdering::SeqCst);
            }
        }
        result
    }

    /// Append one sample. The fast path holds the bucket lock shared and the
    /// series mutex; page allocation retries through the exclusive path.
    pub fn append(&self, id: SeriesId, ts: Timestamp, value: f64, meta: &MetaLog) -> TsdbResult<()> {
        debug_assert!(self.window.contains(ts));
        if self.is_degraded() {
            return Err(TsdbError::Io(std::io::Error::other("bucket degraded")));
        }

        // a late write may re-open a compacted bucket as read-only; the
        // write itself is still rejected
        if self.state() == LifecycleState::Compacted && self.settings.allow_late_writes {
            let mut inner = self.inner.write().unwrap();
            if inner.state == LifecycleState::Compacted {
                self.map_files(&mut inner)?;
                inner.state = LifecycleState::ReadOnly;
                info!(start = self.start, "late write re-opened compacted bucket read-only");
            }
        }

        loop {
            let (is_ooo, anchor) = {
                let inner = self.inner.read().unwrap();
                self.check_writable(&inner)?;

                if let Some(series) = inner.series.get(&id) {
                    let mut state = series.state.lock().unwrap();
                    match self.try_append_locked(&mut state, ts, value)? {
                        AppendOutcome::Appended => {
                            self.last_write_ms
                                .store(current_time_millis(), AtomicOrdering::SeqCst);
                            return Ok(());
                        }
                        AppendOutcome::NeedsPage { is_ooo, anchor } => (is_ooo, anchor),
                    }
                } else {
                    (false, ts)
                }
            };

            let result = self.prepare_page(id, is_ooo, anchor, meta);
            self.guard_io(result)?;
        }
    }

    fn try_append_locked(
        &self,
        state: &mut SeriesState,
        ts: Timestamp,
        value: f64,
    ) -> TsdbResult<AppendOutcome> {
        state.try_append(ts, value).map_err(|e| match e {
            TsdbError::PageTooSmall(_) => TsdbError::PageTooSmall(self.settings.page_size),
            other => other,
        })
    }

    fn check_writable(&self, inner: &BucketInner) -> TsdbResult<()> {
        match inner.state {
            LifecycleState::Active => Ok(()),
            LifecycleState::ReadOnly | LifecycleState::Archived => {
                Err(TsdbError::BucketReadOnly(self.start))
            }
            LifecycleState::Compacted => Err(TsdbError::BucketCompacted(self.start)),
        }
    }

    /// Slow path: install a fresh page (and possibly a fresh file) for the
    /// series under the exclusive lock, sealing the page that filled up.
    fn prepare_page(
        &self,
        id: SeriesId,
        is_ooo: bool,
        anchor: Timestamp,
        meta: &MetaLog,
    ) -> TsdbResult<()> {
        let mut inner = self.inner.write().unwrap();
        self.check_writable(&inner)?;

        let series = inner
            .series
            .entry(id)
            .or_insert_with(|| Arc::new(TimeSeries::new(id)))
            .clone();

        // re-check under the exclusive lock; a racing writer may have
        // already installed a usable page
        {
            let state = series.state.lock().unwrap();
            let current = if is_ooo { &state.ooo } else { &state.in_order };
            if let Some(page) = current {
                if !page.is_full() {
                    return Ok(());
                }
            }
        }

        // find or create a file with room
        let needs_file = match inner.files.last() {
            Some(file) => file.is_full(),
            None => true,
        };
        if needs_file {
            let next_id = inner.files.last().map_or(0, |f| f.id + 1);
            let file = PageFile::create(
                &self.dir,
                next_id,
                self.settings.page_size,
                self.settings.page_count_per_file,
            )?;
            inner.files.push(file);
        }

        let file = inner.files.last_mut().unwrap();
        let file_id = file.id;
        let (page_index, remapped) = file
            .alloc_page()?
            .expect("file with free space was just selected");
        let base = file.page_ptr(page_index);

        if remapped {
            Self::rebase_open_pages(&inner, file_id);
        }

        let page = Page::new(
            id,
            file_id,
            page_index,
            anchor,
            is_ooo,
            self.window,
            self.settings.compressor_version,
            self.settings.resolution,
            base,
            self.settings.page_size,
        )?;

        {
            let mut state = series.state.lock().unwrap();
            let slot = if is_ooo {
                &mut state.ooo
            } else {
                &mut state.in_order
            };
            if let Some(mut sealed) = slot.replace(page) {
                // the filled page leaves the write path for good; make its
                // header durable now
                if let Some(owner) = inner.files.iter().find(|f| f.id == sealed.file_id) {
                    sealed.flush(owner.header_slot_mut(sealed.page_index));
                }
            }
        }

        inner
            .placements
            .entry(id)
            .or_default()
            .push(PageRef {
                file_id,
                page_index,
                is_ooo,
            });
        meta.append_placement(id, self.start, file_id, page_index, is_ooo)?;
        Ok(())
    }

    /// After a remap every open page of the file points at stale memory.
    /// Runs under the exclusive bucket lock, which has drained all writers.
    fn rebase_open_pages(inner: &BucketInner, file_id: u32) {
        let Some(file) = inner.files.iter().find(|f| f.id == file_id) else {
            return;
        };
        for series in inner.series.values() {
            let mut state = series.state.lock().unwrap();
            for page in state.open_pages() {
                if page.file_id == file_id {
                    page.rebase(file.page_ptr(page.page_index));
                }
            }
        }
    }

    /// Read one series over `[start, end]` (inclusive), merged and
    /// duplicate-resolved.
    pub fn read_series(
        &self,
        id: SeriesId,
        start: Timestamp,
        end: Timestamp,
        out: &mut Vec<DataPoint>,
    ) -> TsdbResult<()> {
        let inner = self.inner.read().unwrap();
        let Some(refs) = inner.placements.get(&id) else {
            return Ok(());
        };
        if refs.is_empty() {
            return Ok(());
        }

        let mut streams: Vec<PageStream> = Vec::with_capacity(refs.len());

        match inner.state {
            LifecycleState::Active | LifecycleState::ReadOnly => {
                let open_guard = inner.series.get(&id).map(|s| s.state.lock().unwrap());
                for (seq, r) in refs.iter().enumerate() {
                    let mut dps = Vec::new();
                    // prefer the live compressor for the open page
                    let live = open_guard.as_ref().and_then(|state| {
                        [state.in_order.as_ref(), state.ooo.as_ref()]
                            .into_iter()
                            .flatten()
                            .find(|p| p.file_id == r.file_id && p.page_index == r.page_index)
                    });
                    if let Some(page) = live {
                        page.uncompress(&mut dps);
                    } else {
                        let Some(file) = inner.files.iter().find(|f| f.id == r.file_id) else {
                            continue;
                        };
                        let Some(header) = file.read_header(r.page_index) else {
                            continue; // placed but never flushed
                        };
                        let mut compressor =
                            Compressor::create(header.version, self.settings.resolution)?;
                        compressor.init(
                            header.start_ts,
                            file.page_ptr(r.page_index),
                            self.settings.page_size,
                        );
                        compressor.restore(&mut dps, header.position);
                    }
                    streams.push(PageStream {
                        is_ooo: r.is_ooo,
                        seq: seq as u32,
                        dps,
                    });
                }
            }
            LifecycleState::Archived | LifecycleState::Compacted => {
                // mappings were released; re-map read-only for this read
                let mut readers: AHashMap<u32, PageFileReader> = AHashMap::new();
                for (seq, r) in refs.iter().enumerate() {
                    if !readers.contains_key(&r.file_id) {
                        let reader =
                            PageFileReader::open(&self.dir, r.file_id, self.settings.page_size)?;
                        readers.insert(r.file_id, reader);
                    }
                    let reader = &readers[&r.file_id];
                    let Some(header) = reader.read_header(r.page_index) else {
                        continue;
                    };
                    let mut dps = Vec::new();
                    let mut compressor =
                        Compressor::create(header.version, self.settings.resolution)?;
                    compressor.init(
                        header.start_ts,
                        reader.page_ptr(r.page_index),
                        self.settings.page_size,
                    );
                    compressor.restore(&mut dps, header.position);
                    streams.push(PageStream {
                        is_ooo: r.is_ooo,
                        seq: seq as u32,
                        dps,
                    });
                }
            }
        }

        merge_page_streams(&streams, start, end, out);
        Ok(())
    }

    /// Flush dirty compressor state into every page header and msync the
    /// backing files.
    pub fn flush(&self) -> TsdbResult<()> {
        let result = self.flush_inner();
        self.guard_io(result)
    }

    fn flush_inner(&self) -> TsdbResult<()> {
        let inner = self.inner.read().unwrap();
        if !matches!(
            inner.state,
            LifecycleState::Active | LifecycleState::ReadOnly
        ) {
            return Ok(());
        }
        let mut dirty = false;
        for series in inner.series.values() {
            let mut state = series.state.lock().unwrap();
            for page in state.open_pages() {
                if let Some(file) = inner.files.iter().find(|f| f.id == page.file_id) {
                    dirty |= page.flush(file.header_slot_mut(page.page_index));
                }
            }
        }
        if dirty {
            for file in &inner.files {
                file.sync()?;
            }
        }
        self.last_flush_ms
            .store(current_time_millis(), AtomicOrdering::SeqCst);
        Ok(())
    }

    /// Active -> ReadOnly: flush everything and stop accepting writes.
    pub fn make_read_only(&self) -> TsdbResult<()> {
        self.flush()?;
        let mut inner = self.inner.write().unwrap();
        if inner.state == LifecycleState::Active {
            inner.state = LifecycleState::ReadOnly;
            info!(start = self.start, "bucket is now read-only");
        }
        Ok(())
    }

    /// ReadOnly -> Archived: release the mappings. Queries re-map on demand.
    pub fn archive(&self) -> TsdbResult<()> {
        self.flush()?;
        let mut inner = self.inner.write().unwrap();
        if inner.state != LifecycleState::ReadOnly {
            return Ok(());
        }
        // open pages hold pointers into the mappings; drop them first
        for series in inner.series.values() {
            let mut state = series.state.lock().unwrap();
            state.in_order = None;
            state.ooo = None;
        }
        inner.files.clear();
        inner.state = LifecycleState::Archived;
        info!(start = self.start, "bucket archived");
        Ok(())
    }

    /// Wall-clock driven transitions, called from the scheduler tick.
    pub fn maybe_transition(&self, now_wall_ms: i64) -> TsdbResult<()> {
        let idle = now_wall_ms.saturating_sub(self.last_write_wall_ms());
        match self.state() {
            LifecycleState::Active => {
                if idle > self.settings.read_only_threshold.as_millis() as i64 {
                    self.make_read_only()?;
                }
            }
            LifecycleState::ReadOnly => {
                if idle > self.settings.archive_threshold.as_millis() as i64 {
                    self.archive()?;
                }
            }
            LifecycleState::Archived | LifecycleState::Compacted => {}
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Number of pages placed for a series, across both kinds.
    pub fn page_count_for(&self, id: SeriesId) -> usize {
        let inner = self.inner.read().unwrap();
        inner.placements.get(&id).map_or(0, |refs| refs.len())
    }

    pub fn series_ids(&self) -> Vec<SeriesId> {
        let inner = self.inner.read().unwrap();
        inner.placements.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Resolution;
    use tempfile::TempDir;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.page_size = 256;
        settings.page_count_per_file = 16;
        settings.resolution = Resolution::Ms;
        settings
    }

    fn new_bucket(dir: &TempDir, settings: Settings) -> (Bucket, MetaLog) {
        let (meta, _) = MetaLog::open(dir.path()).unwrap();
        let bucket = Bucket::create(dir.path(), 0, Arc::new(settings)).unwrap();
        (bucket, meta)
    }

    fn read_all(bucket: &Bucket, id: SeriesId) -> Vec<DataPoint> {
        let mut out = Vec::new();
        bucket.read_series(id, i64::MIN, i64::MAX, &mut out).unwrap();
        out
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let (bucket, meta) = new_bucket(&dir, test_settings());

        bucket.append(0, 1_000, 1.0, &meta).unwrap();
        bucket.append(0, 2_000, 2.0, &meta).unwrap();
        bucket.append(1, 1_500, 9.0, &meta).unwrap();

        assert_eq!(
            read_all(&bucket, 0),
            vec![DataPoint::new(1_000, 1.0), DataPoint::new(2_000, 2.0)]
        );
        assert_eq!(read_all(&bucket, 1), vec![DataPoint::new(1_500, 9.0)]);
        assert_eq!(read_all(&bucket, 2), Vec::new());
    }

    #[test]
    fn backdated_samples_route_to_out_of_order_page() {
        let dir = tempfile::tempdir().unwrap();
        let (bucket, meta) = new_bucket(&dir, test_settings());

        bucket.append(0, 3_000, 3.0, &meta).unwrap();
        bucket.append(0, 2_000, 2.0, &meta).unwrap();
        bucket.append(0, 1_000, 1.0, &meta).unwrap();

        assert_eq!(bucket.page_count_for(0), 2);
        assert_eq!(
            read_all(&bucket, 0),
            vec![
                DataPoint::new(1_000, 1.0),
                DataPoint::new(2_000, 2.0),
                DataPoint::new(3_000, 3.0)
            ]
        );
    }

    #[test]
    fn full_pages_roll_over_and_reads_span_them() {
        let dir = tempfile::tempdir().unwrap();
        let (bucket, meta) = new_bucket(&dir, test_settings());

        // 256-byte pages fill after a few hundred samples
        let count = 2_000;
        for i in 0..count {
            bucket.append(0, 1_000 + i, i as f64, &meta).unwrap();
        }
        assert!(bucket.page_count_for(0) > 1);

        let got = read_all(&bucket, 0);
        assert_eq!(got.len(), count as usize);
        assert_eq!(got[0], DataPoint::new(1_000, 0.0));
        assert_eq!(
            got[count as usize - 1],
            DataPoint::new(1_000 + count - 1, (count - 1) as f64)
        );
    }

    #[test]
    fn writes_survive_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings();
        let placements;
        {
            let (bucket, meta) = new_bucket(&dir, settings.clone());
            bucket.append(0, 1_000, 1.0, &meta).unwrap();
            bucket.append(0, 2_000, 2.0, &meta).unwrap();
            bucket.flush().unwrap();
            placements = {
                let inner = bucket.inner.read().unwrap();
                inner.placements.clone()
            };
        }

        let bucket = Bucket::open(
            dir.path(),
            0,
            Arc::new(settings),
            placements,
            false,
            1_500, // inside the window, so the bucket re-activates
        )
        .unwrap();
        assert_eq!(bucket.state(), LifecycleState::Active);
        assert_eq!(
            read_all(&bucket, 0),
            vec![DataPoint::new(1_000, 1.0), DataPoint::new(2_000, 2.0)]
        );

        // appends continue on the restored page
        let (meta, _) = MetaLog::open(dir.path()).unwrap();
        bucket.append(0, 3_000, 3.0, &meta).unwrap();
        assert_eq!(read_all(&bucket, 0).len(), 3);
    }

    #[test]
    fn read_only_rejects_writes_but_serves_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (bucket, meta) = new_bucket(&dir, test_settings());
        bucket.append(0, 1_000, 1.0, &meta).unwrap();

        bucket.make_read_only().unwrap();
        assert_eq!(bucket.state(), LifecycleState::ReadOnly);
        assert!(matches!(
            bucket.append(0, 2_000, 2.0, &meta),
            Err(TsdbError::BucketReadOnly(0))
        ));
        assert_eq!(read_all(&bucket, 0).len(), 1);
    }

    #[test]
    fn archived_bucket_remaps_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let (bucket, meta) = new_bucket(&dir, test_settings());
        bucket.append(0, 1_000, 1.0, &meta).unwrap();
        bucket.append(0, 2_000, 2.0, &meta).unwrap();

        bucket.make_read_only().unwrap();
        bucket.archive().unwrap();
        assert_eq!(bucket.state(), LifecycleState::Archived);
        {
            let inner = bucket.inner.read().unwrap();
            assert!(inner.files.is_empty());
        }

        assert_eq!(
            read_all(&bucket, 0),
            vec![DataPoint::new(1_000, 1.0), DataPoint::new(2_000, 2.0)]
        );
    }

    #[test]
    fn manifest_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings();
        {
            let (_bucket, _meta) = new_bucket(&dir, settings.clone());
        }
        let mut other = settings;
        other.page_size = 512;
        let result = Bucket::open(dir.path(), 0, Arc::new(other), AHashMap::new(), false, 0);
        assert!(matches!(result, Err(TsdbError::Fatal(_))));
    }

    #[test]
    fn duplicate_timestamp_prefers_latest_writer() {
        let dir = tempfile::tempdir().unwrap();
        let (bucket, meta) = new_bucket(&dir, test_settings());
        bucket.append(0, 2_000_000, 1.0, &meta).unwrap();
        bucket.append(0, 2_000_000, 9.0, &meta).unwrap();
        assert_eq!(read_all(&bucket, 0), vec![DataPoint::new(2_000_000, 9.0)]);
    }
}
