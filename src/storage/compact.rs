use crate::common::types::{DataPoint, SeriesId};
use crate::error::{TsdbError, TsdbResult};
use crate::meta::MetaLog;
use crate::storage::bucket::{Bucket, LifecycleState, PageRef};
use crate::storage::compress::Compressor;
use crate::storage::data_file::{data_file_name, header_file_name, PageFile, PageFileReader};
use crate::storage::page::Page;
use crate::storage::time_series::{merge_page_streams, PageStream};
use ahash::AHashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const TMP_DIR: &str = "compact.tmp";

/// Rewrite an archived bucket in place: every series ends up as one
/// contiguous run of de-duplicated, time-sorted in-order pages, and the
/// out-of-order pages are gone. New files are staged under a tmp directory
/// and renamed over the old set only when complete, so a failed run leaves
/// the bucket archived and retryable.
pub fn compact_bucket(bucket: &Bucket, meta: &MetaLog) -> TsdbResult<()> {
    let mut inner = bucket.inner.write().unwrap();
    if inner.state != LifecycleState::Archived {
        return Ok(());
    }
    let settings = bucket.settings();

    // decode everything cold, merged per series
    let mut series_data: Vec<(SeriesId, Vec<DataPoint>)> = Vec::new();
    {
        let mut readers: AHashMap<u32, PageFileReader> = AHashMap::new();
        let mut ids: Vec<SeriesId> = inner.placements.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let refs = &inner.placements[&id];
            let mut streams = Vec::with_capacity(refs.len());
            for (seq, r) in refs.iter().enumerate() {
                if !readers.contains_key(&r.file_id) {
                    readers.insert(
                        r.file_id,
                        PageFileReader::open(bucket.dir(), r.file_id, settings.page_size)?,
                    );
                }
                let reader = &readers[&r.file_id];
                let Some(header) = reader.read_header(r.page_index) else {
                    continue;
                };
                let mut dps = Vec::new();
                let mut compressor = Compressor::create(header.version, settings.resolution)?;
                compressor.init(header.start_ts, reader.page_ptr(r.page_index), settings.page_size);
                compressor.restore(&mut dps, header.position);
                streams.push(PageStream {
                    is_ooo: r.is_ooo,
                    seq: seq as u32,
                    dps,
                });
            }
            let mut merged = Vec::new();
            merge_page_streams(&streams, i64::MIN, i64::MAX, &mut merged);
            if !merged.is_empty() {
                series_data.push((id, merged));
            }
        }
    }

    let old_file_ids: Vec<u32> = inner
        .placements
        .values()
        .flatten()
        .map(|r| r.file_id)
        .collect();

    // stage the rewritten files
    let tmp = bucket.dir().join(TMP_DIR);
    let staged = stage_new_files(&tmp, &series_data, bucket);
    let (new_file_count, new_placements) = match staged {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_dir_all(&tmp);
            warn!(start = bucket.start, error = %e, "compaction failed, bucket left archived");
            return Err(e);
        }
    };

    // swap: rename the staged files over the live names, then drop any old
    // file the new layout no longer uses
    for id in 0..new_file_count {
        fs::rename(tmp.join(data_file_name(id)), bucket.dir().join(data_file_name(id)))?;
        fs::rename(
            tmp.join(header_file_name(id)),
            bucket.dir().join(header_file_name(id)),
        )?;
    }
    let _ = fs::remove_dir_all(&tmp);
    for id in old_file_ids {
        if id >= new_file_count {
            let _ = fs::remove_file(bucket.dir().join(data_file_name(id)));
            let _ = fs::remove_file(bucket.dir().join(header_file_name(id)));
        }
    }

    // supersede the old placements in the meta log
    meta.append_bucket_compacted(bucket.start)?;
    for (id, refs) in &new_placements {
        for r in refs {
            meta.append_placement(*id, bucket.start, r.file_id, r.page_index, r.is_ooo)?;
        }
    }

    let page_total: usize = new_placements.values().map(|v| v.len()).sum();
    info!(
        start = bucket.start,
        series = new_placements.len(),
        pages = page_total,
        "bucket compacted"
    );

    inner.placements = new_placements;
    inner.state = LifecycleState::Compacted;
    Ok(())
}

/// Re-compress all series into fresh in-order pages under `tmp`. Returns the
/// number of files written and the new placement map.
fn stage_new_files(
    tmp: &Path,
    series_data: &[(SeriesId, Vec<DataPoint>)],
    bucket: &Bucket,
) -> TsdbResult<(u32, AHashMap<SeriesId, Vec<PageRef>>)> {
    let settings = bucket.settings();
    if tmp.exists() {
        fs::remove_dir_all(tmp)?;
    }
    fs::create_dir_all(tmp)?;

    let mut files: Vec<PageFile> = Vec::new();
    let mut placements: AHashMap<SeriesId, Vec<PageRef>> = AHashMap::new();

    for (id, dps) in series_data {
        let mut pending = &dps[..];
        while !pending.is_empty() {
            let needs_file = files.last().map_or(true, |f| f.is_full());
            if needs_file {
                let next_id = files.last().map_or(0, |f| f.id + 1);
                files.push(PageFile::create(
                    tmp,
                    next_id,
                    settings.page_size,
                    settings.page_count_per_file,
                )?);
            }
            let file = files.last_mut().unwrap();
            let file_id = file.id;
            let (page_index, _) = file
                .alloc_page()?
                .expect("file with free space was just selected");

            let mut page = Page::new(
                *id,
                file_id,
                page_index,
                pending[0].timestamp,
                false,
                bucket.window,
                settings.compressor_version,
                settings.resolution,
                file.page_ptr(page_index),
                settings.page_size,
            )?;

            let mut written = 0usize;
            for dp in pending {
                if page.append(dp.timestamp, dp.value).is_full() {
                    break;
                }
                written += 1;
            }
            if written == 0 {
                return Err(TsdbError::PageTooSmall(settings.page_size));
            }
            page.flush(file.header_slot_mut(page_index));
            placements.entry(*id).or_default().push(PageRef {
                file_id,
                page_index,
                is_ooo: false,
            });
            pending = &pending[written..];
        }
    }

    for file in &files {
        file.sync()?;
    }
    let count = files.len() as u32;
    drop(files);
    Ok((count, placements))
}
