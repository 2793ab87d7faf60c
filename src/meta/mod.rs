//! The append-only metadata log: series identities and page placements.
//! Replayed at startup to rebuild the index and re-open buckets cold.

use crate::common::types::{SeriesId, Timestamp};
use crate::error::{TsdbError, TsdbResult};
use crate::storage::bucket::PageRef;
use ahash::{AHashMap, AHashSet};
use integer_encoding::VarInt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

pub const META_LOG_FILE: &str = "meta.log";

/// Every record starts with this marker so replay can tell a torn tail from
/// corruption in the middle of the log.
const RECORD_MARKER: u8 = 0xA5;

const REC_NEW_SERIES: u8 = 1;
const REC_PLACEMENT: u8 = 2;
const REC_BUCKET_COMPACTED: u8 = 3;

/// A series identity as recorded at creation. Replay order defines the id
/// order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeriesDef {
    pub id: SeriesId,
    pub metric: String,
    pub tags: Vec<(String, String)>,
}

/// Everything the log said, in replay order.
#[derive(Default)]
pub struct MetaReplay {
    pub series: Vec<SeriesDef>,
    pub placements: AHashMap<Timestamp, AHashMap<SeriesId, Vec<PageRef>>>,
    pub compacted: AHashSet<Timestamp>,
}

impl MetaReplay {
    pub fn max_series_id(&self) -> Option<SeriesId> {
        self.series.iter().map(|s| s.id).max()
    }
}

/// Writer over the single `meta.log` of a data directory. Appends are
/// serialized by a mutex and fsynced per record; readers never touch the
/// file after startup.
pub struct MetaLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl MetaLog {
    /// Open (creating if needed) and replay the log. A trailing partial
    /// record is truncated away; corruption anywhere earlier is fatal.
    pub fn open(data_dir: &Path) -> TsdbResult<(MetaLog, MetaReplay)> {
        let path = data_dir.join(META_LOG_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (replay, valid_len) = Self::replay(&bytes)?;
        if valid_len < bytes.len() {
            warn!(
                dropped = bytes.len() - valid_len,
                "truncating partial record at end of meta log"
            );
            let f = OpenOptions::new().write(true).open(&path)?;
            f.set_len(valid_len as u64)?;
            f.sync_data()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(
            series = replay.series.len(),
            buckets = replay.placements.len(),
            "meta log replayed"
        );
        Ok((MetaLog { file: Mutex::new(file), path }, replay))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(bytes: &[u8]) -> TsdbResult<(MetaReplay, usize)> {
        let mut replay = MetaReplay::default();
        let mut seen_placements: AHashSet<(SeriesId, Timestamp, u32, u32)> = AHashSet::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let record_start = offset;
            if bytes[offset] != RECORD_MARKER {
                return Err(TsdbError::Fatal(format!(
                    "meta log corrupted at offset {record_start}: bad record marker"
                )));
            }
            let Some((len, len_bytes)) = u32::decode_var(&bytes[offset + 1..]) else {
                // ran out of bytes mid-length: torn tail
                return Ok((replay, record_start));
            };
            let payload_at = offset + 1 + len_bytes;
            let payload_end = payload_at + len as usize;
            if payload_end > bytes.len() {
                return Ok((replay, record_start));
            }

            Self::apply(&bytes[payload_at..payload_end], &mut replay, &mut seen_placements)
                .map_err(|e| {
                    TsdbError::Fatal(format!("meta log corrupted at offset {record_start}: {e}"))
                })?;
            offset = payload_end;
        }

        Ok((replay, offset))
    }

    fn apply(
        payload: &[u8],
        replay: &mut MetaReplay,
        seen: &mut AHashSet<(SeriesId, Timestamp, u32, u32)>,
    ) -> Result<(), String> {
        let mut r = PayloadReader::new(payload);
        match r.u8()? {
            REC_NEW_SERIES => {
                let id = r.varint_u32()?;
                let metric = r.string()?;
                let tag_count = r.varint_u32()?;
                let mut tags = Vec::with_capacity(tag_count as usize);
                for _ in 0..tag_count {
                    let key = r.string()?;
                    let value = r.string()?;
                    tags.push((key, value));
                }
                replay.series.push(SeriesDef { id, metric, tags });
            }
            REC_PLACEMENT => {
                let id = r.varint_u32()?;
                let bucket_start = r.varint_i64()?;
                let file_id = r.varint_u32()?;
                let page_index = r.varint_u32()?;
                let flags = r.u8()?;
                // identical keys are last-wins; the list keeps first
                // position so merge order follows the original placement
                if seen.insert((id, bucket_start, file_id, page_index)) {
                    replay
                        .placements
                        .entry(bucket_start)
                        .or_default()
                        .entry(id)
                        .or_default()
                        .push(PageRef {
                            file_id,
                            page_index,
                            is_ooo: flags & 1 != 0,
                        });
                }
            }
            REC_BUCKET_COMPACTED => {
                let bucket_start = r.varint_i64()?;
                // placements recorded before the compaction are superseded
                replay.placements.remove(&bucket_start);
                replay.compacted.insert(bucket_start);
                seen.retain(|(_, b, _, _)| *b != bucket_start);
            }
            other => return Err(format!("unknown record type {other}")),
        }
        if !r.is_empty() {
            return Err("trailing bytes in record".to_string());
        }
        Ok(())
    }

    fn append(&self, payload: &[u8]) -> TsdbResult<()> {
        let mut framed = Vec::with_capacity(payload.len() + 6);
        framed.push(RECORD_MARKER);
        framed.extend_from_slice(&(payload.len() as u32).encode_var_vec());
        framed.extend_from_slice(payload);

        let mut file = self.file.lock().unwrap();
        file.write_all(&framed)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn append_new_series(
        &self,
        id: SeriesId,
        metric: &str,
        tags: &[(String, String)],
    ) -> TsdbResult<()> {
        let mut payload = Vec::with_capacity(64);
        payload.push(REC_NEW_SERIES);
        payload.extend_from_slice(&id.encode_var_vec());
        write_string(&mut payload, metric);
        payload.extend_from_slice(&(tags.len() as u32).encode_var_vec());
        for (key, value) in tags {
            write_string(&mut payload, key);
            write_string(&mut payload, value);
        }
        self.append(&payload)
    }

    pub fn append_placement(
        &self,
        id: SeriesId,
        bucket_start: Timestamp,
        file_id: u32,
        page_index: u32,
        is_ooo: bool,
    ) -> TsdbResult<()> {
        let mut payload = Vec::with_capacity(24);
        payload.push(REC_PLACEMENT);
        payload.extend_from_slice(&id.encode_var_vec());
        payload.extend_from_slice(&bucket_start.encode_var_vec());
        payload.extend_from_slice(&file_id.encode_var_vec());
        payload.extend_from_slice(&page_index.encode_var_vec());
        payload.push(is_ooo as u8);
        self.append(&payload)
    }

    pub fn append_bucket_compacted(&self, bucket_start: Timestamp) -> TsdbResult<()> {
        let mut payload = Vec::with_capacity(12);
        payload.push(REC_BUCKET_COMPACTED);
        payload.extend_from_slice(&bucket_start.encode_var_vec());
        self.append(&payload)
    }

    pub fn sync(&self) -> TsdbResult<()> {
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).encode_var_vec());
    out.extend_from_slice(s.as_bytes());
}

struct PayloadReader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        PayloadReader { bytes, at: 0 }
    }

    fn is_empty(&self) -> bool {
        self.at == self.bytes.len()
    }

    fn u8(&mut self) -> Result<u8, String> {
        let b = *self.bytes.get(self.at).ok_or("record too short")?;
        self.at += 1;
        Ok(b)
    }

    fn varint_u32(&mut self) -> Result<u32, String> {
        let (v, n) = u32::decode_var(&self.bytes[self.at..]).ok_or("bad varint")?;
        self.at += n;
        Ok(v)
    }

    fn varint_i64(&mut self) -> Result<i64, String> {
        let (v, n) = i64::decode_var(&self.bytes[self.at..]).ok_or("bad varint")?;
        self.at += n;
        Ok(v)
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.varint_u32()? as usize;
        let end = self.at + len;
        if end > self.bytes.len() {
            return Err("string overruns record".to_string());
        }
        let s = std::str::from_utf8(&self.bytes[self.at..end])
            .map_err(|_| "invalid utf-8".to_string())?;
        self.at = end;
        Ok(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replay_reconstructs_series_and_placements() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, replay) = MetaLog::open(dir.path()).unwrap();
            assert!(replay.series.is_empty());
            log.append_new_series(0, "cpu.user", &tags(&[("host", "web01")]))
                .unwrap();
            log.append_new_series(1, "cpu.user", &tags(&[("host", "web02")]))
                .unwrap();
            log.append_placement(0, 7_200_000, 0, 0, false).unwrap();
            log.append_placement(1, 7_200_000, 0, 1, true).unwrap();
        }

        let (_log, replay) = MetaLog::open(dir.path()).unwrap();
        assert_eq!(replay.series.len(), 2);
        assert_eq!(replay.series[0].metric, "cpu.user");
        assert_eq!(replay.series[1].id, 1);
        assert_eq!(replay.max_series_id(), Some(1));

        let bucket = &replay.placements[&7_200_000];
        assert_eq!(
            bucket[&0],
            vec![PageRef {
                file_id: 0,
                page_index: 0,
                is_ooo: false
            }]
        );
        assert!(bucket[&1][0].is_ooo);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, _) = MetaLog::open(dir.path()).unwrap();
            log.append_new_series(0, "m", &[]).unwrap();
        }
        // simulate a crash mid-append
        let path = dir.path().join(META_LOG_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let good_len = bytes.len();
        bytes.extend_from_slice(&[RECORD_MARKER, 200]); // length says 200, no payload
        std::fs::write(&path, &bytes).unwrap();

        let (_log, replay) = MetaLog::open(dir.path()).unwrap();
        assert_eq!(replay.series.len(), 1);
        assert_eq!(std::fs::read(&path).unwrap().len(), good_len);
    }

    #[test]
    fn corruption_in_the_middle_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, _) = MetaLog::open(dir.path()).unwrap();
            log.append_new_series(0, "m", &[]).unwrap();
            log.append_new_series(1, "n", &[]).unwrap();
        }
        let path = dir.path().join(META_LOG_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 0x00; // clobber the first marker
        std::fs::write(&path, &bytes).unwrap();

        match MetaLog::open(dir.path()) {
            Err(e) => assert!(e.is_fatal()),
            Ok(_) => panic!("corrupted log must not open"),
        }
    }

    #[test]
    fn compaction_supersedes_earlier_placements() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, _) = MetaLog::open(dir.path()).unwrap();
            log.append_new_series(0, "m", &[]).unwrap();
            log.append_placement(0, 0, 0, 0, false).unwrap();
            log.append_placement(0, 0, 0, 1, true).unwrap();
            log.append_bucket_compacted(0).unwrap();
            log.append_placement(0, 0, 0, 0, false).unwrap();
        }

        let (_log, replay) = MetaLog::open(dir.path()).unwrap();
        assert!(replay.compacted.contains(&0));
        let refs = &replay.placements[&0][&0];
        assert_eq!(refs.len(), 1);
        assert!(!refs[0].is_ooo);
    }

    #[test]
    fn duplicate_placements_collapse() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, _) = MetaLog::open(dir.path()).unwrap();
            log.append_placement(3, 100, 1, 5, false).unwrap();
            log.append_placement(3, 100, 1, 5, false).unwrap();
        }
        let (_log, replay) = MetaLog::open(dir.path()).unwrap();
        assert_eq!(replay.placements[&100][&3].len(), 1);
    }
}
