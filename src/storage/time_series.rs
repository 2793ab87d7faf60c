use crate::common::types::{DataPoint, SeriesId, Timestamp};
use crate::error::{TsdbError, TsdbResult};
use crate::storage::page::Page;
use min_max_heap::MinMaxHeap;
use std::cmp::Ordering;
use std::sync::Mutex;

/// Per-series state inside one bucket. The mutex serializes every append to
/// the series; concurrent writers are linearized by acquisition order.
pub struct TimeSeries {
    pub id: SeriesId,
    pub state: Mutex<SeriesState>,
}

impl TimeSeries {
    pub fn new(id: SeriesId) -> Self {
        TimeSeries {
            id,
            state: Mutex::new(SeriesState {
                in_order: None,
                ooo: None,
            }),
        }
    }
}

/// The open append targets. Sealed pages live on in the bucket's placement
/// list and are read back through their durable headers.
pub struct SeriesState {
    pub in_order: Option<Page>,
    pub ooo: Option<Page>,
}

/// What a single locked append attempt decided.
pub enum AppendOutcome {
    Appended,
    /// No usable page; the caller allocates one (bucket write lock) and
    /// retries. The page that filled up is handed back for sealing.
    NeedsPage {
        is_ooo: bool,
        anchor: Timestamp,
    },
}

impl SeriesState {
    /// One append under the series mutex. In-order timestamps go to the
    /// in-order page; `ts <= last_ts` diverts to the out-of-order page.
    pub fn try_append(&mut self, ts: Timestamp, value: f64) -> TsdbResult<AppendOutcome> {
        let Some(page) = self.in_order.as_mut() else {
            return Ok(AppendOutcome::NeedsPage {
                is_ooo: false,
                anchor: ts,
            });
        };

        if ts > page.last_tstamp() || page.is_empty() {
            if page.append(ts, value).is_full() {
                if page.is_empty() {
                    return Err(TsdbError::PageTooSmall(0));
                }
                return Ok(AppendOutcome::NeedsPage {
                    is_ooo: false,
                    anchor: ts,
                });
            }
            return Ok(AppendOutcome::Appended);
        }

        // back-dated sample
        let Some(page) = self.ooo.as_mut() else {
            return Ok(AppendOutcome::NeedsPage {
                is_ooo: true,
                anchor: ts,
            });
        };
        if page.append(ts, value).is_full() {
            if page.is_empty() {
                return Err(TsdbError::PageTooSmall(0));
            }
            return Ok(AppendOutcome::NeedsPage {
                is_ooo: true,
                anchor: ts,
            });
        }
        Ok(AppendOutcome::Appended)
    }

    pub fn open_pages(&mut self) -> impl Iterator<Item = &mut Page> {
        self.in_order.iter_mut().chain(self.ooo.iter_mut())
    }
}

/// One decoded page, tagged for merge ordering.
pub struct PageStream {
    pub is_ooo: bool,
    /// Placement ordinal within the bucket; earlier pages merge first.
    pub seq: u32,
    pub dps: Vec<DataPoint>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
struct HeapKey {
    ts: Timestamp,
    rank: u64, // in-order pages sort before out-of-order on timestamp ties
    stream: usize,
    idx: usize,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ts, self.rank, self.idx).cmp(&(other.ts, other.rank, other.idx))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn rank_of(stream: &PageStream) -> u64 {
    ((stream.is_ooo as u64) << 32) | stream.seq as u64
}

/// Merge the decoded pages of one series into a timestamp-sorted,
/// duplicate-resolved stream restricted to `[start, end]` (inclusive).
/// Duplicate timestamps collapse to the last value in pop order, i.e. the
/// latest writer: in-order first, then out-of-order pages by placement.
pub fn merge_page_streams(
    streams: &[PageStream],
    start: Timestamp,
    end: Timestamp,
    out: &mut Vec<DataPoint>,
) {
    let mut heap: MinMaxHeap<HeapKey> = MinMaxHeap::with_capacity(streams.len());

    for (i, stream) in streams.iter().enumerate() {
        if !stream.dps.is_empty() {
            heap.push(HeapKey {
                ts: stream.dps[0].timestamp,
                rank: rank_of(stream),
                stream: i,
                idx: 0,
            });
        }
    }

    let merged_start = out.len();
    while let Some(key) = heap.pop_min() {
        let stream = &streams[key.stream];
        let dp = stream.dps[key.idx];

        if dp.timestamp >= start && dp.timestamp <= end {
            let has_merged = out.len() > merged_start;
            match out.last_mut() {
                Some(last) if has_merged && last.timestamp == dp.timestamp => {
                    // same timestamp: the later pop wins
                    last.value = dp.value;
                }
                _ => out.push(dp),
            }
        }

        let next = key.idx + 1;
        if next < stream.dps.len() {
            heap.push(HeapKey {
                ts: stream.dps[next].timestamp,
                rank: key.rank,
                stream: key.stream,
                idx: next,
            });
        }
    }
}
