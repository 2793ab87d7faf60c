use crate::common::types::{DataPoint, SeriesId, TimeRange, Timestamp};
use crate::config::Resolution;
use crate::error::{TsdbError, TsdbResult};
use crate::storage::compress::{CompressOutcome, Compressor, CompressorPosition};
use std::cmp::Ordering;

/// Size of one header-file slot. One slot per page, fixed so a cold reader
/// can seek straight to page `i`.
pub const HEADER_RECORD_SIZE: usize = 32;

const FLAG_USED: u8 = 1 << 0;
const FLAG_OOO: u8 = 1 << 1;
const FLAG_FULL: u8 = 1 << 2;

/// The durable `compress_info_on_disk` record kept in `header.<N>`, one per
/// page of `data.<N>`. Carries everything needed to iterate the page without
/// other in-memory state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageOnDisk {
    pub series: SeriesId,
    pub start_ts: Timestamp,
    pub position: CompressorPosition,
    pub version: u8,
    pub is_ooo: bool,
    pub is_full: bool,
    pub dp_count: u32,
}

impl PageOnDisk {
    pub fn write(&self, slot: &mut [u8]) {
        debug_assert!(slot.len() >= HEADER_RECORD_SIZE);
        let mut flags = FLAG_USED;
        if self.is_ooo {
            flags |= FLAG_OOO;
        }
        if self.is_full {
            flags |= FLAG_FULL;
        }
        slot[..4].copy_from_slice(&self.series.to_le_bytes());
        slot[4..12].copy_from_slice(&self.start_ts.to_le_bytes());
        slot[12..16].copy_from_slice(&self.position.offset.to_le_bytes());
        slot[16] = self.position.start;
        slot[17] = self.version;
        slot[18] = flags;
        slot[19] = 0;
        slot[20..24].copy_from_slice(&self.dp_count.to_le_bytes());
        slot[24..HEADER_RECORD_SIZE].fill(0);
    }

    /// Returns `None` for a slot that was never flushed.
    pub fn parse(slot: &[u8]) -> Option<PageOnDisk> {
        debug_assert!(slot.len() >= HEADER_RECORD_SIZE);
        let flags = slot[18];
        if flags & FLAG_USED == 0 {
            return None;
        }
        Some(PageOnDisk {
            series: u32::from_le_bytes(slot[..4].try_into().unwrap()),
            start_ts: i64::from_le_bytes(slot[4..12].try_into().unwrap()),
            position: CompressorPosition {
                offset: u32::from_le_bytes(slot[12..16].try_into().unwrap()),
                start: slot[16],
            },
            version: slot[17],
            is_ooo: flags & FLAG_OOO != 0,
            is_full: flags & FLAG_FULL != 0,
            dp_count: u32::from_le_bytes(slot[20..24].try_into().unwrap()),
        })
    }
}

/// A live page: one compressor over one page-sized slot of a bucket's mmap.
/// Owned by exactly one series; all access is serialized by the series
/// mutex.
#[derive(Debug)]
pub struct Page {
    pub series: SeriesId,
    pub file_id: u32,
    pub page_index: u32,
    pub start_ts: Timestamp,
    pub is_ooo: bool,
    window: TimeRange,
    compressor: Compressor,
    /// Position up to which the page bytes have been made durable.
    checkpoint: CompressorPosition,
}

impl Page {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        series: SeriesId,
        file_id: u32,
        page_index: u32,
        start_ts: Timestamp,
        is_ooo: bool,
        window: TimeRange,
        version: u8,
        resolution: Resolution,
        base: *mut u8,
        page_size: usize,
    ) -> TsdbResult<Page> {
        // out-of-order pages always store raw pairs
        let version = if is_ooo { 0 } else { version };
        let mut compressor = Compressor::create(version, resolution)?;
        compressor.init(start_ts, base, page_size);
        Ok(Page {
            series,
            file_id,
            page_index,
            start_ts,
            is_ooo,
            window,
            compressor,
            checkpoint: CompressorPosition::default(),
        })
    }

    /// Re-open a page from its durable header, decoding its contents into
    /// `out` to verify the stream and prime the compressor for appends.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        file_id: u32,
        page_index: u32,
        header: &PageOnDisk,
        window: TimeRange,
        resolution: Resolution,
        base: *mut u8,
        page_size: usize,
        out: &mut Vec<DataPoint>,
    ) -> TsdbResult<Page> {
        let mut compressor = Compressor::create(header.version, resolution)?;
        compressor.init(header.start_ts, base, page_size);
        compressor.restore(out, header.position);
        if compressor.dp_count() != header.dp_count as usize {
            return Err(TsdbError::Fatal(format!(
                "page {}/{} decoded {} points, header says {}",
                file_id,
                page_index,
                compressor.dp_count(),
                header.dp_count
            )));
        }
        Ok(Page {
            series: header.series,
            file_id,
            page_index,
            start_ts: header.start_ts,
            is_ooo: header.is_ooo,
            window,
            compressor,
            checkpoint: header.position,
        })
    }

    /// Position of `ts` relative to the time window assigned to this page
    /// (the owning bucket's window).
    pub fn in_range(&self, ts: Timestamp) -> Ordering {
        self.window.position(ts)
    }

    pub fn append(&mut self, ts: Timestamp, value: f64) -> CompressOutcome {
        self.compressor.compress(ts, value)
    }

    pub fn last_tstamp(&self) -> Timestamp {
        self.compressor.last_tstamp()
    }

    pub fn is_empty(&self) -> bool {
        self.compressor.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.compressor.is_full()
    }

    pub fn dp_count(&self) -> usize {
        self.compressor.dp_count()
    }

    pub fn uncompress(&self, out: &mut Vec<DataPoint>) {
        self.compressor.uncompress(out);
    }

    pub fn rebase(&mut self, base: *mut u8) {
        self.compressor.rebase(base);
    }

    pub fn header(&self) -> PageOnDisk {
        let mut position = CompressorPosition::default();
        self.compressor.save(&mut position);
        PageOnDisk {
            series: self.series,
            start_ts: self.start_ts,
            position,
            version: self.compressor.version(),
            is_ooo: self.is_ooo,
            is_full: self.compressor.is_full(),
            dp_count: self.compressor.dp_count() as u32,
        }
    }

    /// Write the current compressor position into the page's header slot.
    /// Returns false when nothing changed since the last flush; the caller
    /// batches the msync.
    pub fn flush(&mut self, header_slot: &mut [u8]) -> bool {
        let header = {
            self.compressor.sync_to_page();
            self.header()
        };
        if header.position == self.checkpoint && !self.is_empty() {
            return false;
        }
        header.write(header_slot);
        self.checkpoint = header.position;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_record_roundtrip() {
        let header = PageOnDisk {
            series: 42,
            start_ts: 1_000_000,
            position: CompressorPosition {
                offset: 812,
                start: 5,
            },
            version: 2,
            is_ooo: false,
            is_full: true,
            dp_count: 117,
        };
        let mut slot = [0u8; HEADER_RECORD_SIZE];
        header.write(&mut slot);
        assert_eq!(PageOnDisk::parse(&slot), Some(header));
    }

    #[test]
    fn unused_slot_parses_to_none() {
        let slot = [0u8; HEADER_RECORD_SIZE];
        assert_eq!(PageOnDisk::parse(&slot), None);
    }

    #[test]
    fn page_flush_and_restore() {
        let mut buf = vec![0u8; 1024];
        let window = TimeRange::new(0, 10_000_000);
        let mut page = Page::new(
            7,
            0,
            3,
            1_000,
            false,
            window,
            2,
            Resolution::Ms,
            buf.as_mut_ptr(),
            buf.len(),
        )
        .unwrap();

        assert_eq!(page.append(1_000, 1.5), CompressOutcome::Appended);
        assert_eq!(page.append(2_000, 2.5), CompressOutcome::Appended);

        let mut slot = [0u8; HEADER_RECORD_SIZE];
        assert!(page.flush(&mut slot));
        assert!(!page.flush(&mut slot), "second flush has nothing new");

        let header = PageOnDisk::parse(&slot).unwrap();
        assert_eq!(header.series, 7);
        assert_eq!(header.dp_count, 2);

        let mut decoded = Vec::new();
        let restored = Page::restore(
            0,
            3,
            &header,
            window,
            Resolution::Ms,
            buf.as_mut_ptr(),
            buf.len(),
            &mut decoded,
        )
        .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1], DataPoint::new(2_000, 2.5));
        assert_eq!(restored.last_tstamp(), 2_000);
    }

    #[test]
    fn in_range_follows_bucket_window() {
        let mut buf = vec![0u8; 256];
        let page = Page::new(
            1,
            0,
            0,
            5_000,
            false,
            TimeRange::new(4_000, 8_000),
            0,
            Resolution::Sec,
            buf.as_mut_ptr(),
            buf.len(),
        )
        .unwrap();
        assert_eq!(page.in_range(3_999), Ordering::Less);
        assert_eq!(page.in_range(5_000), Ordering::Equal);
        assert_eq!(page.in_range(8_000), Ordering::Greater);
    }
}
