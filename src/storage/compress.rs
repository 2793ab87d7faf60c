use crate::common::types::{DataPoint, Timestamp};
use crate::config::Resolution;
use crate::error::{TsdbError, TsdbResult};
use crate::storage::bitstream::{BitCursor, BitStream};
use tracing::debug;

/// Durable position of a compressor inside its page, persisted in the page
/// header. For the raw codec `offset` counts data points; for the others it
/// is a byte offset with `start` extra bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompressorPosition {
    pub offset: u32,
    pub start: u8,
}

/// Result of one append attempt. `Full` leaves the page byte-identical to
/// its state before the call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum CompressOutcome {
    Appended,
    Full,
}

impl CompressOutcome {
    pub fn is_full(&self) -> bool {
        matches!(self, CompressOutcome::Full)
    }
}

/// One page codec. v0 stores raw pairs and keeps them sorted, v1 is a
/// byte-granular XOR scheme, v2 is bit-level Gorilla.
#[derive(Debug)]
pub enum Compressor {
    V0(RawCompressor),
    V1(ByteXorCompressor),
    V2(GorillaCompressor),
}

impl Compressor {
    pub fn create(version: u8, resolution: Resolution) -> TsdbResult<Self> {
        match version {
            0 => Ok(Compressor::V0(RawCompressor::default())),
            1 => Ok(Compressor::V1(ByteXorCompressor::new(resolution))),
            2 => Ok(Compressor::V2(GorillaCompressor::default())),
            _ => Err(TsdbError::InvalidConfiguration(format!(
                "unknown compressor version {version}"
            ))),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Compressor::V0(_) => 0,
            Compressor::V1(_) => 1,
            Compressor::V2(_) => 2,
        }
    }

    pub fn init(&mut self, start_ts: Timestamp, base: *mut u8, size: usize) {
        match self {
            Compressor::V0(c) => c.init(start_ts, base, size),
            Compressor::V1(c) => c.init(start_ts, base, size),
            Compressor::V2(c) => c.init(start_ts, base, size),
        }
    }

    pub fn compress(&mut self, ts: Timestamp, value: f64) -> CompressOutcome {
        match self {
            Compressor::V0(c) => c.compress(ts, value),
            Compressor::V1(c) => c.compress(ts, value),
            Compressor::V2(c) => c.compress(ts, value),
        }
    }

    pub fn uncompress(&self, out: &mut Vec<DataPoint>) {
        match self {
            Compressor::V0(c) => c.uncompress(out),
            Compressor::V1(c) => c.uncompress(out),
            Compressor::V2(c) => c.uncompress(out),
        }
    }

    pub fn save(&self, position: &mut CompressorPosition) {
        match self {
            Compressor::V0(c) => c.save(position),
            Compressor::V1(c) => c.save(position),
            Compressor::V2(c) => c.save(position),
        }
    }

    /// Re-open from a saved position after `init` pointed the compressor at
    /// the page bytes. Decodes everything written so far into `out` and
    /// primes the internal state for further appends.
    pub fn restore(&mut self, out: &mut Vec<DataPoint>, position: CompressorPosition) {
        match self {
            Compressor::V0(c) => c.restore(out, position),
            Compressor::V1(c) => c.restore(out, position),
            Compressor::V2(c) => c.restore(out, position),
        }
    }

    /// Persist any in-memory state into the page bytes. Only the raw codec
    /// buffers data points outside the page region.
    pub fn sync_to_page(&mut self) {
        if let Compressor::V0(c) = self {
            c.sync_to_page();
        }
    }

    pub fn rebase(&mut self, base: *mut u8) {
        match self {
            Compressor::V0(c) => c.base = base,
            Compressor::V1(c) => c.base = base,
            Compressor::V2(c) => c.stream.rebase(base),
        }
    }

    pub fn recycle(&mut self) {
        match self {
            Compressor::V0(c) => c.recycle(),
            Compressor::V1(c) => c.recycle(),
            Compressor::V2(c) => c.recycle(),
        }
    }

    pub fn dp_count(&self) -> usize {
        match self {
            Compressor::V0(c) => c.dps.len(),
            Compressor::V1(c) => c.dp_count,
            Compressor::V2(c) => c.dp_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dp_count() == 0
    }

    pub fn is_full(&self) -> bool {
        match self {
            Compressor::V0(c) => c.is_full,
            Compressor::V1(c) => c.is_full,
            Compressor::V2(c) => c.is_full,
        }
    }

    pub fn last_tstamp(&self) -> Timestamp {
        match self {
            Compressor::V0(c) => c.last_tstamp(),
            Compressor::V1(c) => c.prev_tstamp,
            Compressor::V2(c) => c.prev_tstamp,
        }
    }
}

const RAW_PAIR_SIZE: usize = 16;

/// v0: `(ts, value)` pairs at 16 bytes each, kept in timestamp order.
/// Out-of-order pages always use this codec; insertion keeps them sorted so
/// reads merge cheaply.
#[derive(Debug)]
pub struct RawCompressor {
    base: *mut u8,
    capacity: usize, // in pairs
    start_tstamp: Timestamp,
    dps: Vec<DataPoint>,
    is_full: bool,
}

unsafe impl Send for RawCompressor {}

impl Default for RawCompressor {
    fn default() -> Self {
        RawCompressor {
            base: std::ptr::null_mut(),
            capacity: 0,
            start_tstamp: 0,
            dps: Vec::new(),
            is_full: false,
        }
    }
}

impl RawCompressor {
    fn init(&mut self, start_ts: Timestamp, base: *mut u8, size: usize) {
        self.base = base;
        self.capacity = size / RAW_PAIR_SIZE;
        self.start_tstamp = start_ts;
        self.dps.clear();
        self.is_full = false;
    }

    fn compress(&mut self, ts: Timestamp, value: f64) -> CompressOutcome {
        if self.dps.len() >= self.capacity {
            self.is_full = true;
            return CompressOutcome::Full;
        }
        let dp = DataPoint::new(ts, value);
        if self.last_tstamp() <= ts || self.dps.is_empty() {
            self.dps.push(dp);
        } else {
            // keep sorted; equal timestamps insert after, so the later
            // writer decodes later
            let at = self.dps.partition_point(|p| p.timestamp <= ts);
            self.dps.insert(at, dp);
        }
        CompressOutcome::Appended
    }

    fn uncompress(&self, out: &mut Vec<DataPoint>) {
        out.extend_from_slice(&self.dps);
    }

    fn save(&self, position: &mut CompressorPosition) {
        position.offset = self.dps.len() as u32;
        position.start = 0;
    }

    /// Copy the buffered pairs into the page region.
    fn sync_to_page(&mut self) {
        let mut offset = 0usize;
        for dp in &self.dps {
            unsafe {
                let dst = self.base.add(offset);
                std::ptr::copy_nonoverlapping(dp.timestamp.to_le_bytes().as_ptr(), dst, 8);
                std::ptr::copy_nonoverlapping(dp.value.to_le_bytes().as_ptr(), dst.add(8), 8);
            }
            offset += RAW_PAIR_SIZE;
        }
    }

    fn restore(&mut self, out: &mut Vec<DataPoint>, position: CompressorPosition) {
        debug_assert_eq!(position.start, 0);
        self.dps.clear();
        for i in 0..position.offset as usize {
            let mut ts_bytes = [0u8; 8];
            let mut value_bytes = [0u8; 8];
            unsafe {
                let src = self.base.add(i * RAW_PAIR_SIZE);
                std::ptr::copy_nonoverlapping(src, ts_bytes.as_mut_ptr(), 8);
                std::ptr::copy_nonoverlapping(src.add(8), value_bytes.as_mut_ptr(), 8);
            }
            let dp = DataPoint::new(
                i64::from_le_bytes(ts_bytes),
                f64::from_le_bytes(value_bytes),
            );
            self.dps.push(dp);
            out.push(dp);
        }
    }

    fn recycle(&mut self) {
        self.dps.clear();
        self.is_full = false;
    }

    fn last_tstamp(&self) -> Timestamp {
        self.dps.last().map_or(self.start_tstamp, |dp| dp.timestamp)
    }
}

/// v1: byte-granular delta-of-delta timestamps with an escape sentinel, and
/// XOR values led by a control byte flagging which of the 8 bytes are
/// non-zero. Roughly 2:1 on typical metrics, far cheaper to decode than v2.
#[derive(Debug)]
pub struct ByteXorCompressor {
    base: *mut u8,
    size: usize,
    cursor: usize,
    start_tstamp: Timestamp,
    resolution: Resolution,
    dp_count: usize,
    prev_delta: i64,
    prev_tstamp: Timestamp,
    prev_value_bits: u64,
    is_full: bool,
}

unsafe impl Send for ByteXorCompressor {}

impl ByteXorCompressor {
    fn new(resolution: Resolution) -> Self {
        ByteXorCompressor {
            base: std::ptr::null_mut(),
            size: 0,
            cursor: 0,
            start_tstamp: 0,
            resolution,
            dp_count: 0,
            prev_delta: 0,
            prev_tstamp: 0,
            prev_value_bits: 0,
            is_full: false,
        }
    }

    fn init(&mut self, start_ts: Timestamp, base: *mut u8, size: usize) {
        self.base = base;
        self.size = size;
        self.cursor = 0;
        self.start_tstamp = start_ts;
        self.dp_count = 0;
        self.prev_delta = 0;
        self.prev_tstamp = start_ts;
        self.prev_value_bits = 0;
        self.is_full = false;
    }

    fn write(&mut self, bytes: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.cursor), bytes.len());
        }
        self.cursor += bytes.len();
    }

    fn first_sample_size(&self) -> usize {
        if self.resolution.is_millisecond() {
            16
        } else {
            12
        }
    }

    fn compress(&mut self, ts: Timestamp, value: f64) -> CompressOutcome {
        if self.cursor == 0 {
            if self.size < self.first_sample_size() {
                self.is_full = true;
                return CompressOutcome::Full;
            }
            let delta = ts - self.start_tstamp;
            if self.resolution.is_millisecond() {
                self.write(&(delta as u64).to_le_bytes());
            } else {
                self.write(&(delta as u32).to_le_bytes());
            }
            self.write(&value.to_le_bytes());
            self.prev_delta = delta;
            self.prev_tstamp = ts;
            self.prev_value_bits = value.to_bits();
            self.dp_count += 1;
            return CompressOutcome::Appended;
        }

        if self.prev_tstamp > ts {
            // safety net only; the series layer diverts these to the
            // out-of-order page
            debug!(timestamp = ts, "out-of-order sample dropped");
            return CompressOutcome::Appended;
        }

        let mut scratch = [0u8; 16];
        let delta = ts - self.prev_tstamp;
        let dod = delta - self.prev_delta;

        let mut len;
        if self.resolution.is_millisecond() {
            if dod.unsigned_abs() > i16::MAX as u64 {
                scratch[..2].copy_from_slice(&i16::MIN.to_le_bytes());
                scratch[2..6].copy_from_slice(&(dod as i32).to_le_bytes());
                len = 6;
            } else {
                scratch[..2].copy_from_slice(&(dod as i16).to_le_bytes());
                len = 2;
            }
        } else if dod.unsigned_abs() > i8::MAX as u64 {
            scratch[0] = i8::MIN as u8;
            scratch[1..5].copy_from_slice(&(dod as i32).to_le_bytes());
            len = 5;
        } else {
            scratch[0] = (dod as i8) as u8;
            len = 1;
        }

        let x = value.to_bits() ^ self.prev_value_bits;
        let control_at = len;
        len += 1;
        let mut control = 0u8;
        for (i, byte) in x.to_le_bytes().iter().enumerate() {
            if *byte != 0 {
                control |= 1 << (7 - i);
                scratch[len] = *byte;
                len += 1;
            }
        }
        scratch[control_at] = control;

        if len > self.size - self.cursor {
            self.is_full = true;
            return CompressOutcome::Full;
        }

        self.write(&scratch[..len]);
        self.dp_count += 1;
        self.prev_tstamp = ts;
        self.prev_value_bits = value.to_bits();
        self.prev_delta = delta;
        CompressOutcome::Appended
    }

    fn read(&self, at: usize, out: &mut [u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(at), out.as_mut_ptr(), out.len());
        }
    }

    fn decode(&self, end: usize, out: &mut Vec<DataPoint>) -> (usize, i64, Timestamp, u64) {
        if end == 0 {
            return (0, 0, self.start_tstamp, 0);
        }

        let mut at = 0usize;
        let mut count = 0usize;
        let mut tstamp = self.start_tstamp;

        let mut delta: i64;
        if self.resolution.is_millisecond() {
            let mut b = [0u8; 8];
            self.read(at, &mut b);
            delta = u64::from_le_bytes(b) as i64;
            at += 8;
        } else {
            let mut b = [0u8; 4];
            self.read(at, &mut b);
            delta = u32::from_le_bytes(b) as i64;
            at += 4;
        }
        tstamp += delta;
        let mut b8 = [0u8; 8];
        self.read(at, &mut b8);
        let mut value_bits = f64::from_le_bytes(b8).to_bits();
        at += 8;
        out.push(DataPoint::new(tstamp, f64::from_bits(value_bits)));
        count += 1;

        while at < end {
            let dod: i64;
            if self.resolution.is_millisecond() {
                let mut b = [0u8; 2];
                self.read(at, &mut b);
                let x = i16::from_le_bytes(b);
                at += 2;
                if x == i16::MIN {
                    let mut b = [0u8; 4];
                    self.read(at, &mut b);
                    dod = i32::from_le_bytes(b) as i64;
                    at += 4;
                } else {
                    dod = x as i64;
                }
            } else {
                let mut b = [0u8; 1];
                self.read(at, &mut b);
                let x = b[0] as i8;
                at += 1;
                if x == i8::MIN {
                    let mut b = [0u8; 4];
                    self.read(at, &mut b);
                    dod = i32::from_le_bytes(b) as i64;
                    at += 4;
                } else {
                    dod = x as i64;
                }
            }

            delta += dod;
            tstamp += delta;

            let mut control = [0u8; 1];
            self.read(at, &mut control);
            at += 1;
            let mut xor_bytes = [0u8; 8];
            for (i, byte) in xor_bytes.iter_mut().enumerate() {
                if control[0] & (1 << (7 - i)) != 0 {
                    let mut b = [0u8; 1];
                    self.read(at, &mut b);
                    *byte = b[0];
                    at += 1;
                }
            }
            value_bits ^= u64::from_le_bytes(xor_bytes);
            out.push(DataPoint::new(tstamp, f64::from_bits(value_bits)));
            count += 1;
        }

        (count, delta, tstamp, value_bits)
    }

    fn uncompress(&self, out: &mut Vec<DataPoint>) {
        self.decode(self.cursor, out);
    }

    fn save(&self, position: &mut CompressorPosition) {
        position.offset = self.cursor as u32;
        position.start = 0;
    }

    fn restore(&mut self, out: &mut Vec<DataPoint>, position: CompressorPosition) {
        debug_assert_eq!(position.start, 0);
        self.cursor = position.offset as usize;
        let (count, delta, tstamp, value_bits) = self.decode(self.cursor, out);
        self.dp_count = count;
        self.prev_delta = delta;
        self.prev_tstamp = tstamp;
        self.prev_value_bits = value_bits;
        self.is_full = false;
    }

    fn recycle(&mut self) {
        self.cursor = 0;
        self.dp_count = 0;
        self.prev_delta = 0;
        self.prev_tstamp = self.start_tstamp;
        self.prev_value_bits = 0;
        self.is_full = false;
    }
}

/// Sentinel meaning "no value block written yet"; any real leading-zero
/// count is at most 31.
const NO_PREV_BLOCK: u8 = 65;

/// v2: Gorilla. Delta-of-delta timestamps in 1/16/20/36-bit forms and
/// XOR-compressed values reusing the previous (leading, meaningful) window
/// when it still covers the new XOR.
#[derive(Debug)]
pub struct GorillaCompressor {
    stream: BitStream,
    start_tstamp: Timestamp,
    dp_count: usize,
    prev_delta: i64,
    prev_tstamp: Timestamp,
    prev_value_bits: u64,
    prev_leading: u8,
    prev_trailing: u8,
    prev_meaningful: u8,
    is_full: bool,
}

impl Default for GorillaCompressor {
    fn default() -> Self {
        GorillaCompressor {
            stream: BitStream::new(std::ptr::null_mut(), 0),
            start_tstamp: 0,
            dp_count: 0,
            prev_delta: 0,
            prev_tstamp: 0,
            prev_value_bits: 0,
            prev_leading: NO_PREV_BLOCK,
            prev_trailing: NO_PREV_BLOCK,
            prev_meaningful: 64,
            is_full: false,
        }
    }
}

fn sign_extend(value: u64, bits: usize) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

impl GorillaCompressor {
    fn init(&mut self, start_ts: Timestamp, base: *mut u8, size: usize) {
        self.stream = BitStream::new(base, size);
        self.start_tstamp = start_ts;
        self.dp_count = 0;
        self.prev_delta = 0;
        self.prev_tstamp = start_ts;
        self.prev_value_bits = 0;
        self.prev_leading = NO_PREV_BLOCK;
        self.prev_trailing = NO_PREV_BLOCK;
        self.prev_meaningful = 64;
        self.is_full = false;
    }

    fn compress(&mut self, ts: Timestamp, value: f64) -> CompressOutcome {
        self.stream.save_checkpoint();
        match self.try_compress(ts, value) {
            Ok(()) => CompressOutcome::Appended,
            Err(_) => {
                self.stream.restore_checkpoint();
                self.is_full = true;
                CompressOutcome::Full
            }
        }
    }

    fn try_compress(&mut self, ts: Timestamp, value: f64) -> TsdbResult<()> {
        if self.dp_count == 0 {
            // a whole record is staged locally and appended in one call, so
            // a Full page is byte-identical to before the attempt
            let mut scratch = [0u8; 16];
            let mut record = BitStream::new(scratch.as_mut_ptr(), scratch.len());
            let delta = (ts - self.start_tstamp) as u32;
            record.append_bytes(&delta.to_le_bytes())?;
            record.append_bytes(&value.to_le_bytes())?;
            let bits = record.size_in_bits();
            self.stream.append(&scratch, bits, 0)?;

            self.prev_tstamp = ts;
            self.prev_value_bits = value.to_bits();
            self.prev_delta = delta as i64;
            self.dp_count += 1;
            return Ok(());
        }

        if self.prev_tstamp > ts {
            // safety net only; the series layer diverts these to the
            // out-of-order page
            debug!(timestamp = ts, "out-of-order sample dropped");
            return Ok(());
        }

        let mut scratch = [0u8; 16];
        let mut record = BitStream::new(scratch.as_mut_ptr(), scratch.len());

        // timestamp first
        let delta = ts - self.prev_tstamp;
        let dod = delta.wrapping_sub(self.prev_delta);

        if dod == 0 {
            record.write_bits(0, 1)?;
        } else if (-8192..=8191).contains(&dod) {
            record.write_bits(0b10, 2)?;
            record.write_bits(dod as u64, 14)?;
        } else if (-65536..=65535).contains(&dod) {
            record.write_bits(0b110, 3)?;
            record.write_bits(dod as u64, 17)?;
        } else {
            record.write_bits(0b111, 3)?;
            record.write_bits(dod as u64, 33)?;
        }

        // value next
        let value_bits = value.to_bits();
        let x = value_bits ^ self.prev_value_bits;

        let mut block = None;
        if x == 0 {
            record.write_bits(0, 1)?;
        } else {
            let leading = (x.leading_zeros().min(31)) as u8;
            let trailing = (x.trailing_zeros().min(32)) as u8;

            if self.prev_leading > 0
                && self.prev_leading <= leading
                && self.prev_trailing <= trailing
            {
                // previous window still covers the meaningful bits
                record.write_bits(0b10, 2)?;
                record.write_bits(x >> self.prev_trailing, self.prev_meaningful as usize)?;
            } else {
                let meaningful = 64 - leading - trailing;
                record.write_bits(0b11, 2)?;
                record.write_bits(leading as u64, 5)?;
                // 6-bit field, 64 encodes as 0
                record.write_bits(meaningful as u64, 6)?;
                record.write_bits(x >> trailing, meaningful as usize)?;
                block = Some((leading, trailing, meaningful));
            }
        }

        let bits = record.size_in_bits();
        self.stream.append(&scratch, bits, 0)?;

        if let Some((leading, trailing, meaningful)) = block {
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            self.prev_meaningful = meaningful;
        }
        self.prev_tstamp = ts;
        self.prev_delta = delta;
        self.prev_value_bits = value_bits;
        self.dp_count += 1;
        Ok(())
    }

    /// Decode everything written so far. Returns the decoder state needed by
    /// `restore` to resume appending.
    fn decode(&self, out: &mut Vec<DataPoint>) -> (usize, i64, Timestamp, u64, u8, u8, u8) {
        let mut cursor = BitCursor::default();
        let mut count = 0usize;
        let mut leading: u8 = 0;
        let mut trailing: u8 = 0;
        let mut meaningful: u8 = 0;

        if self.stream.is_empty() {
            return (0, 0, self.start_tstamp, 0, leading, trailing, meaningful);
        }

        let mut delta_bytes = [0u8; 4];
        if self.stream.read_bytes(&mut cursor, &mut delta_bytes).is_err() {
            return (0, 0, self.start_tstamp, 0, leading, trailing, meaningful);
        }
        let mut delta = u32::from_le_bytes(delta_bytes) as i64;
        let mut tstamp = self.start_tstamp + delta;
        let mut value_bytes = [0u8; 8];
        if self.stream.read_bytes(&mut cursor, &mut value_bytes).is_err() {
            return (0, 0, self.start_tstamp, 0, leading, trailing, meaningful);
        }
        let mut value_bits = f64::from_le_bytes(value_bytes).to_bits();
        out.push(DataPoint::new(tstamp, f64::from_bits(value_bits)));
        count += 1;

        loop {
            let bit = match self.stream.read_bits(&mut cursor, 1) {
                Ok(b) => b,
                Err(_) => break, // end of the bit stream
            };

            if bit == 0 {
                tstamp += delta;
            } else {
                let dod = if self.stream.read_bits(&mut cursor, 1).unwrap_or(0) == 0 {
                    sign_extend(self.stream.read_bits(&mut cursor, 14).unwrap_or(0), 14)
                } else if self.stream.read_bits(&mut cursor, 1).unwrap_or(0) == 0 {
                    sign_extend(self.stream.read_bits(&mut cursor, 17).unwrap_or(0), 17)
                } else {
                    sign_extend(self.stream.read_bits(&mut cursor, 33).unwrap_or(0), 33)
                };
                delta += dod;
                tstamp += delta;
            }

            match self.stream.read_bits(&mut cursor, 1) {
                Ok(1) => {
                    if self.stream.read_bits(&mut cursor, 1).unwrap_or(0) == 1 {
                        leading = self.stream.read_bits(&mut cursor, 5).unwrap_or(0) as u8;
                        meaningful = self.stream.read_bits(&mut cursor, 6).unwrap_or(0) as u8;
                        if meaningful == 0 {
                            meaningful = 64;
                        }
                        trailing = 64u8.saturating_sub(meaningful).saturating_sub(leading);
                    }
                    let bits = self
                        .stream
                        .read_bits(&mut cursor, meaningful as usize)
                        .unwrap_or(0);
                    value_bits ^= bits << trailing;
                }
                Ok(_) => {} // value repeats
                Err(_) => break,
            }

            out.push(DataPoint::new(tstamp, f64::from_bits(value_bits)));
            count += 1;
        }

        (count, delta, tstamp, value_bits, leading, trailing, meaningful)
    }

    fn uncompress(&self, out: &mut Vec<DataPoint>) {
        self.decode(out);
    }

    fn save(&self, position: &mut CompressorPosition) {
        let bits = self.stream.size_in_bits();
        position.offset = (bits / 8) as u32;
        position.start = (bits % 8) as u8;
    }

    fn restore(&mut self, out: &mut Vec<DataPoint>, position: CompressorPosition) {
        // the page bytes are already in place; reopen the stream at the
        // saved length
        self.stream
            .set_position(position.offset as usize, position.start);
        let (count, delta, tstamp, value_bits, leading, trailing, meaningful) = self.decode(out);
        self.dp_count = count;
        self.prev_delta = delta;
        self.prev_tstamp = tstamp;
        self.prev_value_bits = value_bits;
        self.prev_leading = leading;
        self.prev_trailing = trailing;
        self.prev_meaningful = meaningful;
        self.is_full = false;
    }

    fn recycle(&mut self) {
        self.stream.reset();
        self.dp_count = 0;
        self.prev_delta = 0;
        self.prev_tstamp = self.start_tstamp;
        self.prev_value_bits = 0;
        self.prev_leading = NO_PREV_BLOCK;
        self.prev_trailing = NO_PREV_BLOCK;
        self.prev_meaningful = 64;
        self.is_full = false;
    }
}
