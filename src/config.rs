use crate::common::time::parse_duration;
use crate::error::{TsdbError, TsdbResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_PAGE_COUNT_PER_FILE: usize = 1024;
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_RECYCLE_POOL_CAP: usize = 8192;

const MIN_PAGE_SIZE: usize = 128;
const MAX_PAGE_SIZE: usize = 1 << 20;

/// Timestamp resolution of a data directory. Chosen at creation time and
/// fixed for the life of the directory.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Sec,
    #[default]
    Ms,
}

impl Resolution {
    pub fn is_millisecond(&self) -> bool {
        matches!(self, Resolution::Ms)
    }

    /// Ticks per second at this resolution.
    pub fn ticks_per_sec(&self) -> i64 {
        match self {
            Resolution::Sec => 1,
            Resolution::Ms => 1000,
        }
    }

    pub fn duration_to_ticks(&self, d: Duration) -> i64 {
        match self {
            Resolution::Sec => d.as_secs() as i64,
            Resolution::Ms => d.as_millis() as i64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Resolution::Sec => "sec",
            Resolution::Ms => "ms",
        }
    }
}

impl TryFrom<&str> for Resolution {
    type Error = TsdbError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            s if s.eq_ignore_ascii_case("sec") => Ok(Resolution::Sec),
            s if s.eq_ignore_ascii_case("ms") => Ok(Resolution::Ms),
            _ => Err(TsdbError::InvalidConfiguration(format!(
                "timestamp_resolution must be `sec` or `ms`, got `{s}`"
            ))),
        }
    }
}

/// Engine configuration. Values are read once at startup into immutable
/// fields and threaded through explicitly; nothing here changes at runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Size in bytes of one storage page. Power of two.
    pub page_size: usize,

    /// Number of pages held by each `data.<N>` file.
    pub page_count_per_file: usize,

    /// Width of one time bucket. A power-of-two number of hours.
    pub bucket_duration: Duration,

    /// Timestamp resolution, `sec` or `ms`.
    pub resolution: Resolution,

    /// On-disk codec for in-order pages: 0 (raw), 1 (byte XOR) or 2 (Gorilla).
    pub compressor_version: u8,

    /// Idle time after which an active bucket stops accepting writes.
    pub read_only_threshold: Duration,

    /// Idle time after which a read-only bucket drops its mappings.
    pub archive_threshold: Duration,

    /// Per-query time budget. Queries over budget return partial results.
    pub query_deadline: Duration,

    /// Size of the query worker pool.
    pub worker_threads: usize,

    /// Cadence of the lifecycle scheduler tick.
    pub gc_interval: Duration,

    /// Soft cap on entries per recycle pool.
    pub recycle_pool_cap: usize,

    /// Default wrap point for `rate` with counter semantics.
    pub counter_max: u64,

    /// Default reset threshold for `rate`; computed rates above it emit 0.
    pub reset_value: u64,

    /// Whether a write landing in a compacted bucket may re-open it.
    pub allow_late_writes: bool,

    /// Hour of day (local) at which archived buckets may be compacted, and
    /// the hour the window closes. Equal hours disable the window check.
    pub compact_window_start_hour: u8,
    pub compact_window_end_hour: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_count_per_file: DEFAULT_PAGE_COUNT_PER_FILE,
            bucket_duration: Duration::from_secs(2 * 3600),
            resolution: Resolution::Ms,
            compressor_version: 2,
            read_only_threshold: Duration::from_secs(2 * 3600),
            archive_threshold: Duration::from_secs(4 * 3600),
            query_deadline: Duration::from_secs(30),
            worker_threads: DEFAULT_WORKER_THREADS,
            gc_interval: Duration::from_secs(60),
            recycle_pool_cap: DEFAULT_RECYCLE_POOL_CAP,
            counter_max: u64::MAX,
            reset_value: 0,
            allow_late_writes: false,
            compact_window_start_hour: 0,
            compact_window_end_hour: 0,
        }
    }
}

impl Settings {
    /// Build settings from string key/value options, e.g. a parsed config
    /// file. Unknown keys are rejected so typos do not silently fall back to
    /// defaults.
    pub fn from_options(options: &HashMap<String, String>) -> TsdbResult<Self> {
        let mut settings = Settings::default();

        for (key, value) in options {
            match key.as_str() {
                "page_size" => settings.page_size = parse_usize(key, value)?,
                "page_count_per_file" => settings.page_count_per_file = parse_usize(key, value)?,
                "bucket_duration" => settings.bucket_duration = parse_duration(value)?,
                "timestamp_resolution" => settings.resolution = value.as_str().try_into()?,
                "compressor_version" => settings.compressor_version = parse_usize(key, value)? as u8,
                "read_only_threshold" => settings.read_only_threshold = parse_duration(value)?,
                "archive_threshold" => settings.archive_threshold = parse_duration(value)?,
                "query_deadline_ms" => {
                    settings.query_deadline = Duration::from_millis(parse_usize(key, value)? as u64)
                }
                "worker_threads" => settings.worker_threads = parse_usize(key, value)?,
                "gc_interval" => settings.gc_interval = parse_duration(value)?,
                "recycle_pool_cap" => settings.recycle_pool_cap = parse_usize(key, value)?,
                "counter_max" => settings.counter_max = parse_usize(key, value)? as u64,
                "reset_value" => settings.reset_value = parse_usize(key, value)? as u64,
                "allow_late_writes" => {
                    settings.allow_late_writes = value.parse::<bool>().map_err(|_| {
                        TsdbError::InvalidConfiguration(format!("{key}: expected bool, got `{value}`"))
                    })?
                }
                "compact_window_start_hour" => {
                    settings.compact_window_start_hour = parse_usize(key, value)? as u8
                }
                "compact_window_end_hour" => {
                    settings.compact_window_end_hour = parse_usize(key, value)? as u8
                }
                _ => {
                    return Err(TsdbError::InvalidConfiguration(format!(
                        "unknown option `{key}`"
                    )))
                }
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> TsdbResult<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(TsdbError::InvalidConfiguration(format!(
                "page_size must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}], got {}",
                self.page_size
            )));
        }
        if self.page_count_per_file == 0 {
            return Err(TsdbError::InvalidConfiguration(
                "page_count_per_file must be positive".into(),
            ));
        }
        let hours = self.bucket_duration.as_secs() / 3600;
        if hours == 0 || !hours.is_power_of_two() || self.bucket_duration.as_secs() % 3600 != 0 {
            return Err(TsdbError::InvalidConfiguration(format!(
                "bucket_duration must be a power-of-two number of hours, got {:?}",
                self.bucket_duration
            )));
        }
        if self.compressor_version > 2 {
            return Err(TsdbError::InvalidConfiguration(format!(
                "compressor_version must be 0, 1 or 2, got {}",
                self.compressor_version
            )));
        }
        if self.worker_threads == 0 {
            return Err(TsdbError::InvalidConfiguration(
                "worker_threads must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Bucket width in timestamp ticks at the configured resolution.
    pub fn bucket_duration_ticks(&self) -> i64 {
        self.resolution.duration_to_ticks(self.bucket_duration)
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start_for(&self, ts: i64) -> i64 {
        let width = self.bucket_duration_ticks();
        ts.div_euclid(width) * width
    }
}

fn parse_usize(key: &str, value: &str) -> TsdbResult<usize> {
    value.parse::<usize>().map_err(|_| {
        TsdbError::InvalidConfiguration(format!("{key}: expected integer, got `{value}`"))
    })
}
