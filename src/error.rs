use thiserror::Error;

#[derive(Debug, Error)]
/// Enum for various errors in Tsdb.
pub enum TsdbError {
  #[error("Malformed input. {0}")]
  ProtocolError(String),

  #[error("Rejected: {0}")]
  Rejected(String),

  #[error("Bucket starting at {0} is read-only")]
  BucketReadOnly(i64),

  #[error("Bucket starting at {0} has been compacted")]
  BucketCompacted(i64),

  #[error("A single sample does not fit in an empty page of {0} bytes")]
  PageTooSmall(usize),

  #[error("Out of space in bit stream")]
  OutOfSpace,

  #[error("End of bit stream")]
  EndOfStream,

  #[error("Recycle pool exhausted")]
  OutOfMemory,

  #[error("Query deadline exceeded")]
  DeadlineExceeded,

  #[error("Invalid configuration. {0}")]
  InvalidConfiguration(String),

  #[error("Invalid timestamp. {0}")]
  InvalidTimestamp(String),

  #[error("Invalid duration. {0}")]
  InvalidDuration(String),

  #[error("Invalid number. {0}")]
  InvalidNumber(String),

  #[error("Invalid aggregator. {0}")]
  InvalidAggregator(String),

  #[error("Invalid tag filter. {0}")]
  InvalidTagFilter(String),

  #[error("Unrecoverable: {0}")]
  Fatal(String),

  #[error("I/O error. {0}")]
  Io(#[from] std::io::Error),

  #[error("{0}")]
  General(String),
}

pub type TsdbResult<T> = Result<T, TsdbError>;

impl TsdbError {
  /// Errors that poison only the bucket they occurred in. The bucket is
  /// flagged degraded and the rest of the engine keeps serving.
  pub fn is_bucket_local(&self) -> bool {
    matches!(self, TsdbError::Io(_))
  }

  /// Errors that must abort startup (meta log corruption, manifest mismatch).
  pub fn is_fatal(&self) -> bool {
    matches!(self, TsdbError::Fatal(_))
  }
}

impl PartialEq for TsdbError {
  fn eq(&self, other: &Self) -> bool {
    use TsdbError::*;
    match (self, other) {
      (ProtocolError(a), ProtocolError(b)) => a == b,
      (Rejected(a), Rejected(b)) => a == b,
      (BucketReadOnly(a), BucketReadOnly(b)) => a == b,
      (BucketCompacted(a), BucketCompacted(b)) => a == b,
      (PageTooSmall(a), PageTooSmall(b)) => a == b,
      (OutOfSpace, OutOfSpace) => true,
      (EndOfStream, EndOfStream) => true,
      (OutOfMemory, OutOfMemory) => true,
      (DeadlineExceeded, DeadlineExceeded) => true,
      (InvalidConfiguration(a), InvalidConfiguration(b)) => a == b,
      (InvalidTimestamp(a), InvalidTimestamp(b)) => a == b,
      (InvalidDuration(a), InvalidDuration(b)) => a == b,
      (InvalidNumber(a), InvalidNumber(b)) => a == b,
      (InvalidAggregator(a), InvalidAggregator(b)) => a == b,
      (InvalidTagFilter(a), InvalidTagFilter(b)) => a == b,
      (Fatal(a), Fatal(b)) => a == b,
      (Io(a), Io(b)) => a.kind() == b.kind(),
      (General(a), General(b)) => a == b,
      _ => false,
    }
  }
}
