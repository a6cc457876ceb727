use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The engine binary could not be launched at all.
#[derive(Debug, Error)]
#[error("failed to spawn {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Why a single tier did not produce an acceptable candidate.
///
/// Every variant is local to the tier that raised it: the pipeline logs it,
/// records it in telemetry and moves on to the next tier.
#[derive(Debug, Error)]
pub enum TierFailure {
    #[error("{tool} is not available on this host")]
    Unavailable { tool: String },

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("{engine} exceeded its {timeout:?} budget")]
    Timeout { engine: String, timeout: Duration },

    #[error("{engine} exited with status {code:?}: {stderr}")]
    NonZeroExit {
        engine: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{engine} produced an unusable file: {}", path.display())]
    InvalidOutput { engine: String, path: PathBuf },

    #[error("{engine} output of {output_bytes} bytes is not below {limit_bytes} bytes")]
    RegressionRejected {
        engine: String,
        output_bytes: u64,
        limit_bytes: u64,
    },

    #[error("chunk {chunk_index} (pages {start_page}-{end_page}) failed: {reason}")]
    ChunkFailed {
        chunk_index: u32,
        start_page: u32,
        end_page: u32,
        reason: String,
    },

    #[error("{engine} does not support {operation}")]
    Unsupported {
        engine: String,
        operation: &'static str,
    },

    #[error("tier skipped: {0}")]
    Skipped(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TierFailure {
    /// Short machine-readable tag used in telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            TierFailure::Unavailable { .. } => "unavailable",
            TierFailure::Spawn(_) => "spawn_error",
            TierFailure::Timeout { .. } => "timeout",
            TierFailure::NonZeroExit { .. } => "non_zero_exit",
            TierFailure::InvalidOutput { .. } => "invalid_output",
            TierFailure::RegressionRejected { .. } => "regression_rejected",
            TierFailure::ChunkFailed { .. } => "chunk_failed",
            TierFailure::Unsupported { .. } => "unsupported",
            TierFailure::Skipped(_) => "skipped",
            TierFailure::Io(_) => "io_error",
        }
    }
}

/// Contract violations surfaced to the caller before (or instead of) any tier.
#[derive(Debug, Error)]
pub enum FatalJobError {
    #[error("job {0} has no input files")]
    NoInputs(String),

    #[error("quality {0} is outside 0..=100")]
    QualityOutOfRange(u8),

    #[error("input does not exist: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("input exceeds max_input_file_bytes ({bytes} > {limit}): {}", path.display())]
    InputTooLarge { path: PathBuf, bytes: u64, limit: u64 },

    #[error("cannot prepare output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("original fallback failed for {}: {source}", path.display())]
    FallbackFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
