pub mod ghostscript;
pub mod qpdf;
pub mod types;

use crate::error::TierFailure;
use crate::supervisor::{ProcessOutput, ProcessSupervisor};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use ghostscript::GhostscriptEngine;
pub use qpdf::QpdfEngine;
pub use types::{CompressRequest, CompressionMode, EngineAttempt};

/// An external compression engine, treated as a black box.
///
/// Implementations build a command line and hand it to the supervisor; they
/// never interpret the output file themselves.
pub trait Engine: Send + Sync {
    /// Name reported in results and telemetry.
    fn name(&self) -> &str;

    /// Binary looked up in the availability cache.
    fn tool(&self) -> &str;

    fn supports_page_range(&self) -> bool {
        false
    }

    fn supports_merge(&self) -> bool {
        false
    }

    fn is_success(&self, exit_code: i32) -> bool {
        exit_code == 0
    }

    fn compress(
        &self,
        req: &CompressRequest,
        supervisor: &ProcessSupervisor,
        timeout: Duration,
    ) -> Result<ProcessOutput, TierFailure>;

    /// Concatenate `parts` in the given order into `output`.
    fn merge(
        &self,
        _parts: &[PathBuf],
        _output: &Path,
        _supervisor: &ProcessSupervisor,
        _timeout: Duration,
    ) -> Result<ProcessOutput, TierFailure> {
        Err(TierFailure::Unsupported {
            engine: self.name().to_string(),
            operation: "merge",
        })
    }
}
