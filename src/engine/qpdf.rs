use super::{CompressRequest, Engine};
use crate::error::TierFailure;
use crate::supervisor::{ProcessOutput, ProcessSupervisor};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// qpdf structural rewrite: object streams plus flate recompression.
/// Leaves images untouched, so it is fast and never loses fidelity.
pub struct QpdfEngine {
    exe: String,
}

impl QpdfEngine {
    pub fn new(exe: &str) -> Self {
        Self {
            exe: exe.to_string(),
        }
    }

    pub fn compress_args(&self, req: &CompressRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--object-streams=generate",
            "--compress-streams=y",
            "--recompress-flate",
            "--compression-level=9",
            "--decode-level=generalized",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(req.input.display().to_string());
        args.push(req.output.display().to_string());
        args
    }
}

impl Engine for QpdfEngine {
    fn name(&self) -> &str {
        "qpdf"
    }

    fn tool(&self) -> &str {
        &self.exe
    }

    fn supports_merge(&self) -> bool {
        true
    }

    /// Exit status 3 means "succeeded with warnings".
    fn is_success(&self, exit_code: i32) -> bool {
        exit_code == 0 || exit_code == 3
    }

    fn compress(
        &self,
        req: &CompressRequest,
        supervisor: &ProcessSupervisor,
        timeout: Duration,
    ) -> Result<ProcessOutput, TierFailure> {
        let args = self.compress_args(req);
        debug!("qpdf {}", args.join(" "));
        Ok(supervisor.run(&self.exe, args.as_slice(), None, timeout)?)
    }

    fn merge(
        &self,
        parts: &[PathBuf],
        output: &Path,
        supervisor: &ProcessSupervisor,
        timeout: Duration,
    ) -> Result<ProcessOutput, TierFailure> {
        let mut args = vec!["--empty".to_string(), "--pages".to_string()];
        args.extend(parts.iter().map(|p| p.display().to_string()));
        args.push("--".into());
        args.push(output.display().to_string());
        Ok(supervisor.run(&self.exe, args.as_slice(), None, timeout)?)
    }
}
