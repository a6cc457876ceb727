use crate::policy::QualitySettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// Raster downsampling; slow, biggest wins on scanned documents.
    #[default]
    Resize,
    /// Structural rewrite without touching image resolution.
    Simple,
}

#[derive(Debug, Clone)]
pub struct CompressRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub settings: QualitySettings,
    pub mode: CompressionMode,
    /// 1-based inclusive `(first, last)` page restriction.
    pub page_range: Option<(u32, u32)>,
}

/// One engine invocation as the pipeline saw it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineAttempt {
    pub engine: String,
    pub tier: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_path: PathBuf,
    pub output_bytes: u64,
    pub valid: bool,
}
