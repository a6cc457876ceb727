use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub chunking: Chunking,
    #[serde(default)]
    pub concurrency: Concurrency,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub engines: Engines,
    #[serde(default)]
    pub supervisor: Supervisor,
    #[serde(default)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    pub out_dir: String,
    pub work_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            out_dir: "out".into(),
            work_dir: ".docshrink-work".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Candidates at or above `input_bytes * regression_ratio` are rejected.
    pub regression_ratio: f64,
    pub max_input_file_bytes: u64,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            regression_ratio: 1.05,
            max_input_file_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunking {
    pub enabled: bool,
    /// Inputs with more pages than this take the parallel tier.
    pub threshold_pages: u32,
    pub chunk_size_pages: u32,
}
impl Default for Chunking {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_pages: 5,
            chunk_size_pages: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concurrency {
    /// Input files of one job compressed at the same time.
    pub outer: usize,
    /// Page chunks of one file compressed at the same time.
    pub inner: usize,
    /// Hard ceiling on live engine processes across all jobs sharing a pipeline.
    pub max_engine_processes: usize,
}
impl Default for Concurrency {
    fn default() -> Self {
        Self {
            outer: 2,
            inner: 3,
            max_engine_processes: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub chunk_secs: u64,
    pub merge_secs: u64,
    pub primary_resize_secs: u64,
    pub primary_simple_secs: u64,
    pub secondary_secs: u64,
    pub validate_secs: u64,
    pub probe_secs: u64,
    pub version_probe_secs: u64,
}
impl Default for Timeouts {
    fn default() -> Self {
        Self {
            chunk_secs: 60,
            merge_secs: 120,
            primary_resize_secs: 120,
            primary_simple_secs: 30,
            secondary_secs: 20,
            validate_secs: 10,
            probe_secs: 10,
            version_probe_secs: 5,
        }
    }
}

impl Timeouts {
    pub fn chunk(&self) -> Duration {
        Duration::from_secs(self.chunk_secs)
    }

    pub fn merge(&self) -> Duration {
        Duration::from_secs(self.merge_secs)
    }

    pub fn secondary(&self) -> Duration {
        Duration::from_secs(self.secondary_secs)
    }

    pub fn validate(&self) -> Duration {
        Duration::from_secs(self.validate_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn version_probe(&self) -> Duration {
        Duration::from_secs(self.version_probe_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engines {
    pub ghostscript_exe: String,
    pub qpdf_exe: String,
    pub availability_ttl_secs: u64,
}
impl Default for Engines {
    fn default() -> Self {
        Self {
            ghostscript_exe: "gs".into(),
            qpdf_exe: "qpdf".into(),
            availability_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supervisor {
    pub output_cap_bytes: usize,
}
impl Default for Supervisor {
    fn default() -> Self {
        Self {
            output_cap_bytes: 50 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub enabled: bool,
    pub path: String,
}
impl Default for Telemetry {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "out/telemetry.jsonl".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
