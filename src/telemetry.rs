//! Append-only compression telemetry.
//!
//! Sinks must never block or fail the compression path: a write that cannot
//! be completed is logged locally and dropped.

use crate::config::Config;
use crate::util::{ensure_dir, now_rfc3339};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: String,
    pub job_id: String,
    pub input: String,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Attempt {
        engine: String,
        tier: String,
        /// "accepted" or a `TierFailure::kind` tag.
        outcome: String,
        duration_ms: u64,
        exit_code: Option<i32>,
        timed_out: bool,
        output_bytes: u64,
        valid: bool,
    },
    Result {
        engine_used: String,
        input_bytes: u64,
        output_bytes: u64,
        duration_ms: u64,
        output_path: String,
        warning: Option<String>,
    },
}

impl TelemetryRecord {
    pub fn now(job_id: &str, input: &Path, event: TelemetryEvent) -> Self {
        Self {
            timestamp: now_rfc3339(),
            job_id: job_id.to_string(),
            input: input.display().to_string(),
            event,
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: TelemetryRecord);
}

#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _record: TelemetryRecord) {}
}

/// Keeps records in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, record: TelemetryRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

/// Appends one JSON object per line from a background writer thread.
pub struct JsonlSink {
    tx: Mutex<Option<Sender<TelemetryRecord>>>,
    writer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        let (tx, rx) = mpsc::channel::<TelemetryRecord>();
        let path: PathBuf = path.to_path_buf();
        let writer = std::thread::spawn(move || {
            let mut file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(f) => Some(f),
                Err(err) => {
                    warn!("telemetry sink {} unavailable: {err}", path.display());
                    None
                }
            };
            for record in rx {
                let Some(f) = file.as_mut() else {
                    continue;
                };
                let line = match serde_json::to_string(&record) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("dropping unserializable telemetry record: {err}");
                        continue;
                    }
                };
                if let Err(err) = writeln!(f, "{line}") {
                    warn!("dropping telemetry record for job {}: {err}", record.job_id);
                }
            }
            if let Some(f) = file.as_mut() {
                let _ = f.flush();
            }
        });
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Stops accepting records and waits for queued ones to be written.
    pub fn flush_and_close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

impl TelemetrySink for JsonlSink {
    fn record(&self, record: TelemetryRecord) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(record).is_err() {
                    warn!("telemetry writer has stopped; record dropped");
                }
            }
            None => warn!("telemetry sink closed; record dropped"),
        }
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        self.flush_and_close();
    }
}

pub fn sink_from_config(cfg: &Config) -> Arc<dyn TelemetrySink> {
    if !cfg.telemetry.enabled || cfg.telemetry.path.is_empty() {
        return Arc::new(NullSink);
    }
    match JsonlSink::open(Path::new(&cfg.telemetry.path)) {
        Ok(sink) => Arc::new(sink),
        Err(err) => {
            warn!("telemetry disabled: {err:#}");
            Arc::new(NullSink)
        }
    }
}
