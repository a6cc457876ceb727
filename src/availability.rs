//! Which external tools exist on this host, cached with a short TTL.
//!
//! The cache is the only state shared between concurrent jobs. Records are
//! immutable once built; an expired record is replaced wholesale, so readers
//! never see a half-updated entry.

use crate::config::Config;
use crate::supervisor::ProcessSupervisor;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner()) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub available: bool,
    pub version: Option<String>,
}

impl ToolStatus {
    pub fn present(version: &str) -> Self {
        Self {
            available: true,
            version: Some(version.to_string()),
        }
    }

    pub fn absent() -> Self {
        Self {
            available: false,
            version: None,
        }
    }
}

pub trait ToolProber: Send + Sync {
    fn probe(&self, tool: &str) -> ToolStatus;
}

impl<F> ToolProber for F
where
    F: Fn(&str) -> ToolStatus + Send + Sync,
{
    fn probe(&self, tool: &str) -> ToolStatus {
        self(tool)
    }
}

/// Probes a tool by running `<tool> --version`.
pub struct CommandProber {
    supervisor: ProcessSupervisor,
    timeout: Duration,
    version_re: Option<Regex>,
}

impl CommandProber {
    pub fn new(supervisor: ProcessSupervisor, timeout: Duration) -> Self {
        Self {
            supervisor,
            timeout,
            version_re: Regex::new(r"\d+(?:\.\d+)+").ok(),
        }
    }
}

impl ToolProber for CommandProber {
    fn probe(&self, tool: &str) -> ToolStatus {
        match self.supervisor.run(tool, &["--version"], None, self.timeout) {
            Ok(out) if out.exit_code == Some(0) => {
                let text = out.stdout_lossy();
                let version = self
                    .version_re
                    .as_ref()
                    .and_then(|re| re.find(&text))
                    .map(|m| m.as_str().to_string())
                    .or_else(|| text.lines().next().map(str::to_string));
                ToolStatus {
                    available: true,
                    version,
                }
            }
            Ok(out) => {
                debug!(
                    "{tool} --version failed (exit={:?} timed_out={})",
                    out.exit_code, out.timed_out
                );
                ToolStatus::absent()
            }
            Err(err) => {
                debug!("{tool} not runnable: {err}");
                ToolStatus::absent()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityRecord {
    pub tool: String,
    pub available: bool,
    pub version: Option<String>,
    #[serde(skip)]
    pub checked_at: Instant,
}

pub struct EngineAvailability {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    prober: Arc<dyn ToolProber>,
    records: RwLock<HashMap<String, Arc<AvailabilityRecord>>>,
}

impl EngineAvailability {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>, prober: Arc<dyn ToolProber>) -> Self {
        Self {
            ttl,
            clock,
            prober,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &Config, supervisor: ProcessSupervisor) -> Self {
        Self::new(
            Duration::from_secs(cfg.engines.availability_ttl_secs),
            Arc::new(SystemClock),
            Arc::new(CommandProber::new(supervisor, cfg.timeouts.version_probe())),
        )
    }

    fn is_fresh(&self, record: &AvailabilityRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.checked_at) < self.ttl
    }

    pub fn get(&self, tool: &str) -> Arc<AvailabilityRecord> {
        let now = self.clock.now();
        {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            if let Some(rec) = records.get(tool)
                && self.is_fresh(rec, now)
            {
                return Arc::clone(rec);
            }
        }

        // Probe outside the lock; a slow tool must not stall other readers.
        let status = self.prober.probe(tool);
        let fresh = Arc::new(AvailabilityRecord {
            tool: tool.to_string(),
            available: status.available,
            version: status.version,
            checked_at: self.clock.now(),
        });
        info!(
            "availability {tool}: available={} version={:?}",
            fresh.available, fresh.version
        );

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = records.get(tool)
            && existing.checked_at > fresh.checked_at
        {
            return Arc::clone(existing);
        }
        records.insert(tool.to_string(), Arc::clone(&fresh));
        fresh
    }

    pub fn is_available(&self, tool: &str) -> bool {
        self.get(tool).available
    }
}
