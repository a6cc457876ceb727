use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Detached `lopdf` parses allowed to run at once across the process.
pub const MAX_DETACHED_SCANS: usize = 4;

static SCAN_SLOTS: ScanSlots = ScanSlots::new(MAX_DETACHED_SCANS);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub path: String,
    pub file_bytes: u64,
    /// 0 when the page tree could not be read in time.
    pub page_count: u32,
}

pub fn probe_input(input: &Path, timeout: Duration) -> std::io::Result<ProbeResult> {
    let meta = std::fs::metadata(input)?;
    Ok(ProbeResult {
        path: input.display().to_string(),
        file_bytes: meta.len(),
        page_count: count_pages(input, timeout).unwrap_or(0),
    })
}

/// Page count via `lopdf`, or `None` when the document does not parse within `timeout`.
pub fn count_pages(path: &Path, timeout: Duration) -> Option<u32> {
    match scan_pages(path, timeout) {
        PageScan::Pages(n) => Some(n),
        other => {
            debug!("page count unavailable for {}: {other:?}", path.display());
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageScan {
    Pages(u32),
    Unreadable(String),
    TimedOut,
    /// Every scan slot is held by a parse that has not finished yet.
    Busy,
}

/// Loads `path` with `lopdf` on a detached thread and waits at most `timeout`.
///
/// A parser stuck on a hostile file is abandoned rather than awaited; it keeps
/// its slot until it finishes, so at most `MAX_DETACHED_SCANS` such parses
/// (and the files they hold in memory) exist at any time. Waiting for a slot
/// counts against `timeout`.
pub fn scan_pages(path: &Path, timeout: Duration) -> PageScan {
    let deadline = Instant::now() + timeout;
    let Some(slot) = SCAN_SLOTS.acquire_within(timeout) else {
        warn!(
            "{} page scans still in flight; skipping {}",
            SCAN_SLOTS.capacity,
            path.display()
        );
        return PageScan::Busy;
    };

    let (tx, rx) = mpsc::channel();
    let owned: PathBuf = path.to_path_buf();
    std::thread::spawn(move || {
        let _slot = slot;
        let scan = match lopdf::Document::load(&owned) {
            Ok(doc) => PageScan::Pages(doc.get_pages().len() as u32),
            Err(err) => PageScan::Unreadable(err.to_string()),
        };
        let _ = tx.send(scan);
    });

    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(scan) => scan,
        Err(RecvTimeoutError::Disconnected) => PageScan::Unreadable("parser aborted".into()),
        Err(RecvTimeoutError::Timeout) => {
            warn!("page scan of {} exceeded {timeout:?}", path.display());
            PageScan::TimedOut
        }
    }
}

/// Counting semaphore for detached scans, with a bounded wait.
pub struct ScanSlots {
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

pub struct ScanSlot<'a> {
    pool: &'a ScanSlots,
}

impl ScanSlots {
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    pub fn acquire_within(&self, wait: Duration) -> Option<ScanSlot<'_>> {
        let deadline = Instant::now() + wait;
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        while *in_use >= self.capacity {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            in_use = self
                .freed
                .wait_timeout(in_use, left)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        *in_use += 1;
        Some(ScanSlot { pool: self })
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ScanSlot<'_> {
    fn drop(&mut self) {
        *self.pool.in_use.lock().unwrap_or_else(|e| e.into_inner()) -= 1;
        self.pool.freed.notify_one();
    }
}
