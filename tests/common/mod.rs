#![allow(dead_code)]

use docshrink::{
    availability::{EngineAvailability, ManualClock, ToolStatus},
    config::Config,
    engine::{CompressRequest, Engine},
    error::{SpawnError, TierFailure},
    pipeline::Pipeline,
    supervisor::{ProcessOutput, ProcessPermits, ProcessSupervisor},
    telemetry::MemorySink,
};
use lopdf::{Document, Object, Stream, dictionary};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A real, lopdf-readable PDF with `pages` pages and `padding` extra bytes.
pub fn make_pdf(pages: u32, padding: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::new();
    for i in 0..pages {
        let content = format!("BT /F1 12 Tf 72 720 Td (page {}) Tj ET", i + 1);
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    if padding > 0 {
        doc.add_object(Stream::new(dictionary! {}, vec![b'x'; padding]));
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).expect("serialize fixture pdf");
    out
}

/// `%PDF-` header followed by filler; passes the header check but not a parse.
pub fn write_blob_pdf(path: &Path, size: usize) {
    let mut bytes = b"%PDF-1.4\n".to_vec();
    bytes.resize(size.max(bytes.len()), b'0');
    std::fs::write(path, bytes).unwrap();
}

pub fn page_count(path: &Path) -> u32 {
    Document::load(path).unwrap().get_pages().len() as u32
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Write a header-valid blob of exactly this many bytes.
    ShrinkTo(u64),
    /// Write twice the input size.
    Inflate,
    /// Exit with this status and write nothing.
    Fail(i32),
    /// Exit 0 but write something that is not a PDF.
    Garbage,
    /// Write a real PDF with as many pages as were requested.
    Pages,
    /// Like `Pages` for whole files, but every page-range request fails.
    FailChunks,
    /// Like `Pages` for whole files, but every page-range request times out.
    TimeoutChunks,
    /// Like `Pages` for whole files; page ranges come back padded past the input size.
    InflateChunks,
    /// The binary cannot be launched.
    SpawnFails,
}

pub struct FakeEngine {
    name: String,
    tool: String,
    behavior: Behavior,
    delay: Duration,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    pub compress_calls: AtomicUsize,
    pub merged_parts: Mutex<Vec<PathBuf>>,
}

impl FakeEngine {
    pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Self::with_delay(name, behavior, Duration::ZERO)
    }

    pub fn with_delay(name: &str, behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tool: format!("{name}-bin"),
            behavior,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            compress_calls: AtomicUsize::new(0),
            merged_parts: Mutex::new(Vec::new()),
        })
    }

    pub fn tool_name(&self) -> String {
        self.tool.clone()
    }

    fn ok() -> ProcessOutput {
        ProcessOutput {
            exit_code: Some(0),
            ..Default::default()
        }
    }
}

impl Engine for FakeEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn tool(&self) -> &str {
        &self.tool
    }

    fn supports_page_range(&self) -> bool {
        true
    }

    fn supports_merge(&self) -> bool {
        true
    }

    fn compress(
        &self,
        req: &CompressRequest,
        _supervisor: &ProcessSupervisor,
        _timeout: Duration,
    ) -> Result<ProcessOutput, TierFailure> {
        self.compress_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);

        if let Behavior::SpawnFails = self.behavior {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(TierFailure::Spawn(SpawnError {
                program: self.tool.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            }));
        }

        let input_bytes = std::fs::metadata(&req.input)?.len();
        let result = match self.behavior {
            Behavior::ShrinkTo(n) => {
                write_blob_pdf(&req.output, n as usize);
                Self::ok()
            }
            Behavior::Inflate => {
                write_blob_pdf(&req.output, (input_bytes * 2) as usize);
                Self::ok()
            }
            Behavior::Fail(code) => ProcessOutput {
                exit_code: Some(code),
                stderr: b"simulated failure".to_vec(),
                ..Default::default()
            },
            Behavior::Garbage => {
                std::fs::write(&req.output, b"this is not a document")?;
                Self::ok()
            }
            Behavior::FailChunks if req.page_range.is_some() => ProcessOutput {
                exit_code: Some(1),
                ..Default::default()
            },
            Behavior::TimeoutChunks if req.page_range.is_some() => ProcessOutput {
                exit_code: None,
                timed_out: true,
                ..Default::default()
            },
            Behavior::Pages
            | Behavior::FailChunks
            | Behavior::TimeoutChunks
            | Behavior::InflateChunks
            | Behavior::SpawnFails => {
                let (pages, padding) = match (req.page_range, self.behavior) {
                    (Some((first, last)), Behavior::InflateChunks) => (last - first + 1, 100_000),
                    (Some((first, last)), _) => (last - first + 1, 0),
                    (None, _) => (page_count(&req.input), 0),
                };
                std::fs::write(&req.output, make_pdf(pages, padding))?;
                Self::ok()
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }

    fn merge(
        &self,
        parts: &[PathBuf],
        output: &Path,
        _supervisor: &ProcessSupervisor,
        _timeout: Duration,
    ) -> Result<ProcessOutput, TierFailure> {
        *self.merged_parts.lock().unwrap() = parts.to_vec();
        let total: u32 = parts.iter().map(|p| page_count(p)).sum();
        let padding = match self.behavior {
            Behavior::InflateChunks => parts
                .iter()
                .map(|p| std::fs::metadata(p).map(|m| m.len() as usize).unwrap_or(0))
                .sum(),
            _ => 0,
        };
        std::fs::write(output, make_pdf(total, padding))?;
        Ok(Self::ok())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub cfg: Config,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.work_dir = dir.path().join("work").display().to_string();
        cfg.paths.out_dir = dir.path().join("out").display().to_string();
        Self {
            dir,
            cfg,
            sink: Arc::new(MemorySink::new()),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn out_dir(&self) -> PathBuf {
        PathBuf::from(&self.cfg.paths.out_dir)
    }

    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.cfg.paths.work_dir)
    }

    /// Pipeline whose availability cache reports exactly `present` as installed.
    pub fn pipeline(
        &self,
        present: &[String],
        primary: Option<Arc<dyn Engine>>,
        secondary: Option<Arc<dyn Engine>>,
    ) -> Pipeline {
        let present: Vec<String> = present.to_vec();
        let availability = EngineAvailability::new(
            Duration::from_secs(30),
            Arc::new(ManualClock::new()),
            Arc::new(move |tool: &str| {
                if present.iter().any(|p| p == tool) {
                    ToolStatus::present("1.0")
                } else {
                    ToolStatus::absent()
                }
            }),
        );
        let supervisor = ProcessSupervisor::new(
            self.cfg.supervisor.output_cap_bytes,
            Arc::new(ProcessPermits::new(self.cfg.concurrency.max_engine_processes)),
        );
        let mut pipeline = Pipeline::new(&self.cfg, supervisor, Arc::new(availability), self.sink.clone());
        if let Some(engine) = primary {
            pipeline = pipeline.with_primary(engine);
        }
        if let Some(engine) = secondary {
            pipeline = pipeline.with_secondary(engine);
        }
        pipeline
    }
}
