use crate::{
    availability::EngineAvailability,
    chunk_plan::{ChunkPlan, ChunkTask, should_chunk},
    concurrency::map_with_concurrency,
    config::Config,
    engine::{CompressRequest, CompressionMode, Engine, EngineAttempt, GhostscriptEngine, QpdfEngine},
    error::{FatalJobError, TierFailure},
    policy::{QualitySettings, settings_for},
    probe,
    supervisor::{ProcessOutput, ProcessSupervisor},
    telemetry::{TelemetryEvent, TelemetryRecord, TelemetrySink},
    util::{file_size, move_file, now_rfc3339},
    validate::{DocumentKind, OutputValidator},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub const ORIGINAL_FALLBACK: &str = "original-fallback";
pub const FALLBACK_WARNING: &str = "optimized version was not smaller; original returned unchanged";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionJob {
    pub id: String,
    pub inputs: Vec<PathBuf>,
    /// 0..=100; higher keeps more fidelity.
    pub quality: u8,
    pub output_dir: PathBuf,
    /// Known page count of a single-input job, 0 if unknown.
    pub page_count: u32,
    pub mode: CompressionMode,
}

impl CompressionJob {
    pub fn new(id: &str, inputs: Vec<PathBuf>, quality: u8, output_dir: &Path) -> Self {
        Self {
            id: id.to_string(),
            inputs,
            quality,
            output_dir: output_dir.to_path_buf(),
            page_count: 0,
            mode: CompressionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: CompressionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_page_count(mut self, page_count: u32) -> Self {
        self.page_count = page_count;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionResult {
    pub engine_used: String,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub duration_ms: u64,
    pub output_path: PathBuf,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    /// One entry per input, in input order.
    pub results: Vec<CompressionResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    ParallelChunked,
    Primary,
    Secondary,
    OriginalFallback,
}

impl Tier {
    pub const ORDER: [Tier; 4] = [
        Tier::ParallelChunked,
        Tier::Primary,
        Tier::Secondary,
        Tier::OriginalFallback,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Tier::ParallelChunked => "parallel_chunked",
            Tier::Primary => "primary",
            Tier::Secondary => "secondary",
            Tier::OriginalFallback => "original_fallback",
        }
    }
}

/// An engine output that passed every acceptance check.
#[derive(Debug)]
struct Candidate {
    engine: String,
    path: PathBuf,
    bytes: u64,
}

/// Everything one input file needs while it walks the tiers.
struct FileUnit<'a> {
    job: &'a CompressionJob,
    input: &'a Path,
    output: PathBuf,
    input_bytes: u64,
    page_count: u32,
    settings: QualitySettings,
    work: Option<TempDir>,
}

impl FileUnit<'_> {
    fn work_dir(&self) -> Result<&Path, TierFailure> {
        self.work
            .as_ref()
            .map(|d| d.path())
            .ok_or_else(|| TierFailure::Skipped("no working directory".into()))
    }
}

pub struct Pipeline {
    cfg: Config,
    primary: Option<Arc<dyn Engine>>,
    secondary: Option<Arc<dyn Engine>>,
    supervisor: ProcessSupervisor,
    availability: Arc<EngineAvailability>,
    validator: OutputValidator,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Pipeline {
    pub fn new(
        cfg: &Config,
        supervisor: ProcessSupervisor,
        availability: Arc<EngineAvailability>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            primary: None,
            secondary: None,
            supervisor,
            availability,
            validator: OutputValidator::new(cfg.timeouts.validate()),
            telemetry,
        }
    }

    /// Ghostscript as primary, qpdf as secondary, availability probed via `--version`.
    pub fn from_config(cfg: &Config, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let supervisor = ProcessSupervisor::from_config(cfg);
        let availability = Arc::new(EngineAvailability::from_config(cfg, supervisor.clone()));
        Self::new(cfg, supervisor, availability, telemetry)
            .with_primary(Arc::new(GhostscriptEngine::new(&cfg.engines.ghostscript_exe)))
            .with_secondary(Arc::new(QpdfEngine::new(&cfg.engines.qpdf_exe)))
    }

    pub fn with_primary(mut self, engine: Arc<dyn Engine>) -> Self {
        self.primary = Some(engine);
        self
    }

    pub fn with_secondary(mut self, engine: Arc<dyn Engine>) -> Self {
        self.secondary = Some(engine);
        self
    }

    pub fn with_validator(mut self, validator: OutputValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn availability(&self) -> &EngineAvailability {
        &self.availability
    }

    pub fn engines(&self) -> Vec<Arc<dyn Engine>> {
        self.primary.iter().chain(self.secondary.iter()).cloned().collect()
    }

    /// Compresses every input of `job`. Engine-level trouble never surfaces
    /// here; only contract violations do.
    pub fn compress(&self, job: &CompressionJob) -> Result<JobOutcome, FatalJobError> {
        self.check_contract(job)?;
        std::fs::create_dir_all(&job.output_dir).map_err(|source| FatalJobError::OutputDir {
            path: job.output_dir.clone(),
            source,
        })?;

        info!(
            "job={} inputs={} quality={} mode={:?}",
            job.id,
            job.inputs.len(),
            job.quality,
            job.mode
        );

        let items: Vec<(usize, PathBuf)> = job.inputs.iter().cloned().enumerate().collect();
        let outcomes = map_with_concurrency(items, self.cfg.concurrency.outer, |(index, input), _| {
            self.compress_file(job, index, &input)
        });

        let mut results = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let result = match outcome {
                Ok(r) => r?,
                Err(panicked) => {
                    warn!("job={} input {index} aborted: {panicked}", job.id);
                    let input = &job.inputs[index];
                    let output = output_path_for(job, index, input);
                    self.original_fallback(job, input, &output, file_size(input), Instant::now())?
                }
            };
            results.push(result);
        }

        Ok(JobOutcome {
            job_id: job.id.clone(),
            results,
        })
    }

    fn check_contract(&self, job: &CompressionJob) -> Result<(), FatalJobError> {
        if job.inputs.is_empty() {
            return Err(FatalJobError::NoInputs(job.id.clone()));
        }
        if job.quality > 100 {
            return Err(FatalJobError::QualityOutOfRange(job.quality));
        }
        for input in &job.inputs {
            let meta = std::fs::metadata(input)
                .map_err(|_| FatalJobError::MissingInput(input.clone()))?;
            if !meta.is_file() {
                return Err(FatalJobError::MissingInput(input.clone()));
            }
            let limit = self.cfg.limits.max_input_file_bytes;
            if meta.len() > limit {
                return Err(FatalJobError::InputTooLarge {
                    path: input.clone(),
                    bytes: meta.len(),
                    limit,
                });
            }
        }
        Ok(())
    }

    fn compress_file(
        &self,
        job: &CompressionJob,
        index: usize,
        input: &Path,
    ) -> Result<CompressionResult, FatalJobError> {
        let started = Instant::now();
        let output = output_path_for(job, index, input);
        let input_bytes = file_size(input);

        let page_count = if job.page_count > 0 && job.inputs.len() == 1 {
            job.page_count
        } else {
            probe::count_pages(input, self.cfg.timeouts.probe()).unwrap_or(0)
        };

        let work = match self.make_work_dir(job) {
            Ok(dir) => Some(dir),
            Err(err) => {
                warn!("job={} no working directory, engine tiers skipped: {err}", job.id);
                None
            }
        };

        let unit = FileUnit {
            job,
            input,
            output,
            input_bytes,
            page_count,
            settings: settings_for(job.quality),
            work,
        };
        debug!(
            "job={} input={} bytes={} pages={} settings={:?}",
            job.id,
            input.display(),
            input_bytes,
            page_count,
            unit.settings
        );

        // Set when the chunked primary output was valid but not smaller.
        let mut primary_regressed = false;
        for tier in Tier::ORDER {
            let attempt = match tier {
                Tier::ParallelChunked => self.attempt_parallel(&unit),
                Tier::Primary if primary_regressed => Err(TierFailure::Skipped(
                    "chunked output of the same engine did not shrink the file".into(),
                )),
                Tier::Primary => self.attempt_whole_file(tier, self.primary.as_deref(), &unit),
                Tier::Secondary => self.attempt_whole_file(tier, self.secondary.as_deref(), &unit),
                Tier::OriginalFallback => break,
            };
            match attempt.and_then(|c| self.promote(c, &unit)) {
                Ok(result) => {
                    let result = CompressionResult {
                        duration_ms: started.elapsed().as_millis() as u64,
                        ..result
                    };
                    info!(
                        "job={} input={} tier={} engine={} {} -> {} bytes",
                        job.id,
                        input.display(),
                        tier.label(),
                        result.engine_used,
                        result.input_bytes,
                        result.output_bytes
                    );
                    self.record_result(job, input, &result);
                    return Ok(result);
                }
                Err(TierFailure::Skipped(reason)) => {
                    debug!("job={} tier={} skipped: {reason}", job.id, tier.label());
                }
                Err(failure) => {
                    if tier == Tier::ParallelChunked
                        && matches!(failure, TierFailure::RegressionRejected { .. })
                    {
                        primary_regressed = true;
                    }
                    warn!("job={} tier={} failed: {failure}", job.id, tier.label());
                }
            }
        }

        self.original_fallback(job, input, &unit.output, input_bytes, started)
    }

    fn make_work_dir(&self, job: &CompressionJob) -> std::io::Result<TempDir> {
        let root = PathBuf::from(&self.cfg.paths.work_dir);
        std::fs::create_dir_all(&root)?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", job.id))
            .tempdir_in(root)
    }

    fn attempt_whole_file(
        &self,
        tier: Tier,
        engine: Option<&dyn Engine>,
        unit: &FileUnit<'_>,
    ) -> Result<Candidate, TierFailure> {
        let engine = engine.ok_or_else(|| TierFailure::Skipped("no engine configured".into()))?;
        let timeout = match (tier, unit.job.mode) {
            (Tier::Primary, CompressionMode::Resize) => {
                Duration::from_secs(self.cfg.timeouts.primary_resize_secs)
            }
            (Tier::Primary, CompressionMode::Simple) => {
                Duration::from_secs(self.cfg.timeouts.primary_simple_secs)
            }
            _ => self.cfg.timeouts.secondary(),
        };

        let mut attempt = new_attempt(engine.name(), tier, PathBuf::new());
        let verdict = (|| -> Result<u64, TierFailure> {
            if !self.availability.is_available(engine.tool()) {
                return Err(TierFailure::Unavailable {
                    tool: engine.tool().to_string(),
                });
            }
            let out = unit.work_dir()?.join(format!("{}.pdf", tier.label()));
            attempt.output_path = out.clone();
            let req = CompressRequest {
                input: unit.input.to_path_buf(),
                output: out.clone(),
                settings: unit.settings,
                mode: unit.job.mode,
                page_range: None,
            };
            let t0 = Instant::now();
            let ran = engine.compress(&req, &self.supervisor, timeout);
            attempt.duration_ms = t0.elapsed().as_millis() as u64;
            let po = ran?;
            self.judge(engine, engine.name(), &po, &out, timeout, unit, &mut attempt)
        })();

        self.record_attempt(unit, &attempt, &verdict);
        verdict.map(|bytes| Candidate {
            engine: engine.name().to_string(),
            path: attempt.output_path.clone(),
            bytes,
        })
    }

    fn attempt_parallel(&self, unit: &FileUnit<'_>) -> Result<Candidate, TierFailure> {
        let engine = self
            .primary
            .as_deref()
            .ok_or_else(|| TierFailure::Skipped("no primary engine".into()))?;
        if !should_chunk(&self.cfg, unit.page_count) {
            return Err(TierFailure::Skipped(format!(
                "{} pages does not exceed the chunking threshold of {}",
                unit.page_count, self.cfg.chunking.threshold_pages
            )));
        }
        if !engine.supports_page_range() || !engine.supports_merge() {
            return Err(TierFailure::Skipped(format!(
                "{} cannot compress page ranges and merge them",
                engine.name()
            )));
        }
        if !self.availability.is_available(engine.tool()) {
            return Err(TierFailure::Skipped(format!(
                "{} is not available",
                engine.tool()
            )));
        }

        let label = format!("{}-parallel", engine.name());
        let mut attempt = new_attempt(&label, Tier::ParallelChunked, PathBuf::new());
        let verdict = (|| -> Result<u64, TierFailure> {
            let work = unit.work_dir()?;
            // Removed on every exit path when `chunk_dir` drops.
            let chunk_dir = tempfile::Builder::new().prefix("chunks-").tempdir_in(work)?;
            let plan = ChunkPlan::from_config(&self.cfg, unit.page_count, chunk_dir.path());
            info!(
                "job={} input={} splitting {} pages into {} chunks",
                unit.job.id,
                unit.input.display(),
                plan.page_count,
                plan.chunks.len()
            );

            let t0 = Instant::now();
            self.run_chunks(engine, unit, &plan)?;

            let merged = work.join("parallel.pdf");
            attempt.output_path = merged.clone();
            let merge_timeout = self.cfg.timeouts.merge();
            let ran = engine.merge(&plan.output_paths(), &merged, &self.supervisor, merge_timeout);
            attempt.duration_ms = t0.elapsed().as_millis() as u64;
            let po = ran?;
            self.judge(engine, &label, &po, &merged, merge_timeout, unit, &mut attempt)
        })();

        self.record_attempt(unit, &attempt, &verdict);
        verdict.map(|bytes| Candidate {
            engine: label.clone(),
            path: attempt.output_path.clone(),
            bytes,
        })
    }

    /// Runs every chunk under the inner limit. The first failure aborts the
    /// chunks that have not started yet; no partial result is kept.
    fn run_chunks(
        &self,
        engine: &dyn Engine,
        unit: &FileUnit<'_>,
        plan: &ChunkPlan,
    ) -> Result<(), TierFailure> {
        let aborted = AtomicBool::new(false);
        let timeout = self.cfg.timeouts.chunk();

        let outcomes = map_with_concurrency(
            plan.chunks.clone(),
            self.cfg.concurrency.inner,
            |task: ChunkTask, _| {
                if aborted.load(Ordering::SeqCst) {
                    return Err("aborted after an earlier chunk failed".to_string());
                }
                let outcome = self.run_chunk(engine, unit, &task, timeout);
                if outcome.is_err() {
                    aborted.store(true, Ordering::SeqCst);
                }
                outcome
            },
        );

        for (task, outcome) in plan.chunks.iter().zip(outcomes) {
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(reason)) => reason,
                Err(panicked) => panicked.to_string(),
            };
            return Err(TierFailure::ChunkFailed {
                chunk_index: task.chunk_index,
                start_page: task.start_page,
                end_page: task.end_page,
                reason,
            });
        }
        Ok(())
    }

    fn run_chunk(
        &self,
        engine: &dyn Engine,
        unit: &FileUnit<'_>,
        task: &ChunkTask,
        timeout: Duration,
    ) -> Result<(), String> {
        let req = CompressRequest {
            input: unit.input.to_path_buf(),
            output: task.output_path.clone(),
            settings: unit.settings,
            mode: unit.job.mode,
            page_range: Some((task.start_page, task.end_page)),
        };
        let po = engine
            .compress(&req, &self.supervisor, timeout)
            .map_err(|e| e.to_string())?;
        if po.timed_out {
            return Err(format!("timed out after {timeout:?}"));
        }
        match po.exit_code {
            Some(code) if engine.is_success(code) => {}
            code => return Err(format!("exit status {code:?}: {}", po.stderr_lossy())),
        }
        if file_size(&task.output_path) == 0 {
            return Err("empty output".into());
        }
        debug!(
            "job={} chunk {} pages {}-{} ok in {:?}",
            unit.job.id, task.chunk_index, task.start_page, task.end_page, po.duration
        );
        Ok(())
    }

    /// Acceptance checks shared by every engine tier.
    #[allow(clippy::too_many_arguments)]
    fn judge(
        &self,
        engine: &dyn Engine,
        label: &str,
        po: &ProcessOutput,
        out: &Path,
        timeout: Duration,
        unit: &FileUnit<'_>,
        attempt: &mut EngineAttempt,
    ) -> Result<u64, TierFailure> {
        attempt.exit_code = po.exit_code;
        attempt.timed_out = po.timed_out;
        if po.timed_out {
            return Err(TierFailure::Timeout {
                engine: label.to_string(),
                timeout,
            });
        }
        match po.exit_code {
            Some(code) if engine.is_success(code) => {}
            code => {
                return Err(TierFailure::NonZeroExit {
                    engine: label.to_string(),
                    code,
                    stderr: po.stderr_lossy(),
                });
            }
        }

        let bytes = file_size(out);
        attempt.output_bytes = bytes;
        if bytes == 0 || !self.validator.is_valid(out, DocumentKind::Pdf) {
            return Err(TierFailure::InvalidOutput {
                engine: label.to_string(),
                path: out.to_path_buf(),
            });
        }
        attempt.valid = true;

        self.regression_guard(label, bytes, unit.input_bytes)?;
        Ok(bytes)
    }

    fn regression_guard(
        &self,
        engine: &str,
        output_bytes: u64,
        input_bytes: u64,
    ) -> Result<(), TierFailure> {
        let limit = input_bytes as f64 * self.cfg.limits.regression_ratio;
        if output_bytes as f64 >= limit {
            return Err(TierFailure::RegressionRejected {
                engine: engine.to_string(),
                output_bytes,
                limit_bytes: limit.ceil() as u64,
            });
        }
        Ok(())
    }

    /// Moves an accepted candidate to its final location.
    fn promote(
        &self,
        candidate: Candidate,
        unit: &FileUnit<'_>,
    ) -> Result<CompressionResult, TierFailure> {
        move_file(&candidate.path, &unit.output)?;
        Ok(CompressionResult {
            engine_used: candidate.engine,
            input_bytes: unit.input_bytes,
            output_bytes: candidate.bytes,
            duration_ms: 0,
            output_path: unit.output.clone(),
            warning: None,
        })
    }

    fn original_fallback(
        &self,
        job: &CompressionJob,
        input: &Path,
        output: &Path,
        input_bytes: u64,
        started: Instant,
    ) -> Result<CompressionResult, FatalJobError> {
        std::fs::copy(input, output).map_err(|source| FatalJobError::FallbackFailed {
            path: input.to_path_buf(),
            source,
        })?;
        warn!(
            "job={} input={} no tier reduced the file; returning the original",
            job.id,
            input.display()
        );
        let result = CompressionResult {
            engine_used: ORIGINAL_FALLBACK.to_string(),
            input_bytes,
            output_bytes: input_bytes,
            duration_ms: started.elapsed().as_millis() as u64,
            output_path: output.to_path_buf(),
            warning: Some(FALLBACK_WARNING.to_string()),
        };
        self.record_result(job, input, &result);
        Ok(result)
    }

    fn record_attempt(
        &self,
        unit: &FileUnit<'_>,
        attempt: &EngineAttempt,
        verdict: &Result<u64, TierFailure>,
    ) {
        let outcome = match verdict {
            Ok(_) => "accepted",
            Err(failure) => failure.kind(),
        };
        self.telemetry.record(TelemetryRecord::now(
            &unit.job.id,
            unit.input,
            TelemetryEvent::Attempt {
                engine: attempt.engine.clone(),
                tier: attempt.tier.clone(),
                outcome: outcome.to_string(),
                duration_ms: attempt.duration_ms,
                exit_code: attempt.exit_code,
                timed_out: attempt.timed_out,
                output_bytes: attempt.output_bytes,
                valid: attempt.valid,
            },
        ));
    }

    fn record_result(&self, job: &CompressionJob, input: &Path, result: &CompressionResult) {
        self.telemetry.record(TelemetryRecord::now(
            &job.id,
            input,
            TelemetryEvent::Result {
                engine_used: result.engine_used.clone(),
                input_bytes: result.input_bytes,
                output_bytes: result.output_bytes,
                duration_ms: result.duration_ms,
                output_path: result.output_path.display().to_string(),
                warning: result.warning.clone(),
            },
        ));
    }
}

fn new_attempt(engine: &str, tier: Tier, output_path: PathBuf) -> EngineAttempt {
    EngineAttempt {
        engine: engine.to_string(),
        tier: tier.label().to_string(),
        started_at: now_rfc3339(),
        duration_ms: 0,
        exit_code: None,
        timed_out: false,
        output_path,
        output_bytes: 0,
        valid: false,
    }
}

/// `<stem>.compressed.pdf`, prefixed with the input index for multi-file jobs.
pub fn output_path_for(job: &CompressionJob, index: usize, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let name = if job.inputs.len() > 1 {
        format!("{index:02}-{stem}.compressed.pdf")
    } else {
        format!("{stem}.compressed.pdf")
    };
    job.output_dir.join(name)
}
